use flint_core::error::{CoreError, ErrorCategory};
use std::borrow::Cow;
use std::io;

/// 描述一次反应器底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const POLL_CREATE: OperationKind = OperationKind {
    code: "flint.reactor.poll_create_failed",
    message: "selector poll create",
};
pub(crate) const WAKE: OperationKind = OperationKind {
    code: "flint.reactor.wake_failed",
    message: "selector wake",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "flint.reactor.read_failed",
    message: "channel read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "flint.reactor.write_failed",
    message: "channel write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "flint.reactor.shutdown_failed",
    message: "channel shutdown_output",
};

pub(crate) const CHANNEL_CLOSED_CODE: &str = "flint.reactor.channel_closed";
pub(crate) const WAITER_CONFLICT_CODE: &str = "flint.reactor.waiter_conflict";
pub(crate) const ACCEPTING_STOPPED_CODE: &str = "flint.reactor.accepting_stopped";

/// 将 IO 错误映射为核心错误并标记 IO 分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    CoreError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_cause(error)
    .with_category(ErrorCategory::Io)
}

/// 在已关闭通道上继续操作的错误。
pub(crate) fn channel_closed() -> CoreError {
    CoreError::new(CHANNEL_CLOSED_CODE, "closed").with_category(ErrorCategory::Closed)
}

/// 同方向已存在未决等待者。
pub(crate) fn waiter_conflict(direction: &'static str) -> CoreError {
    CoreError::new(
        WAITER_CONFLICT_CODE,
        Cow::Owned(format!("pending {direction} waiter already exists")),
    )
}

/// 服务器离开 accepting 状态时，拒绝/失败对应的读等待。
pub(crate) fn accepting_stopped() -> CoreError {
    CoreError::new(ACCEPTING_STOPPED_CODE, "accepting stopped")
        .with_category(ErrorCategory::Closed)
}
