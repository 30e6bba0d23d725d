use flint_core::error::{CoreError, ErrorCategory};
use std::borrow::Cow;
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "flint.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "flint.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "flint.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "flint.transport.tcp.configure_failed",
    message: "tcp configure",
};

const ILLEGAL_STATE_CODE: &str = "flint.transport.tcp.illegal_state";
const UNREAD_CODE: &str = "flint.transport.tcp.unread_conflict";
const FIN_QUEUED_CODE: &str = "flint.transport.tcp.fin_queued";
const CLOSE_NOTIFY_QUEUED_CODE: &str = "flint.transport.tcp.close_notify_queued";
pub(crate) const CONN_CLOSED_CODE: &str = "flint.transport.tcp.conn_closed";

/// 将 IO 错误映射为核心错误并标记 IO 分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    CoreError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_cause(error)
    .with_category(ErrorCategory::Io)
}

/// 生命周期状态机的非法迁移。
pub(crate) fn illegal_state(current: &'static str, event: &'static str) -> CoreError {
    CoreError::new(
        ILLEGAL_STATE_CODE,
        Cow::Owned(format!("illegal state: {event} while {current}")),
    )
}

/// 连续两次 `unread` 之间缺少 `read`。
pub(crate) fn unread_conflict() -> CoreError {
    CoreError::new(UNREAD_CODE, "consecutive unread not supported")
}

/// FIN 之后继续排队写。
pub(crate) fn fin_queued() -> CoreError {
    CoreError::new(FIN_QUEUED_CODE, "TCP_FIN was queued before")
}

/// close-notify 之后继续排队数据或重复排队 close-notify。
pub(crate) fn close_notify_queued() -> CoreError {
    CoreError::new(CLOSE_NOTIFY_QUEUED_CODE, "SSL_CLOSE_NOTIFY was queued before")
}

/// 在已关闭连接上继续操作。
pub(crate) fn conn_closed() -> CoreError {
    CoreError::new(CONN_CLOSED_CODE, "closed").with_category(ErrorCategory::Closed)
}
