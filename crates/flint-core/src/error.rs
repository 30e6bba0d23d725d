use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// 跨层共享的稳定错误载体，是 flint 各传输层可观察错误的最终形态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 反应器、TCP/TLS 传输与 WebSocket 帧引擎在不同层次产生的故障需要合流为
///   统一的错误码，便于日志与告警系统执行精确分类；
/// - 错误码 `code` 始终为 `'static` 字符串并遵循 `<域>.<语义>` 约定，`message`
///   面向排障人员，`cause` 保留底层根因链路。
///
/// ## 契约（What）
/// - **前置条件**：调用方使用 [`codes`] 模块或各 crate `error.rs` 中备案的码值；
/// - **后置条件**：返回的 `CoreError` 拥有独立所有权（`Send + Sync + 'static`），
///   除非显式调用 `with_*`，不携带额外上下文。
///
/// ## 取舍（Trade-offs）
/// - 消息使用 `Cow` 存储：静态文案零分配，动态拼装仅一次堆分配。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: ErrorCategory,
}

/// 底层根因的统一封装。
pub type ErrorCause = Box<dyn StdError + Send + Sync + 'static>;

/// flint 统一的结果别名，默认错误为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

impl CoreError {
    /// 构造核心错误，分类默认为 [`ErrorCategory::NonRetryable`]。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: ErrorCategory::NonRetryable,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 标记结构化分类信息，驱动上层的容错策略。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 面向排障人员的描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层根因（若有）。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 判断错误是否由取消触发。
    pub fn is_cancelled(&self) -> bool {
        matches!(self.category, ErrorCategory::Cancelled)
    }

    /// 判断错误是否由超时触发。
    pub fn is_timeout(&self) -> bool {
        matches!(self.category, ErrorCategory::Timeout)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// 错误的主要处置策略，对齐故障分层共识。
///
/// # 契约说明
/// - `ProtocolViolation`：对端违反协议，通道应被污染并尽快关闭；
/// - `ResourceLimit`：准入阶段的资源限制（连接上限、缓冲上限），既有连接不受影响；
/// - `Io`：底层读写故障，污染对应方向；
/// - `Timeout`：握手、心跳、关闭排水等期限到期，按协议层故障处理；
/// - `Cancelled`：调用方协作式取消；
/// - `Closed`：在已关闭对象上继续操作；
/// - `NonRetryable`：其余不可自动恢复的故障。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    ProtocolViolation,
    ResourceLimit,
    Io,
    Timeout,
    Cancelled,
    Closed,
    NonRetryable,
}

/// 跨 crate 复用的稳定错误码。
///
/// 各传输 crate 在自身 `error.rs` 中备案更细粒度的操作码；此处只保留
/// 会在核心原语上直接出现的码值。
pub mod codes {
    /// 承诺被取消。
    pub const PROMISE_CANCELLED: &str = "flint.core.promise_cancelled";
    /// 阻塞等待承诺超时。
    pub const PROMISE_WAIT_TIMEOUT: &str = "flint.core.promise_wait_timeout";
    /// 在已关闭的对象上继续操作。
    pub const CLOSED: &str = "flint.core.closed";
}

/// 构造标准的取消错误。
pub fn cancelled(what: &'static str) -> CoreError {
    CoreError::new(codes::PROMISE_CANCELLED, Cow::Owned(format!("{what} cancelled")))
        .with_category(ErrorCategory::Cancelled)
}

/// 构造标准的 "closed" 错误。
pub fn closed(what: &'static str) -> CoreError {
    CoreError::new(codes::CLOSED, Cow::Owned(format!("{what} closed")))
        .with_category(ErrorCategory::Closed)
}
