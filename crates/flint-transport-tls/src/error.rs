use flint_core::error::{CoreError, ErrorCategory};
use std::borrow::Cow;
use thiserror::Error;

/// TLS 层的协议故障枚举；统一转换为 [`CoreError`] 后向上传播。
///
/// # 设计要求（What）
/// - 文案沿用对外承诺的错误消息，运维告警按消息与错误码双路匹配；
/// - 协议违规一律标记 [`ErrorCategory::ProtocolViolation`]，通道应被污染
///   并尽快关闭。
#[derive(Debug, Error)]
pub enum TlsFault {
    /// 单条 TLS 记录超出协议上限。
    #[error("client ssl record too large")]
    RecordTooLarge,
    /// 数据阶段出现再协商尝试。
    #[error("client SSL renegotiation; not supported")]
    Renegotiation,
    /// 握手期限到期。
    #[error("tls handshake timed out")]
    HandshakeTimeout,
    /// 握手完成前对端发送 FIN。
    #[error("inbound EOF")]
    InboundEof,
    /// 其余引擎错误。
    #[error("tls protocol error: {0}")]
    Engine(rustls::Error),
}

pub(crate) const HANDSHAKE_CODE: &str = "flint.transport.tls.handshake_failed";
pub(crate) const PROTOCOL_CODE: &str = "flint.transport.tls.protocol_violation";

impl From<TlsFault> for CoreError {
    fn from(fault: TlsFault) -> Self {
        let (code, category) = match &fault {
            TlsFault::HandshakeTimeout => (HANDSHAKE_CODE, ErrorCategory::Timeout),
            TlsFault::InboundEof => (HANDSHAKE_CODE, ErrorCategory::Io),
            _ => (PROTOCOL_CODE, ErrorCategory::ProtocolViolation),
        };
        CoreError::new(code, Cow::Owned(fault.to_string()))
            .with_cause(fault)
            .with_category(category)
    }
}

/// 把引擎错误映射为面向用户的协议故障。
///
/// `established` 标记会话是否已建立：只有数据阶段收到不合时宜的握手
/// 消息才判为再协商尝试，握手阶段不存在再协商。其余引擎故障保留
/// rustls 的原始描述，避免告警误聚类。
pub(crate) fn map_engine_error(error: rustls::Error, established: bool) -> TlsFault {
    match &error {
        rustls::Error::InvalidMessage(rustls::InvalidMessage::MessageTooLarge) => {
            TlsFault::RecordTooLarge
        }
        rustls::Error::InappropriateHandshakeMessage { .. } if established => {
            TlsFault::Renegotiation
        }
        _ => TlsFault::Engine(error),
    }
}
