use flint_core::error::{CoreError, ErrorCategory};
use std::borrow::Cow;
use thiserror::Error;

/// WebSocket 帧引擎的故障枚举。
///
/// 文案即对外承诺的错误消息；协议违规会污染通道并导致无宽限关闭。
#[derive(Debug, Error)]
pub enum WsFault {
    #[error("non-zero RSV bit")]
    NonZeroRsv,
    #[error("unknown op code")]
    UnknownOpCode,
    #[error("client frame MASK=0")]
    UnmaskedClientFrame,
    #[error("control frame payload length > 125")]
    OversizedControlFrame,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("payload length not encoded minimally")]
    NonMinimalLength,
    #[error("close frame reason is not valid utf-8")]
    InvalidCloseReason,
    #[error("negative 64-bit payload length")]
    NegativeLength,
    #[error("continuation frame without an open message")]
    StrayContinuation,
    #[error("previous message not finished")]
    MessageNotFinished,
    #[error("close frame was queued")]
    CloseFrameQueued,
    #[error("timeout while awaiting Pong from client")]
    PongTimeout,
    #[error("inbound throughput too low")]
    InboundThroughputTooLow,
    #[error("outbound throughput too low")]
    OutboundThroughputTooLow,
    #[error("inbound EOF")]
    InboundEof,
}

pub(crate) const PROTOCOL_CODE: &str = "flint.ws.protocol_violation";
pub(crate) const THROUGHPUT_CODE: &str = "flint.ws.throughput_too_low";
pub(crate) const LIVENESS_CODE: &str = "flint.ws.liveness_timeout";
pub(crate) const EOF_CODE: &str = "flint.ws.inbound_eof";
pub(crate) const CLOSE_QUEUED_CODE: &str = "flint.ws.close_frame_queued";

impl From<WsFault> for CoreError {
    fn from(fault: WsFault) -> Self {
        let (code, category) = match &fault {
            WsFault::PongTimeout => (LIVENESS_CODE, ErrorCategory::Timeout),
            WsFault::InboundThroughputTooLow | WsFault::OutboundThroughputTooLow => {
                (THROUGHPUT_CODE, ErrorCategory::NonRetryable)
            }
            WsFault::InboundEof => (EOF_CODE, ErrorCategory::Io),
            WsFault::CloseFrameQueued => (CLOSE_QUEUED_CODE, ErrorCategory::NonRetryable),
            _ => (PROTOCOL_CODE, ErrorCategory::ProtocolViolation),
        };
        CoreError::new(code, Cow::Owned(fault.to_string()))
            .with_cause(fault)
            .with_category(category)
    }
}
