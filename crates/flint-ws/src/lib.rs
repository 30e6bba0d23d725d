//! flint-ws：RFC 6455 帧引擎。
//!
//! # 模块架构（Why）
//! - [`frame`] / [`mask`]：帧头编码、操作码与掩码原语；
//! - [`inbound`]：HEAD0/HEAD1/HEADX/BODY 解析状态机、控制帧聚合与
//!   有界暂存区；
//! - [`outbound`]：按优先级取帧的出站泵状态（ping/pong 单槽、消息
//!   分片、关闭帧排空）；
//! - [`meter`]：双槽吞吐率计量器；
//! - [`source`]：出站消息的字节来源抽象；
//! - [`channel`]：两个泵的黏合层——活性心跳、暂存回压、两方关闭裁决
//!   与可选的流量转储（`flint::ws::dump`）。
//!
//! 引擎假定 HTTP 升级已由外部完成，接收一个 [`flint_transport_tcp`]
//! 的连接对象（明文或 TLS）。

pub mod channel;
pub(crate) mod error;
pub mod frame;
pub mod inbound;
pub mod mask;
pub mod meter;
pub(crate) mod outbound;
pub mod source;

pub use channel::{WsChannel, WsConf};
pub use error::WsFault;
pub use frame::OpCode;
pub use inbound::InboundEvent;
pub use source::{ByteSource, BytesSource, SourcePull};
