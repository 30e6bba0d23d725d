//! flint-transport-tls：rustls 引擎驱动的 TLS 传输。
//!
//! # 模块架构（Why）
//! - [`conn`]：建立会话后的 TLS 连接，与明文连接实现同一
//!   `Connection` 契约；记录级泵动、close-notify/FIN 排序、写侧故障
//!   污染；
//! - [`handshake`]：半双工握手状态机，受共享定时器的握手超时约束；
//! - [`detector`]：明文/TLS 同端口的首字节嗅探（`0x16` 即 TLS
//!   `handshake` 记录型），已读字节无损交接。
//!
//! 引擎选择 rustls：sans-IO 的 `ServerConnection` 只做记录编解码，
//! 不持有套接字，且内部回调全部非阻塞，可以直接运行在选择器线程上。

pub mod conn;
pub mod detector;
pub(crate) mod error;
pub(crate) mod handshake;

pub use conn::TlsConn;
pub use detector::{ConnHandler, TlsAcceptorConf, accept_handler};
pub use error::TlsFault;
