//! flint-transport-tcp：多地址 TCP 服务器、非阻塞客户端与明文连接。
//!
//! # 模块架构（Why）
//! - [`server`]：生命周期状态机（init → accepting → paused → stopped →
//!   init）、每地址接受代理与最小连接数优先的接受席位交接、单 IP 与全局
//!   连接数上限；
//! - [`client`]：非阻塞连接发起与取消；
//! - [`conn`]：明文连接。通道之上叠加出站写队列（小段合并入有界拷贝环）、
//!   单槽 unread 与净化式关闭；
//! - [`ring`]：拷贝环实现。
//!
//! 读结果与写条目使用带标签的枚举（[`conn::ReadOutcome`] /
//! [`conn::WriteItem`]）表达 FIN 与 close-notify 哨兵。

pub mod client;
pub mod conn;
pub(crate) mod error;
pub(crate) mod ring;
pub mod server;

pub use client::TcpClient;
pub use conn::{ConnConf, ConnGuard, Connection, PlainConn, ReadOutcome, WriteItem};
pub use server::{AcceptHandler, ChannelHandoff, TcpServer, TcpServerConf, default_socket_conf};
