//! flint-core：非阻塞网络工具箱的运行时底座。
//!
//! # 模块架构（Why）
//! - [`error`] 定义跨层共享的稳定错误域（错误码 + 分类 + 根因链路）；
//! - [`promise`] 提供一次性延续对象，承载所有可等待操作与取消传播；
//! - [`timer`] 是进程共享的单线程定时器，覆盖握手/心跳/排水等超时；
//! - [`buffer`] 按容量分桶复用 `BytesMut`；
//! - [`runtime`] 把以上能力聚合为显式传递的运行时上下文。
//!
//! 反应器与各传输 crate 在此之上构建，自身不落地任何全局可变状态。

pub mod buffer;
pub mod error;
pub mod promise;
pub mod runtime;
pub mod timer;

pub use buffer::BufferPool;
pub use error::{CoreError, ErrorCategory, Result};
pub use promise::Promise;
pub use runtime::CoreServices;
pub use timer::{Timer, TimerKey};

/// 常用导出的汇总入口。
pub mod prelude {
    pub use crate::buffer::BufferPool;
    pub use crate::error::{CoreError, ErrorCategory, Result};
    pub use crate::promise::Promise;
    pub use crate::runtime::CoreServices;
    pub use crate::timer::{Timer, TimerKey};
}
