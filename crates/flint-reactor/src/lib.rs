//! flint-reactor：选择器驱动的多线程反应器。
//!
//! # 模块架构（Why）
//! - [`selector`]：按 id 惰性创建的选择器集合。每个选择器独占一个 OS
//!   `Poll` 与一条线程，带本地任务队列、远程并发队列 + 唤醒标志以及
//!   before-select 钩子；线程死亡后外部提交降级到孤儿执行器；
//! - [`channel`]：套接字级非阻塞通道。读/写/半关闭 + 就绪等待原语，
//!   兴趣位变更推迟到 pre-select 批处理统一应用。
//!
//! # 并发模型（How）
//! - 一条线程服务一个选择器，协作复用其上全部连接；线程间不窃取工作；
//! - 除线程安全的 `close` 与跨线程 `submit` 外，通道的所有操作都发生在
//!   所属选择器线程；
//! - 就绪等待以 [`flint_core::Promise`] 交付，完成回调在选择器线程执行。

pub mod channel;
pub(crate) mod error;
pub mod selector;

pub use channel::{AcceptingScope, Channel, SocketRead};
pub use selector::{EventSink, Readiness, Reactor, SelectorHandle};
