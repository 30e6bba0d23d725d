use crate::buffer::BufferPool;
use crate::timer::Timer;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use tracing::error;

/// 聚合进程级运行时能力：共享定时器、缓冲池与孤儿执行器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 定时器、缓冲池这类进程级能力容易演化成全局可变单例；此处坚持
///   “显式运行时上下文”，把它们聚合为一个按引用传递的对象，随启动
///   创建、随停止释放；
/// - 反应器 crate 在其上再组合选择器注册表，形成完整的运行时。
///
/// ## 契约（What）
/// - `CoreServices` 创建即持有活动的定时器线程与孤儿执行器线程；
/// - `shutdown` 幂等，停止两个后台线程；其后提交的任务被静默丢弃。
pub struct CoreServices {
    timer: Timer,
    buffers: BufferPool,
    orphan: OrphanExecutor,
}

impl CoreServices {
    /// 启动后台线程并聚合运行时能力。
    pub fn start() -> Arc<Self> {
        Arc::new(Self {
            timer: Timer::start(),
            buffers: BufferPool::new(),
            orphan: OrphanExecutor::start(),
        })
    }

    /// 共享定时器。
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// 共享缓冲池。
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// 孤儿执行器：选择器线程死亡后，外部提交的任务降级到此执行。
    pub fn orphan(&self) -> &OrphanExecutor {
        &self.orphan
    }

    /// 停止全部后台线程；幂等。
    pub fn shutdown(&self) {
        self.timer.shutdown();
        self.orphan.shutdown();
    }
}

/// 进程级单线程兜底执行器。
///
/// 选择器停止后仍可能有外部线程向其提交任务；这些“孤儿”任务被转投到
/// 此处顺序执行，保证提交方不会因目标线程死亡而丢失回调。任务置于
/// `catch_unwind` 中，panic 被记录后线程继续。
pub struct OrphanExecutor {
    sender: Mutex<Option<Sender<Box<dyn FnOnce() + Send>>>>,
}

impl OrphanExecutor {
    fn start() -> Self {
        let (sender, receiver) = channel::<Box<dyn FnOnce() + Send>>();
        std::thread::Builder::new()
            .name("flint-orphan".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(target: "flint::core", "orphan task panicked");
                    }
                }
            })
            .expect("spawn flint orphan executor thread");
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// 提交任务；执行器已停止时任务被丢弃。
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let guard = self.sender.lock();
        if let Some(sender) = guard.as_ref() {
            // 接收端仅在 shutdown 后消失，发送失败等价于停止后的丢弃。
            let _ = sender.send(Box::new(task));
        }
    }

    fn shutdown(&self) {
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn orphan_executor_runs_submitted_tasks() {
        let services = CoreServices::start();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        services.orphan().submit(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        services.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_dropped() {
        let services = CoreServices::start();
        services.shutdown();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        services.orphan().submit(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
