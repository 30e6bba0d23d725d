use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::error;

/// 进程内共享的单线程定时器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手、心跳、关闭排水等所有可配置超时共用一个定时器线程，避免每条连接
///   各起线程；
/// - 超时任务大多会在到期前被取消（cancel-on-complete），取消必须是 O(1)
///   打标记而非堆内删除，保持堆体积与延迟可控。
///
/// ## 逻辑（How）
/// - 内部为 `(fire_at, seq)` 排序的最小堆；`seq` 保证同刻任务先进先出；
/// - 取消只翻转条目上的原子标志，条目真正出堆时被丢弃；
/// - 任务在定时器线程上执行，置于 `catch_unwind` 中，panic 被记录后线程继续。
///
/// ## 契约（What）
/// - `schedule` 可从任意线程调用；返回的 [`TimerKey`] 用于取消；
/// - 任务应当短小且不可阻塞，长任务须转投选择器或业务线程；
/// - `shutdown` 后新的调度被静默丢弃，已入堆未到期的任务不再执行。
pub struct Timer {
    shared: Arc<TimerShared>,
}

/// 定时任务的取消句柄；`cancel` 幂等。
#[derive(Clone)]
pub struct TimerKey {
    cancelled: Arc<AtomicBool>,
}

impl TimerKey {
    /// 取消任务；任务尚未执行时保证不再执行。
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// 任务是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    cond: Condvar,
}

struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Entry {
    fire_at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Box<dyn FnOnce() + Send>,
}

// 最小堆语义：更早的 fire_at 排在堆顶。
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Timer {
    /// 启动定时器线程并返回句柄。
    pub fn start() -> Self {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("flint-timer".into())
            .spawn(move || run_loop(worker))
            .expect("spawn flint timer thread");
        Self { shared }
    }

    /// 在 `delay` 之后执行 `task`；返回取消句柄。
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerKey {
        let cancelled = Arc::new(AtomicBool::new(false));
        let key = TimerKey {
            cancelled: Arc::clone(&cancelled),
        };
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            key.cancel();
            return key;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            fire_at: Instant::now() + delay,
            seq,
            cancelled,
            task: Box::new(task),
        });
        drop(queue);
        self.shared.cond.notify_one();
        key
    }

    /// 停止定时器线程；未到期任务被丢弃。
    pub fn shutdown(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        queue.heap.clear();
        drop(queue);
        self.shared.cond.notify_one();
    }
}

fn run_loop(shared: Arc<TimerShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                match queue.heap.peek() {
                    None => {
                        shared.cond.wait(&mut queue);
                    }
                    Some(entry) if entry.cancelled.load(Ordering::Acquire) => {
                        queue.heap.pop();
                    }
                    Some(entry) => {
                        let now = Instant::now();
                        if entry.fire_at <= now {
                            break queue.heap.pop().map(|entry| entry.task);
                        }
                        let wait = entry.fire_at - now;
                        let _ = shared.cond.wait_for(&mut queue, wait);
                    }
                }
            }
        };
        if let Some(task) = task
            && catch_unwind(AssertUnwindSafe(task)).is_err()
        {
            error!(target: "flint::core", "timer task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_in_deadline_order() {
        let timer = Timer::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        timer.schedule(Duration::from_millis(40), move || second.lock().push(2));
        timer.schedule(Duration::from_millis(10), move || first.lock().push(1));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(*order.lock(), vec![1, 2]);
        timer.shutdown();
    }

    #[test]
    fn cancelled_task_never_fires() {
        let timer = Timer::start();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let key = timer.schedule(Duration::from_millis(20), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        key.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }

    #[test]
    fn schedule_after_shutdown_is_dropped() {
        let timer = Timer::start();
        timer.shutdown();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let key = timer.schedule(Duration::from_millis(1), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert!(key.is_cancelled());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
