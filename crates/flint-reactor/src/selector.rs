use crate::error::{self, map_io_error};
use flint_core::error::Result;
use flint_core::runtime::CoreServices;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// 唤醒专用的保留 Token；普通通道的 Token 从 0 递增分配。
const WAKE_TOKEN: Token = Token(usize::MAX);

/// 单轮本地任务排空的时间上限。有界排空防止某条繁忙通道饿死
/// OS 事件检查与兴趣位刷新。
const LOCAL_DRAIN_BUDGET: Duration = Duration::from_millis(100);

type Task = Box<dyn FnOnce() + Send>;

/// 事件接收方：通道、接受代理等在选择器上注册的就绪回调。
pub trait EventSink: Send + Sync {
    /// 在选择器线程上分发一次就绪事件。
    ///
    /// 以 `Arc<Self>` 接收，便于实现方在回调中再次注册自身。
    fn on_event(self: Arc<Self>, ready: Readiness);
}

/// 一次选择事件携带的就绪位。
#[derive(Clone, Copy, Debug, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

/// 反应器：按 id 惰性创建/引用计数释放的选择器集合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 每个选择器独占一个 OS `Poll` 与一条线程，连接被分摊到各选择器上，
///   线程间不窃取工作（接受权交接除外）；
/// - 选择器注册表不做成全局单例，而是随 [`Reactor`] 显式传递，随启动
///   创建、随停止释放。
///
/// ## 契约（What）
/// - `acquire(id)`：同一 id 重复获取返回同一选择器并加引用；
/// - `release(handle)`：最后一个使用者释放时请求选择器停止；
/// - 选择器线程死亡后，外部提交的任务降级到孤儿执行器。
pub struct Reactor {
    services: Arc<CoreServices>,
    selectors: Mutex<HashMap<usize, Slot>>,
}

struct Slot {
    shared: Arc<SelectorShared>,
    refs: usize,
}

impl Reactor {
    /// 基于运行时能力创建反应器。
    pub fn new(services: Arc<CoreServices>) -> Arc<Self> {
        Arc::new(Self {
            services,
            selectors: Mutex::new(HashMap::new()),
        })
    }

    /// 运行时能力集合。
    pub fn services(&self) -> &Arc<CoreServices> {
        &self.services
    }

    /// 获取 id 对应的选择器；不存在时创建并启动其线程。
    pub fn acquire(&self, id: usize) -> Result<SelectorHandle> {
        let mut selectors = self.selectors.lock();
        if let Some(slot) = selectors.get_mut(&id) {
            slot.refs += 1;
            return Ok(SelectorHandle {
                shared: Arc::clone(&slot.shared),
            });
        }
        let shared = SelectorShared::start(id, Arc::clone(&self.services))?;
        selectors.insert(
            id,
            Slot {
                shared: Arc::clone(&shared),
                refs: 1,
            },
        );
        Ok(SelectorHandle { shared })
    }

    /// 归还选择器；最后一个引用触发停止。
    pub fn release(&self, handle: SelectorHandle) {
        let id = handle.shared.id;
        let mut selectors = self.selectors.lock();
        let Some(slot) = selectors.get_mut(&id) else {
            return;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            let shared = selectors
                .remove(&id)
                .map(|slot| slot.shared)
                .expect("slot present under lock");
            drop(selectors);
            shared.request_stop();
        }
    }

    /// 强制停止所有选择器（进程退出路径）。
    pub fn shutdown(&self) {
        let shared: Vec<_> = {
            let mut selectors = self.selectors.lock();
            selectors.drain().map(|(_, slot)| slot.shared).collect()
        };
        for selector in shared {
            selector.request_stop();
        }
    }
}

/// 选择器句柄；克隆廉价，跨线程安全。
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<SelectorShared>,
}

impl SelectorHandle {
    /// 选择器 id。
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// 运行时能力集合。
    pub fn services(&self) -> &Arc<CoreServices> {
        &self.shared.services
    }

    /// 提交任务到选择器线程。
    ///
    /// 所属线程提交进入本地队列；外部线程提交进入并发队列并唤醒阻塞中的
    /// select；线程死亡后转投孤儿执行器。
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.submit(Box::new(task));
    }

    /// 当前线程是否为该选择器的所属线程。
    pub fn is_selector_thread(&self) -> bool {
        self.shared.is_selector_thread()
    }

    /// 注册 before-select 钩子；返回的 id 用于移除。
    ///
    /// 钩子在每轮 select 之前运行，典型用途是批量应用兴趣位变更。
    pub fn register_before_select(&self, hook: impl Fn() + Send + Sync + 'static) -> u64 {
        let id = self.shared.hook_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.hooks.lock().push((id, Arc::new(hook)));
        id
    }

    /// 移除 before-select 钩子。
    pub fn remove_before_select(&self, hook_id: u64) {
        self.shared.hooks.lock().retain(|(id, _)| *id != hook_id);
    }

    /// 分配一个新的注册 Token。
    pub fn alloc_token(&self) -> Token {
        Token(self.shared.token_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// 绑定 Token 与事件接收方。
    pub fn attach_sink(&self, token: Token, sink: Arc<dyn EventSink>) {
        self.shared.sinks.lock().insert(token, sink);
    }

    /// 解绑事件接收方。
    pub fn detach_sink(&self, token: Token) {
        self.shared.sinks.lock().remove(&token);
    }

    /// OS 注册表；注册/重注册/注销可从任意线程调用。
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// 把通道排入兴趣位刷新队列；在下一轮 select 前统一应用。
    pub(crate) fn queue_interest_flush(&self, flush: Arc<dyn InterestFlush>) {
        self.shared.interest_queue.lock().push_back(flush);
        if !self.is_selector_thread() {
            self.shared.wake();
        }
    }

    /// 选择器是否已被请求停止。
    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }
}

/// 兴趣位刷新的内部接口；由通道实现。
pub(crate) trait InterestFlush: Send + Sync {
    fn flush_interest(&self);
}

pub(crate) struct SelectorShared {
    id: usize,
    services: Arc<CoreServices>,
    registry: Registry,
    waker: Waker,
    owner: Mutex<Option<ThreadId>>,
    local: Mutex<VecDeque<Task>>,
    remote: Mutex<Vec<Task>>,
    remote_flag: AtomicBool,
    stop: AtomicBool,
    killed: AtomicBool,
    hooks: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    hook_seq: AtomicU64,
    sinks: Mutex<HashMap<Token, Arc<dyn EventSink>>>,
    token_seq: AtomicUsize,
    interest_queue: Mutex<VecDeque<Arc<dyn InterestFlush>>>,
}

impl SelectorShared {
    fn start(id: usize, services: Arc<CoreServices>) -> Result<Arc<Self>> {
        let poll = Poll::new().map_err(|err| map_io_error(error::POLL_CREATE, err))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|err| map_io_error(error::POLL_CREATE, err))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|err| map_io_error(error::POLL_CREATE, err))?;
        let shared = Arc::new(Self {
            id,
            services,
            registry,
            waker,
            owner: Mutex::new(None),
            local: Mutex::new(VecDeque::new()),
            remote: Mutex::new(Vec::new()),
            remote_flag: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            hook_seq: AtomicU64::new(0),
            sinks: Mutex::new(HashMap::new()),
            token_seq: AtomicUsize::new(0),
            interest_queue: Mutex::new(VecDeque::new()),
        });
        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name(format!("flint-selector-{id}"))
            .spawn(move || worker.run(poll))
            .expect("spawn flint selector thread");
        Ok(shared)
    }

    fn is_selector_thread(&self) -> bool {
        *self.owner.lock() == Some(std::thread::current().id())
    }

    fn submit(&self, task: Task) {
        if self.killed.load(Ordering::Acquire) {
            self.services.orphan().submit(task);
            return;
        }
        if self.is_selector_thread() {
            self.local.lock().push_back(task);
        } else {
            self.remote.lock().push(task);
            self.remote_flag.store(true, Ordering::Release);
            self.wake();
        }
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(target: "flint::reactor", selector = self.id, error = %err, "{}", error::WAKE.message);
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// 选择器主循环，见事件循环五步：钩子 → select → 分发 → 有界排空 → 停止检查。
    fn run(self: Arc<Self>, mut poll: Poll) {
        *self.owner.lock() = Some(std::thread::current().id());
        debug!(target: "flint::reactor", selector = self.id, "selector thread started");
        let mut events = Events::with_capacity(1024);

        loop {
            // 1. before-select 钩子与兴趣位批量刷新。
            self.run_hooks();
            self.flush_interests();

            // 2. 本地/远程队列有积压时退化为非阻塞 poll。
            let timeout = if self.has_pending_tasks() || self.stop.load(Ordering::Acquire) {
                Some(Duration::ZERO)
            } else {
                None
            };
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(target: "flint::reactor", selector = self.id, error = %err, "selector poll failed");
                break;
            }

            // 3. 分发就绪事件。
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let sink = self.sinks.lock().get(&event.token()).cloned();
                if let Some(sink) = sink {
                    let ready = Readiness {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        read_closed: event.is_read_closed(),
                        write_closed: event.is_write_closed(),
                        error: event.is_error(),
                    };
                    if catch_unwind(AssertUnwindSafe(|| sink.on_event(ready))).is_err() {
                        error!(target: "flint::reactor", selector = self.id, token = event.token().0, "event sink panicked");
                    }
                }
            }

            // 4. 有界排空本地队列，穿插收割远程队列。
            let deadline = Instant::now() + LOCAL_DRAIN_BUDGET;
            loop {
                if self.remote_flag.swap(false, Ordering::AcqRel) {
                    let mut remote = self.remote.lock();
                    let drained: Vec<Task> = remote.drain(..).collect();
                    drop(remote);
                    self.local.lock().extend(drained);
                }
                let Some(task) = self.local.lock().pop_front() else {
                    break;
                };
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(target: "flint::reactor", selector = self.id, "submitted task panicked");
                }
                if Instant::now() >= deadline {
                    break;
                }
            }

            // 5. 队列排空且停止被请求时退出。
            if self.stop.load(Ordering::Acquire)
                && self.local.lock().is_empty()
                && !self.remote_flag.load(Ordering::Acquire)
            {
                break;
            }
        }

        // 线程标记为死亡；此刻起外部提交降级为孤儿任务。
        self.killed.store(true, Ordering::Release);
        let leftovers: Vec<Task> = self.remote.lock().drain(..).collect();
        for task in leftovers {
            self.services.orphan().submit(task);
        }
        debug!(target: "flint::reactor", selector = self.id, "selector thread exited");
    }

    fn has_pending_tasks(&self) -> bool {
        self.remote_flag.load(Ordering::Acquire) || !self.local.lock().is_empty()
    }

    fn run_hooks(&self) {
        let hooks: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .hooks
            .lock()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!(target: "flint::reactor", selector = self.id, "before-select hook panicked");
            }
        }
    }

    fn flush_interests(&self) {
        loop {
            let Some(flush) = self.interest_queue.lock().pop_front() else {
                break;
            };
            flush.flush_interest();
        }
    }
}

/// mio `Interest` 组合工具：掩码位定义与转换。
pub(crate) mod interest {
    use mio::Interest;

    pub const READ: u8 = 0b01;
    pub const WRITE: u8 = 0b10;

    /// 把掩码转换为 mio `Interest`；空掩码返回 `None`（对应注销）。
    pub fn to_mio(mask: u8) -> Option<Interest> {
        match (mask & READ != 0, mask & WRITE != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}
