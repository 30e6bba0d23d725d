use crate::error::{self, CoreError, ErrorCategory, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// 一次性完成的延续对象，是 flint 所有可等待操作的统一载体。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 选择器线程以回调驱动读写就绪，而消费方（应用线程、测试）偏好阻塞等待；
///   `Promise` 同时服务两种形态，避免为反应器绑定特定异步运行时；
/// - 取消必须能够反向传播到底层的 `await_readable`/`await_writable`，因此
///   承诺持有一个可注册的取消钩子。
///
/// ## 逻辑（How）
/// - 内部状态为 `Pending { callback, cancel_hook }` 或 `Done(Option<Result>)`；
/// - 首次 `complete`/`fail` 生效，后续调用返回 `false` 并被忽略；
/// - 回调在释放内部锁之后、完成方的调用栈上执行，链式完成按迭代展开，
///   不经过递归调度器；
/// - `cancel` 先运行取消钩子（摘除等待者、回收兴趣位），再以
///   [`error::cancelled`] 完成承诺。
///
/// ## 契约（What）
/// - 至多一个回调与一个取消钩子；重复注册以后者覆盖前者；
/// - 完成值只交付一次：交给回调或首个阻塞等待者；
/// - **后置条件**：完成后钩子与回调槽位均被释放，不存在循环引用。
///
/// ## 取舍（Trade-offs）
/// - 使用互斥锁而非无锁状态机：承诺的竞争窗口极短（完成与等待各一次），
///   锁的简单性优于原子位编排的复杂度。
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

enum State<T> {
    Pending {
        callback: Option<Callback<T>>,
        cancel_hook: Option<CancelHook>,
    },
    Done(Option<Result<T>>),
}

impl<T: Send + 'static> Promise<T> {
    /// 创建待完成的承诺。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    callback: None,
                    cancel_hook: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// 以成功值完成承诺；仅首次完成生效。
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// 以错误完成承诺；仅首次完成生效。
    pub fn fail(&self, err: CoreError) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, result: Result<T>) -> bool {
        let callback = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { callback: slot, .. } => match slot.take() {
                    Some(callback) => {
                        *state = State::Done(None);
                        callback
                    }
                    None => {
                        *state = State::Done(Some(result));
                        self.inner.cond.notify_all();
                        return true;
                    }
                },
                State::Done(_) => return false,
            }
        };
        callback(result);
        true
    }

    /// 注册完成回调；若承诺已完成且值尚未被消费，回调在当前线程立即执行。
    pub fn on_complete(&self, f: impl FnOnce(Result<T>) + Send + 'static) {
        let mut pending: Option<Callback<T>> = Some(Box::new(f));
        let ready = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { callback, .. } => {
                    if callback.is_some() {
                        debug!(target: "flint::core", "promise callback replaced");
                    }
                    *callback = pending.take();
                    None
                }
                State::Done(value) => value.take(),
            }
        };
        if let Some(value) = ready
            && let Some(callback) = pending.take()
        {
            callback(value);
        }
    }

    /// 注册取消钩子，供 [`Promise::cancel`] 反向摘除底层等待者。
    pub fn set_cancel_hook(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if let State::Pending { cancel_hook, .. } = &mut *state {
            *cancel_hook = Some(Box::new(f));
        }
    }

    /// 协作式取消：运行取消钩子，并以取消错误完成承诺。
    ///
    /// 承诺已完成时为空操作。
    pub fn cancel(&self, what: &'static str) {
        let hook = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { cancel_hook, .. } => cancel_hook.take(),
                State::Done(_) => return,
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        self.settle(Err(error::cancelled(what)));
    }

    /// 承诺是否已完成。
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// 两个句柄是否指向同一承诺。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 阻塞等待完成值，超时返回 [`error::codes::PROMISE_WAIT_TIMEOUT`]。
    ///
    /// 仅限选择器之外的线程使用；完成值被本次等待取走。
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(value) = &mut *state {
                return match value.take() {
                    Some(result) => result,
                    None => Err(CoreError::new(
                        error::codes::PROMISE_WAIT_TIMEOUT,
                        "promise value already consumed by callback",
                    )),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::new(
                    error::codes::PROMISE_WAIT_TIMEOUT,
                    "timed out waiting for promise",
                )
                .with_category(ErrorCategory::Timeout));
            }
            let _ = self.inner.cond.wait_for(&mut state, deadline - now);
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
