use crate::error::{self, map_io_error};
use crate::selector::{EventSink, InterestFlush, Readiness, SelectorHandle, interest};
use bytes::{BufMut, BytesMut};
use flint_core::error::Result;
use flint_core::promise::Promise;
use mio::Token;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io::{IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// 一次非阻塞读的三态结果。
///
/// 以带标签的枚举取代“0 表示不可读、-1 表示 EOF”式的整型约定，调用方
/// 无法漏判任一分支。
#[derive(Debug, Eq, PartialEq)]
pub enum SocketRead {
    /// 套接字暂无可读字节。
    WouldBlock,
    /// 对端已发送 FIN。
    Eof,
    /// 读入的字节数（恒为正）。
    Count(usize),
}

/// 服务器 accepting 状态的共享视图。
///
/// 通道在 `await_readable(accepting = true)` 时挂到此作用域；服务器暂停
/// 接受后，作用域内所有等待以 "accepting stopped" 失败，用于在优雅停机
/// 时拆除空闲的持久连接。
pub struct AcceptingScope {
    active: AtomicBool,
    waiters: Mutex<Vec<Promise<()>>>,
}

impl AcceptingScope {
    /// 创建处于 accepting 状态的作用域。
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            waiters: Mutex::new(Vec::new()),
        })
    }

    /// 是否仍处于 accepting 状态。
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 恢复 accepting 状态。
    pub fn resume(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// 离开 accepting 状态，挂起的等待全部失败。
    pub fn pause(&self) {
        self.active.store(false, Ordering::Release);
        let waiters: Vec<Promise<()>> = self.waiters.lock().drain(..).collect();
        for waiter in waiters {
            waiter.fail(error::accepting_stopped());
        }
    }

    fn track(&self, promise: Promise<()>) {
        let mut waiters = self.waiters.lock();
        waiters.retain(|p| !p.is_done());
        waiters.push(promise);
    }
}

/// 选择器上的非阻塞 TCP 通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把套接字级读写、半关闭与就绪等待收敛为一个对象，上层连接只与通道
///   打交道，不触碰 mio 细节；
/// - 兴趣位与 OS 注册状态分离维护：变更先落到期望掩码，再经选择器的
///   pre-select 批处理统一应用，避免循环中途的注册抖动。
///
/// ## 契约（What）
/// - 除线程安全的 `close` 与取消钩子外，所有操作都应在所属选择器线程上
///   调用；
/// - 每个方向至多一个未决等待者，重复等待返回冲突错误；
/// - `await_readable`/`await_writable` 必须跟随一次 `WouldBlock` 读/写：
///   选择器采用边沿触发，仅在状态翻转时投递事件；
/// - 等待者的取消只摘除等待与兴趣位，不拆除通道。
///
/// ## 取舍（Trade-offs）
/// - 就绪事件统一以 `complete` 交付（含错误/挂断位），由随后的读写操作
///   暴露具体故障；这与内核语义一致，也让等待方的处理路径单一。
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// 将已处于非阻塞模式的套接字包装为通道。
    pub fn new(
        selector: SelectorHandle,
        socket: TcpStream,
        accepting_scope: Option<Arc<AcceptingScope>>,
    ) -> Self {
        let token = selector.alloc_token();
        let shared = Arc::new(ChannelShared {
            selector: selector.clone(),
            token,
            socket: Mutex::new(Some(socket)),
            waiters: Mutex::new(Waiters {
                interest: 0,
                registered: 0,
                force_rearm: false,
                read_waiter: None,
                write_waiter: None,
                accepting_scope,
            }),
            closed: AtomicBool::new(false),
            flush_queued: AtomicBool::new(false),
        });
        selector.attach_sink(token, Arc::clone(&shared) as Arc<dyn EventSink>);
        Self { shared }
    }

    /// 所属选择器。
    pub fn selector(&self) -> &SelectorHandle {
        &self.shared.selector
    }

    /// 对端地址。
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let guard = self.shared.socket.lock();
        match guard.as_ref() {
            Some(socket) => socket
                .peer_addr()
                .map_err(|err| map_io_error(error::READ, err)),
            None => Err(error::channel_closed()),
        }
    }

    /// 非阻塞读入 `buf` 的空闲容量。
    pub fn read(&self, buf: &mut BytesMut) -> Result<SocketRead> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(error::channel_closed());
        }
        let mut guard = self.shared.socket.lock();
        let Some(socket) = guard.as_mut() else {
            return Err(error::channel_closed());
        };
        loop {
            let chunk = buf.chunk_mut();
            let raw =
                unsafe { slice::from_raw_parts_mut(chunk.as_mut_ptr().cast::<u8>(), chunk.len()) };
            match socket.read(raw) {
                Ok(0) => return Ok(SocketRead::Eof),
                Ok(count) => {
                    unsafe {
                        buf.advance_mut(count);
                    }
                    return Ok(SocketRead::Count(count));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(SocketRead::WouldBlock);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(error::READ, err)),
            }
        }
    }

    /// 一次 vectored 写；返回写入的字节数，拥塞时返回 0。
    pub fn write(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(error::channel_closed());
        }
        if bufs.is_empty() {
            return Ok(0);
        }
        let mut guard = self.shared.socket.lock();
        let Some(socket) = guard.as_mut() else {
            return Err(error::channel_closed());
        };
        loop {
            match socket.write_vectored(bufs) {
                Ok(count) => return Ok(count),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(error::WRITE, err)),
            }
        }
    }

    /// 发送 TCP FIN（写半关闭）。
    pub fn shutdown_output(&self) -> Result<()> {
        let guard = self.shared.socket.lock();
        let Some(socket) = guard.as_ref() else {
            return Err(error::channel_closed());
        };
        socket
            .shutdown(Shutdown::Write)
            .map_err(|err| map_io_error(error::SHUTDOWN, err))
    }

    /// 等待下一次可读。
    ///
    /// `accepting = true` 时挂到服务器的 accepting 作用域：服务器离开
    /// accepting 状态后等待以 "accepting stopped" 失败。
    pub fn await_readable(&self, accepting: bool) -> Promise<()> {
        let promise: Promise<()> = Promise::new();
        if self.shared.closed.load(Ordering::Acquire) {
            promise.fail(error::channel_closed());
            return promise;
        }
        {
            let mut waiters = self.shared.waiters.lock();
            if waiters.read_waiter.is_some() {
                drop(waiters);
                promise.fail(error::waiter_conflict("read"));
                return promise;
            }
            if accepting && let Some(scope) = waiters.accepting_scope.clone() {
                if !scope.is_active() {
                    drop(waiters);
                    promise.fail(error::accepting_stopped());
                    return promise;
                }
                scope.track(promise.clone());
            }
            waiters.read_waiter = Some(promise.clone());
            waiters.interest |= interest::READ;
            waiters.force_rearm = true;
        }
        let weak = Arc::downgrade(&self.shared);
        promise.set_cancel_hook(move || {
            if let Some(shared) = weak.upgrade() {
                shared.drop_waiter(interest::READ);
            }
        });
        self.shared.queue_flush();
        promise
    }

    /// 等待下一次可写。
    pub fn await_writable(&self) -> Promise<()> {
        let promise: Promise<()> = Promise::new();
        if self.shared.closed.load(Ordering::Acquire) {
            promise.fail(error::channel_closed());
            return promise;
        }
        {
            let mut waiters = self.shared.waiters.lock();
            if waiters.write_waiter.is_some() {
                drop(waiters);
                promise.fail(error::waiter_conflict("write"));
                return promise;
            }
            waiters.write_waiter = Some(promise.clone());
            waiters.interest |= interest::WRITE;
            waiters.force_rearm = true;
        }
        let weak = Arc::downgrade(&self.shared);
        promise.set_cancel_hook(move || {
            if let Some(shared) = weak.upgrade() {
                shared.drop_waiter(interest::WRITE);
            }
        });
        self.shared.queue_flush();
        promise
    }

    /// 线程安全且幂等的关闭；等待者以 "closed" 失败。
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.selector.submit(move || shared.teardown());
    }

    /// 通道是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

struct Waiters {
    interest: u8,
    registered: u8,
    /// 置位时即便掩码与 OS 状态一致也执行一次 reregister：边沿触发下
    /// 重挂等待者必须重估当前就绪状态，否则早先被消费的边沿会丢失。
    force_rearm: bool,
    read_waiter: Option<Promise<()>>,
    write_waiter: Option<Promise<()>>,
    accepting_scope: Option<Arc<AcceptingScope>>,
}

struct ChannelShared {
    selector: SelectorHandle,
    token: Token,
    socket: Mutex<Option<TcpStream>>,
    waiters: Mutex<Waiters>,
    closed: AtomicBool,
    flush_queued: AtomicBool,
}

impl ChannelShared {
    fn queue_flush(self: &Arc<Self>) {
        if !self.flush_queued.swap(true, Ordering::AcqRel) {
            self.selector
                .queue_interest_flush(Arc::clone(self) as Arc<dyn InterestFlush>);
        }
    }

    /// 摘除一个方向的等待者与兴趣位（取消路径）。
    fn drop_waiter(self: &Arc<Self>, direction: u8) {
        {
            let mut waiters = self.waiters.lock();
            if direction == interest::READ {
                waiters.read_waiter = None;
            } else {
                waiters.write_waiter = None;
            }
            waiters.interest &= !direction;
        }
        self.queue_flush();
    }

    fn teardown(&self) {
        self.selector.detach_sink(self.token);
        let (read_waiter, write_waiter) = {
            let mut waiters = self.waiters.lock();
            waiters.interest = 0;
            (waiters.read_waiter.take(), waiters.write_waiter.take())
        };
        {
            let mut guard = self.socket.lock();
            if let Some(mut socket) = guard.take() {
                let _ = self.selector.registry().deregister(&mut socket);
            }
        }
        if let Some(waiter) = read_waiter {
            waiter.fail(error::channel_closed());
        }
        if let Some(waiter) = write_waiter {
            waiter.fail(error::channel_closed());
        }
    }
}

impl EventSink for ChannelShared {
    fn on_event(self: Arc<Self>, ready: Readiness) {
        let mut completions: Vec<Promise<()>> = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            if ready.readable || ready.read_closed || ready.error {
                if let Some(waiter) = waiters.read_waiter.take() {
                    waiters.interest &= !interest::READ;
                    completions.push(waiter);
                }
            }
            if ready.writable || ready.write_closed || ready.error {
                if let Some(waiter) = waiters.write_waiter.take() {
                    waiters.interest &= !interest::WRITE;
                    completions.push(waiter);
                }
            }
        }
        for waiter in completions {
            waiter.complete(());
        }
    }
}

impl InterestFlush for ChannelShared {
    fn flush_interest(&self) {
        self.flush_queued.store(false, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut waiters = self.waiters.lock();
        if waiters.interest == waiters.registered && !waiters.force_rearm {
            return;
        }
        let mut guard = self.socket.lock();
        let Some(socket) = guard.as_mut() else {
            return;
        };
        let registry = self.selector.registry();
        match interest::to_mio(waiters.interest) {
            None => {
                if waiters.registered != 0 {
                    let _ = registry.deregister(socket);
                }
                waiters.registered = 0;
                waiters.force_rearm = false;
            }
            Some(wanted) => {
                let result = if waiters.registered == 0 {
                    registry.register(socket, self.token, wanted)
                } else {
                    registry.reregister(socket, self.token, wanted)
                };
                match result {
                    Ok(()) => {
                        waiters.registered = waiters.interest;
                        waiters.force_rearm = false;
                    }
                    Err(err) => {
                        warn!(
                            target: "flint::reactor",
                            token = self.token.0,
                            error = %err,
                            "interest flush failed"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Reactor;
    use flint_core::runtime::CoreServices;
    use std::time::Duration;

    struct Fixture {
        reactor: Arc<Reactor>,
        selector: SelectorHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let reactor = Reactor::new(CoreServices::start());
            let selector = reactor.acquire(0).expect("acquire selector");
            Self { reactor, selector }
        }

        fn channel_pair(
            &self,
            scope: Option<Arc<AcceptingScope>>,
        ) -> (std::net::TcpStream, Channel) {
            let listener =
                std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
            let addr = listener.local_addr().expect("listener addr");
            let peer = std::net::TcpStream::connect(addr).expect("connect peer");
            let (server, _) = listener.accept().expect("accept server side");
            server
                .set_nonblocking(true)
                .expect("server side nonblocking");
            let channel = Channel::new(
                self.selector.clone(),
                TcpStream::from_std(server),
                scope,
            );
            (peer, channel)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.reactor.shutdown();
            self.reactor.services().shutdown();
        }
    }

    #[test]
    fn read_reports_would_block_then_data_then_eof() {
        let fixture = Fixture::new();
        let (mut peer, channel) = fixture.channel_pair(None);

        let mut buf = BytesMut::with_capacity(1024);
        assert_eq!(
            channel.read(&mut buf).expect("first read"),
            SocketRead::WouldBlock
        );

        peer.write_all(b"hello").expect("peer write");
        channel
            .await_readable(false)
            .wait_timeout(Duration::from_secs(2))
            .expect("readable after peer write");
        assert_eq!(
            channel.read(&mut buf).expect("data read"),
            SocketRead::Count(5)
        );
        assert_eq!(&buf[..], b"hello");

        peer.shutdown(Shutdown::Write).expect("peer fin");
        // FIN 可能需要一次就绪等待才能观察到。
        let outcome = loop {
            match channel.read(&mut buf).expect("read after fin") {
                SocketRead::WouldBlock => {
                    channel
                        .await_readable(false)
                        .wait_timeout(Duration::from_secs(2))
                        .expect("readable after fin");
                }
                other => break other,
            }
        };
        assert_eq!(outcome, SocketRead::Eof);
        channel.close();
    }

    #[test]
    fn second_read_waiter_conflicts() {
        let fixture = Fixture::new();
        let (_peer, channel) = fixture.channel_pair(None);
        let _first = channel.await_readable(false);
        let err = channel
            .await_readable(false)
            .wait_timeout(Duration::from_millis(100))
            .expect_err("second waiter must conflict");
        assert_eq!(err.code(), crate::error::WAITER_CONFLICT_CODE);
        channel.close();
    }

    #[test]
    fn cancelled_waiter_allows_rearm() {
        let fixture = Fixture::new();
        let (mut peer, channel) = fixture.channel_pair(None);
        let first = channel.await_readable(false);
        first.cancel("await_readable");
        let err = first
            .wait_timeout(Duration::from_millis(100))
            .expect_err("cancelled waiter fails");
        assert!(err.is_cancelled());

        peer.write_all(b"x").expect("peer write");
        channel
            .await_readable(false)
            .wait_timeout(Duration::from_secs(2))
            .expect("re-armed waiter completes");
        channel.close();
    }

    #[test]
    fn close_fails_pending_waiter_and_is_idempotent() {
        let fixture = Fixture::new();
        let (_peer, channel) = fixture.channel_pair(None);
        let waiter = channel.await_readable(false);
        channel.close();
        channel.close();
        let err = waiter
            .wait_timeout(Duration::from_secs(2))
            .expect_err("waiter fails on close");
        assert_eq!(err.code(), crate::error::CHANNEL_CLOSED_CODE);
        let mut buf = BytesMut::with_capacity(64);
        assert!(channel.read(&mut buf).is_err(), "closed channel rejects read");
    }

    #[test]
    fn accepting_pause_fails_waiter() {
        let fixture = Fixture::new();
        let scope = AcceptingScope::new();
        let (_peer, channel) = fixture.channel_pair(Some(Arc::clone(&scope)));
        let waiter = channel.await_readable(true);
        scope.pause();
        let err = waiter
            .wait_timeout(Duration::from_secs(2))
            .expect_err("waiter fails when accepting stops");
        assert_eq!(err.code(), crate::error::ACCEPTING_STOPPED_CODE);
        assert_eq!(err.message(), "accepting stopped");

        // 作用域失活后新的 accepting 等待立即失败。
        let rejected = channel
            .await_readable(true)
            .wait_timeout(Duration::from_millis(100))
            .expect_err("inactive scope rejects accepting waiters");
        assert_eq!(rejected.code(), crate::error::ACCEPTING_STOPPED_CODE);
        channel.close();
    }

    #[test]
    fn await_writable_completes_on_connected_socket() {
        let fixture = Fixture::new();
        let (_peer, channel) = fixture.channel_pair(None);
        channel
            .await_writable()
            .wait_timeout(Duration::from_secs(2))
            .expect("connected socket becomes writable");
        channel.close();
    }
}
