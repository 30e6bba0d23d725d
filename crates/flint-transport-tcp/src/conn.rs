use crate::error;
use crate::ring::CopyRing;
use bytes::{Buf, Bytes, BytesMut};
use flint_core::error::Result;
use flint_core::promise::Promise;
use flint_core::runtime::CoreServices;
use flint_core::timer::TimerKey;
use flint_reactor::channel::{Channel, SocketRead};
use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// 小于该长度的用户缓冲会被拷入共享环；更大的直接转发。
const COPY_COALESCE_MAX: usize = 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// 一次连接级读的结果。
///
/// 非数据结果（停顿、FIN、close-notify）与数据同为枚举变体，调用方在
/// 一次 match 中穷尽处理。
#[derive(Debug)]
pub enum ReadOutcome {
    /// 套接字暂无字节就绪。
    Stall,
    /// 对端 TCP FIN。
    Fin,
    /// 对端 TLS close-notify（仅 TLS 连接产生）。
    CloseNotify,
    /// 一段非空数据；仅当来源于先前的 `unread` 时可能为空。
    Data(Bytes),
}

/// 写队列条目；`Fin` 与 `CloseNotify` 在队列长度中各计一“字节”。
#[derive(Debug)]
pub enum WriteItem {
    Data(Bytes),
    Fin,
    CloseNotify,
}

/// 连接级配置。
#[derive(Clone, Debug)]
pub struct ConnConf {
    /// 单次套接字读借用的缓冲容量。
    pub read_buffer_size: usize,
    /// 拷贝环容量，亦即单轮写批次的体量上限。
    pub write_size: usize,
}

impl Default for ConnConf {
    fn default() -> Self {
        Self {
            read_buffer_size: 16 * 1024,
            write_size: 16 * 1024,
        }
    }
}

/// 连接关闭时运行的一组一次性钩子（计数回收、连接表摘除）。
///
/// 钩子在 `close` 时触发；若连接在未关闭的情况下被丢弃，`Drop` 兜底。
pub struct ConnGuard {
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl ConnGuard {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn push(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    fn fire(&mut self) {
        for hook in self.hooks.drain(..) {
            hook();
        }
    }
}

impl Default for ConnGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// 面向上层协议的连接抽象；明文与 TLS 连接共同实现。
///
/// 除 `await_*` 与 `close` 返回的承诺外，所有方法都应在所属选择器线程上
/// 调用。
pub trait Connection: Send {
    /// 单调递增的连接 id。
    fn id(&self) -> u64;
    /// 对端地址。
    fn peer_addr(&self) -> Option<SocketAddr>;
    /// 连接级读；见 [`ReadOutcome`]。
    fn read(&mut self) -> Result<ReadOutcome>;
    /// 暂存一段缓冲，由下一次 `read` 原样返回；连续两次暂存是错误。
    fn unread(&mut self, data: Bytes) -> Result<()>;
    /// 追加写队列；返回新的队列长度（哨兵各计一字节）。
    fn queue_write(&mut self, item: WriteItem) -> Result<u64>;
    /// 贪婪排空写队列；返回本次冲入套接字的字节数。
    fn write(&mut self) -> Result<u64>;
    /// 当前写队列长度。
    fn write_queue_size(&self) -> u64;
    /// 等待可读；`accepting` 语义见通道层。
    fn await_readable(&self, accepting: bool) -> Promise<()>;
    /// 等待可写。
    fn await_writable(&self) -> Promise<()>;
    /// 幂等关闭；丢弃排队数据，写半关闭，读净化至 EOF 或超时后关闭。
    fn close(&mut self, drain_timeout: Duration) -> Promise<()>;
}

enum DirectItem {
    User(Bytes),
    Ring(usize),
}

/// 明文 TCP 连接：通道之上叠加出站写队列与单槽 unread。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `queue_write`/`write` 分离让上层以“先排队、后冲刷”的节奏组织批量
///   写；小段缓冲合并入拷贝环，一次 vectored 写带走整批；
/// - `unread` 支撑协议探测（TLS 首字节嗅探）与解析器的残留回退。
///
/// ## 契约（What）
/// - FIN 入队后任何再入队都是 "TCP_FIN was queued before" 错误；
/// - close-notify 对明文连接是无操作哨兵，但其后再排数据仍是错误；
/// - 队列排空且 FIN 已入队时，`write` 触发写半关闭；
/// - `close(drain)` 幂等：丢弃队列、半关闭、读净化（避免 RST 吞掉在途
///   数据），最后关闭通道。
pub struct PlainConn {
    channel: Channel,
    services: Arc<CoreServices>,
    id: u64,
    peer: Option<SocketAddr>,
    conf: ConnConf,
    ungot: Option<Bytes>,
    queue: VecDeque<WriteItem>,
    direct: VecDeque<DirectItem>,
    ring: Option<CopyRing>,
    queued_bytes: u64,
    fin_queued: bool,
    close_notify_queued: bool,
    write_errored: bool,
    closed: bool,
    close_promise: Option<Promise<()>>,
    guard: Option<ConnGuard>,
}

impl std::fmt::Debug for PlainConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainConn")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PlainConn {
    /// 包装通道为明文连接；`guard` 携带服务器侧的关闭钩子。
    pub fn new(channel: Channel, conf: ConnConf, guard: Option<ConnGuard>) -> Self {
        let services = Arc::clone(channel.selector().services());
        let peer = channel.peer_addr().ok();
        Self {
            channel,
            services,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            conf,
            ungot: None,
            queue: VecDeque::new(),
            direct: VecDeque::new(),
            ring: None,
            queued_bytes: 0,
            fin_queued: false,
            close_notify_queued: false,
            write_errored: false,
            closed: false,
            close_promise: None,
            guard,
        }
    }

    /// 底层通道（TLS 检测器与测试使用）。
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// 把用户队列前端转移到直写队列，小段合并入拷贝环。
    ///
    /// 聚合在途字节超过环容量时停止转移，限定批次体量。
    fn stage_direct(&mut self) {
        let mut pending: usize = self
            .direct
            .iter()
            .map(|item| match item {
                DirectItem::User(data) => data.len(),
                DirectItem::Ring(len) => *len,
            })
            .sum();
        while pending <= self.conf.write_size {
            enum Front {
                Direct,
                Coalesce,
                CloseNotify,
                Stop,
            }
            let front = match self.queue.front() {
                Some(WriteItem::Data(data)) if data.len() >= COPY_COALESCE_MAX => Front::Direct,
                Some(WriteItem::Data(_)) => Front::Coalesce,
                Some(WriteItem::CloseNotify) => Front::CloseNotify,
                Some(WriteItem::Fin) | None => Front::Stop,
            };
            match front {
                Front::Direct => {
                    let Some(WriteItem::Data(data)) = self.queue.pop_front() else {
                        unreachable!("front checked above");
                    };
                    pending += data.len();
                    self.direct.push_back(DirectItem::User(data));
                }
                Front::Coalesce => {
                    let write_size = self.conf.write_size;
                    let ring = self.ring.get_or_insert_with(|| CopyRing::new(write_size));
                    if ring.available() == 0 {
                        break;
                    }
                    let Some(WriteItem::Data(mut data)) = self.queue.pop_front() else {
                        unreachable!("front checked above");
                    };
                    let copied = ring.push(&data);
                    if copied > 0 {
                        pending += copied;
                        if let Some(DirectItem::Ring(len)) = self.direct.back_mut() {
                            *len += copied;
                        } else {
                            self.direct.push_back(DirectItem::Ring(copied));
                        }
                    }
                    if copied < data.len() {
                        data.advance(copied);
                        self.queue.push_front(WriteItem::Data(data));
                        break;
                    }
                }
                Front::CloseNotify => {
                    // 明文连接上的 close-notify 是无操作哨兵。
                    self.queue.pop_front();
                    self.queued_bytes -= 1;
                }
                Front::Stop => break,
            }
        }
    }

    fn flush_direct(&mut self) -> Result<usize> {
        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(self.direct.len() + 1);
        let mut ring_offset = 0usize;
        for item in &self.direct {
            match item {
                DirectItem::User(data) => slices.push(IoSlice::new(&data[..])),
                DirectItem::Ring(len) => {
                    let ring = self.ring.as_ref().expect("ring present for ring items");
                    let (head, tail) = ring.view(ring_offset, *len);
                    slices.push(IoSlice::new(head));
                    if let Some(tail) = tail {
                        slices.push(IoSlice::new(tail));
                    }
                    ring_offset += len;
                }
            }
        }
        self.channel.write(&slices)
    }

    fn consume_direct(&mut self, mut count: usize) {
        while count > 0 {
            let Some(front) = self.direct.front_mut() else {
                break;
            };
            match front {
                DirectItem::User(data) => {
                    let taken = count.min(data.len());
                    data.advance(taken);
                    count -= taken;
                    self.queued_bytes -= taken as u64;
                    if data.is_empty() {
                        self.direct.pop_front();
                    }
                }
                DirectItem::Ring(len) => {
                    let taken = count.min(*len);
                    self.ring
                        .as_mut()
                        .expect("ring present for ring items")
                        .advance(taken);
                    *len -= taken;
                    count -= taken;
                    self.queued_bytes -= taken as u64;
                    if *len == 0 {
                        self.direct.pop_front();
                    }
                }
            }
        }
        let ring_referenced = self
            .direct
            .iter()
            .any(|item| matches!(item, DirectItem::Ring(_)));
        if !ring_referenced && self.ring.as_ref().is_some_and(CopyRing::is_empty) {
            // 排空即释放环，空闲连接不占用环内存。
            self.ring = None;
        }
    }

    fn poison_write(&mut self) {
        self.write_errored = true;
        self.queue.clear();
        self.direct.clear();
        self.ring = None;
        self.queued_bytes = 0;
    }
}

impl Connection for PlainConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn read(&mut self) -> Result<ReadOutcome> {
        if self.closed {
            return Err(error::conn_closed());
        }
        if let Some(data) = self.ungot.take() {
            return Ok(ReadOutcome::Data(data));
        }
        let pool = self.services.buffers();
        let mut buf = pool.acquire(self.conf.read_buffer_size);
        let outcome = self.channel.read(&mut buf);
        let result = match outcome {
            Ok(SocketRead::WouldBlock) => Ok(ReadOutcome::Stall),
            Ok(SocketRead::Eof) => Ok(ReadOutcome::Fin),
            Ok(SocketRead::Count(count)) => {
                Ok(ReadOutcome::Data(Bytes::copy_from_slice(&buf[..count])))
            }
            Err(err) => Err(err),
        };
        pool.release(buf);
        result
    }

    fn unread(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(error::conn_closed());
        }
        if self.ungot.is_some() {
            return Err(error::unread_conflict());
        }
        self.ungot = Some(data);
        Ok(())
    }

    fn queue_write(&mut self, item: WriteItem) -> Result<u64> {
        if self.closed || self.write_errored {
            return Err(error::conn_closed());
        }
        if self.fin_queued {
            return Err(error::fin_queued());
        }
        match &item {
            WriteItem::Data(data) => {
                if self.close_notify_queued {
                    return Err(error::close_notify_queued());
                }
                self.queued_bytes += data.len() as u64;
            }
            WriteItem::Fin => {
                self.fin_queued = true;
                self.queued_bytes += 1;
            }
            WriteItem::CloseNotify => {
                if self.close_notify_queued {
                    return Err(error::close_notify_queued());
                }
                self.close_notify_queued = true;
                self.queued_bytes += 1;
            }
        }
        self.queue.push_back(item);
        Ok(self.queued_bytes)
    }

    fn write(&mut self) -> Result<u64> {
        if self.closed || self.write_errored {
            return Err(error::conn_closed());
        }
        let mut flushed = 0u64;
        loop {
            self.stage_direct();
            if self.direct.is_empty() {
                break;
            }
            let written = match self.flush_direct() {
                Ok(written) => written,
                Err(err) => {
                    self.poison_write();
                    return Err(err);
                }
            };
            flushed += written as u64;
            self.consume_direct(written);
            if written == 0 {
                break;
            }
        }
        if self.direct.is_empty() && matches!(self.queue.front(), Some(WriteItem::Fin)) {
            self.queue.pop_front();
            self.queued_bytes -= 1;
            self.channel.shutdown_output()?;
            debug!(target: "flint::transport::tcp", connection = self.id, "output shut down after queued FIN");
        }
        Ok(flushed)
    }

    fn write_queue_size(&self) -> u64 {
        self.queued_bytes
    }

    fn await_readable(&self, accepting: bool) -> Promise<()> {
        self.channel.await_readable(accepting)
    }

    fn await_writable(&self) -> Promise<()> {
        self.channel.await_writable()
    }

    fn close(&mut self, drain_timeout: Duration) -> Promise<()> {
        if let Some(promise) = &self.close_promise {
            return promise.clone();
        }
        let promise: Promise<()> = Promise::new();
        self.close_promise = Some(promise.clone());
        self.closed = true;
        self.queue.clear();
        self.direct.clear();
        self.ring = None;
        self.queued_bytes = 0;
        self.ungot = None;
        if let Some(mut guard) = self.guard.take() {
            guard.fire();
        }
        let _ = self.channel.shutdown_output();
        if drain_timeout.is_zero() {
            self.channel.close();
            promise.complete(());
        } else {
            let deadline = Instant::now() + drain_timeout;
            let timeout_channel = self.channel.clone();
            let key = self
                .services
                .timer()
                .schedule(drain_timeout, move || timeout_channel.close());
            drain_step(self.channel.clone(), promise.clone(), key, deadline);
        }
        promise
    }
}

/// 读净化循环：丢弃入站数据直到 EOF、错误或超时，然后关闭通道。
///
/// 规避“数据在途时关闭触发 RST”的 TCP 病态路径。TLS 连接的关闭路径
/// 复用同一循环。
pub fn drain_step(channel: Channel, promise: Promise<()>, key: TimerKey, deadline: Instant) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if Instant::now() >= deadline {
            break;
        }
        match channel.read(&mut buf) {
            Ok(SocketRead::Count(_)) => {
                buf.clear();
            }
            Ok(SocketRead::WouldBlock) => {
                let next_channel = channel.clone();
                let next_promise = promise.clone();
                let next_key = key.clone();
                channel.await_readable(false).on_complete(move |result| {
                    match result {
                        Ok(()) => drain_step(next_channel, next_promise, next_key, deadline),
                        Err(_) => finish_drain(next_channel, next_promise, next_key),
                    }
                });
                return;
            }
            Ok(SocketRead::Eof) | Err(_) => break,
        }
    }
    finish_drain(channel, promise, key);
}

fn finish_drain(channel: Channel, promise: Promise<()>, key: TimerKey) {
    key.cancel();
    channel.close();
    promise.complete(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint_reactor::selector::{Reactor, SelectorHandle};
    use std::io::{Read, Write};
    use std::sync::Arc;

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

        fn conn_pair(&self, conf: ConnConf) -> (std::net::TcpStream, PlainConn) {
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
                mio::net::TcpStream::from_std(server),
                None,
            );
            (peer, PlainConn::new(channel, conf, None))
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.reactor.shutdown();
            self.reactor.services().shutdown();
        }
    }

    #[test]
    fn read_stalls_then_returns_data() {
        let fixture = Fixture::new();
        let (mut peer, mut conn) = fixture.conn_pair(ConnConf::default());
        assert!(matches!(conn.read().expect("empty read"), ReadOutcome::Stall));

        peer.write_all(b"ping").expect("peer write");
        conn.await_readable(false)
            .wait_timeout(Duration::from_secs(2))
            .expect("readable");
        let ReadOutcome::Data(data) = conn.read().expect("data read") else {
            panic!("expected data outcome");
        };
        assert_eq!(&data[..], b"ping");
        conn.close(Duration::ZERO);
    }

    #[test]
    fn unread_replays_verbatim_and_rejects_double() {
        let fixture = Fixture::new();
        let (_peer, mut conn) = fixture.conn_pair(ConnConf::default());
        conn.unread(Bytes::from_static(b"held")).expect("first unread");
        let err = conn
            .unread(Bytes::from_static(b"again"))
            .expect_err("double unread must fail");
        assert_eq!(err.message(), "consecutive unread not supported");
        let ReadOutcome::Data(data) = conn.read().expect("replayed read") else {
            panic!("expected replayed data");
        };
        assert_eq!(&data[..], b"held");
        conn.close(Duration::ZERO);
    }

    #[test]
    fn small_writes_coalesce_and_reach_peer() {
        let fixture = Fixture::new();
        let (mut peer, mut conn) = fixture.conn_pair(ConnConf::default());
        for chunk in [&b"ab"[..], b"cd", b"ef"] {
            conn.queue_write(WriteItem::Data(Bytes::copy_from_slice(chunk)))
                .expect("queue small chunk");
        }
        assert_eq!(conn.write_queue_size(), 6);
        conn.write().expect("flush");
        assert_eq!(conn.write_queue_size(), 0);

        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("peer read timeout");
        let mut received = [0u8; 6];
        peer.read_exact(&mut received).expect("peer read");
        assert_eq!(&received, b"abcdef");
        conn.close(Duration::ZERO);
    }

    #[test]
    fn large_write_is_forwarded_unchanged() {
        let fixture = Fixture::new();
        let (mut peer, mut conn) = fixture.conn_pair(ConnConf::default());
        let payload = vec![0x5au8; COPY_COALESCE_MAX * 4];
        conn.queue_write(WriteItem::Data(Bytes::from(payload.clone())))
            .expect("queue large chunk");
        while conn.write_queue_size() > 0 {
            conn.write().expect("flush");
            if conn.write_queue_size() > 0 {
                conn.await_writable()
                    .wait_timeout(Duration::from_secs(2))
                    .expect("writable");
            }
        }
        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("peer read timeout");
        let mut received = vec![0u8; payload.len()];
        peer.read_exact(&mut received).expect("peer read");
        assert_eq!(received, payload);
        conn.close(Duration::ZERO);
    }

    #[test]
    fn fin_queue_rules_and_shutdown() {
        let fixture = Fixture::new();
        let (mut peer, mut conn) = fixture.conn_pair(ConnConf::default());
        conn.queue_write(WriteItem::Data(Bytes::from_static(b"bye")))
            .expect("queue data");
        conn.queue_write(WriteItem::Fin).expect("queue fin");
        let err = conn
            .queue_write(WriteItem::Data(Bytes::from_static(b"late")))
            .expect_err("data after fin must fail");
        assert_eq!(err.message(), "TCP_FIN was queued before");
        conn.write().expect("flush with fin");
        assert_eq!(conn.write_queue_size(), 0);

        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("peer read timeout");
        let mut received = Vec::new();
        peer.read_to_end(&mut received).expect("peer reads until fin");
        assert_eq!(&received, b"bye");
        conn.close(Duration::ZERO);
    }

    #[test]
    fn close_notify_is_noop_on_plain() {
        let fixture = Fixture::new();
        let (_peer, mut conn) = fixture.conn_pair(ConnConf::default());
        conn.queue_write(WriteItem::CloseNotify)
            .expect("queue close notify");
        assert_eq!(conn.write_queue_size(), 1);
        let err = conn
            .queue_write(WriteItem::Data(Bytes::from_static(b"x")))
            .expect_err("data after close-notify must fail");
        assert_eq!(err.message(), "SSL_CLOSE_NOTIFY was queued before");
        conn.write().expect("flush");
        assert_eq!(conn.write_queue_size(), 0, "哨兵被消化且不产生字节");
        conn.close(Duration::ZERO);
    }

    #[test]
    fn close_is_idempotent_and_fires_guard() {
        let fixture = Fixture::new();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let mut guard = ConnGuard::new();
        guard.push(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let (_peer, mut conn) = {
            let (peer, mut conn) = fixture.conn_pair(ConnConf::default());
            conn.guard = Some(guard);
            (peer, conn)
        };
        let first = conn.close(Duration::ZERO);
        let second = conn.close(Duration::ZERO);
        first
            .wait_timeout(Duration::from_secs(2))
            .expect("close completes");
        second
            .wait_timeout(Duration::from_millis(100))
            .expect_err("close promise value already taken by first waiter");
        assert_eq!(fired.load(Ordering::SeqCst), 1, "钩子只运行一次");
        assert!(conn.read().is_err(), "closed conn rejects read");
    }

    #[test]
    fn close_with_drain_discards_inbound_until_fin() {
        let fixture = Fixture::new();
        let (mut peer, mut conn) = fixture.conn_pair(ConnConf::default());
        peer.write_all(b"inflight").expect("peer write");
        let done = conn.close(Duration::from_millis(500));
        peer.shutdown(std::net::Shutdown::Write).expect("peer fin");
        done.wait_timeout(Duration::from_secs(2))
            .expect("drain close completes");
    }
}
