use crate::conn::{ConnConf, ConnGuard, PlainConn};
use crate::error::{self, map_io_error};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flint_core::error::Result;
use flint_reactor::channel::{AcceptingScope, Channel};
use flint_reactor::selector::{EventSink, Readiness, Reactor, SelectorHandle};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 单次接受事件里的批量上限；达到上限后重挂监听套接字以重触发边沿。
const ACCEPT_BATCH_MAX: usize = 64;

/// 优雅停机的连接数轮询间隔。
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 接受回调：在目标 worker 的选择器线程上收到新连接的交接对象。
pub type AcceptHandler = Arc<dyn Fn(ChannelHandoff) + Send + Sync>;

type ServerSocketConf = Arc<dyn Fn(&Socket) -> std::io::Result<()> + Send + Sync>;
type SocketConf = Arc<dyn Fn(SockRef<'_>) -> std::io::Result<()> + Send + Sync>;

/// 新连接的交接对象：通道 + 连接配置 + 服务器侧关闭钩子。
///
/// 明文端口直接 [`ChannelHandoff::into_plain_conn`]；启用 TLS 的端口把它
/// 交给检测器/握手器，由其决定最终的连接形态。
pub struct ChannelHandoff {
    channel: Channel,
    peer: SocketAddr,
    selector: SelectorHandle,
    conn_conf: ConnConf,
    guard: ConnGuard,
}

impl ChannelHandoff {
    /// 对端地址。
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 所属选择器。
    pub fn selector(&self) -> &SelectorHandle {
        &self.selector
    }

    /// 以明文连接形态完成交接。
    pub fn into_plain_conn(self) -> PlainConn {
        PlainConn::new(self.channel, self.conn_conf, Some(self.guard))
    }

    /// 拆出原始部件（TLS 检测器使用）。
    pub fn into_parts(self) -> (Channel, SocketAddr, ConnConf, ConnGuard) {
        (self.channel, self.peer, self.conn_conf, self.guard)
    }
}

/// TCP 服务器配置；默认值见各 builder 方法。
#[derive(Clone)]
pub struct TcpServerConf {
    handlers: Vec<(SocketAddr, AcceptHandler)>,
    selector_ids: Vec<usize>,
    server_socket_backlog: i32,
    max_connections: Option<usize>,
    max_connections_per_ip: Option<usize>,
    conn_conf: ConnConf,
    server_socket_conf: Option<ServerSocketConf>,
    socket_conf: Option<SocketConf>,
}

impl TcpServerConf {
    /// 默认配置：选择器数 = CPU 数，backlog 50，连接数不设上限。
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            handlers: Vec::new(),
            selector_ids: (0..cpus).collect(),
            server_socket_backlog: 50,
            max_connections: None,
            max_connections_per_ip: None,
            conn_conf: ConnConf::default(),
            server_socket_conf: None,
            socket_conf: None,
        }
    }

    /// 在 `addr` 上挂载接受回调。
    pub fn handler(mut self, addr: SocketAddr, handler: AcceptHandler) -> Self {
        self.handlers.push((addr, handler));
        self
    }

    /// 指定本服务器使用的选择器 id 列表。
    pub fn selector_ids(mut self, ids: Vec<usize>) -> Self {
        self.selector_ids = ids;
        self
    }

    /// 监听 backlog（默认 50）。
    pub fn server_socket_backlog(mut self, backlog: i32) -> Self {
        self.server_socket_backlog = backlog;
        self
    }

    /// 全局连接数上限；按 worker 数向上取整均分，超额连接在接受时关闭。
    pub fn max_connections(mut self, cap: usize) -> Self {
        self.max_connections = Some(cap);
        self
    }

    /// 单 IP 连接数上限；采用宽松的先查后增计数，罕见超额可接受。
    pub fn max_connections_per_ip(mut self, cap: usize) -> Self {
        self.max_connections_per_ip = Some(cap);
        self
    }

    /// 连接级缓冲配置。
    pub fn conn_conf(mut self, conf: ConnConf) -> Self {
        self.conn_conf = conf;
        self
    }

    /// 监听套接字的一次性 OS 级配置钩子（绑定前调用）。
    pub fn server_socket_conf(
        mut self,
        hook: impl Fn(&Socket) -> std::io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.server_socket_conf = Some(Arc::new(hook));
        self
    }

    /// 已接受套接字的一次性 OS 级配置钩子（如 `TCP_NODELAY`）。
    pub fn socket_conf(
        mut self,
        hook: impl Fn(SockRef<'_>) -> std::io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.socket_conf = Some(Arc::new(hook));
        self
    }
}

impl Default for TcpServerConf {
    fn default() -> Self {
        Self::new()
    }
}

/// 常用的已接受套接字配置钩子：`TCP_NODELAY` 与可选 `SO_LINGER`。
///
/// `linger = Some(dur)` 时，关闭阶段超过 `dur` 未完成即发送 RST 释放
/// 资源；`None` 沿用内核默认策略。Linux 将时长向下取整到秒。
pub fn default_socket_conf(
    nodelay: bool,
    linger: Option<Duration>,
) -> impl Fn(SockRef<'_>) -> std::io::Result<()> + Send + Sync {
    move |sock| {
        if nodelay {
            sock.set_tcp_nodelay(true)?;
        }
        sock.set_linger(linger)
    }
}

const PHASE_INIT: u8 = 0;
const PHASE_ACCEPTING: u8 = 1;
const PHASE_PAUSED: u8 = 2;
const PHASE_STOPPED: u8 = 3;

fn phase_name(phase: u8) -> &'static str {
    match phase {
        PHASE_INIT => "init",
        PHASE_ACCEPTING => "accepting",
        PHASE_PAUSED => "paused",
        PHASE_STOPPED => "stopped",
        _ => "unknown",
    }
}

/// 多地址 TCP 服务器。
///
/// # 教案级注释
///
/// ## 生命周期（What）
/// - 线性迁移 init → accepting → paused → stopped → init，互斥锁串行化；
///   非法迁移返回 "illegal state" 错误；
/// - `pause_accepting`：accepting 作用域内的读等待全部失败（拆除空闲
///   持久连接），接受继续但套接字即收即关；
/// - `stop_accepting`：注销接受键并关闭监听套接字，端口释放；
/// - `stop_all`：强制关闭全部存活连接并归还选择器；
/// - `stop(grace)`：停止接受后以 10ms 周期轮询连接数归零，宽限期满仍未
///   归零则强制收尾。
///
/// ## 公平接受（How）
/// - 每个地址任一时刻只有一个“接受席位”worker 持有 ACCEPT 兴趣；
/// - 每次接受事件按批处理：批首采样各 worker 连接数，逐个套接字选取
///   计数最小者（平手优先当前 worker）；批尾若最小者不是当前 worker，
///   接受席位随之转移；
/// - 以极低的同步开销逼近均衡负载，不追求精确。
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    reactor: Arc<Reactor>,
    conf: TcpServerConf,
    phase: AtomicU8,
    life: Mutex<Life>,
    accepting_scope: Arc<AcceptingScope>,
    per_ip: Option<DashMap<IpAddr, usize>>,
    table_seq: AtomicU64,
}

#[derive(Default)]
struct Life {
    workers: Vec<Worker>,
    agents: Vec<Arc<AcceptAgent>>,
}

#[derive(Clone)]
struct Worker {
    index: usize,
    selector: SelectorHandle,
    conn_count: Arc<AtomicUsize>,
    connections: Arc<Mutex<HashMap<u64, Channel>>>,
}

impl TcpServer {
    /// 以 init 状态创建服务器；`start` 之前不持有任何资源。
    pub fn new(reactor: Arc<Reactor>, conf: TcpServerConf) -> Self {
        let per_ip = conf.max_connections_per_ip.map(|_| DashMap::new());
        Self {
            inner: Arc::new(ServerInner {
                reactor,
                conf,
                phase: AtomicU8::new(PHASE_INIT),
                life: Mutex::new(Life::default()),
                accepting_scope: AcceptingScope::new(),
                per_ip,
                table_seq: AtomicU64::new(1),
            }),
        }
    }

    /// init → accepting：绑定全部地址、获取选择器、注册接受代理
    /// （worker 0 为初始接受席位）。
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut life = inner.life.lock();
        let phase = inner.phase.load(Ordering::Acquire);
        if phase != PHASE_INIT {
            return Err(error::illegal_state(phase_name(phase), "start"));
        }

        if inner.conf.selector_ids.is_empty() {
            return Err(error::illegal_state("init", "start without selectors"));
        }
        let mut workers: Vec<Worker> = Vec::with_capacity(inner.conf.selector_ids.len());
        let result = (|| -> Result<Vec<Arc<AcceptAgent>>> {
            for (index, id) in inner.conf.selector_ids.iter().enumerate() {
                let selector = inner.reactor.acquire(*id)?;
                workers.push(Worker {
                    index,
                    selector,
                    conn_count: Arc::new(AtomicUsize::new(0)),
                    connections: Arc::new(Mutex::new(HashMap::new())),
                });
            }
            let mut agents = Vec::with_capacity(inner.conf.handlers.len());
            for (addr, handler) in &inner.conf.handlers {
                let listener = bind_listener(
                    *addr,
                    inner.conf.server_socket_backlog,
                    inner.conf.server_socket_conf.as_ref(),
                )?;
                let agent = Arc::new(AcceptAgent {
                    address: *addr,
                    handler: Arc::clone(handler),
                    server: Arc::downgrade(inner),
                    listener: Mutex::new(Some(listener)),
                    seat: Mutex::new(None),
                });
                agent.register_on(&workers[0])?;
                agents.push(agent);
            }
            Ok(agents)
        })();

        match result {
            Ok(agents) => {
                life.workers = workers;
                life.agents = agents;
                inner.accepting_scope.resume();
                inner.phase.store(PHASE_ACCEPTING, Ordering::Release);
                info!(target: "flint::transport::tcp", addresses = life.agents.len(), workers = life.workers.len(), "tcp server accepting");
                Ok(())
            }
            Err(err) => {
                for agent in life.agents.drain(..) {
                    agent.shutdown_listener();
                }
                for worker in workers {
                    inner.reactor.release(worker.selector);
                }
                Err(err)
            }
        }
    }

    /// accepting → paused：accepting 作用域内的等待全部失败；其后接受的
    /// 套接字即收即关。
    pub fn pause_accepting(&self) -> Result<()> {
        let inner = &self.inner;
        let _life = inner.life.lock();
        let phase = inner.phase.load(Ordering::Acquire);
        if phase != PHASE_ACCEPTING {
            return Err(error::illegal_state(phase_name(phase), "pause_accepting"));
        }
        inner.phase.store(PHASE_PAUSED, Ordering::Release);
        inner.accepting_scope.pause();
        info!(target: "flint::transport::tcp", "tcp server paused");
        Ok(())
    }

    /// paused → accepting。
    pub fn resume_accepting(&self) -> Result<()> {
        let inner = &self.inner;
        let _life = inner.life.lock();
        let phase = inner.phase.load(Ordering::Acquire);
        if phase != PHASE_PAUSED {
            return Err(error::illegal_state(phase_name(phase), "resume_accepting"));
        }
        inner.accepting_scope.resume();
        inner.phase.store(PHASE_ACCEPTING, Ordering::Release);
        Ok(())
    }

    /// paused → stopped：注销接受键并关闭监听套接字，端口释放。
    pub fn stop_accepting(&self) -> Result<()> {
        let inner = &self.inner;
        let mut life = inner.life.lock();
        let phase = inner.phase.load(Ordering::Acquire);
        if phase != PHASE_PAUSED {
            return Err(error::illegal_state(phase_name(phase), "stop_accepting"));
        }
        for agent in life.agents.drain(..) {
            agent.shutdown_listener();
        }
        inner.phase.store(PHASE_STOPPED, Ordering::Release);
        info!(target: "flint::transport::tcp", "tcp server stopped accepting");
        Ok(())
    }

    /// stopped → init：强制关闭全部存活连接并归还选择器。
    pub fn stop_all(&self) -> Result<()> {
        let inner = &self.inner;
        let mut life = inner.life.lock();
        let phase = inner.phase.load(Ordering::Acquire);
        if phase != PHASE_STOPPED {
            return Err(error::illegal_state(phase_name(phase), "stop_all"));
        }
        for worker in life.workers.drain(..) {
            let channels: Vec<Channel> = {
                let mut table = worker.connections.lock();
                table.drain().map(|(_, channel)| channel).collect()
            };
            for channel in channels {
                channel.close();
            }
            inner.reactor.release(worker.selector);
        }
        if let Some(per_ip) = &inner.per_ip {
            per_ip.clear();
        }
        inner.phase.store(PHASE_INIT, Ordering::Release);
        info!(target: "flint::transport::tcp", "tcp server fully stopped");
        Ok(())
    }

    /// 任意状态 → init：停止接受，宽限期内轮询连接数归零，然后强制收尾。
    pub fn stop(&self, grace: Duration) -> Result<()> {
        match self.inner.phase.load(Ordering::Acquire) {
            PHASE_INIT => return Ok(()),
            PHASE_ACCEPTING => {
                self.pause_accepting()?;
                self.stop_accepting()?;
            }
            PHASE_PAUSED => self.stop_accepting()?,
            _ => {}
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.conn_count() > 0 {
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        self.stop_all()
    }

    /// 全部 worker 的存活连接数之和。
    pub fn conn_count(&self) -> usize {
        let life = self.inner.life.lock();
        life.workers
            .iter()
            .map(|worker| worker.conn_count.load(Ordering::Acquire))
            .sum()
    }

    /// 当前生命周期状态名（观测与测试用）。
    pub fn phase(&self) -> &'static str {
        phase_name(self.inner.phase.load(Ordering::Acquire))
    }

    /// 各监听套接字的实际绑定地址（端口 0 绑定后由内核分配）。
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let life = self.inner.life.lock();
        life.agents
            .iter()
            .filter_map(|agent| agent.local_addr())
            .collect()
    }
}

impl ServerInner {
    /// 宽松的单 IP 准入：先查后增，竞态下的轻微超额可接受。
    fn admit_ip(&self, ip: IpAddr) -> bool {
        let Some(cap) = self.conf.max_connections_per_ip else {
            return true;
        };
        let map = self.per_ip.as_ref().expect("per-ip map present when capped");
        let current = map.get(&ip).map(|entry| *entry).unwrap_or(0);
        if current >= cap {
            return false;
        }
        *map.entry(ip).or_insert(0) += 1;
        true
    }

    fn release_ip(&self, ip: IpAddr) {
        let Some(map) = &self.per_ip else {
            return;
        };
        match map.entry(ip) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= 1 {
                    occupied.remove();
                } else {
                    *occupied.get_mut() -= 1;
                }
            }
            Entry::Vacant(_) => {}
        }
    }

}

/// 单个绑定地址的接受代理；任一时刻注册在一个 worker 的选择器上。
struct AcceptAgent {
    address: SocketAddr,
    handler: AcceptHandler,
    server: Weak<ServerInner>,
    listener: Mutex<Option<TcpListener>>,
    seat: Mutex<Option<Seat>>,
}

struct Seat {
    worker_index: usize,
    token: Token,
    selector: SelectorHandle,
}

impl AcceptAgent {
    fn register_on(self: &Arc<Self>, worker: &Worker) -> Result<()> {
        let token = worker.selector.alloc_token();
        worker
            .selector
            .attach_sink(token, Arc::clone(self) as Arc<dyn EventSink>);
        {
            let mut guard = self.listener.lock();
            let listener = guard.as_mut().expect("listener present before register");
            worker
                .selector
                .registry()
                .register(listener, token, Interest::READABLE)
                .map_err(|err| map_io_error(error::BIND, err))?;
        }
        *self.seat.lock() = Some(Seat {
            worker_index: worker.index,
            token,
            selector: worker.selector.clone(),
        });
        Ok(())
    }

    /// 把接受席位转移到目标 worker。
    fn transfer_to(self: &Arc<Self>, worker: &Worker) {
        if let Some(seat) = self.seat.lock().take() {
            seat.selector.detach_sink(seat.token);
            let mut guard = self.listener.lock();
            if let Some(listener) = guard.as_mut() {
                let _ = seat.selector.registry().deregister(listener);
            }
        }
        if let Err(err) = self.register_on(worker) {
            error!(target: "flint::transport::tcp", address = %self.address, error = %err, "accepter transfer failed");
        } else {
            debug!(target: "flint::transport::tcp", address = %self.address, worker = worker.index, "accepter moved");
        }
    }

    /// 批量达到上限后重挂当前席位，重触发监听套接字的就绪边沿。
    fn rearm(&self) {
        let seat = self.seat.lock();
        let Some(seat) = seat.as_ref() else {
            return;
        };
        let mut guard = self.listener.lock();
        if let Some(listener) = guard.as_mut() {
            let _ = seat
                .selector
                .registry()
                .reregister(listener, seat.token, Interest::READABLE);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    fn shutdown_listener(&self) {
        if let Some(seat) = self.seat.lock().take() {
            seat.selector.detach_sink(seat.token);
            let mut guard = self.listener.lock();
            if let Some(listener) = guard.as_mut() {
                let _ = seat.selector.registry().deregister(listener);
            }
        }
        // 丢弃监听套接字，端口随之释放。
        self.listener.lock().take();
    }

    fn accept_batch(self: &Arc<Self>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let phase = server.phase.load(Ordering::Acquire);
        let workers: Vec<Worker> = server.life.lock().workers.clone();
        if workers.is_empty() {
            return;
        }
        let per_worker_cap = server
            .conf
            .max_connections
            .map(|cap| cap.div_ceil(workers.len()));
        let mut counts: Vec<usize> = workers
            .iter()
            .map(|worker| worker.conn_count.load(Ordering::Acquire))
            .collect();
        let current = self
            .seat
            .lock()
            .as_ref()
            .map(|seat| seat.worker_index)
            .unwrap_or(0);

        let mut accepted = 0usize;
        loop {
            let outcome = {
                let guard = self.listener.lock();
                match guard.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match outcome {
                Ok((socket, peer)) => {
                    accepted += 1;
                    if phase != PHASE_ACCEPTING {
                        // paused：接受继续，但套接字即收即关。
                        drop(socket);
                    } else if !server.admit_ip(peer.ip()) {
                        debug!(target: "flint::transport::tcp", peer = %peer, "per-ip cap reached, closing socket");
                        drop(socket);
                    } else {
                        let mut best = current;
                        for (index, count) in counts.iter().enumerate() {
                            if *count < counts[best] {
                                best = index;
                            }
                        }
                        if per_worker_cap.is_some_and(|cap| counts[best] >= cap) {
                            debug!(target: "flint::transport::tcp", peer = %peer, "connection cap reached, closing socket");
                            server.release_ip(peer.ip());
                            drop(socket);
                        } else {
                            counts[best] += 1;
                            workers[best].conn_count.fetch_add(1, Ordering::AcqRel);
                            self.hand_over(&server, workers[best].clone(), socket, peer);
                        }
                    }
                    if accepted >= ACCEPT_BATCH_MAX {
                        self.rearm();
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(target: "flint::transport::tcp", address = %self.address, error = %err, "{}", error::ACCEPT.message);
                    break;
                }
            }
        }

        // 批尾：最小连接数的 worker 接任接受席位。
        let mut min_index = current;
        for (index, count) in counts.iter().enumerate() {
            if *count < counts[min_index] {
                min_index = index;
            }
        }
        if min_index != current {
            self.transfer_to(&workers[min_index]);
        }
    }

    /// 派发：在目标 worker 的选择器线程上构造通道并调用接受回调。
    fn hand_over(
        self: &Arc<Self>,
        server: &Arc<ServerInner>,
        worker: Worker,
        socket: TcpStream,
        peer: SocketAddr,
    ) {
        if let Some(hook) = &server.conf.socket_conf
            && let Err(err) = hook(SockRef::from(&socket))
        {
            warn!(target: "flint::transport::tcp", peer = %peer, error = %err, "socket conf hook failed");
        }
        let table_id = server.table_seq.fetch_add(1, Ordering::Relaxed);
        let conn_conf = server.conf.conn_conf.clone();
        let scope = Arc::clone(&server.accepting_scope);
        let server = Arc::clone(server);
        let handler = Arc::clone(&self.handler);
        let selector = worker.selector.clone();
        let task_selector = selector.clone();
        let conn_count = Arc::clone(&worker.conn_count);
        let connections = Arc::clone(&worker.connections);
        selector.submit(move || {
            let channel = Channel::new(task_selector.clone(), socket, Some(scope));
            connections.lock().insert(table_id, channel.clone());
            let mut guard = ConnGuard::new();
            {
                let conn_count = Arc::clone(&conn_count);
                guard.push(move || {
                    conn_count.fetch_sub(1, Ordering::AcqRel);
                });
            }
            {
                let connections = Arc::clone(&connections);
                guard.push(move || {
                    connections.lock().remove(&table_id);
                });
            }
            guard.push(move || {
                server.release_ip(peer.ip());
            });
            handler(ChannelHandoff {
                channel,
                peer,
                selector: task_selector,
                conn_conf,
                guard,
            });
        });
    }
}

impl EventSink for AcceptAgent {
    fn on_event(self: Arc<Self>, _ready: Readiness) {
        self.accept_batch();
    }
}

fn bind_listener(
    addr: SocketAddr,
    backlog: i32,
    conf_hook: Option<&ServerSocketConf>,
) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| map_io_error(error::BIND, err))?;
    #[cfg(not(windows))]
    socket
        .set_reuse_address(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    if let Some(hook) = conf_hook {
        hook(&socket).map_err(|err| map_io_error(error::CONFIGURE, err))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| map_io_error(error::BIND, err))?;
    socket
        .listen(backlog)
        .map_err(|err| map_io_error(error::BIND, err))?;
    Ok(TcpListener::from_std(socket.into()))
}
