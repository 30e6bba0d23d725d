use crate::conn::{ConnConf, PlainConn};
use crate::error::{self, map_io_error};
use flint_core::promise::Promise;
use flint_reactor::channel::Channel;
use flint_reactor::selector::{EventSink, Readiness, SelectorHandle};
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// 非阻塞 TCP 客户端：发起连接并以承诺交付明文连接。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// - `connect` 发起非阻塞连接并注册 WRITABLE 兴趣；可写事件到达后以
///   `take_error`/`peer_addr` 验证三次握手结果；
/// - 成功路径先注销连接代理的注册，再把套接字重新包装为 [`Channel`]，
///   避免同一套接字出现双重注册；
/// - 取消在途连接会关闭套接字并令承诺以取消错误完成。
pub struct TcpClient {
    selector: SelectorHandle,
    conf: ConnConf,
}

impl TcpClient {
    pub fn new(selector: SelectorHandle, conf: ConnConf) -> Self {
        Self { selector, conf }
    }

    /// 发起到 `addr` 的连接。
    pub fn connect(&self, addr: SocketAddr) -> Promise<PlainConn> {
        let promise: Promise<PlainConn> = Promise::new();
        let socket = match TcpStream::connect(addr) {
            Ok(socket) => socket,
            Err(err) => {
                promise.fail(map_io_error(error::CONNECT, err));
                return promise;
            }
        };
        let token = self.selector.alloc_token();
        let agent = Arc::new(ConnectAgent {
            selector: self.selector.clone(),
            token,
            socket: Mutex::new(Some(socket)),
            promise: promise.clone(),
            conf: self.conf.clone(),
            done: AtomicBool::new(false),
        });
        self.selector
            .attach_sink(token, Arc::clone(&agent) as Arc<dyn EventSink>);
        {
            let mut guard = agent.socket.lock();
            let socket = guard.as_mut().expect("socket present before register");
            if let Err(err) = self
                .selector
                .registry()
                .register(socket, token, Interest::WRITABLE)
            {
                drop(guard);
                agent.detach();
                promise.fail(map_io_error(error::CONNECT, err));
                return promise;
            }
        }
        let cancel_agent = Arc::downgrade(&agent);
        promise.set_cancel_hook(move || {
            if let Some(agent) = cancel_agent.upgrade() {
                agent.abort();
            }
        });
        promise
    }
}

struct ConnectAgent {
    selector: SelectorHandle,
    token: Token,
    socket: Mutex<Option<TcpStream>>,
    promise: Promise<PlainConn>,
    conf: ConnConf,
    done: AtomicBool,
}

impl ConnectAgent {
    fn detach(&self) {
        self.selector.detach_sink(self.token);
        let mut guard = self.socket.lock();
        if let Some(socket) = guard.as_mut() {
            let _ = self.selector.registry().deregister(socket);
        }
    }

    /// 取消路径：注销并丢弃在途套接字。
    fn abort(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach();
        self.socket.lock().take();
        debug!(target: "flint::transport::tcp", "in-flight connect aborted");
    }
}

impl EventSink for ConnectAgent {
    fn on_event(self: Arc<Self>, _ready: Readiness) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach();
        let Some(socket) = self.socket.lock().take() else {
            return;
        };
        match socket.take_error() {
            Ok(Some(err)) | Err(err) => {
                self.promise.fail(map_io_error(error::CONNECT, err));
                return;
            }
            Ok(None) => {}
        }
        if let Err(err) = socket.peer_addr() {
            self.promise.fail(map_io_error(error::CONNECT, err));
            return;
        }
        let channel = Channel::new(self.selector.clone(), socket, None);
        let conn = PlainConn::new(channel, self.conf.clone(), None);
        self.promise.complete(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Connection, ReadOutcome, WriteItem};
    use bytes::Bytes;
    use flint_core::runtime::CoreServices;
    use flint_reactor::selector::Reactor;
    use std::io::{Read, Write};
    use std::time::Duration;

    #[test]
    fn connect_succeeds_and_exchanges_bytes() {
        let reactor = Reactor::new(CoreServices::start());
        let selector = reactor.acquire(0).expect("acquire selector");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");

        let client = TcpClient::new(selector, ConnConf::default());
        let pending = client.connect(addr);
        let (mut peer, _) = listener.accept().expect("accept from listener");
        let mut conn = pending
            .wait_timeout(Duration::from_secs(2))
            .expect("connect completes");

        conn.queue_write(WriteItem::Data(Bytes::from_static(b"hi")))
            .expect("queue data");
        conn.write().expect("flush");
        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("peer timeout");
        let mut received = [0u8; 2];
        peer.read_exact(&mut received).expect("peer reads");
        assert_eq!(&received, b"hi");

        peer.write_all(b"yo").expect("peer writes");
        conn.await_readable(false)
            .wait_timeout(Duration::from_secs(2))
            .expect("conn readable");
        let ReadOutcome::Data(data) = conn.read().expect("conn read") else {
            panic!("expected data");
        };
        assert_eq!(&data[..], b"yo");
        conn.close(Duration::ZERO);
        reactor.shutdown();
        reactor.services().shutdown();
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let reactor = Reactor::new(CoreServices::start());
        let selector = reactor.acquire(0).expect("acquire selector");
        // 绑定后立即释放端口，使其大概率处于关闭状态。
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
            listener.local_addr().expect("probe addr")
        };
        let client = TcpClient::new(selector, ConnConf::default());
        let err = client
            .connect(addr)
            .wait_timeout(Duration::from_secs(2))
            .expect_err("connect to closed port must fail");
        assert_eq!(err.code(), crate::error::CONNECT.code);
        reactor.shutdown();
        reactor.services().shutdown();
    }

    #[test]
    fn cancelled_connect_resolves() {
        let reactor = Reactor::new(CoreServices::start());
        let selector = reactor.acquire(0).expect("acquire selector");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        let client = TcpClient::new(selector, ConnConf::default());
        let pending = client.connect(addr);
        pending.cancel("connect");
        // 取消与完成存在竞争；两种终态都可接受，但承诺必须落定。
        let _ = pending.wait_timeout(Duration::from_secs(2));
        assert!(pending.is_done(), "cancelled connect promise must settle");
        reactor.shutdown();
        reactor.services().shutdown();
    }
}
