use crate::handshake;
use bytes::BytesMut;
use flint_core::timer::TimerKey;
use flint_reactor::channel::{Channel, SocketRead};
use flint_transport_tcp::conn::{ConnConf, ConnGuard, Connection, PlainConn};
use flint_transport_tcp::server::{AcceptHandler, ChannelHandoff};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TLS 记录类型 `handshake` 的首字节。
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// 统一的连接回调：明文与 TLS 连接都以 `Box<dyn Connection>` 交付。
pub type ConnHandler = Arc<dyn Fn(Box<dyn Connection>) + Send + Sync>;

/// TLS 端口的接受配置。
#[derive(Clone)]
pub struct TlsAcceptorConf {
    config: Arc<ServerConfig>,
    allow_plain: bool,
    handshake_timeout: Duration,
}

impl TlsAcceptorConf {
    /// 默认：纯 TLS 端口，握手超时 10 秒。
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            allow_plain: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// 同端口同时接受明文与 TLS：以首字节嗅探分流。
    pub fn allow_plain(mut self, allow: bool) -> Self {
        self.allow_plain = allow;
        self
    }

    /// 握手超时，覆盖检测与记录泵动的整个过程。
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// 构造 TCP 服务器可挂载的接受回调。
///
/// 纯 TLS 端口直接进入握手；`allow_plain` 端口先读至少一个字节：首字节
/// `0x16`（TLS `handshake` 记录型）时把已读字节交给握手器，否则构造明文
/// 连接并把已读字节作为初始 unread 交还。
pub fn accept_handler(conf: TlsAcceptorConf, user: ConnHandler) -> AcceptHandler {
    Arc::new(move |handoff: ChannelHandoff| {
        let (channel, peer, conn_conf, guard) = handoff.into_parts();
        debug!(target: "flint::transport::tls", peer = %peer, allow_plain = conf.allow_plain, "tls port accepted connection");
        if conf.allow_plain {
            let timer_channel = channel.clone();
            let timer_key = channel
                .selector()
                .services()
                .timer()
                .schedule(conf.handshake_timeout, move || timer_channel.close());
            let detector = Box::new(Detector {
                channel,
                conn_conf,
                guard: Some(guard),
                config: Arc::clone(&conf.config),
                handshake_timeout: conf.handshake_timeout,
                timer_key,
                user: Arc::clone(&user),
            });
            detector.step();
        } else {
            start_handshake(
                channel,
                BytesMut::new(),
                Arc::clone(&conf.config),
                conn_conf,
                guard,
                conf.handshake_timeout,
                Arc::clone(&user),
            );
        }
    })
}

fn start_handshake(
    channel: Channel,
    initial: BytesMut,
    config: Arc<ServerConfig>,
    conn_conf: ConnConf,
    guard: ConnGuard,
    timeout: Duration,
    user: ConnHandler,
) {
    handshake::start(
        channel,
        initial,
        config,
        conn_conf,
        Some(guard),
        timeout,
        Box::new(move |result| match result {
            Ok(conn) => user(Box::new(conn)),
            Err(err) => {
                warn!(target: "flint::transport::tls", error = %err, "tls handshake failed");
            }
        }),
    );
}

/// 明文/TLS 首字节嗅探器。
struct Detector {
    channel: Channel,
    conn_conf: ConnConf,
    guard: Option<ConnGuard>,
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
    timer_key: TimerKey,
    user: ConnHandler,
}

impl Detector {
    fn step(mut self: Box<Self>) {
        let mut buf = BytesMut::with_capacity(self.conn_conf.read_buffer_size);
        match self.channel.read(&mut buf) {
            Ok(SocketRead::Count(_)) => {
                self.timer_key.cancel();
                let guard = self.guard.take().expect("guard present until dispatch");
                if buf[0] == TLS_HANDSHAKE_RECORD {
                    debug!(target: "flint::transport::tls", "first byte 0x16, entering tls handshake");
                    start_handshake(
                        self.channel,
                        buf,
                        self.config,
                        self.conn_conf,
                        guard,
                        self.handshake_timeout,
                        self.user,
                    );
                } else {
                    debug!(target: "flint::transport::tls", "non-tls first byte, serving plaintext");
                    let mut conn = PlainConn::new(self.channel, self.conn_conf, Some(guard));
                    conn.unread(buf.freeze())
                        .expect("fresh connection accepts initial unread");
                    (self.user)(Box::new(conn));
                }
            }
            Ok(SocketRead::WouldBlock) => {
                let waiter = self.channel.await_readable(false);
                waiter.on_complete(move |result| match result {
                    Ok(()) => self.step(),
                    Err(_) => self.abandon(),
                });
            }
            Ok(SocketRead::Eof) | Err(_) => self.abandon(),
        }
    }

    fn abandon(self: Box<Self>) {
        self.timer_key.cancel();
        self.channel.close();
        // guard 随 self 释放，计数钩子回收。
    }
}
