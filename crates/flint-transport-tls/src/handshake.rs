use crate::conn::{ChannelWriter, TlsConn};
use crate::error::{TlsFault, map_engine_error};
use bytes::{Buf, BytesMut};
use flint_core::error::{CoreError, Result};
use flint_core::timer::TimerKey;
use flint_reactor::channel::{Channel, SocketRead};
use flint_transport_tcp::conn::{ConnConf, ConnGuard};
use rustls::{ServerConfig, ServerConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

pub(crate) type HandshakeDone = Box<dyn FnOnce(Result<TlsConn>) + Send>;

/// 启动服务端 TLS 握手；完成或失败经 `on_done` 回调交付。
///
/// `initial` 携带检测器已消费的密文（明文/TLS 同端口场景），整个握手被
/// `timeout` 约束：期限到期由共享定时器关闭通道，挂起的等待随之失败。
pub(crate) fn start(
    channel: Channel,
    initial: BytesMut,
    config: Arc<ServerConfig>,
    conf: ConnConf,
    guard: Option<ConnGuard>,
    timeout: Duration,
    on_done: HandshakeDone,
) {
    let engine = match ServerConnection::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            channel.close();
            on_done(Err(CoreError::from(TlsFault::Engine(err))));
            return;
        }
    };
    let timed_out = Arc::new(AtomicBool::new(false));
    let timer_flag = Arc::clone(&timed_out);
    let timer_channel = channel.clone();
    let timer_key = channel.selector().services().timer().schedule(timeout, move || {
        timer_flag.store(true, Ordering::Release);
        timer_channel.close();
    });
    let driver = Box::new(Handshake {
        channel,
        engine,
        net_in: initial,
        conf,
        guard,
        timed_out,
        timer_key,
        on_done,
    });
    driver.step();
}

/// 半双工握手状态机。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// - 引擎待写则优先冲刷出站记录；套接字拥塞时等待可写后续跑；
/// - 否则补充入站密文并驱动解码；无字节可读时等待可读后续跑；
/// - `is_handshaking()` 翻转即进入 FINISH：取消定时器、连同剩余密文构造
///   [`TlsConn`] 交付回调。
///
/// ## 契约（What）
/// - 失败路径（协议错误、EOF、超时）关闭通道；关闭钩子随 `guard` 的
///   释放而触发，计数器得以回收。
struct Handshake {
    channel: Channel,
    engine: ServerConnection,
    net_in: BytesMut,
    conf: ConnConf,
    guard: Option<ConnGuard>,
    timed_out: Arc<AtomicBool>,
    timer_key: TimerKey,
    on_done: HandshakeDone,
}

impl Handshake {
    fn step(mut self: Box<Self>) {
        loop {
            if !self.engine.is_handshaking() {
                self.finish();
                return;
            }
            if self.engine.wants_write() {
                let mut wire = ChannelWriter {
                    channel: &self.channel,
                };
                match self.engine.write_tls(&mut wire) {
                    Ok(_) => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        self.await_writable();
                        return;
                    }
                    Err(err) => {
                        self.fail(TlsFault::Engine(rustls::Error::General(err.to_string())));
                        return;
                    }
                }
            }
            if self.net_in.is_empty() {
                self.net_in.reserve(4096);
                match self.channel.read(&mut self.net_in) {
                    Ok(SocketRead::WouldBlock) => {
                        self.await_readable();
                        return;
                    }
                    Ok(SocketRead::Eof) => {
                        self.fail(TlsFault::InboundEof);
                        return;
                    }
                    Ok(SocketRead::Count(_)) => {}
                    Err(err) => {
                        self.fail_with(err);
                        return;
                    }
                }
            }
            let consumed = {
                let mut src: &[u8] = &self.net_in;
                match self.engine.read_tls(&mut src) {
                    Ok(consumed) => consumed,
                    Err(err) => {
                        self.fail(TlsFault::Engine(rustls::Error::General(err.to_string())));
                        return;
                    }
                }
            };
            self.net_in.advance(consumed);
            if let Err(err) = self.engine.process_new_packets() {
                self.fail(map_engine_error(err, false));
                return;
            }
        }
    }

    fn await_readable(self: Box<Self>) {
        let waiter = self.channel.await_readable(false);
        waiter.on_complete(move |result| match result {
            Ok(()) => self.step(),
            Err(err) => self.fail_with(err),
        });
    }

    fn await_writable(self: Box<Self>) {
        let waiter = self.channel.await_writable();
        waiter.on_complete(move |result| match result {
            Ok(()) => self.step(),
            Err(err) => self.fail_with(err),
        });
    }

    fn finish(self: Box<Self>) {
        self.timer_key.cancel();
        let Handshake {
            channel,
            engine,
            net_in,
            conf,
            guard,
            on_done,
            ..
        } = *self;
        debug!(target: "flint::transport::tls", "tls session established");
        on_done(Ok(TlsConn::new(channel, engine, net_in, conf, guard)));
    }

    fn fail(self: Box<Self>, fault: TlsFault) {
        self.fail_with(CoreError::from(fault));
    }

    fn fail_with(self: Box<Self>, err: CoreError) {
        self.timer_key.cancel();
        let err = if self.timed_out.load(Ordering::Acquire) {
            CoreError::from(TlsFault::HandshakeTimeout)
        } else {
            err
        };
        self.channel.close();
        // guard 随 self 释放，服务器侧计数钩子在此触发。
        (self.on_done)(Err(err));
    }
}
