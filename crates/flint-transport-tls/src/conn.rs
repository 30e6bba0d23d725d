use crate::error::{TlsFault, map_engine_error};
use bytes::{Buf, Bytes, BytesMut};
use flint_core::error::{CoreError, ErrorCategory, Result};
use flint_core::promise::Promise;
use flint_core::runtime::CoreServices;
use flint_reactor::channel::{Channel, SocketRead};
use flint_transport_tcp::conn::{ConnConf, ConnGuard, Connection, ReadOutcome, WriteItem};
use rustls::ServerConnection;
use std::collections::VecDeque;
use std::io::{IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1_000_000_001);

/// close-notify 哨兵在写侧的推进状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CloseNotifyState {
    None,
    Queued,
    Wrapped,
}

/// TCP FIN 哨兵在写侧的推进状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FinState {
    None,
    Queued,
    Sent,
}

/// TLS 连接：通道之上以 rustls 引擎泵动记录。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎（`rustls::ServerConnection`）是 sans-IO 的记录编解码器：入站
///   方向 `read_tls` → `process_new_packets` → `reader`，出站方向
///   `writer` → `write_tls`；连接负责在引擎与通道之间搬运字节；
/// - 明文与 TLS 连接实现同一 [`Connection`] 契约，上层协议（WebSocket）
///   不感知加密形态。
///
/// ## 逻辑（How）
/// - 读路径仅在引擎无明文可交付时才填充入站记录缓冲，空记录（BEAST
///   缓解）与 1/n-1 拆分由引擎的记录聚合自然合并；
/// - 写路径先把明文灌入引擎（受引擎缓冲上限约束），再把密文冲入套接字；
///   close-notify 作为一条记录被包装，其后才允许 FIN；
/// - 写失败永久污染写侧并释放全部排队缓冲。
///
/// ## 契约（What）
/// - 对端干净的 close-notify 表现为一次 [`ReadOutcome::CloseNotify`]，
///   其后继续读返回 [`ReadOutcome::Fin`]；
/// - 数据阶段的握手消息（再协商尝试）以协议违规错误上抛；
/// - 超限记录上抛 "client ssl record too large"。
pub struct TlsConn {
    channel: Channel,
    services: Arc<CoreServices>,
    engine: ServerConnection,
    id: u64,
    peer: Option<SocketAddr>,
    conf: ConnConf,
    net_in: BytesMut,
    eof_seen: bool,
    close_notify_seen: bool,
    ungot: Option<Bytes>,
    queue: VecDeque<WriteItem>,
    queued_bytes: u64,
    close_notify: CloseNotifyState,
    fin: FinState,
    write_errored: bool,
    closed: bool,
    close_promise: Option<Promise<()>>,
    guard: Option<ConnGuard>,
}

impl TlsConn {
    /// 由握手器在会话建立后构造；`net_in` 可携带握手之后的剩余密文。
    pub(crate) fn new(
        channel: Channel,
        engine: ServerConnection,
        net_in: BytesMut,
        conf: ConnConf,
        guard: Option<ConnGuard>,
    ) -> Self {
        let services = Arc::clone(channel.selector().services());
        let peer = channel.peer_addr().ok();
        Self {
            channel,
            services,
            engine,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            conf,
            net_in,
            eof_seen: false,
            close_notify_seen: false,
            ungot: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            close_notify: CloseNotifyState::None,
            fin: FinState::None,
            write_errored: false,
            closed: false,
            close_promise: None,
            guard,
        }
    }

    /// 协商出的 ALPN 协议（若有）。
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.engine.alpn_protocol().map(|proto| proto.to_vec())
    }

    /// 客户端提供的 SNI（若有）。
    pub fn server_name(&self) -> Option<String> {
        self.engine.server_name().map(str::to_string)
    }

    /// 从引擎取一段已解密明文；无明文时返回 `None`。
    fn drain_plaintext(&mut self) -> Result<Option<ReadOutcome>> {
        let pool = self.services.buffers();
        let mut buf = pool.acquire(self.conf.read_buffer_size);
        let spare = buf.capacity();
        buf.resize(spare, 0);
        let outcome = match self.engine.reader().read(&mut buf[..]) {
            Ok(0) => {
                // 引擎层面的干净关闭：close-notify。
                if self.close_notify_seen {
                    None
                } else {
                    self.close_notify_seen = true;
                    Some(ReadOutcome::CloseNotify)
                }
            }
            Ok(count) => Some(ReadOutcome::Data(Bytes::copy_from_slice(&buf[..count]))),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Some(ReadOutcome::Fin)
            }
            Err(err) => {
                pool.release(buf);
                return Err(CoreError::new(
                    crate::error::PROTOCOL_CODE,
                    std::borrow::Cow::Owned(format!("tls read: {err}")),
                )
                .with_category(ErrorCategory::ProtocolViolation));
            }
        };
        pool.release(buf);
        Ok(outcome)
    }

    /// 把入站缓冲（乃至 EOF）喂给引擎并驱动记录解码。
    fn pump_engine_inbound(&mut self) -> Result<()> {
        if self.net_in.is_empty() && !self.eof_seen {
            return Ok(());
        }
        if self.net_in.is_empty() {
            let mut empty: &[u8] = &[];
            let _ = self
                .engine
                .read_tls(&mut empty)
                .map_err(|err| CoreError::from(TlsFault::Engine(rustls_io(err))))?;
        } else {
            let mut src: &[u8] = &self.net_in;
            let consumed = self
                .engine
                .read_tls(&mut src)
                .map_err(|err| CoreError::from(TlsFault::Engine(rustls_io(err))))?;
            self.net_in.advance(consumed);
        }
        self.engine
            .process_new_packets()
            .map_err(|err| CoreError::from(map_engine_error(err, true)))?;
        Ok(())
    }

    fn pump_engine_outbound(&mut self) -> Result<usize> {
        let mut flushed = 0usize;
        while self.engine.wants_write() {
            let mut wire = ChannelWriter {
                channel: &self.channel,
            };
            match self.engine.write_tls(&mut wire) {
                Ok(count) => flushed += count,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.poison_write();
                    return Err(CoreError::new(
                        crate::error::PROTOCOL_CODE,
                        std::borrow::Cow::Owned(format!("tls write: {err}")),
                    )
                    .with_cause(err)
                    .with_category(ErrorCategory::Io));
                }
            }
        }
        Ok(flushed)
    }

    fn poison_write(&mut self) {
        self.write_errored = true;
        self.queue.clear();
        self.queued_bytes = 0;
    }
}

fn rustls_io(err: std::io::Error) -> rustls::Error {
    rustls::Error::General(err.to_string())
}

/// 把通道适配为引擎的密文出口；拥塞映射为 `WouldBlock`。
pub(crate) struct ChannelWriter<'a> {
    pub(crate) channel: &'a Channel,
}

impl Write for ChannelWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.channel.write(&[IoSlice::new(buf)]) {
            Ok(0) => Err(std::io::ErrorKind::WouldBlock.into()),
            Ok(count) => Ok(count),
            Err(err) => Err(std::io::Error::other(err.to_string())),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Connection for TlsConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn read(&mut self) -> Result<ReadOutcome> {
        if self.closed {
            return Err(flint_core::error::closed("tls connection"));
        }
        if let Some(data) = self.ungot.take() {
            return Ok(ReadOutcome::Data(data));
        }
        loop {
            // 先交付引擎里已就绪的明文。
            if let Some(outcome) = self.drain_plaintext()? {
                return Ok(outcome);
            }
            // 引擎饥饿：仅此时才从通道补充密文。对端 FIN 之后由
            // pump_engine_inbound 向引擎宣告 EOF，reader 随之给出终态。
            if self.net_in.is_empty() && !self.eof_seen {
                self.net_in.reserve(self.conf.read_buffer_size);
                match self.channel.read(&mut self.net_in)? {
                    SocketRead::WouldBlock => return Ok(ReadOutcome::Stall),
                    SocketRead::Eof => {
                        self.eof_seen = true;
                    }
                    SocketRead::Count(_) => {}
                }
            }
            self.pump_engine_inbound()?;
            if self.eof_seen && self.net_in.is_empty() {
                // EOF 已喂给引擎；下一轮 drain_plaintext 给出终态。
                if let Some(outcome) = self.drain_plaintext()? {
                    return Ok(outcome);
                }
                return Ok(ReadOutcome::Fin);
            }
        }
    }

    fn unread(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(flint_core::error::closed("tls connection"));
        }
        if self.ungot.is_some() {
            return Err(CoreError::new(
                "flint.transport.tls.unread_conflict",
                "consecutive unread not supported",
            ));
        }
        self.ungot = Some(data);
        Ok(())
    }

    fn queue_write(&mut self, item: WriteItem) -> Result<u64> {
        if self.closed || self.write_errored {
            return Err(flint_core::error::closed("tls connection"));
        }
        if self.fin != FinState::None {
            return Err(CoreError::new(
                "flint.transport.tls.fin_queued",
                "TCP_FIN was queued before",
            ));
        }
        match &item {
            WriteItem::Data(data) => {
                if self.close_notify != CloseNotifyState::None {
                    return Err(CoreError::new(
                        "flint.transport.tls.close_notify_queued",
                        "SSL_CLOSE_NOTIFY was queued before",
                    ));
                }
                self.queued_bytes += data.len() as u64;
            }
            WriteItem::Fin => {
                self.fin = FinState::Queued;
                self.queued_bytes += 1;
            }
            WriteItem::CloseNotify => {
                if self.close_notify != CloseNotifyState::None {
                    return Err(CoreError::new(
                        "flint.transport.tls.close_notify_queued",
                        "SSL_CLOSE_NOTIFY was queued before",
                    ));
                }
                self.close_notify = CloseNotifyState::Queued;
                self.queued_bytes += 1;
            }
        }
        self.queue.push_back(item);
        Ok(self.queued_bytes)
    }

    fn write(&mut self) -> Result<u64> {
        if self.closed || self.write_errored {
            return Err(flint_core::error::closed("tls connection"));
        }
        let mut flushed = 0u64;
        loop {
            // a. 明文灌入引擎（逐条记录：引擎缓冲满即停）。
            let mut engine_fed = false;
            while let Some(front) = self.queue.front_mut() {
                match front {
                    WriteItem::Data(data) => {
                        let written = self
                            .engine
                            .writer()
                            .write(data)
                            .map_err(|err| CoreError::from(TlsFault::Engine(rustls_io(err))))?;
                        if written == 0 {
                            break;
                        }
                        engine_fed = true;
                        data.advance(written);
                        self.queued_bytes -= written as u64;
                        if data.is_empty() {
                            self.queue.pop_front();
                        }
                    }
                    WriteItem::CloseNotify => {
                        self.engine.send_close_notify();
                        self.close_notify = CloseNotifyState::Wrapped;
                        self.queued_bytes -= 1;
                        self.queue.pop_front();
                        engine_fed = true;
                        debug!(target: "flint::transport::tls", connection = self.id, "close-notify wrapped");
                    }
                    WriteItem::Fin => break,
                }
            }
            // b. 密文冲入套接字。
            let wired = self.pump_engine_outbound()?;
            flushed += wired as u64;
            if self.engine.wants_write() {
                // 套接字拥塞；调用方应 await_writable 后重试。
                return Ok(flushed);
            }
            if !engine_fed {
                break;
            }
        }
        // c. close-notify 记录落盘之后才允许发送 FIN。
        if !self.engine.wants_write()
            && matches!(self.queue.front(), Some(WriteItem::Fin))
        {
            self.queue.pop_front();
            self.queued_bytes -= 1;
            self.channel.shutdown_output()?;
            self.fin = FinState::Sent;
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
        self.queued_bytes = 0;
        self.ungot = None;
        self.net_in.clear();
        if let Some(guard) = self.guard.take() {
            drop(guard);
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
            flint_transport_tcp::conn::drain_step(
                self.channel.clone(),
                promise.clone(),
                key,
                deadline,
            );
        }
        promise
    }
}
