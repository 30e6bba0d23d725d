use crate::frame::{self, OpCode};
use crate::meter::ThroughputMeter;
use crate::source::{ByteSource, SourcePull};
use bytes::{BufMut, Bytes, BytesMut};
use flint_core::error::{CoreError, ErrorCategory, Result};
use flint_core::promise::Promise;
use flint_transport_tcp::conn::{Connection, WriteItem};
use std::collections::VecDeque;
use tracing::debug;

/// 出站泵的运行状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PumpState {
    Running,
    AwaitingFrame,
    AwaitingWritable,
    Retired,
}

/// 一次取帧的结果。
pub(crate) enum FetchOutcome {
    /// 已有一帧进入连接写队列。
    Emitted,
    /// 关闭帧已入队；冲刷阈值随之归零。
    CloseEmitted,
    /// 无帧可取。
    Stall,
}

/// 排队中的出站消息：字节来源 + 完成承诺。
pub(crate) struct OutgoingMessage {
    pub(crate) source: Box<dyn ByteSource>,
    pub(crate) text: bool,
    pub(crate) started: bool,
    pub(crate) promise: Promise<()>,
}

/// 出站侧的可变状态。
///
/// # 教案级注释
///
/// ## 取帧优先级（What）
/// 错误/已关闭 → ping → pong（单槽、到达覆盖）→ 队首消息 → 关闭帧 →
/// 停顿。ping/pong 可以越过排队消息，但绝不插入半帧之间：一帧的头与
/// 载荷在同一次取帧内整体入队。
///
/// ## 分片（How）
/// 每帧自消息来源拉取至多 `max_payload` 字节；来源报告 `End` 时当前帧
/// 以 FIN=1 收尾（即便载荷为零）。服务端帧头 2–10 字节、无掩码。
pub(crate) struct OutboundState {
    pub(crate) state: PumpState,
    pub(crate) ping: Option<Bytes>,
    pub(crate) pong: Option<Bytes>,
    pub(crate) messages: VecDeque<OutgoingMessage>,
    pub(crate) close_frame: Option<(u16, String)>,
    /// `write_close` 的承诺；关闭帧排空后完成。
    pub(crate) close_done: Option<Promise<()>>,
    pub(crate) close_sent: bool,
    pub(crate) errored: bool,
    pub(crate) flush_mark: usize,
    pub(crate) meter: ThroughputMeter,
    pub(crate) dump: bool,
}

impl OutboundState {
    pub(crate) fn new(flush_mark: usize, meter: ThroughputMeter, dump: bool) -> Self {
        Self {
            state: PumpState::AwaitingFrame,
            ping: None,
            pong: None,
            messages: VecDeque::new(),
            close_frame: None,
            close_done: None,
            close_sent: false,
            errored: false,
            flush_mark,
            meter,
            dump,
        }
    }

    fn emit_control(
        &self,
        conn: &mut dyn Connection,
        opcode: OpCode,
        body: Bytes,
    ) -> Result<()> {
        let mut head = BytesMut::with_capacity(10);
        frame::encode_head(opcode, true, body.len(), &mut head);
        if self.dump {
            debug!(target: "flint::ws::dump", dir = "out", opcode = ?opcode, len = body.len(), fin = true, "frame");
        }
        conn.queue_write(WriteItem::Data(head.freeze()))?;
        if !body.is_empty() {
            conn.queue_write(WriteItem::Data(body))?;
        }
        Ok(())
    }

    /// 按优先级取一帧进连接写队列。
    pub(crate) fn fetch_frame(
        &mut self,
        conn: &mut dyn Connection,
        max_payload: usize,
    ) -> Result<FetchOutcome> {
        if self.errored || self.close_sent {
            return Ok(FetchOutcome::Stall);
        }
        if let Some(body) = self.ping.take() {
            self.emit_control(conn, OpCode::Ping, body)?;
            return Ok(FetchOutcome::Emitted);
        }
        if let Some(body) = self.pong.take() {
            self.emit_control(conn, OpCode::Pong, body)?;
            return Ok(FetchOutcome::Emitted);
        }
        if let Some(message) = self.messages.front_mut() {
            let mut chunks: Vec<Bytes> = Vec::new();
            let mut total = 0usize;
            let mut finished = false;
            let mut source_pending = false;
            while total < max_payload {
                match message.source.pull(max_payload - total) {
                    SourcePull::Data(chunk) => {
                        total += chunk.len();
                        chunks.push(chunk);
                    }
                    SourcePull::End => {
                        finished = true;
                        break;
                    }
                    SourcePull::Pending => {
                        source_pending = true;
                        break;
                    }
                }
            }
            if chunks.is_empty() && source_pending {
                // 消息中段的来源停顿。
                return Ok(FetchOutcome::Stall);
            }
            let opcode = if message.started {
                OpCode::Continuation
            } else if message.text {
                OpCode::Text
            } else {
                OpCode::Binary
            };
            message.started = true;
            let mut head = BytesMut::with_capacity(10);
            frame::encode_head(opcode, finished, total, &mut head);
            if self.dump {
                debug!(target: "flint::ws::dump", dir = "out", opcode = ?opcode, len = total, fin = finished, "frame");
            }
            conn.queue_write(WriteItem::Data(head.freeze()))?;
            for chunk in chunks {
                conn.queue_write(WriteItem::Data(chunk))?;
            }
            if finished {
                let message = self
                    .messages
                    .pop_front()
                    .expect("front message present after emit");
                message.promise.complete(());
            }
            return Ok(FetchOutcome::Emitted);
        }
        if let Some((code, reason)) = self.close_frame.take() {
            let mut body = BytesMut::with_capacity(2 + reason.len());
            body.put_u16(code);
            body.extend_from_slice(reason.as_bytes());
            self.emit_control(conn, OpCode::Close, body.freeze())?;
            self.close_sent = true;
            // 关闭帧之后排空到 0：既不发 TCP FIN 也不发 close-notify，
            // 应用层关闭帧即足够（RFC 6455）。
            self.flush_mark = 0;
            return Ok(FetchOutcome::CloseEmitted);
        }
        Ok(FetchOutcome::Stall)
    }

    /// 失败收尾：清空全部排队内容并使承诺失败。
    pub(crate) fn fail_all(&mut self, message: &str) {
        self.errored = true;
        self.ping = None;
        self.pong = None;
        self.close_frame = None;
        if let Some(promise) = self.close_done.take() {
            promise.fail(
                CoreError::new("flint.ws.outbound_failed", message.to_string())
                    .with_category(ErrorCategory::NonRetryable),
            );
        }
        for queued in self.messages.drain(..) {
            queued.promise.fail(
                CoreError::new("flint.ws.outbound_failed", message.to_string())
                    .with_category(ErrorCategory::NonRetryable),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BytesSource;
    use flint_transport_tcp::conn::ReadOutcome;
    use std::net::SocketAddr;
    use std::time::Duration;

    /// 捕获写队列的桩连接。
    struct MockConn {
        queued: Vec<WriteItem>,
    }

    impl MockConn {
        fn new() -> Self {
            Self { queued: Vec::new() }
        }

        /// 展平全部已排队数据字节。
        fn flattened(&self) -> Vec<u8> {
            let mut out = Vec::new();
            for item in &self.queued {
                if let WriteItem::Data(data) = item {
                    out.extend_from_slice(data);
                }
            }
            out
        }
    }

    impl Connection for MockConn {
        fn id(&self) -> u64 {
            0
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn read(&mut self) -> flint_core::error::Result<ReadOutcome> {
            Ok(ReadOutcome::Stall)
        }
        fn unread(&mut self, _data: Bytes) -> flint_core::error::Result<()> {
            Ok(())
        }
        fn queue_write(&mut self, item: WriteItem) -> flint_core::error::Result<u64> {
            self.queued.push(item);
            Ok(self.queued.len() as u64)
        }
        fn write(&mut self) -> flint_core::error::Result<u64> {
            Ok(0)
        }
        fn write_queue_size(&self) -> u64 {
            self.queued.len() as u64
        }
        fn await_readable(&self, _accepting: bool) -> Promise<()> {
            Promise::new()
        }
        fn await_writable(&self) -> Promise<()> {
            Promise::new()
        }
        fn close(&mut self, _drain_timeout: Duration) -> Promise<()> {
            let promise = Promise::new();
            promise.complete(());
            promise
        }
    }

    fn state() -> OutboundState {
        OutboundState::new(16 * 1024, ThroughputMeter::new(0, Duration::from_secs(1)), false)
    }

    fn message(payload: &'static [u8], text: bool) -> OutgoingMessage {
        OutgoingMessage {
            source: Box::new(BytesSource::new(Bytes::from_static(payload))),
            text,
            started: false,
            promise: Promise::new(),
        }
    }

    #[test]
    fn ping_and_pong_overtake_queued_messages() {
        let mut out = state();
        let mut conn = MockConn::new();
        out.messages.push_back(message(b"payload", true));
        out.ping = Some(Bytes::from_static(b"p1"));
        out.pong = Some(Bytes::from_static(b"p2"));

        out.fetch_frame(&mut conn, 1024).expect("fetch ping");
        out.fetch_frame(&mut conn, 1024).expect("fetch pong");
        let bytes = conn.flattened();
        assert_eq!(bytes[0], 0x89, "ping 帧先行");
        // ping 帧：head(2) + body(2)，随后是 pong 帧头。
        assert_eq!(bytes[4], 0x8A, "pong 帧随后");
    }

    #[test]
    fn small_message_is_single_fin_frame() {
        let mut out = state();
        let mut conn = MockConn::new();
        out.messages.push_back(message(b"hello", true));
        out.fetch_frame(&mut conn, 1024).expect("fetch message");
        let bytes = conn.flattened();
        assert_eq!(&bytes, &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert!(out.messages.is_empty(), "消息整体送出后出队");
    }

    #[test]
    fn oversized_message_fragments_with_continuations() {
        let mut out = state();
        let mut conn = MockConn::new();
        out.messages
            .push_back(message(&[0x42u8; 10], false));
        out.fetch_frame(&mut conn, 4).expect("first fragment");
        out.fetch_frame(&mut conn, 4).expect("second fragment");
        out.fetch_frame(&mut conn, 4).expect("third fragment");
        let bytes = conn.flattened();
        // 帧序列：binary FIN=0 len4，continuation FIN=0 len4，continuation FIN=1 len2。
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1], 0x04);
        assert_eq!(bytes[6], 0x00);
        assert_eq!(bytes[7], 0x04);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0x02);
    }

    #[test]
    fn empty_message_still_emits_fin_frame() {
        let mut out = state();
        let mut conn = MockConn::new();
        let msg = message(b"", true);
        let promise = msg.promise.clone();
        out.messages.push_back(msg);
        out.fetch_frame(&mut conn, 1024).expect("fetch empty message");
        assert_eq!(conn.flattened(), vec![0x81, 0x00]);
        assert!(promise.is_done(), "终帧入队即完成消息承诺");
    }

    #[test]
    fn close_frame_emits_code_and_reason_and_zeroes_flush_mark() {
        let mut out = state();
        let mut conn = MockConn::new();
        out.close_frame = Some((1000, "bye".to_string()));
        let outcome = out.fetch_frame(&mut conn, 1024).expect("fetch close");
        assert!(matches!(outcome, FetchOutcome::CloseEmitted));
        assert_eq!(out.flush_mark, 0);
        assert!(out.close_sent);
        let bytes = conn.flattened();
        assert_eq!(&bytes, &[0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']);
        // 关闭帧之后不再取帧。
        assert!(matches!(
            out.fetch_frame(&mut conn, 1024).expect("post-close fetch"),
            FetchOutcome::Stall
        ));
    }

    #[test]
    fn fail_all_rejects_queued_promises() {
        let mut out = state();
        let msg = message(b"doomed", false);
        let promise = msg.promise.clone();
        out.messages.push_back(msg);
        out.fail_all("write side poisoned");
        let err = promise
            .wait_timeout(Duration::from_millis(10))
            .expect_err("queued message must fail");
        assert!(err.message().contains("write side poisoned"));
        assert!(out.errored);
    }
}
