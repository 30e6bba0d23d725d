use crate::error::WsFault;
use crate::frame::OpCode;
use crate::mask::unmask;
use crate::meter::ThroughputMeter;
use bytes::{Buf, Bytes, BytesMut};
use flint_core::error::CoreError;
use flint_core::promise::Promise;
use flint_core::timer::TimerKey;
use std::collections::VecDeque;

/// 暂存区里每个非 Body 事件的记账开销：小消息洪泛同样受限。
pub(crate) const EVENT_OVERHEAD: usize = 16;

/// 交付给消费方的入站事件流。
///
/// 一条消息表现为 `TextStart`/`BinaryStart`、零或多段 `Body`、一个
/// `End`；对端的关闭帧或 TCP FIN 以终结事件收尾。
#[derive(Debug)]
pub enum InboundEvent {
    TextStart,
    BinaryStart,
    Body(Bytes),
    End,
    Close { code: u16, reason: String },
    Fin,
}

impl InboundEvent {
    /// 暂存记账的字节成本。
    pub(crate) fn staging_cost(&self) -> usize {
        match self {
            InboundEvent::Body(data) => data.len(),
            _ => EVENT_OVERHEAD,
        }
    }
}

/// 解析器吐出的中间产物；控制帧在此层完成聚合。
#[derive(Debug)]
pub(crate) enum ParsedItem {
    MessageStart { text: bool },
    MessageBody(Bytes),
    MessageEnd,
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ParseState {
    Head0,
    Head1,
    HeadX,
    Body,
}

/// RFC 6455 服务端帧解析器。
///
/// # 教案级注释
///
/// ## 状态机（How）
/// - `Head0`：FIN/RSV/操作码检查，消息接续合法性检查；
/// - `Head1`：MASK 位必须为 1（客户端帧），7 位长度与扩展长度档位；
/// - `HeadX`：聚齐扩展长度（0/2/8 字节）与 4 字节掩码键，拒绝非最小
///   编码与符号位为 1 的 64 位长度；
/// - `Body`：按帧内游标逐段去掩码；控制帧聚合成整体后派发。
///
/// ## 契约（What）
/// - `next` 在无完整产物时返回 `Ok(None)` 并消费尽可能多的输入；
/// - 协议违规返回 [`WsFault`]，解析器就此作废；
/// - 不校验文本消息的 UTF-8 有效性（交由消费方决断），关闭帧理由除外。
pub(crate) struct FrameParser {
    state: ParseState,
    pending: VecDeque<ParsedItem>,
    head: [u8; 12],
    head_len: usize,
    head_need: usize,
    frame_fin: bool,
    opcode: OpCode,
    len7: u8,
    mask: [u8; 4],
    body_len: u64,
    body_cursor: u64,
    msg_open: bool,
    control_buf: BytesMut,
}

impl FrameParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Head0,
            pending: VecDeque::new(),
            head: [0; 12],
            head_len: 0,
            head_need: 0,
            frame_fin: false,
            opcode: OpCode::Continuation,
            len7: 0,
            mask: [0; 4],
            body_len: 0,
            body_cursor: 0,
            msg_open: false,
            control_buf: BytesMut::new(),
        }
    }

    /// 取下一个解析产物；`data` 耗尽且无完整产物时返回 `Ok(None)`。
    pub(crate) fn next(&mut self, data: &mut Bytes) -> Result<Option<ParsedItem>, WsFault> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            match self.state {
                ParseState::Head0 => {
                    if data.is_empty() {
                        return Ok(None);
                    }
                    let byte = data.get_u8();
                    if byte & 0x70 != 0 {
                        return Err(WsFault::NonZeroRsv);
                    }
                    let opcode =
                        OpCode::from_u8(byte & 0x0F).ok_or(WsFault::UnknownOpCode)?;
                    let fin = byte & 0x80 != 0;
                    if opcode.is_control() && !fin {
                        return Err(WsFault::FragmentedControlFrame);
                    }
                    match opcode {
                        OpCode::Continuation if !self.msg_open => {
                            return Err(WsFault::StrayContinuation);
                        }
                        OpCode::Text | OpCode::Binary if self.msg_open => {
                            return Err(WsFault::MessageNotFinished);
                        }
                        _ => {}
                    }
                    self.frame_fin = fin;
                    self.opcode = opcode;
                    self.state = ParseState::Head1;
                }
                ParseState::Head1 => {
                    if data.is_empty() {
                        return Ok(None);
                    }
                    let byte = data.get_u8();
                    if byte & 0x80 == 0 {
                        return Err(WsFault::UnmaskedClientFrame);
                    }
                    let len7 = byte & 0x7F;
                    if self.opcode.is_control() && len7 > 125 {
                        return Err(WsFault::OversizedControlFrame);
                    }
                    let ext = match len7 {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    self.len7 = len7;
                    self.head_len = 0;
                    self.head_need = ext + 4;
                    self.state = ParseState::HeadX;
                }
                ParseState::HeadX => {
                    let take = (self.head_need - self.head_len).min(data.len());
                    self.head[self.head_len..self.head_len + take]
                        .copy_from_slice(&data[..take]);
                    data.advance(take);
                    self.head_len += take;
                    if self.head_len < self.head_need {
                        return Ok(None);
                    }
                    let ext = self.head_need - 4;
                    self.body_len = match ext {
                        0 => u64::from(self.len7),
                        2 => {
                            let len =
                                u64::from(u16::from_be_bytes([self.head[0], self.head[1]]));
                            if len < 126 {
                                return Err(WsFault::NonMinimalLength);
                            }
                            len
                        }
                        _ => {
                            let len = u64::from_be_bytes(
                                self.head[..8].try_into().expect("8 字节扩展长度"),
                            );
                            if len & (1 << 63) != 0 {
                                return Err(WsFault::NegativeLength);
                            }
                            if len <= u64::from(u16::MAX) {
                                return Err(WsFault::NonMinimalLength);
                            }
                            len
                        }
                    };
                    self.mask
                        .copy_from_slice(&self.head[ext..ext + 4]);
                    self.body_cursor = 0;
                    if self.opcode.is_control() {
                        self.control_buf.clear();
                    } else if self.opcode != OpCode::Continuation {
                        self.msg_open = true;
                        self.pending.push_back(ParsedItem::MessageStart {
                            text: self.opcode == OpCode::Text,
                        });
                    }
                    if self.body_len == 0 {
                        self.finish_frame()?;
                        self.state = ParseState::Head0;
                    } else {
                        self.state = ParseState::Body;
                    }
                }
                ParseState::Body => {
                    if data.is_empty() {
                        return Ok(None);
                    }
                    let left = self.body_len - self.body_cursor;
                    let take = (data.len() as u64).min(left) as usize;
                    let mut chunk = BytesMut::from(&data[..take]);
                    data.advance(take);
                    unmask(&mut chunk, self.mask, self.body_cursor);
                    self.body_cursor += take as u64;
                    let frame_done = self.body_cursor == self.body_len;
                    if self.opcode.is_control() {
                        self.control_buf.extend_from_slice(&chunk);
                    } else {
                        self.pending
                            .push_back(ParsedItem::MessageBody(chunk.freeze()));
                    }
                    if frame_done {
                        self.finish_frame()?;
                        self.state = ParseState::Head0;
                    }
                }
            }
        }
    }

    fn finish_frame(&mut self) -> Result<(), WsFault> {
        match self.opcode {
            OpCode::Ping => {
                let body = self.control_buf.split().freeze();
                self.pending.push_back(ParsedItem::Ping(body));
            }
            OpCode::Pong => {
                let body = self.control_buf.split().freeze();
                self.pending.push_back(ParsedItem::Pong(body));
            }
            OpCode::Close => {
                let body = self.control_buf.split().freeze();
                let (code, reason) = if body.len() >= 2 {
                    // 消息正文的 UTF-8 校验留给消费方，关闭理由则在此落实。
                    let reason = std::str::from_utf8(&body[2..])
                        .map_err(|_| WsFault::InvalidCloseReason)?
                        .to_owned();
                    (u16::from_be_bytes([body[0], body[1]]), reason)
                } else {
                    // 无状态码的关闭帧按 RFC 6455 记作 1005。
                    (1005, String::new())
                };
                self.pending.push_back(ParsedItem::Close { code, reason });
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if self.frame_fin {
                    self.msg_open = false;
                    self.pending.push_back(ParsedItem::MessageEnd);
                }
            }
        }
        Ok(())
    }
}

/// 入站侧的可变状态：解析器、暂存区、读承诺与活性簿记。
pub(crate) struct InboundState {
    pub(crate) parser: FrameParser,
    pub(crate) staged: VecDeque<InboundEvent>,
    pub(crate) staged_bytes: usize,
    pub(crate) paused: bool,
    pub(crate) terminal: bool,
    pub(crate) poisoned: Option<(&'static str, String)>,
    pub(crate) reader: Option<Promise<InboundEvent>>,
    pub(crate) ping_outstanding: bool,
    pub(crate) ping_timer: Option<TimerKey>,
    pub(crate) idle_timer: Option<TimerKey>,
    pub(crate) meter: ThroughputMeter,
    pub(crate) msg_in_flight: bool,
}

impl InboundState {
    pub(crate) fn new(meter: ThroughputMeter) -> Self {
        Self {
            parser: FrameParser::new(),
            staged: VecDeque::new(),
            staged_bytes: 0,
            paused: false,
            terminal: false,
            poisoned: None,
            reader: None,
            ping_outstanding: false,
            ping_timer: None,
            idle_timer: None,
            meter,
            msg_in_flight: false,
        }
    }

    pub(crate) fn stage(&mut self, event: InboundEvent) {
        self.staged_bytes += event.staging_cost();
        self.staged.push_back(event);
    }

    pub(crate) fn poison_error(&self) -> Option<CoreError> {
        self.poisoned.as_ref().map(|(code, message)| {
            CoreError::new(code, message.clone())
                .with_category(flint_core::error::ErrorCategory::ProtocolViolation)
        })
    }

    /// 任何入站字节都取消在途的 PING 判死与空闲检查。
    pub(crate) fn cancel_liveness_timers(&mut self) {
        self.ping_outstanding = false;
        if let Some(timer) = self.ping_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }
}
