use crate::error::WsFault;
use crate::inbound::{InboundEvent, InboundState, ParsedItem};
use crate::meter::ThroughputMeter;
use crate::outbound::{FetchOutcome, OutboundState, OutgoingMessage, PumpState};
use crate::source::{ByteSource, BytesSource};
use bytes::Bytes;
use flint_core::error::CoreError;
use flint_core::promise::Promise;
use flint_reactor::selector::SelectorHandle;
use flint_transport_tcp::conn::{Connection, ReadOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// WebSocket 通道配置；默认值见各字段。
#[derive(Clone, Debug)]
pub struct WsConf {
    /// 入站暂存区上限；超出后解析器回退残留字节并暂停（默认 1 KiB）。
    pub inbound_buffer_size: usize,
    /// 出站冲刷阈值（默认 16 KiB）。
    pub outbound_buffer_size: usize,
    /// 单帧载荷上限（默认 16 KiB）。
    pub max_frame_payload: usize,
    /// 静默多久后主动 PING（默认 60 秒）。
    pub ping_interval: Duration,
    /// PING 之后等待入站字节的期限（默认 15 秒）。
    pub ping_pong_timeout: Duration,
    /// 入站吞吐率下限，字节/秒；0 关闭判定。
    pub inbound_floor: u64,
    /// 出站吞吐率下限，字节/秒；0 关闭判定。
    pub outbound_floor: u64,
    /// 吞吐率计量的单槽窗口（默认 1 秒）。
    pub throughput_window: Duration,
    /// 优雅关闭时的 TCP 读净化期限（默认 500 毫秒）。
    pub close_drain_timeout: Duration,
    /// 把帧头串行化到 `flint::ws::dump` 目标。
    pub dump_traffic: bool,
}

impl Default for WsConf {
    fn default() -> Self {
        Self {
            inbound_buffer_size: 1024,
            outbound_buffer_size: 16 * 1024,
            max_frame_payload: 16 * 1024,
            ping_interval: Duration::from_secs(60),
            ping_pong_timeout: Duration::from_secs(15),
            inbound_floor: 0,
            outbound_floor: 0,
            throughput_window: Duration::from_secs(1),
            close_drain_timeout: Duration::from_millis(500),
            dump_traffic: false,
        }
    }
}

/// WebSocket 通道：入站/出站两个泵加一份共享的关闭裁决。
///
/// # 教案级注释
///
/// ## 结构（What）
/// - 入站泵在选择器线程上解析帧、去掩码、聚合控制帧，把消息事件压入
///   有界暂存区；消费方经 [`WsChannel::read`] 逐事件取走，取走即
///   `pull`，暂存回落到上限之内时解析自动续跑；
/// - 出站泵按“错误/关闭 → ping → pong → 队首消息 → 关闭帧 → 停顿”的
///   优先级取帧，分片受单帧载荷上限约束，冲刷由阈值驱动；
/// - 两个泵最终各自投出一票 `close_tcp(graceful)`：两票齐备才真正关闭
///   TCP，优雅标志取与。
///
/// ## 线程模型（How）
/// - 两个泵只在所属选择器线程上运行；应用侧 API 可从任意线程调用，
///   只修改受锁状态并向选择器投递续跑任务；
/// - 锁序固定为 outbound → conn，inbound 与 conn 从不嵌套，规避死锁。
#[derive(Clone)]
pub struct WsChannel {
    shared: Arc<WsShared>,
}

struct WsShared {
    conf: WsConf,
    selector: SelectorHandle,
    conn: Mutex<Box<dyn Connection>>,
    inbound: Mutex<InboundState>,
    outbound: Mutex<OutboundState>,
    votes: Mutex<CloseVotes>,
    close_promise: Promise<()>,
    last_activity: Mutex<Instant>,
}

#[derive(Default)]
struct CloseVotes {
    inbound: Option<bool>,
    outbound: Option<bool>,
    executed: bool,
}

#[derive(Clone, Copy)]
enum Side {
    Inbound,
    Outbound,
}

impl WsChannel {
    /// 在已完成 HTTP 升级的连接上启动帧引擎。
    pub fn new(conn: Box<dyn Connection>, conf: WsConf, selector: SelectorHandle) -> Self {
        let inbound_meter = ThroughputMeter::new(conf.inbound_floor, conf.throughput_window);
        let outbound_meter = ThroughputMeter::new(conf.outbound_floor, conf.throughput_window);
        let outbound = OutboundState::new(conf.outbound_buffer_size, outbound_meter, conf.dump_traffic);
        let shared = Arc::new(WsShared {
            conf,
            selector: selector.clone(),
            conn: Mutex::new(conn),
            inbound: Mutex::new(InboundState::new(inbound_meter)),
            outbound: Mutex::new(outbound),
            votes: Mutex::new(CloseVotes::default()),
            close_promise: Promise::new(),
            last_activity: Mutex::new(Instant::now()),
        });
        let pump = Arc::clone(&shared);
        selector.submit(move || pump_inbound(pump));
        Self { shared }
    }

    /// 取下一个入站事件。
    ///
    /// 事件取走即触发暂存区的 `pull`：暂存字节回落到上限之内时解析器
    /// 自动恢复读取。
    pub fn read(&self) -> Promise<InboundEvent> {
        let promise: Promise<InboundEvent> = Promise::new();
        let mut immediate: Option<InboundEvent> = None;
        let mut resume = false;
        {
            let mut inbound = self.shared.inbound.lock();
            if let Some(err) = inbound.poison_error() {
                drop(inbound);
                promise.fail(err);
                return promise;
            }
            if let Some(event) = inbound.staged.pop_front() {
                inbound.staged_bytes -= event.staging_cost();
                track_delivery(&mut inbound, &event);
                if inbound.paused && inbound.staged_bytes <= self.shared.conf.inbound_buffer_size {
                    inbound.paused = false;
                    resume = true;
                }
                immediate = Some(event);
            } else if inbound.terminal {
                drop(inbound);
                promise.fail(WsFault::InboundEof.into());
                return promise;
            } else {
                if inbound.reader.is_some() {
                    drop(inbound);
                    promise.fail(CoreError::new(
                        "flint.ws.reader_conflict",
                        "pending read already exists",
                    ));
                    return promise;
                }
                if inbound.msg_in_flight {
                    inbound.meter.resume();
                }
                inbound.reader = Some(promise.clone());
            }
        }
        if let Some(event) = immediate {
            promise.complete(event);
        }
        if resume {
            let shared = Arc::clone(&self.shared);
            self.shared.selector.submit(move || pump_inbound(shared));
        }
        promise
    }

    /// 发送文本消息。
    pub fn write_text(&self, text: impl Into<String>) -> Promise<()> {
        self.write_message(Box::new(BytesSource::new(Bytes::from(text.into()))), true)
    }

    /// 发送二进制消息。
    pub fn write_binary(&self, data: Bytes) -> Promise<()> {
        self.write_message(Box::new(BytesSource::new(data)), false)
    }

    /// 以自定义字节来源发送消息；承诺在终帧入队后完成。
    pub fn write_message(&self, source: Box<dyn ByteSource>, text: bool) -> Promise<()> {
        let promise: Promise<()> = Promise::new();
        {
            let mut outbound = self.shared.outbound.lock();
            if outbound.errored || outbound.state == PumpState::Retired {
                drop(outbound);
                promise.fail(flint_core::error::closed("websocket outbound"));
                return promise;
            }
            if outbound.close_frame.is_some() || outbound.close_sent {
                drop(outbound);
                promise.fail(WsFault::CloseFrameQueued.into());
                return promise;
            }
            outbound.messages.push_back(OutgoingMessage {
                source,
                text,
                started: false,
                promise: promise.clone(),
            });
        }
        let weak = Arc::downgrade(&self.shared);
        let target = promise.clone();
        promise.set_cancel_hook(move || {
            if let Some(shared) = weak.upgrade() {
                cancel_message(&shared, &target);
            }
        });
        kick_outbound(&self.shared);
        promise
    }

    /// 发送关闭帧；承诺在关闭帧排空后完成。
    pub fn write_close(&self, code: u16, reason: impl Into<String>) -> Promise<()> {
        let promise: Promise<()> = Promise::new();
        {
            let mut outbound = self.shared.outbound.lock();
            if outbound.errored || outbound.state == PumpState::Retired {
                drop(outbound);
                promise.fail(flint_core::error::closed("websocket outbound"));
                return promise;
            }
            if outbound.close_frame.is_some() || outbound.close_sent {
                drop(outbound);
                promise.fail(WsFault::CloseFrameQueued.into());
                return promise;
            }
            outbound.close_frame = Some((code, reason.into()));
            outbound.close_done = Some(promise.clone());
        }
        kick_outbound(&self.shared);
        promise
    }

    /// 指示两个泵拆除；返回的承诺在 TCP 关闭动作完成后兑现。
    pub fn close(&self) -> Promise<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.selector.submit(move || teardown(shared));
        self.shared.close_promise.clone()
    }
}

fn track_delivery(inbound: &mut InboundState, event: &InboundEvent) {
    match event {
        InboundEvent::TextStart | InboundEvent::BinaryStart => {
            inbound.msg_in_flight = true;
        }
        InboundEvent::End | InboundEvent::Close { .. } | InboundEvent::Fin => {
            inbound.msg_in_flight = false;
            inbound.meter.pause();
        }
        InboundEvent::Body(_) => {}
    }
}

// ─── 入站泵 ──────────────────────────────────────────────────────

fn pump_inbound(shared: Arc<WsShared>) {
    loop {
        {
            let mut inbound = shared.inbound.lock();
            if inbound.terminal || inbound.poisoned.is_some() || inbound.paused {
                return;
            }
            if inbound.staged_bytes > shared.conf.inbound_buffer_size {
                inbound.paused = true;
                return;
            }
        }
        let outcome = shared.conn.lock().read();
        match outcome {
            Ok(ReadOutcome::Data(data)) => {
                *shared.last_activity.lock() = Instant::now();
                shared.inbound.lock().cancel_liveness_timers();
                match ingest(&shared, data) {
                    Ok(()) => {
                        deliver(&shared);
                        let terminal = shared.inbound.lock().terminal;
                        if terminal {
                            close_tcp(&shared, Side::Inbound, true);
                            return;
                        }
                    }
                    Err(fault) => {
                        poison_inbound(&shared, CoreError::from(fault));
                        return;
                    }
                }
            }
            Ok(ReadOutcome::Stall) => {
                arm_idle(&shared);
                return;
            }
            Ok(ReadOutcome::Fin) | Ok(ReadOutcome::CloseNotify) => {
                {
                    let mut inbound = shared.inbound.lock();
                    inbound.terminal = true;
                    inbound.cancel_liveness_timers();
                    inbound.stage(InboundEvent::Fin);
                }
                deliver(&shared);
                close_tcp(&shared, Side::Inbound, true);
                return;
            }
            Err(err) => {
                poison_inbound(&shared, err);
                return;
            }
        }
    }
}

/// 把一段线上字节喂给解析器并落入暂存区。
///
/// 暂存超限时把残留字节回退给连接并暂停；ping 的应答体越过本函数直接
/// 写入出站单槽。
fn ingest(shared: &Arc<WsShared>, data: Bytes) -> Result<(), WsFault> {
    let mut pongs: Vec<Bytes> = Vec::new();
    let mut residual: Option<Bytes> = None;
    {
        let mut inbound = shared.inbound.lock();
        let mut data = data;
        loop {
            if inbound.staged_bytes > shared.conf.inbound_buffer_size && !data.is_empty() {
                inbound.paused = true;
                residual = Some(data);
                break;
            }
            match inbound.parser.next(&mut data)? {
                Some(ParsedItem::MessageStart { text }) => {
                    let event = if text {
                        InboundEvent::TextStart
                    } else {
                        InboundEvent::BinaryStart
                    };
                    dump_in(shared, "message-start", 0);
                    inbound.stage(event);
                }
                Some(ParsedItem::MessageBody(body)) => {
                    if !inbound.meter.report_bytes(body.len() as u64) {
                        return Err(WsFault::InboundThroughputTooLow);
                    }
                    dump_in(shared, "body", body.len());
                    inbound.stage(InboundEvent::Body(body));
                }
                Some(ParsedItem::MessageEnd) => {
                    dump_in(shared, "message-end", 0);
                    inbound.stage(InboundEvent::End);
                }
                Some(ParsedItem::Ping(body)) => {
                    dump_in(shared, "ping", body.len());
                    pongs.push(body);
                }
                Some(ParsedItem::Pong(body)) => {
                    // PONG 仅作为活性信号，内容丢弃。
                    dump_in(shared, "pong", body.len());
                }
                Some(ParsedItem::Close { code, reason }) => {
                    dump_in(shared, "close", reason.len() + 2);
                    inbound.stage(InboundEvent::Close { code, reason });
                    inbound.terminal = true;
                    if !data.is_empty() {
                        residual = Some(data);
                    }
                    break;
                }
                None => break,
            }
        }
    }
    if let Some(residual) = residual {
        let _ = shared.conn.lock().unread(residual);
    }
    if let Some(body) = pongs.pop() {
        // 到达覆盖：只保留最新的 ping 应答。
        {
            shared.outbound.lock().pong = Some(body);
        }
        kick_outbound(shared);
    }
    Ok(())
}

fn dump_in(shared: &Arc<WsShared>, kind: &'static str, len: usize) {
    if shared.conf.dump_traffic {
        debug!(target: "flint::ws::dump", dir = "in", kind, len, "frame event");
    }
}

/// 把暂存事件交付给未决的读承诺。
fn deliver(shared: &Arc<WsShared>) {
    loop {
        let (promise, event, resume) = {
            let mut inbound = shared.inbound.lock();
            if inbound.reader.is_none() || inbound.staged.is_empty() {
                return;
            }
            let promise = inbound.reader.take().expect("reader checked above");
            let event = inbound.staged.pop_front().expect("staged checked above");
            inbound.staged_bytes -= event.staging_cost();
            track_delivery(&mut inbound, &event);
            let resume =
                inbound.paused && inbound.staged_bytes <= shared.conf.inbound_buffer_size;
            if resume {
                inbound.paused = false;
            }
            (promise, event, resume)
        };
        promise.complete(event);
        if resume {
            let pump = Arc::clone(shared);
            shared.selector.submit(move || pump_inbound(pump));
        }
    }
}

/// 空闲路径：静默到点则主动 PING，否则挂空闲检查定时器，然后等待
/// 下一次可读。等待与定时器并行：任何入站字节取消定时器。
fn arm_idle(shared: &Arc<WsShared>) {
    let quiet = shared.last_activity.lock().elapsed();
    if quiet >= shared.conf.ping_interval {
        stage_ping(shared);
    } else {
        let remaining = shared.conf.ping_interval - quiet;
        let mut inbound = shared.inbound.lock();
        if !inbound.ping_outstanding && inbound.idle_timer.is_none() {
            let weak = Arc::downgrade(shared);
            inbound.idle_timer =
                Some(shared.selector.services().timer().schedule(remaining, move || {
                    if let Some(shared) = weak.upgrade() {
                        let task = Arc::clone(&shared);
                        shared.selector.submit(move || idle_check(task));
                    }
                }));
        }
    }
    let waiter = shared.conn.lock().await_readable(false);
    let resume = Arc::clone(shared);
    waiter.on_complete(move |result| match result {
        Ok(()) => pump_inbound(resume),
        Err(err) => poison_inbound(&resume, err),
    });
}

/// 空闲检查（选择器线程）：静默到点则 PING，否则按剩余时间重挂。
fn idle_check(shared: Arc<WsShared>) {
    {
        let mut inbound = shared.inbound.lock();
        inbound.idle_timer = None;
        if inbound.terminal || inbound.poisoned.is_some() || inbound.ping_outstanding {
            return;
        }
    }
    let quiet = shared.last_activity.lock().elapsed();
    if quiet >= shared.conf.ping_interval {
        stage_ping(&shared);
    } else {
        let remaining = shared.conf.ping_interval - quiet;
        let mut inbound = shared.inbound.lock();
        let weak = Arc::downgrade(&shared);
        inbound.idle_timer =
            Some(shared.selector.services().timer().schedule(remaining, move || {
                if let Some(shared) = weak.upgrade() {
                    let task = Arc::clone(&shared);
                    shared.selector.submit(move || idle_check(task));
                }
            }));
    }
}

/// 发出活性 PING 并武装判死定时器。
fn stage_ping(shared: &Arc<WsShared>) {
    {
        let mut inbound = shared.inbound.lock();
        if inbound.ping_outstanding || inbound.terminal || inbound.poisoned.is_some() {
            return;
        }
        inbound.ping_outstanding = true;
        let weak = Arc::downgrade(shared);
        inbound.ping_timer = Some(shared.selector.services().timer().schedule(
            shared.conf.ping_pong_timeout,
            move || {
                if let Some(shared) = weak.upgrade() {
                    let task = Arc::clone(&shared);
                    shared.selector.submit(move || on_pong_timeout(task));
                }
            },
        ));
    }
    {
        shared.outbound.lock().ping = Some(Bytes::new());
    }
    kick_outbound(shared);
}

fn on_pong_timeout(shared: Arc<WsShared>) {
    let still_waiting = {
        let inbound = shared.inbound.lock();
        inbound.ping_outstanding && !inbound.terminal && inbound.poisoned.is_none()
    };
    if still_waiting {
        poison_inbound(&shared, CoreError::from(WsFault::PongTimeout));
    }
}

/// 入站侧中毒：读承诺失败、双向投出非优雅关闭票。
fn poison_inbound(shared: &Arc<WsShared>, err: CoreError) {
    let reader = {
        let mut inbound = shared.inbound.lock();
        if inbound.poisoned.is_some() || inbound.terminal {
            // 拆除路径上的重复故障不再级联。
            inbound.reader.take()
        } else {
            inbound.cancel_liveness_timers();
            inbound.poisoned = Some((err.code(), err.message().to_string()));
            inbound.reader.take()
        }
    };
    if let Some(reader) = reader {
        reader.fail(err);
    }
    {
        let mut outbound = shared.outbound.lock();
        if !outbound.errored && outbound.state != PumpState::Retired {
            outbound.fail_all("websocket channel poisoned");
            outbound.state = PumpState::Retired;
        }
    }
    close_tcp(shared, Side::Outbound, false);
    close_tcp(shared, Side::Inbound, false);
}

// ─── 出站泵 ──────────────────────────────────────────────────────

fn kick_outbound(shared: &Arc<WsShared>) {
    let run = {
        let mut outbound = shared.outbound.lock();
        match outbound.state {
            PumpState::AwaitingFrame => {
                outbound.state = PumpState::Running;
                outbound.meter.resume();
                true
            }
            _ => false,
        }
    };
    if run {
        let pump = Arc::clone(shared);
        shared.selector.submit(move || pump_outbound(pump));
    }
}

enum OutboundAction {
    Loop,
    Idle,
    RetireGraceful,
    AwaitWritable(Promise<()>),
    Abort(String),
}

fn pump_outbound(shared: Arc<WsShared>) {
    loop {
        match outbound_step(&shared) {
            OutboundAction::Loop => continue,
            OutboundAction::Idle => return,
            OutboundAction::RetireGraceful => {
                close_tcp(&shared, Side::Outbound, true);
                return;
            }
            OutboundAction::Abort(message) => {
                abort_outbound(&shared, &message);
                return;
            }
            OutboundAction::AwaitWritable(waiter) => {
                let resume = Arc::clone(&shared);
                waiter.on_complete(move |result| match result {
                    Ok(()) => {
                        {
                            let mut outbound = resume.outbound.lock();
                            if outbound.state == PumpState::AwaitingWritable {
                                outbound.state = PumpState::Running;
                            }
                        }
                        pump_outbound(resume);
                    }
                    Err(_) => abort_outbound(&resume, "connection closed while awaiting writability"),
                });
                return;
            }
        }
    }
}

/// 出站泵的单步：在锁内推进一次，动作在锁外执行。
fn outbound_step(shared: &Arc<WsShared>) -> OutboundAction {
    let mut outbound = shared.outbound.lock();
    if outbound.state == PumpState::Retired {
        return OutboundAction::Idle;
    }
    outbound.state = PumpState::Running;
    let mut conn = shared.conn.lock();

    // 1. 写队列超过冲刷阈值：先冲刷。
    if conn.write_queue_size() as usize > outbound.flush_mark {
        match conn.write() {
            Ok(flushed) => {
                if flushed > 0 {
                    *shared.last_activity.lock() = Instant::now();
                    if !outbound.meter.report_bytes(flushed) {
                        return OutboundAction::Abort(
                            WsFault::OutboundThroughputTooLow.to_string(),
                        );
                    }
                }
                if conn.write_queue_size() as usize > outbound.flush_mark {
                    outbound.state = PumpState::AwaitingWritable;
                    return OutboundAction::AwaitWritable(conn.await_writable());
                }
                return OutboundAction::Loop;
            }
            Err(err) => return OutboundAction::Abort(err.message().to_string()),
        }
    }

    // 2. 取下一帧。
    let max_payload = shared
        .conf
        .max_frame_payload
        .min(shared.conf.outbound_buffer_size)
        .max(1);
    match outbound.fetch_frame(&mut **conn, max_payload) {
        Ok(FetchOutcome::Emitted) | Ok(FetchOutcome::CloseEmitted) => OutboundAction::Loop,
        Ok(FetchOutcome::Stall) => {
            if conn.write_queue_size() > 0 {
                // 取帧停顿但仍有排队字节：冲刷后再停。
                match conn.write() {
                    Ok(flushed) => {
                        if flushed > 0 {
                            *shared.last_activity.lock() = Instant::now();
                            if !outbound.meter.report_bytes(flushed) {
                                return OutboundAction::Abort(
                                    WsFault::OutboundThroughputTooLow.to_string(),
                                );
                            }
                        }
                    }
                    Err(err) => return OutboundAction::Abort(err.message().to_string()),
                }
                if conn.write_queue_size() > 0 {
                    outbound.state = PumpState::AwaitingWritable;
                    return OutboundAction::AwaitWritable(conn.await_writable());
                }
            }
            if outbound.close_sent {
                // 关闭帧已排空：优雅退场。既不发 TCP FIN 也不发
                // close-notify（RFC 6455 的应用层关闭帧已足够）。
                outbound.state = PumpState::Retired;
                if let Some(promise) = outbound.close_done.take() {
                    promise.complete(());
                }
                return OutboundAction::RetireGraceful;
            }
            outbound.state = PumpState::AwaitingFrame;
            outbound.meter.pause();
            OutboundAction::Idle
        }
        Err(err) => OutboundAction::Abort(err.message().to_string()),
    }
}

fn abort_outbound(shared: &Arc<WsShared>, message: &str) {
    {
        let mut outbound = shared.outbound.lock();
        if outbound.state != PumpState::Retired {
            outbound.fail_all(message);
            outbound.state = PumpState::Retired;
        }
    }
    close_tcp(shared, Side::Outbound, false);
}

/// 取消某条排队消息。
///
/// 尚未开始序列化的消息可被干净移除；已部分序列化的消息导致出站侧
/// 进入错误态，上层必须关闭通道。
fn cancel_message(shared: &Arc<WsShared>, target: &Promise<()>) {
    let mut outbound = shared.outbound.lock();
    let Some(index) = outbound
        .messages
        .iter()
        .position(|message| message.promise.ptr_eq(target))
    else {
        return;
    };
    let started = outbound.messages[index].started;
    outbound.messages.remove(index);
    if started {
        outbound.errored = true;
    }
}

// ─── 两方关闭裁决 ────────────────────────────────────────────────

fn teardown(shared: Arc<WsShared>) {
    let outbound_vote = {
        let mut outbound = shared.outbound.lock();
        if outbound.state == PumpState::Retired {
            None
        } else {
            let pending = !outbound.messages.is_empty();
            let graceful = !outbound.errored && !pending;
            if pending || outbound.errored {
                outbound.fail_all("websocket channel closed");
            }
            outbound.state = PumpState::Retired;
            Some(graceful)
        }
    };
    if let Some(graceful) = outbound_vote {
        close_tcp(&shared, Side::Outbound, graceful);
    }
    let inbound_vote = {
        let mut inbound = shared.inbound.lock();
        inbound.cancel_liveness_timers();
        if inbound.terminal || inbound.poisoned.is_some() {
            None
        } else {
            inbound.terminal = true;
            let reader = inbound.reader.take();
            drop(inbound);
            if let Some(reader) = reader {
                reader.fail(flint_core::error::closed("websocket channel"));
            }
            Some(true)
        }
    };
    if let Some(graceful) = inbound_vote {
        close_tcp(&shared, Side::Inbound, graceful);
    }
}

/// 单侧投票；两票齐备后以“优雅标志取与”的结果关闭 TCP 连接。
fn close_tcp(shared: &Arc<WsShared>, side: Side, graceful: bool) {
    let decision = {
        let mut votes = shared.votes.lock();
        match side {
            Side::Inbound => {
                votes.inbound.get_or_insert(graceful);
            }
            Side::Outbound => {
                votes.outbound.get_or_insert(graceful);
            }
        }
        match (votes.inbound, votes.outbound, votes.executed) {
            (Some(inbound), Some(outbound), false) => {
                votes.executed = true;
                Some(inbound && outbound)
            }
            _ => None,
        }
    };
    if let Some(graceful) = decision {
        let drain = if graceful {
            shared.conf.close_drain_timeout
        } else {
            Duration::ZERO
        };
        let done = shared.conn.lock().close(drain);
        let promise = shared.close_promise.clone();
        done.on_complete(move |_| {
            promise.complete(());
        });
    }
}
