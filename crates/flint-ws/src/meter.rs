use std::time::{Duration, Instant};

/// 双槽吞吐率计量器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 识别“涓滴式”对端：以极低速率收发以长期占用连接的客户端应被判定
///   为故障而非正常慢速；
/// - 只保留当前与上一窗口两个槽位，常数内存即可得到滚动速率。
///
/// ## 逻辑（How）
/// - `report_bytes` 把字节计入当前槽；当前槽运行时长超过窗口即轮换；
/// - 时钟可暂停/恢复：泵在无帧可取时暂停计时，避免把空闲算成低速；
/// - 仅当窗口“满”（发生过一次轮换）后才执行下限判定，给慢启动留出
///   余量。
///
/// ## 契约（What）
/// - `floor` 为 0 时判定关闭，`report_bytes` 恒真；
/// - 返回 `false` 表示滚动速率低于下限，调用方应当污染通道。
#[derive(Debug)]
pub struct ThroughputMeter {
    floor: u64,
    window: Duration,
    prev_bytes: u64,
    prev_elapsed: Duration,
    cur_bytes: u64,
    cur_accum: Duration,
    cur_started: Option<Instant>,
    full: bool,
}

impl ThroughputMeter {
    /// `floor` 单位为字节/秒；`window` 为单槽时长。
    pub fn new(floor: u64, window: Duration) -> Self {
        Self {
            floor,
            window,
            prev_bytes: 0,
            prev_elapsed: Duration::ZERO,
            cur_bytes: 0,
            cur_accum: Duration::ZERO,
            cur_started: None,
            full: false,
        }
    }

    /// 启动/恢复时钟；已在运行时为空操作。
    pub fn resume(&mut self) {
        if self.cur_started.is_none() {
            self.cur_started = Some(Instant::now());
        }
    }

    /// 暂停时钟，把已运行时长折入当前槽。
    pub fn pause(&mut self) {
        if let Some(started) = self.cur_started.take() {
            self.cur_accum += started.elapsed();
        }
    }

    fn cur_elapsed(&self) -> Duration {
        match self.cur_started {
            Some(started) => self.cur_accum + started.elapsed(),
            None => self.cur_accum,
        }
    }

    /// 计入 `count` 字节；返回 `false` 表示滚动速率低于下限。
    pub fn report_bytes(&mut self, count: u64) -> bool {
        if self.floor == 0 {
            return true;
        }
        self.resume();
        self.cur_bytes += count;
        let elapsed = self.cur_elapsed();
        if elapsed >= self.window {
            self.prev_bytes = self.cur_bytes;
            self.prev_elapsed = elapsed;
            self.cur_bytes = 0;
            self.cur_accum = Duration::ZERO;
            self.cur_started = Some(Instant::now());
            self.full = true;
        }
        if !self.full {
            return true;
        }
        let total_bytes = self.prev_bytes + self.cur_bytes;
        let total_elapsed = self.prev_elapsed + self.cur_elapsed();
        if total_elapsed.is_zero() {
            return true;
        }
        let rate = total_bytes as f64 / total_elapsed.as_secs_f64();
        rate >= self.floor as f64
    }
}
