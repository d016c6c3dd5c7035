//! 运行指标
//!
//! 原子计数器，IO 线程用 `Ordering::Relaxed` 更新，任何线程都可以读取快照，不引入锁竞争。

use crate::line::LineStats;
use canbridge_filter::LookupResult;
use canbridge_protocol::DecodeError;
use std::sync::atomic::{AtomicU64, Ordering};

/// 单个输出队列的指标
///
/// ```rust
/// use canbridge_driver::QueueMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = QueueMetrics::default();
/// metrics.pushed.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().pushed, 1);
/// ```
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// 成功入队的条目数
    pub pushed: AtomicU64,
    /// 成功交给 sink 的条目数
    pub delivered: AtomicU64,
    /// DropOldest 策略下被挤掉的最旧条目数
    pub dropped_oldest: AtomicU64,
    /// Reject 策略下被拒绝的条目数
    pub rejected: AtomicU64,
    /// sink 发送失败次数（每次尝试计一次）
    pub send_failures: AtomicU64,
    /// 重试次数
    pub send_retries: AtomicU64,
    /// 重试用尽或致命错误后放弃的条目数
    pub abandoned: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// 队列指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub pushed: u64,
    pub delivered: u64,
    pub dropped_oldest: u64,
    pub rejected: u64,
    pub send_failures: u64,
    pub send_retries: u64,
    pub abandoned: u64,
}

impl QueueMetricsSnapshot {
    /// 已入队但尚未交付（也未放弃）的条目数
    pub fn pending(&self) -> u64 {
        self.pushed
            .saturating_sub(self.delivered + self.abandoned + self.dropped_oldest)
    }
}

/// 一条链路（总线或 TCP 连接）的收发、解码和过滤指标
#[derive(Debug, Default)]
pub struct LinkMetrics {
    /// 从总线读到的帧
    pub rx_frames: AtomicU64,
    /// 写到总线的帧
    pub tx_frames: AtomicU64,

    /// 行提取器输出的完整行
    pub lines: AtomicU64,
    /// ring buffer 溢出次数
    pub ring_overruns: AtomicU64,
    /// 因溢出丢弃的字节数
    pub dropped_bytes: AtomicU64,
    /// 超长行（未见换行符）丢弃次数
    pub overlength_lines: AtomicU64,

    pub decode_too_long: AtomicU64,
    pub decode_too_short: AtomicU64,
    pub decode_illegal_hex: AtomicU64,
    pub decode_illegal_id: AtomicU64,
    pub decode_illegal_dlc: AtomicU64,
    pub decode_checksum: AtomicU64,
    pub encode_errors: AtomicU64,

    /// 过滤：原样转发
    pub passed: AtomicU64,
    /// 过滤：替换 ID 后转发
    pub translated: AtomicU64,
    /// 过滤：阻止
    pub blocked: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decode_error(&self, err: &DecodeError) {
        let counter = match err {
            DecodeError::TooLong { .. } => &self.decode_too_long,
            DecodeError::TooShort { .. } => &self.decode_too_short,
            DecodeError::IllegalHex { .. } => &self.decode_illegal_hex,
            DecodeError::IllegalId { .. } => &self.decode_illegal_id,
            DecodeError::IllegalDlc { .. } => &self.decode_illegal_dlc,
            DecodeError::ChecksumMismatch { .. } => &self.decode_checksum,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self, result: &LookupResult) {
        let counter = match result {
            LookupResult::Block => &self.blocked,
            LookupResult::Pass => &self.passed,
            LookupResult::PassTranslated(_) => &self.translated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 累加行提取器的增量计数
    pub fn add_line_stats(&self, delta: &LineStats) {
        self.lines.fetch_add(delta.lines, Ordering::Relaxed);
        self.ring_overruns
            .fetch_add(delta.ring_overruns, Ordering::Relaxed);
        self.dropped_bytes
            .fetch_add(delta.dropped_bytes, Ordering::Relaxed);
        self.overlength_lines
            .fetch_add(delta.overlength_lines, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            ring_overruns: self.ring_overruns.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            overlength_lines: self.overlength_lines.load(Ordering::Relaxed),
            decode_too_long: self.decode_too_long.load(Ordering::Relaxed),
            decode_too_short: self.decode_too_short.load(Ordering::Relaxed),
            decode_illegal_hex: self.decode_illegal_hex.load(Ordering::Relaxed),
            decode_illegal_id: self.decode_illegal_id.load(Ordering::Relaxed),
            decode_illegal_dlc: self.decode_illegal_dlc.load(Ordering::Relaxed),
            decode_checksum: self.decode_checksum.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            translated: self.translated.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

/// 链路指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkMetricsSnapshot {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub lines: u64,
    pub ring_overruns: u64,
    pub dropped_bytes: u64,
    pub overlength_lines: u64,
    pub decode_too_long: u64,
    pub decode_too_short: u64,
    pub decode_illegal_hex: u64,
    pub decode_illegal_id: u64,
    pub decode_illegal_dlc: u64,
    pub decode_checksum: u64,
    pub encode_errors: u64,
    pub passed: u64,
    pub translated: u64,
    pub blocked: u64,
}

impl LinkMetricsSnapshot {
    /// 所有类型的解码错误之和
    pub fn decode_errors(&self) -> u64 {
        self.decode_too_long
            + self.decode_too_short
            + self.decode_illegal_hex
            + self.decode_illegal_id
            + self.decode_illegal_dlc
            + self.decode_checksum
    }
}
