//! 字节流分行
//!
//! TCP 读到的字节块先写入环形缓冲区，再逐字节拼装成以 `\n` 结尾的行。
//! 读取边界可以落在行内任意位置，游标在调用之间保持。
//!
//! 超长行整行丢弃：计数后跳过到下一个 `\n`，超长行的尾部不会被当成一行新数据。

/// 行提取器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineExtractorConfig {
    /// 环形缓冲区容量（字节），实际可存 `ring_capacity - 1` 字节
    pub ring_capacity: usize,
    /// 单行最大长度（含 `\n`）
    pub max_line_len: usize,
}

impl Default for LineExtractorConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 8192,
            max_line_len: 34,
        }
    }
}

/// 行提取器累计计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub lines: u64,
    /// `feed()` 遇到缓冲区满的次数
    pub ring_overruns: u64,
    pub dropped_bytes: u64,
    /// 超过 `max_line_len` 仍未见 `\n` 而被丢弃的行
    pub overlength_lines: u64,
}

impl LineStats {
    /// 相对较早快照的增量
    pub fn since(&self, earlier: &LineStats) -> LineStats {
        LineStats {
            lines: self.lines.saturating_sub(earlier.lines),
            ring_overruns: self.ring_overruns.saturating_sub(earlier.ring_overruns),
            dropped_bytes: self.dropped_bytes.saturating_sub(earlier.dropped_bytes),
            overlength_lines: self
                .overlength_lines
                .saturating_sub(earlier.overlength_lines),
        }
    }
}

/// 环形缓冲区行提取器
///
/// 单线程使用：每个读线程持有自己的实例。
///
/// ```
/// use canbridge_driver::LineExtractor;
///
/// let mut extractor = LineExtractor::default();
/// extractor.feed(b"AB");
/// assert!(extractor.try_extract_line().is_none());
/// extractor.feed(b"CD\n");
/// assert_eq!(extractor.try_extract_line(), Some(&b"ABCD\n"[..]));
/// ```
#[derive(Debug)]
pub struct LineExtractor {
    ring: Box<[u8]>,
    /// 下一个写入位置
    head: usize,
    /// 下一个读取位置
    tail: usize,
    line: Vec<u8>,
    max_line_len: usize,
    /// 上次返回了完整行，下次调用前清空
    line_ready: bool,
    /// 超长行被丢弃后，跳过剩余字节直到下一个 `\n`
    resync: bool,
    stats: LineStats,
}

impl Default for LineExtractor {
    fn default() -> Self {
        Self::new(LineExtractorConfig::default())
    }
}

impl LineExtractor {
    pub fn new(config: LineExtractorConfig) -> Self {
        let ring_capacity = config.ring_capacity.max(2);
        let max_line_len = config.max_line_len.max(1);
        Self {
            ring: vec![0u8; ring_capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            line: Vec::with_capacity(max_line_len),
            max_line_len,
            line_ready: false,
            resync: false,
            stats: LineStats::default(),
        }
    }

    /// 写入一块输入
    ///
    /// 缓冲区写满后丢弃本块剩余字节并记一次溢出，不阻塞。
    pub fn feed(&mut self, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            let next = (self.head + 1) % self.ring.len();
            if next == self.tail {
                self.stats.ring_overruns += 1;
                self.stats.dropped_bytes += (bytes.len() - i) as u64;
                return;
            }
            self.ring[self.head] = byte;
            self.head = next;
        }
    }

    /// 尝试拼出一行（含结尾 `\n`）
    ///
    /// 缓冲区耗尽时返回 `None`，已拼装的部分保留到下次调用。
    /// 返回的切片在下一次调用前有效。
    pub fn try_extract_line(&mut self) -> Option<&[u8]> {
        if self.line_ready {
            self.line.clear();
            self.line_ready = false;
        }

        while self.tail != self.head {
            let byte = self.ring[self.tail];
            self.tail = (self.tail + 1) % self.ring.len();

            if self.resync {
                if byte == b'\n' {
                    self.resync = false;
                }
                continue;
            }

            self.line.push(byte);
            if byte == b'\n' {
                self.line_ready = true;
                self.stats.lines += 1;
                return Some(&self.line);
            }
            if self.line.len() >= self.max_line_len {
                self.stats.overlength_lines += 1;
                self.line.clear();
                self.resync = true;
            }
        }
        None
    }

    /// 缓冲区中尚未处理的字节数（不含正在拼装的行）
    pub fn buffered(&self) -> usize {
        (self.head + self.ring.len() - self.tail) % self.ring.len()
    }

    pub fn stats(&self) -> LineStats {
        self.stats
    }
}
