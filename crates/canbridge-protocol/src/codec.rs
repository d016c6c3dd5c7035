//! 带校验和的 ASCII-hex 行编解码
//!
//! 一行的格式（全部为 hex 字符对，最后是换行符）：
//!
//! ```text
//! seq(1) | packed id(4, 小端) | dlc(1, 低 4 位有效) | payload(dlc) | checksum(1) | '\n'
//! ```
//!
//! dlc=0 时整行 15 字节，dlc=8 时 31 字节（均含 `'\n'`）。

use crate::id::{HEX_INVALID, HEX_NIBBLE, packed_id_is_legal};
use crate::{CAN_MAX_DLC, CanFrame};
use std::fmt;
use thiserror::Error;

/// 最短合法行（dlc=0，含换行符）
pub const MIN_LINE_LEN: usize = 15;
/// 最长合法行（dlc=8，含换行符）
pub const MAX_LINE_LEN: usize = 31;
/// 校验和初值
pub const CHECKSUM_SEED: u32 = 0xA5A5;

/// seq + id + dlc + 8 字节 payload + checksum
const MAX_BINARY_LEN: usize = 15;

/// 解码错误
///
/// 每种错误都对应一个旧诊断码（见 [`DecodeError::code`]），
/// 日志和上游工具仍以这些码做统计。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("line too long: {len} bytes (max {MAX_LINE_LEN})")]
    TooLong { len: usize },

    #[error("line too short: {len} bytes")]
    TooShort { len: usize },

    #[error("illegal hex character at offset {offset}")]
    IllegalHex { offset: usize },

    #[error("illegal CAN id 0x{packed_id:08X}: 29-bit low order bits with IDE clear")]
    IllegalId { packed_id: u32 },

    #[error("illegal DLC: {dlc}")]
    IllegalDlc { dlc: u8 },

    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

impl DecodeError {
    /// 旧诊断码（-1 .. -6）
    pub fn code(&self) -> i32 {
        match self {
            DecodeError::TooLong { .. } => -1,
            DecodeError::TooShort { .. } => -2,
            DecodeError::IllegalHex { .. } => -3,
            DecodeError::IllegalId { .. } => -4,
            DecodeError::IllegalDlc { .. } => -5,
            DecodeError::ChecksumMismatch { .. } => -6,
        }
    }
}

/// 编码错误
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("illegal DLC: {dlc} (max {CAN_MAX_DLC})")]
    IllegalDlc { dlc: u8 },
}

/// 把累加和折叠为 8 位校验和
///
/// 先两轮 16 位进位回卷，再两轮 8 位进位回卷，取低字节。
pub fn fold_checksum(mut sum: u32) -> u8 {
    sum = sum.wrapping_add(sum >> 16);
    sum = sum.wrapping_add(sum >> 16);
    sum = sum.wrapping_add(sum >> 8);
    sum = sum.wrapping_add(sum >> 8);
    sum as u8
}

/// 解码结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedLine {
    /// 发送端的滚动序号（仅供诊断）
    pub seq: u8,
    /// 线上的 packed ID（过滤表查找使用）
    pub packed_id: u32,
    /// socket 形式的帧
    pub frame: CanFrame,
}

/// 解码一行
///
/// 长度按整个输入计算（包含结尾的 `'\n'`），且必须等于 `15 + 2 * dlc`。
/// 校验顺序固定：长度范围、hex、ID、DLC、长度与 DLC 一致、校验和。
pub fn decode(line: &[u8]) -> Result<DecodedLine, DecodeError> {
    let len = line.len();
    if len > MAX_LINE_LEN {
        return Err(DecodeError::TooLong { len });
    }
    if len < MIN_LINE_LEN {
        return Err(DecodeError::TooShort { len });
    }

    let count = (len - 1) / 2;
    let mut bytes = [0u8; MAX_BINARY_LEN];
    let mut sum = CHECKSUM_SEED;
    for (i, byte) in bytes.iter_mut().take(count).enumerate() {
        let hi = HEX_NIBBLE[line[2 * i] as usize];
        if hi == HEX_INVALID {
            return Err(DecodeError::IllegalHex { offset: 2 * i });
        }
        let lo = HEX_NIBBLE[line[2 * i + 1] as usize];
        if lo == HEX_INVALID {
            return Err(DecodeError::IllegalHex { offset: 2 * i + 1 });
        }
        *byte = (hi << 4) | lo;
        sum += u32::from(*byte);
    }

    let seq = bytes[0];
    let packed_id = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if !packed_id_is_legal(packed_id) {
        return Err(DecodeError::IllegalId { packed_id });
    }

    // 高 4 位保留给时间戳，忽略
    let dlc = bytes[5] & 0x0F;
    if dlc > CAN_MAX_DLC {
        return Err(DecodeError::IllegalDlc { dlc });
    }

    // 行长必须与 DLC 完全对应，校验和之后不允许有多余字节
    let expected_len = MIN_LINE_LEN + 2 * dlc as usize;
    if len < expected_len {
        return Err(DecodeError::TooShort { len });
    }
    if len > expected_len {
        return Err(DecodeError::TooLong { len });
    }
    let checksum_index = 6 + dlc as usize;

    let actual = bytes[checksum_index];
    let expected = fold_checksum(sum - u32::from(actual));
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    Ok(DecodedLine {
        seq,
        packed_id,
        frame: CanFrame::from_packed_id(packed_id, &bytes[6..checksum_index]),
    })
}

/// 一条编码好的线上行（栈上缓冲，无堆分配）
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WireLine {
    buf: [u8; MAX_LINE_LEN],
    len: u8,
}

impl WireLine {
    fn empty() -> Self {
        Self {
            buf: [0u8; MAX_LINE_LEN],
            len: 0,
        }
    }

    fn push(&mut self, c: u8) {
        self.buf[self.len as usize] = c;
        self.len += 1;
    }

    fn push_hex(&mut self, byte: u8) {
        const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";
        self.push(HEX_UPPER[(byte >> 4) as usize]);
        self.push(HEX_UPPER[(byte & 0x0F) as usize]);
    }

    /// 完整行（含 `'\n'`）
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn as_str(&self) -> &str {
        // 只写入过 ASCII
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for WireLine {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for WireLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WireLine").field(&self.as_str()).finish()
    }
}

/// 行编码器
///
/// 持有滚动序号：每次成功编码前先加一（u8 回绕），序号参与校验和。
/// DLC 非法时返回错误，序号不变。
#[derive(Debug, Default, Clone)]
pub struct HexEncoder {
    seq: u8,
}

impl HexEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定初始序号（下一次编码输出 `seq + 1`）
    pub fn with_seq(seq: u8) -> Self {
        Self { seq }
    }

    /// 上一次输出的序号
    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn encode(&mut self, frame: &CanFrame) -> Result<WireLine, EncodeError> {
        if frame.len > CAN_MAX_DLC {
            return Err(EncodeError::IllegalDlc { dlc: frame.len });
        }

        self.seq = self.seq.wrapping_add(1);

        let mut line = WireLine::empty();
        let mut sum = CHECKSUM_SEED;
        let mut emit = |line: &mut WireLine, byte: u8| {
            sum += u32::from(byte);
            line.push_hex(byte);
        };

        emit(&mut line, self.seq);
        for byte in frame.packed_id().to_le_bytes() {
            emit(&mut line, byte);
        }
        emit(&mut line, frame.len);
        for &byte in frame.data_slice() {
            emit(&mut line, byte);
        }

        line.push_hex(fold_checksum(sum));
        line.push(b'\n');
        Ok(line)
    }
}
