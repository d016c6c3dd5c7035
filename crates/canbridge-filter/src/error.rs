//! 过滤表错误类型

use thiserror::Error;

/// ID 字段提取失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractReason {
    /// 行内没有 `,`
    NoComma,
    /// `,` 后面不是 `'`
    NoQuote,
    /// ID 字段含非 hex 字符
    NotHex,
    /// ID 字段不是 8 个字符
    WrongLength,
}

impl std::fmt::Display for ExtractReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ExtractReason::NoComma => "no comma",
            ExtractReason::NoQuote => "no quote ahead of id",
            ExtractReason::NotHex => "id field not valid hex",
            ExtractReason::WrongLength => "id field is not exactly 8 hex digits",
        };
        f.write_str(text)
    }
}

/// 查找表中出现重复 key
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("duplicate id 0x{0:08X}")]
pub struct DuplicateKey(pub u32);

/// 过滤表构建与查找错误
///
/// 行号从 1 开始。
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("rule file has no '@' matrix size line")]
    MissingMatrixSize,

    #[error("line {line}: matrix size declared more than once")]
    MultipleMatrixSize { line: usize },

    #[error("line {line}: matrix size '{value}' not in 2..=5")]
    MatrixSizeOutOfRange { line: usize, value: String },

    #[error("line {line}: sequence error: {message}")]
    Sequence { line: usize, message: String },

    #[error("line {line}: table type '{value}' is not 0 or 1")]
    Type { line: usize, value: String },

    #[error("line {line}: CAN id extraction failed: {reason}")]
    Extract { line: usize, reason: ExtractReason },

    #[error("line {line}: unrecognized line: {text}")]
    UnrecognizedLine { line: usize, text: String },

    #[error("table {row}{col}: duplicate id 0x{id:08X}")]
    DuplicateId { row: usize, col: usize, id: u32 },

    #[error("table {row}{col}: more than {limit} ids")]
    TableTooLarge { row: usize, col: usize, limit: usize },

    #[error("matrix needs {expected} pair rules for n={n}, got {actual}")]
    MatrixShape {
        n: usize,
        expected: usize,
        actual: usize,
    },

    #[error("connection pair ({in_conn}, {out_conn}) out of range for n={n}")]
    ConnectionOutOfRange {
        in_conn: usize,
        out_conn: usize,
        n: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FilterError {
    pub(crate) fn sequence(line: usize, message: impl Into<String>) -> Self {
        FilterError::Sequence {
            line,
            message: message.into(),
        }
    }
}
