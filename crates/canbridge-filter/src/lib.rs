//! # CAN Bridge Filter - 连接对过滤矩阵
//!
//! **依赖原则**: 纯算法，不依赖协议层或硬件层。ID 一律为 packed（左对齐）形式。
//!
//! ## 包含模块
//!
//! - `builder` - 规则文件解析，生成不可变矩阵
//! - `matrix` - 矩阵、连接对规则与 pass/block/translate 查找
//! - `error` - 构建与查找错误
//!
//! ## 使用示例
//!
//! ```
//! use canbridge_filter::{FilterMatrix, LookupResult};
//!
//! let rules = "@2\n%11 1\n%12 0\nI x,'00200000'\n%21 1\n%22 1\n";
//! let matrix: FilterMatrix = rules.parse().unwrap();
//! assert_eq!(matrix.decide(0x0020_0000, 0, 1).unwrap(), LookupResult::Pass);
//! assert_eq!(matrix.decide(0x0040_0000, 0, 1).unwrap(), LookupResult::Block);
//! ```

pub mod builder;
pub mod error;
pub mod matrix;

pub use builder::FilterTableBuilder;
pub use error::{DuplicateKey, ExtractReason, FilterError};
pub use matrix::{
    FilterMatrix, LookupResult, MAX_CONNECTIONS, MAX_TABLE_IDS, MIN_CONNECTIONS, PairRule,
    RuleKind, TranslateEntry,
};
