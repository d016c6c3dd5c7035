//! 规则文件解析
//!
//! 行首字符决定行类型：
//!
//! ```text
//! @<n>                      矩阵大小（2..=5），必须在其他内容之前且只出现一次
//! %<row><col> <type>        打开 (row, col) 表，严格行优先顺序；type 0/1
//! %99 9                     结束当前表
//! I...,'<8 hex>',...        普通条目
//! T...,'<8 hex>',...        翻译：输入 ID
//! t...,'<8 hex>',...        翻译：输出 ID，必须紧跟 T
//! #... / 空行 / 空格开头      忽略
//! ```

use crate::error::{ExtractReason, FilterError};
use crate::matrix::{
    FilterMatrix, MAX_CONNECTIONS, MAX_TABLE_IDS, MIN_CONNECTIONS, PairRule, RuleKind,
    TranslateEntry,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// 正在填充的表
#[derive(Debug)]
struct OpenTable {
    row: usize,
    col: usize,
    kind: RuleKind,
    block_ids: Vec<u32>,
    entries: Vec<TranslateEntry>,
}

impl OpenTable {
    fn check_room(&self, len: usize) -> Result<(), FilterError> {
        if len >= MAX_TABLE_IDS {
            return Err(FilterError::TableTooLarge {
                row: self.row,
                col: self.col,
                limit: MAX_TABLE_IDS,
            });
        }
        Ok(())
    }

    fn push_block(&mut self, id: u32) -> Result<(), FilterError> {
        self.check_room(self.block_ids.len())?;
        self.block_ids.push(id);
        Ok(())
    }

    fn push_entry(&mut self, matched_id: u32, translated_id: u32) -> Result<(), FilterError> {
        self.check_room(self.entries.len())?;
        self.entries
            .push(TranslateEntry::new(matched_id, translated_id));
        Ok(())
    }

    fn finalize(self) -> Result<PairRule, FilterError> {
        let (row, col) = (self.row, self.col);
        PairRule::new(self.kind, self.block_ids, self.entries)
            .map_err(|dup| FilterError::DuplicateId { row, col, id: dup.0 })
    }
}

/// 增量式规则解析器
///
/// 逐行喂入，`finish` 时补齐未声明的连接对并生成矩阵。任何错误都会中止构建，
/// 不会留下半成品矩阵。
#[derive(Debug, Default)]
pub struct FilterTableBuilder {
    n: Option<usize>,
    /// 已完成的表，行优先
    rules: Vec<PairRule>,
    open: Option<OpenTable>,
    /// 等待 `t` 的 `T` 输入 ID
    pending_translation: Option<u32>,
    /// 最近一次收到的 `%` 表头（1 起始），用于检查顺序
    last_pair: Option<(usize, usize)>,
}

impl FilterTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理一行（`line_no` 从 1 开始，`line` 不含换行符）
    pub fn feed_line(&mut self, line_no: usize, line: &str) -> Result<(), FilterError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(first) = line.chars().next() else {
            return Ok(());
        };

        match first {
            '#' | ' ' | '\t' => Ok(()),
            '@' => self.declare_size(line_no, &line[1..]),
            '%' => {
                self.require_size()?;
                self.open_table(line_no, &line[1..])
            },
            'I' => {
                self.require_size()?;
                self.add_plain(line_no, line)
            },
            'T' => {
                self.require_size()?;
                self.add_translation_in(line_no, line)
            },
            't' => {
                self.require_size()?;
                self.add_translation_out(line_no, line)
            },
            _ => Err(FilterError::UnrecognizedLine {
                line: line_no,
                text: line.to_string(),
            }),
        }
    }

    fn require_size(&self) -> Result<usize, FilterError> {
        self.n.ok_or(FilterError::MissingMatrixSize)
    }

    fn declare_size(&mut self, line_no: usize, rest: &str) -> Result<(), FilterError> {
        if self.n.is_some() {
            return Err(FilterError::MultipleMatrixSize { line: line_no });
        }
        let value = rest.trim();
        match value.parse::<usize>() {
            Ok(n) if (MIN_CONNECTIONS..=MAX_CONNECTIONS).contains(&n) => {
                self.n = Some(n);
                Ok(())
            },
            _ => Err(FilterError::MatrixSizeOutOfRange {
                line: line_no,
                value: value.to_string(),
            }),
        }
    }

    fn next_expected_pair(&self, n: usize) -> (usize, usize) {
        match self.last_pair {
            None => (1, 1),
            Some((row, col)) if col < n => (row, col + 1),
            Some((row, _)) => (row + 1, 1),
        }
    }

    fn close_open_table(&mut self, line_no: usize) -> Result<(), FilterError> {
        if self.pending_translation.is_some() {
            return Err(FilterError::sequence(line_no, "'T' line not followed by 't'"));
        }
        if let Some(table) = self.open.take() {
            debug!(
                "Filter table {}{} closed: {} block ids, {} entries",
                table.row,
                table.col,
                table.block_ids.len(),
                table.entries.len()
            );
            self.rules.push(table.finalize()?);
        }
        Ok(())
    }

    fn open_table(&mut self, line_no: usize, rest: &str) -> Result<(), FilterError> {
        let n = self.require_size()?;
        let bytes = rest.as_bytes();
        let digit = |idx: usize| {
            bytes
                .get(idx)
                .filter(|b| b.is_ascii_digit())
                .map(|b| (b - b'0') as usize)
        };
        let (Some(row), Some(col)) = (digit(0), digit(1)) else {
            return Err(FilterError::sequence(
                line_no,
                format!("malformed table header '%{}'", rest),
            ));
        };

        self.close_open_table(line_no)?;

        if row == 9 && col == 9 {
            return Ok(());
        }

        if !(1..=n).contains(&row) || !(1..=n).contains(&col) {
            return Err(FilterError::sequence(
                line_no,
                format!("table {}{} outside 1..={} matrix", row, col, n),
            ));
        }
        let expected = self.next_expected_pair(n);
        if (row, col) != expected {
            return Err(FilterError::sequence(
                line_no,
                format!(
                    "table {}{} out of order, expected {}{}",
                    row, col, expected.0, expected.1
                ),
            ));
        }

        let type_field = rest[2..].trim();
        let kind = match type_field.split_whitespace().next() {
            Some("0") => RuleKind::PassOnMatch,
            Some("1") => RuleKind::BlockOnMatch,
            _ => {
                return Err(FilterError::Type {
                    line: line_no,
                    value: type_field.to_string(),
                });
            },
        };

        self.last_pair = Some((row, col));
        self.open = Some(OpenTable {
            row,
            col,
            kind,
            block_ids: Vec::new(),
            entries: Vec::new(),
        });
        Ok(())
    }

    fn open_table_mut(&mut self, line_no: usize) -> Result<&mut OpenTable, FilterError> {
        self.open
            .as_mut()
            .ok_or_else(|| FilterError::sequence(line_no, "id line outside of an open table"))
    }

    fn add_plain(&mut self, line_no: usize, line: &str) -> Result<(), FilterError> {
        if self.pending_translation.is_some() {
            return Err(FilterError::sequence(line_no, "'T' line not followed by 't'"));
        }
        let id = extract_id(line_no, line)?;
        let table = self.open_table_mut(line_no)?;
        match table.kind {
            RuleKind::PassOnMatch => table.push_entry(id, 0),
            RuleKind::BlockOnMatch => table.push_block(id),
        }
    }

    fn add_translation_in(&mut self, line_no: usize, line: &str) -> Result<(), FilterError> {
        if self.pending_translation.is_some() {
            return Err(FilterError::sequence(line_no, "'T' line follows 'T' line"));
        }
        let id = extract_id(line_no, line)?;
        self.open_table_mut(line_no)?;
        self.pending_translation = Some(id);
        Ok(())
    }

    fn add_translation_out(&mut self, line_no: usize, line: &str) -> Result<(), FilterError> {
        let Some(matched_id) = self.pending_translation else {
            return Err(FilterError::sequence(line_no, "'t' line without preceding 'T'"));
        };
        let id = extract_id(line_no, line)?;
        let table = self.open_table_mut(line_no)?;
        table.push_entry(matched_id, id)?;
        self.pending_translation = None;
        Ok(())
    }

    /// 结束解析
    ///
    /// 文件未声明的连接对使用空的 pass-on-match 表（阻止一切）。
    pub fn finish(mut self, last_line: usize) -> Result<FilterMatrix, FilterError> {
        let n = self.require_size()?;
        self.close_open_table(last_line)?;

        let expected = n * n;
        if self.rules.len() < expected {
            warn!(
                "Filter rules declare {} of {} connection pairs; the rest block all traffic",
                self.rules.len(),
                expected
            );
            self.rules
                .resize(expected, PairRule::empty(RuleKind::PassOnMatch));
        }
        FilterMatrix::new(n, self.rules)
    }
}

/// 从 `,'XXXXXXXX'` 字段提取 ID（大端数值，与 SQL 插入语句一致）
fn extract_id(line_no: usize, line: &str) -> Result<u32, FilterError> {
    let fail = |reason| FilterError::Extract {
        line: line_no,
        reason,
    };

    let comma = line.find(',').ok_or_else(|| fail(ExtractReason::NoComma))?;
    let field = line[comma + 1..]
        .strip_prefix('\'')
        .ok_or_else(|| fail(ExtractReason::NoQuote))?;

    let digits: &str = field.split('\'').next().unwrap_or_default();
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(fail(ExtractReason::NotHex));
    }
    if digits.len() != 8 || !field[digits.len()..].starts_with('\'') {
        return Err(fail(ExtractReason::WrongLength));
    }
    u32::from_str_radix(digits, 16).map_err(|_| fail(ExtractReason::NotHex))
}

impl FilterMatrix {
    /// 从任意 `BufRead` 解析
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, FilterError> {
        let mut builder = FilterTableBuilder::new();
        let mut line_no = 0;
        for line in reader.lines() {
            line_no += 1;
            builder.feed_line(line_no, &line?)?;
        }
        builder.finish(line_no)
    }

    /// 从规则文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }
}

impl FromStr for FilterMatrix {
    type Err = FilterError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::from_reader(text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::LookupResult;

    const TWO_BY_TWO: &str = "\
# 2x2 bridge
@2
%11 1
%12 0
I INSERT INTO CANID VALUES ('CANID_A','00200000','A',1,1,'NONE','a');
T INSERT INTO CANID VALUES ('CANID_B','00400000','B',1,1,'NONE','b');
t INSERT INTO CANID VALUES ('CANID_C','00600000','C',1,1,'NONE','c');
%21 1
I //,'00800000'
T //,'00A00000'
t //,'00C00000'
%22 1
%99 9
";

    #[test]
    fn test_parse_two_by_two() {
        let m: FilterMatrix = TWO_BY_TWO.parse().unwrap();
        assert_eq!(m.n(), 2);

        assert_eq!(m.decide(0x0020_0000, 0, 1).unwrap(), LookupResult::Pass);
        assert_eq!(
            m.decide(0x0040_0000, 0, 1).unwrap(),
            LookupResult::PassTranslated(0x0060_0000)
        );
        assert_eq!(m.decide(0x0080_0000, 0, 1).unwrap(), LookupResult::Block);

        assert_eq!(m.decide(0x0080_0000, 1, 0).unwrap(), LookupResult::Block);
        assert_eq!(
            m.decide(0x00A0_0000, 1, 0).unwrap(),
            LookupResult::PassTranslated(0x00C0_0000)
        );
        assert_eq!(m.decide(0x0020_0000, 1, 0).unwrap(), LookupResult::Pass);

        assert_eq!(m.decide(0x1234_5678, 0, 0).unwrap(), LookupResult::Pass);
    }

    #[test]
    fn test_missing_size() {
        assert!(matches!(
            "# nothing\n".parse::<FilterMatrix>(),
            Err(FilterError::MissingMatrixSize)
        ));
        assert!(matches!(
            "%11 0\n".parse::<FilterMatrix>(),
            Err(FilterError::MissingMatrixSize)
        ));
    }

    #[test]
    fn test_multiple_size() {
        assert!(matches!(
            "@2\n@3\n".parse::<FilterMatrix>(),
            Err(FilterError::MultipleMatrixSize { line: 2 })
        ));
    }

    #[test]
    fn test_size_out_of_range() {
        for text in ["@1\n", "@6\n", "@x\n"] {
            assert!(matches!(
                text.parse::<FilterMatrix>(),
                Err(FilterError::MatrixSizeOutOfRange { line: 1, .. })
            ));
        }
    }

    #[test]
    fn test_pair_out_of_range() {
        let err = "@2\n%11 0\n%13 0\n".parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 3, .. }), "{err}");
        let err = "@2\n%30 0\n".parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_pair_out_of_order() {
        let err = "@2\n%12 0\n".parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 2, .. }));
        let err = "@2\n%11 0\n%12 0\n%11 0\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 4, .. }));
    }

    #[test]
    fn test_bad_type() {
        let err = "@2\n%11 2\n".parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::Type { line: 2, ref value } if value == "2"));
        let err = "@2\n%11\n".parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::Type { line: 2, .. }));
    }

    #[test]
    fn test_t_without_capital_t() {
        let err = "@2\n%11 1\nt x,'00200000'\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 3, .. }));
    }

    #[test]
    fn test_capital_t_not_followed_by_t() {
        let err = "@2\n%11 1\nT x,'00200000'\nI x,'00400000'\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 4, .. }));

        let err = "@2\n%11 1\nT x,'00200000'\nT x,'00400000'\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 4, .. }));

        let err = "@2\n%11 1\nT x,'00200000'\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(err, FilterError::Sequence { .. }));
    }

    #[test]
    fn test_entry_after_end_sentinel() {
        let err = "@2\n%11 1\n%99 9\nI x,'00200000'\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(err, FilterError::Sequence { line: 4, .. }));
    }

    #[test]
    fn test_extract_errors() {
        let cases = [
            ("I no comma here", ExtractReason::NoComma),
            ("I x, '00200000'", ExtractReason::NoQuote),
            ("I x,'0020000G'", ExtractReason::NotHex),
            ("I x,'0020000'", ExtractReason::WrongLength),
            ("I x,'002000000'", ExtractReason::WrongLength),
            ("I x,'00200000", ExtractReason::WrongLength),
        ];
        for (line, expected) in cases {
            let text = format!("@2\n%11 1\n{}\n", line);
            match text.parse::<FilterMatrix>() {
                Err(FilterError::Extract { line: 3, reason }) => {
                    assert_eq!(reason, expected, "{line}")
                },
                other => panic!("{line}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_unrecognized_line() {
        let err = "@2\nX what\n".parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::UnrecognizedLine { line: 2, .. }));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = "@2\n%11 1\nI x,'00200000'\nI y,'00200000'\n"
            .parse::<FilterMatrix>()
            .unwrap_err();
        assert!(matches!(
            err,
            FilterError::DuplicateId {
                row: 1,
                col: 1,
                id: 0x0020_0000
            }
        ));
    }

    #[test]
    fn test_table_too_large() {
        let mut text = String::from("@2\n%11 1\n");
        for i in 0..=MAX_TABLE_IDS as u32 {
            text.push_str(&format!("I x,'{:08X}'\n", i << 21));
        }
        let err = text.parse::<FilterMatrix>().unwrap_err();
        assert!(matches!(err, FilterError::TableTooLarge { row: 1, col: 1, limit: 512 }));
    }

    #[test]
    fn test_undeclared_pairs_block_all() {
        let m: FilterMatrix = "@3\n%11 1\n".parse().unwrap();
        assert_eq!(m.decide(0x0020_0000, 0, 0).unwrap(), LookupResult::Pass);
        assert_eq!(m.decide(0x0020_0000, 0, 1).unwrap(), LookupResult::Block);
        assert_eq!(m.decide(0x0020_0000, 2, 2).unwrap(), LookupResult::Block);
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let m: FilterMatrix = "\n# c\n  indented\n@2\r\n\n%11 1\r\n".parse().unwrap();
        assert_eq!(m.n(), 2);
    }
}
