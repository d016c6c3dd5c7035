//! 过滤矩阵与查找
//!
//! 矩阵在启动时一次性构建，之后只读；通过 `Arc<FilterMatrix>` 在桥接线程间共享，
//! 查找过程不加锁、不分配内存。

use crate::error::{DuplicateKey, FilterError};
use std::fmt::Write as _;

/// 矩阵最小边长
pub const MIN_CONNECTIONS: usize = 2;
/// 矩阵最大边长
pub const MAX_CONNECTIONS: usize = 5;
/// 单张表的条目上限
pub const MAX_TABLE_IDS: usize = 512;

/// 连接对的过滤策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// 只转发表中出现的 ID（规则文件类型 0）
    PassOnMatch,
    /// 阻止块表中出现的 ID，其余转发（规则文件类型 1）
    BlockOnMatch,
}

/// 两列表条目：`translated_id == 0` 表示原样转发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateEntry {
    pub matched_id: u32,
    pub translated_id: u32,
}

impl TranslateEntry {
    pub fn new(matched_id: u32, translated_id: u32) -> Self {
        Self {
            matched_id,
            translated_id,
        }
    }
}

/// 单帧的查找结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Block,
    Pass,
    /// 转发并替换为新的 packed ID
    PassTranslated(u32),
}

/// 一个 (in, out) 连接对的规则
///
/// 两张表都按 key 升序、无重复。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRule {
    kind: RuleKind,
    block_ids: Box<[u32]>,
    entries: Box<[TranslateEntry]>,
}

impl PairRule {
    /// 排序并校验唯一性
    pub fn new(
        kind: RuleKind,
        mut block_ids: Vec<u32>,
        mut entries: Vec<TranslateEntry>,
    ) -> Result<Self, DuplicateKey> {
        block_ids.sort_unstable();
        if let Some(pair) = block_ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(DuplicateKey(pair[0]));
        }

        entries.sort_unstable_by_key(|e| e.matched_id);
        if let Some(pair) = entries
            .windows(2)
            .find(|w| w[0].matched_id == w[1].matched_id)
        {
            return Err(DuplicateKey(pair[0].matched_id));
        }

        Ok(Self {
            kind,
            block_ids: block_ids.into_boxed_slice(),
            entries: entries.into_boxed_slice(),
        })
    }

    /// 两张表都为空的规则
    pub fn empty(kind: RuleKind) -> Self {
        Self {
            kind,
            block_ids: Box::default(),
            entries: Box::default(),
        }
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn block_ids(&self) -> &[u32] {
        &self.block_ids
    }

    pub fn entries(&self) -> &[TranslateEntry] {
        &self.entries
    }

    fn translation_for(&self, frame_id: u32) -> Option<u32> {
        self.entries
            .binary_search_by_key(&frame_id, |e| e.matched_id)
            .ok()
            .map(|idx| self.entries[idx].translated_id)
    }

    /// 对单个 packed ID 做出决定
    pub fn decide(&self, frame_id: u32) -> LookupResult {
        match self.kind {
            // 空表找不到任何 ID，所以空的 pass-on-match 阻止一切
            RuleKind::PassOnMatch => match self.translation_for(frame_id) {
                None => LookupResult::Block,
                Some(0) => LookupResult::Pass,
                Some(new_id) => LookupResult::PassTranslated(new_id),
            },
            RuleKind::BlockOnMatch => {
                if self.block_ids.binary_search(&frame_id).is_ok() {
                    return LookupResult::Block;
                }
                match self.translation_for(frame_id) {
                    Some(new_id) if new_id != 0 => LookupResult::PassTranslated(new_id),
                    _ => LookupResult::Pass,
                }
            },
        }
    }
}

/// N×N 连接对规则矩阵
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMatrix {
    n: usize,
    rules: Vec<PairRule>,
}

impl FilterMatrix {
    /// 行优先排列的 `n * n` 条规则
    pub fn new(n: usize, rules: Vec<PairRule>) -> Result<Self, FilterError> {
        if !(MIN_CONNECTIONS..=MAX_CONNECTIONS).contains(&n) {
            return Err(FilterError::MatrixSizeOutOfRange {
                line: 0,
                value: n.to_string(),
            });
        }
        if rules.len() != n * n {
            return Err(FilterError::MatrixShape {
                n,
                expected: n * n,
                actual: rules.len(),
            });
        }
        Ok(Self { n, rules })
    }

    /// 连接数
    pub fn n(&self) -> usize {
        self.n
    }

    /// 0 起始的连接对
    pub fn rule(&self, in_conn: usize, out_conn: usize) -> Option<&PairRule> {
        if in_conn >= self.n || out_conn >= self.n {
            return None;
        }
        self.rules.get(in_conn * self.n + out_conn)
    }

    /// 判断 `in_conn` 上收到的帧能否转发到 `out_conn`
    ///
    /// `frame_id` 为 packed 形式（与规则文件一致）。
    pub fn decide(
        &self,
        frame_id: u32,
        in_conn: usize,
        out_conn: usize,
    ) -> Result<LookupResult, FilterError> {
        let rule = self
            .rule(in_conn, out_conn)
            .ok_or(FilterError::ConnectionOutOfRange {
                in_conn,
                out_conn,
                n: self.n,
            })?;
        Ok(rule.decide(frame_id))
    }

    /// 每个连接对一行的可读摘要
    pub fn summary(&self) -> String {
        let mut out = format!("{}x{} bridge matrix\n", self.n, self.n);
        for (idx, rule) in self.rules.iter().enumerate() {
            let kind = match rule.kind {
                RuleKind::PassOnMatch => "pass-on-match",
                RuleKind::BlockOnMatch => "block-on-match",
            };
            let translated = rule.entries.iter().filter(|e| e.translated_id != 0).count();
            let _ = writeln!(
                out,
                "  {}{} {:<14} block:{:<4} pass:{:<4} translate:{}",
                idx / self.n + 1,
                idx % self.n + 1,
                kind,
                rule.block_ids.len(),
                rule.entries.len() - translated,
                translated,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass_rule(entries: &[(u32, u32)]) -> PairRule {
        PairRule::new(
            RuleKind::PassOnMatch,
            Vec::new(),
            entries
                .iter()
                .map(|&(m, t)| TranslateEntry::new(m, t))
                .collect(),
        )
        .unwrap()
    }

    fn block_rule(block: &[u32], entries: &[(u32, u32)]) -> PairRule {
        PairRule::new(
            RuleKind::BlockOnMatch,
            block.to_vec(),
            entries
                .iter()
                .map(|&(m, t)| TranslateEntry::new(m, t))
                .collect(),
        )
        .unwrap()
    }

    /// 2×2 矩阵，只填 (0,1) 和 (1,0)
    fn two_by_two(r01: PairRule, r10: PairRule) -> FilterMatrix {
        FilterMatrix::new(
            2,
            vec![
                PairRule::empty(RuleKind::BlockOnMatch),
                r01,
                r10,
                PairRule::empty(RuleKind::BlockOnMatch),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_pass_on_match_decisions() {
        let m = two_by_two(
            pass_rule(&[(0x200, 0x300), (0x100, 0)]),
            PairRule::empty(RuleKind::PassOnMatch),
        );
        assert_eq!(m.decide(0x100, 0, 1).unwrap(), LookupResult::Pass);
        assert_eq!(
            m.decide(0x200, 0, 1).unwrap(),
            LookupResult::PassTranslated(0x300)
        );
        assert_eq!(m.decide(0x999, 0, 1).unwrap(), LookupResult::Block);
        // 空的 pass-on-match 阻止一切
        assert_eq!(m.decide(0x100, 1, 0).unwrap(), LookupResult::Block);
        assert_eq!(m.decide(0, 1, 0).unwrap(), LookupResult::Block);
    }

    #[test]
    fn test_block_on_match_decisions() {
        let m = two_by_two(
            PairRule::empty(RuleKind::BlockOnMatch),
            block_rule(&[0x400], &[(0x500, 0x600)]),
        );
        assert_eq!(m.decide(0x400, 1, 0).unwrap(), LookupResult::Block);
        assert_eq!(
            m.decide(0x500, 1, 0).unwrap(),
            LookupResult::PassTranslated(0x600)
        );
        assert_eq!(m.decide(0x700, 1, 0).unwrap(), LookupResult::Pass);
        // 两张表都空：全部放行
        assert_eq!(m.decide(0x400, 0, 1).unwrap(), LookupResult::Pass);
    }

    #[test]
    fn test_block_on_match_translate_only() {
        let rule = block_rule(&[], &[(0x10, 0x20), (0x30, 0)]);
        assert_eq!(rule.decide(0x10), LookupResult::PassTranslated(0x20));
        assert_eq!(rule.decide(0x30), LookupResult::Pass);
        assert_eq!(rule.decide(0x40), LookupResult::Pass);
    }

    #[test]
    fn test_block_on_match_searches_whole_translate_table() {
        // 翻译表比 n 长时，末尾条目也必须能查到
        let entries: Vec<(u32, u32)> = (1..=20).map(|i| (i << 21, (i + 100) << 21)).collect();
        let rule = block_rule(&[0xFFE0_0000], &entries);
        assert_eq!(
            rule.decide(20 << 21),
            LookupResult::PassTranslated(120 << 21)
        );
    }

    #[test]
    fn test_block_wins_over_translation() {
        let rule = block_rule(&[0x10], &[(0x10, 0x20)]);
        assert_eq!(rule.decide(0x10), LookupResult::Block);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let err = PairRule::new(
            RuleKind::PassOnMatch,
            Vec::new(),
            vec![TranslateEntry::new(5, 0), TranslateEntry::new(5, 7)],
        )
        .unwrap_err();
        assert_eq!(err, DuplicateKey(5));

        let err = PairRule::new(RuleKind::BlockOnMatch, vec![9, 1, 9], Vec::new()).unwrap_err();
        assert_eq!(err, DuplicateKey(9));
    }

    #[test]
    fn test_tables_sorted() {
        let rule = block_rule(&[30, 10, 20], &[(3, 0), (1, 0), (2, 0)]);
        assert_eq!(rule.block_ids(), &[10, 20, 30]);
        let keys: Vec<u32> = rule.entries().iter().map(|e| e.matched_id).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_connection_out_of_range() {
        let m = two_by_two(
            PairRule::empty(RuleKind::PassOnMatch),
            PairRule::empty(RuleKind::PassOnMatch),
        );
        assert!(matches!(
            m.decide(0x1, 2, 0),
            Err(FilterError::ConnectionOutOfRange {
                in_conn: 2,
                out_conn: 0,
                n: 2
            })
        ));
        assert!(m.rule(0, 2).is_none());
    }

    #[test]
    fn test_matrix_shape_checked() {
        assert!(matches!(
            FilterMatrix::new(2, vec![PairRule::empty(RuleKind::PassOnMatch)]),
            Err(FilterError::MatrixShape {
                n: 2,
                expected: 4,
                actual: 1
            })
        ));
        assert!(matches!(
            FilterMatrix::new(6, Vec::new()),
            Err(FilterError::MatrixSizeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_summary_lists_every_pair() {
        let m = two_by_two(
            pass_rule(&[(0x100, 0), (0x200, 0x300)]),
            block_rule(&[0x400], &[]),
        );
        let summary = m.summary();
        assert!(summary.starts_with("2x2 bridge matrix"));
        assert_eq!(summary.lines().count(), 5);
        assert!(summary.contains("12 pass-on-match"));
        assert!(summary.contains("21 block-on-match"));
    }
}
