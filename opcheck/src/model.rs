// model.rs — Indices, signatures, shapes, layouts and index predicates
//
// Shared vocabulary of the checker. An index is a named group of
// dimensions; a signature is the ordered list of indices that make up an
// argument's shape; a layout selects one signature per argument.
//
// Preconditions: none (types only).
// Postconditions: `Signature::shape` returns `None` when any index lacks dims.
// Failure modes: none.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Single-letter index code, e.g. `'b'` for batch.
pub type IndexCode = char;

/// Concrete dimension values of one index (one per rank component).
pub type Dims = Vec<i64>;

pub type IndexRanks = BTreeMap<IndexCode, u32>;
pub type IndexDims = BTreeMap<IndexCode, Dims>;

/// Upper rank bound for indices declared without one.
pub const MAX_RANK: u32 = 8;

// ── Ranks ───────────────────────────────────────────────────────────────────

/// Inclusive rank interval. Empty when `lo > hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankRange {
    pub lo: u32,
    pub hi: u32,
}

impl RankRange {
    pub fn new(lo: u32, hi: u32) -> Self {
        Self { lo, hi }
    }

    pub fn any() -> Self {
        Self { lo: 0, hi: MAX_RANK }
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn contains(&self, r: u32) -> bool {
        self.lo <= r && r <= self.hi
    }

    pub fn intersect(self, other: RankRange) -> RankRange {
        RankRange {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.lo..=self.hi
    }
}

impl fmt::Display for RankRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}..{}", self.lo, self.hi)
        }
    }
}

/// How an index's rank is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankConstraint {
    Fixed(u32),
    Range(u32, u32),
    /// Shadow index sharing the rank of another.
    Equate(IndexCode),
    /// Bounded only by `limit_ranks` declarations.
    Free,
}

impl From<u32> for RankConstraint {
    fn from(r: u32) -> Self {
        RankConstraint::Fixed(r)
    }
}

impl From<(u32, u32)> for RankConstraint {
    fn from((lo, hi): (u32, u32)) -> Self {
        RankConstraint::Range(lo, hi)
    }
}

impl From<char> for RankConstraint {
    fn from(c: char) -> Self {
        RankConstraint::Equate(c)
    }
}

// ── Index ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub code: IndexCode,
    pub desc: String,
    /// Index whose rank this one shares (itself when primary).
    pub primary: IndexCode,
    /// Declared rank interval, `None` for shadow indices.
    pub ranks: Option<RankRange>,
}

impl Index {
    pub fn is_primary(&self) -> bool {
        self.primary == self.code
    }

    /// `desc` lowercased with spaces replaced by underscores.
    pub fn snake_desc(&self) -> String {
        self.desc
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join("_")
    }
}

// ── Signature ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Signature(pub Vec<IndexCode>);

impl Signature {
    pub fn parse(s: &str) -> Self {
        Signature(s.chars().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexCode> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, c: IndexCode) -> bool {
        self.0.contains(&c)
    }

    /// Total rank under `ranks`, or `None` when some index is unranked.
    pub fn rank(&self, ranks: &IndexRanks) -> Option<u32> {
        self.iter().map(|c| ranks.get(&c).copied()).sum()
    }

    /// Concatenated dims of every index, or `None` when one is missing.
    pub fn shape(&self, dims: &IndexDims) -> Option<Vec<i64>> {
        let mut out = Vec::new();
        for c in self.iter() {
            out.extend(dims.get(&c)?.iter().copied());
        }
        Some(out)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.0 {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Signature chosen for every shape-bearing argument under one layout, in
/// declaration order. 2D shape tensors contribute one key per column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SigMap(pub Vec<(String, Signature)>);

impl SigMap {
    pub fn get(&self, key: &str) -> Option<&Signature> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.0.iter().map(|(k, s)| (k.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Shapes ──────────────────────────────────────────────────────────────────

/// Observed shape of an argument: explicit dims, or a single integer that
/// broadcasts across every component of its (single-index) signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Shape {
    Dims(Vec<i64>),
    Bcast(i64),
}

impl Shape {
    pub fn rank(&self) -> Option<usize> {
        match self {
            Shape::Dims(d) => Some(d.len()),
            Shape::Bcast(_) => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Dims(d) => write!(f, "{}", dims_string(d)),
            Shape::Bcast(v) => write!(f, "{v}"),
        }
    }
}

/// `[1,2,3]` rendering used in reports and formula trails.
pub fn dims_string(dims: &[i64]) -> String {
    let inner: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", inner.join(","))
}

// ── Data formats ────────────────────────────────────────────────────────────

/// One row of a data-format table: `name` selects `layout` when the rank
/// index has rank `rank` (`None` = any rank). A `None` name is the format
/// implied when the argument is omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatEntry {
    pub name: Option<String>,
    pub layout: usize,
    pub rank: Option<u32>,
}

impl FormatEntry {
    pub fn new(name: &str, layout: usize, rank: u32) -> Self {
        Self {
            name: Some(name.to_string()),
            layout,
            rank: Some(rank),
        }
    }

    pub fn any_rank(name: &str, layout: usize) -> Self {
        Self {
            name: Some(name.to_string()),
            layout,
            rank: None,
        }
    }

    pub fn omitted(layout: usize) -> Self {
        Self {
            name: None,
            layout,
            rank: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFormats {
    pub arg: Option<String>,
    pub entries: Vec<FormatEntry>,
    pub rank_index: Option<IndexCode>,
}

impl DataFormats {
    /// Single implicit layout, no format argument.
    pub fn single() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.arg.is_some()
    }

    pub fn num_layouts(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.layout + 1)
            .max()
            .unwrap_or(1)
    }

    fn rank_matches(&self, entry: &FormatEntry, ranks: &IndexRanks) -> bool {
        match (entry.rank, self.rank_index) {
            (None, _) => true,
            (Some(r), Some(idx)) => ranks.get(&idx) == Some(&r),
            (Some(_), None) => false,
        }
    }

    /// The named format implied by `layout` under `ranks`.
    pub fn format_for(&self, layout: usize, ranks: &IndexRanks) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| e.layout == layout && self.rank_matches(e, ranks))
            .find_map(|e| e.name.as_deref())
    }

    /// Layout selected by format `name` (`None` = argument omitted).
    pub fn layout_of(&self, name: Option<&str>, ranks: &IndexRanks) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.name.as_deref() == name && self.rank_matches(e, ranks))
            .map(|e| e.layout)
    }

    /// Every distinct format spelling, declaration order.
    pub fn all_formats(&self) -> Vec<Option<&str>> {
        let mut out: Vec<Option<&str>> = Vec::new();
        for e in &self.entries {
            let n = e.name.as_deref();
            if !out.contains(&n) {
                out.push(n);
            }
        }
        out
    }

    /// Edits needed for `observed` to agree with `layout`: 0 when the
    /// observed (or omitted-default) format is the one the layout implies,
    /// 1 otherwise. `None` when no format expresses `layout` at these ranks.
    pub fn mismatch(&self, observed: Option<&str>, layout: usize, ranks: &IndexRanks) -> Option<u32> {
        let implied = self.format_for(layout, ranks)?;
        let effective = match observed {
            Some(name) => self.layout_of(Some(name), ranks).map(|_| name),
            None => self
                .layout_of(None, ranks)
                .and_then(|l| self.format_for(l, ranks)),
        };
        Some(if effective == Some(implied) { 0 } else { 1 })
    }
}

// ── Index predicates ────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum PredFunc {
    /// Called once with the dims of every listed index.
    Whole(Arc<dyn Fn(&[Dims]) -> bool + Send + Sync>),
    /// Called once per rank component with broadcast scalars.
    ComponentWise(Arc<dyn Fn(&[i64]) -> bool + Send + Sync>),
}

pub type PredTemplate = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// Named predicate over the dims of a fixed list of indices.
#[derive(Clone)]
pub struct IndexPredicate {
    pub name: String,
    pub indices: Signature,
    pub func: PredFunc,
    pub template: PredTemplate,
}

impl fmt::Debug for IndexPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexPredicate")
            .field("name", &self.name)
            .field("indices", &self.indices.to_string())
            .finish()
    }
}

impl IndexPredicate {
    pub fn applies_to(&self, dims: &IndexDims) -> bool {
        self.indices.iter().all(|c| dims.contains_key(&c))
    }

    /// `None` when some index has no dims yet.
    pub fn holds(&self, dims: &IndexDims) -> Option<bool> {
        let args: Vec<&Dims> = self
            .indices
            .iter()
            .map(|c| dims.get(&c))
            .collect::<Option<_>>()?;
        Some(match &self.func {
            PredFunc::Whole(f) => {
                let owned: Vec<Dims> = args.into_iter().cloned().collect();
                f(&owned)
            }
            PredFunc::ComponentWise(f) => {
                let width = args.iter().map(|d| d.len()).max().unwrap_or(0);
                (0..width).all(|c| match broadcast_components(&args, c) {
                    Some(comps) => f(&comps),
                    None => false,
                })
            }
        })
    }

    pub fn describe(&self, labels: &[String]) -> String {
        (self.template)(labels)
    }
}

/// Component `c` of each input, broadcasting length-1 inputs. `None` when
/// an input has neither length 1 nor a component `c`.
pub fn broadcast_components(inputs: &[&Dims], c: usize) -> Option<Vec<i64>> {
    inputs
        .iter()
        .map(|d| match d.len() {
            1 => Some(d[0]),
            _ => d.get(c).copied(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nchw_formats() -> DataFormats {
        DataFormats {
            arg: Some("data_format".into()),
            entries: vec![
                FormatEntry::new("NCW", 0, 1),
                FormatEntry::new("NCHW", 0, 2),
                FormatEntry::new("NWC", 1, 1),
                FormatEntry::new("NHWC", 1, 2),
                FormatEntry::omitted(1),
            ],
            rank_index: Some('i'),
        }
    }

    fn ranks(i: u32) -> IndexRanks {
        [('i', i)].into_iter().collect()
    }

    #[test]
    fn signature_rank_and_shape() {
        let sig = Signature::parse("bci");
        let r: IndexRanks = [('b', 1), ('c', 1), ('i', 2)].into_iter().collect();
        assert_eq!(sig.rank(&r), Some(4));
        let dims: IndexDims = [('b', vec![2]), ('c', vec![3]), ('i', vec![5, 6])]
            .into_iter()
            .collect();
        assert_eq!(sig.shape(&dims), Some(vec![2, 3, 5, 6]));
        assert_eq!(Signature::parse("bz").rank(&r), None);
    }

    #[test]
    fn format_lookup_by_rank() {
        let f = nchw_formats();
        assert_eq!(f.num_layouts(), 2);
        assert_eq!(f.format_for(0, &ranks(2)), Some("NCHW"));
        assert_eq!(f.format_for(1, &ranks(1)), Some("NWC"));
        assert_eq!(f.layout_of(Some("NHWC"), &ranks(2)), Some(1));
        assert_eq!(f.layout_of(None, &ranks(2)), Some(1));
        assert_eq!(f.format_for(0, &ranks(3)), None);
    }

    #[test]
    fn format_mismatch_cost() {
        let f = nchw_formats();
        assert_eq!(f.mismatch(Some("NCHW"), 0, &ranks(2)), Some(0));
        assert_eq!(f.mismatch(Some("NCHW"), 1, &ranks(2)), Some(1));
        assert_eq!(f.mismatch(None, 1, &ranks(2)), Some(0));
        assert_eq!(f.mismatch(None, 0, &ranks(2)), Some(1));
        assert_eq!(f.mismatch(Some("NCW"), 0, &ranks(2)), Some(1));
    }

    #[test]
    fn componentwise_predicate_broadcasts() {
        let p = IndexPredicate {
            name: "k <= i".into(),
            indices: Signature::parse("ki"),
            func: PredFunc::ComponentWise(Arc::new(|v: &[i64]| v[0] <= v[1])),
            template: Arc::new(|l: &[String]| format!("{} <= {}", l[0], l[1])),
        };
        let ok: IndexDims = [('k', vec![3]), ('i', vec![5, 4])].into_iter().collect();
        let bad: IndexDims = [('k', vec![3]), ('i', vec![5, 2])].into_iter().collect();
        assert_eq!(p.holds(&ok), Some(true));
        assert_eq!(p.holds(&bad), Some(false));
        assert_eq!(p.describe(&["k".into(), "i".into()]), "k <= i");
    }

    #[test]
    fn snake_desc() {
        let idx = Index {
            code: 'i',
            desc: "Input Spatial".into(),
            primary: 'i',
            ranks: Some(RankRange::new(1, 3)),
        };
        assert_eq!(idx.snake_desc(), "input_spatial");
    }
}
