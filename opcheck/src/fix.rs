// fix.rs — Edits and fixes proposed for a failing call
//
// An `Edit` is one atomic change to one argument. A `Fix` bundles every edit
// needed to make a call valid: dtype changes, shape indels and dimension
// changes, predicate violations, and scalar value changes. Fixes can be
// applied to the original arguments to obtain the repaired call.
//
// Preconditions: a `Fix` is applied to the same `CallArgs` it was computed
//                from.
// Postconditions: `Fix::cost` is the sum of all edit and violation costs.
// Failure modes: none; edits that no longer fit the arguments are skipped.
// Side effects: none.

use std::fmt;

use serde::Serialize;

use crate::args::{ArgValue, CallArgs};
use crate::dtype::DType;
use crate::model::{dims_string, IndexCode, IndexDims, IndexRanks, SigMap};

// ── Edits ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EditKind {
    InsertDim,
    DeleteDim,
    ChangeDim,
    ChangeDType,
    ChangeValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EditValue {
    Absent,
    Dim(i64),
    DType(DType),
    Value(ArgValue),
}

impl fmt::Display for EditValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditValue::Absent => write!(f, "-"),
            EditValue::Dim(d) => write!(f, "{d}"),
            EditValue::DType(d) => write!(f, "{d}"),
            EditValue::Value(v) => write!(f, "{v}"),
        }
    }
}

/// One atomic change. `pos` is the dimension position: in the observed
/// shape for deletions, in the repaired shape for insertions and changes,
/// `None` for whole-value edits and broadcast integers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edit {
    pub kind: EditKind,
    pub arg: String,
    pub pos: Option<usize>,
    pub cost: u32,
    pub before: EditValue,
    pub after: EditValue,
    /// Other acceptable values for `after`, including `after` itself.
    pub alternatives: Vec<EditValue>,
}

impl Edit {
    fn new(kind: EditKind, arg: &str, pos: Option<usize>, before: EditValue, after: EditValue) -> Self {
        Self {
            kind,
            arg: arg.to_string(),
            pos,
            cost: 1,
            before,
            after,
            alternatives: Vec::new(),
        }
    }

    pub fn insert_dim(arg: &str, pos: usize, dim: i64) -> Self {
        Self::new(EditKind::InsertDim, arg, Some(pos), EditValue::Absent, EditValue::Dim(dim))
    }

    pub fn delete_dim(arg: &str, pos: usize, dim: i64) -> Self {
        Self::new(EditKind::DeleteDim, arg, Some(pos), EditValue::Dim(dim), EditValue::Absent)
    }

    pub fn change_dim(arg: &str, pos: Option<usize>, before: i64, after: i64) -> Self {
        Self::new(EditKind::ChangeDim, arg, pos, EditValue::Dim(before), EditValue::Dim(after))
    }

    pub fn change_dtype(arg: &str, before: DType, after: DType, alternatives: &[DType]) -> Self {
        let mut e = Self::new(
            EditKind::ChangeDType,
            arg,
            None,
            EditValue::DType(before),
            EditValue::DType(after),
        );
        e.alternatives = alternatives.iter().map(|&d| EditValue::DType(d)).collect();
        e
    }

    pub fn change_value(arg: &str, before: ArgValue, after: ArgValue) -> Self {
        Self::new(
            EditKind::ChangeValue,
            arg,
            None,
            EditValue::Value(before),
            EditValue::Value(after),
        )
    }

    pub fn describe(&self) -> String {
        let arg = &self.arg;
        match (self.kind, self.pos) {
            (EditKind::InsertDim, Some(p)) => {
                format!("insert dimension {} at position {p} of '{arg}'", self.after)
            }
            (EditKind::DeleteDim, Some(p)) => {
                format!("delete dimension {} at position {p} of '{arg}'", self.before)
            }
            (EditKind::ChangeDim, Some(p)) => format!(
                "change dimension {p} of '{arg}' from {} to {}",
                self.before, self.after
            ),
            (EditKind::ChangeDType, _) if self.alternatives.len() > 1 => {
                let alts: Vec<String> = self.alternatives.iter().map(|a| a.to_string()).collect();
                format!(
                    "change dtype of '{arg}' from {} to {} (any of {})",
                    self.before,
                    self.after,
                    alts.join(", ")
                )
            }
            (EditKind::ChangeDType, _) => {
                format!("change dtype of '{arg}' from {} to {}", self.before, self.after)
            }
            _ => format!("change '{arg}' from {} to {}", self.before, self.after),
        }
    }
}

// ── Violations ──────────────────────────────────────────────────────────────

/// One step of the derivation behind a violated predicate, rendered three
/// ways: index codes, index descriptions, and numeric dims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormulaTrail {
    pub index: IndexCode,
    pub code: String,
    pub desc: String,
    pub dims: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub predicate: String,
    /// The predicate rendered over numeric dims.
    pub detail: String,
    pub trail: Vec<FormulaTrail>,
}

// ── Shape repair ────────────────────────────────────────────────────────────

/// One position of an argument shape after indels were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Slot {
    Observed(i64),
    Inserted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorkingShape {
    Dims(Vec<Slot>),
    Bcast(i64),
}

/// Shape side of a fix: indels first, then dimension changes, plus any
/// index predicates the repaired dims still violate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapeEdit {
    pub sigs: SigMap,
    pub index_ranks: IndexRanks,
    pub indels: Vec<Edit>,
    pub dim_changes: Vec<Edit>,
    pub violations: Vec<Violation>,
    /// Resolved dims of every index, computed ones included.
    pub index_dims: IndexDims,
    pub working: Vec<(String, WorkingShape)>,
}

impl ShapeEdit {
    pub fn cost(&self) -> u32 {
        let edits: u32 = self.indels.iter().chain(&self.dim_changes).map(|e| e.cost).sum();
        edits + self.violations.len() as u32
    }

    /// Shape of `key` after repair.
    pub fn repaired(&self, key: &str) -> Option<Vec<i64>> {
        self.sigs.get(key)?.shape(&self.index_dims)
    }

    fn working(&self, key: &str) -> Option<&WorkingShape> {
        self.working.iter().find(|(k, _)| k == key).map(|(_, w)| w)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DTypesEdit {
    pub changes: Vec<Edit>,
    /// Excluded combination still matched, with the edit that escapes it.
    pub excluded: Option<(String, Option<Edit>)>,
}

impl DTypesEdit {
    pub fn cost(&self) -> u32 {
        let changes: u32 = self.changes.iter().map(|e| e.cost).sum();
        changes + u32::from(self.excluded.is_some())
    }
}

// ── Fix ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fix {
    pub layout: usize,
    pub dtypes: DTypesEdit,
    pub shape: ShapeEdit,
    /// Option, data-format and rank-argument changes.
    pub values: Vec<Edit>,
}

impl Fix {
    pub fn cost(&self) -> u32 {
        let values: u32 = self.values.iter().map(|e| e.cost).sum();
        self.dtypes.cost() + self.shape.cost() + values
    }

    pub fn index_ranks(&self) -> &IndexRanks {
        &self.shape.index_ranks
    }

    pub fn is_empty(&self) -> bool {
        self.cost() == 0
    }

    /// Every concrete edit in application order.
    pub fn edits(&self) -> Vec<&Edit> {
        let excluded = self.dtypes.excluded.as_ref().and_then(|(_, e)| e.as_ref());
        self.dtypes
            .changes
            .iter()
            .chain(excluded)
            .chain(&self.shape.indels)
            .chain(&self.shape.dim_changes)
            .chain(&self.values)
            .collect()
    }

    /// Apply the fix to `args`, returning the repaired call.
    pub fn apply(&self, args: &CallArgs) -> CallArgs {
        let mut out = args.clone();
        for (key, _) in self.shape.sigs.iter() {
            let Some(dims) = self.shape.repaired(key) else {
                continue;
            };
            let was_bcast = matches!(self.shape.working(key), Some(WorkingShape::Bcast(_)));
            let (name, column) = split_key(key);
            if let Some(value) = out.get_mut(name) {
                apply_shape(value, &dims, was_bcast, column);
            }
        }
        for edit in self.edits() {
            match (&edit.kind, &edit.after) {
                (EditKind::ChangeDType, EditValue::DType(d)) => {
                    if let Some(ArgValue::Tensor { dtype, .. }) = out.get_mut(&edit.arg) {
                        *dtype = *d;
                    }
                }
                (EditKind::ChangeValue, EditValue::Value(v)) => out.set(&edit.arg, v.clone()),
                _ => {}
            }
        }
        out
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.edits().iter().map(|e| e.describe()).collect();
        if let Some((combo, None)) = &self.dtypes.excluded {
            parts.push(format!("avoid the unsupported combination {combo}"));
        }
        for v in &self.shape.violations {
            parts.push(format!("satisfy {} ({})", v.predicate, v.detail));
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// `"name.1"` → (`"name"`, `Some(1)`): the column key of a 2-D shape tensor.
pub fn split_key(key: &str) -> (&str, Option<usize>) {
    match key.rsplit_once('.') {
        Some((name, col)) => match col.parse() {
            Ok(c) => (name, Some(c)),
            Err(_) => (key, None),
        },
        None => (key, None),
    }
}

fn apply_shape(value: &mut ArgValue, dims: &[i64], was_bcast: bool, column: Option<usize>) {
    let uniform = dims.first().filter(|&&d| dims.iter().all(|&x| x == d)).copied();
    match value {
        ArgValue::Tensor { shape, .. } => *shape = dims.to_vec(),
        ArgValue::IntList { values } => {
            *values = match (was_bcast, uniform) {
                (true, Some(d)) => vec![d],
                _ => dims.to_vec(),
            }
        }
        ArgValue::Int { value } => {
            if let Some(d) = uniform {
                *value = d;
            }
        }
        ArgValue::IntTensor { values } => *values = dims.to_vec(),
        ArgValue::IntTensor2D { rows } => {
            let Some(col) = column else {
                return;
            };
            rows.resize_with(dims.len(), Vec::new);
            for (row, &d) in rows.iter_mut().zip(dims) {
                if row.len() <= col {
                    row.resize(col + 1, 0);
                }
                row[col] = d;
            }
        }
        _ => {}
    }
}

/// Successful check: the interpretation under which the call is valid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCall {
    pub layout: usize,
    pub index_ranks: IndexRanks,
    pub index_dims: IndexDims,
    pub sigs: SigMap,
}

impl ResolvedCall {
    pub fn from_fix(fix: &Fix) -> Self {
        Self {
            layout: fix.layout,
            index_ranks: fix.shape.index_ranks.clone(),
            index_dims: fix.shape.index_dims.clone(),
            sigs: fix.shape.sigs.clone(),
        }
    }

    pub fn dims_summary(&self) -> String {
        let parts: Vec<String> = self
            .index_dims
            .iter()
            .map(|(c, d)| format!("{c}={}", dims_string(d)))
            .collect();
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signature;

    fn shape_edit(dims: IndexDims, working: Vec<(String, WorkingShape)>) -> ShapeEdit {
        ShapeEdit {
            sigs: SigMap(vec![
                ("x".into(), Signature::parse("bi")),
                ("k".into(), Signature::parse("i")),
            ]),
            index_ranks: [('b', 1), ('i', 2)].into_iter().collect(),
            indels: vec![],
            dim_changes: vec![],
            violations: vec![],
            index_dims: dims,
            working,
        }
    }

    #[test]
    fn describe_edits() {
        assert_eq!(
            Edit::insert_dim("x", 2, 5).describe(),
            "insert dimension 5 at position 2 of 'x'"
        );
        assert_eq!(
            Edit::change_dim("x", Some(0), 3, 4).describe(),
            "change dimension 0 of 'x' from 3 to 4"
        );
        assert_eq!(
            Edit::change_dtype("x", DType::Float64, DType::Float32, &[DType::Float32, DType::Int32]).describe(),
            "change dtype of 'x' from float64 to float32 (any of float32, int32)"
        );
        assert_eq!(
            Edit::change_value("p", ArgValue::str("FULL"), ArgValue::str("SAME")).describe(),
            "change 'p' from 'FULL' to 'SAME'"
        );
    }

    #[test]
    fn apply_rewrites_shapes_dtypes_and_values() {
        let dims: IndexDims = [('b', vec![2]), ('i', vec![4, 4])].into_iter().collect();
        let mut fix = Fix {
            layout: 0,
            dtypes: DTypesEdit {
                changes: vec![Edit::change_dtype("x", DType::Float64, DType::Float32, &[DType::Float32])],
                excluded: None,
            },
            shape: shape_edit(
                dims,
                vec![
                    ("x".into(), WorkingShape::Dims(vec![Slot::Observed(2), Slot::Observed(4), Slot::Inserted])),
                    ("k".into(), WorkingShape::Bcast(3)),
                ],
            ),
            values: vec![Edit::change_value("p", ArgValue::str("FULL"), ArgValue::str("SAME"))],
        };
        fix.shape.indels.push(Edit::insert_dim("x", 2, 4));
        fix.shape.dim_changes.push(Edit::change_dim("k", None, 3, 4));
        let args = CallArgs::new()
            .with("x", ArgValue::tensor(&[2, 4], DType::Float64))
            .with("k", ArgValue::ints(&[3]))
            .with("p", ArgValue::str("FULL"));
        let out = fix.apply(&args);
        assert_eq!(out.get("x"), Some(&ArgValue::tensor(&[2, 4, 4], DType::Float32)));
        assert_eq!(out.get("k"), Some(&ArgValue::ints(&[4])));
        assert_eq!(out.get("p"), Some(&ArgValue::str("SAME")));
        assert_eq!(fix.cost(), 4);
        assert_eq!(fix.edits().len(), 4);
    }

    #[test]
    fn apply_sets_2d_columns() {
        let mut v = ArgValue::IntTensor2D {
            rows: vec![vec![1, 9], vec![2, 9]],
        };
        apply_shape(&mut v, &[5, 6], false, Some(1));
        assert_eq!(
            v,
            ArgValue::IntTensor2D {
                rows: vec![vec![1, 5], vec![2, 6]]
            }
        );
    }

    #[test]
    fn split_keys() {
        assert_eq!(split_key("paddings.1"), ("paddings", Some(1)));
        assert_eq!(split_key("input"), ("input", None));
    }
}
