// infer.rs — Inference graph: minimal-edit repair of observed arguments
//
// Evaluated at a fixed edit budget, this graph enumerates every
// interpretation of the observed call (layout, index ranks, indel placement,
// option and format values) whose total repair cost fits the budget, and
// assembles each into a `Fix`:
//
//   layout → ranks → signatures → indels → index usage → constraints → fix
//                               → dtypes ─────────────────────────────→
//
// Rank ranges are narrowed from the observed shape lengths (within the
// available budget) before any indel is placed. Index usage resolves each
// index's dims by majority vote across arguments; computed indices are then
// derived, compared against their observed uses and checked against the
// schema's predicates.
//
// Preconditions: the observed shapes/dtypes/values passed the local checks.
// Postconditions: each produced `Fix` has `cost()` equal to the combination
//                 cost and at most the budget.
// Failure modes: malformed schema data → `EvalError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::trace;

use crate::args::ArgValue;
use crate::budget::EditBudget;
use crate::config::SearchConfig;
use crate::dims::FormulaArgs;
use crate::dtype::DType;
use crate::eval::{take, EvalError, NodeFunc, ParentValues, Yield};
use crate::fix::{DTypesEdit, Edit, EditValue, Fix, FormulaTrail, ShapeEdit, Slot, Violation, WorkingShape};
use crate::graph::{Graph, GraphError, NodeId};
use crate::model::{dims_string, Dims, IndexCode, IndexDims, IndexPredicate, IndexRanks, RankRange, Shape, SigMap, Signature};
use crate::pred::ObservedCall;
use crate::schema::{sig_for_layout, ArgKind, OpDef};

pub struct InferCtx<'a> {
    pub def: &'a OpDef,
    pub config: &'a SearchConfig,
}

#[derive(Debug, Clone)]
pub enum InferNode {
    Shapes,
    DTypes,
    Values,
    Layout,
    /// Rank of a primary index.
    RankRange(IndexCode),
    /// Rank of a shadow index, copied from its primary.
    RankEquiv(IndexCode),
    IndexRanks,
    Sig { key: String, sigs: Vec<Signature> },
    SigMap,
    DTypeEdit,
    ArgIndels,
    IndexUsage,
    IndexConstraints,
    OptionValue { arg: String, options: Vec<String> },
    DataFormat { arg: String },
    RankArg { arg: String, sig: Signature },
    Report,
}

/// Use of one index by one argument after indels.
#[derive(Debug, Clone, PartialEq)]
struct Usage {
    index: IndexCode,
    key: String,
    offset: usize,
    slots: Vec<Slot>,
    bcast: bool,
}

/// Shape repair in progress, with the per-index usages it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeState {
    edit: ShapeEdit,
    usage: Vec<Usage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferValue {
    Shapes(BTreeMap<String, Shape>),
    DTypes(Vec<(String, DType)>),
    Values(BTreeMap<String, ArgValue>),
    Layout(usize),
    Rank(u32),
    Ranks(IndexRanks),
    Sig(Signature),
    SigMap(SigMap),
    DTypesEdit(DTypesEdit),
    State(Box<ShapeState>),
    ShapeEdit(Box<ShapeEdit>),
    ValueEdit(Option<Edit>),
    Fix(Box<Fix>),
}

// ── Parent accessors ────────────────────────────────────────────────────────

fn layout_of(v: &InferValue) -> Option<usize> {
    match v {
        InferValue::Layout(l) => Some(*l),
        _ => None,
    }
}

fn ranks_of(v: &InferValue) -> Option<&IndexRanks> {
    match v {
        InferValue::Ranks(r) => Some(r),
        _ => None,
    }
}

fn values_of(v: &InferValue) -> Option<&BTreeMap<String, ArgValue>> {
    match v {
        InferValue::Values(x) => Some(x),
        _ => None,
    }
}

fn state_of(v: &InferValue) -> Option<&ShapeState> {
    match v {
        InferValue::State(s) => Some(s),
        _ => None,
    }
}

/// Observed values with accepted value edits applied.
fn corrected_values(values: &BTreeMap<String, ArgValue>, parents: &ParentValues<'_, InferValue>) -> BTreeMap<String, ArgValue> {
    let mut out = values.clone();
    for (name, v) in parents.named() {
        if let InferValue::ValueEdit(Some(Edit {
            after: EditValue::Value(after),
            ..
        })) = v
        {
            out.insert(name.to_string(), after.clone());
        }
    }
    out
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// k-subsets of `0..n` in lexicographic order, at most `cap`.
fn combinations(n: usize, k: usize, cap: usize) -> Vec<Vec<usize>> {
    if k > n || cap == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut cur: Vec<usize> = (0..k).collect();
    loop {
        out.push(cur.clone());
        if out.len() >= cap {
            break;
        }
        let Some(i) = (0..k).rev().find(|&i| cur[i] < n - k + i) else {
            break;
        };
        cur[i] += 1;
        for j in i + 1..k {
            cur[j] = cur[j - 1] + 1;
        }
    }
    out
}

/// Every way to bring `dims` to `expected` length: inserted positions are
/// placeholders filled after dims are resolved; deletions become edits.
fn indel_options(key: &str, dims: &[i64], expected: usize, cap: usize) -> Vec<(WorkingShape, Vec<Edit>)> {
    let n = dims.len();
    if expected >= n {
        combinations(expected, expected - n, cap)
            .into_iter()
            .map(|pos| {
                let mut observed = dims.iter().copied();
                let mut slots = Vec::with_capacity(expected);
                for p in 0..expected {
                    if pos.contains(&p) {
                        slots.push(Slot::Inserted);
                    } else if let Some(v) = observed.next() {
                        slots.push(Slot::Observed(v));
                    }
                }
                (WorkingShape::Dims(slots), Vec::new())
            })
            .collect()
    } else {
        combinations(n, n - expected, cap)
            .into_iter()
            .map(|pos| {
                let slots = dims
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !pos.contains(i))
                    .map(|(_, &v)| Slot::Observed(v))
                    .collect();
                let edits = pos.iter().map(|&p| Edit::delete_dim(key, p, dims[p])).collect();
                (WorkingShape::Dims(slots), edits)
            })
            .collect()
    }
}

/// Most frequent value, earliest first among ties.
fn majority(values: impl Iterator<Item = i64>) -> Option<i64> {
    let mut counts: Vec<(i64, usize)> = Vec::new();
    for v in values {
        match counts.iter_mut().find(|(x, _)| *x == v) {
            Some((_, n)) => *n += 1,
            None => counts.push((v, 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max()?;
    counts.into_iter().find(|(_, n)| *n == best).map(|(v, _)| v)
}

/// Edits bringing every observed use in `uses` to `target`.
fn conflicts(uses: &[&Usage], target: &[i64]) -> Vec<Edit> {
    let mut edits = Vec::new();
    for u in uses {
        if u.bcast {
            if let Some(Slot::Observed(v)) = u.slots.first() {
                if target.iter().any(|t| t != v) {
                    let to = target.first().copied().unwrap_or(*v);
                    edits.push(Edit::change_dim(&u.key, None, *v, to));
                }
            }
            continue;
        }
        for (comp, slot) in u.slots.iter().enumerate() {
            if let (Slot::Observed(v), Some(&t)) = (slot, target.get(comp)) {
                if *v != t {
                    edits.push(Edit::change_dim(&u.key, Some(u.offset + comp), *v, t));
                }
            }
        }
    }
    edits
}

fn violation(
    def: &OpDef,
    p: &IndexPredicate,
    dims: &IndexDims,
    ranks: &IndexRanks,
    args: &FormulaArgs,
) -> Result<Violation, EvalError> {
    let labels: Vec<String> = p
        .indices
        .iter()
        .map(|c| dims.get(&c).map(|d| dims_string(d)).unwrap_or_default())
        .collect();
    let detail = p.describe(&labels);

    let trail_codes = def.formula_trail(p);
    let mut trail = Vec::new();
    if !trail_codes.is_empty() {
        let sources: Vec<IndexCode> = dims.keys().copied().filter(|c| !def.dims.is_computed(*c)).collect();
        let label_map = |f: &dyn Fn(IndexCode) -> String| -> BTreeMap<IndexCode, String> {
            sources.iter().map(|&c| (c, f(c))).collect()
        };
        let code = def.dims.render(&label_map(&|c| c.to_string()), ranks, args)?;
        let desc = def.dims.render(
            &label_map(&|c| def.index(c).map(|i| i.snake_desc()).unwrap_or_default()),
            ranks,
            args,
        )?;
        let num = def.dims.render(
            &label_map(&|c| dims.get(&c).map(|d| dims_string(d)).unwrap_or_default()),
            ranks,
            args,
        )?;
        for c in trail_codes {
            trail.push(FormulaTrail {
                index: c,
                code: code.get(&c).cloned().unwrap_or_default(),
                desc: desc.get(&c).cloned().unwrap_or_default(),
                dims: num.get(&c).cloned().unwrap_or_default(),
            });
        }
    }
    Ok(Violation {
        predicate: p.name.clone(),
        detail,
        trail,
    })
}

/// Insert edits for every placeholder, valued from the repaired shape.
fn insertions(edit: &ShapeEdit) -> Vec<Edit> {
    let mut out = Vec::new();
    for (key, working) in &edit.working {
        let WorkingShape::Dims(slots) = working else {
            continue;
        };
        let repaired = edit.repaired(key).unwrap_or_default();
        for (p, slot) in slots.iter().enumerate() {
            if *slot == Slot::Inserted {
                out.push(Edit::insert_dim(key, p, repaired.get(p).copied().unwrap_or(1)));
            }
        }
    }
    out
}

// ── Node functions ──────────────────────────────────────────────────────────

impl InferNode {
    fn name(&self) -> String {
        match self {
            InferNode::RankRange(c) | InferNode::RankEquiv(c) => format!("rank:{c}"),
            InferNode::Sig { key, .. } => format!("sig:{key}"),
            InferNode::OptionValue { arg, .. } | InferNode::DataFormat { arg } | InferNode::RankArg { arg, .. } => {
                format!("value:{arg}")
            }
            other => format!("{other:?}").to_lowercase(),
        }
    }

    fn rank_range(
        c: IndexCode,
        ctx: &InferCtx<'_>,
        parents: &ParentValues<'_, InferValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<InferValue>>, EvalError> {
        let node = format!("rank:{c}");
        let def = ctx.def;
        let shapes = take(parents.at(0), &node, "shapes", "observed shapes", |v| match v {
            InferValue::Shapes(s) => Some(s),
            _ => None,
        })?;
        let values = take(parents.at(1), &node, "values", "observed values", values_of)?;
        let layout = take(parents.at(2), &node, "layout", "a layout", layout_of)?;
        let known: IndexRanks = parents
            .named()
            .filter_map(|(n, v)| match v {
                InferValue::Rank(r) => n.chars().next().map(|c| (c, *r)),
                _ => None,
            })
            .collect();

        let mut range = def.rank_bounds(c, &known);
        let avail = i64::from(budget.remaining());
        for (key, sigs) in def.shape_keys() {
            let (Some(sig), Some(Shape::Dims(d))) = (sig_for_layout(sigs, layout), shapes.get(&key)) else {
                continue;
            };
            let (k, sum, complete) = def.split_rank_sum(sig, c, &known);
            if k == 0 || !complete {
                continue;
            }
            let (k, sum, len) = (i64::from(k), i64::from(sum), d.len() as i64);
            let hi = len + avail - sum;
            if hi < 0 {
                return Ok(Vec::new());
            }
            let lo = (len - avail - sum).max(0);
            let bound = RankRange::new(((lo + k - 1) / k) as u32, (hi / k) as u32);
            range = range.intersect(bound);
        }
        if avail == 0 {
            for a in def.args.iter().filter(|a| a.kind == ArgKind::Rank) {
                let (Some(sig), Some(ArgValue::Int { value })) = (a.sigs.first(), values.get(&a.name)) else {
                    continue;
                };
                let (k, sum, complete) = def.split_rank_sum(sig, c, &known);
                if k == 0 || !complete {
                    continue;
                }
                let rest = value - i64::from(sum);
                if rest < 0 || rest % i64::from(k) != 0 {
                    return Ok(Vec::new());
                }
                let r = (rest / i64::from(k)) as u32;
                range = range.intersect(RankRange::new(r, r));
            }
        }
        Ok(range.iter().map(|r| Yield::free(InferValue::Rank(r))).collect())
    }

    fn arg_indels(
        ctx: &InferCtx<'_>,
        parents: &ParentValues<'_, InferValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<InferValue>>, EvalError> {
        let node = "argindels";
        let ranks = take(parents.at(0), node, "ranks", "index ranks", ranks_of)?;
        let sigmap = take(parents.at(1), node, "sigmap", "a signature map", |v| match v {
            InferValue::SigMap(s) => Some(s),
            _ => None,
        })?;
        let shapes = take(parents.at(2), node, "shapes", "observed shapes", |v| match v {
            InferValue::Shapes(s) => Some(s),
            _ => None,
        })?;
        let cap = ctx.config.max_yield_count;

        let mut options: Vec<(String, Vec<(WorkingShape, Vec<Edit>)>)> = Vec::new();
        let mut total = 0u32;
        for (key, sig) in sigmap.iter() {
            match shapes.get(key) {
                Some(Shape::Bcast(v)) => options.push((key.to_string(), vec![(WorkingShape::Bcast(*v), Vec::new())])),
                Some(Shape::Dims(d)) => {
                    let expected = sig.rank(ranks).ok_or_else(|| EvalError::MissingRank {
                        index: sig.iter().find(|c| !ranks.contains_key(c)).unwrap_or('?'),
                    })?;
                    total += expected.abs_diff(d.len() as u32);
                    options.push((key.to_string(), indel_options(key, d, expected as usize, cap)));
                }
                None => {}
            }
        }
        let Some(r) = budget.reserve(total) else {
            return Ok(Vec::new());
        };

        let mut states: Vec<(Vec<(String, WorkingShape)>, Vec<Edit>)> = vec![(Vec::new(), Vec::new())];
        for (key, opts) in options {
            let mut next = Vec::new();
            'outer: for (working, deletes) in &states {
                for (shape, edits) in &opts {
                    if next.len() >= cap {
                        break 'outer;
                    }
                    let mut w = working.clone();
                    w.push((key.clone(), shape.clone()));
                    let mut d = deletes.clone();
                    d.extend(edits.iter().cloned());
                    next.push((w, d));
                }
            }
            states = next;
        }
        Ok(states
            .into_iter()
            .map(|(working, indels)| {
                let edit = ShapeEdit {
                    sigs: sigmap.clone(),
                    index_ranks: ranks.clone(),
                    indels,
                    dim_changes: Vec::new(),
                    violations: Vec::new(),
                    index_dims: IndexDims::new(),
                    working,
                };
                Yield::costing(
                    InferValue::State(Box::new(ShapeState {
                        edit,
                        usage: Vec::new(),
                    })),
                    r.cost(),
                )
            })
            .collect())
    }

    fn index_usage(
        ctx: &InferCtx<'_>,
        parents: &ParentValues<'_, InferValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<InferValue>>, EvalError> {
        let state = take(parents.at(0), "indexusage", "argindels", "a shape state", state_of)?;
        let ranks = &state.edit.index_ranks;
        let mut usage = Vec::new();
        for (key, working) in &state.edit.working {
            let Some(sig) = state.edit.sigs.get(key) else {
                continue;
            };
            let mut offset = 0;
            for c in sig.iter() {
                let r = ranks.get(&c).copied().ok_or(EvalError::MissingRank { index: c })? as usize;
                let (slots, bcast) = match working {
                    WorkingShape::Bcast(v) => (vec![Slot::Observed(*v); r], true),
                    WorkingShape::Dims(s) => (s.get(offset..offset + r).unwrap_or_default().to_vec(), false),
                };
                usage.push(Usage {
                    index: c,
                    key: key.clone(),
                    offset,
                    slots,
                    bcast,
                });
                offset += r;
            }
        }

        let dims_graph = &ctx.def.dims;
        let seen: BTreeSet<IndexCode> = usage
            .iter()
            .map(|u| u.index)
            .filter(|c| !dims_graph.is_computed(*c))
            .collect();
        let derived: BTreeSet<IndexCode> = dims_graph.derivable(&seen).into_iter().collect();
        let used: BTreeSet<IndexCode> = usage.iter().map(|u| u.index).collect();

        let mut dims = IndexDims::new();
        let mut changes = Vec::new();
        for c in used.into_iter().filter(|c| !derived.contains(c)) {
            let uses: Vec<&Usage> = usage.iter().filter(|u| u.index == c).collect();
            let r = ranks.get(&c).copied().unwrap_or(0) as usize;
            let resolved: Dims = (0..r)
                .map(|comp| {
                    let observed = uses.iter().filter_map(|u| match u.slots.get(comp) {
                        Some(Slot::Observed(v)) => Some(*v),
                        _ => None,
                    });
                    majority(observed).unwrap_or(1)
                })
                .collect();
            changes.extend(conflicts(&uses, &resolved));
            dims.insert(c, resolved);
        }

        let Some(r) = budget.reserve(changes.len() as u32) else {
            return Ok(Vec::new());
        };
        let mut next = state.clone();
        next.edit.dim_changes = changes;
        next.edit.index_dims = dims;
        next.usage = usage;
        Ok(vec![Yield::costing(InferValue::State(Box::new(next)), r.cost())])
    }

    fn index_constraints(
        ctx: &InferCtx<'_>,
        parents: &ParentValues<'_, InferValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<InferValue>>, EvalError> {
        let node = "indexconstraints";
        let def = ctx.def;
        let state = take(parents.at(0), node, "indexusage", "a shape state", state_of)?;
        let values = take(parents.at(1), node, "values", "observed values", values_of)?;
        let layout = take(parents.at(2), node, "layout", "a layout", layout_of)?;
        let args = def.formula_args(&corrected_values(values, parents), layout);
        let ranks = &state.edit.index_ranks;

        let computed = def.dims.compute(&state.edit.index_dims, ranks, &args)?;
        let mut changes = Vec::new();
        for (c, d) in &computed {
            if d.iter().all(|&v| v >= 0) {
                let uses: Vec<&Usage> = state.usage.iter().filter(|u| u.index == *c).collect();
                changes.extend(conflicts(&uses, d));
            }
        }
        let mut dims = state.edit.index_dims.clone();
        dims.extend(computed);
        let violations = def
            .violated(&dims)
            .into_iter()
            .map(|p| violation(def, p, &dims, ranks, &args))
            .collect::<Result<Vec<_>, _>>()?;

        let Some(r) = budget.reserve((changes.len() + violations.len()) as u32) else {
            return Ok(Vec::new());
        };
        let mut edit = state.edit.clone();
        edit.dim_changes.extend(changes);
        edit.violations = violations;
        edit.index_dims = dims;
        let inserts = insertions(&edit);
        edit.indels.extend(inserts);
        Ok(vec![Yield::costing(InferValue::ShapeEdit(Box::new(edit)), r.cost())])
    }
}

impl<'a> NodeFunc<InferCtx<'a>> for InferNode {
    type Value = InferValue;
    type Error = EvalError;

    fn eval(
        &self,
        ctx: &mut InferCtx<'a>,
        parents: &ParentValues<'_, InferValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<InferValue>>, EvalError> {
        let def = ctx.def;
        let node = self.name();
        let value = match self {
            InferNode::Shapes | InferNode::DTypes | InferNode::Values => return Ok(Vec::new()),
            InferNode::Layout => {
                return Ok((0..def.num_layouts())
                    .map(|l| Yield::free(InferValue::Layout(l)))
                    .collect())
            }
            InferNode::RankRange(c) => return Self::rank_range(*c, ctx, parents, budget),
            InferNode::ArgIndels => return Self::arg_indels(ctx, parents, budget),
            InferNode::IndexUsage => return Self::index_usage(ctx, parents, budget),
            InferNode::IndexConstraints => return Self::index_constraints(ctx, parents, budget),
            InferNode::RankEquiv(_) => {
                let r = take(parents.at(0), &node, "primary", "a rank", |v| match v {
                    InferValue::Rank(r) => Some(*r),
                    _ => None,
                })?;
                InferValue::Rank(r)
            }
            InferNode::IndexRanks => InferValue::Ranks(
                parents
                    .named()
                    .filter_map(|(n, v)| match (n.chars().next(), v) {
                        (Some(c), InferValue::Rank(r)) => Some((c, *r)),
                        _ => None,
                    })
                    .collect(),
            ),
            InferNode::Sig { sigs, .. } => {
                let layout = take(parents.at(0), &node, "layout", "a layout", layout_of)?;
                match sig_for_layout(sigs, layout) {
                    Some(sig) => InferValue::Sig(sig.clone()),
                    None => return Ok(Vec::new()),
                }
            }
            InferNode::SigMap => InferValue::SigMap(SigMap(
                parents
                    .named()
                    .filter_map(|(k, v)| match v {
                        InferValue::Sig(s) => Some((k.to_string(), s.clone())),
                        _ => None,
                    })
                    .collect(),
            )),
            InferNode::DTypeEdit => {
                let dtypes = take(parents.at(0), &node, "dtypes", "observed dtypes", |v| match v {
                    InferValue::DTypes(d) => Some(d),
                    _ => None,
                })?;
                let ranks = take(parents.at(1), &node, "ranks", "index ranks", ranks_of)?;
                let layout = take(parents.at(2), &node, "layout", "a layout", layout_of)?;
                let edit = def.dtype_rules.edit(dtypes, ranks, layout);
                let Some(r) = budget.reserve(edit.cost()) else {
                    return Ok(Vec::new());
                };
                return Ok(vec![Yield::costing(InferValue::DTypesEdit(edit), r.cost())]);
            }
            InferNode::OptionValue { arg, options } => {
                let values = take(parents.at(0), &node, "values", "observed values", values_of)?;
                let observed = values.get(arg).cloned().unwrap_or(ArgValue::None);
                let mut out = Vec::new();
                if options.iter().any(|o| observed.as_str() == Some(o.as_str())) {
                    out.push(Yield::free(InferValue::ValueEdit(None)));
                }
                for opt in options.iter().filter(|o| observed.as_str() != Some(o.as_str())) {
                    if let Some(r) = budget.reserve(1) {
                        let e = Edit::change_value(arg, observed.clone(), ArgValue::str(opt));
                        out.push(Yield::costing(InferValue::ValueEdit(Some(e)), r.cost()));
                    }
                }
                return Ok(out);
            }
            InferNode::DataFormat { arg } => {
                let ranks = take(parents.at(0), &node, "ranks", "index ranks", ranks_of)?;
                let layout = take(parents.at(1), &node, "layout", "a layout", layout_of)?;
                let values = take(parents.at(2), &node, "values", "observed values", values_of)?;
                let observed = values.get(arg).cloned().unwrap_or(ArgValue::None);
                let Some(cost) = def.formats.mismatch(observed.as_str(), layout, ranks) else {
                    return Ok(Vec::new());
                };
                if cost == 0 {
                    InferValue::ValueEdit(None)
                } else {
                    let (Some(implied), Some(r)) = (def.formats.format_for(layout, ranks), budget.reserve(cost)) else {
                        return Ok(Vec::new());
                    };
                    let e = Edit::change_value(arg, observed, ArgValue::str(implied));
                    return Ok(vec![Yield::costing(InferValue::ValueEdit(Some(e)), r.cost())]);
                }
            }
            InferNode::RankArg { arg, sig } => {
                let ranks = take(parents.at(0), &node, "ranks", "index ranks", ranks_of)?;
                let values = take(parents.at(1), &node, "values", "observed values", values_of)?;
                let expected = sig.rank(ranks).ok_or(EvalError::MissingRank {
                    index: sig.iter().next().unwrap_or('?'),
                })?;
                let observed = values.get(arg).cloned().unwrap_or(ArgValue::None);
                if observed.as_int() == Some(i64::from(expected)) {
                    InferValue::ValueEdit(None)
                } else {
                    let Some(r) = budget.reserve(1) else {
                        return Ok(Vec::new());
                    };
                    let e = Edit::change_value(arg, observed, ArgValue::int(i64::from(expected)));
                    return Ok(vec![Yield::costing(InferValue::ValueEdit(Some(e)), r.cost())]);
                }
            }
            InferNode::Report => {
                let dtypes = take(parents.at(0), &node, "dtypes", "a dtype edit", |v| match v {
                    InferValue::DTypesEdit(e) => Some(e),
                    _ => None,
                })?;
                let shape = take(parents.at(1), &node, "constraints", "a shape edit", |v| match v {
                    InferValue::ShapeEdit(e) => Some(e),
                    _ => None,
                })?;
                let layout = take(parents.at(2), &node, "layout", "a layout", layout_of)?;
                let values = parents
                    .named()
                    .filter_map(|(_, v)| match v {
                        InferValue::ValueEdit(Some(e)) => Some(e.clone()),
                        _ => None,
                    })
                    .collect();
                InferValue::Fix(Box::new(Fix {
                    layout,
                    dtypes: dtypes.clone(),
                    shape: (**shape).clone(),
                    values,
                }))
            }
        };
        Ok(vec![Yield::free(value)])
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct InferGraph {
    graph: Graph<InferNode>,
    shapes: NodeId,
    dtypes: NodeId,
    values: NodeId,
    report: NodeId,
}

pub fn build(def: &OpDef) -> Result<InferGraph, GraphError> {
    let mut g = Graph::new();
    let shapes = g.add_node("shapes", InferNode::Shapes, &[])?;
    let dtypes = g.add_node("dtypes", InferNode::DTypes, &[])?;
    let values = g.add_node("values", InferNode::Values, &[])?;
    let layout = g.add_node("layout", InferNode::Layout, &[])?;

    let mut rank_nodes: Vec<(IndexCode, NodeId)> = Vec::new();
    for c in def.primaries() {
        let n = g.add_node(format!("rank:{c}"), InferNode::RankRange(c), &[shapes, values, layout])?;
        for (earlier, e) in &rank_nodes {
            g.append_named(n, *e, earlier.to_string())?;
        }
        rank_nodes.push((c, n));
    }
    for idx in def.indices.iter().filter(|i| !i.is_primary()) {
        let Some(&(_, p)) = rank_nodes.iter().find(|(c, _)| *c == idx.primary) else {
            continue;
        };
        let n = g.add_node(format!("rank:{}", idx.code), InferNode::RankEquiv(idx.code), &[p])?;
        rank_nodes.push((idx.code, n));
    }
    let ranks = g.add_node("ranks", InferNode::IndexRanks, &[])?;
    for (c, n) in &rank_nodes {
        g.append_named(ranks, *n, c.to_string())?;
    }

    let sigmap = g.add_node("sigmap", InferNode::SigMap, &[])?;
    for (key, sigs) in def.shape_keys() {
        let n = g.add_node(
            format!("sig:{key}"),
            InferNode::Sig {
                key: key.clone(),
                sigs: sigs.to_vec(),
            },
            &[layout],
        )?;
        g.append_named(sigmap, n, key)?;
    }

    let dtype_edit = g.add_node("dtype_edit", InferNode::DTypeEdit, &[dtypes, ranks, layout])?;
    let indels = g.add_node("arg_indels", InferNode::ArgIndels, &[ranks, sigmap, shapes])?;
    let usage = g.add_node("index_usage", InferNode::IndexUsage, &[indels])?;

    let mut value_nodes = Vec::new();
    for a in &def.args {
        let (func, parents) = match &a.kind {
            ArgKind::Options(options) => (
                InferNode::OptionValue {
                    arg: a.name.clone(),
                    options: options.clone(),
                },
                vec![values],
            ),
            ArgKind::DataFormat => (InferNode::DataFormat { arg: a.name.clone() }, vec![ranks, layout, values]),
            ArgKind::Rank => match a.sigs.first() {
                Some(sig) => (
                    InferNode::RankArg {
                        arg: a.name.clone(),
                        sig: sig.clone(),
                    },
                    vec![ranks, values],
                ),
                None => continue,
            },
            _ => continue,
        };
        value_nodes.push((a.name.clone(), g.add_node(format!("value:{}", a.name), func, &parents)?));
    }

    let constraints = g.add_node(
        "index_constraints",
        InferNode::IndexConstraints,
        &[usage, values, layout],
    )?;
    let report = g.add_node("report", InferNode::Report, &[dtype_edit, constraints, layout])?;
    for (name, n) in &value_nodes {
        g.append_named(constraints, *n, name.clone())?;
        g.append_named(report, *n, name.clone())?;
    }

    trace!(op = %def.op_path, nodes = g.len(), "inference graph built");
    Ok(InferGraph {
        graph: g,
        shapes,
        dtypes,
        values,
        report,
    })
}

impl InferGraph {
    /// Every distinct fix of total cost at most `budget`.
    pub fn fixes(
        &self,
        def: &OpDef,
        observed: &ObservedCall,
        config: &SearchConfig,
        budget: u32,
    ) -> Result<Vec<Fix>, EvalError> {
        let supplied = HashMap::from([
            (self.shapes, InferValue::Shapes(observed.shapes.clone())),
            (self.dtypes, InferValue::DTypes(observed.dtypes.clone())),
            (self.values, InferValue::Values(observed.values.clone())),
        ]);
        let ev = self.graph.evaluate(
            InferCtx { def, config },
            &[self.report],
            supplied,
            config.eval_config(budget),
        )?;
        let mut out: Vec<Fix> = Vec::new();
        for comb in ev {
            for v in comb?.values {
                if let InferValue::Fix(f) = v {
                    if !out.contains(&*f) {
                        out.push(*f);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinations_are_lexicographic() {
        assert_eq!(combinations(3, 2, 10), vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
        assert_eq!(combinations(3, 0, 10), vec![Vec::<usize>::new()]);
        assert_eq!(combinations(4, 2, 2).len(), 2);
        assert!(combinations(1, 2, 10).is_empty());
    }

    #[test]
    fn indels_place_placeholders_and_deletions() {
        let ins = indel_options("x", &[5, 6], 3, 10);
        assert_eq!(ins.len(), 3);
        assert_eq!(
            ins[0].0,
            WorkingShape::Dims(vec![Slot::Inserted, Slot::Observed(5), Slot::Observed(6)])
        );
        let del = indel_options("x", &[5, 6, 7], 2, 10);
        assert_eq!(del.len(), 3);
        assert_eq!(del[2].0, WorkingShape::Dims(vec![Slot::Observed(5), Slot::Observed(6)]));
        assert_eq!(del[2].1, vec![Edit::delete_dim("x", 2, 7)]);
    }

    #[test]
    fn majority_prefers_earliest_on_ties() {
        assert_eq!(majority([4, 5, 5].into_iter()), Some(5));
        assert_eq!(majority([4, 5].into_iter()), Some(4));
        assert_eq!(majority(std::iter::empty()), None);
    }

    #[test]
    fn conflicts_report_each_dimension() {
        let u = Usage {
            index: 'i',
            key: "x".into(),
            offset: 1,
            slots: vec![Slot::Observed(3), Slot::Inserted, Slot::Observed(9)],
            bcast: false,
        };
        let edits = conflicts(&[&u], &[3, 4, 5]);
        assert_eq!(edits, vec![Edit::change_dim("x", Some(3), 9, 5)]);
        let b = Usage {
            index: 'k',
            key: "ksize".into(),
            offset: 0,
            slots: vec![Slot::Observed(2); 2],
            bcast: true,
        };
        assert_eq!(conflicts(&[&b], &[3, 3]), vec![Edit::change_dim("ksize", None, 2, 3)]);
        assert!(conflicts(&[&b], &[2, 2]).is_empty());
    }
}
