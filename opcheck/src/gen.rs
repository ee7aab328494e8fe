// gen.rs — Generative graph: valid and deliberately mutated call arguments
//
// The same rank / signature / layout nodes as inference, run forwards:
//
//   layout → ranks → signatures → values → indels → shapes → arguments
//                  → dtypes ───────────────────────────────→
//
// At budget 0 every combination is a valid call. Each unit of budget buys
// one mutation: an out-of-rule dtype, a matched excluded combination, a
// rank indel, a point change of one dimension, an invalid option, or a
// format that disagrees with the layout. The cost of a combination is
// exactly the number of mutations it carries.
//
// Preconditions: `GenCtx::rng` is seeded; generation is deterministic for a
//                given seed.
// Postconditions: each case's `mutations` equals its combination cost.
// Failure modes: malformed schema data → `EvalError`.
// Side effects: consumes randomness from the context RNG.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, trace};

use crate::args::{ArgValue, CallArgs};
use crate::budget::EditBudget;
use crate::config::SearchConfig;
use crate::dims::max_dimsize;
use crate::dtype::{DType, ALL_DTYPES};
use crate::eval::{take, EvalError, NodeFunc, ParentValues, Yield};
use crate::graph::{Graph, GraphError, NodeId, ParentRole};
use crate::model::{Dims, IndexCode, IndexRanks, SigMap, Signature};
use crate::schema::{sig_for_layout, ArgKind, OpDef};

/// Option value no schema accepts, used for option mutations.
pub const DUMMY_OPTION: &str = "DUMMY";

pub struct GenCtx<'s> {
    pub def: &'s OpDef,
    pub config: SearchConfig,
    pub rng: StdRng,
}

/// Rank indel applied to one shape key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indel {
    Insert { key: String, pos: usize },
    Delete { key: String, pos: usize },
}

impl Indel {
    fn key(&self) -> &str {
        match self {
            Indel::Insert { key, .. } | Indel::Delete { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GenNode {
    Layout,
    RankRange(IndexCode),
    RankEquiv(IndexCode),
    IndexRanks,
    Sig { key: String, sigs: Vec<Signature> },
    SigMap,
    /// Root of an equate class. `followed` tensors never take invalid
    /// dtypes, since every follower would inherit the mutation.
    DTypeValid { tensor: String, followed: bool },
    DTypeEquate(String),
    DTypes,
    ArgIndels { mutable: Vec<String> },
    ArgShapes { mutable: Vec<String> },
    TensorArg(String),
    ShapeListArg(String),
    ShapeIntArg { arg: String, lo: i64, hi: Option<i64> },
    ShapeTensorArg(String),
    ShapeTensor2DArg { arg: String, columns: usize },
    RankArg(Signature),
    IntArg { lo: i64, hi: i64 },
    OptionArg(Vec<String>),
    DataFormatArg(String),
    UncheckedArg,
    Args,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenValue {
    Layout(usize),
    Rank(u32),
    Ranks(IndexRanks),
    Sig(Signature),
    SigMap(SigMap),
    DType(DType),
    DTypes(Vec<(String, DType)>),
    Indel(Option<Indel>),
    Shapes(BTreeMap<String, Dims>),
    /// `emitted` goes into the call; `effective` is what formulas see.
    Value { emitted: ArgValue, effective: ArgValue },
    Call(CallArgs),
}

impl GenValue {
    fn plain(v: ArgValue) -> Self {
        GenValue::Value {
            emitted: v.clone(),
            effective: v,
        }
    }
}

/// One generated call and the number of mutations it carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedCase {
    pub args: CallArgs,
    pub mutations: u32,
}

/// One valid rank / signature / dtype / layout combination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryRow {
    pub layout: usize,
    pub ranks: IndexRanks,
    pub sigs: SigMap,
    pub dtypes: Vec<(String, DType)>,
}

// ── Parent accessors ────────────────────────────────────────────────────────

fn layout_of(v: &GenValue) -> Option<usize> {
    match v {
        GenValue::Layout(l) => Some(*l),
        _ => None,
    }
}

fn ranks_of(v: &GenValue) -> Option<&IndexRanks> {
    match v {
        GenValue::Ranks(r) => Some(r),
        _ => None,
    }
}

fn sigmap_of(v: &GenValue) -> Option<&SigMap> {
    match v {
        GenValue::SigMap(s) => Some(s),
        _ => None,
    }
}

fn shapes_of(v: &GenValue) -> Option<&BTreeMap<String, Dims>> {
    match v {
        GenValue::Shapes(s) => Some(s),
        _ => None,
    }
}

fn dtype_of(v: &GenValue) -> Option<DType> {
    match v {
        GenValue::DType(d) => Some(*d),
        _ => None,
    }
}

fn shape_at<'a>(parents: &ParentValues<'a, GenValue>, node: &str, key: &str) -> Result<&'a Dims, EvalError> {
    let shapes = take(parents.at(0), node, "shapes", "generated shapes", shapes_of)?;
    shapes.get(key).ok_or_else(|| EvalError::ParentValue {
        node: node.to_string(),
        parent: "shapes".into(),
        expected: "a shape for this argument",
    })
}

// ── Node functions ──────────────────────────────────────────────────────────

impl GenNode {
    fn kind(&self) -> &'static str {
        match self {
            GenNode::Layout => "layout",
            GenNode::RankRange(_) | GenNode::RankEquiv(_) => "rank",
            GenNode::IndexRanks => "ranks",
            GenNode::Sig { .. } => "sig",
            GenNode::SigMap => "sigmap",
            GenNode::DTypeValid { .. } | GenNode::DTypeEquate(_) => "dtype",
            GenNode::DTypes => "dtypes",
            GenNode::ArgIndels { .. } => "arg_indels",
            GenNode::ArgShapes { .. } => "arg_shapes",
            GenNode::Args => "args",
            _ => "arg",
        }
    }

    fn arg_shapes(
        mutable: &[String],
        ctx: &mut GenCtx<'_>,
        parents: &ParentValues<'_, GenValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<GenValue>>, EvalError> {
        let node = "arg_shapes";
        let def = ctx.def;
        let ranks = take(parents.at(0), node, "ranks", "index ranks", ranks_of)?;
        let sigmap = take(parents.at(1), node, "sigmap", "a signature map", sigmap_of)?;
        let layout = take(parents.at(2), node, "layout", "a layout", layout_of)?;
        let indel = take(parents.at(3), node, "indels", "an indel plan", |v| match v {
            GenValue::Indel(i) => Some(i),
            _ => None,
        })?;
        let values: BTreeMap<String, ArgValue> = parents
            .named()
            .filter_map(|(n, v)| match v {
                GenValue::Value { effective, .. } => Some((n.to_string(), effective.clone())),
                _ => None,
            })
            .collect();
        let args = def.formula_args(&values, layout);
        let max_rank = sigmap.iter().filter_map(|(_, s)| s.rank(ranks)).max().unwrap_or(0);
        let max_dim = max_dimsize(ctx.config.target_nelem, max_rank);

        let candidates = def
            .dims
            .sample(ranks, &args, max_dim, &mut ctx.rng, ctx.config.max_yield_count)?;
        let mut out = Vec::new();
        for dims in candidates.into_iter().filter(|d| def.violated(d).is_empty()) {
            let mut shapes = BTreeMap::new();
            for (key, sig) in sigmap.iter() {
                let shape = sig.shape(&dims).ok_or(EvalError::MissingRank {
                    index: sig.iter().find(|c| !dims.contains_key(c)).unwrap_or('?'),
                })?;
                shapes.insert(key.to_string(), shape);
            }
            match indel {
                Some(Indel::Insert { key, pos }) => {
                    if let Some(s) = shapes.get_mut(key) {
                        let pos = (*pos).min(s.len());
                        s.insert(pos, ctx.rng.gen_range(1..=2));
                    }
                }
                Some(Indel::Delete { key, pos }) => {
                    if let Some(s) = shapes.get_mut(key) {
                        if *pos < s.len() {
                            s.remove(*pos);
                        }
                    }
                }
                None => {}
            }

            let touched = indel.as_ref().map(Indel::key);
            let targets: Vec<&String> = mutable
                .iter()
                .filter(|k| Some(k.as_str()) != touched)
                .filter(|k| shapes.get(*k).is_some_and(|s| !s.is_empty()))
                .collect();
            let point = match (targets.choose(&mut ctx.rng), budget.reserve(1)) {
                (Some(&key), Some(r)) => {
                    let mut mutated = shapes.clone();
                    if let Some(s) = mutated.get_mut(key) {
                        let pos = ctx.rng.gen_range(0..s.len());
                        let old = s[pos];
                        let choices: Vec<i64> = (1..=5).filter(|&d| d != old).collect();
                        if let Some(&new) = choices.choose(&mut ctx.rng) {
                            s[pos] = new;
                        }
                    }
                    Some(Yield::costing(GenValue::Shapes(mutated), r.cost()))
                }
                _ => None,
            };
            out.push(Yield::free(GenValue::Shapes(shapes)));
            out.extend(point);
        }
        Ok(out)
    }
}

impl<'s> NodeFunc<GenCtx<'s>> for GenNode {
    type Value = GenValue;
    type Error = EvalError;

    fn eval(
        &self,
        ctx: &mut GenCtx<'s>,
        parents: &ParentValues<'_, GenValue>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<GenValue>>, EvalError> {
        let def = ctx.def;
        let node = self.kind();
        let value = match self {
            GenNode::Layout => {
                return Ok((0..def.num_layouts())
                    .map(|l| Yield::free(GenValue::Layout(l)))
                    .collect())
            }
            GenNode::RankRange(c) => {
                let known: IndexRanks = parents
                    .named()
                    .filter_map(|(n, v)| match v {
                        GenValue::Rank(r) => n.chars().next().map(|c| (c, *r)),
                        _ => None,
                    })
                    .collect();
                return Ok(def
                    .rank_bounds(*c, &known)
                    .iter()
                    .map(|r| Yield::free(GenValue::Rank(r)))
                    .collect());
            }
            GenNode::RankEquiv(_) => {
                let r = take(parents.at(0), node, "primary", "a rank", |v| match v {
                    GenValue::Rank(r) => Some(*r),
                    _ => None,
                })?;
                GenValue::Rank(r)
            }
            GenNode::IndexRanks => GenValue::Ranks(
                parents
                    .named()
                    .filter_map(|(n, v)| match (n.chars().next(), v) {
                        (Some(c), GenValue::Rank(r)) => Some((c, *r)),
                        _ => None,
                    })
                    .collect(),
            ),
            GenNode::Sig { sigs, .. } => {
                let layout = take(parents.at(0), node, "layout", "a layout", layout_of)?;
                match sig_for_layout(sigs, layout) {
                    Some(sig) => GenValue::Sig(sig.clone()),
                    None => return Ok(Vec::new()),
                }
            }
            GenNode::SigMap => GenValue::SigMap(SigMap(
                parents
                    .named()
                    .filter_map(|(k, v)| match v {
                        GenValue::Sig(s) => Some((k.to_string(), s.clone())),
                        _ => None,
                    })
                    .collect(),
            )),
            GenNode::DTypeValid { tensor, followed } => {
                let allowed = def.dtype_rules.allowed(tensor);
                let mut out: Vec<Yield<GenValue>> =
                    allowed.iter().map(|&d| Yield::free(GenValue::DType(d))).collect();
                if !*followed {
                    if let Some(r) = budget.reserve(1) {
                        let invalid: Vec<DType> =
                            ALL_DTYPES.iter().copied().filter(|d| !allowed.contains(d)).collect();
                        for &d in invalid.choose_multiple(&mut ctx.rng, ctx.config.dtype_err_quota) {
                            out.push(Yield::costing(GenValue::DType(d), r.cost()));
                        }
                    }
                }
                return Ok(out);
            }
            GenNode::DTypeEquate(_) => {
                let source = take(parents.at(0), node, "source", "a dtype", dtype_of)?;
                let mut out = vec![Yield::free(GenValue::DType(source))];
                if let Some(r) = budget.reserve(1) {
                    let others: Vec<DType> = ALL_DTYPES.iter().copied().filter(|&d| d != source).collect();
                    for &d in others.choose_multiple(&mut ctx.rng, ctx.config.dtype_err_quota) {
                        out.push(Yield::costing(GenValue::DType(d), r.cost()));
                    }
                }
                return Ok(out);
            }
            GenNode::DTypes => {
                let ranks = take(parents.at(0), node, "ranks", "index ranks", ranks_of)?;
                let layout = take(parents.at(1), node, "layout", "a layout", layout_of)?;
                let dtypes: Vec<(String, DType)> = parents
                    .named()
                    .filter_map(|(n, v)| dtype_of(v).map(|d| (n.to_string(), d)))
                    .collect();
                let lookup: BTreeMap<String, DType> = dtypes.iter().cloned().collect();
                if def.dtype_rules.matched_combo(&lookup, ranks, layout).is_none() {
                    GenValue::DTypes(dtypes)
                } else {
                    // Only rule-abiding dtypes may land in an excluded combination;
                    // its cost is the cheapest escape, which may move a whole
                    // equate class.
                    let rules = &def.dtype_rules;
                    let abiding = dtypes.iter().all(|(n, d)| {
                        rules.allowed(n).contains(d)
                            && rules.equated_to(n).map_or(true, |src| lookup.get(src) == Some(d))
                    });
                    if !abiding {
                        return Ok(Vec::new());
                    }
                    let escape = rules.edit(&dtypes, ranks, layout).cost();
                    let Some(r) = budget.reserve(escape) else {
                        return Ok(Vec::new());
                    };
                    return Ok(vec![Yield::costing(GenValue::DTypes(dtypes), r.cost())]);
                }
            }
            GenNode::ArgIndels { mutable } => {
                let ranks = take(parents.at(0), node, "ranks", "index ranks", ranks_of)?;
                let sigmap = take(parents.at(1), node, "sigmap", "a signature map", sigmap_of)?;
                let mut out = vec![Yield::free(GenValue::Indel(None))];
                let Some(r) = budget.reserve(1) else {
                    return Ok(out);
                };
                for key in mutable {
                    let Some(rank) = sigmap.get(key).and_then(|s| s.rank(ranks)) else {
                        continue;
                    };
                    let pos = ctx.rng.gen_range(0..=rank as usize);
                    out.push(Yield::costing(
                        GenValue::Indel(Some(Indel::Insert { key: key.clone(), pos })),
                        r.cost(),
                    ));
                    if rank > 0 {
                        let pos = ctx.rng.gen_range(0..rank as usize);
                        out.push(Yield::costing(
                            GenValue::Indel(Some(Indel::Delete { key: key.clone(), pos })),
                            r.cost(),
                        ));
                    }
                }
                return Ok(out);
            }
            GenNode::ArgShapes { mutable } => return Self::arg_shapes(mutable, ctx, parents, budget),
            GenNode::TensorArg(key) => {
                let shape = shape_at(parents, node, key)?;
                let dtypes = take(parents.at(1), node, "dtypes", "generated dtypes", |v| match v {
                    GenValue::DTypes(d) => Some(d),
                    _ => None,
                })?;
                let dtype = dtypes
                    .iter()
                    .find(|(n, _)| n == key)
                    .map(|(_, d)| *d)
                    .ok_or(EvalError::NoValue("dtype"))?;
                GenValue::plain(ArgValue::tensor(shape, dtype))
            }
            GenNode::ShapeListArg(key) => GenValue::plain(ArgValue::ints(shape_at(parents, node, key)?)),
            GenNode::ShapeTensorArg(key) => GenValue::plain(ArgValue::IntTensor {
                values: shape_at(parents, node, key)?.clone(),
            }),
            GenNode::ShapeIntArg { arg, lo, hi } => {
                let shape = shape_at(parents, node, arg)?;
                let value = match shape.first() {
                    Some(&v) if shape.iter().all(|&d| d == v) => v,
                    Some(_) => return Ok(Vec::new()),
                    None => *lo,
                };
                if value < *lo || hi.is_some_and(|h| value > h) {
                    return Ok(Vec::new());
                }
                GenValue::plain(ArgValue::int(value))
            }
            GenNode::ShapeTensor2DArg { arg, columns } => {
                let shapes = take(parents.at(0), node, "shapes", "generated shapes", shapes_of)?;
                let cols: Vec<&Dims> = (0..*columns)
                    .filter_map(|j| shapes.get(&format!("{arg}.{j}")))
                    .collect();
                let Some(len) = cols.first().map(|c| c.len()) else {
                    return Ok(Vec::new());
                };
                if cols.len() != *columns || cols.iter().any(|c| c.len() != len) {
                    return Ok(Vec::new());
                }
                let rows = (0..len).map(|d| cols.iter().map(|c| c[d]).collect()).collect();
                GenValue::plain(ArgValue::IntTensor2D { rows })
            }
            GenNode::RankArg(sig) => {
                let ranks = take(parents.at(0), node, "ranks", "index ranks", ranks_of)?;
                let r = sig.rank(ranks).ok_or(EvalError::MissingRank {
                    index: sig.iter().next().unwrap_or('?'),
                })?;
                GenValue::plain(ArgValue::int(i64::from(r)))
            }
            GenNode::IntArg { lo, hi } => GenValue::plain(ArgValue::int(ctx.rng.gen_range(*lo..=*hi))),
            GenNode::OptionArg(options) => {
                let mut out: Vec<Yield<GenValue>> = options
                    .iter()
                    .map(|o| Yield::free(GenValue::plain(ArgValue::str(o))))
                    .collect();
                if let (Some(first), Some(r)) = (options.first(), budget.reserve(1)) {
                    out.push(Yield::costing(
                        GenValue::Value {
                            emitted: ArgValue::str(DUMMY_OPTION),
                            effective: ArgValue::str(first),
                        },
                        r.cost(),
                    ));
                }
                return Ok(out);
            }
            GenNode::DataFormatArg(_) => {
                let ranks = take(parents.at(0), node, "ranks", "index ranks", ranks_of)?;
                let layout = take(parents.at(1), node, "layout", "a layout", layout_of)?;
                let formats = &def.formats;
                let effective = formats
                    .format_for(layout, ranks)
                    .map(ArgValue::str)
                    .unwrap_or(ArgValue::None);
                let mut out = Vec::new();
                for name in formats.all_formats() {
                    let emitted = name.map(ArgValue::str).unwrap_or(ArgValue::None);
                    let v = GenValue::Value {
                        emitted,
                        effective: effective.clone(),
                    };
                    match formats.mismatch(name, layout, ranks) {
                        Some(0) => out.push(Yield::free(v)),
                        Some(cost) => {
                            if let Some(r) = budget.reserve(cost) {
                                out.push(Yield::costing(v, r.cost()));
                            }
                        }
                        None => {}
                    }
                }
                return Ok(out);
            }
            GenNode::UncheckedArg => GenValue::plain(ArgValue::None),
            GenNode::Args => GenValue::Call(CallArgs(
                parents
                    .named()
                    .filter_map(|(n, v)| match v {
                        GenValue::Value { emitted, .. } => Some((n.to_string(), emitted.clone())),
                        _ => None,
                    })
                    .collect(),
            )),
        };
        Ok(vec![Yield::free(value)])
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GenGraph {
    graph: Graph<GenNode>,
    layout: NodeId,
    ranks: NodeId,
    sigmap: NodeId,
    dtypes: NodeId,
    args: NodeId,
}

pub fn build(def: &OpDef) -> Result<GenGraph, GraphError> {
    let mut g = Graph::new();
    let layout = g.add_node("layout", GenNode::Layout, &[])?;

    let mut rank_nodes: Vec<(IndexCode, NodeId)> = Vec::new();
    for c in def.primaries() {
        let n = g.add_node(format!("rank:{c}"), GenNode::RankRange(c), &[])?;
        for (earlier, e) in &rank_nodes {
            g.append_named(n, *e, earlier.to_string())?;
        }
        rank_nodes.push((c, n));
    }
    for idx in def.indices.iter().filter(|i| !i.is_primary()) {
        let Some(&(_, p)) = rank_nodes.iter().find(|(c, _)| *c == idx.primary) else {
            continue;
        };
        let n = g.add_node(format!("rank:{}", idx.code), GenNode::RankEquiv(idx.code), &[p])?;
        rank_nodes.push((idx.code, n));
    }
    let ranks = g.add_node("ranks", GenNode::IndexRanks, &[])?;
    for (c, n) in &rank_nodes {
        g.append_named(ranks, *n, c.to_string())?;
    }

    let sigmap = g.add_node("sigmap", GenNode::SigMap, &[])?;
    for (key, sigs) in def.shape_keys() {
        let n = g.add_node(
            format!("sig:{key}"),
            GenNode::Sig {
                key: key.clone(),
                sigs: sigs.to_vec(),
            },
            &[layout],
        )?;
        g.append_named(sigmap, n, key)?;
    }

    let mut arg_nodes: HashMap<String, NodeId> = HashMap::new();
    for a in &def.args {
        let (func, parents) = match &a.kind {
            ArgKind::Rank => match a.sigs.first() {
                Some(sig) => (GenNode::RankArg(sig.clone()), vec![ranks]),
                None => continue,
            },
            ArgKind::Int { lo, hi } => (GenNode::IntArg { lo: *lo, hi: *hi }, vec![]),
            ArgKind::Options(options) => (GenNode::OptionArg(options.clone()), vec![]),
            ArgKind::DataFormat => (GenNode::DataFormatArg(a.name.clone()), vec![ranks, layout]),
            ArgKind::Unchecked => (GenNode::UncheckedArg, vec![]),
            _ => continue,
        };
        arg_nodes.insert(a.name.clone(), g.add_node(format!("arg:{}", a.name), func, &parents)?);
    }

    let mutable: Vec<String> = def
        .args
        .iter()
        .filter(|a| a.kind.is_mutable_shape())
        .map(|a| a.name.clone())
        .collect();
    let indels = g.add_node(
        "arg_indels",
        GenNode::ArgIndels {
            mutable: mutable.clone(),
        },
        &[ranks, sigmap],
    )?;
    let shapes = g.add_node(
        "arg_shapes",
        GenNode::ArgShapes { mutable },
        &[ranks, sigmap, layout, indels],
    )?;
    for a in &def.args {
        if let Some(n) = arg_nodes.get(&a.name) {
            g.append_named(shapes, *n, a.name.clone())?;
        }
    }

    let mut dtype_nodes: Vec<(String, NodeId)> = Vec::new();
    for t in def.tensors() {
        let func = match def.dtype_rules.equated_to(t) {
            Some(_) => GenNode::DTypeEquate(t.to_string()),
            None => GenNode::DTypeValid {
                tensor: t.to_string(),
                followed: def.tensors().any(|o| def.dtype_rules.equated_to(o) == Some(t)),
            },
        };
        dtype_nodes.push((t.to_string(), g.add_node(format!("dtype:{t}"), func, &[])?));
    }
    for (t, n) in &dtype_nodes {
        let Some(src) = def.dtype_rules.equated_to(t) else {
            continue;
        };
        if let Some((_, s)) = dtype_nodes.iter().find(|(name, _)| name == src) {
            g.append_parent(*n, *s, ParentRole::Positional)?;
        }
    }
    let dtypes = g.add_node("dtypes", GenNode::DTypes, &[ranks, layout])?;
    for (t, n) in &dtype_nodes {
        g.append_named(dtypes, *n, t.clone())?;
    }

    for a in &def.args {
        let name = a.name.clone();
        let (func, parents) = match &a.kind {
            ArgKind::Tensor => (GenNode::TensorArg(name.clone()), vec![shapes, dtypes]),
            ArgKind::ShapeList { .. } => (GenNode::ShapeListArg(name.clone()), vec![shapes]),
            ArgKind::ShapeInt { lo, hi } => (
                GenNode::ShapeIntArg {
                    arg: name.clone(),
                    lo: *lo,
                    hi: *hi,
                },
                vec![shapes],
            ),
            ArgKind::ShapeTensor => (GenNode::ShapeTensorArg(name.clone()), vec![shapes]),
            ArgKind::ShapeTensor2D { columns } => (
                GenNode::ShapeTensor2DArg {
                    arg: name.clone(),
                    columns: columns.len(),
                },
                vec![shapes],
            ),
            _ => continue,
        };
        arg_nodes.insert(name.clone(), g.add_node(format!("arg:{name}"), func, &parents)?);
    }

    let args = g.add_node("args", GenNode::Args, &[])?;
    for a in &def.args {
        if let Some(n) = arg_nodes.get(&a.name) {
            g.append_named(args, *n, a.name.clone())?;
        }
    }

    trace!(op = %def.op_path, nodes = g.len(), "generative graph built");
    Ok(GenGraph {
        graph: g,
        layout,
        ranks,
        sigmap,
        dtypes,
        args,
    })
}

impl GenGraph {
    /// Lazy stream of generated calls carrying at most `config.test_edits`
    /// mutations, reproducible for a given `seed`.
    pub fn cases<'s>(
        &'s self,
        def: &'s OpDef,
        config: &SearchConfig,
        seed: u64,
    ) -> Result<impl Iterator<Item = Result<GeneratedCase, EvalError>> + 's, EvalError> {
        let ctx = GenCtx {
            def,
            config: config.clone(),
            rng: StdRng::seed_from_u64(seed),
        };
        let ev = self.graph.evaluate(
            ctx,
            &[self.args],
            HashMap::new(),
            config.eval_config(config.test_edits),
        )?;
        Ok(ev.map(|comb| {
            let comb = comb?;
            match comb.values.into_iter().next() {
                Some(GenValue::Call(args)) => Ok(GeneratedCase {
                    args,
                    mutations: comb.cost,
                }),
                _ => Err(EvalError::NoValue("generation")),
            }
        }))
    }

    /// Every valid rank / signature / dtype / layout combination, at most
    /// `config.max_yield_count` rows.
    pub fn inventory(&self, def: &OpDef, config: &SearchConfig, seed: u64) -> Result<Vec<InventoryRow>, EvalError> {
        let ctx = GenCtx {
            def,
            config: config.clone(),
            rng: StdRng::seed_from_u64(seed),
        };
        let ev = self.graph.evaluate(
            ctx,
            &[self.layout, self.ranks, self.sigmap, self.dtypes],
            HashMap::new(),
            config.eval_config(0),
        )?;
        let mut rows = Vec::new();
        for comb in ev.take(config.max_yield_count) {
            let mut values = comb?.values.into_iter();
            let row = match (values.next(), values.next(), values.next(), values.next()) {
                (
                    Some(GenValue::Layout(layout)),
                    Some(GenValue::Ranks(ranks)),
                    Some(GenValue::SigMap(sigs)),
                    Some(GenValue::DTypes(dtypes)),
                ) => InventoryRow {
                    layout,
                    ranks,
                    sigs,
                    dtypes,
                },
                _ => return Err(EvalError::NoValue("inventory")),
            };
            rows.push(row);
        }
        debug!(op = %def.op_path, rows = rows.len(), "inventory enumerated");
        Ok(rows)
    }
}
