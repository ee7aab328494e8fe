// dims.rs — Dimension derivation graph
//
// Computed indices are derived from other indices' dims (and optionally
// from scalar arguments) by a formula, either over whole dim vectors or
// component by component with broadcasting. Generated indices come from
// sampling functions. The same graph runs in two modes: numeric (dims) and
// textual (each input replaced by a label, producing a readable formula).
//
// Generation samples the remaining free indices so that every computed
// index lands in [1, max_dimsize]: computed indices are clustered by shared
// inputs and, per cluster, a binary search finds the interval of values
// for the free inputs that keeps the cluster in range.
//
// Preconditions: formulas are monotone non-decreasing in their free inputs
//                (required for the binary search to find valid bounds).
// Postconditions: `compute` returns dims for every computed index whose
//                 inputs are available.
// Failure modes: duplicate producers, use before definition → `DimsError`;
//                rank-incompatible formula inputs → `EvalError`.
// Side effects: sampling advances the caller's RNG.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::trace;

use crate::args::ArgValue;
use crate::budget::EditBudget;
use crate::eval::{take, EvalConfig, EvalError, NodeFunc, ParentValues, Yield};
use crate::graph::{Graph, GraphError, NodeId};
use crate::model::{broadcast_components, Dims, IndexCode, IndexDims, IndexRanks, Signature};

/// Key under which the current layout is passed to formulas.
pub const LAYOUT_ARG: &str = "$layout";

/// Scalar argument values visible to formulas, by argument name.
pub type FormulaArgs = BTreeMap<String, ArgValue>;

// ── Formulas ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Formula {
    Whole(Arc<dyn Fn(&[Dims], &[ArgValue]) -> Dims + Send + Sync>),
    ComponentWise(Arc<dyn Fn(&[i64], &[ArgValue]) -> i64 + Send + Sync>),
}

pub type Template = Arc<dyn Fn(&[String], &[ArgValue]) -> String + Send + Sync>;

#[derive(Clone)]
pub struct ComputedIndex {
    pub out: IndexCode,
    pub inputs: Signature,
    pub formula: Formula,
    pub template: Template,
    /// Names of scalar arguments passed to the formula, in order.
    pub extra_args: Vec<String>,
}

impl fmt::Debug for ComputedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedIndex")
            .field("out", &self.out)
            .field("inputs", &self.inputs.to_string())
            .field("extra_args", &self.extra_args)
            .finish()
    }
}

impl ComputedIndex {
    pub fn compute(&self, inputs: &[&Dims], extra: &[ArgValue], out_rank: usize) -> Result<Dims, EvalError> {
        match &self.formula {
            Formula::Whole(f) => {
                let owned: Vec<Dims> = inputs.iter().map(|d| (*d).clone()).collect();
                Ok(f(&owned, extra))
            }
            Formula::ComponentWise(f) => (0..out_rank)
                .map(|c| {
                    broadcast_components(inputs, c)
                        .map(|v| f(&v, extra))
                        .ok_or(EvalError::IncompatibleRanks { index: self.out })
                })
                .collect(),
        }
    }

    pub fn render(&self, inputs: &[String], extra: &[ArgValue]) -> String {
        (self.template)(inputs, extra)
    }

    fn extra_values(&self, args: &FormulaArgs) -> Vec<ArgValue> {
        self.extra_args
            .iter()
            .map(|a| args.get(a).cloned().unwrap_or(ArgValue::None))
            .collect()
    }
}

// ── Generators ──────────────────────────────────────────────────────────────

/// Given the rank of each output index, returns candidate dims tuples
/// (one `Dims` per output index).
pub type DimsSampler = Arc<dyn Fn(&[u32], &mut StdRng) -> Vec<Vec<Dims>> + Send + Sync>;

#[derive(Clone)]
pub struct IndexGenerator {
    pub outputs: Signature,
    pub sampler: DimsSampler,
}

impl fmt::Debug for IndexGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexGenerator({})", self.outputs)
    }
}

/// Each output component drawn uniformly from `[lo, hi]`.
pub fn gen_range(lo: i64, hi: i64) -> DimsSampler {
    Arc::new(move |ranks: &[u32], rng: &mut StdRng| -> Vec<Vec<Dims>> {
        vec![ranks
            .iter()
            .map(|&r| (0..r).map(|_| rng.gen_range(lo..=hi)).collect())
            .collect()]
    })
}

/// Fixed candidate values; a single-element entry broadcasts to the rank.
pub fn gen_fixed(candidates: Vec<Vec<Dims>>) -> DimsSampler {
    Arc::new(move |ranks: &[u32], _rng: &mut StdRng| -> Vec<Vec<Dims>> {
        candidates
            .iter()
            .filter(|c| c.len() == ranks.len())
            .filter_map(|cand| {
                cand.iter()
                    .zip(ranks)
                    .map(|(d, &r)| match d.len() {
                        n if n == r as usize => Some(d.clone()),
                        1 => Some(vec![d[0]; r as usize]),
                        _ => None,
                    })
                    .collect::<Option<Vec<Dims>>>()
            })
            .collect()
    })
}

/// Two outputs `(whole, block)`: block sizes uniform in `block`, and the
/// whole a multiple of the block by a factor uniform in `mult`.
pub fn gen_blocked(block: (i64, i64), mult: (i64, i64)) -> DimsSampler {
    Arc::new(move |ranks: &[u32], rng: &mut StdRng| -> Vec<Vec<Dims>> {
        let (Some(&rw), Some(&rb)) = (ranks.first(), ranks.get(1)) else {
            return Vec::new();
        };
        let blocks: Dims = (0..rb).map(|_| rng.gen_range(block.0..=block.1)).collect();
        let whole: Dims = (0..rw as usize)
            .map(|c| {
                let b = match blocks.len() {
                    1 => blocks[0],
                    _ => blocks.get(c).copied().unwrap_or(1),
                };
                b * rng.gen_range(mult.0..=mult.1)
            })
            .collect();
        vec![vec![whole, blocks]]
    })
}

// ── Graph nodes ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum DimsNode {
    /// Ranks and formula arguments; always supplied.
    Input,
    /// Index that is neither generated nor computed; always supplied.
    Free(IndexCode),
    Generator(IndexGenerator),
    /// `sources[j]` locates input j: (provider parent number, offset in the
    /// provider's signature). Parent 0 is `Input`.
    Computed {
        index: ComputedIndex,
        sources: Vec<(usize, usize)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DimsValue {
    Input { ranks: IndexRanks, args: FormulaArgs },
    Dims(Vec<Dims>),
    Text(Vec<String>),
}

pub struct DimsCtx<'r> {
    pub rng: &'r mut StdRng,
}

impl<'r> NodeFunc<DimsCtx<'r>> for DimsNode {
    type Value = DimsValue;
    type Error = EvalError;

    fn eval(
        &self,
        ctx: &mut DimsCtx<'r>,
        parents: &ParentValues<'_, DimsValue>,
        _budget: &EditBudget,
    ) -> Result<Vec<Yield<DimsValue>>, EvalError> {
        match self {
            DimsNode::Input | DimsNode::Free(_) => Ok(Vec::new()),
            DimsNode::Generator(g) => {
                let ranks = take(parents.at(0), "generator", "input", "ranks", |v| match v {
                    DimsValue::Input { ranks, .. } => Some(ranks),
                    _ => None,
                })?;
                let out_ranks = g
                    .outputs
                    .iter()
                    .map(|c| ranks.get(&c).copied().ok_or(EvalError::MissingRank { index: c }))
                    .collect::<Result<Vec<u32>, _>>()?;
                Ok((g.sampler)(&out_ranks, ctx.rng)
                    .into_iter()
                    .filter(|cand| cand.len() == out_ranks.len())
                    .map(|cand| Yield::free(DimsValue::Dims(cand)))
                    .collect())
            }
            DimsNode::Computed { index, sources } => {
                let node = format!("dims:{}", index.out);
                let (ranks, args) = take(parents.at(0), &node, "input", "ranks", |v| match v {
                    DimsValue::Input { ranks, args } => Some((ranks, args)),
                    _ => None,
                })?;
                let extra = index.extra_values(args);
                let mut dims: Vec<&Dims> = Vec::new();
                let mut labels: Vec<String> = Vec::new();
                for &(p, off) in sources {
                    match parents.at(1 + p) {
                        Some(DimsValue::Dims(v)) => match v.get(off) {
                            Some(d) => dims.push(d),
                            None => return Err(EvalError::IncompatibleRanks { index: index.out }),
                        },
                        Some(DimsValue::Text(v)) => {
                            labels.push(v.get(off).cloned().unwrap_or_default())
                        }
                        _ => {
                            return Err(EvalError::ParentValue {
                                node,
                                parent: format!("#{}", 1 + p),
                                expected: "dims or labels",
                            })
                        }
                    }
                }
                if labels.is_empty() {
                    let rank = ranks
                        .get(&index.out)
                        .copied()
                        .ok_or(EvalError::MissingRank { index: index.out })?;
                    let d = index.compute(&dims, &extra, rank as usize)?;
                    Ok(vec![Yield::free(DimsValue::Dims(vec![d]))])
                } else if dims.is_empty() {
                    Ok(vec![Yield::free(DimsValue::Text(vec![index.render(&labels, &extra)]))])
                } else {
                    Err(EvalError::ParentValue {
                        node,
                        parent: "sources".into(),
                        expected: "uniformly dims or labels",
                    })
                }
            }
        }
    }
}

// ── DimsGraph ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DimsError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("index '{0}' has more than one generator or formula")]
    Duplicate(IndexCode),
    #[error("formula for '{index}' uses '{input}', which is computed later")]
    UsedBeforeComputed { index: IndexCode, input: IndexCode },
}

#[derive(Debug, Clone, Default)]
pub struct DimsGraph {
    graph: Graph<DimsNode>,
    input: Option<NodeId>,
    providers: BTreeMap<IndexCode, (NodeId, usize)>,
    computed: Vec<(IndexCode, NodeId)>,
    generators: Vec<(Signature, NodeId)>,
    free: Vec<(IndexCode, NodeId)>,
}

impl DimsGraph {
    pub fn build(generators: &[IndexGenerator], computed: &[ComputedIndex]) -> Result<Self, DimsError> {
        let mut g = DimsGraph::default();
        let input = g.graph.add_node("input", DimsNode::Input, &[])?;
        g.input = Some(input);

        for gen in generators {
            let node = g
                .graph
                .add_node(format!("gen:{}", gen.outputs), DimsNode::Generator(gen.clone()), &[input])?;
            for (j, c) in gen.outputs.iter().enumerate() {
                if g.providers.insert(c, (node, j)).is_some() {
                    return Err(DimsError::Duplicate(c));
                }
            }
            g.generators.push((gen.outputs.clone(), node));
        }

        let outs: BTreeSet<IndexCode> = computed.iter().map(|c| c.out).collect();
        for ci in computed {
            if g.providers.contains_key(&ci.out) {
                return Err(DimsError::Duplicate(ci.out));
            }
            let mut uniq: Vec<NodeId> = Vec::new();
            let mut sources = Vec::new();
            for c in ci.inputs.iter() {
                if !g.providers.contains_key(&c) {
                    if outs.contains(&c) {
                        return Err(DimsError::UsedBeforeComputed {
                            index: ci.out,
                            input: c,
                        });
                    }
                    let node = g.graph.add_node(format!("free:{c}"), DimsNode::Free(c), &[])?;
                    g.providers.insert(c, (node, 0));
                    g.free.push((c, node));
                }
                let (node, off) = g.providers[&c];
                let p = match uniq.iter().position(|&n| n == node) {
                    Some(p) => p,
                    None => {
                        uniq.push(node);
                        uniq.len() - 1
                    }
                };
                sources.push((p, off));
            }
            let mut parents = vec![input];
            parents.extend(&uniq);
            let node = g.graph.add_node(
                format!("dims:{}", ci.out),
                DimsNode::Computed {
                    index: ci.clone(),
                    sources,
                },
                &parents,
            )?;
            g.providers.insert(ci.out, (node, 0));
            g.computed.push((ci.out, node));
        }
        Ok(g)
    }

    pub fn is_computed(&self, c: IndexCode) -> bool {
        self.computed.iter().any(|(x, _)| *x == c)
    }

    pub fn is_generated(&self, c: IndexCode) -> bool {
        self.generators.iter().any(|(sig, _)| sig.contains(c))
    }

    pub fn computed(&self, c: IndexCode) -> Option<&ComputedIndex> {
        let (_, node) = self.computed.iter().find(|(x, _)| *x == c)?;
        match &self.graph.node(*node).ok()?.func {
            DimsNode::Computed { index, .. } => Some(index),
            _ => None,
        }
    }

    /// Non-computed indices whose provider can be supplied from `known`.
    fn available(&self, known: &BTreeSet<IndexCode>) -> BTreeSet<IndexCode> {
        let mut out: BTreeSet<IndexCode> = self
            .free
            .iter()
            .map(|(c, _)| *c)
            .filter(|c| known.contains(c))
            .collect();
        for (sig, _) in &self.generators {
            if sig.iter().all(|c| known.contains(&c)) {
                out.extend(sig.iter());
            }
        }
        out
    }

    /// Computed indices derivable from `known`, in declaration order.
    pub fn derivable(&self, known: &BTreeSet<IndexCode>) -> Vec<IndexCode> {
        let mut have = self.available(known);
        let mut out = Vec::new();
        for &(c, _) in &self.computed {
            let Some(ci) = self.computed(c) else {
                continue;
            };
            if ci.inputs.iter().all(|x| have.contains(&x)) {
                have.insert(c);
                out.push(c);
            }
        }
        out
    }

    fn supplied(
        &self,
        values: &BTreeMap<IndexCode, DimsValue>,
        ranks: &IndexRanks,
        args: &FormulaArgs,
    ) -> HashMap<NodeId, DimsValue> {
        let mut observed = HashMap::new();
        if let Some(input) = self.input {
            observed.insert(
                input,
                DimsValue::Input {
                    ranks: ranks.clone(),
                    args: args.clone(),
                },
            );
        }
        for (c, node) in &self.free {
            if let Some(v) = values.get(c) {
                observed.insert(*node, v.clone());
            }
        }
        for (sig, node) in &self.generators {
            let parts: Option<Vec<&DimsValue>> = sig.iter().map(|c| values.get(&c)).collect();
            let Some(parts) = parts else {
                continue;
            };
            let joined = if parts.iter().all(|v| matches!(v, DimsValue::Text(_))) {
                DimsValue::Text(
                    parts
                        .iter()
                        .filter_map(|v| match v {
                            DimsValue::Text(t) => t.first().cloned(),
                            _ => None,
                        })
                        .collect(),
                )
            } else {
                DimsValue::Dims(
                    parts
                        .iter()
                        .filter_map(|v| match v {
                            DimsValue::Dims(d) => d.first().cloned(),
                            _ => None,
                        })
                        .collect(),
                )
            };
            observed.insert(*node, joined);
        }
        observed
    }

    fn run_targets(
        &self,
        values: BTreeMap<IndexCode, DimsValue>,
        ranks: &IndexRanks,
        args: &FormulaArgs,
    ) -> Result<Vec<(IndexCode, DimsValue)>, EvalError> {
        let known: BTreeSet<IndexCode> = values.keys().copied().collect();
        let targets = self.derivable(&known);
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let nodes: Vec<NodeId> = targets.iter().map(|c| self.providers[c].0).collect();
        let observed = self.supplied(&values, ranks, args);
        let mut rng = StdRng::seed_from_u64(0);
        let mut ev = self.graph.evaluate(
            DimsCtx { rng: &mut rng },
            &nodes,
            observed,
            EvalConfig {
                budget: 0,
                max_yield: 1,
            },
        )?;
        match ev.next() {
            Some(Ok(comb)) => Ok(targets.into_iter().zip(comb.values).collect()),
            Some(Err(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// Numeric dims of every computed index derivable from `known`.
    pub fn compute(&self, known: &IndexDims, ranks: &IndexRanks, args: &FormulaArgs) -> Result<IndexDims, EvalError> {
        let values = known
            .iter()
            .filter(|(c, _)| !self.is_computed(**c))
            .map(|(c, d)| (*c, DimsValue::Dims(vec![d.clone()])))
            .collect();
        Ok(self
            .run_targets(values, ranks, args)?
            .into_iter()
            .filter_map(|(c, v)| match v {
                DimsValue::Dims(mut d) => d.pop().map(|d| (c, d)),
                _ => None,
            })
            .collect())
    }

    /// Formula text of every computed index derivable from `labels`.
    pub fn render(
        &self,
        labels: &BTreeMap<IndexCode, String>,
        ranks: &IndexRanks,
        args: &FormulaArgs,
    ) -> Result<BTreeMap<IndexCode, String>, EvalError> {
        let values = labels
            .iter()
            .filter(|(c, _)| !self.is_computed(**c))
            .map(|(c, l)| (*c, DimsValue::Text(vec![l.clone()])))
            .collect();
        Ok(self
            .run_targets(values, ranks, args)?
            .into_iter()
            .filter_map(|(c, v)| match v {
                DimsValue::Text(mut t) => t.pop().map(|t| (c, t)),
                _ => None,
            })
            .collect())
    }

    /// Candidate dims from every generator (cross product, at most `max`).
    pub fn generate(
        &self,
        ranks: &IndexRanks,
        args: &FormulaArgs,
        rng: &mut StdRng,
        max: usize,
    ) -> Result<Vec<IndexDims>, EvalError> {
        let nodes: Vec<NodeId> = self.generators.iter().map(|(_, n)| *n).collect();
        let observed = self.supplied(&BTreeMap::new(), ranks, args);
        let ev = self.graph.evaluate(
            DimsCtx { rng },
            &nodes,
            observed,
            EvalConfig {
                budget: 0,
                max_yield: max,
            },
        )?;
        let mut out = Vec::new();
        for comb in ev.take(max) {
            let comb = comb?;
            let mut dims = IndexDims::new();
            for ((sig, _), v) in self.generators.iter().zip(comb.values) {
                if let DimsValue::Dims(ds) = v {
                    dims.extend(sig.iter().zip(ds));
                }
            }
            out.push(dims);
        }
        Ok(out)
    }

    /// Computed indices grouped by shared inputs (single linkage).
    pub fn clusters(&self) -> Vec<Vec<IndexCode>> {
        let n = self.computed.len();
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        let pos: BTreeMap<IndexCode, usize> =
            self.computed.iter().enumerate().map(|(i, (c, _))| (*c, i)).collect();
        let mut owner: BTreeMap<IndexCode, usize> = BTreeMap::new();
        for (i, (c, _)) in self.computed.iter().enumerate() {
            let Some(ci) = self.computed(*c) else {
                continue;
            };
            for x in ci.inputs.iter() {
                let other = match pos.get(&x) {
                    Some(&j) => j,
                    None => *owner.entry(x).or_insert(i),
                };
                let (a, b) = (find(&mut parent, i), find(&mut parent, other));
                if a != b {
                    parent[b.max(a)] = a.min(b);
                }
            }
        }
        let mut groups: BTreeMap<usize, Vec<IndexCode>> = BTreeMap::new();
        for (i, (c, _)) in self.computed.iter().enumerate() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(*c);
        }
        groups.into_values().collect()
    }

    /// Non-generated, non-computed inputs feeding `cluster` (transitively).
    fn free_inputs(&self, cluster: &[IndexCode]) -> Vec<IndexCode> {
        let mut out = Vec::new();
        let mut stack: Vec<IndexCode> = cluster.to_vec();
        let mut seen = BTreeSet::new();
        while let Some(c) = stack.pop() {
            if !seen.insert(c) {
                continue;
            }
            let Some(ci) = self.computed(c) else {
                continue;
            };
            for x in ci.inputs.iter() {
                if self.is_computed(x) {
                    stack.push(x);
                } else if !self.is_generated(x) && !out.contains(&x) {
                    out.push(x);
                }
            }
        }
        out.sort();
        out
    }

    /// Interval `[lo, hi]` for a common value of `free` that keeps every
    /// index of `cluster` within `[1, max_dimsize]`.
    fn free_bounds(
        &self,
        cluster: &[IndexCode],
        free: &[IndexCode],
        fixed: &IndexDims,
        ranks: &IndexRanks,
        args: &FormulaArgs,
        max_dimsize: i64,
    ) -> Result<Option<(i64, i64)>, EvalError> {
        let values_at = |m: i64| -> Result<Vec<i64>, EvalError> {
            let mut dims = fixed.clone();
            for f in free {
                let r = ranks.get(f).copied().ok_or(EvalError::MissingRank { index: *f })?;
                dims.insert(*f, vec![m; r as usize]);
            }
            let computed = self.compute(&dims, ranks, args)?;
            Ok(cluster
                .iter()
                .filter_map(|c| computed.get(c))
                .flatten()
                .copied()
                .collect())
        };
        let lower = first_true(1, max_dimsize, |m| Ok(values_at(m)?.iter().all(|&v| v >= 1)))?;
        let Some(lo) = lower else {
            return Ok(None);
        };
        let upper = last_true(lo, max_dimsize, |m| {
            Ok(values_at(m)?.iter().all(|&v| v <= max_dimsize))
        })?;
        Ok(upper.map(|hi| (lo, hi)))
    }

    /// Sample complete index dims: generator candidates, then free inputs
    /// within their bounds, then every other index in `[1, max_dimsize]`,
    /// then computed indices.
    pub fn sample(
        &self,
        ranks: &IndexRanks,
        args: &FormulaArgs,
        max_dimsize: i64,
        rng: &mut StdRng,
        max: usize,
    ) -> Result<Vec<IndexDims>, EvalError> {
        let candidates = self.generate(ranks, args, rng, max)?;
        let clusters = self.clusters();
        let mut out = Vec::new();
        'cand: for mut dims in candidates {
            for cluster in &clusters {
                let free: Vec<IndexCode> = self
                    .free_inputs(cluster)
                    .into_iter()
                    .filter(|f| !dims.contains_key(f))
                    .collect();
                if free.is_empty() {
                    continue;
                }
                let Some((lo, hi)) = self.free_bounds(cluster, &free, &dims, ranks, args, max_dimsize)? else {
                    trace!(?cluster, "no feasible dims for cluster");
                    continue 'cand;
                };
                for f in free {
                    let r = ranks.get(&f).copied().unwrap_or(0);
                    dims.insert(f, (0..r).map(|_| rng.gen_range(lo..=hi)).collect());
                }
            }
            for (&c, &r) in ranks {
                if !dims.contains_key(&c) && !self.is_computed(c) {
                    dims.insert(c, (0..r).map(|_| rng.gen_range(1..=max_dimsize)).collect());
                }
            }
            let computed = self.compute(&dims, ranks, args)?;
            dims.extend(computed);
            out.push(dims);
        }
        Ok(out)
    }
}

/// Largest per-dimension size keeping a rank-`max_rank` tensor near
/// `target_nelem` elements.
pub fn max_dimsize(target_nelem: f64, max_rank: u32) -> i64 {
    if max_rank == 0 {
        return 1;
    }
    (target_nelem.powf(1.0 / f64::from(max_rank)).ceil() as i64).max(1)
}

/// Smallest m in [lo, hi] with `pred(m)`, for `pred` false-then-true.
fn first_true(
    mut lo: i64,
    mut hi: i64,
    mut pred: impl FnMut(i64) -> Result<bool, EvalError>,
) -> Result<Option<i64>, EvalError> {
    if lo > hi || !pred(hi)? {
        return Ok(None);
    }
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(Some(lo))
}

/// Largest m in [lo, hi] with `pred(m)`, for `pred` true-then-false.
fn last_true(
    mut lo: i64,
    mut hi: i64,
    mut pred: impl FnMut(i64) -> Result<bool, EvalError>,
) -> Result<Option<i64>, EvalError> {
    if lo > hi || !pred(lo)? {
        return Ok(None);
    }
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if pred(mid)? {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(Some(lo))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceil_div(a: i64, b: i64) -> i64 {
        (a + b - 1).div_euclid(b)
    }

    fn pool_out() -> ComputedIndex {
        ComputedIndex {
            out: 'o',
            inputs: Signature::parse("iks"),
            formula: Formula::ComponentWise(Arc::new(|v: &[i64], _: &[ArgValue]| {
                ceil_div(v[0] - v[1] + 1, v[2])
            })),
            template: Arc::new(|l: &[String], _: &[ArgValue]| {
                format!("ceil(({} - {} + 1) / {})", l[0], l[1], l[2])
            }),
            extra_args: vec![],
        }
    }

    fn ranks() -> IndexRanks {
        [('i', 2), ('k', 2), ('s', 2), ('o', 2)].into_iter().collect()
    }

    #[test]
    fn componentwise_broadcasts_scalars() {
        let g = DimsGraph::build(&[], &[pool_out()]).unwrap();
        let known: IndexDims = [('i', vec![10, 10]), ('k', vec![3]), ('s', vec![2])]
            .into_iter()
            .collect();
        let out = g.compute(&known, &ranks(), &FormulaArgs::new()).unwrap();
        assert_eq!(out[&'o'], vec![4, 4]);
    }

    #[test]
    fn whole_and_componentwise_agree() {
        let whole = ComputedIndex {
            formula: Formula::Whole(Arc::new(|d: &[Dims], _: &[ArgValue]| -> Dims {
                d[0].iter()
                    .zip(&d[1])
                    .zip(&d[2])
                    .map(|((i, k), s)| ceil_div(i - k + 1, *s))
                    .collect()
            })),
            ..pool_out()
        };
        let a = DimsGraph::build(&[], &[whole]).unwrap();
        let b = DimsGraph::build(&[], &[pool_out()]).unwrap();
        let known: IndexDims = [('i', vec![9, 17]), ('k', vec![2, 5]), ('s', vec![3, 1])]
            .into_iter()
            .collect();
        let args = FormulaArgs::new();
        assert_eq!(
            a.compute(&known, &ranks(), &args).unwrap(),
            b.compute(&known, &ranks(), &args).unwrap()
        );
    }

    #[test]
    fn render_produces_formula_text() {
        let g = DimsGraph::build(&[], &[pool_out()]).unwrap();
        let labels: BTreeMap<IndexCode, String> = [('i', "i"), ('k', "k"), ('s', "s")]
            .into_iter()
            .map(|(c, l)| (c, l.to_string()))
            .collect();
        let out = g.render(&labels, &ranks(), &FormulaArgs::new()).unwrap();
        assert_eq!(out[&'o'], "ceil((i - k + 1) / s)");
    }

    #[test]
    fn missing_inputs_are_not_derivable() {
        let g = DimsGraph::build(&[], &[pool_out()]).unwrap();
        let known: IndexDims = [('i', vec![10, 10])].into_iter().collect();
        assert!(g.compute(&known, &ranks(), &FormulaArgs::new()).unwrap().is_empty());
    }

    #[test]
    fn duplicate_producer_rejected() {
        let gen = IndexGenerator {
            outputs: Signature::parse("o"),
            sampler: gen_range(1, 3),
        };
        assert_eq!(
            DimsGraph::build(&[gen], &[pool_out()]).unwrap_err(),
            DimsError::Duplicate('o')
        );
    }

    #[test]
    fn clusters_link_shared_inputs() {
        let a = ComputedIndex {
            out: 'a',
            inputs: Signature::parse("x"),
            ..pool_out()
        };
        let b = ComputedIndex {
            out: 'b',
            inputs: Signature::parse("xy"),
            ..pool_out()
        };
        let c = ComputedIndex {
            out: 'c',
            inputs: Signature::parse("z"),
            ..pool_out()
        };
        let g = DimsGraph::build(&[], &[a, b, c]).unwrap();
        assert_eq!(g.clusters(), vec![vec!['a', 'b'], vec!['c']]);
    }

    #[test]
    fn max_dimsize_targets_element_count() {
        assert_eq!(max_dimsize(1000.0, 2), 32);
        assert_eq!(max_dimsize(10.0, 1), 10);
        assert_eq!(max_dimsize(1e6, 0), 1);
    }

    #[test]
    fn bisection_finds_bounds() {
        assert_eq!(first_true(1, 100, |m| Ok(m >= 37)).unwrap(), Some(37));
        assert_eq!(last_true(1, 100, |m| Ok(m <= 12)).unwrap(), Some(12));
        assert_eq!(first_true(1, 10, |_| Ok(false)).unwrap(), None);
    }

    #[test]
    fn sampled_dims_keep_computed_in_range() {
        let gens = vec![
            IndexGenerator {
                outputs: Signature::parse("k"),
                sampler: gen_range(1, 5),
            },
            IndexGenerator {
                outputs: Signature::parse("s"),
                sampler: gen_range(1, 5),
            },
        ];
        let g = DimsGraph::build(&gens, &[pool_out()]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            for dims in g.sample(&ranks(), &FormulaArgs::new(), 20, &mut rng, 10).unwrap() {
                assert!(dims[&'o'].iter().all(|&o| (1..=20).contains(&o)), "{dims:?}");
                assert!(dims[&'i'].iter().all(|&i| (1..=20).contains(&i)));
            }
        }
    }

    #[test]
    fn fixed_and_blocked_generators() {
        let mut rng = StdRng::seed_from_u64(1);
        let fixed = gen_fixed(vec![vec![vec![3]]]);
        assert_eq!(fixed(&[2], &mut rng), vec![vec![vec![3, 3]]]);
        let blocked = gen_blocked((2, 4), (1, 3));
        let cand = &blocked(&[2, 1], &mut rng)[0];
        let b = cand[1][0];
        assert!(cand[0].iter().all(|w| w % b == 0));
    }
}
