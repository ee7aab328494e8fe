// eval.rs — Lazy budgeted evaluation of a `Graph`
//
// Every node is a multi-valued function of its parents' values. An
// `Evaluation` walks the live nodes in stable topological order like an
// odometer: the earliest node varies slowest, each node is re-evaluated
// whenever an upstream choice changes, and a node that yields nothing prunes
// the whole branch. Each yielded value carries an edit cost; the running
// total along the current path is never allowed to exceed the budget.
//
// Preconditions: values supplied via `observed` stand in for their nodes;
//                their parents are not evaluated.
// Postconditions: each `Combination` has total cost ≤ `EvalConfig::budget`
//                 and holds one value per requested output.
// Failure modes: graph errors at construction; node errors are yielded once
//                and end the iteration.
// Side effects: none beyond what node functions do with their context.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::budget::EditBudget;
use crate::graph::{Graph, GraphError, NodeId, ParentRole};

// ── Node contract ───────────────────────────────────────────────────────────

/// One candidate value produced by a node, with the edits it costs.
#[derive(Debug, Clone, PartialEq)]
pub struct Yield<V> {
    pub value: V,
    pub cost: u32,
}

impl<V> Yield<V> {
    pub fn free(value: V) -> Self {
        Self { value, cost: 0 }
    }

    pub fn costing(value: V, cost: u32) -> Self {
        Self { value, cost }
    }
}

/// Current values of a node's parents, in edge order.
#[derive(Debug)]
pub struct ParentValues<'a, V> {
    entries: Vec<(&'a ParentRole, &'a V)>,
}

impl<'a, V> ParentValues<'a, V> {
    pub fn new(entries: Vec<(&'a ParentRole, &'a V)>) -> Self {
        Self { entries }
    }

    /// The i-th parent regardless of role.
    pub fn at(&self, i: usize) -> Option<&'a V> {
        self.entries.get(i).map(|(_, v)| *v)
    }

    pub fn get(&self, name: &str) -> Option<&'a V> {
        self.named().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn named(&self) -> impl Iterator<Item = (&'a str, &'a V)> + '_ {
        self.entries.iter().filter_map(|(role, v)| match role {
            ParentRole::Named(n) => Some((n.as_str(), *v)),
            ParentRole::Positional => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A node's function. Yields every candidate value whose cost fits in
/// `budget`; reservations taken from `budget` are released on return.
pub trait NodeFunc<C> {
    type Value: Clone;
    type Error;

    fn eval(
        &self,
        ctx: &mut C,
        parents: &ParentValues<'_, Self::Value>,
        budget: &EditBudget,
    ) -> Result<Vec<Yield<Self::Value>>, Self::Error>;
}

/// Internal faults raised by node functions. These indicate a malformed
/// schema or graph rather than bad call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("node '{node}' expected {expected} from parent {parent}")]
    ParentValue {
        node: String,
        parent: String,
        expected: &'static str,
    },
    #[error("formula for index '{index}' got inputs with incompatible ranks")]
    IncompatibleRanks { index: char },
    #[error("index '{index}' has no rank in the current assignment")]
    MissingRank { index: char },
    #[error("{0} graph produced no value")]
    NoValue(&'static str),
}

/// Fetch parent value `found`, converting it with `pick`, or report which
/// parent was missing or of the wrong variant.
pub fn take<'a, V, T>(
    found: Option<&'a V>,
    node: &str,
    parent: impl ToString,
    expected: &'static str,
    pick: impl FnOnce(&'a V) -> Option<T>,
) -> Result<T, EvalError> {
    found.and_then(pick).ok_or_else(|| EvalError::ParentValue {
        node: node.to_string(),
        parent: parent.to_string(),
        expected,
    })
}

// ── Evaluation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalConfig {
    /// Maximum total edit cost of any produced combination.
    pub budget: u32,
    /// Cap on the values kept from a single node evaluation (first N).
    pub max_yield: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            budget: 0,
            max_yield: 1000,
        }
    }
}

/// One consistent assignment of values to the requested outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination<V> {
    pub values: Vec<V>,
    pub cost: u32,
}

#[derive(Debug)]
struct Level<V> {
    items: Vec<Yield<V>>,
    pos: usize,
    spent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Running,
    Done,
}

/// Pull-based iterator over the combinations of a graph's outputs.
pub struct Evaluation<'g, F, C>
where
    F: NodeFunc<C>,
{
    graph: &'g Graph<F>,
    ctx: C,
    order: Vec<NodeId>,
    parent_slots: Vec<Vec<usize>>,
    outputs: Vec<usize>,
    observed: HashMap<NodeId, F::Value>,
    config: EvalConfig,
    levels: Vec<Level<F::Value>>,
    state: State,
}

impl<F> Graph<F> {
    /// Start a lazy evaluation of `outputs`. Nothing is computed until the
    /// first call to `next`.
    pub fn evaluate<C>(
        &self,
        ctx: C,
        outputs: &[NodeId],
        observed: HashMap<NodeId, F::Value>,
        config: EvalConfig,
    ) -> Result<Evaluation<'_, F, C>, GraphError>
    where
        F: NodeFunc<C>,
    {
        let stop: HashSet<NodeId> = observed.keys().copied().collect();
        let live = self.live_set(outputs, &stop)?;
        let order = self.topo_order(&live)?;
        let slot_of: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let mut parent_slots = Vec::with_capacity(order.len());
        for &id in &order {
            let node = self.node(id)?;
            let slots = if stop.contains(&id) {
                Vec::new()
            } else {
                node.parents
                    .iter()
                    .map(|p| slot_of.get(&p.node).copied().ok_or(GraphError::UnknownNode(p.node)))
                    .collect::<Result<Vec<_>, _>>()?
            };
            parent_slots.push(slots);
        }
        let outputs = outputs
            .iter()
            .map(|id| slot_of.get(id).copied().ok_or(GraphError::UnknownNode(*id)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Evaluation {
            graph: self,
            ctx,
            order,
            parent_slots,
            outputs,
            observed,
            config,
            levels: Vec::new(),
            state: State::Fresh,
        })
    }
}

impl<'g, F, C> Evaluation<'g, F, C>
where
    F: NodeFunc<C>,
{
    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    fn eval_level(&mut self, d: usize, spent: u32) -> Result<Vec<Yield<F::Value>>, F::Error> {
        let id = self.order[d];
        if let Some(v) = self.observed.get(&id) {
            return Ok(vec![Yield::free(v.clone())]);
        }
        let graph = self.graph;
        let Ok(node) = graph.node(id) else {
            return Ok(Vec::new());
        };
        let entries = node
            .parents
            .iter()
            .zip(&self.parent_slots[d])
            .map(|(parent, &slot)| {
                let level = &self.levels[slot];
                (&parent.role, &level.items[level.pos].value)
            })
            .collect();
        let parents = ParentValues::new(entries);
        let avail = self.config.budget.saturating_sub(spent);
        let budget = EditBudget::new(avail);
        let mut items = node.func.eval(&mut self.ctx, &parents, &budget)?;
        items.retain(|y| y.cost <= avail);
        items.truncate(self.config.max_yield);
        Ok(items)
    }

    /// Fill levels from `d` onward, backtracking over empty levels.
    /// Returns `false` once the search space is exhausted.
    fn descend(&mut self, mut d: usize) -> Result<bool, F::Error> {
        while d < self.order.len() {
            let spent = match d {
                0 => 0,
                _ => {
                    let prev = &self.levels[d - 1];
                    prev.spent + prev.items[prev.pos].cost
                }
            };
            let items = self.eval_level(d, spent)?;
            self.levels.truncate(d);
            self.levels.push(Level { items, pos: 0, spent });
            if self.levels[d].items.is_empty() {
                match self.advance(d) {
                    Some(k) => d = k + 1,
                    None => return Ok(false),
                }
            } else {
                d += 1;
            }
        }
        Ok(true)
    }

    /// Move the deepest level below `below` that still has alternatives to
    /// its next value, dropping everything after it.
    fn advance(&mut self, below: usize) -> Option<usize> {
        let mut k = below;
        while k > 0 {
            k -= 1;
            let level = &mut self.levels[k];
            if level.pos + 1 < level.items.len() {
                level.pos += 1;
                self.levels.truncate(k + 1);
                return Some(k);
            }
        }
        None
    }

    fn emit(&self) -> Combination<F::Value> {
        let values = self
            .outputs
            .iter()
            .map(|&slot| {
                let level = &self.levels[slot];
                level.items[level.pos].value.clone()
            })
            .collect();
        let cost = self
            .levels
            .last()
            .map(|l| l.spent + l.items[l.pos].cost)
            .unwrap_or(0);
        Combination { values, cost }
    }
}

impl<'g, F, C> Iterator for Evaluation<'g, F, C>
where
    F: NodeFunc<C>,
{
    type Item = Result<Combination<F::Value>, F::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let found = match self.state {
            State::Done => return None,
            State::Fresh => {
                self.state = State::Running;
                self.descend(0)
            }
            State::Running => match self.advance(self.order.len()) {
                Some(k) => self.descend(k + 1),
                None => Ok(false),
            },
        };
        match found {
            Ok(true) => Some(Ok(self.emit())),
            Ok(false) => {
                self.state = State::Done;
                None
            }
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test node: yields fixed (value, cost) pairs, a sum of parents, or
    /// nothing when the parent sum is odd.
    #[derive(Debug, Clone)]
    enum T {
        Choices(Vec<(i64, u32)>),
        Sum,
        EvenOnly,
    }

    impl NodeFunc<usize> for T {
        type Value = i64;
        type Error = ();

        fn eval(
            &self,
            calls: &mut usize,
            parents: &ParentValues<'_, i64>,
            budget: &EditBudget,
        ) -> Result<Vec<Yield<i64>>, ()> {
            *calls += 1;
            let sum: i64 = (0..parents.len()).filter_map(|i| parents.at(i)).sum();
            Ok(match self {
                T::Choices(cs) => cs
                    .iter()
                    .filter_map(|&(v, c)| budget.reserve(c).map(|r| Yield::costing(v, r.cost())))
                    .collect(),
                T::Sum => vec![Yield::free(sum)],
                T::EvenOnly if sum % 2 == 0 => vec![Yield::free(sum)],
                T::EvenOnly => vec![],
            })
        }
    }

    fn run(g: &Graph<T>, out: &[NodeId], budget: u32) -> Vec<(Vec<i64>, u32)> {
        g.evaluate(0usize, out, HashMap::new(), EvalConfig { budget, max_yield: 100 })
            .unwrap()
            .map(|c| c.map(|c| (c.values, c.cost)))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn earliest_node_varies_slowest() {
        let mut g = Graph::new();
        let a = g.add_node("a", T::Choices(vec![(1, 0), (2, 0)]), &[]).unwrap();
        let b = g.add_node("b", T::Choices(vec![(10, 0), (20, 0)]), &[]).unwrap();
        let s = g.add_node("s", T::Sum, &[a, b]).unwrap();
        let got: Vec<i64> = run(&g, &[s], 0).into_iter().map(|(v, _)| v[0]).collect();
        assert_eq!(got, vec![11, 21, 12, 22]);
    }

    #[test]
    fn budget_prunes_expensive_paths() {
        let mut g = Graph::new();
        let a = g.add_node("a", T::Choices(vec![(1, 0), (2, 1)]), &[]).unwrap();
        let b = g.add_node("b", T::Choices(vec![(10, 0), (20, 1)]), &[]).unwrap();
        let s = g.add_node("s", T::Sum, &[a, b]).unwrap();
        let got = run(&g, &[s], 1);
        assert_eq!(got, vec![(vec![11], 0), (vec![21], 1), (vec![12], 1)]);
    }

    #[test]
    fn empty_node_prunes_branch() {
        let mut g = Graph::new();
        let a = g.add_node("a", T::Choices(vec![(1, 0), (2, 0), (3, 0), (4, 0)]), &[]).unwrap();
        let e = g.add_node("e", T::EvenOnly, &[a]).unwrap();
        let got: Vec<i64> = run(&g, &[e], 0).into_iter().map(|(v, _)| v[0]).collect();
        assert_eq!(got, vec![2, 4]);
    }

    #[test]
    fn observed_values_replace_nodes() {
        let mut g = Graph::new();
        let a = g.add_node("a", T::Choices(vec![(1, 0), (2, 0)]), &[]).unwrap();
        let s = g.add_node("s", T::Sum, &[a]).unwrap();
        let observed: HashMap<NodeId, i64> = [(a, 7)].into_iter().collect();
        let got: Vec<_> = g
            .evaluate(0usize, &[s], observed, EvalConfig::default())
            .unwrap()
            .map(|c| c.unwrap().values)
            .collect();
        assert_eq!(got, vec![vec![7]]);
    }

    #[test]
    fn max_yield_truncates_each_node() {
        let mut g = Graph::new();
        let a = g
            .add_node("a", T::Choices(vec![(1, 0), (2, 0), (3, 0)]), &[])
            .unwrap();
        let got = g
            .evaluate(0usize, &[a], HashMap::new(), EvalConfig { budget: 0, max_yield: 2 })
            .unwrap()
            .count();
        assert_eq!(got, 2);
    }

    #[test]
    fn evaluation_is_lazy() {
        let mut g = Graph::new();
        let a = g
            .add_node("a", T::Choices(vec![(1, 0), (2, 0), (3, 0)]), &[])
            .unwrap();
        let s = g.add_node("s", T::Sum, &[a]).unwrap();
        let mut ev = g
            .evaluate(0usize, &[s], HashMap::new(), EvalConfig::default())
            .unwrap();
        assert_eq!(*ev.ctx(), 0);
        ev.next();
        assert_eq!(*ev.ctx(), 2);
    }

    #[test]
    fn no_outputs_yields_one_empty_combination() {
        let g: Graph<T> = Graph::new();
        assert_eq!(run(&g, &[], 0), vec![(vec![], 0)]);
    }
}
