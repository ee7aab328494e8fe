// graph.rs — Named DAG storage shared by every opcheck graph
//
// A `Graph<F>` owns nodes carrying a function value `F` and ordered parent
// edges. The predicate, inference, generative and dims graphs are all
// instances of it, each with its own node enum.
//
// Preconditions: parents are added by `NodeId` previously returned from
//                `add_node` on the same graph.
// Postconditions: `topo_order` returns a stable topological order (ties broken
//                 by insertion order) over any live subset.
// Failure modes: duplicate names, unknown ids, and cycles → `GraphError`.
// Side effects: none.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use thiserror::Error;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Identifier of a node within one graph, allocated in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// How a child sees one of its parents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParentRole {
    Positional,
    Named(String),
}

#[derive(Debug, Clone)]
pub struct Parent {
    pub node: NodeId,
    pub role: ParentRole,
}

#[derive(Debug, Clone)]
pub struct Node<F> {
    pub id: NodeId,
    pub name: String,
    pub func: F,
    pub parents: Vec<Parent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
    #[error("cycle detected through nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Graph<F> {
    nodes: Vec<Node<F>>,
    by_name: HashMap<String, NodeId>,
}

impl<F> Default for Graph<F> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<F> Graph<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node whose parents are all positional.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        func: F,
        parents: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(GraphError::DuplicateNode(name));
        }
        for p in parents {
            self.check(*p)?;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.clone(),
            func,
            parents: parents
                .iter()
                .map(|&node| Parent {
                    node,
                    role: ParentRole::Positional,
                })
                .collect(),
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Append a parent edge to an existing node. The parent may have been
    /// added after the child; ordering is resolved by `topo_order`.
    pub fn append_parent(
        &mut self,
        child: NodeId,
        parent: NodeId,
        role: ParentRole,
    ) -> Result<(), GraphError> {
        self.check(child)?;
        self.check(parent)?;
        self.nodes[child.0 as usize]
            .parents
            .push(Parent { node: parent, role });
        Ok(())
    }

    pub fn append_named(
        &mut self,
        child: NodeId,
        parent: NodeId,
        name: impl Into<String>,
    ) -> Result<(), GraphError> {
        self.append_parent(child, parent, ParentRole::Named(name.into()))
    }

    fn check(&self, id: NodeId) -> Result<(), GraphError> {
        if (id.0 as usize) < self.nodes.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(id))
        }
    }

    pub fn node(&self, id: NodeId) -> Result<&Node<F>, GraphError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownNode(id))
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node<F>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node needed to evaluate `outputs`. Traversal does not continue
    /// past nodes in `stop` (their values are supplied externally).
    pub fn live_set(&self, outputs: &[NodeId], stop: &HashSet<NodeId>) -> Result<HashSet<NodeId>, GraphError> {
        let mut live = HashSet::new();
        let mut stack: Vec<NodeId> = outputs.to_vec();
        while let Some(id) = stack.pop() {
            self.check(id)?;
            if !live.insert(id) || stop.contains(&id) {
                continue;
            }
            for p in &self.nodes[id.0 as usize].parents {
                stack.push(p.node);
            }
        }
        Ok(live)
    }

    /// Stable topological order of `live`. Edges into a node from outside
    /// `live` are ignored. Ties go to the earliest inserted node.
    pub fn topo_order(&self, live: &HashSet<NodeId>) -> Result<Vec<NodeId>, GraphError> {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &id in live {
            self.check(id)?;
            let mut seen = HashSet::new();
            let count = self.nodes[id.0 as usize]
                .parents
                .iter()
                .filter(|p| live.contains(&p.node) && seen.insert(p.node))
                .inspect(|p| children.entry(p.node).or_default().push(id))
                .count();
            indegree.insert(id, count);
        }

        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(live.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for child in children.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        if order.len() != live.len() {
            let placed: HashSet<NodeId> = order.iter().copied().collect();
            let mut stuck: Vec<NodeId> = live.difference(&placed).copied().collect();
            stuck.sort();
            return Err(GraphError::Cycle(
                stuck
                    .into_iter()
                    .map(|id| self.nodes[id.0 as usize].name.clone())
                    .collect(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(g: &Graph<()>) -> HashSet<NodeId> {
        g.nodes().map(|n| n.id).collect()
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut g = Graph::new();
        g.add_node("a", (), &[]).unwrap();
        assert_eq!(
            g.add_node("a", (), &[]),
            Err(GraphError::DuplicateNode("a".into()))
        );
    }

    #[test]
    fn unknown_parent_rejected() {
        let mut g: Graph<()> = Graph::new();
        assert_eq!(
            g.add_node("a", (), &[NodeId(3)]),
            Err(GraphError::UnknownNode(NodeId(3)))
        );
    }

    #[test]
    fn topo_respects_appended_parents() {
        let mut g = Graph::new();
        let late_child = g.add_node("child", (), &[]).unwrap();
        let parent = g.add_node("parent", (), &[]).unwrap();
        g.append_named(late_child, parent, "p").unwrap();
        let order = g.topo_order(&all(&g)).unwrap();
        assert_eq!(order, vec![parent, late_child]);
    }

    #[test]
    fn topo_ties_follow_insertion() {
        let mut g = Graph::new();
        let a = g.add_node("a", (), &[]).unwrap();
        let b = g.add_node("b", (), &[]).unwrap();
        let c = g.add_node("c", (), &[a, b]).unwrap();
        assert_eq!(g.topo_order(&all(&g)).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn cycle_detected() {
        let mut g = Graph::new();
        let a = g.add_node("a", (), &[]).unwrap();
        let b = g.add_node("b", (), &[a]).unwrap();
        g.append_parent(a, b, ParentRole::Positional).unwrap();
        match g.topo_order(&all(&g)) {
            Err(GraphError::Cycle(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn live_set_stops_at_supplied_nodes() {
        let mut g = Graph::new();
        let a = g.add_node("a", (), &[]).unwrap();
        let b = g.add_node("b", (), &[a]).unwrap();
        let c = g.add_node("c", (), &[b]).unwrap();
        let _unused = g.add_node("d", (), &[a]).unwrap();
        let stop: HashSet<NodeId> = [b].into_iter().collect();
        let live = g.live_set(&[c], &stop).unwrap();
        assert_eq!(live, [b, c].into_iter().collect());
    }
}
