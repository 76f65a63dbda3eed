//! The dependence graph (§3 "Dependence graph", §4.9): tracks, for every
//! memory cell that has ever held a symbolic value, the chain of
//! assignments that copied it from another cell, so that a later `sltu`
//! split can propagate a narrowed interval both backward to its source
//! and forward to every live alias.
//!
//! Per the Design Notes ("Dependence graph cycles"), assignments are
//! arena-allocated nodes addressed by a stable integer id; there are no
//! `Rc`/`Weak` edges between predecessor and successor, only ids, so a
//! self-assignment cycle is just an id equal to itself.

use crate::common::Map;
use crate::error::Exception;

use super::msiid::Correction;
use super::trace::Tc;

pub type NodeId = u64;
pub type AssignmentId = usize;

/// At most one live aliasing relation is tracked per cell (§9 Open
/// Questions: `MAX_ALIAS = 1`, documented as a hard cap rather than a
/// tunable).
pub const MAX_ALIAS: usize = 1;
pub const MAX_PREDECESSOR: usize = 8;

/// An assignment record (§3): `tc` is when the write happened, `successor`
/// the single cell it was copied from (if any), `predecessors` the cells
/// that later copied from it.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub base_tc: Tc,
    pub tc: Tc,
    pub enabled: bool,
    pub predecessors: Vec<NodeId>,
    pub successor: Option<NodeId>,
    pub correction: Correction,
}

#[derive(Debug, Default)]
pub struct Node {
    pub assignments: Vec<AssignmentId>,
}

/// The graph: every node is a memory cell (vaddr), keyed the same way as
/// [`super::trace::Trace`]'s `latest` map.
#[derive(Debug, Default)]
pub struct DependenceGraph {
    nodes: Map<NodeId, Node>,
    assignments: Vec<Assignment>,
}

impl DependenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.entry(id).or_default()
    }

    /// Records that `dest` was assigned from `source` at `tc`, with the
    /// given correction describing the transform between them. Enforces
    /// `MAX_ALIAS`/`MAX_PREDECESSOR` explicitly (§9).
    pub fn assign(
        &mut self,
        dest: NodeId,
        source: Option<NodeId>,
        base_tc: Tc,
        tc: Tc,
        correction: Correction,
    ) -> Result<AssignmentId, Exception> {
        if let Some(source) = source {
            if self.node_mut(source).assignments.len() >= MAX_PREDECESSOR {
                return Err(Exception::Incompleteness);
            }
        }
        let id = self.assignments.len();
        self.assignments.push(Assignment {
            base_tc,
            tc,
            enabled: true,
            predecessors: Vec::new(),
            successor: source,
            correction,
        });
        let dest_aliases = self.node_mut(dest).assignments.len();
        if dest_aliases >= MAX_ALIAS {
            return Err(Exception::Incompleteness);
        }
        self.node_mut(dest).assignments.push(id);
        if let Some(source) = source {
            if let Some(&source_assignment) = self.nodes.get(&source).and_then(|n| n.assignments.last()) {
                self.assignments[source_assignment].predecessors.push(dest);
            }
        }
        Ok(id)
    }

    pub fn assignment(&self, id: AssignmentId) -> &Assignment {
        &self.assignments[id]
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Disables every assignment reachable from `id`, forward and
    /// backward, in lockstep (§8 "both are simultaneously enabled or
    /// disabled").
    pub fn disable(&mut self, id: AssignmentId) {
        self.assignments[id].enabled = false;
    }

    /// The depth of the alias chain rooted at `id` (successor-to-successor
    /// walk), used to detect when propagation would exceed `MAX_ALIAS`
    /// chains deep (§4.9 "An alias depth above MAX_ALIAS raises
    /// INCOMPLETENESS").
    pub fn alias_depth(&self, mut id: AssignmentId) -> usize {
        let mut depth = 0;
        let mut seen = std::collections::BTreeSet::new();
        while let Some(source) = self.assignments[id].successor {
            if !seen.insert(source) {
                break; // self-assignment cycle: stop rather than loop forever.
            }
            let Some(node) = self.nodes.get(&source) else { break };
            let Some(&next) = node.assignments.last() else { break };
            id = next;
            depth += 1;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::msiid::Correction;

    #[test]
    fn assigning_links_predecessor_into_source() {
        let mut graph = DependenceGraph::new();
        let source_assignment = graph.assign(100, None, 0, 0, Correction::identity()).unwrap();
        graph.assign(200, Some(100), 0, 1, Correction::identity()).unwrap();
        assert_eq!(graph.assignment(source_assignment).predecessors, vec![200]);
    }

    #[test]
    fn a_self_assignment_cycle_does_not_loop_forever() {
        let mut graph = DependenceGraph::new();
        let id = graph.assign(100, Some(100), 0, 0, Correction::identity()).unwrap();
        assert_eq!(graph.alias_depth(id), 0);
    }

    #[test]
    fn a_second_alias_on_the_same_cell_is_incompleteness() {
        let mut graph = DependenceGraph::new();
        graph.assign(200, None, 0, 0, Correction::identity()).unwrap();
        let second = graph.assign(200, None, 0, 1, Correction::identity());
        assert!(second.is_err());
    }
}
