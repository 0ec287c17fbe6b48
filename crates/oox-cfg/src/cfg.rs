//! Control-flow graph representation.
//!
//! Every labelled program point is a [`CfgNode`]; edges encode statement
//! order. Branching (`if`/`while`) is encoded purely in the edge structure:
//! the guard becomes a pair of `assume` nodes that are both successors of
//! whatever precedes the branch, so the interpreter never sees a compound
//! statement.

use oox_syntax::{Identifier, Invocation, Lhs, RuntimeType, Statement};
use std::collections::BTreeMap;
use std::fmt;

/// A dense label assigned to every CFG node.
pub type NodeId = u64;

/// Identifies a class member (methods and constructors are not overloaded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberRef {
    pub class_name: Identifier,
    pub member_name: Identifier,
}

impl MemberRef {
    pub fn new(class_name: impl Into<Identifier>, member_name: impl Into<Identifier>) -> Self {
        Self {
            class_name: class_name.into(),
            member_name: member_name.into(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.member_name)
    }
}

/// The kind of a CFG node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A straight-line statement. Only atomic statement variants appear
    /// here; control-flow statements are flattened into edges.
    Statement(Statement),
    /// Entry bracket of a method or constructor body.
    MemberEntry { member: MemberRef },
    /// Exit bracket of a method or constructor body.
    MemberExit {
        return_type: RuntimeType,
        member: MemberRef,
    },
    /// Start of a `try` block; `handler` is the `CatchEntry` node.
    TryEntry { handler: NodeId },
    /// Normal (non-exceptional) end of a `try` block.
    TryExit,
    /// Start of a `catch` block, reached only through unwinding.
    CatchEntry,
    /// End of a `catch` block.
    CatchExit,
    /// A `throw` site.
    Exceptional { message: String },
    /// A method or constructor invocation. `target` receives the returned
    /// value on frame pop.
    Call {
        invocation: Invocation,
        target: Option<Lhs>,
    },
    /// A `join` statement: waits until all child threads have despawned.
    Join,
}

impl NodeKind {
    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Statement(_) => "statement",
            NodeKind::MemberEntry { .. } => "member entry",
            NodeKind::MemberExit { .. } => "member exit",
            NodeKind::TryEntry { .. } => "try entry",
            NodeKind::TryExit => "try exit",
            NodeKind::CatchEntry => "catch entry",
            NodeKind::CatchExit => "catch exit",
            NodeKind::Exceptional { .. } => "exceptional",
            NodeKind::Call { .. } => "call",
            NodeKind::Join => "join",
        }
    }
}

/// A labelled node.
#[derive(Debug, Clone)]
pub struct CfgNode {
    pub id: NodeId,
    pub kind: NodeKind,
}

/// A node together with its immediate neighbours.
#[derive(Debug, Clone, Copy)]
pub struct CfgContext<'a> {
    pub predecessors: &'a [NodeId],
    pub id: NodeId,
    pub kind: &'a NodeKind,
    pub successors: &'a [NodeId],
}

/// The control-flow graph of a whole compilation unit.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    nodes: BTreeMap<NodeId, CfgNode>,
    successors: BTreeMap<NodeId, Vec<NodeId>>,
    predecessors: BTreeMap<NodeId, Vec<NodeId>>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, returning its id.
    pub(crate) fn insert(&mut self, id: NodeId, kind: NodeKind) -> NodeId {
        self.nodes.insert(id, CfgNode { id, kind });
        self.successors.entry(id).or_default();
        self.predecessors.entry(id).or_default();
        id
    }

    /// Add a directed edge.
    pub(crate) fn connect(&mut self, from: NodeId, to: NodeId) {
        let succs = self.successors.entry(from).or_default();
        if !succs.contains(&to) {
            succs.push(to);
        }
        let preds = self.predecessors.entry(to).or_default();
        if !preds.contains(&from) {
            preds.push(from);
        }
    }

    /// Look up a node's kind. Panics on an unknown id; ids only come from
    /// this graph.
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[&id].kind
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.predecessors
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The full context of a node: neighbours plus kind.
    pub fn context(&self, id: NodeId) -> CfgContext<'_> {
        CfgContext {
            predecessors: self.predecessors(id),
            id,
            kind: self.kind(id),
            successors: self.successors(id),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_deduplicates_edges() {
        let mut cfg = ControlFlowGraph::new();
        cfg.insert(0, NodeKind::Join);
        cfg.insert(1, NodeKind::TryExit);
        cfg.connect(0, 1);
        cfg.connect(0, 1);
        assert_eq!(cfg.successors(0), &[1]);
        assert_eq!(cfg.predecessors(1), &[0]);
    }

    #[test]
    fn test_context_view() {
        let mut cfg = ControlFlowGraph::new();
        cfg.insert(0, NodeKind::Join);
        cfg.insert(1, NodeKind::TryExit);
        cfg.insert(2, NodeKind::CatchExit);
        cfg.connect(0, 1);
        cfg.connect(1, 2);
        let ctx = cfg.context(1);
        assert_eq!(ctx.predecessors, &[0]);
        assert_eq!(ctx.successors, &[2]);
        assert_eq!(ctx.id, 1);
    }
}
