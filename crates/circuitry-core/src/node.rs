use std::fmt;

use serde::{Deserialize, Serialize};

use crate::family::Family;
use crate::scope::Scope;

// Node — The three kinds of circuit nodes
//
// Nodes live in a flat arena owned by the Circuit and refer to each other by
// NodeId. A node never holds a live reference to another node, so shared
// children (a DAG, not a tree) need no reference counting and backward flow
// accumulation can index by id.
//
//   Input   — leaf distribution over `scope`, parameters owned by the node
//   Product — factorises over children with pairwise-disjoint scopes
//   Sum     — mixture over children with identical scopes

/// Index of a node inside its circuit's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Discriminant of [`Node`], used for grouping and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Input,
    Product,
    Sum,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Input => write!(f, "input"),
            NodeKind::Product => write!(f, "product"),
            NodeKind::Sum => write!(f, "sum"),
        }
    }
}

/// A circuit node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Leaf distribution over the variables in `scope`.
    Input {
        scope: Scope,
        family: Family,
        params: Vec<f64>,
    },
    /// Product over children with pairwise-disjoint scopes.
    Product { children: Vec<NodeId> },
    /// Weighted mixture over children with identical scopes.
    Sum {
        children: Vec<NodeId>,
        weights: Vec<f64>,
    },
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Input { .. } => NodeKind::Input,
            Node::Product { .. } => NodeKind::Product,
            Node::Sum { .. } => NodeKind::Sum,
        }
    }

    /// Child references (empty for inputs).
    pub fn children(&self) -> &[NodeId] {
        match self {
            Node::Input { .. } => &[],
            Node::Product { children } | Node::Sum { children, .. } => children,
        }
    }

    pub fn arity(&self) -> usize {
        self.children().len()
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Node::Input { .. })
    }
}
