// Layer — A group of same-shaped nodes executed as one batched operation
//
// Every layer owns flat index tables so the kernels never chase pointers:
//
//   children       n × arity  ChildRef{layer, slot}   (product / sum layers)
//   vars           n × scope  variable indices        (input layers)
//   parent_offsets n + 1      CSR row offsets into parent_edges
//   parent_edges   edges      ParentEdge{layer, edge} (who reads each node)
//
// `edge` addresses the parent layer's edge-flow buffer, which is laid out
// `[slot * arity + k]` per example. Backward fills those buffers from the
// parent side and every child layer gathers its node flows from them, so no
// two writers ever touch the same cell.

use std::fmt;

use circuitry_core::{Family, NodeId, NodeKind};

/// Shape shared by every node in a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Input { family: Family, scope_len: usize },
    Product { arity: usize },
    Sum { arity: usize },
}

impl LayerKind {
    pub fn node_kind(&self) -> NodeKind {
        match self {
            LayerKind::Input { .. } => NodeKind::Input,
            LayerKind::Product { .. } => NodeKind::Product,
            LayerKind::Sum { .. } => NodeKind::Sum,
        }
    }

    /// Children per node (0 for input layers).
    pub fn arity(&self) -> usize {
        match self {
            LayerKind::Input { .. } => 0,
            LayerKind::Product { arity } | LayerKind::Sum { arity } => *arity,
        }
    }

    /// Parameters per node.
    pub fn param_width(&self) -> usize {
        match self {
            LayerKind::Input { family, scope_len } => family.num_params(*scope_len),
            LayerKind::Product { .. } => 0,
            LayerKind::Sum { arity } => *arity,
        }
    }

    /// Accumulated statistics per node.
    pub fn stats_width(&self) -> usize {
        match self {
            LayerKind::Input { family, scope_len } => family.num_stats(*scope_len),
            LayerKind::Product { .. } => 0,
            LayerKind::Sum { arity } => *arity,
        }
    }

    pub fn has_params(&self) -> bool {
        self.param_width() > 0
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Input { family, scope_len } => {
                write!(f, "input[{}; {}]", family.name(), scope_len)
            }
            LayerKind::Product { arity } => write!(f, "product[{arity}]"),
            LayerKind::Sum { arity } => write!(f, "sum[{arity}]"),
        }
    }
}

/// Location of a node's value: layer index and row within the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildRef {
    pub layer: usize,
    pub slot: usize,
}

/// One incoming flow edge of a node, addressed in the parent layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentEdge {
    pub layer: usize,
    /// `parent_slot * parent_arity + k`.
    pub edge: usize,
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub index: usize,
    /// Longest path to a leaf; every node in the layer shares it.
    pub depth: usize,
    pub kind: LayerKind,
    /// Circuit nodes in slot order.
    pub nodes: Vec<NodeId>,
    pub children: Vec<ChildRef>,
    pub vars: Vec<usize>,
    pub parent_offsets: Vec<usize>,
    pub parent_edges: Vec<ParentEdge>,
    /// Earlier layers this layer reads, ascending.
    pub producers: Vec<usize>,
    /// Later layers that read this layer, ascending.
    pub consumers: Vec<usize>,
}

impl Layer {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn arity(&self) -> usize {
        self.kind.arity()
    }

    pub fn num_edges(&self) -> usize {
        self.nodes.len() * self.arity()
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input { .. })
    }

    /// Child references of the node at `slot`.
    pub fn children_of(&self, slot: usize) -> &[ChildRef] {
        let k = self.arity();
        &self.children[slot * k..(slot + 1) * k]
    }

    /// Scope variables of the input node at `slot`.
    pub fn vars_of(&self, slot: usize) -> &[usize] {
        match self.kind {
            LayerKind::Input { scope_len, .. } => &self.vars[slot * scope_len..(slot + 1) * scope_len],
            _ => &[],
        }
    }

    /// Incoming flow edges of the node at `slot`.
    pub fn parents_of(&self, slot: usize) -> &[ParentEdge] {
        &self.parent_edges[self.parent_offsets[slot]..self.parent_offsets[slot + 1]]
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layer {} (depth {}): {} x {}",
            self.index,
            self.depth,
            self.nodes.len(),
            self.kind
        )
    }
}
