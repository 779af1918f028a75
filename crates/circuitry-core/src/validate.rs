// Structural validation
//
// Checks, in order:
//
//   1. every reference (root and children) points into the arena
//   2. local shape: non-empty children, weight/child arity, leaf scope vs family
//   3. acyclicity and reachability, via an iterative DFS from the root
//   4. scopes bottom-up in DFS post-order: decomposability at products,
//      smoothness at sums
//
// Parameters are never inspected beyond their count. The first violation found
// is returned; the error names the offending node and invariant.

use log::debug;

use crate::circuit::Circuit;
use crate::error::{Error, Result, StructureViolation};
use crate::node::{Node, NodeId};
use crate::scope::Scope;

/// What a successful validation learns about a circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureInfo {
    /// Scope of every node, indexed by node id.
    pub scopes: Vec<Scope>,
    /// All nodes, children before parents (DFS post-order from the root).
    pub topo_order: Vec<NodeId>,
}

/// Validate `circuit` without touching its memoised result.
pub fn validate(circuit: &Circuit) -> Result<StructureInfo> {
    let nodes = circuit.nodes();
    let n = nodes.len();
    let root = circuit.root();

    if root.0 >= n {
        return Err(Error::structure(
            root,
            StructureViolation::DanglingReference,
            format!("root refers to node {} but the circuit has {} nodes", root.0, n),
        ));
    }

    for (i, node) in nodes.iter().enumerate() {
        check_local(NodeId(i), node, n, circuit.num_vars())?;
    }

    let topo_order = dfs_post_order(nodes, root)?;
    if topo_order.len() != n {
        let mut seen = vec![false; n];
        for id in &topo_order {
            seen[id.0] = true;
        }
        if let Some(i) = seen.iter().position(|s| !s) {
            return Err(Error::structure(
                NodeId(i),
                StructureViolation::Unreachable,
                format!("node is not reachable from root {root}"),
            ));
        }
    }

    let scopes = compute_scopes(nodes, &topo_order)?;
    debug!(
        "validated circuit: {} nodes, root scope of {} variables",
        n,
        scopes[root.0].len()
    );
    Ok(StructureInfo { scopes, topo_order })
}

fn check_local(id: NodeId, node: &Node, n: usize, num_vars: usize) -> Result<()> {
    match node {
        Node::Input {
            scope,
            family,
            params,
        } => {
            family
                .check_scope(scope.len())
                .map_err(|e| Error::structure(id, StructureViolation::InvalidLeaf, e))?;
            if let Some(v) = scope.max_var() {
                if v >= num_vars {
                    return Err(Error::structure(
                        id,
                        StructureViolation::InvalidLeaf,
                        format!("variable {v} out of range for {num_vars} variables"),
                    ));
                }
            }
            let expected = family.num_params(scope.len());
            if params.len() != expected {
                return Err(Error::structure(
                    id,
                    StructureViolation::InvalidLeaf,
                    format!(
                        "{} leaf over {} variables needs {} parameters, has {}",
                        family.name(),
                        scope.len(),
                        expected,
                        params.len()
                    ),
                ));
            }
        }
        Node::Product { children } | Node::Sum { children, .. } => {
            if children.is_empty() {
                return Err(Error::structure(
                    id,
                    StructureViolation::EmptyChildren,
                    format!("{} node has no children", node.kind()),
                ));
            }
            if let Some(c) = children.iter().find(|c| c.0 >= n) {
                return Err(Error::structure(
                    id,
                    StructureViolation::DanglingReference,
                    format!("child {} does not exist ({} nodes)", c.0, n),
                ));
            }
            if let Node::Sum { weights, .. } = node {
                if weights.len() != children.len() {
                    return Err(Error::structure(
                        id,
                        StructureViolation::WeightArity,
                        format!(
                            "{} weights for {} children",
                            weights.len(),
                            children.len()
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Iterative DFS from the root. Returns reachable nodes children-first and
/// fails on the first back edge.
fn dfs_post_order(nodes: &[Node], root: NodeId) -> Result<Vec<NodeId>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut color = vec![WHITE; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    // (node, index of the next child to visit)
    let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
    color[root.0] = GRAY;

    while let Some(top) = stack.last_mut() {
        let (id, next) = *top;
        let children = nodes[id.0].children();
        if next < children.len() {
            top.1 += 1;
            let child = children[next];
            match color[child.0] {
                WHITE => {
                    color[child.0] = GRAY;
                    stack.push((child, 0));
                }
                GRAY => {
                    return Err(Error::structure(
                        id,
                        StructureViolation::Acyclicity,
                        format!("edge {id} -> {child} closes a cycle"),
                    ));
                }
                _ => {}
            }
        } else {
            color[id.0] = BLACK;
            order.push(id);
            stack.pop();
        }
    }
    Ok(order)
}

fn compute_scopes(nodes: &[Node], order: &[NodeId]) -> Result<Vec<Scope>> {
    let mut scopes = vec![Scope::default(); nodes.len()];
    for &id in order {
        let scope = match &nodes[id.0] {
            Node::Input { scope, .. } => scope.clone(),
            Node::Product { children } => {
                let mut acc = Scope::default();
                for c in children {
                    let cs = &scopes[c.0];
                    if let Some(v) = acc.first_shared(cs) {
                        return Err(Error::structure(
                            id,
                            StructureViolation::Decomposability,
                            format!("variable {v} appears under more than one child (child {c})"),
                        ));
                    }
                    acc = acc.union(cs);
                }
                acc
            }
            Node::Sum { children, .. } => {
                let first = &scopes[children[0].0];
                if let Some(c) = children.iter().find(|c| &scopes[c.0] != first) {
                    return Err(Error::structure(
                        id,
                        StructureViolation::Smoothness,
                        format!(
                            "child {} has scope {} but child {} has scope {}",
                            c,
                            scopes[c.0],
                            children[0],
                            first
                        ),
                    ));
                }
                first.clone()
            }
        };
        scopes[id.0] = scope;
    }
    Ok(scopes)
}
