use std::fmt;
use std::sync::{Arc, OnceLock};

use rand::Rng;

use crate::error::Result;
use crate::family::{normalize, Family};
use crate::node::{Node, NodeId, NodeKind};
use crate::scope::Scope;
use crate::validate::{self, StructureInfo};

// Circuit — A DAG of input, product and sum nodes with one root
//
// The circuit is the structural description plus the initial parameters the
// parameter store is seeded from. It is validated once; the result (per-node
// scopes and a children-first order) is memoised until the next mutation.

/// A probabilistic circuit.
#[derive(Debug, Clone)]
pub struct Circuit {
    nodes: Vec<Node>,
    root: NodeId,
    num_vars: usize,
    structure: OnceLock<Arc<StructureInfo>>,
}

impl Circuit {
    /// Create a circuit from an arena of nodes and a root.
    ///
    /// The number of variables is one past the largest variable index any
    /// input node mentions. Nothing is validated here.
    pub fn new(nodes: Vec<Node>, root: NodeId) -> Self {
        let num_vars = nodes
            .iter()
            .filter_map(|n| match n {
                Node::Input { scope, .. } => scope.max_var().map(|v| v + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Self {
            nodes,
            root,
            num_vars,
            structure: OnceLock::new(),
        }
    }

    /// Declare more variables than the input nodes mention.
    pub fn with_num_vars(mut self, num_vars: usize) -> Self {
        self.num_vars = self.num_vars.max(num_vars);
        self.structure = OnceLock::new();
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of child edges.
    pub fn num_edges(&self) -> usize {
        self.nodes.iter().map(Node::arity).sum()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Mutable access to a node. Invalidates the memoised validation.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.structure = OnceLock::new();
        self.nodes.get_mut(id.0)
    }

    /// Number of nodes of the given kind.
    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes.iter().filter(|n| n.kind() == kind).count()
    }

    /// Check every structural invariant.
    ///
    /// The result is memoised per circuit version: repeated calls on an
    /// unmodified circuit return the cached scopes and order.
    pub fn validate(&self) -> Result<Arc<StructureInfo>> {
        if let Some(info) = self.structure.get() {
            return Ok(info.clone());
        }
        let info = Arc::new(validate::validate(self)?);
        let _ = self.structure.set(info.clone());
        Ok(info)
    }

    /// Whether a successful validation is cached for this version.
    pub fn is_validated(&self) -> bool {
        self.structure.get().is_some()
    }
}

impl PartialEq for Circuit {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.num_vars == other.num_vars && self.nodes == other.nodes
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Circuit(root {}, {} vars, {} nodes: {} input / {} product / {} sum, {} edges)",
            self.root,
            self.num_vars,
            self.nodes.len(),
            self.count(NodeKind::Input),
            self.count(NodeKind::Product),
            self.count(NodeKind::Sum),
            self.num_edges()
        )
    }
}

// CircuitBuilder — incremental construction
//
// Children must already exist when a parent is added, so a builder can only
// produce acyclic circuits. Everything else is checked by `build`.

/// Incremental circuit construction.
///
/// ```
/// use circuitry_core::CircuitBuilder;
///
/// let mut b = CircuitBuilder::new();
/// let x0 = b.gaussian(0, 0.0, 1.0);
/// let x1 = b.gaussian(1, 2.0, 0.5);
/// let p = b.product(&[x0, x1]);
/// let circuit = b.build(p).unwrap();
/// assert_eq!(circuit.num_vars(), 2);
/// ```
#[derive(Debug, Default)]
pub struct CircuitBuilder {
    nodes: Vec<Node>,
}

impl CircuitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append an arbitrary node.
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn input(&mut self, scope: Scope, family: Family, params: Vec<f64>) -> NodeId {
        self.push(Node::Input {
            scope,
            family,
            params,
        })
    }

    /// Input node with random in-domain parameters.
    pub fn random_input<R: Rng + ?Sized>(
        &mut self,
        scope: Scope,
        family: Family,
        rng: &mut R,
    ) -> NodeId {
        let params = family.random_params(scope.len(), rng);
        self.input(scope, family, params)
    }

    pub fn categorical(&mut self, var: usize, probs: &[f64]) -> NodeId {
        self.input(
            Scope::single(var),
            Family::Categorical {
                num_cats: probs.len(),
            },
            probs.to_vec(),
        )
    }

    pub fn bernoulli(&mut self, var: usize, p: f64) -> NodeId {
        self.input(Scope::single(var), Family::Bernoulli, vec![p])
    }

    pub fn gaussian(&mut self, var: usize, mean: f64, variance: f64) -> NodeId {
        self.input(Scope::single(var), Family::Gaussian, vec![mean, variance])
    }

    pub fn product(&mut self, children: &[NodeId]) -> NodeId {
        self.push(Node::Product {
            children: children.to_vec(),
        })
    }

    pub fn sum(&mut self, children: &[NodeId], weights: &[f64]) -> NodeId {
        self.push(Node::Sum {
            children: children.to_vec(),
            weights: weights.to_vec(),
        })
    }

    pub fn sum_uniform(&mut self, children: &[NodeId]) -> NodeId {
        let w = vec![1.0 / children.len().max(1) as f64; children.len()];
        self.sum(children, &w)
    }

    /// Sum node with random normalised weights.
    pub fn sum_random<R: Rng + ?Sized>(&mut self, children: &[NodeId], rng: &mut R) -> NodeId {
        let raw: Vec<f64> = children.iter().map(|_| rng.gen_range(0.1..1.0)).collect();
        let w = normalize(&raw);
        self.sum(children, &w)
    }

    /// Finish the circuit and validate it.
    pub fn build(self, root: NodeId) -> Result<Circuit> {
        let circuit = self.build_unchecked(root);
        circuit.validate()?;
        Ok(circuit)
    }

    /// Finish the circuit without validating.
    pub fn build_unchecked(self, root: NodeId) -> Circuit {
        Circuit::new(self.nodes, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_vars_from_scopes() {
        let mut b = CircuitBuilder::new();
        let a = b.bernoulli(0, 0.3);
        let c = b.bernoulli(4, 0.6);
        let p = b.product(&[a, c]);
        let circuit = b.build(p).unwrap();
        assert_eq!(circuit.num_vars(), 5);
        assert_eq!(circuit.num_edges(), 2);
        assert_eq!(circuit.count(NodeKind::Input), 2);
    }

    #[test]
    fn test_validation_is_memoised_until_mutation() {
        let mut b = CircuitBuilder::new();
        let a = b.gaussian(0, 0.0, 1.0);
        let c = b.gaussian(0, 1.0, 1.0);
        let s = b.sum_uniform(&[a, c]);
        let mut circuit = b.build(s).unwrap();
        assert!(circuit.is_validated());

        if let Some(Node::Sum { weights, .. }) = circuit.node_mut(s) {
            weights[0] = 0.25;
            weights[1] = 0.75;
        }
        assert!(!circuit.is_validated());
        circuit.validate().unwrap();
        assert!(circuit.is_validated());
    }

    #[test]
    fn test_display() {
        let mut b = CircuitBuilder::new();
        let a = b.bernoulli(0, 0.5);
        let circuit = b.build(a).unwrap();
        let s = circuit.to_string();
        assert!(s.contains("1 nodes"));
        assert!(s.contains("1 input"));
    }
}
