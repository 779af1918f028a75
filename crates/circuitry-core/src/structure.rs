// Structure description — the external, serialisable form of a circuit
//
// A description is what structure-learning tools emit and what checkpoints
// embed. Node indices are positions in `nodes`. Parameters are optional; any
// that are missing are drawn at random from `seed` when the circuit is built.
//
//   {
//     "num_vars": 2,
//     "root": 3,
//     "seed": 7,
//     "nodes": [
//       { "type": "input", "scope": [0], "dist": { "family": "gaussian" }, "params": [0.0, 1.0] },
//       { "type": "input", "scope": [1], "dist": { "family": "categorical", "num_cats": 3 } },
//       { "type": "product", "children": [0, 1] },
//       { "type": "sum", "children": [2], "weights": [1.0] }
//     ]
//   }

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::circuit::Circuit;
use crate::error::{Error, Result};
use crate::family::{normalize, Family};
use crate::node::{Node, NodeId};
use crate::scope::Scope;

/// Serialisable description of a circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDescription {
    pub num_vars: usize,
    pub root: usize,
    pub nodes: Vec<NodeDescription>,
    /// Seed for parameters that are not given explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// One node of a [`CircuitDescription`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeDescription {
    Input {
        scope: Vec<usize>,
        dist: Family,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Vec<f64>>,
    },
    Product {
        children: Vec<usize>,
    },
    Sum {
        children: Vec<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weights: Option<Vec<f64>>,
    },
}

impl CircuitDescription {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Materialise the circuit, drawing missing parameters from `seed`.
    ///
    /// The result is not validated; `compile` (or `Circuit::validate`) does that.
    pub fn build(&self) -> Result<Circuit> {
        let mut rng = StdRng::seed_from_u64(self.seed.unwrap_or(0));
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, d)| describe_to_node(i, d, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Circuit::new(nodes, NodeId(self.root)).with_num_vars(self.num_vars))
    }
}

fn describe_to_node<R: Rng>(index: usize, desc: &NodeDescription, rng: &mut R) -> Result<Node> {
    Ok(match desc {
        NodeDescription::Input {
            scope,
            dist,
            params,
        } => {
            let scope = Scope::new(scope.iter().copied());
            if scope.is_empty() {
                return Err(Error::Format(format!("input node {index} has an empty scope")));
            }
            let params = match params {
                Some(p) => p.clone(),
                None => dist.random_params(scope.len(), rng),
            };
            Node::Input {
                scope,
                family: *dist,
                params,
            }
        }
        NodeDescription::Product { children } => Node::Product {
            children: children.iter().map(|&c| NodeId(c)).collect(),
        },
        NodeDescription::Sum { children, weights } => {
            let weights = match weights {
                Some(w) => w.clone(),
                None => {
                    let raw: Vec<f64> = children.iter().map(|_| rng.gen_range(0.1..1.0)).collect();
                    normalize(&raw)
                }
            };
            Node::Sum {
                children: children.iter().map(|&c| NodeId(c)).collect(),
                weights,
            }
        }
    })
}

impl Circuit {
    /// Build a circuit from a description. See [`CircuitDescription::build`].
    pub fn from_description(desc: &CircuitDescription) -> Result<Circuit> {
        desc.build()
    }

    /// Describe this circuit, parameters included.
    pub fn to_description(&self) -> CircuitDescription {
        let nodes = self
            .nodes()
            .iter()
            .map(|n| match n {
                Node::Input {
                    scope,
                    family,
                    params,
                } => NodeDescription::Input {
                    scope: scope.vars().to_vec(),
                    dist: *family,
                    params: Some(params.clone()),
                },
                Node::Product { children } => NodeDescription::Product {
                    children: children.iter().map(|c| c.0).collect(),
                },
                Node::Sum { children, weights } => NodeDescription::Sum {
                    children: children.iter().map(|c| c.0).collect(),
                    weights: Some(weights.clone()),
                },
            })
            .collect();
        CircuitDescription {
            num_vars: self.num_vars(),
            root: self.root().0,
            nodes,
            seed: None,
        }
    }

    pub fn from_json(s: &str) -> Result<Circuit> {
        CircuitDescription::from_json(s)?.build()
    }

    pub fn to_json(&self) -> Result<String> {
        self.to_description().to_json()
    }
}
