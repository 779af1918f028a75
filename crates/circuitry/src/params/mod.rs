// Parameter store — per-layer parameter tensors
//
// One flat node-major tensor per layer, `[num_nodes × width]`:
//
//   sum layer   — width = arity,            row = mixture weights
//   input layer — width = family params,    row = leaf parameters
//   product     — width = 0 (no tensor)
//
// The store is the only place parameters change after compilation. Every
// tensor that enters it (from the circuit, an update or a checkpoint) is
// domain-checked first, so the engine can assume normalised weights and valid
// leaf parameters.

pub mod stats;
pub mod update;

use circuitry_core::{Circuit, Error, Family, Node, Result, NORMALIZATION_TOL};

use crate::compile::{Layer, LayerKind};

pub use stats::Statistics;
pub use update::{gradients, update, UpdateConfig, UpdateMode, UpdateReport};

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStore {
    tensors: Vec<Vec<f64>>,
    widths: Vec<usize>,
}

impl ParameterStore {
    /// Gather the circuit's parameters into per-layer tensors.
    pub fn from_circuit(circuit: &Circuit, layers: &[Layer]) -> Result<Self> {
        let mut tensors = Vec::with_capacity(layers.len());
        let mut widths = Vec::with_capacity(layers.len());
        for layer in layers {
            let width = layer.kind.param_width();
            let mut data = Vec::with_capacity(layer.num_nodes() * width);
            for &id in &layer.nodes {
                match circuit.node(id) {
                    Some(Node::Sum { weights, .. }) => data.extend_from_slice(weights),
                    Some(Node::Input { params, .. }) => data.extend_from_slice(params),
                    Some(Node::Product { .. }) => {}
                    None => {
                        return Err(Error::Compilation(format!(
                            "layer {} refers to missing node {id}",
                            layer.index
                        )))
                    }
                }
            }
            check_layer(layer, &data)?;
            tensors.push(data);
            widths.push(width);
        }
        Ok(Self { tensors, widths })
    }

    pub fn num_layers(&self) -> usize {
        self.tensors.len()
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(Vec::len).sum()
    }

    pub fn layer(&self, layer: usize) -> &[f64] {
        &self.tensors[layer]
    }

    pub fn width(&self, layer: usize) -> usize {
        self.widths[layer]
    }

    /// Parameters of the node at `slot` in `layer`.
    pub fn node(&self, layer: usize, slot: usize) -> &[f64] {
        let w = self.widths[layer];
        &self.tensors[layer][slot * w..(slot + 1) * w]
    }

    /// Replace one layer's tensor after checking shape and domain.
    pub fn set_layer(&mut self, layer: &Layer, data: Vec<f64>) -> Result<()> {
        let expected = layer.num_nodes() * layer.kind.param_width();
        if data.len() != expected {
            return Err(Error::parameter(
                layer.index,
                format!("expected {expected} values, got {}", data.len()),
            ));
        }
        check_layer(layer, &data)?;
        self.tensors[layer.index] = data;
        Ok(())
    }

    /// Write the stored parameters into `circuit`'s nodes.
    pub fn write_to(&self, circuit: &mut Circuit, layers: &[Layer]) -> Result<()> {
        for layer in layers.iter().filter(|l| l.kind.has_params()) {
            for (slot, &id) in layer.nodes.iter().enumerate() {
                let src = self.node(layer.index, slot);
                match circuit.node_mut(id) {
                    Some(Node::Sum { weights, .. }) if weights.len() == src.len() => {
                        weights.copy_from_slice(src)
                    }
                    Some(Node::Input { params, .. }) if params.len() == src.len() => {
                        params.copy_from_slice(src)
                    }
                    _ => {
                        return Err(Error::msg(format!(
                            "node {id} does not match layer {} of the plan",
                            layer.index
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

/// Check that `data` is an in-domain parameter tensor for `layer`.
pub fn check_layer(layer: &Layer, data: &[f64]) -> Result<()> {
    let width = layer.kind.param_width();
    if width == 0 {
        return Ok(());
    }
    for (slot, row) in data.chunks(width).enumerate() {
        let node = layer.nodes[slot];
        match layer.kind {
            LayerKind::Sum { .. } => {
                if let Some(w) = row.iter().find(|w| !w.is_finite() || **w < 0.0) {
                    return Err(Error::parameter(
                        layer.index,
                        format!("node {node}: weight {w} is not a finite non-negative number"),
                    ));
                }
                let total: f64 = row.iter().sum();
                if (total - 1.0).abs() > NORMALIZATION_TOL {
                    return Err(Error::parameter(
                        layer.index,
                        format!("node {node}: weights sum to {total}, not 1"),
                    ));
                }
            }
            LayerKind::Input { family, scope_len } => {
                family
                    .validate_params(row, scope_len)
                    .map_err(|e| Error::parameter(layer.index, format!("node {node}: {e}")))?;
            }
            LayerKind::Product { .. } => {}
        }
    }
    Ok(())
}

/// Renormalise probability vectors in `data` after a lossy round trip
/// (e.g. through half-precision storage).
pub(crate) fn project_layer(layer: &Layer, data: &mut [f64]) {
    let width = layer.kind.param_width();
    if width == 0 {
        return;
    }
    let renormalize = |row: &mut [f64]| {
        row.iter_mut().for_each(|v| *v = v.max(0.0));
        let total: f64 = row.iter().sum();
        if total > 0.0 {
            row.iter_mut().for_each(|v| *v /= total);
        }
    };
    for row in data.chunks_mut(width) {
        match layer.kind {
            LayerKind::Sum { .. }
            | LayerKind::Input {
                family: Family::Categorical { .. },
                ..
            } => renormalize(row),
            LayerKind::Input {
                family: Family::Bernoulli,
                ..
            } => row[0] = row[0].clamp(0.0, 1.0),
            LayerKind::Input { .. } | LayerKind::Product { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::context::ExecContext;
    use circuitry_core::CircuitBuilder;

    fn plan_for(weights: &[f64]) -> Result<crate::plan::CompiledPlan> {
        let mut b = CircuitBuilder::new();
        let a = b.bernoulli(0, 0.2);
        let c = b.bernoulli(0, 0.9);
        let root = b.sum(&[a, c], weights);
        compile(&b.build(root)?, &ExecContext::cpu())
    }

    #[test]
    fn test_store_layout() {
        let plan = plan_for(&[0.4, 0.6]).unwrap();
        let params = plan.params();
        assert_eq!(params.num_layers(), 2);
        assert_eq!(params.layer(0), &[0.2, 0.9]);
        assert_eq!(params.node(1, 0), &[0.4, 0.6]);
        assert_eq!(params.num_params(), 4);
    }

    #[test]
    fn test_unnormalised_weights_rejected() {
        let err = plan_for(&[0.4, 0.4]).unwrap_err();
        assert!(matches!(err, Error::Parameter { layer: 1, .. }), "{err}");
    }

    #[test]
    fn test_set_layer_checks_domain() {
        let plan = plan_for(&[0.4, 0.6]).unwrap();
        let mut store = plan.params().clone();
        let layer = &plan.layers()[1];
        assert!(store.set_layer(layer, vec![0.5]).is_err());
        assert!(store.set_layer(layer, vec![-0.5, 1.5]).is_err());
        store.set_layer(layer, vec![0.1, 0.9]).unwrap();
        assert_eq!(store.layer(1), &[0.1, 0.9]);
    }

    #[test]
    fn test_project_layer() {
        let plan = plan_for(&[0.4, 0.6]).unwrap();
        let mut w = vec![0.40039, 0.59961 + 1e-4];
        project_layer(&plan.layers()[1], &mut w);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }
}
