// Kernel dispatch — choose an implementation per layer
//
// A kernel evaluates one whole layer over one batch:
//
//   forward  — node values from child values (or data, for input layers)
//   backward — edge flows and parameter statistics from node flows
//   gather   — node flows as the sum of incoming edge flows
//
// Every layer can run on the generic kernel. A registry may also hold fused
// kernels; one is used when it supports the layer's shape on the current
// device and the layer is big enough (`num_nodes × batch > threshold`) to
// amortise it. Otherwise the generic kernel runs. Fallback is silent and the
// results agree within floating-point tolerance, so the choice never changes
// what the caller sees.

pub mod fused;
pub mod generic;

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};

use circuitry_core::{DataBatch, Error, Family, Result, Stage};

use crate::compile::{ChildRef, Layer, LayerKind, ParentEdge};
use crate::context::DeviceCaps;

pub use fused::ParallelKernel;
pub use generic::GenericKernel;

/// Buffers one layer reads during forward and backward.
pub struct LayerInputs<'a> {
    pub batch: &'a DataBatch,
    pub batch_size: usize,
    values: Vec<&'a [f64]>,
}

impl<'a> LayerInputs<'a> {
    /// Borrow the value buffers of every producer of `layer`.
    pub(crate) fn for_layer(
        layer: &Layer,
        batch: &'a DataBatch,
        slots: &'a [Option<Vec<f64>>],
    ) -> Result<Self> {
        let empty: &'a [f64] = &[];
        let mut values = vec![empty; slots.len()];
        for &p in &layer.producers {
            values[p] = slots[p].as_deref().ok_or_else(|| {
                Error::Compilation(format!(
                    "layer {} reads layer {p} before it was evaluated",
                    layer.index
                ))
            })?;
        }
        Ok(Self {
            batch,
            batch_size: batch.num_examples(),
            values,
        })
    }

    /// Per-example values of a child node.
    pub fn row(&self, child: ChildRef) -> &'a [f64] {
        let b = self.batch_size;
        &self.values[child.layer][child.slot * b..(child.slot + 1) * b]
    }
}

/// Edge-flow buffers of the layers that read one layer.
pub struct EdgeFlows<'a> {
    pub batch_size: usize,
    bufs: Vec<&'a [f64]>,
}

impl<'a> EdgeFlows<'a> {
    pub(crate) fn for_layer(layer: &Layer, batch_size: usize, slots: &'a [Option<Vec<f64>>]) -> Result<Self> {
        let empty: &'a [f64] = &[];
        let mut bufs = vec![empty; slots.len()];
        for &c in &layer.consumers {
            bufs[c] = slots[c].as_deref().ok_or_else(|| {
                Error::Compilation(format!(
                    "layer {} gathers from layer {c} before its edge flows exist",
                    layer.index
                ))
            })?;
        }
        Ok(Self { batch_size, bufs })
    }

    /// Per-example flow along one edge.
    pub fn edge(&self, pe: ParentEdge) -> &'a [f64] {
        let b = self.batch_size;
        &self.bufs[pe.layer][pe.edge * b..(pe.edge + 1) * b]
    }
}

/// Mutable state of one backward layer step.
pub struct BackwardStep<'a> {
    /// Forward values of this layer, `[num_nodes × batch]`.
    pub values: &'a [f64],
    /// Node flows of this layer, `[num_nodes × batch]`.
    pub flows: &'a [f64],
    pub params: &'a [f64],
    /// Output: `[num_edges × batch]` (empty for input layers).
    pub edge_flows: &'a mut [f64],
    /// Output, accumulated: `[num_nodes × stats_width]`.
    pub stats: &'a mut [f64],
}

/// A batched implementation of the three layer operations.
pub trait LayerKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether this kernel can run `kind` on a device with `caps`.
    fn supports(&self, _kind: &LayerKind, _caps: &DeviceCaps) -> bool {
        true
    }

    fn forward(&self, layer: &Layer, inputs: &LayerInputs<'_>, params: &[f64], out: &mut [f64]) -> Result<()>;

    fn backward(&self, layer: &Layer, inputs: &LayerInputs<'_>, step: BackwardStep<'_>) -> Result<()>;

    fn gather(&self, layer: &Layer, edges: &EdgeFlows<'_>, out: &mut [f64]);
}

/// Compile-time dispatch decision for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEntry {
    /// Fused kernel eligible for this layer's shape, if any.
    pub fused: Option<&'static str>,
    /// Smallest batch at which the fused kernel is used.
    pub min_batch: usize,
}

/// The generic kernel plus any number of fused kernels, tried in order.
#[derive(Debug, Clone)]
pub struct KernelRegistry {
    generic: Arc<dyn LayerKernel>,
    fused: Vec<Arc<dyn LayerKernel>>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl KernelRegistry {
    /// Generic kernel plus the rayon-parallel fused kernel.
    pub fn standard() -> Self {
        Self::generic_only().with_fused(Arc::new(ParallelKernel))
    }

    pub fn generic_only() -> Self {
        Self {
            generic: Arc::new(GenericKernel),
            fused: Vec::new(),
        }
    }

    /// Register a fused kernel. Earlier registrations win.
    pub fn with_fused(mut self, kernel: Arc<dyn LayerKernel>) -> Self {
        self.fused.push(kernel);
        self
    }

    pub fn generic(&self) -> &dyn LayerKernel {
        self.generic.as_ref()
    }

    fn eligible(&self, kind: &LayerKind, caps: &DeviceCaps) -> Option<&dyn LayerKernel> {
        self.fused
            .iter()
            .find(|k| k.supports(kind, caps))
            .map(|k| &**k)
    }

    /// Kernel for `layer` at `batch_size`. A pure function of the layer's
    /// shape and size, the device, the threshold and the batch size.
    pub fn select(
        &self,
        layer: &Layer,
        batch_size: usize,
        caps: DeviceCaps,
        threshold: usize,
    ) -> &dyn LayerKernel {
        match self.eligible(&layer.kind, &caps) {
            Some(k) if layer.num_nodes().saturating_mul(batch_size) > threshold => k,
            Some(k) => {
                trace!(
                    "layer {}: {} below threshold ({} x {}), using generic",
                    layer.index,
                    k.name(),
                    layer.num_nodes(),
                    batch_size
                );
                self.generic.as_ref()
            }
            None => self.generic.as_ref(),
        }
    }

    /// Dispatch entry for every layer.
    pub fn plan(&self, layers: &[Layer], caps: DeviceCaps, threshold: usize) -> Vec<DispatchEntry> {
        layers
            .iter()
            .map(|layer| {
                let fused = self.eligible(&layer.kind, &caps).map(|k| k.name());
                let min_batch = (threshold / layer.num_nodes().max(1)).saturating_add(1);
                if let Some(name) = fused {
                    debug!("layer {}: {} from batch {}", layer.index, name, min_batch);
                }
                DispatchEntry { fused, min_batch }
            })
            .collect()
    }
}

/// Log-density of the input node at `slot` on example `b`. Unobserved
/// variables are integrated out (contribute 0).
///
/// A non-finite term is a numerical error unless it is `-inf` from a
/// zero-valued probability parameter.
pub(crate) fn leaf_log_density(
    layer: &Layer,
    family: &Family,
    params: &[f64],
    batch: &DataBatch,
    slot: usize,
    b: usize,
) -> Result<f64> {
    let mut lp = 0.0;
    for (d, &var) in layer.vars_of(slot).iter().enumerate() {
        if let Some(x) = batch.get(b, var) {
            if !family.check_value(x) {
                return Err(Error::Data(format!(
                    "example {b}, variable {var}: value {x} is outside the support of {} leaf {} (layer {})",
                    family.name(),
                    layer.nodes[slot],
                    layer.index
                )));
            }
            let term = family.log_density_dim(params, d, x);
            if !term.is_finite() && !(term == f64::NEG_INFINITY && family.is_zero_probability(params, x)) {
                return Err(Error::Numerical {
                    stage: Stage::Forward,
                    layer: layer.index,
                    node: layer.nodes[slot],
                    example: b,
                    value: term,
                });
            }
            lp += term;
        }
    }
    Ok(lp)
}

/// Add the flow-weighted sufficient statistics of example `b` for the input
/// node at `slot`.
pub(crate) fn leaf_accumulate(
    layer: &Layer,
    family: &Family,
    batch: &DataBatch,
    slot: usize,
    b: usize,
    flow: f64,
    stats: &mut [f64],
) {
    for (d, &var) in layer.vars_of(slot).iter().enumerate() {
        if let Some(x) = batch.get(b, var) {
            family.accumulate_dim(stats, d, x, flow);
        }
    }
}

/// Flow along a sum edge: `flow × w × exp(child − parent)`.
#[inline]
pub(crate) fn sum_edge_flow(flow: f64, weight: f64, child: f64, parent: f64) -> f64 {
    if flow == 0.0 || parent == f64::NEG_INFINITY || child == f64::NEG_INFINITY {
        0.0
    } else {
        flow * weight * (child - parent).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Device;
    use circuitry_core::NodeId;

    fn sum_layer(n: usize, arity: usize) -> Layer {
        Layer {
            index: 1,
            depth: 1,
            kind: LayerKind::Sum { arity },
            nodes: (0..n).map(NodeId).collect(),
            children: Vec::new(),
            vars: Vec::new(),
            parent_offsets: vec![0; n + 1],
            parent_edges: Vec::new(),
            producers: vec![0],
            consumers: Vec::new(),
        }
    }

    #[test]
    fn test_select_threshold() {
        let reg = KernelRegistry::standard();
        let caps = Device::Parallel { threads: 0 }.capabilities();
        let layer = sum_layer(8, 2);
        assert_eq!(reg.select(&layer, 1, caps, 64).name(), "generic");
        assert_eq!(reg.select(&layer, 8, caps, 64).name(), "generic");
        assert_eq!(reg.select(&layer, 9, caps, 64).name(), "parallel");
        let entry = &reg.plan(std::slice::from_ref(&layer), caps, 64)[0];
        assert_eq!(entry.fused, Some("parallel"));
        assert_eq!(entry.min_batch, 9);
    }

    #[test]
    fn test_select_respects_device() {
        let reg = KernelRegistry::standard();
        let layer = sum_layer(8, 2);
        let caps = Device::Cpu.capabilities();
        assert_eq!(reg.select(&layer, 1 << 20, caps, 1).name(), "generic");

        let wide = sum_layer(1, 10_000);
        let caps = Device::Parallel { threads: 0 }.capabilities();
        assert_eq!(reg.select(&wide, 1 << 20, caps, 1).name(), "generic");
    }

    #[test]
    fn test_sum_edge_flow_zero_cases() {
        assert_eq!(sum_edge_flow(0.0, 0.5, -1.0, -1.0), 0.0);
        assert_eq!(sum_edge_flow(1.0, 0.5, f64::NEG_INFINITY, -1.0), 0.0);
        assert_eq!(sum_edge_flow(1.0, 0.5, -1.0, f64::NEG_INFINITY), 0.0);
        assert!((sum_edge_flow(2.0, 0.25, -1.0, -1.0) - 0.5).abs() < 1e-12);
    }
}
