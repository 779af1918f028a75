// Generic kernel — Gather, elementwise, reduce
//
// The reference implementation every layer falls back to. It works the way a
// tensor library would: materialise the gathered child values as a
// `[nodes × arity × batch]` block, apply the elementwise part (add log
// weights), then reduce over the arity axis. Single-threaded; the
// intermediates are freed at the end of each call.

use circuitry_core::Result;

use super::{leaf_accumulate, leaf_log_density, sum_edge_flow, BackwardStep, EdgeFlows, LayerInputs, LayerKernel};
use crate::compile::{Layer, LayerKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericKernel;

impl GenericKernel {
    /// `[n × k × B]` block of child values, each shifted by `shift(edge)`.
    fn gather_children<F>(layer: &Layer, inputs: &LayerInputs<'_>, shift: F) -> Vec<f64>
    where
        F: Fn(usize) -> f64,
    {
        let bsz = inputs.batch_size;
        let mut block = Vec::with_capacity(layer.num_edges() * bsz);
        for (e, child) in layer.children.iter().enumerate() {
            let s = shift(e);
            block.extend(inputs.row(*child).iter().map(|v| v + s));
        }
        block
    }
}

impl LayerKernel for GenericKernel {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn forward(&self, layer: &Layer, inputs: &LayerInputs<'_>, params: &[f64], out: &mut [f64]) -> Result<()> {
        let bsz = inputs.batch_size;
        let n = layer.num_nodes();
        match layer.kind {
            LayerKind::Input { family, .. } => {
                let width = layer.kind.param_width();
                for slot in 0..n {
                    let p = &params[slot * width..(slot + 1) * width];
                    for b in 0..bsz {
                        out[slot * bsz + b] = leaf_log_density(layer, &family, p, inputs.batch, slot, b)?;
                    }
                }
            }
            LayerKind::Product { arity } => {
                let block = Self::gather_children(layer, inputs, |_| 0.0);
                out.fill(0.0);
                for i in 0..n {
                    for j in 0..arity {
                        let row = &block[(i * arity + j) * bsz..(i * arity + j + 1) * bsz];
                        for (o, v) in out[i * bsz..(i + 1) * bsz].iter_mut().zip(row) {
                            *o += v;
                        }
                    }
                }
            }
            LayerKind::Sum { arity } => {
                let block = Self::gather_children(layer, inputs, |e| params[e].ln());

                // max over the arity axis
                let mut max = vec![f64::NEG_INFINITY; n * bsz];
                for i in 0..n {
                    for j in 0..arity {
                        let row = &block[(i * arity + j) * bsz..(i * arity + j + 1) * bsz];
                        for (m, v) in max[i * bsz..(i + 1) * bsz].iter_mut().zip(row) {
                            *m = m.max(*v);
                        }
                    }
                }

                // sum of exp(x - max)
                out.fill(0.0);
                for i in 0..n {
                    for j in 0..arity {
                        let row = &block[(i * arity + j) * bsz..(i * arity + j + 1) * bsz];
                        let span = i * bsz..(i + 1) * bsz;
                        for ((o, v), m) in out[span.clone()].iter_mut().zip(row).zip(&max[span]) {
                            if *m > f64::NEG_INFINITY {
                                *o += (v - m).exp();
                            }
                        }
                    }
                }

                for (o, m) in out.iter_mut().zip(&max) {
                    *o = if *m == f64::NEG_INFINITY {
                        f64::NEG_INFINITY
                    } else {
                        m + o.ln()
                    };
                }
            }
        }
        Ok(())
    }

    fn backward(&self, layer: &Layer, inputs: &LayerInputs<'_>, step: BackwardStep<'_>) -> Result<()> {
        let bsz = inputs.batch_size;
        let n = layer.num_nodes();
        match layer.kind {
            LayerKind::Input { family, .. } => {
                let width = layer.kind.stats_width();
                for slot in 0..n {
                    let stats = &mut step.stats[slot * width..(slot + 1) * width];
                    for b in 0..bsz {
                        let flow = step.flows[slot * bsz + b];
                        if flow != 0.0 {
                            leaf_accumulate(layer, &family, inputs.batch, slot, b, flow, stats);
                        }
                    }
                }
            }
            LayerKind::Product { arity } => {
                for i in 0..n {
                    let flow = &step.flows[i * bsz..(i + 1) * bsz];
                    for j in 0..arity {
                        let e = i * arity + j;
                        step.edge_flows[e * bsz..(e + 1) * bsz].copy_from_slice(flow);
                    }
                }
            }
            LayerKind::Sum { arity } => {
                for i in 0..n {
                    let flow = &step.flows[i * bsz..(i + 1) * bsz];
                    let value = &step.values[i * bsz..(i + 1) * bsz];
                    for j in 0..arity {
                        let e = i * arity + j;
                        let w = step.params[e];
                        let child = inputs.row(layer.children[e]);
                        let mut total = 0.0;
                        for b in 0..bsz {
                            let ef = sum_edge_flow(flow[b], w, child[b], value[b]);
                            step.edge_flows[e * bsz + b] = ef;
                            total += ef;
                        }
                        step.stats[e] += total;
                    }
                }
            }
        }
        Ok(())
    }

    fn gather(&self, layer: &Layer, edges: &EdgeFlows<'_>, out: &mut [f64]) {
        let bsz = edges.batch_size;
        out.fill(0.0);
        for slot in 0..layer.num_nodes() {
            let dst = &mut out[slot * bsz..(slot + 1) * bsz];
            for pe in layer.parents_of(slot) {
                for (o, f) in dst.iter_mut().zip(edges.edge(*pe)) {
                    *o += f;
                }
            }
        }
    }
}
