// Parallel fused kernel — one pass per node row, rows spread over rayon
//
// Sums use an online log-sum-exp: a single sweep over the children keeps a
// running max and a rescaled running sum, so no `[nodes × arity × batch]`
// block is ever materialised. Products accumulate in place. Every node owns
// its output row (and, in backward, its edge-flow rows and statistics), so
// rows are split with `par_chunks_mut` and never shared between threads.

use rayon::prelude::*;

use circuitry_core::Result;

use super::{leaf_accumulate, leaf_log_density, sum_edge_flow, BackwardStep, EdgeFlows, LayerInputs, LayerKernel};
use crate::compile::{Layer, LayerKind};
use crate::context::DeviceCaps;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelKernel;

/// Online log-sum-exp accumulator.
#[derive(Clone, Copy)]
struct LogSumExp {
    max: f64,
    sum: f64,
}

impl LogSumExp {
    const EMPTY: Self = Self {
        max: f64::NEG_INFINITY,
        sum: 0.0,
    };

    #[inline]
    fn push(&mut self, x: f64) {
        if x == f64::NEG_INFINITY {
            return;
        }
        if x > self.max {
            self.sum = self.sum * (self.max - x).exp() + 1.0;
            self.max = x;
        } else {
            self.sum += (x - self.max).exp();
        }
    }

    #[inline]
    fn finish(self) -> f64 {
        if self.max == f64::NEG_INFINITY {
            f64::NEG_INFINITY
        } else {
            self.max + self.sum.ln()
        }
    }
}

impl LayerKernel for ParallelKernel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn supports(&self, kind: &LayerKind, caps: &DeviceCaps) -> bool {
        if !caps.parallel {
            return false;
        }
        match kind {
            LayerKind::Input { .. } => true,
            LayerKind::Product { arity } | LayerKind::Sum { arity } => *arity <= caps.max_fused_arity,
        }
    }

    fn forward(&self, layer: &Layer, inputs: &LayerInputs<'_>, params: &[f64], out: &mut [f64]) -> Result<()> {
        let bsz = inputs.batch_size;
        if bsz == 0 {
            return Ok(());
        }
        match layer.kind {
            LayerKind::Input { family, .. } => {
                let width = layer.kind.param_width();
                out.par_chunks_mut(bsz)
                    .enumerate()
                    .try_for_each(|(slot, row)| -> Result<()> {
                        let p = &params[slot * width..(slot + 1) * width];
                        for (b, o) in row.iter_mut().enumerate() {
                            *o = leaf_log_density(layer, &family, p, inputs.batch, slot, b)?;
                        }
                        Ok(())
                    })?;
            }
            LayerKind::Product { .. } => {
                out.par_chunks_mut(bsz).enumerate().for_each(|(slot, row)| {
                    row.fill(0.0);
                    for child in layer.children_of(slot) {
                        for (o, v) in row.iter_mut().zip(inputs.row(*child)) {
                            *o += v;
                        }
                    }
                });
            }
            LayerKind::Sum { arity } => {
                out.par_chunks_mut(bsz).enumerate().for_each(|(slot, row)| {
                    let children = layer.children_of(slot);
                    let log_w: Vec<f64> = params[slot * arity..(slot + 1) * arity]
                        .iter()
                        .map(|w| w.ln())
                        .collect();
                    for (b, o) in row.iter_mut().enumerate() {
                        let mut acc = LogSumExp::EMPTY;
                        for (child, lw) in children.iter().zip(&log_w) {
                            acc.push(inputs.row(*child)[b] + lw);
                        }
                        *o = acc.finish();
                    }
                });
            }
        }
        Ok(())
    }

    fn backward(&self, layer: &Layer, inputs: &LayerInputs<'_>, step: BackwardStep<'_>) -> Result<()> {
        let bsz = inputs.batch_size;
        if bsz == 0 {
            return Ok(());
        }
        let BackwardStep {
            values,
            flows,
            params,
            edge_flows,
            stats,
        } = step;
        match layer.kind {
            LayerKind::Input { family, .. } => {
                let width = layer.kind.stats_width();
                stats.par_chunks_mut(width).enumerate().for_each(|(slot, st)| {
                    for (b, &flow) in flows[slot * bsz..(slot + 1) * bsz].iter().enumerate() {
                        if flow != 0.0 {
                            leaf_accumulate(layer, &family, inputs.batch, slot, b, flow, st);
                        }
                    }
                });
            }
            LayerKind::Product { arity } => {
                edge_flows
                    .par_chunks_mut(arity * bsz)
                    .enumerate()
                    .for_each(|(slot, ef)| {
                        let flow = &flows[slot * bsz..(slot + 1) * bsz];
                        for chunk in ef.chunks_mut(bsz) {
                            chunk.copy_from_slice(flow);
                        }
                    });
            }
            LayerKind::Sum { arity } => {
                edge_flows
                    .par_chunks_mut(arity * bsz)
                    .zip(stats.par_chunks_mut(arity))
                    .enumerate()
                    .for_each(|(slot, (ef, st))| {
                        let flow = &flows[slot * bsz..(slot + 1) * bsz];
                        let value = &values[slot * bsz..(slot + 1) * bsz];
                        for (j, child) in layer.children_of(slot).iter().enumerate() {
                            let w = params[slot * arity + j];
                            let child = inputs.row(*child);
                            let mut total = 0.0;
                            for (b, cell) in ef[j * bsz..(j + 1) * bsz].iter_mut().enumerate() {
                                *cell = sum_edge_flow(flow[b], w, child[b], value[b]);
                                total += *cell;
                            }
                            st[j] += total;
                        }
                    });
            }
        }
        Ok(())
    }

    fn gather(&self, layer: &Layer, edges: &EdgeFlows<'_>, out: &mut [f64]) {
        let bsz = edges.batch_size;
        if bsz == 0 {
            return;
        }
        out.par_chunks_mut(bsz).enumerate().for_each(|(slot, row)| {
            row.fill(0.0);
            for pe in layer.parents_of(slot) {
                for (o, f) in row.iter_mut().zip(edges.edge(*pe)) {
                    *o += f;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_logsumexp() {
        let xs = [-1.0, 2.0, 0.5, f64::NEG_INFINITY, -30.0];
        let mut acc = LogSumExp::EMPTY;
        for x in xs {
            acc.push(x);
        }
        let direct = xs.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert!((acc.finish() - direct).abs() < 1e-12);

        let mut empty = LogSumExp::EMPTY;
        empty.push(f64::NEG_INFINITY);
        assert_eq!(empty.finish(), f64::NEG_INFINITY);
    }
}
