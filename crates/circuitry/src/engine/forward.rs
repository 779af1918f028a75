// Forward pass — layers in order, leaves to root
//
// For each layer: pick a kernel, borrow the producer buffers, evaluate into a
// pooled buffer, then release every value buffer whose last consumer just ran
// (unless the pass retains values for backward or conditional sampling).
// The root layer holds one node; its row is the per-example log-likelihood.

use std::sync::Arc;

use log::trace;

use circuitry_core::{DataBatch, Error, NodeId, Result, Stage};

use crate::compile::Layer;
use crate::context::ExecContext;
use crate::dispatch::LayerInputs;
use crate::memory::{BufferPool, LayerBuffers};
use crate::plan::CompiledPlan;

/// Values produced by one forward pass.
pub(crate) struct ForwardPass {
    pub values: LayerBuffers,
    pub log_likelihoods: Vec<f64>,
}

/// First NaN or +inf in a `[num_nodes × batch]` buffer.
pub(crate) fn find_invalid(buf: &[f64], batch_size: usize) -> Option<(usize, usize, f64)> {
    buf.iter()
        .position(|v| v.is_nan() || *v == f64::INFINITY)
        .map(|i| (i / batch_size, i % batch_size, buf[i]))
}

pub(crate) fn numerical(stage: Stage, layer: &Layer, slot: usize, example: usize, value: f64) -> Error {
    Error::Numerical {
        stage,
        layer: layer.index,
        node: layer.nodes.get(slot).copied().unwrap_or(NodeId(usize::MAX)),
        example,
        value,
    }
}

pub(crate) fn run_forward(
    plan: &CompiledPlan,
    batch: &DataBatch,
    ctx: &ExecContext,
    pool: Arc<BufferPool>,
    retain: bool,
) -> Result<ForwardPass> {
    plan.check_batch(batch)?;
    let bsz = batch.num_examples();
    let mut values = LayerBuffers::new(pool, plan.num_layers());
    if bsz == 0 {
        return Ok(ForwardPass {
            values,
            log_likelihoods: Vec::new(),
        });
    }

    let caps = ctx.capabilities();
    let memory = plan.memory_plan();
    for layer in plan.layers() {
        let kernel = ctx
            .kernels()
            .select(layer, bsz, caps, ctx.fused_threshold());
        let mut out = values.alloc(layer.num_nodes() * bsz);
        {
            let inputs = LayerInputs::for_layer(layer, batch, values.slots())?;
            kernel.forward(layer, &inputs, plan.params().layer(layer.index), &mut out)?;
        }
        if layer.is_input() {
            if let Some((slot, b, v)) = find_invalid(&out, bsz) {
                values.recycle(out);
                return Err(numerical(Stage::Forward, layer, slot, b, v));
            }
        }
        trace!("forward {} via {}", layer, kernel.name());
        values.put(layer.index, out);

        if !retain {
            for &dead in &memory.forward_free_after[layer.index] {
                values.release(dead);
            }
        }
    }

    let root = plan.root_layer();
    let log_likelihoods = values
        .get(root.index)
        .map(|row| row[..bsz].to_vec())
        .ok_or_else(|| Error::Compilation("root layer produced no values".into()))?;
    if let Some((_, b, v)) = find_invalid(&log_likelihoods, bsz) {
        return Err(numerical(Stage::Forward, root, 0, b, v));
    }
    Ok(ForwardPass {
        values,
        log_likelihoods,
    })
}

/// Per-example log-likelihood of `batch` under `plan`.
///
/// Unobserved cells are integrated out, so a partially observed row yields
/// its marginal log-likelihood. A zero-probability example yields `-inf`.
pub fn forward(plan: &CompiledPlan, batch: &DataBatch, ctx: &ExecContext) -> Result<Vec<f64>> {
    let pool = ctx.pool_handle();
    ctx.install(|| run_forward(plan, batch, ctx, pool, false)).map(|pass| pass.log_likelihoods)
}
