// Backward pass — flows from the root down to the leaves
//
// Flow of a node = expected share of each example routed through it; the root
// carries flow 1. Per layer, from the root layer downwards:
//
//   1. gather:   node flow = Σ flows on incoming edges (root: 1)
//   2. release edge-flow buffers whose last reader just gathered
//   3. backward: sum edges carry flow · w · exp(child − parent), product edges
//                pass the flow through, input layers accumulate sufficient
//                statistics; sum layers also total their edge flows
//   4. release this layer's forward values
//
// Edge flows are written by exactly one parent row and read by gathers only,
// so shared children (DAGs) need no atomics.

use std::collections::HashMap;

use log::trace;

use circuitry_core::{DataBatch, Error, NodeId, Result, Stage};

use super::forward::{find_invalid, numerical, run_forward};
use crate::context::ExecContext;
use crate::dispatch::{BackwardStep, EdgeFlows, LayerInputs};
use crate::memory::LayerBuffers;
use crate::params::Statistics;
use crate::plan::CompiledPlan;

/// What `backward` collects besides parameter statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowOptions {
    /// Keep per-node flows for every example.
    pub node_flows: bool,
}

impl FlowOptions {
    pub fn with_node_flows() -> Self {
        Self { node_flows: true }
    }
}

/// Per-node, per-example flows.
#[derive(Debug, Clone, Default)]
pub struct NodeFlows {
    flows: HashMap<NodeId, Vec<f64>>,
}

impl NodeFlows {
    /// Flow of `node` on each example of the batch.
    pub fn node(&self, node: NodeId) -> Option<&[f64]> {
        self.flows.get(&node).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[derive(Debug)]
pub struct BackwardOutput {
    pub log_likelihoods: Vec<f64>,
    pub statistics: Statistics,
    pub node_flows: Option<NodeFlows>,
}

/// Forward then backward over `batch`.
///
/// Returns the per-example log-likelihoods, the flow-weighted parameter
/// statistics (ready for [`crate::update`]) and, on request, every node's flow.
pub fn backward(
    plan: &CompiledPlan,
    batch: &DataBatch,
    ctx: &ExecContext,
    opts: FlowOptions,
) -> Result<BackwardOutput> {
    ctx.install(|| run_backward(plan, batch, ctx, opts))
}

fn run_backward(
    plan: &CompiledPlan,
    batch: &DataBatch,
    ctx: &ExecContext,
    opts: FlowOptions,
) -> Result<BackwardOutput> {
    let pool = ctx.pool_handle();
    let fwd = run_forward(plan, batch, ctx, pool.clone(), true)?;
    let mut values = fwd.values;
    let log_likelihoods = fwd.log_likelihoods;

    let mut statistics = Statistics::for_layers(plan.layers());
    statistics.record_batch(&log_likelihoods);

    let bsz = batch.num_examples();
    if bsz == 0 {
        return Ok(BackwardOutput {
            log_likelihoods,
            statistics,
            node_flows: opts.node_flows.then(NodeFlows::default),
        });
    }

    let caps = ctx.capabilities();
    let memory = plan.memory_plan();
    let root = plan.root_layer().index;
    let mut edges = LayerBuffers::new(pool, plan.num_layers());
    let mut kept = NodeFlows::default();

    for layer in plan.layers().iter().rev() {
        let l = layer.index;
        let kernel = ctx.kernels().select(layer, bsz, caps, ctx.fused_threshold());

        // 1. Gather node flows
        let mut flow = edges.alloc(layer.num_nodes() * bsz);
        if l == root {
            flow.fill(1.0);
        } else {
            let incoming = EdgeFlows::for_layer(layer, bsz, edges.slots())?;
            kernel.gather(layer, &incoming, &mut flow);
        }
        if let Some((slot, b, v)) = find_invalid(&flow, bsz) {
            edges.recycle(flow);
            return Err(numerical(Stage::Backward, layer, slot, b, v));
        }

        // 2. Release consumed edge flows
        for &dead in &memory.edge_free_after[l] {
            edges.release(dead);
        }

        // 3. Edge flows and statistics
        let mut edge_flows = if layer.is_input() {
            Vec::new()
        } else {
            edges.alloc(layer.num_edges() * bsz)
        };
        {
            let inputs = LayerInputs::for_layer(layer, batch, values.slots())?;
            let own = values
                .get(l)
                .ok_or_else(|| Error::Compilation(format!("layer {l} has no retained values")))?;
            kernel.backward(
                layer,
                &inputs,
                BackwardStep {
                    values: own,
                    flows: &flow,
                    params: plan.params().layer(l),
                    edge_flows: &mut edge_flows,
                    stats: statistics.layer_mut(l),
                },
            )?;
        }
        if !layer.is_input() {
            edges.put(l, edge_flows);
        }
        trace!("backward {} via {}", layer, kernel.name());

        if opts.node_flows {
            for (slot, &id) in layer.nodes.iter().enumerate() {
                kept.flows.insert(id, flow[slot * bsz..(slot + 1) * bsz].to_vec());
            }
        }
        edges.recycle(flow);

        // 4. This layer's values are no longer read
        values.release(l);
    }

    Ok(BackwardOutput {
        log_likelihoods,
        statistics,
        node_flows: opts.node_flows.then_some(kept),
    })
}
