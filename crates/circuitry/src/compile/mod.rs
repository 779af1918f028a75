// Compilation — Circuit → CompiledPlan
//
// Steps:
//   1. validate the circuit (memoised on the circuit)
//   2. build layers: depth levels, shape buckets, index tables
//   3. seed the parameter store from the circuit (domain-checked per layer)
//   4. plan kernel dispatch and buffer lifetimes
//
// Compilation is deterministic: the same circuit always yields the same
// layers, slots and parameter layout.

mod compiler;
pub mod layer;

use std::fmt;
use std::time::Instant;

use log::info;

use circuitry_core::{Circuit, Result};

use crate::context::ExecContext;
use crate::memory::MemoryPlan;
use crate::params::ParameterStore;
use crate::plan::CompiledPlan;

pub use layer::{ChildRef, Layer, LayerKind, ParentEdge};

/// Statistics from the compilation process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub num_nodes: usize,
    pub num_edges: usize,
    pub num_layers: usize,
    pub num_input_layers: usize,
    pub num_product_layers: usize,
    pub num_sum_layers: usize,
    /// Depth of the root layer.
    pub depth: usize,
    /// Node count of the widest layer.
    pub max_layer_width: usize,
    pub num_params: usize,
    /// Layers with a fused kernel eligible on the compile-time device.
    pub num_fused_eligible: usize,
    /// Peak live value cells per example in a non-retaining forward.
    pub peak_forward_cells: usize,
    /// Compilation time in microseconds.
    pub compile_time_us: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompiledPlan: {} nodes / {} edges in {} layers ({} input, {} product, {} sum), depth {}, widest {}, {} params, {} fused-eligible, peak {} cells/example, compiled in {}μs",
            self.num_nodes,
            self.num_edges,
            self.num_layers,
            self.num_input_layers,
            self.num_product_layers,
            self.num_sum_layers,
            self.depth,
            self.max_layer_width,
            self.num_params,
            self.num_fused_eligible,
            self.peak_forward_cells,
            self.compile_time_us,
        )
    }
}

/// Validate and compile `circuit` into an executable plan.
pub fn compile(circuit: &Circuit, ctx: &ExecContext) -> Result<CompiledPlan> {
    let start = Instant::now();

    // 1. Validate
    let info = circuit.validate()?;

    // 2. Layers
    let graph = compiler::build_layers(circuit, &info)?;
    let layers = graph.layers;

    // 3. Parameters
    let params = ParameterStore::from_circuit(circuit, &layers)?;

    // 4. Dispatch and memory
    let dispatch = ctx
        .kernels()
        .plan(&layers, ctx.capabilities(), ctx.fused_threshold());
    let memory = MemoryPlan::build(&layers);

    let count = |pred: fn(&LayerKind) -> bool| layers.iter().filter(|l| pred(&l.kind)).count();
    let stats = CompileStats {
        num_nodes: circuit.num_nodes(),
        num_edges: circuit.num_edges(),
        num_layers: layers.len(),
        num_input_layers: count(|k| matches!(k, LayerKind::Input { .. })),
        num_product_layers: count(|k| matches!(k, LayerKind::Product { .. })),
        num_sum_layers: count(|k| matches!(k, LayerKind::Sum { .. })),
        depth: layers.last().map(|l| l.depth).unwrap_or(0),
        max_layer_width: layers.iter().map(Layer::num_nodes).max().unwrap_or(0),
        num_params: params.num_params(),
        num_fused_eligible: dispatch.iter().filter(|d| d.fused.is_some()).count(),
        peak_forward_cells: memory.peak_forward_cells,
        compile_time_us: start.elapsed().as_micros() as u64,
    };
    info!("{stats}");

    Ok(CompiledPlan::new(
        circuit.clone(),
        layers,
        graph.slots,
        params,
        dispatch,
        memory,
        stats,
    ))
}
