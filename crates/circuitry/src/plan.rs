// CompiledPlan — A compiled circuit: layers, parameters and execution metadata
//
// The plan owns everything the engine needs and nothing it computes per call:
// the ordered layers with their index tables, the node → (layer, slot) map,
// the parameter store, the dispatch entries and the buffer lifetime plan.
// It also keeps the source circuit so the current parameters can be written
// back into a circuit or persisted.

use rand::Rng;

use circuitry_core::{Circuit, DataBatch, Error, NodeId, Result};

use crate::compile::{ChildRef, CompileStats, Layer};
use crate::context::ExecContext;
use crate::dispatch::DispatchEntry;
use crate::engine::{self, BackwardOutput, FlowOptions};
use crate::memory::MemoryPlan;
use crate::params::{self, ParameterStore, Statistics, UpdateConfig, UpdateReport};

#[derive(Debug, Clone)]
pub struct CompiledPlan {
    circuit: Circuit,
    layers: Vec<Layer>,
    slots: Vec<ChildRef>,
    params: ParameterStore,
    dispatch: Vec<DispatchEntry>,
    memory: MemoryPlan,
    stats: CompileStats,
}

impl CompiledPlan {
    pub(crate) fn new(
        circuit: Circuit,
        layers: Vec<Layer>,
        slots: Vec<ChildRef>,
        params: ParameterStore,
        dispatch: Vec<DispatchEntry>,
        memory: MemoryPlan,
        stats: CompileStats,
    ) -> Self {
        Self {
            circuit,
            layers,
            slots,
            params,
            dispatch,
            memory,
            stats,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The layer holding only the root node; always the last one.
    pub fn root_layer(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    pub fn root(&self) -> NodeId {
        self.circuit.root()
    }

    pub fn num_vars(&self) -> usize {
        self.circuit.num_vars()
    }

    pub fn num_nodes(&self) -> usize {
        self.circuit.num_nodes()
    }

    /// Layer and slot of `node`.
    pub fn locate(&self, node: NodeId) -> Option<ChildRef> {
        self.slots.get(node.0).copied()
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    /// Parameters of one node (empty for products).
    pub fn node_params(&self, node: NodeId) -> Option<&[f64]> {
        let r = self.locate(node)?;
        Some(self.params.node(r.layer, r.slot))
    }

    /// Replace one layer's parameter tensor. The tensor is domain-checked.
    pub fn set_layer_params(&mut self, layer: usize, data: Vec<f64>) -> Result<()> {
        let layer = self
            .layers
            .get(layer)
            .ok_or_else(|| Error::parameter(layer, "no such layer"))?;
        self.params.set_layer(layer, data)
    }

    pub fn dispatch(&self) -> &[DispatchEntry] {
        &self.dispatch
    }

    pub fn memory_plan(&self) -> &MemoryPlan {
        &self.memory
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// The circuit this plan was compiled from, with its original parameters.
    pub fn source(&self) -> &Circuit {
        &self.circuit
    }

    /// A copy of the source circuit carrying the current parameters.
    pub fn to_circuit(&self) -> Result<Circuit> {
        let mut circuit = self.circuit.clone();
        self.params.write_to(&mut circuit, &self.layers)?;
        Ok(circuit)
    }

    /// Make the stored source circuit carry the current parameters.
    pub(crate) fn refresh_source(&mut self) -> Result<()> {
        self.params.write_to(&mut self.circuit, &self.layers)
    }

    /// Write the current parameters into `circuit`, which must have the
    /// structure this plan was compiled from.
    pub fn sync_circuit(&self, circuit: &mut Circuit) -> Result<()> {
        if circuit.num_nodes() != self.circuit.num_nodes() || circuit.root() != self.circuit.root() {
            return Err(Error::msg(format!(
                "circuit with {} nodes (root {}) does not match plan with {} nodes (root {})",
                circuit.num_nodes(),
                circuit.root(),
                self.circuit.num_nodes(),
                self.circuit.root()
            )));
        }
        self.params.write_to(circuit, &self.layers)
    }

    /// Reject batches that do not cover the plan's variables.
    pub fn check_batch(&self, batch: &DataBatch) -> Result<()> {
        if batch.num_vars() < self.num_vars() {
            return Err(Error::Data(format!(
                "batch has {} variables, circuit needs {}",
                batch.num_vars(),
                self.num_vars()
            )));
        }
        Ok(())
    }

    // Engine shortcuts

    /// Per-example log-likelihood. See [`engine::forward`].
    pub fn forward(&self, batch: &DataBatch, ctx: &ExecContext) -> Result<Vec<f64>> {
        engine::forward(self, batch, ctx)
    }

    /// See [`engine::backward`].
    pub fn backward(&self, batch: &DataBatch, ctx: &ExecContext, opts: FlowOptions) -> Result<BackwardOutput> {
        engine::backward(self, batch, ctx, opts)
    }

    /// Apply statistics to the parameter store. See [`params::update`].
    pub fn update(&mut self, stats: &Statistics, cfg: &UpdateConfig) -> Result<UpdateReport> {
        params::update(&mut self.params, &self.layers, stats, cfg)
    }

    /// See [`params::gradients`].
    pub fn gradients(&self, stats: &Statistics) -> Result<Vec<Vec<f64>>> {
        params::gradients(&self.params, &self.layers, stats)
    }

    /// See [`engine::sample`].
    pub fn sample<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Result<DataBatch> {
        engine::sample(self, num_samples, rng)
    }

    /// See [`engine::sample_conditional`].
    pub fn sample_conditional<R: Rng + ?Sized>(
        &self,
        evidence: &DataBatch,
        ctx: &ExecContext,
        rng: &mut R,
    ) -> Result<DataBatch> {
        engine::sample_conditional(self, evidence, ctx, rng)
    }
}
