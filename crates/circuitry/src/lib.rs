//! # circuitry
//!
//! Tractable probabilistic circuits compiled into layers and evaluated in
//! batches.
//!
//! This is the top-level crate: it re-exports the circuit model from
//! `circuitry-core` and adds everything that executes a circuit.
//!
//! ## Usage
//!
//! ```rust
//! use circuitry::prelude::*;
//!
//! # fn main() -> circuitry::Result<()> {
//! let mut b = CircuitBuilder::new();
//! let x = b.gaussian(0, 0.0, 1.0);
//! let y = b.gaussian(0, 3.0, 1.0);
//! let root = b.sum(&[x, y], &[0.3, 0.7]);
//! let circuit = b.build(root)?;
//!
//! let ctx = ExecContext::cpu();
//! let mut plan = circuitry::compile(&circuit, &ctx)?;
//! let batch = DataBatch::from_dense(1, vec![0.5, 2.5, 3.0])?;
//!
//! let out = circuitry::backward(&plan, &batch, &ctx, FlowOptions::default())?;
//! circuitry::update(&mut plan, &out.statistics, &UpdateConfig::em())?.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `circuitry-core` | Circuit arena, scopes, leaf families, validation, structure description, data batches, errors |
//! | `circuitry` | Layer compiler, kernels, buffer pool, forward/backward engine, sampling, parameter updates, checkpoints |
//!
//! ## Modules
//!
//! - [`compile`] — Circuit → layered [`CompiledPlan`]
//! - [`dispatch`] — per-layer kernels (generic and rayon-parallel) and their selection
//! - [`engine`] — forward, backward (flows) and sampling
//! - [`params`] — parameter store, statistics, EM and gradient updates
//! - [`memory`] — buffer pool and buffer lifetime plan
//! - [`context`] — the execution context passed to every call
//! - [`checkpoint`] — save/load compiled circuits

/// Re-export the circuit model.
pub use circuitry_core::{
    bail, validate, Circuit, CircuitBuilder, CircuitDescription, DType, DataBatch, Error, Family,
    Node, NodeDescription, NodeId, NodeKind, Result, Scope, Stage, StructureInfo,
    StructureViolation, UNOBSERVED,
};

/// Layer compiler.
pub mod compile;

/// Kernel dispatch.
pub mod dispatch;

/// Forward/backward engine and sampling.
pub mod engine;

/// Parameter store and updater.
pub mod params;

/// Buffer pool and lifetime planning.
pub mod memory;

/// Execution context.
pub mod context;

/// Checkpoint — save and load compiled circuits.
pub mod checkpoint;

mod plan;

pub use compile::{compile, CompileStats};
pub use context::{Device, DeviceCaps, ExecContext};
pub use engine::{backward, forward, sample, sample_conditional, BackwardOutput, FlowOptions, NodeFlows};
pub use params::{Statistics, UpdateConfig, UpdateMode, UpdateReport};
pub use plan::CompiledPlan;

/// Apply accumulated statistics to the plan's parameters in place.
///
/// Layers whose update fails keep their parameters and are listed in the
/// report; the rest are updated.
pub fn update(plan: &mut CompiledPlan, statistics: &Statistics, cfg: &UpdateConfig) -> Result<UpdateReport> {
    plan.update(statistics, cfg)
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::checkpoint::{load, save};
    pub use crate::compile::{ChildRef, Layer, LayerKind};
    pub use crate::context::{Device, ExecContext};
    pub use crate::dispatch::{GenericKernel, KernelRegistry, LayerKernel, ParallelKernel};
    pub use crate::engine::{BackwardOutput, FlowOptions, NodeFlows};
    pub use crate::memory::{BufferPool, PoolStats};
    pub use crate::params::{Statistics, UpdateConfig, UpdateMode, UpdateReport};
    pub use crate::{CompileStats, CompiledPlan};
    pub use circuitry_core::{
        Circuit, CircuitBuilder, CircuitDescription, DType, DataBatch, Error, Family, NodeId,
        Result, Scope,
    };
}
