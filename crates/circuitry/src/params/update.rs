// Parameter updates — EM and gradient ascent from accumulated statistics
//
// EM (sum node i, edge flows F_ij, arity k, pseudocount c, step size s):
//
//   w'_ij = (F_ij + c / k) / (Σ_j F_ij + c)
//   w_ij  ← (1 − s) · w_ij + s · w'_ij
//
// Leaves use their family's closed-form estimate, interpolated the same way.
// s = 1 is full-batch EM; s < 1 is the stochastic mini-batch variant.
//
// Gradient mode ascends the summed log-likelihood in an unconstrained
// parameterisation (log-weights under softmax, logits, mean / log-variance):
//
//   ∂ℓ/∂θ_ij = F_ij − w_ij · Σ_j F_ij
//
// Every layer is updated all-or-nothing. A layer whose statistics are not
// finite, or whose candidate parameters leave the domain, keeps its old
// tensor; the failure is reported and the other layers still update.

use log::{debug, warn};

use circuitry_core::{bail, Error, LeafUpdate, Result};

use super::{check_layer, ParameterStore, Statistics};
use crate::compile::{Layer, LayerKind};

/// Sum-node edge mass below which a node keeps its weights on EM.
const MIN_EDGE_MASS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateMode {
    Em { step_size: f64, pseudocount: f64 },
    Gradient { learning_rate: f64 },
}

/// How `update` turns statistics into new parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateConfig {
    pub mode: UpdateMode,
    /// Floor for re-estimated Gaussian variances.
    pub min_variance: f64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self::em()
    }
}

impl UpdateConfig {
    /// Full-step EM without smoothing.
    pub fn em() -> Self {
        Self {
            mode: UpdateMode::Em {
                step_size: 1.0,
                pseudocount: 0.0,
            },
            min_variance: LeafUpdate::default().min_variance,
        }
    }

    pub fn gradient(learning_rate: f64) -> Self {
        Self {
            mode: UpdateMode::Gradient { learning_rate },
            ..Self::em()
        }
    }

    /// Set the EM step size. No effect in gradient mode.
    pub fn with_step_size(mut self, s: f64) -> Self {
        if let UpdateMode::Em { step_size, .. } = &mut self.mode {
            *step_size = s;
        }
        self
    }

    /// Set the EM pseudocount. No effect in gradient mode.
    pub fn with_pseudocount(mut self, c: f64) -> Self {
        if let UpdateMode::Em { pseudocount, .. } = &mut self.mode {
            *pseudocount = c;
        }
        self
    }

    pub fn with_min_variance(mut self, v: f64) -> Self {
        self.min_variance = v;
        self
    }

    fn check(&self) -> Result<()> {
        match self.mode {
            UpdateMode::Em {
                step_size,
                pseudocount,
            } => {
                if !(step_size > 0.0 && step_size <= 1.0) {
                    bail!("EM step size must lie in (0, 1], got {step_size}");
                }
                if !(pseudocount >= 0.0 && pseudocount.is_finite()) {
                    bail!("pseudocount must be finite and non-negative, got {pseudocount}");
                }
            }
            UpdateMode::Gradient { learning_rate } => {
                if !(learning_rate > 0.0 && learning_rate.is_finite()) {
                    bail!("learning rate must be finite and positive, got {learning_rate}");
                }
            }
        }
        if !(self.min_variance > 0.0) {
            bail!("minimum variance must be positive, got {}", self.min_variance);
        }
        Ok(())
    }
}

/// Outcome of one update call.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Layers whose parameters changed.
    pub updated: Vec<usize>,
    /// Layers left untouched, with the reason.
    pub failed: Vec<Error>,
}

impl UpdateReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_layers(&self) -> Vec<usize> {
        self.failed
            .iter()
            .filter_map(|e| match e {
                Error::Parameter { layer, .. } => Some(*layer),
                _ => None,
            })
            .collect()
    }

    /// The first failure, if any.
    pub fn into_result(self) -> Result<()> {
        match self.failed.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn check_shapes(store: &ParameterStore, layers: &[Layer], stats: &Statistics) -> Result<()> {
    if stats.num_layers() != layers.len() || store.num_layers() != layers.len() {
        return Err(Error::Data(format!(
            "statistics for {} layers applied to a plan with {}",
            stats.num_layers(),
            layers.len()
        )));
    }
    for layer in layers {
        let expected = layer.num_nodes() * layer.kind.stats_width();
        if stats.layer(layer.index).len() != expected {
            return Err(Error::Data(format!(
                "layer {}: {} statistics, expected {expected}",
                layer.index,
                stats.layer(layer.index).len()
            )));
        }
    }
    Ok(())
}

/// Apply one update to every parameterised layer.
///
/// Returns `Err` only when the configuration or the statistics' shape is
/// wrong. Per-layer failures are collected in the report.
pub fn update(
    store: &mut ParameterStore,
    layers: &[Layer],
    stats: &Statistics,
    cfg: &UpdateConfig,
) -> Result<UpdateReport> {
    cfg.check()?;
    check_shapes(store, layers, stats)?;

    let mut report = UpdateReport::default();
    for layer in layers.iter().filter(|l| l.kind.has_params()) {
        match candidate(store, layer, stats, cfg).and_then(|data| store.set_layer(layer, data)) {
            Ok(()) => report.updated.push(layer.index),
            Err(e) => {
                warn!("layer {} keeps its parameters: {e}", layer.index);
                report.failed.push(e);
            }
        }
    }
    debug!(
        "update: {} layers updated, {} failed",
        report.updated.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Proposed new tensor for one layer.
fn candidate(store: &ParameterStore, layer: &Layer, stats: &Statistics, cfg: &UpdateConfig) -> Result<Vec<f64>> {
    if !stats.is_finite(layer.index) {
        return Err(Error::parameter(layer.index, "statistics contain non-finite values"));
    }
    let old = store.layer(layer.index);
    let st = stats.layer(layer.index);
    let mut out = vec![0.0; old.len()];

    match cfg.mode {
        UpdateMode::Em {
            step_size,
            pseudocount,
        } => {
            em_layer(layer, old, st, pseudocount, cfg.min_variance, &mut out);
            if step_size < 1.0 {
                for (o, w) in out.iter_mut().zip(old) {
                    *o = (1.0 - step_size) * w + step_size * *o;
                }
            }
        }
        UpdateMode::Gradient { learning_rate } => {
            let mut grad = vec![0.0; old.len()];
            gradient_layer(layer, old, st, &mut grad);
            ascend_layer(layer, old, &grad, learning_rate, &mut out);
        }
    }
    check_layer(layer, &out)?;
    Ok(out)
}

fn em_layer(layer: &Layer, old: &[f64], stats: &[f64], pseudocount: f64, min_variance: f64, out: &mut [f64]) {
    match layer.kind {
        LayerKind::Sum { arity } => {
            let smooth = pseudocount / arity as f64;
            for ((o, w), f) in out
                .chunks_mut(arity)
                .zip(old.chunks(arity))
                .zip(stats.chunks(arity))
            {
                let total = f.iter().sum::<f64>() + pseudocount;
                if total <= MIN_EDGE_MASS {
                    o.copy_from_slice(w);
                    continue;
                }
                for (o, f) in o.iter_mut().zip(f) {
                    *o = (f + smooth) / total;
                }
            }
        }
        LayerKind::Input { family, scope_len } => {
            let (pw, sw) = (layer.kind.param_width(), layer.kind.stats_width());
            let leaf = LeafUpdate {
                pseudocount,
                min_variance,
            };
            for ((o, p), s) in out.chunks_mut(pw).zip(old.chunks(pw)).zip(stats.chunks(sw)) {
                family.em_update(p, s, scope_len, &leaf, o);
            }
        }
        LayerKind::Product { .. } => {}
    }
}

fn gradient_layer(layer: &Layer, params: &[f64], stats: &[f64], grad: &mut [f64]) {
    match layer.kind {
        LayerKind::Sum { arity } => {
            for ((g, w), f) in grad
                .chunks_mut(arity)
                .zip(params.chunks(arity))
                .zip(stats.chunks(arity))
            {
                let total: f64 = f.iter().sum();
                for ((g, w), f) in g.iter_mut().zip(w).zip(f) {
                    *g = f - w * total;
                }
            }
        }
        LayerKind::Input { family, scope_len } => {
            let (pw, sw) = (layer.kind.param_width(), layer.kind.stats_width());
            for ((g, p), s) in grad.chunks_mut(pw).zip(params.chunks(pw)).zip(stats.chunks(sw)) {
                family.gradient(p, s, scope_len, g);
            }
        }
        LayerKind::Product { .. } => {}
    }
}

fn ascend_layer(layer: &Layer, params: &[f64], grad: &[f64], lr: f64, out: &mut [f64]) {
    match layer.kind {
        LayerKind::Sum { arity } => {
            for ((o, w), g) in out
                .chunks_mut(arity)
                .zip(params.chunks(arity))
                .zip(grad.chunks(arity))
            {
                let logits: Vec<f64> = w.iter().zip(g).map(|(w, g)| w.ln() + lr * g).collect();
                circuitry_core::family::softmax_into(&logits, o);
            }
        }
        LayerKind::Input { family, scope_len } => {
            let pw = layer.kind.param_width();
            for ((o, p), g) in out.chunks_mut(pw).zip(params.chunks(pw)).zip(grad.chunks(pw)) {
                family.gradient_step(p, g, lr, scope_len, o);
            }
        }
        LayerKind::Product { .. } => {}
    }
}

/// Gradient of the summed log-likelihood with respect to every layer's
/// unconstrained parameters, laid out like the parameter tensors.
pub fn gradients(store: &ParameterStore, layers: &[Layer], stats: &Statistics) -> Result<Vec<Vec<f64>>> {
    check_shapes(store, layers, stats)?;
    Ok(layers
        .iter()
        .map(|layer| {
            let params = store.layer(layer.index);
            let mut grad = vec![0.0; params.len()];
            gradient_layer(layer, params, stats.layer(layer.index), &mut grad);
            grad
        })
        .collect())
}
