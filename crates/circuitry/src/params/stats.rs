// Statistics — flow-weighted parameter statistics from backward passes
//
// Per layer, node-major `[num_nodes × stats_width]`:
//
//   sum layer   — total flow along each edge
//   input layer — the family's sufficient statistics
//
// Statistics from several mini-batches merge by addition, so an update can
// consume one batch or an entire epoch.

use circuitry_core::{Error, Result};

use crate::compile::Layer;

#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    layers: Vec<Vec<f64>>,
    num_examples: usize,
    log_likelihood: f64,
}

impl Statistics {
    /// Zeroed statistics shaped for `layers`.
    pub fn for_layers(layers: &[Layer]) -> Self {
        Self {
            layers: layers
                .iter()
                .map(|l| vec![0.0; l.num_nodes() * l.kind.stats_width()])
                .collect(),
            num_examples: 0,
            log_likelihood: 0.0,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> &[f64] {
        &self.layers[layer]
    }

    pub fn layer_mut(&mut self, layer: usize) -> &mut [f64] {
        &mut self.layers[layer]
    }

    /// Number of examples accumulated so far.
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    /// Summed log-likelihood of the accumulated examples.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Mean log-likelihood per example (NaN when empty).
    pub fn mean_log_likelihood(&self) -> f64 {
        self.log_likelihood / self.num_examples as f64
    }

    pub(crate) fn record_batch(&mut self, log_likelihoods: &[f64]) {
        self.num_examples += log_likelihoods.len();
        self.log_likelihood += log_likelihoods.iter().sum::<f64>();
    }

    /// Add `other` into `self`. Both must come from the same plan.
    pub fn merge(&mut self, other: &Statistics) -> Result<()> {
        let same_shape = self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.len() == b.len());
        if !same_shape {
            return Err(Error::Data(
                "cannot merge statistics from different plans".into(),
            ));
        }
        for (a, b) in self.layers.iter_mut().zip(&other.layers) {
            for (x, y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        self.num_examples += other.num_examples;
        self.log_likelihood += other.log_likelihood;
        Ok(())
    }

    /// Whether every statistic of `layer` is finite.
    pub fn is_finite(&self, layer: usize) -> bool {
        self.layers[layer].iter().all(|v| v.is_finite())
    }

    /// Reset to zero, keeping the shapes.
    pub fn clear(&mut self) {
        self.layers.iter_mut().for_each(|l| l.fill(0.0));
        self.num_examples = 0;
        self.log_likelihood = 0.0;
    }
}
