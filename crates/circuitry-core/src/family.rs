// Family — Leaf distribution families
//
// Every input node carries a family tag and a flat parameter vector. A family
// factorises over the variables of its scope, so all per-value operations take
// a scope dimension `d` and a single observed value `x`:
//
//   Categorical { num_cats } — one variable, params = [p_0, ..., p_{K-1}]
//   Bernoulli                — one variable, params = [p]
//   Gaussian                 — k variables (diagonal), params = [mu_0, var_0, mu_1, var_1, ...]
//
// Sufficient statistics are flow-weighted sums collected during backward:
//
//   Categorical — [n_0, ..., n_{K-1}]          (flow mass per category)
//   Bernoulli   — [S0, S1]                     (flow, flow * x)
//   Gaussian    — [S0_d, S1_d, S2_d] per dim   (flow, flow * x, flow * x^2)
//
// Both the closed-form EM update and the gradient of the summed log-likelihood
// with respect to the unconstrained parameters (logits / logit / mean and
// log-variance) are functions of these statistics alone.

use rand::Rng;
use rand_distr::{Distribution, Exp1, Normal};
use serde::{Deserialize, Serialize};

/// Absolute tolerance used when checking that probability vectors sum to one.
pub const NORMALIZATION_TOL: f64 = 1e-6;

/// Statistic mass below which a leaf keeps its previous parameters on EM.
const MIN_STAT_MASS: f64 = 1e-12;

/// A leaf distribution family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Family {
    Categorical { num_cats: usize },
    Bernoulli,
    Gaussian,
}

/// Knobs for the closed-form leaf update.
#[derive(Debug, Clone, Copy)]
pub struct LeafUpdate {
    /// Laplace smoothing mass spread over the outcomes of discrete families.
    pub pseudocount: f64,
    /// Lower bound applied to re-estimated Gaussian variances.
    pub min_variance: f64,
}

impl Default for LeafUpdate {
    fn default() -> Self {
        Self {
            pseudocount: 0.0,
            min_variance: 1e-6,
        }
    }
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Family::Categorical { .. } => "categorical",
            Family::Bernoulli => "bernoulli",
            Family::Gaussian => "gaussian",
        }
    }

    /// Check that a scope of `scope_len` variables fits this family.
    pub fn check_scope(&self, scope_len: usize) -> Result<(), String> {
        if scope_len == 0 {
            return Err("input node has an empty scope".into());
        }
        match self {
            Family::Categorical { num_cats } => {
                if *num_cats < 1 {
                    return Err("categorical family needs at least one category".into());
                }
                if scope_len != 1 {
                    return Err(format!(
                        "categorical leaves are univariate, got scope of {scope_len} variables"
                    ));
                }
            }
            Family::Bernoulli => {
                if scope_len != 1 {
                    return Err(format!(
                        "bernoulli leaves are univariate, got scope of {scope_len} variables"
                    ));
                }
            }
            Family::Gaussian => {}
        }
        Ok(())
    }

    /// Number of parameters of a leaf with `scope_len` variables.
    pub fn num_params(&self, scope_len: usize) -> usize {
        match self {
            Family::Categorical { num_cats } => *num_cats,
            Family::Bernoulli => 1,
            Family::Gaussian => 2 * scope_len,
        }
    }

    /// Number of sufficient statistics of a leaf with `scope_len` variables.
    pub fn num_stats(&self, scope_len: usize) -> usize {
        match self {
            Family::Categorical { num_cats } => *num_cats,
            Family::Bernoulli => 2,
            Family::Gaussian => 3 * scope_len,
        }
    }

    /// Whether `x` lies in the support of this family.
    pub fn check_value(&self, x: f64) -> bool {
        match self {
            Family::Categorical { num_cats } => {
                x.fract() == 0.0 && x >= 0.0 && (x as usize) < *num_cats
            }
            Family::Bernoulli => x == 0.0 || x == 1.0,
            Family::Gaussian => x.is_finite(),
        }
    }

    /// Log-density contribution of an observed value `x` at scope dimension `d`.
    ///
    /// `x` must satisfy [`Family::check_value`].
    pub fn log_density_dim(&self, params: &[f64], d: usize, x: f64) -> f64 {
        match self {
            Family::Categorical { .. } => params[x as usize].ln(),
            Family::Bernoulli => {
                let p = params[0];
                if x == 1.0 {
                    p.ln()
                } else {
                    (1.0 - p).ln()
                }
            }
            Family::Gaussian => {
                let mu = params[2 * d];
                let var = params[2 * d + 1];
                let diff = x - mu;
                -0.5 * ((2.0 * std::f64::consts::PI * var).ln() + diff * diff / var)
            }
        }
    }

    /// Whether the observed value `x` has probability exactly zero under `params`.
    ///
    /// Only a zero-valued probability parameter makes a `-inf` log-density
    /// legitimate. Gaussians have full support and never qualify.
    pub fn is_zero_probability(&self, params: &[f64], x: f64) -> bool {
        match self {
            Family::Categorical { .. } => params[x as usize] == 0.0,
            Family::Bernoulli => {
                let p = params[0];
                (x == 1.0 && p == 0.0) || (x == 0.0 && p == 1.0)
            }
            Family::Gaussian => false,
        }
    }

    /// Add `flow` worth of the observed value `x` at dimension `d` to `stats`.
    pub fn accumulate_dim(&self, stats: &mut [f64], d: usize, x: f64, flow: f64) {
        match self {
            Family::Categorical { .. } => stats[x as usize] += flow,
            Family::Bernoulli => {
                stats[0] += flow;
                stats[1] += flow * x;
            }
            Family::Gaussian => {
                stats[3 * d] += flow;
                stats[3 * d + 1] += flow * x;
                stats[3 * d + 2] += flow * x * x;
            }
        }
    }

    /// Check that `params` lie in the family's domain.
    pub fn validate_params(&self, params: &[f64], scope_len: usize) -> Result<(), String> {
        let expected = self.num_params(scope_len);
        if params.len() != expected {
            return Err(format!(
                "{} leaf expects {expected} parameters, got {}",
                self.name(),
                params.len()
            ));
        }
        match self {
            Family::Categorical { .. } => {
                if let Some(p) = params.iter().find(|p| !p.is_finite() || **p < 0.0) {
                    return Err(format!("categorical probability {p} out of [0, 1]"));
                }
                let total: f64 = params.iter().sum();
                if (total - 1.0).abs() > NORMALIZATION_TOL {
                    return Err(format!("categorical probabilities sum to {total}, not 1"));
                }
            }
            Family::Bernoulli => {
                let p = params[0];
                if !(0.0..=1.0).contains(&p) {
                    return Err(format!("bernoulli probability {p} out of [0, 1]"));
                }
            }
            Family::Gaussian => {
                for d in 0..scope_len {
                    let (mu, var) = (params[2 * d], params[2 * d + 1]);
                    if !mu.is_finite() {
                        return Err(format!("gaussian mean {mu} is not finite"));
                    }
                    if !(var.is_finite() && var > 0.0) {
                        return Err(format!("gaussian variance {var} must be positive"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Closed-form maximum-likelihood re-estimate from sufficient statistics.
    ///
    /// Dimensions (or whole leaves) that received no statistic mass keep their
    /// previous parameters.
    pub fn em_update(
        &self,
        old: &[f64],
        stats: &[f64],
        scope_len: usize,
        cfg: &LeafUpdate,
        out: &mut [f64],
    ) {
        out.copy_from_slice(old);
        match self {
            Family::Categorical { num_cats } => {
                let total: f64 = stats.iter().sum::<f64>() + cfg.pseudocount;
                if total <= MIN_STAT_MASS {
                    return;
                }
                let smooth = cfg.pseudocount / *num_cats as f64;
                for (o, s) in out.iter_mut().zip(stats) {
                    *o = (s + smooth) / total;
                }
            }
            Family::Bernoulli => {
                let total = stats[0] + cfg.pseudocount;
                if total <= MIN_STAT_MASS {
                    return;
                }
                out[0] = (stats[1] + 0.5 * cfg.pseudocount) / total;
            }
            Family::Gaussian => {
                for d in 0..scope_len {
                    let (s0, s1, s2) = (stats[3 * d], stats[3 * d + 1], stats[3 * d + 2]);
                    if s0 <= MIN_STAT_MASS {
                        continue;
                    }
                    let mu = s1 / s0;
                    let var = (s2 / s0 - mu * mu).max(cfg.min_variance);
                    out[2 * d] = mu;
                    out[2 * d + 1] = var;
                }
            }
        }
    }

    /// Gradient of the summed log-likelihood with respect to the unconstrained
    /// parameters (categorical logits, bernoulli logit, gaussian mean and
    /// log-variance), laid out like the parameter vector.
    pub fn gradient(&self, params: &[f64], stats: &[f64], scope_len: usize, out: &mut [f64]) {
        match self {
            Family::Categorical { .. } => {
                let total: f64 = stats.iter().sum();
                for ((o, s), p) in out.iter_mut().zip(stats).zip(params) {
                    *o = s - p * total;
                }
            }
            Family::Bernoulli => {
                out[0] = stats[1] - params[0] * stats[0];
            }
            Family::Gaussian => {
                for d in 0..scope_len {
                    let (mu, var) = (params[2 * d], params[2 * d + 1]);
                    let (s0, s1, s2) = (stats[3 * d], stats[3 * d + 1], stats[3 * d + 2]);
                    out[2 * d] = (s1 - mu * s0) / var;
                    let sq = s2 - 2.0 * mu * s1 + mu * mu * s0;
                    out[2 * d + 1] = 0.5 * (sq / var - s0);
                }
            }
        }
    }

    /// Take one ascent step of size `lr` along `grad` in the unconstrained
    /// parameterisation and map the result back into the family's domain.
    pub fn gradient_step(&self, params: &[f64], grad: &[f64], lr: f64, scope_len: usize, out: &mut [f64]) {
        match self {
            Family::Categorical { .. } => {
                let logits: Vec<f64> = params
                    .iter()
                    .zip(grad)
                    .map(|(p, g)| p.ln() + lr * g)
                    .collect();
                softmax_into(&logits, out);
            }
            Family::Bernoulli => {
                let p = params[0];
                let logit = (p / (1.0 - p)).ln() + lr * grad[0];
                out[0] = 1.0 / (1.0 + (-logit).exp());
            }
            Family::Gaussian => {
                for d in 0..scope_len {
                    out[2 * d] = params[2 * d] + lr * grad[2 * d];
                    out[2 * d + 1] = (params[2 * d + 1].ln() + lr * grad[2 * d + 1]).exp();
                }
            }
        }
    }

    /// Draw a value for scope dimension `d`.
    pub fn sample_dim<R: Rng + ?Sized>(&self, params: &[f64], d: usize, rng: &mut R) -> f64 {
        match self {
            Family::Categorical { .. } => sample_categorical(params, rng) as f64,
            Family::Bernoulli => {
                if rng.gen::<f64>() < params[0] {
                    1.0
                } else {
                    0.0
                }
            }
            Family::Gaussian => {
                let mu = params[2 * d];
                let std = params[2 * d + 1].sqrt();
                match Normal::new(mu, std) {
                    Ok(n) => n.sample(rng),
                    Err(_) => mu,
                }
            }
        }
    }

    /// Random in-domain parameters for a fresh leaf.
    pub fn random_params<R: Rng + ?Sized>(&self, scope_len: usize, rng: &mut R) -> Vec<f64> {
        match self {
            Family::Categorical { num_cats } => {
                let raw: Vec<f64> = (0..*num_cats).map(|_| rng.sample::<f64, _>(Exp1)).collect();
                normalize(&raw)
            }
            Family::Bernoulli => vec![rng.gen_range(0.2..0.8)],
            Family::Gaussian => (0..scope_len)
                .flat_map(|_| {
                    let mu: f64 = rng.sample(rand_distr::StandardNormal);
                    [mu, 1.0]
                })
                .collect(),
        }
    }
}

/// Scale a non-negative vector to sum to one. An all-zero vector becomes uniform.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        let n = values.len().max(1) as f64;
        return vec![1.0 / n; values.len()];
    }
    values.iter().map(|v| v / total).collect()
}

/// Numerically stable softmax of `logits` written into `out`.
pub fn softmax_into(logits: &[f64], out: &mut [f64]) {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        out.iter_mut().for_each(|o| *o = f64::NAN);
        return;
    }
    let mut total = 0.0;
    for (o, l) in out.iter_mut().zip(logits) {
        *o = (l - max).exp();
        total += *o;
    }
    out.iter_mut().for_each(|o| *o /= total);
}

/// Index drawn with probability proportional to `weights`.
pub fn sample_categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return i;
        }
        u -= w;
    }
    // Rounding can leave u just above the last bucket.
    weights
        .iter()
        .rposition(|w| *w > 0.0)
        .unwrap_or(weights.len().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_gaussian_log_density() {
        let g = Family::Gaussian;
        let params = [1.0, 4.0];
        let expected = -0.5 * ((2.0 * std::f64::consts::PI * 4.0).ln() + 0.25);
        assert!(approx_eq(g.log_density_dim(&params, 0, 2.0), expected, 1e-12));
    }

    #[test]
    fn test_zero_probability_only_from_zero_parameters() {
        let cat = Family::Categorical { num_cats: 3 };
        assert!(cat.is_zero_probability(&[0.5, 0.0, 0.5], 1.0));
        assert!(!cat.is_zero_probability(&[0.5, 0.0, 0.5], 2.0));
        assert!(Family::Bernoulli.is_zero_probability(&[1.0], 0.0));
        assert!(Family::Bernoulli.is_zero_probability(&[0.0], 1.0));
        assert!(!Family::Bernoulli.is_zero_probability(&[0.3], 1.0));

        // Far but finite: the quadratic term overflows, yet the value is in support.
        let g = Family::Gaussian;
        assert_eq!(g.log_density_dim(&[0.0, 1.0], 0, 1e160), f64::NEG_INFINITY);
        assert!(!g.is_zero_probability(&[0.0, 1.0], 1e160));
    }

    #[test]
    fn test_categorical_em_with_pseudocount() {
        let c = Family::Categorical { num_cats: 2 };
        let mut out = [0.0; 2];
        let cfg = LeafUpdate {
            pseudocount: 2.0,
            ..LeafUpdate::default()
        };
        c.em_update(&[0.5, 0.5], &[3.0, 1.0], 1, &cfg, &mut out);
        assert!(approx_eq(out[0], 4.0 / 6.0, 1e-12));
        assert!(approx_eq(out[1], 2.0 / 6.0, 1e-12));
    }

    #[test]
    fn test_gaussian_em_keeps_unvisited_dimension() {
        let g = Family::Gaussian;
        let old = [0.0, 1.0, 5.0, 2.0];
        // dim 0: flow 2 at x = 1 and x = 3; dim 1: no mass.
        let stats = [2.0, 4.0, 10.0, 0.0, 0.0, 0.0];
        let mut out = [0.0; 4];
        g.em_update(&old, &stats, 2, &LeafUpdate::default(), &mut out);
        assert!(approx_eq(out[0], 2.0, 1e-12));
        assert!(approx_eq(out[1], 1.0, 1e-12));
        assert_eq!(&out[2..], &[5.0, 2.0]);
    }

    #[test]
    fn test_validate_params() {
        let c = Family::Categorical { num_cats: 3 };
        assert!(c.validate_params(&[0.2, 0.3, 0.5], 1).is_ok());
        assert!(c.validate_params(&[0.2, 0.3, 0.6], 1).is_err());
        assert!(c.validate_params(&[0.5, 0.5], 1).is_err());
        assert!(Family::Gaussian.validate_params(&[0.0, 0.0], 1).is_err());
        assert!(Family::Bernoulli.validate_params(&[1.5], 1).is_err());
    }

    #[test]
    fn test_check_scope() {
        assert!(Family::Bernoulli.check_scope(2).is_err());
        assert!(Family::Gaussian.check_scope(3).is_ok());
        assert!(Family::Gaussian.check_scope(0).is_err());
    }

    #[test]
    fn test_gradient_zero_at_mle() {
        let g = Family::Gaussian;
        // Data {1, 3} with unit flow: mle mean 2, variance 1.
        let stats = [2.0, 4.0, 10.0];
        let mut grad = [0.0; 2];
        g.gradient(&[2.0, 1.0], &stats, 1, &mut grad);
        assert!(approx_eq(grad[0], 0.0, 1e-12));
        assert!(approx_eq(grad[1], 0.0, 1e-12));
    }

    #[test]
    fn test_gradient_step_stays_normalized() {
        let c = Family::Categorical { num_cats: 3 };
        let params = [0.2, 0.3, 0.5];
        let mut grad = [0.0; 3];
        c.gradient(&params, &[5.0, 1.0, 1.0], 1, &mut grad);
        let mut out = [0.0; 3];
        c.gradient_step(&params, &grad, 0.1, 1, &mut out);
        assert!(approx_eq(out.iter().sum::<f64>(), 1.0, 1e-12));
        assert!(out[0] > params[0]);
    }

    #[test]
    fn test_random_params_in_domain() {
        let mut rng = StdRng::seed_from_u64(7);
        for fam in [
            Family::Categorical { num_cats: 4 },
            Family::Bernoulli,
            Family::Gaussian,
        ] {
            let k = if fam == Family::Gaussian { 3 } else { 1 };
            let p = fam.random_params(k, &mut rng);
            assert!(fam.validate_params(&p, k).is_ok(), "{fam:?}: {p:?}");
        }
    }

    #[test]
    fn test_sample_categorical_degenerate() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            assert_eq!(sample_categorical(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
    }
}
