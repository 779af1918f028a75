// Sampling — top-down ancestral draws
//
// From the root: a sum node picks one child, a product node visits every
// child, an input node draws the variables of its scope. Decomposability
// guarantees each variable is drawn at most once per sample.
//
// With evidence, a forward pass over the evidence rows comes first and sum
// nodes pick child j with probability ∝ w_j · p(evidence | child j), i.e. the
// posterior selector. Observed variables are copied through unchanged.

use rand::Rng;

use circuitry_core::family::sample_categorical;
use circuitry_core::{DataBatch, Error, Result};

use super::forward::run_forward;
use crate::compile::{ChildRef, LayerKind};
use crate::context::ExecContext;
use crate::memory::LayerBuffers;
use crate::plan::CompiledPlan;

/// Forward values of the evidence rows, for posterior selection.
struct Evidence<'a> {
    values: &'a LayerBuffers,
    batch_size: usize,
}

impl Evidence<'_> {
    fn value(&self, r: ChildRef, example: usize) -> Result<f64> {
        self.values
            .get(r.layer)
            .map(|buf| buf[r.slot * self.batch_size + example])
            .ok_or_else(|| Error::Compilation(format!("layer {} has no retained values", r.layer)))
    }
}

fn draw<R: Rng + ?Sized>(
    plan: &CompiledPlan,
    out: &mut DataBatch,
    example: usize,
    evidence: Option<&Evidence<'_>>,
    rng: &mut R,
) -> Result<()> {
    let root = plan.root_layer().index;
    let mut stack = vec![ChildRef { layer: root, slot: 0 }];
    let mut scores = Vec::new();

    while let Some(r) = stack.pop() {
        let layer = &plan.layers()[r.layer];
        let params = plan.params().node(r.layer, r.slot);
        match layer.kind {
            LayerKind::Input { family, .. } => {
                for (d, &var) in layer.vars_of(r.slot).iter().enumerate() {
                    if out.get(example, var).is_none() {
                        out.set(example, var, Some(family.sample_dim(params, d, rng)));
                    }
                }
            }
            LayerKind::Product { .. } => stack.extend_from_slice(layer.children_of(r.slot)),
            LayerKind::Sum { .. } => {
                let children = layer.children_of(r.slot);
                let pick = match evidence {
                    None => sample_categorical(params, rng),
                    Some(ev) => {
                        scores.clear();
                        for (c, w) in children.iter().zip(params) {
                            scores.push(w.ln() + ev.value(*c, example)?);
                        }
                        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                        if max == f64::NEG_INFINITY {
                            return Err(Error::Data(format!(
                                "example {example}: evidence has zero probability under node {}",
                                layer.nodes[r.slot]
                            )));
                        }
                        scores.iter_mut().for_each(|s| *s = (*s - max).exp());
                        sample_categorical(&scores, rng)
                    }
                };
                stack.push(children[pick]);
            }
        }
    }
    Ok(())
}

/// Draw `num_samples` independent samples from the circuit's distribution.
pub fn sample<R: Rng + ?Sized>(plan: &CompiledPlan, num_samples: usize, rng: &mut R) -> Result<DataBatch> {
    let mut out = DataBatch::unobserved(num_samples, plan.num_vars());
    for example in 0..num_samples {
        draw(plan, &mut out, example, None, rng)?;
    }
    Ok(out)
}

/// One sample per evidence row from the conditional distribution given the
/// row's observed variables. Observed cells are kept as they are.
pub fn sample_conditional<R: Rng + ?Sized>(
    plan: &CompiledPlan,
    evidence: &DataBatch,
    ctx: &ExecContext,
    rng: &mut R,
) -> Result<DataBatch> {
    let pass = ctx.install(|| run_forward(plan, evidence, ctx, ctx.pool_handle(), true))?;
    if let Some(b) = pass.log_likelihoods.iter().position(|ll| *ll == f64::NEG_INFINITY) {
        return Err(Error::Data(format!(
            "example {b}: evidence has zero probability under the circuit"
        )));
    }
    let ev = Evidence {
        values: &pass.values,
        batch_size: evidence.num_examples(),
    };
    let mut out = evidence.clone();
    for example in 0..evidence.num_examples() {
        draw(plan, &mut out, example, Some(&ev), rng)?;
    }
    Ok(out)
}
