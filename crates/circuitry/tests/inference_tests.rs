// Inference Tests — forward log-likelihoods, marginals, flows and sampling

use std::f64::consts::PI;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use circuitry::dispatch::{BackwardStep, EdgeFlows, LayerInputs};
use circuitry::prelude::*;
use circuitry::{DeviceCaps, Node, Stage};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn gauss_logpdf(x: f64, mean: f64, var: f64) -> f64 {
    -0.5 * (2.0 * PI * var).ln() - (x - mean).powi(2) / (2.0 * var)
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

// Fixtures

/// 0.3 · N(x0; 0, 1) N(x1; 1, 2) + 0.7 · N(x0; 2, 0.5) N(x1; -1, 1)
struct TwoComponent {
    circuit: Circuit,
    p1: NodeId,
    p2: NodeId,
}

fn two_component() -> TwoComponent {
    let mut b = CircuitBuilder::new();
    let a0 = b.gaussian(0, 0.0, 1.0);
    let a1 = b.gaussian(1, 1.0, 2.0);
    let b0 = b.gaussian(0, 2.0, 0.5);
    let b1 = b.gaussian(1, -1.0, 1.0);
    let p1 = b.product(&[a0, a1]);
    let p2 = b.product(&[b0, b1]);
    let root = b.sum(&[p1, p2], &[0.3, 0.7]);
    TwoComponent {
        circuit: b.build(root).unwrap(),
        p1,
        p2,
    }
}

fn two_component_ll(x0: f64, x1: f64) -> f64 {
    log_sum_exp(
        0.3f64.ln() + gauss_logpdf(x0, 0.0, 1.0) + gauss_logpdf(x1, 1.0, 2.0),
        0.7f64.ln() + gauss_logpdf(x0, 2.0, 0.5) + gauss_logpdf(x1, -1.0, 1.0),
    )
}

/// A deeper circuit over four variables with mixed families and shared
/// sub-mixtures, for invariance checks.
fn mixed_circuit() -> Circuit {
    let mut rng = StdRng::seed_from_u64(11);
    let mut b = CircuitBuilder::new();
    let c0: Vec<NodeId> = (0..3)
        .map(|_| b.random_input(Scope::single(0), Family::Categorical { num_cats: 4 }, &mut rng))
        .collect();
    let c1: Vec<NodeId> = (0..2)
        .map(|_| b.random_input(Scope::single(1), Family::Bernoulli, &mut rng))
        .collect();
    let g23: Vec<NodeId> = (0..3)
        .map(|_| b.random_input(Scope::new([2, 3]), Family::Gaussian, &mut rng))
        .collect();
    let s0 = b.sum_random(&c0, &mut rng);
    let s0b = b.sum_random(&c0, &mut rng);
    let s1 = b.sum_random(&c1, &mut rng);
    let s23 = b.sum_random(&g23, &mut rng);
    let s23b = b.sum_random(&g23, &mut rng);
    let p01 = b.product(&[s0, s1]);
    let p01b = b.product(&[s0b, s1]);
    let m01 = b.sum_random(&[p01, p01b], &mut rng);
    let q1 = b.product(&[m01, s23]);
    let q2 = b.product(&[p01b, s23b]);
    let q3 = b.product(&[s0, c1[0], g23[2]]);
    let root = b.sum_random(&[q1, q2, q3], &mut rng);
    b.build(root).unwrap()
}

fn parallel_ctx(threshold: usize) -> ExecContext {
    ExecContext::new(Device::Parallel { threads: 2 })
        .unwrap()
        .with_fused_threshold(threshold)
}

// Forward

#[test]
fn test_forward_matches_analytic_two_gaussians() {
    init_logger();
    let fx = two_component();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&fx.circuit, &ctx).unwrap();

    let points = [(0.0, 0.0), (1.5, -0.5), (-2.0, 3.0), (2.0, -1.0)];
    let dense: Vec<f64> = points.iter().flat_map(|&(a, b)| [a, b]).collect();
    let batch = DataBatch::from_dense(2, dense).unwrap();

    let got = circuitry::forward(&plan, &batch, &ctx).unwrap();
    let expected: Vec<f64> = points.iter().map(|&(a, b)| two_component_ll(a, b)).collect();
    assert_vec_approx(&got, &expected, 1e-10);
}

#[test]
fn test_forward_far_from_modes_stays_finite() {
    let fx = two_component();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&fx.circuit, &ctx).unwrap();
    let batch = DataBatch::from_dense(2, vec![40.0, -40.0]).unwrap();
    let ll = plan.forward(&batch, &ctx).unwrap()[0];
    assert!(ll.is_finite());
    assert!(approx_eq(ll, two_component_ll(40.0, -40.0), 1e-8));
}

#[test]
fn test_batching_invariance() {
    init_logger();
    let circuit = mixed_circuit();
    let cpu = ExecContext::cpu();
    let plan = circuitry::compile(&circuit, &cpu).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let batch = plan.sample(64, &mut rng).unwrap();

    let full = plan.forward(&batch, &cpu).unwrap();
    assert_eq!(full.len(), 64);
    for i in 0..batch.num_examples() {
        let single = batch.slice(i..i + 1).unwrap();
        let one = plan.forward(&single, &cpu).unwrap();
        assert!(approx_eq(one[0], full[i], 1e-12), "example {i}: {} vs {}", one[0], full[i]);
    }

    // Reordering the batch reorders the output.
    let order: Vec<usize> = (0..64).rev().collect();
    let reversed = plan.forward(&batch.select(&order).unwrap(), &cpu).unwrap();
    let expected: Vec<f64> = order.iter().map(|&i| full[i]).collect();
    assert_vec_approx(&reversed, &expected, 1e-12);
}

#[test]
fn test_fused_and_generic_agree() {
    let circuit = mixed_circuit();
    let generic = ExecContext::cpu();
    let fused = parallel_ctx(1);
    let never = parallel_ctx(usize::MAX);

    let plan = circuitry::compile(&circuit, &fused).unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let batch = plan.sample(100, &mut rng).unwrap();

    let a = plan.forward(&batch, &generic).unwrap();
    let b = plan.forward(&batch, &fused).unwrap();
    let c = plan.forward(&batch, &never).unwrap();
    assert_vec_approx(&b, &a, 1e-10);
    assert_vec_approx(&c, &a, 1e-10);

    let sa = plan.backward(&batch, &generic, FlowOptions::default()).unwrap();
    let sb = plan.backward(&batch, &fused, FlowOptions::default()).unwrap();
    for l in 0..plan.num_layers() {
        assert_vec_approx(sb.statistics.layer(l), sa.statistics.layer(l), 1e-8);
    }
}

#[test]
fn test_empty_batch() {
    let fx = two_component();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&fx.circuit, &ctx).unwrap();
    let batch = DataBatch::unobserved(0, 2);
    assert!(plan.forward(&batch, &ctx).unwrap().is_empty());
    let out = plan.backward(&batch, &ctx, FlowOptions::default()).unwrap();
    assert_eq!(out.statistics.num_examples(), 0);
}

// Marginals

#[test]
fn test_unobserved_variable_is_marginalised() {
    let fx = two_component();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&fx.circuit, &ctx).unwrap();

    let batch = DataBatch::from_rows(&[vec![Some(0.7), None], vec![None, None]]).unwrap();
    let got = plan.forward(&batch, &ctx).unwrap();

    let expected = log_sum_exp(
        0.3f64.ln() + gauss_logpdf(0.7, 0.0, 1.0),
        0.7f64.ln() + gauss_logpdf(0.7, 2.0, 0.5),
    );
    assert!(approx_eq(got[0], expected, 1e-10));
    // Nothing observed: total probability.
    assert!(approx_eq(got[1], 0.0, 1e-12));
}

#[test]
fn test_categorical_marginals_sum_to_one() {
    let circuit = mixed_circuit();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&circuit, &ctx).unwrap();

    // p(x0 = k, x1 = v) over all k, v must sum to one.
    let mut rows = Vec::new();
    for k in 0..4 {
        for v in 0..2 {
            rows.push(vec![Some(k as f64), Some(v as f64), None, None]);
        }
    }
    let batch = DataBatch::from_rows(&rows).unwrap();
    let total: f64 = plan.forward(&batch, &ctx).unwrap().iter().map(|ll| ll.exp()).sum();
    assert!(approx_eq(total, 1.0, 1e-10), "total {total}");
}

// Errors

#[test]
fn test_out_of_support_value_is_a_data_error() {
    let mut b = CircuitBuilder::new();
    let x = b.categorical(0, &[0.2, 0.3, 0.5]);
    let y = b.categorical(0, &[0.6, 0.2, 0.2]);
    let root = b.sum(&[x, y], &[0.5, 0.5]);
    let circuit = b.build(root).unwrap();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&circuit, &ctx).unwrap();

    let batch = DataBatch::from_dense(1, vec![1.0, 3.0]).unwrap();
    let err = plan.forward(&batch, &ctx).unwrap_err();
    assert!(matches!(err, Error::Data(_)), "got {err}");
}

#[test]
fn test_zero_probability_example_is_neg_infinity() {
    let mut b = CircuitBuilder::new();
    let x = b.categorical(0, &[1.0, 0.0]);
    let y = b.categorical(0, &[1.0, 0.0]);
    let root = b.sum(&[x, y], &[0.5, 0.5]);
    let circuit = b.build(root).unwrap();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&circuit, &ctx).unwrap();

    let batch = DataBatch::from_dense(1, vec![0.0, 1.0]).unwrap();
    let ll = plan.forward(&batch, &ctx).unwrap();
    assert!(approx_eq(ll[0], 0.0, 1e-12));
    assert_eq!(ll[1], f64::NEG_INFINITY);
}

/// Generic kernel that corrupts the first value of every input layer.
#[derive(Debug)]
struct PoisonKernel;

impl LayerKernel for PoisonKernel {
    fn name(&self) -> &'static str {
        "poison"
    }

    fn supports(&self, kind: &LayerKind, _caps: &DeviceCaps) -> bool {
        matches!(kind, LayerKind::Input { .. })
    }

    fn forward(&self, layer: &Layer, inputs: &LayerInputs<'_>, params: &[f64], out: &mut [f64]) -> Result<()> {
        GenericKernel.forward(layer, inputs, params, out)?;
        out[0] = f64::NAN;
        Ok(())
    }

    fn backward(&self, layer: &Layer, inputs: &LayerInputs<'_>, step: BackwardStep<'_>) -> Result<()> {
        GenericKernel.backward(layer, inputs, step)
    }

    fn gather(&self, layer: &Layer, edges: &EdgeFlows<'_>, out: &mut [f64]) {
        GenericKernel.gather(layer, edges, out)
    }
}

#[test]
fn test_non_finite_leaf_value_is_a_numerical_error() {
    let fx = two_component();
    let ctx = ExecContext::cpu()
        .with_kernels(KernelRegistry::generic_only().with_fused(Arc::new(PoisonKernel)))
        .with_fused_threshold(0);
    let plan = circuitry::compile(&fx.circuit, &ctx).unwrap();
    let batch = DataBatch::from_dense(2, vec![0.0, 0.0, 1.0, 1.0]).unwrap();

    let err = plan.forward(&batch, &ctx).unwrap_err();
    match err {
        Error::Numerical {
            stage,
            layer,
            node,
            example,
            value,
        } => {
            assert_eq!(stage, Stage::Forward);
            assert!(plan.layers()[layer].is_input());
            assert_eq!(node, plan.layers()[layer].nodes[0]);
            assert_eq!(example, 0);
            assert!(value.is_nan());
        }
        other => panic!("expected numerical error, got {other}"),
    }

    // The same plan is fine under a clean context.
    assert!(plan.forward(&batch, &ExecContext::cpu()).is_ok());
}

#[test]
fn test_gaussian_overflow_is_a_numerical_error() {
    // x is finite and in support, but (x - mu)^2 / var overflows to +inf.
    let mut b = CircuitBuilder::new();
    let x = b.gaussian(0, 0.0, 1.0);
    let y = b.gaussian(0, 1.0, 1.0);
    let root = b.sum(&[x, y], &[0.5, 0.5]);
    let circuit = b.build(root).unwrap();
    let batch = DataBatch::from_dense(1, vec![1e160]).unwrap();

    for ctx in [ExecContext::cpu(), parallel_ctx(0)] {
        let plan = circuitry::compile(&circuit, &ctx).unwrap();
        match plan.forward(&batch, &ctx).unwrap_err() {
            Error::Numerical {
                stage, layer, value, ..
            } => {
                assert_eq!(stage, Stage::Forward);
                assert!(plan.layers()[layer].is_input());
                assert_eq!(value, f64::NEG_INFINITY);
            }
            other => panic!("expected numerical error, got {other}"),
        }
        let err = plan.backward(&batch, &ctx, FlowOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Numerical { stage: Stage::Forward, .. }), "got {err}");
    }
}

// Flows

#[test]
fn test_node_flows() {
    let fx = two_component();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&fx.circuit, &ctx).unwrap();
    let points = [(0.0, 0.0), (1.5, -0.5), (-2.0, 3.0)];
    let dense: Vec<f64> = points.iter().flat_map(|&(a, b)| [a, b]).collect();
    let batch = DataBatch::from_dense(2, dense).unwrap();

    let out = circuitry::backward(&plan, &batch, &ctx, FlowOptions::with_node_flows()).unwrap();
    let flows = out.node_flows.unwrap();
    assert_eq!(flows.len(), fx.circuit.num_nodes());

    let root = flows.node(fx.circuit.root()).unwrap();
    assert_vec_approx(root, &[1.0; 3], 1e-12);

    let f1 = flows.node(fx.p1).unwrap();
    let f2 = flows.node(fx.p2).unwrap();
    for (i, &(x0, x1)) in points.iter().enumerate() {
        let r1 = (0.3f64.ln() + gauss_logpdf(x0, 0.0, 1.0) + gauss_logpdf(x1, 1.0, 2.0)
            - two_component_ll(x0, x1))
        .exp();
        assert!(approx_eq(f1[i], r1, 1e-10));
        assert!(approx_eq(f1[i] + f2[i], 1.0, 1e-12));
    }

    // Products pass their flow to every child unchanged.
    for &child in fx.circuit.node(fx.p1).unwrap().children() {
        assert_vec_approx(flows.node(child).unwrap(), f1, 1e-12);
    }

    // Sum-layer statistics are the edge flows totalled over the batch.
    let r = plan.locate(fx.circuit.root()).unwrap();
    let stats = out.statistics.layer(r.layer);
    assert!(approx_eq(stats[0], f1.iter().sum::<f64>(), 1e-10));
    assert!(approx_eq(stats[1], f2.iter().sum::<f64>(), 1e-10));
    assert_eq!(out.statistics.num_examples(), 3);
}

#[test]
fn test_flows_accumulate_over_shared_children() {
    let circuit = mixed_circuit();
    let ctx = parallel_ctx(1);
    let plan = circuitry::compile(&circuit, &ctx).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let batch = plan.sample(16, &mut rng).unwrap();
    let flows = plan
        .backward(&batch, &ctx, FlowOptions::with_node_flows())
        .unwrap()
        .node_flows
        .unwrap();

    // Every example routes total flow 1 through each variable's leaves.
    // Variables 2 and 3 share their gaussian leaves, keyed by variable 2.
    for var in 0..3 {
        let mut total = vec![0.0; 16];
        for (i, node) in circuit.nodes().iter().enumerate() {
            if let Node::Input { scope, .. } = node {
                if scope.vars()[0] == var {
                    for (t, f) in total.iter_mut().zip(flows.node(NodeId(i)).unwrap()) {
                        *t += f;
                    }
                }
            }
        }
        assert_vec_approx(&total, &[1.0; 16], 1e-10);
    }
}

// Sampling

#[test]
fn test_sampling_point_masses() {
    let mut b = CircuitBuilder::new();
    let zero = b.categorical(0, &[1.0, 0.0]);
    let one = b.categorical(0, &[0.0, 1.0]);
    let root = b.sum(&[zero, one], &[0.3, 0.7]);
    let circuit = b.build(root).unwrap();
    let plan = circuitry::compile(&circuit, &ExecContext::cpu()).unwrap();

    let mut rng = StdRng::seed_from_u64(2024);
    let n = 20_000;
    let samples = circuitry::sample(&plan, n, &mut rng).unwrap();
    assert_eq!(samples.num_examples(), n);
    let ones = (0..n)
        .map(|i| samples.get(i, 0).unwrap())
        .inspect(|&v| assert!(v == 0.0 || v == 1.0))
        .filter(|&v| v == 1.0)
        .count();
    let freq = ones as f64 / n as f64;
    assert!(approx_eq(freq, 0.7, 0.02), "frequency {freq}");
}

#[test]
fn test_sampling_degenerate_weights() {
    let mut b = CircuitBuilder::new();
    let zero = b.categorical(0, &[1.0, 0.0]);
    let one = b.categorical(0, &[0.0, 1.0]);
    let root = b.sum(&[zero, one], &[1.0, 0.0]);
    let circuit = b.build(root).unwrap();
    let plan = circuitry::compile(&circuit, &ExecContext::cpu()).unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    let samples = plan.sample(500, &mut rng).unwrap();
    assert!((0..500).all(|i| samples.get(i, 0) == Some(0.0)));
}

#[test]
fn test_samples_cover_every_variable() {
    let circuit = mixed_circuit();
    let plan = circuitry::compile(&circuit, &ExecContext::cpu()).unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    let samples = plan.sample(50, &mut rng).unwrap();
    for i in 0..50 {
        let row = samples.row(i);
        assert!(row.iter().all(Option::is_some), "row {i}: {row:?}");
        let x0 = row[0].unwrap();
        assert!(x0.fract() == 0.0 && (0.0..4.0).contains(&x0));
    }
}

/// Two clusters tied to a categorical switch on x0.
fn switch_circuit() -> Circuit {
    let mut b = CircuitBuilder::new();
    let a0 = b.categorical(0, &[1.0, 0.0, 0.0]);
    let a1 = b.gaussian(1, -5.0, 0.01);
    let b0 = b.categorical(0, &[0.0, 1.0, 0.0]);
    let b1 = b.gaussian(1, 5.0, 0.01);
    let pa = b.product(&[a0, a1]);
    let pb = b.product(&[b0, b1]);
    let root = b.sum(&[pa, pb], &[0.5, 0.5]);
    b.build(root).unwrap()
}

#[test]
fn test_conditional_sampling_keeps_evidence() {
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&switch_circuit(), &ctx).unwrap();

    let rows: Vec<Vec<Option<f64>>> = (0..200)
        .map(|i| vec![Some((i % 2) as f64), None])
        .collect();
    let evidence = DataBatch::from_rows(&rows).unwrap();
    let mut rng = StdRng::seed_from_u64(77);
    let samples = circuitry::sample_conditional(&plan, &evidence, &ctx, &mut rng).unwrap();

    for i in 0..200 {
        let x0 = samples.get(i, 0).unwrap();
        let x1 = samples.get(i, 1).unwrap();
        assert_eq!(x0, (i % 2) as f64);
        let centre = if x0 == 0.0 { -5.0 } else { 5.0 };
        assert!((x1 - centre).abs() < 1.0, "row {i}: x1 = {x1}");
    }
}

#[test]
fn test_conditional_sampling_rejects_impossible_evidence() {
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&switch_circuit(), &ctx).unwrap();
    let evidence = DataBatch::from_rows(&[vec![Some(2.0), None]]).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let err = plan.sample_conditional(&evidence, &ctx, &mut rng).unwrap_err();
    assert!(matches!(err, Error::Data(_)), "got {err}");
}

// Buffer reuse

#[test]
fn test_pool_reuses_buffers_across_calls() {
    let circuit = mixed_circuit();
    let ctx = ExecContext::cpu();
    let plan = circuitry::compile(&circuit, &ctx).unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    let batch = plan.sample(32, &mut rng).unwrap();

    ctx.pool().reset_stats();
    plan.forward(&batch, &ctx).unwrap();
    let first = ctx.pool().stats();
    assert!(first.misses > 0);

    plan.forward(&batch, &ctx).unwrap();
    let second = ctx.pool().stats();
    assert!(second.hits > first.hits, "{second}");
    assert_eq!(second.misses, first.misses);
}
