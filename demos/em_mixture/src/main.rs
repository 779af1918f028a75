// Demo: Fitting a Gaussian mixture with mini-batch EM
//
// The circuit is a sum over K products, each product a pair of independent
// gaussians (x0, x1). Data comes from three well-separated clusters.
//
// The training loop is:
//   1. backward():  forward + flows, giving expected sufficient statistics
//   2. merge:       accumulate statistics over the mini-batches of an epoch
//   3. update():    closed-form EM re-estimate of weights, means, variances
//
// The log-likelihood printed per epoch never decreases. At the end the plan
// is saved, reloaded and used to draw a few samples.
//
// Run with: `cargo run --release -p em_mixture`

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use circuitry::checkpoint;
use circuitry::prelude::*;

const NUM_COMPONENTS: usize = 4;
const NUM_EXAMPLES: usize = 3000;
const BATCH_SIZE: usize = 512;
const EPOCHS: usize = 25;

fn make_data(rng: &mut StdRng) -> circuitry::Result<DataBatch> {
    let centres = [(-4.0, 0.0), (0.0, 3.0), (4.0, -1.0)];
    let noise = Normal::new(0.0, 0.8).map_err(|e| Error::msg(e.to_string()))?;
    let mut values = Vec::with_capacity(NUM_EXAMPLES * 2);
    for i in 0..NUM_EXAMPLES {
        let (cx, cy) = centres[i % centres.len()];
        values.push(cx + noise.sample(rng));
        values.push(cy + noise.sample(rng));
    }
    DataBatch::from_dense(2, values)
}

fn make_circuit(rng: &mut StdRng) -> circuitry::Result<Circuit> {
    let init = Normal::new(0.0, 2.0).map_err(|e| Error::msg(e.to_string()))?;
    let mut b = CircuitBuilder::new();
    let mut components = Vec::with_capacity(NUM_COMPONENTS);
    for _ in 0..NUM_COMPONENTS {
        let x0 = b.gaussian(0, init.sample(rng), 4.0);
        let x1 = b.gaussian(1, init.sample(rng), 4.0);
        components.push(b.product(&[x0, x1]));
    }
    let root = b.sum_uniform(&components);
    b.build(root)
}

fn main() -> circuitry::Result<()> {
    env_logger::init();
    println!(" circuitry: EM on a gaussian mixture \n");

    let mut rng = StdRng::seed_from_u64(7);
    let data = make_data(&mut rng)?;
    let circuit = make_circuit(&mut rng)?;
    println!("{circuit}");

    let ctx = ExecContext::default().with_precision(DType::F32);
    let mut plan = circuitry::compile(&circuit, &ctx)?;
    println!("{}", plan.stats());

    let cfg = UpdateConfig::em().with_min_variance(1e-3);
    let batches = data.chunks(BATCH_SIZE);

    for epoch in 0..EPOCHS {
        let mut stats: Option<Statistics> = None;
        for batch in &batches {
            let out = circuitry::backward(&plan, batch, &ctx, FlowOptions::default())?;
            match stats.as_mut() {
                Some(s) => s.merge(&out.statistics)?,
                None => stats = Some(out.statistics),
            }
        }
        let Some(stats) = stats else {
            break;
        };
        let report = circuitry::update(&mut plan, &stats, &cfg)?;
        for err in &report.failed {
            warn!("{err}");
        }
        println!(
            "Epoch {:3}: mean log-likelihood = {:.5}",
            epoch,
            stats.mean_log_likelihood()
        );
    }

    let root = plan.locate(plan.root()).map(|r| plan.params().node(r.layer, r.slot).to_vec());
    println!("\nMixture weights: {root:.3?}");
    for (k, &component) in circuit
        .node(circuit.root())
        .map(|n| n.children())
        .unwrap_or_default()
        .iter()
        .enumerate()
    {
        let node = circuit.node(component).map(|n| n.children()).unwrap_or_default();
        let means: Vec<f64> = node
            .iter()
            .filter_map(|&leaf| plan.node_params(leaf).map(|p| p[0]))
            .collect();
        println!("  component {k}: mean = {means:.3?}");
    }

    // Save / load
    let path = std::env::temp_dir().join("em_mixture.pckt");
    checkpoint::save(&path, &plan, &ctx)?;
    let loaded = checkpoint::load(&path, &ctx)?;
    let before: f64 = plan.forward(&data, &ctx)?.iter().sum();
    let after: f64 = loaded.forward(&data, &ctx)?.iter().sum();
    info!("checkpoint {}: {before:.4} -> {after:.4}", path.display());
    println!("\nReloaded from {} (f32): total log-likelihood {after:.3}", path.display());

    let samples = loaded.sample(5, &mut rng)?;
    println!("\nSamples:");
    for i in 0..samples.num_examples() {
        println!("  {:?}", samples.row(i));
    }

    println!("\n{}", ctx.pool().stats());
    Ok(())
}
