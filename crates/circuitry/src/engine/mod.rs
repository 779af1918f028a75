// Engine — executes a compiled plan
//
//   forward            — per-example log-likelihood (marginals for partial rows)
//   backward           — forward, then flows and parameter statistics
//   sample             — unconditional ancestral sampling
//   sample_conditional — sampling given the observed cells of each row
//
// Every pass runs inside the context's thread pool and draws its buffers from
// the context's buffer pool.

mod backward;
mod forward;
mod sample;

pub use backward::{backward, BackwardOutput, FlowOptions, NodeFlows};
pub use forward::forward;
pub use sample::{sample, sample_conditional};
