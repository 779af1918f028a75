//! # circuitry-core
//!
//! The circuit model shared by every part of circuitry.
//!
//! This crate provides:
//! - [`Circuit`] / [`CircuitBuilder`] — a DAG of input, product and sum nodes in a flat arena
//! - [`Family`] — leaf distribution families (categorical, bernoulli, diagonal gaussian)
//! - [`Scope`] — the variable set a node depends on
//! - [`validate()`] — smoothness / decomposability / acyclicity checks
//! - [`CircuitDescription`] — the serde form produced by structure learners
//! - [`DataBatch`] — variable assignments with unobserved cells
//! - [`Error`] — the error taxonomy used across the workspace

pub mod circuit;
pub mod data;
pub mod dtype;
pub mod error;
pub mod family;
pub mod node;
pub mod scope;
pub mod structure;
pub mod validate;

pub use circuit::{Circuit, CircuitBuilder};
pub use data::{DataBatch, UNOBSERVED};
pub use dtype::DType;
pub use error::{Error, Result, Stage, StructureViolation};
pub use family::{Family, LeafUpdate, NORMALIZATION_TOL};
pub use node::{Node, NodeId, NodeKind};
pub use scope::Scope;
pub use structure::{CircuitDescription, NodeDescription};
pub use validate::{validate, StructureInfo};
