use std::fmt;

use crate::node::NodeId;

/// Which structural invariant a circuit violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureViolation {
    /// Children of a product node have overlapping scopes.
    Decomposability,
    /// Children of a sum node do not share one scope.
    Smoothness,
    /// The node graph contains a cycle.
    Acyclicity,
    /// A child reference (or the root) points outside the node arena.
    DanglingReference,
    /// A node is not reachable from the root.
    Unreachable,
    /// A sum or product node has no children.
    EmptyChildren,
    /// A sum node's weight vector length differs from its child count.
    WeightArity,
    /// An input node's scope does not fit its distribution family.
    InvalidLeaf,
}

impl fmt::Display for StructureViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StructureViolation::Decomposability => "decomposability",
            StructureViolation::Smoothness => "smoothness",
            StructureViolation::Acyclicity => "acyclicity",
            StructureViolation::DanglingReference => "dangling reference",
            StructureViolation::Unreachable => "reachability",
            StructureViolation::EmptyChildren => "non-empty children",
            StructureViolation::WeightArity => "weight arity",
            StructureViolation::InvalidLeaf => "leaf scope",
        };
        write!(f, "{s}")
    }
}

/// Pass during which a non-finite value showed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Forward,
    Backward,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Forward => write!(f, "forward"),
            Stage::Backward => write!(f, "backward"),
        }
    }
}

/// All errors that can occur within circuitry.
///
/// Structural and compilation errors are raised before anything executes and
/// always name the node involved. Numerical errors abort a single
/// forward/backward call. Parameter errors abort the update of a single layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A circuit invariant does not hold at validation time.
    #[error("structure error at node {node}: {violation} violated ({detail})")]
    Structure {
        node: NodeId,
        violation: StructureViolation,
        detail: String,
    },

    /// Internal inconsistency in the compiler. Unreachable for validated circuits.
    #[error("compilation error: {0}")]
    Compilation(String),

    /// A non-finite value was produced during a pass.
    #[error("numerical error in {stage} pass: layer {layer}, node {node}, example {example}: value {value}")]
    Numerical {
        stage: Stage,
        layer: usize,
        node: NodeId,
        example: usize,
        value: f64,
    },

    /// An update would leave a layer's parameters outside their domain.
    #[error("parameter error in layer {layer}: {detail}")]
    Parameter { layer: usize, detail: String },

    /// The data batch does not fit the circuit.
    #[error("data error: {0}")]
    Data(String),

    /// A serialized circuit or checkpoint could not be decoded.
    #[error("format error: {0}")]
    Format(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn structure(node: NodeId, violation: StructureViolation, detail: impl Into<String>) -> Self {
        Error::Structure {
            node,
            violation,
            detail: detail.into(),
        }
    }

    pub fn parameter(layer: usize, detail: impl Into<String>) -> Self {
        Error::Parameter {
            layer,
            detail: detail.into(),
        }
    }

    /// The structural invariant this error reports, if any.
    pub fn violation(&self) -> Option<StructureViolation> {
        match self {
            Error::Structure { violation, .. } => Some(*violation),
            _ => None,
        }
    }
}

/// Convenience Result type used throughout circuitry.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
