use std::fmt;

use crate::error::{Error, Result};

// DType — Storage precision for parameter tensors
//
// The engine always computes in f64 on the host. DType selects how parameter
// tensors are stored when a circuit is persisted, and which precision an
// ExecContext advertises:
//
//   F16  — 16-bit IEEE half float, smallest checkpoints
//   BF16 — 16-bit brain float
//   F32  — 32-bit float, the default
//   F64  — 64-bit float, bit-exact round trips

/// Floating-point storage types for parameter tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F16,
    BF16,
    #[default]
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Tag byte used by the checkpoint format.
    pub fn to_tag(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::F16 => 5,
            DType::BF16 => 6,
        }
    }

    /// Inverse of [`DType::to_tag`].
    pub fn from_tag(v: u8) -> Result<Self> {
        match v {
            0 => Ok(DType::F32),
            1 => Ok(DType::F64),
            5 => Ok(DType::F16),
            6 => Ok(DType::BF16),
            _ => Err(Error::Format(format!("unknown dtype tag: {v}"))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for dt in [DType::F16, DType::BF16, DType::F32, DType::F64] {
            assert_eq!(DType::from_tag(dt.to_tag()).unwrap(), dt);
        }
        assert!(DType::from_tag(42).is_err());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert!(DType::BF16.is_half());
        assert!(!DType::F32.is_half());
    }
}
