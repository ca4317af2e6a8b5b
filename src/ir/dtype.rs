use serde::{Deserialize, Serialize};

/// Element type of a tile or a pointer's pointee.
///
/// Values are carried as `f64` everywhere; the dtype only decides how a value
/// is rounded when it is written to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    Bool,
    F32,
    F64,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "i1",
            DType::F32 => "fp32",
            DType::F64 => "fp64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Result type of a binary arithmetic operation.
    pub fn promote(self, other: DType) -> DType {
        match (self, other) {
            (DType::F64, _) | (_, DType::F64) => DType::F64,
            (DType::F32, _) | (_, DType::F32) => DType::F32,
            (DType::Bool, DType::Bool) => DType::Bool,
        }
    }

    /// Round a value to what this type can hold.
    pub fn round(&self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::F32 => value as f32 as f64,
            DType::F64 => value,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
