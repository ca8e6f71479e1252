//! Elementwise combining kernels
//!
//! Any associative elementwise operation works with the partitioning scheme;
//! the manager picks one per job and announces it to workers in `Hello`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Elementwise operation applied by workers to their two input chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineOp {
    #[default]
    Add,
    Sub,
    Mul,
    Max,
    Min,
}

impl CombineOp {
    #[inline]
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            CombineOp::Add => a + b,
            CombineOp::Sub => a - b,
            CombineOp::Mul => a * b,
            CombineOp::Max => a.max(b),
            CombineOp::Min => a.min(b),
        }
    }

    /// Combine two equal-length chunks.
    ///
    /// Callers guarantee equal lengths; extra elements of the longer slice
    /// are ignored.
    pub fn apply(self, a: &[f64], b: &[f64]) -> Vec<f64> {
        debug_assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(&x, &y)| self.eval(x, y)).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CombineOp::Add => "add",
            CombineOp::Sub => "sub",
            CombineOp::Mul => "mul",
            CombineOp::Max => "max",
            CombineOp::Min => "min",
        }
    }
}

impl std::fmt::Display for CombineOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CombineOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(CombineOp::Add),
            "sub" => Ok(CombineOp::Sub),
            "mul" => Ok(CombineOp::Mul),
            "max" => Ok(CombineOp::Max),
            "min" => Ok(CombineOp::Min),
            other => Err(format!(
                "unknown op '{}', expected one of: add, sub, mul, max, min",
                other
            )),
        }
    }
}
