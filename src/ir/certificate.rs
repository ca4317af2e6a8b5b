//! Launch-time injectivity certificates for gradient scatters
//!
//! A certificate states that a scatter address is affine in the program ids
//! and tile lanes, `base + sum(c_k * i_k)`. Whether distinct `(program, lane)`
//! tuples can collide then depends only on the coefficient values and the
//! extents, which are known once the grid and scalar arguments are.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::index::AddressExpr;

/// An index variable of an affine address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexVar {
    ProgramId(usize),
    /// Tile lane along a dimension of the scattered tile.
    Lane(usize),
}

impl fmt::Display for IndexVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexVar::ProgramId(axis) => write!(f, "pid{axis}"),
            IndexVar::Lane(dim) => write!(f, "lane{dim}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateTerm {
    pub var: IndexVar,
    /// Index-free coefficient, evaluated at launch.
    pub coefficient: AddressExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterCertificate {
    /// One term per program-id axis and per lane dimension.
    pub terms: Vec<CertificateTerm>,
    /// Extents of the scattered tile.
    pub lanes: Vec<usize>,
}

impl fmt::Display for ScatterCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .terms
            .iter()
            .map(|t| format!("{}*{}", t.coefficient, t.var))
            .collect();
        write!(f, "injective({})", terms.join(" + "))
    }
}

impl ScatterCertificate {
    /// Check the certificate against a concrete launch.
    ///
    /// Terms whose variable has extent 1 are dropped. The remaining terms are
    /// sorted by coefficient magnitude and each must exceed the largest
    /// offset reachable by the smaller ones. Returns `false` when a
    /// coefficient cannot be evaluated.
    pub fn holds(&self, grid: [usize; 3], lookup: &dyn Fn(&str) -> Option<i64>) -> bool {
        let mut active = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let extent = match term.var {
                IndexVar::ProgramId(axis) => grid.get(axis).copied().unwrap_or(1),
                IndexVar::Lane(dim) => self.lanes.get(dim).copied().unwrap_or(1),
            };
            if extent <= 1 {
                continue;
            }
            let Some(coefficient) = term.coefficient.eval_scalar(lookup) else {
                return false;
            };
            if coefficient == 0 {
                return false;
            }
            active.push((coefficient.unsigned_abs() as u128, extent as u128));
        }
        active.sort_unstable();

        let mut span: u128 = 0;
        for (magnitude, extent) in active {
            if magnitude <= span {
                return false;
            }
            span += magnitude * (extent - 1);
        }
        true
    }
}
