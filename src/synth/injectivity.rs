//! Injectivity analysis for gradient scatter addresses
//!
//! An address is expanded into a polynomial over index variables (program ids
//! and tile lanes) with index-free coefficients. Only affine polynomials get a
//! [`ScatterCertificate`]; anything else must accumulate atomically.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::{AddressExpr, CertificateTerm, IndexVar, ScatterCertificate};

/// Why an address cannot be certified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonAffineReason {
    Modulo,
    Division,
    Minimum,
    /// Product of two different index variables.
    IndexProduct,
    /// An index variable raised to a power.
    Power,
}

impl fmt::Display for NonAffineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NonAffineReason::Modulo => "remainder of an index",
            NonAffineReason::Division => "division of an index",
            NonAffineReason::Minimum => "minimum over an index",
            NonAffineReason::IndexProduct => "product of index variables",
            NonAffineReason::Power => "power of an index variable",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Injectivity {
    Affine(ScatterCertificate),
    NonAffine(NonAffineReason),
}

/// One monomial: sorted index variables times an index-free coefficient.
type Monomial = (Vec<IndexVar>, AddressExpr);

fn expand(expr: &AddressExpr, frame: usize) -> Result<Vec<Monomial>, NonAffineReason> {
    match expr {
        AddressExpr::Const(_) | AddressExpr::Scalar(_) => Ok(vec![(vec![], expr.clone())]),
        AddressExpr::ProgramId(axis) => Ok(vec![(vec![IndexVar::ProgramId(*axis)], AddressExpr::Const(1))]),
        AddressExpr::Range { axis, rank, .. } => {
            let lane = frame.saturating_sub(*rank) + axis;
            Ok(vec![(vec![IndexVar::Lane(lane)], AddressExpr::Const(1))])
        }
        AddressExpr::Add(l, r) => {
            let mut terms = expand(l, frame)?;
            terms.extend(expand(r, frame)?);
            Ok(terms)
        }
        AddressExpr::Mul(l, r) => {
            let (lhs, rhs) = (expand(l, frame)?, expand(r, frame)?);
            let mut terms = Vec::with_capacity(lhs.len() * rhs.len());
            for (lv, lc) in &lhs {
                for (rv, rc) in &rhs {
                    let mut vars = lv.clone();
                    vars.extend(rv.iter().copied());
                    vars.sort();
                    terms.push((vars, lc * rc));
                }
            }
            Ok(terms)
        }
        AddressExpr::FloorDiv(..) | AddressExpr::Rem(..) | AddressExpr::Min(..) if expr.is_index_free() => {
            Ok(vec![(vec![], expr.clone())])
        }
        AddressExpr::FloorDiv(..) => Err(NonAffineReason::Division),
        AddressExpr::Rem(..) => Err(NonAffineReason::Modulo),
        AddressExpr::Min(..) => Err(NonAffineReason::Minimum),
    }
}

/// Analyze a scatter address over a tile of shape `lanes`.
///
/// The certificate has one term per program-id axis and per lane dimension;
/// variables that do not occur get a zero coefficient.
pub fn analyze_address(address: &AddressExpr, lanes: &[usize]) -> Injectivity {
    let frame = lanes.len().max(address.rank());
    let monomials = match expand(address, frame) {
        Ok(monomials) => monomials,
        Err(reason) => return Injectivity::NonAffine(reason),
    };

    let vars: Vec<IndexVar> = (0..3)
        .map(IndexVar::ProgramId)
        .chain((0..frame).map(IndexVar::Lane))
        .collect();
    let mut coefficients = vec![AddressExpr::Const(0); vars.len()];
    for (monomial_vars, coefficient) in monomials {
        match monomial_vars.as_slice() {
            [] => {}
            [var] => {
                if let Some(slot) = vars.iter().position(|v| v == var) {
                    coefficients[slot] = &coefficients[slot] + coefficient;
                }
            }
            [a, b, ..] if a == b => return Injectivity::NonAffine(NonAffineReason::Power),
            _ => return Injectivity::NonAffine(NonAffineReason::IndexProduct),
        }
    }

    let mut extents = vec![1; frame - lanes.len()];
    extents.extend_from_slice(lanes);
    Injectivity::Affine(ScatterCertificate {
        terms: vars
            .into_iter()
            .zip(coefficients)
            .map(|(var, coefficient)| CertificateTerm { var, coefficient })
            .collect(),
        lanes: extents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn offs(len: usize) -> AddressExpr {
        AddressExpr::Range {
            len,
            axis: 0,
            rank: 1,
        }
    }

    fn certificate(address: &AddressExpr, lanes: &[usize]) -> ScatterCertificate {
        match analyze_address(address, lanes) {
            Injectivity::Affine(cert) => cert,
            other => panic!("expected an affine address, got {other:?}"),
        }
    }

    #[test]
    fn test_blocked_address_is_affine() {
        let address = AddressExpr::ProgramId(0) * 16 + offs(16);
        let cert = certificate(&address, &[16]);
        assert_eq!(cert.lanes, vec![16]);
        assert_eq!(cert.terms.len(), 4);
        assert_eq!(cert.terms[0].coefficient, AddressExpr::Const(16));
        assert_eq!(cert.terms[3].var, IndexVar::Lane(0));
        let none = |_: &str| None;
        assert!(cert.holds([8, 1, 1], &none));
    }

    #[test]
    fn test_grid_kernel_with_symbolic_stride() {
        let address = AddressExpr::ProgramId(0) * AddressExpr::scalar("n") + AddressExpr::ProgramId(1);
        let cert = certificate(&address, &[]);
        let wide = |name: &str| (name == "n").then_some(5_i64);
        let narrow = |name: &str| (name == "n").then_some(3_i64);
        assert!(cert.holds([3, 5, 1], &wide));
        assert!(!cert.holds([3, 5, 1], &narrow));
    }

    #[test]
    fn test_lanes_without_offsets_collide() {
        // Every lane of a [4] tile hits the same address.
        let cert = certificate(&AddressExpr::ProgramId(0), &[4]);
        let none = |_: &str| None;
        assert!(!cert.holds([2, 1, 1], &none));
    }

    #[test]
    fn test_outer_product_tile() {
        let rows = offs(4).expand_dims(1).unwrap();
        let cols = offs(8).expand_dims(0).unwrap();
        let address = rows * AddressExpr::scalar("ld") + cols + AddressExpr::ProgramId(0) * 32;
        let cert = certificate(&address, &[4, 8]);
        let ld = |name: &str| (name == "ld").then_some(8_i64);
        assert!(cert.holds([3, 1, 1], &ld));
    }

    #[test]
    fn test_repeated_affine_terms_are_summed() {
        let address = AddressExpr::ProgramId(0) * 2 + AddressExpr::ProgramId(0) * 3;
        let cert = certificate(&address, &[]);
        let coefficient = cert.terms[0].coefficient.eval_scalar(&|_| None);
        assert_eq!(coefficient, Some(5));
    }

    #[rstest]
    #[case(AddressExpr::ProgramId(0) % 4, NonAffineReason::Modulo)]
    #[case(AddressExpr::ProgramId(0) / 4, NonAffineReason::Division)]
    #[case(AddressExpr::ProgramId(0).min(AddressExpr::scalar("n")), NonAffineReason::Minimum)]
    #[case(AddressExpr::ProgramId(0) * AddressExpr::ProgramId(1), NonAffineReason::IndexProduct)]
    #[case(AddressExpr::ProgramId(0) * AddressExpr::ProgramId(0), NonAffineReason::Power)]
    fn test_non_affine(#[case] address: AddressExpr, #[case] reason: NonAffineReason) {
        assert_eq!(analyze_address(&address, &[]), Injectivity::NonAffine(reason));
    }

    #[test]
    fn test_index_free_division_is_a_coefficient() {
        let stride = (AddressExpr::scalar("n") + 3) / 4;
        let address = AddressExpr::ProgramId(0) * stride;
        assert!(matches!(analyze_address(&address, &[]), Injectivity::Affine(_)));
    }
}
