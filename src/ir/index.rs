//! Symbolic address expressions and masks
//!
//! An [`AddressExpr`] is built from program ids, tile ranges, scalar
//! arguments and integer constants. It describes the element offsets a load
//! or store touches, lane by lane. Two accesses alias structurally when their
//! expressions are equal.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitOr, Div, Mul, Neg, Not, Rem, Sub};

use serde::{Deserialize, Serialize};

use super::node::CmpKind;
use super::shape::broadcast_shapes;
use crate::error::IrError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressExpr {
    Const(i64),
    /// Program id along grid axis 0, 1 or 2.
    ProgramId(usize),
    /// Runtime integer argument, e.g. a stride.
    Scalar(String),
    /// `0..len` laid out along `axis` of a tile of rank `rank`.
    Range {
        len: usize,
        axis: usize,
        rank: usize,
    },
    Add(Box<Self>, Box<Self>),
    Mul(Box<Self>, Box<Self>),
    /// Floor division.
    FloorDiv(Box<Self>, Box<Self>),
    /// Remainder with the sign of the divisor.
    Rem(Box<Self>, Box<Self>),
    Min(Box<Self>, Box<Self>),
}

impl fmt::Display for AddressExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressExpr::Const(c) => write!(f, "{c}"),
            AddressExpr::ProgramId(axis) => write!(f, "pid{axis}"),
            AddressExpr::Scalar(name) => write!(f, "{name}"),
            AddressExpr::Range { len, axis, rank } => {
                write!(f, "arange({len})")?;
                if *rank > 1 {
                    let dims: Vec<&str> = (0..*rank)
                        .map(|d| if d == *axis { ":" } else { "None" })
                        .collect();
                    write!(f, "[{}]", dims.join(", "))?;
                }
                Ok(())
            }
            AddressExpr::Add(l, r) => match r.as_ref() {
                AddressExpr::Mul(c, e) if **c == AddressExpr::Const(-1) => {
                    write!(f, "({l} - {e})")
                }
                _ => write!(f, "({l} + {r})"),
            },
            AddressExpr::Mul(l, r) => write!(f, "({l} * {r})"),
            AddressExpr::FloorDiv(l, r) => write!(f, "({l} // {r})"),
            AddressExpr::Rem(l, r) => write!(f, "({l} % {r})"),
            AddressExpr::Min(l, r) => write!(f, "min({l}, {r})"),
        }
    }
}

/// Floor division on integers.
pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Remainder matching [`floor_div`].
pub fn floor_rem(a: i64, b: i64) -> i64 {
    a - b * floor_div(a, b)
}

impl AddressExpr {
    pub fn scalar(name: &str) -> Self {
        AddressExpr::Scalar(name.to_string())
    }

    /// `start..end` as a rank-1 tile.
    pub fn arange(start: i64, end: i64) -> Result<Self, IrError> {
        if end <= start {
            return Err(IrError::EmptyRange { start, end });
        }
        let range = AddressExpr::Range {
            len: (end - start) as usize,
            axis: 0,
            rank: 1,
        };
        Ok(AddressExpr::Const(start) + range)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, AddressExpr::Const(0))
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            AddressExpr::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// Tile shape of the offsets this expression produces.
    pub fn shape(&self) -> Result<Vec<usize>, IrError> {
        match self {
            AddressExpr::Const(_) | AddressExpr::ProgramId(_) | AddressExpr::Scalar(_) => {
                Ok(vec![])
            }
            AddressExpr::Range { len, axis, rank } => {
                let mut shape = vec![1; *rank];
                shape[*axis] = *len;
                Ok(shape)
            }
            AddressExpr::Add(l, r)
            | AddressExpr::Mul(l, r)
            | AddressExpr::FloorDiv(l, r)
            | AddressExpr::Rem(l, r)
            | AddressExpr::Min(l, r) => broadcast_shapes(&l.shape()?, &r.shape()?),
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            AddressExpr::Const(_) | AddressExpr::ProgramId(_) | AddressExpr::Scalar(_) => 0,
            AddressExpr::Range { rank, .. } => *rank,
            AddressExpr::Add(l, r)
            | AddressExpr::Mul(l, r)
            | AddressExpr::FloorDiv(l, r)
            | AddressExpr::Rem(l, r)
            | AddressExpr::Min(l, r) => l.rank().max(r.rank()),
        }
    }

    /// Insert a unit dimension at `axis`, like `offs[:, None]`.
    pub fn expand_dims(&self, axis: usize) -> Result<Self, IrError> {
        let frame = self.rank();
        if axis > frame {
            return Err(IrError::Axis { axis, rank: frame });
        }
        Ok(self.expand_in(axis, frame))
    }

    fn expand_in(&self, at: usize, frame: usize) -> Self {
        match self {
            AddressExpr::Range { len, axis, rank } => {
                let full_axis = frame - rank + axis;
                AddressExpr::Range {
                    len: *len,
                    axis: if full_axis >= at { full_axis + 1 } else { full_axis },
                    rank: frame + 1,
                }
            }
            AddressExpr::Const(_) | AddressExpr::ProgramId(_) | AddressExpr::Scalar(_) => {
                self.clone()
            }
            AddressExpr::Add(l, r) => {
                AddressExpr::Add(Box::new(l.expand_in(at, frame)), Box::new(r.expand_in(at, frame)))
            }
            AddressExpr::Mul(l, r) => {
                AddressExpr::Mul(Box::new(l.expand_in(at, frame)), Box::new(r.expand_in(at, frame)))
            }
            AddressExpr::FloorDiv(l, r) => AddressExpr::FloorDiv(
                Box::new(l.expand_in(at, frame)),
                Box::new(r.expand_in(at, frame)),
            ),
            AddressExpr::Rem(l, r) => {
                AddressExpr::Rem(Box::new(l.expand_in(at, frame)), Box::new(r.expand_in(at, frame)))
            }
            AddressExpr::Min(l, r) => {
                AddressExpr::Min(Box::new(l.expand_in(at, frame)), Box::new(r.expand_in(at, frame)))
            }
        }
    }

    /// True if the expression has the same value on every lane of every program.
    pub fn is_index_free(&self) -> bool {
        match self {
            AddressExpr::Const(_) | AddressExpr::Scalar(_) => true,
            AddressExpr::ProgramId(_) | AddressExpr::Range { .. } => false,
            AddressExpr::Add(l, r)
            | AddressExpr::Mul(l, r)
            | AddressExpr::FloorDiv(l, r)
            | AddressExpr::Rem(l, r)
            | AddressExpr::Min(l, r) => l.is_index_free() && r.is_index_free(),
        }
    }

    pub fn collect_scalars(&self, out: &mut BTreeSet<String>) {
        match self {
            AddressExpr::Scalar(name) => {
                out.insert(name.clone());
            }
            AddressExpr::Const(_) | AddressExpr::ProgramId(_) | AddressExpr::Range { .. } => {}
            AddressExpr::Add(l, r)
            | AddressExpr::Mul(l, r)
            | AddressExpr::FloorDiv(l, r)
            | AddressExpr::Rem(l, r)
            | AddressExpr::Min(l, r) => {
                l.collect_scalars(out);
                r.collect_scalars(out);
            }
        }
    }

    /// Evaluate an index-free expression. Returns `None` for program ids,
    /// ranges, unbound scalars or division by zero.
    pub fn eval_scalar(&self, lookup: &dyn Fn(&str) -> Option<i64>) -> Option<i64> {
        match self {
            AddressExpr::Const(c) => Some(*c),
            AddressExpr::Scalar(name) => lookup(name),
            AddressExpr::ProgramId(_) | AddressExpr::Range { .. } => None,
            AddressExpr::Add(l, r) => Some(l.eval_scalar(lookup)? + r.eval_scalar(lookup)?),
            AddressExpr::Mul(l, r) => Some(l.eval_scalar(lookup)? * r.eval_scalar(lookup)?),
            AddressExpr::FloorDiv(l, r) => {
                let (a, b) = (l.eval_scalar(lookup)?, r.eval_scalar(lookup)?);
                (b != 0).then(|| floor_div(a, b))
            }
            AddressExpr::Rem(l, r) => {
                let (a, b) = (l.eval_scalar(lookup)?, r.eval_scalar(lookup)?);
                (b != 0).then(|| floor_rem(a, b))
            }
            AddressExpr::Min(l, r) => Some(l.eval_scalar(lookup)?.min(r.eval_scalar(lookup)?)),
        }
    }

    /// Floor division `self // rhs`.
    pub fn floor_div(self, rhs: impl Into<AddressExpr>) -> Self {
        match (self, rhs.into()) {
            (AddressExpr::Const(a), AddressExpr::Const(b)) if b != 0 => {
                AddressExpr::Const(floor_div(a, b))
            }
            (e, AddressExpr::Const(1)) => e,
            (l, r) => AddressExpr::FloorDiv(Box::new(l), Box::new(r)),
        }
    }

    pub fn min(self, rhs: impl Into<AddressExpr>) -> Self {
        match (self, rhs.into()) {
            (AddressExpr::Const(a), AddressExpr::Const(b)) => AddressExpr::Const(a.min(b)),
            (l, r) if l == r => l,
            (l, r) => AddressExpr::Min(Box::new(l), Box::new(r)),
        }
    }

    pub fn lt(&self, rhs: impl Into<AddressExpr>) -> Mask {
        Mask::cmp(CmpKind::Lt, self.clone(), rhs.into())
    }

    pub fn le(&self, rhs: impl Into<AddressExpr>) -> Mask {
        Mask::cmp(CmpKind::Le, self.clone(), rhs.into())
    }

    pub fn gt(&self, rhs: impl Into<AddressExpr>) -> Mask {
        Mask::cmp(CmpKind::Gt, self.clone(), rhs.into())
    }

    pub fn ge(&self, rhs: impl Into<AddressExpr>) -> Mask {
        Mask::cmp(CmpKind::Ge, self.clone(), rhs.into())
    }

    pub fn equals(&self, rhs: impl Into<AddressExpr>) -> Mask {
        Mask::cmp(CmpKind::Eq, self.clone(), rhs.into())
    }
}

fn add_exprs(lhs: AddressExpr, rhs: AddressExpr) -> AddressExpr {
    match (lhs, rhs) {
        (AddressExpr::Const(a), AddressExpr::Const(b)) => AddressExpr::Const(a + b),
        (AddressExpr::Const(0), e) | (e, AddressExpr::Const(0)) => e,
        (l, r) => AddressExpr::Add(Box::new(l), Box::new(r)),
    }
}

fn mul_exprs(lhs: AddressExpr, rhs: AddressExpr) -> AddressExpr {
    match (lhs, rhs) {
        (AddressExpr::Const(a), AddressExpr::Const(b)) => AddressExpr::Const(a * b),
        (AddressExpr::Const(1), e) | (e, AddressExpr::Const(1)) => e,
        // Only fold away rank-0 factors; a zero tile keeps its shape.
        (AddressExpr::Const(0), e) | (e, AddressExpr::Const(0)) if e.rank() == 0 => {
            AddressExpr::Const(0)
        }
        (l, r) => AddressExpr::Mul(Box::new(l), Box::new(r)),
    }
}

fn rem_exprs(lhs: AddressExpr, rhs: AddressExpr) -> AddressExpr {
    match (lhs, rhs) {
        (AddressExpr::Const(a), AddressExpr::Const(b)) if b != 0 => AddressExpr::Const(floor_rem(a, b)),
        (l, r) => AddressExpr::Rem(Box::new(l), Box::new(r)),
    }
}

macro_rules! impl_from_integer_for_address {
    ($($t:ty),*) => {
        $(
            impl From<$t> for AddressExpr {
                fn from(n: $t) -> Self {
                    AddressExpr::Const(n as i64)
                }
            }
        )*
    };
}

impl_from_integer_for_address!(i32, i64, u32, usize);

impl From<&AddressExpr> for AddressExpr {
    fn from(expr: &AddressExpr) -> Self {
        expr.clone()
    }
}

macro_rules! impl_address_binary_op {
    ($trait:ident, $fname:ident, $build:expr) => {
        impl<T: Into<AddressExpr>> $trait<T> for AddressExpr {
            type Output = AddressExpr;
            fn $fname(self, rhs: T) -> Self::Output {
                $build(self, rhs.into())
            }
        }

        impl<T: Into<AddressExpr>> $trait<T> for &AddressExpr {
            type Output = AddressExpr;
            fn $fname(self, rhs: T) -> Self::Output {
                $build(self.clone(), rhs.into())
            }
        }
    };
}

impl_address_binary_op!(Add, add, add_exprs);
impl_address_binary_op!(Sub, sub, |l: AddressExpr, r: AddressExpr| {
    add_exprs(l, mul_exprs(AddressExpr::Const(-1), r))
});
impl_address_binary_op!(Mul, mul, mul_exprs);
impl_address_binary_op!(Div, div, |l: AddressExpr, r: AddressExpr| l.floor_div(r));
impl_address_binary_op!(Rem, rem, rem_exprs);

impl<T: Into<AddressExpr>> AddAssign<T> for AddressExpr {
    fn add_assign(&mut self, rhs: T) {
        *self = add_exprs(self.clone(), rhs.into());
    }
}

impl Neg for AddressExpr {
    type Output = AddressExpr;
    fn neg(self) -> Self::Output {
        mul_exprs(AddressExpr::Const(-1), self)
    }
}

impl Neg for &AddressExpr {
    type Output = AddressExpr;
    fn neg(self) -> Self::Output {
        -self.clone()
    }
}

macro_rules! impl_integer_lhs_ops {
    ($($t:ty),*) => {
        $(
            impl Add<AddressExpr> for $t {
                type Output = AddressExpr;
                fn add(self, rhs: AddressExpr) -> AddressExpr {
                    add_exprs(AddressExpr::from(self), rhs)
                }
            }

            impl Add<&AddressExpr> for $t {
                type Output = AddressExpr;
                fn add(self, rhs: &AddressExpr) -> AddressExpr {
                    add_exprs(AddressExpr::from(self), rhs.clone())
                }
            }

            impl Mul<AddressExpr> for $t {
                type Output = AddressExpr;
                fn mul(self, rhs: AddressExpr) -> AddressExpr {
                    mul_exprs(AddressExpr::from(self), rhs)
                }
            }

            impl Mul<&AddressExpr> for $t {
                type Output = AddressExpr;
                fn mul(self, rhs: &AddressExpr) -> AddressExpr {
                    mul_exprs(AddressExpr::from(self), rhs.clone())
                }
            }
        )*
    };
}

impl_integer_lhs_ops!(i64, usize);

/// Boolean lane mask over address expressions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mask {
    Cmp {
        op: CmpKind,
        lhs: AddressExpr,
        rhs: AddressExpr,
    },
    And(Box<Mask>, Box<Mask>),
    Or(Box<Mask>, Box<Mask>),
    Not(Box<Mask>),
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mask::Cmp { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Mask::And(l, r) => write!(f, "({l} & {r})"),
            Mask::Or(l, r) => write!(f, "({l} | {r})"),
            Mask::Not(m) => write!(f, "~{m}"),
        }
    }
}

impl Mask {
    pub fn cmp(op: CmpKind, lhs: AddressExpr, rhs: AddressExpr) -> Self {
        Mask::Cmp { op, lhs, rhs }
    }

    pub fn shape(&self) -> Result<Vec<usize>, IrError> {
        match self {
            Mask::Cmp { lhs, rhs, .. } => broadcast_shapes(&lhs.shape()?, &rhs.shape()?),
            Mask::And(l, r) | Mask::Or(l, r) => broadcast_shapes(&l.shape()?, &r.shape()?),
            Mask::Not(m) => m.shape(),
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            Mask::Cmp { lhs, rhs, .. } => lhs.rank().max(rhs.rank()),
            Mask::And(l, r) | Mask::Or(l, r) => l.rank().max(r.rank()),
            Mask::Not(m) => m.rank(),
        }
    }

    pub fn expand_dims(&self, axis: usize) -> Result<Self, IrError> {
        let frame = self.rank();
        if axis > frame {
            return Err(IrError::Axis { axis, rank: frame });
        }
        Ok(self.expand_in(axis, frame))
    }

    fn expand_in(&self, at: usize, frame: usize) -> Self {
        match self {
            Mask::Cmp { op, lhs, rhs } => Mask::Cmp {
                op: *op,
                lhs: lhs.expand_in(at, frame),
                rhs: rhs.expand_in(at, frame),
            },
            Mask::And(l, r) => {
                Mask::And(Box::new(l.expand_in(at, frame)), Box::new(r.expand_in(at, frame)))
            }
            Mask::Or(l, r) => {
                Mask::Or(Box::new(l.expand_in(at, frame)), Box::new(r.expand_in(at, frame)))
            }
            Mask::Not(m) => Mask::Not(Box::new(m.expand_in(at, frame))),
        }
    }
}

impl BitAnd for Mask {
    type Output = Mask;
    fn bitand(self, rhs: Mask) -> Mask {
        Mask::And(Box::new(self), Box::new(rhs))
    }
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask::Or(Box::new(self), Box::new(rhs))
    }
}

impl Not for Mask {
    type Output = Mask;
    fn not(self) -> Mask {
        Mask::Not(Box::new(self))
    }
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

    #[rstest]
    #[case(AddressExpr::Const(1) + 2, AddressExpr::Const(3))]
    #[case(AddressExpr::scalar("s") + 0, AddressExpr::scalar("s"))]
    #[case(AddressExpr::scalar("s") * 1, AddressExpr::scalar("s"))]
    #[case(AddressExpr::scalar("s") * 0, AddressExpr::Const(0))]
    #[case(AddressExpr::Const(-7) / 2, AddressExpr::Const(-4))]
    #[case(AddressExpr::Const(-7) % 3, AddressExpr::Const(2))]
    #[case(AddressExpr::Const(5).min(3), AddressExpr::Const(3))]
    fn test_folding(#[case] expr: AddressExpr, #[case] expected: AddressExpr) {
        assert_eq!(expr, expected);
    }

    #[test]
    fn test_zero_times_range_keeps_shape() {
        let expr = offs(4) * 0;
        assert_eq!(expr.shape().unwrap(), vec![4]);
    }

    #[rstest]
    #[case(AddressExpr::ProgramId(0) * AddressExpr::scalar("stride"), "(pid0 * stride)")]
    #[case(AddressExpr::scalar("a") - AddressExpr::scalar("b"), "(a - b)")]
    #[case(offs(16), "arange(16)")]
    #[case(offs(16).expand_dims(1).unwrap(), "arange(16)[:, None]")]
    #[case(AddressExpr::ProgramId(1) % 3, "(pid1 % 3)")]
    fn test_display(#[case] expr: AddressExpr, #[case] expected: &str) {
        assert_eq!(expr.to_string(), expected);
    }

    #[test]
    fn test_expand_dims_outer_product() {
        let rows = offs(4).expand_dims(1).unwrap();
        let cols = offs(8).expand_dims(0).unwrap();
        assert_eq!(rows.shape().unwrap(), vec![4, 1]);
        assert_eq!(cols.shape().unwrap(), vec![1, 8]);
        let grid = &rows * AddressExpr::scalar("ld") + &cols;
        assert_eq!(grid.shape().unwrap(), vec![4, 8]);

        // Expanding a mixed-rank expression re-indexes every range.
        let cube = grid.expand_dims(1).unwrap();
        assert_eq!(cube.shape().unwrap(), vec![4, 1, 8]);
    }

    #[test]
    fn test_expand_dims_out_of_range() {
        assert!(offs(4).expand_dims(2).is_err());
    }

    #[test]
    fn test_arange() {
        let expr = AddressExpr::arange(2, 6).unwrap();
        assert_eq!(expr.shape().unwrap(), vec![4]);
        assert!(AddressExpr::arange(3, 3).is_err());
    }

    #[test]
    fn test_eval_scalar() {
        let expr = (AddressExpr::scalar("n") + 15) / 16;
        let lookup = |name: &str| (name == "n").then_some(40_i64);
        assert_eq!(expr.eval_scalar(&lookup), Some(3));
        assert_eq!(AddressExpr::ProgramId(0).eval_scalar(&lookup), None);
        assert_eq!(AddressExpr::scalar("m").eval_scalar(&lookup), None);
    }

    #[test]
    fn test_mask_shape() {
        let mask = offs(4).expand_dims(1).unwrap().lt(3) & offs(8).expand_dims(0).unwrap().lt(5);
        assert_eq!(mask.shape().unwrap(), vec![4, 8]);
        assert_eq!(mask.expand_dims(2).unwrap().shape().unwrap(), vec![4, 8, 1]);
    }

    #[test]
    fn test_floor_helpers() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-1, 4), -1);
        assert_eq!(floor_rem(-1, 4), 3);
        assert_eq!(floor_rem(9, 4), 1);
    }
}
