use std::ops::{Add, AddAssign};

use crate::ir::AddressExpr;

/// A pointer argument plus a symbolic element offset.
///
/// `a_ptr + offs` and `a_ptrs += stride` work as in the kernel language; the
/// accumulated offset becomes the address of the next load or store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub(crate) param: usize,
    pub(crate) name: String,
    pub(crate) offset: AddressExpr,
}

impl Pointer {
    pub(crate) fn new(param: usize, name: &str) -> Self {
        Self {
            param,
            name: name.to_string(),
            offset: AddressExpr::Const(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> &AddressExpr {
        &self.offset
    }
}

impl<T: Into<AddressExpr>> Add<T> for Pointer {
    type Output = Pointer;
    fn add(mut self, rhs: T) -> Pointer {
        self.offset += rhs.into();
        self
    }
}

impl<T: Into<AddressExpr>> Add<T> for &Pointer {
    type Output = Pointer;
    fn add(self, rhs: T) -> Pointer {
        self.clone() + rhs
    }
}

impl<T: Into<AddressExpr>> AddAssign<T> for Pointer {
    fn add_assign(&mut self, rhs: T) {
        self.offset += rhs.into();
    }
}
