//! The kernel-language surface seen by a kernel body during tracing

use std::ops::Range;
use std::rc::Rc;

use log::trace;

use super::pointer::Pointer;
use super::state::TraceState;
use super::value::{TileOperand, TileValue};
use crate::error::{SourceLocation, TraceError};
use crate::ir::{AddressExpr, DType, Mask, ParamRole, WriteMode};

/// Ceiling division, as `tl.cdiv`.
///
/// # Panics
///
/// Panics if `b` is zero. Inside a kernel body prefer [`TileContext::cdiv`],
/// which fails the trace instead.
pub fn cdiv(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Handle passed to a kernel body; every primitive call is recorded.
pub struct TileContext {
    state: Rc<TraceState>,
}

impl TileContext {
    pub(crate) fn new(state: Rc<TraceState>) -> Self {
        Self { state }
    }

    #[track_caller]
    fn param(&self, name: &str, role: ParamRole) -> Option<usize> {
        let found = self
            .state
            .body()
            .signature
            .lookup(name)
            .map(|(index, p)| (index, p.role));
        match found {
            Some((index, actual)) if actual == role => Some(index),
            Some((_, actual)) => {
                self.state.record(TraceError::ParameterRole {
                    name: name.to_string(),
                    expected: role,
                    actual,
                    location: SourceLocation::caller(),
                });
                None
            }
            None => {
                self.state.record(TraceError::UnknownParameter {
                    name: name.to_string(),
                    location: SourceLocation::caller(),
                });
                None
            }
        }
    }

    #[track_caller]
    fn unsupported(&self, name: &str) {
        self.state.record(TraceError::UnsupportedOperation {
            name: name.to_string(),
            location: SourceLocation::caller(),
        });
    }

    // ------------------------------------------------------------------------
    // Arguments and indices
    // ------------------------------------------------------------------------

    #[track_caller]
    pub fn program_id(&self, axis: usize) -> AddressExpr {
        if axis > 2 {
            self.state.record(TraceError::ProgramAxis {
                axis,
                location: SourceLocation::caller(),
            });
            return AddressExpr::Const(0);
        }
        AddressExpr::ProgramId(axis)
    }

    #[track_caller]
    pub fn pointer(&self, name: &str) -> Pointer {
        let index = self.param(name, ParamRole::Pointer).unwrap_or(usize::MAX);
        Pointer::new(index, name)
    }

    #[track_caller]
    pub fn scalar(&self, name: &str) -> AddressExpr {
        self.param(name, ParamRole::Scalar);
        AddressExpr::scalar(name)
    }

    /// Value of a compile-time constant of the current specialization.
    #[track_caller]
    pub fn constexpr(&self, name: &str) -> i64 {
        if self.param(name, ParamRole::Constexpr).is_none() {
            return 1;
        }
        let value = self.state.body().specialization.constexprs.get(name).copied();
        match value {
            Some(value) => value,
            None => {
                self.state.record(TraceError::MissingConstexpr(name.to_string()));
                1
            }
        }
    }

    #[track_caller]
    pub fn arange(&self, start: i64, end: i64) -> AddressExpr {
        match AddressExpr::arange(start, end) {
            Ok(range) => range,
            Err(source) => {
                self.state.record(TraceError::Ir {
                    op: "arange",
                    source,
                    location: SourceLocation::caller(),
                });
                AddressExpr::Const(start)
            }
        }
    }

    /// Ceiling division of compile-time integers. A zero divisor, usually a
    /// block size constant set to 0, fails the trace.
    #[track_caller]
    pub fn cdiv(&self, a: i64, b: i64) -> i64 {
        if b == 0 {
            self.state.record(TraceError::ZeroDivisor {
                op: "cdiv",
                location: SourceLocation::caller(),
            });
            return 0;
        }
        cdiv(a, b)
    }

    /// Bounded loop, unrolled during tracing.
    #[track_caller]
    pub fn static_range(&self, start: i64, end: i64) -> Range<i64> {
        let iterations = (end - start).max(0) as u64;
        if self.state.failed() || !self.state.unroll(iterations) {
            return start..start;
        }
        trace!("unrolling {start}..{end}");
        start..end
    }

    // ------------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------------

    pub fn constant(&self, value: f64) -> TileValue {
        TileValue::scalar(&self.state, value)
    }

    #[track_caller]
    pub fn full(&self, shape: &[usize], value: f64, dtype: DType) -> TileValue {
        let id = self
            .state
            .emit("full", |body| Ok(body.constant(value, shape.to_vec(), dtype)));
        TileValue::from_node(&self.state, id)
    }

    #[track_caller]
    pub fn zeros(&self, shape: &[usize], dtype: DType) -> TileValue {
        self.full(shape, 0.0, dtype)
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    #[track_caller]
    fn load_access(&self, ptr: &Pointer, mask: Option<&Mask>, other: f64) -> TileValue {
        if self.state.failed() {
            return TileValue::poisoned(&self.state);
        }
        let address = ptr.offset.clone();
        let mask = mask.cloned();
        let id = self
            .state
            .emit("load", |body| body.load(ptr.param, address, mask, other));
        TileValue::from_node(&self.state, id)
    }

    #[track_caller]
    pub fn load(&self, ptr: &Pointer) -> TileValue {
        self.load_access(ptr, None, 0.0)
    }

    /// Load active lanes; masked-off lanes read `other`.
    #[track_caller]
    pub fn load_masked(&self, ptr: &Pointer, mask: &Mask, other: f64) -> TileValue {
        self.load_access(ptr, Some(mask), other)
    }

    #[track_caller]
    fn store_access(&self, ptr: &Pointer, value: &TileValue, mask: Option<&Mask>) {
        if self.state.failed() {
            return;
        }
        let dtype = self.state.body().pointer_type(ptr.param);
        let Some(value) = value.materialize(dtype) else {
            return;
        };
        let address = ptr.offset.clone();
        let mask = mask.cloned();
        self.state.emit("store", |body| {
            body.store(ptr.param, address, mask, value, WriteMode::Store)
        });
    }

    #[track_caller]
    pub fn store(&self, ptr: &Pointer, value: &TileValue) {
        self.store_access(ptr, value, None);
    }

    #[track_caller]
    pub fn store_masked(&self, ptr: &Pointer, value: &TileValue, mask: &Mask) {
        self.store_access(ptr, value, Some(mask));
    }

    // ------------------------------------------------------------------------
    // Arithmetic helpers mirroring the kernel language's free functions
    // ------------------------------------------------------------------------

    /// `where(cond, a, b)`
    #[track_caller]
    pub fn where_(&self, cond: &TileValue, a: impl TileOperand, b: impl TileOperand) -> TileValue {
        let a = a.into_tile(cond);
        let b = b.into_tile(cond);
        TileValue::select(cond, &a, &b)
    }

    #[track_caller]
    pub fn maximum(&self, a: &TileValue, b: impl TileOperand) -> TileValue {
        a.maximum(b)
    }

    #[track_caller]
    pub fn minimum(&self, a: &TileValue, b: impl TileOperand) -> TileValue {
        a.minimum(b)
    }

    #[track_caller]
    pub fn exp(&self, x: &TileValue) -> TileValue {
        x.exp()
    }

    #[track_caller]
    pub fn log(&self, x: &TileValue) -> TileValue {
        x.log()
    }

    #[track_caller]
    pub fn sqrt(&self, x: &TileValue) -> TileValue {
        x.sqrt()
    }

    #[track_caller]
    pub fn sum(&self, x: &TileValue, axis: usize) -> TileValue {
        x.sum(axis)
    }

    #[track_caller]
    pub fn max(&self, x: &TileValue, axis: usize) -> TileValue {
        x.max(axis)
    }

    #[track_caller]
    pub fn min(&self, x: &TileValue, axis: usize) -> TileValue {
        x.min(axis)
    }

    // ------------------------------------------------------------------------
    // Primitives without a trace handler
    // ------------------------------------------------------------------------

    /// Block matrix product. Not traceable; write it as a broadcasted
    /// multiply followed by `sum`.
    #[track_caller]
    pub fn dot(&self, _a: &TileValue, _b: &TileValue) -> TileValue {
        self.unsupported("dot");
        TileValue::poisoned(&self.state)
    }

    #[track_caller]
    pub fn atomic_add(&self, _ptr: &Pointer, _value: &TileValue) {
        self.unsupported("atomic_add");
    }

    #[track_caller]
    pub fn cumsum(&self, _x: &TileValue, _axis: usize) -> TileValue {
        self.unsupported("cumsum");
        TileValue::poisoned(&self.state)
    }

    /// Loop whose trip count depends on loaded data.
    #[track_caller]
    pub fn dynamic_range(&self, _bound: &TileValue) -> Range<i64> {
        self.unsupported("dynamic_range");
        0..0
    }

    /// Call into an external device library function.
    #[track_caller]
    pub fn extern_elementwise(&self, name: &str, _args: &[&TileValue]) -> TileValue {
        self.unsupported(&format!("extern_elementwise({name})"));
        TileValue::poisoned(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdiv() {
        assert_eq!(cdiv(64, 16), 4);
        assert_eq!(cdiv(65, 16), 5);
        assert_eq!(cdiv(1, 16), 1);
    }
}
