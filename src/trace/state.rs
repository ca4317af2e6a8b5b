use std::cell::{Cell, Ref, RefCell};

use log::debug;

use crate::error::{IrError, SourceLocation, TraceError};
use crate::ir::{KernelBody, NodeId};

/// Shared state of one trace: the body under construction and the first error.
///
/// Traced values hold an `Rc` to this state so that operator overloads can
/// append nodes. Errors are sticky: once one is recorded, every later
/// operation is a no-op and the trace fails when the kernel body returns.
pub(crate) struct TraceState {
    body: RefCell<KernelBody>,
    error: RefCell<Option<TraceError>>,
    unrolled: Cell<u64>,
    max_unroll: u64,
}

impl TraceState {
    pub(crate) fn new(body: KernelBody, max_unroll: u64) -> Self {
        Self {
            body: RefCell::new(body),
            error: RefCell::new(None),
            unrolled: Cell::new(0),
            max_unroll,
        }
    }

    pub(crate) fn body(&self) -> Ref<'_, KernelBody> {
        self.body.borrow()
    }

    pub(crate) fn failed(&self) -> bool {
        self.error.borrow().is_some()
    }

    /// Record an error unless an earlier one is already pending.
    pub(crate) fn record(&self, err: TraceError) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            debug!("trace of `{}` failed: {err}", self.body.borrow().name);
            *slot = Some(err);
        }
    }

    /// Append nodes through `build`, recording a failure at the caller's location.
    #[track_caller]
    pub(crate) fn emit(
        &self,
        op: &'static str,
        build: impl FnOnce(&mut KernelBody) -> Result<NodeId, IrError>,
    ) -> Option<NodeId> {
        if self.failed() {
            return None;
        }
        let result = build(&mut self.body.borrow_mut());
        match result {
            Ok(id) => Some(id),
            Err(source) => {
                self.record(TraceError::Ir {
                    op,
                    source,
                    location: SourceLocation::caller(),
                });
                None
            }
        }
    }

    /// Count unrolled loop iterations; returns false once the limit is exceeded.
    #[track_caller]
    pub(crate) fn unroll(&self, iterations: u64) -> bool {
        let total = self.unrolled.get().saturating_add(iterations);
        self.unrolled.set(total);
        if total > self.max_unroll {
            self.record(TraceError::UnrollLimit {
                limit: self.max_unroll,
                location: SourceLocation::caller(),
            });
            return false;
        }
        true
    }

    pub(crate) fn unrolled(&self) -> u64 {
        self.unrolled.get()
    }

    /// Hand out the finished body, or the first recorded error.
    pub(crate) fn finish(&self) -> Result<KernelBody, TraceError> {
        if let Some(err) = self.error.borrow_mut().take() {
            return Err(err);
        }
        Ok(std::mem::take(&mut *self.body.borrow_mut()))
    }
}
