//! Durable Operation Context
//!
//! The hash index does not log its own changes. Every mutation is bracketed
//! by a component of the caller's atomic operation, which owns durability
//! and rollback.

use crate::error::Result;

/// Opaque durable-operation context supplied by the caller.
///
/// `end_component` receives `rollback = true` when the bracketed mutation
/// failed.
pub trait AtomicOperation {
    fn start_component(&self, name: &str);

    fn end_component(&self, name: &str, rollback: bool);
}

/// Context for callers without a write-ahead log
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAtomicOperation;

impl AtomicOperation for NoopAtomicOperation {
    fn start_component(&self, _name: &str) {}

    fn end_component(&self, _name: &str, _rollback: bool) {}
}

/// Run `f` as one component of `op`, rolling back on error
pub(crate) fn in_component<A, T, F>(op: &A, name: &str, f: F) -> Result<T>
where
    A: AtomicOperation + ?Sized,
    F: FnOnce() -> Result<T>,
{
    op.start_component(name);
    let result = f();
    op.end_component(name, result.is_err());
    result
}
