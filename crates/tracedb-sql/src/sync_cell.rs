//! A narrowly-scoped `Sync` assertion for sharing the embedded connection
//! and string pool with `rusqlite` callback registries (scalar functions,
//! virtual-table modules) that require `Send + Sync + 'static` aux data.
//!
//! `rusqlite::Connection` is `Send` but not `Sync` — it is safe to move
//! between threads but not to access from two threads at once, which is a
//! conservative default `rusqlite` applies regardless of how the connection
//! is actually used. This crate's execution model (§5) is single-threaded
//! and cooperative: statements never run concurrently, and a scalar
//! function or a virtual-table cursor that re-enters the same connection
//! does so from the same call stack, never from a second thread. The `Sync`
//! bound `rusqlite` requires on aux/closure types is therefore a pure
//! compile-time technicality here, not a real concurrency guarantee that
//! needs enforcing with a lock.
//!
//! A `Mutex` was considered and rejected: `std::sync::Mutex` is not
//! reentrant, and the spec explicitly requires supporting nested/recursive
//! `Execute` calls (a virtual-table cursor's `Filter` running a query that
//! itself calls a registered scalar function, for instance). Locking would
//! deadlock on exactly the re-entrant calls this engine is built to
//! support. `SyncCell` instead hands out references directly, trusting the
//! caller to respect the single-threaded, non-overlapping-`&mut` discipline
//! the rest of this crate already follows.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;

/// Wraps `T` and unsafely asserts `Sync`, so it can be captured by a
/// `Send + Sync + 'static` closure or aux-data type without requiring `T`
/// itself to support concurrent access. See the module doc for the safety
/// argument and its limits.
pub struct SyncCell<T>(UnsafeCell<T>);

// SAFETY: this crate's execution model is single-threaded and cooperative
// (spec §5); no two holders of a `SyncCell<T>` ever call `get`/`get_mut`
// concurrently from different OS threads. Callers must still avoid holding
// a `&mut T` from `get_mut` across a call that might re-enter and request
// another `&mut T` for the same cell — there is no runtime check for that,
// only the discipline already followed by every caller in this crate (a
// borrow from `get_mut` is used immediately and dropped before the next
// potentially-reentrant SQLite step).
unsafe impl<T> Sync for SyncCell<T> {}

impl<T> SyncCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// A shared reference to the wrapped value. Any number of these may be
    /// live at once, including nested/reentrant ones, since shared
    /// references never alias exclusively.
    pub fn get(&self) -> &T {
        // SAFETY: shared references to the same `T` may always coexist.
        unsafe { &*self.0.get() }
    }

    /// An exclusive reference to the wrapped value. Callers must not hold
    /// the returned reference across a call that could reenter and request
    /// another reference (shared or exclusive) to the same cell.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut T {
        // SAFETY: upheld by caller discipline, not by the type system; see
        // the module-level safety note.
        unsafe { &mut *self.0.get() }
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SyncCell").field(self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mut_allows_mutation_through_a_shared_reference() {
        let cell = SyncCell::new(1i32);
        *cell.get_mut() += 41;
        assert_eq!(*cell.get(), 42);
    }

    #[test]
    fn is_sync() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<SyncCell<Vec<u8>>>();
    }
}
