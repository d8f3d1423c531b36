//! Witness of a read-side critical section.

use core::fmt;

use crate::collector::LocalHandle;

/// Keeps the owning thread inside a read-side critical section.
///
/// Returned by [`LocalHandle::read_lock`]; dropping it leaves the innermost
/// critical section. Guards nest freely on one thread, and a stack of nested
/// guards is equivalent to a single critical section spanning the outermost
/// pair.
///
/// Critical sections must be bounded: a guard held forever stalls every
/// writer in [`synchronize`](crate::Rcu::synchronize).
pub struct ReadGuard<'a> {
    handle: &'a LocalHandle,
}

impl<'a> ReadGuard<'a> {
    pub(crate) fn new(handle: &'a LocalHandle) -> ReadGuard<'a> {
        ReadGuard { handle }
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.handle.entry.read_unlock();
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ReadGuard { .. }")
    }
}
