//! The RCU domain and per-thread registration handles.

use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::guard::ReadGuard;
use crate::internal::{Entry, Global};
use crate::membarrier;

/// An RCU domain: a thread registry plus one grace-period word.
///
/// Cloning an `Rcu` produces another handle to the same domain. Independent
/// domains may coexist in one process; the membarrier they rely on is
/// inherently process-wide and shared.
///
/// # Examples
///
/// ```
/// use membarrier_rcu::Rcu;
///
/// if membarrier_rcu::register_process() {
///     let rcu = Rcu::new();
///     let handle = rcu.register();
///
///     {
///         let _guard = handle.read_lock();
///         // read shared data here
///     }
///
///     // wait for every reader that could still see old data
///     rcu.synchronize();
/// }
/// ```
pub struct Rcu {
    pub(crate) global: Arc<Global>,
}

impl Rcu {
    /// Creates a new RCU domain.
    ///
    /// [`register_process`](crate::register_process) must have returned
    /// `true` before the domain is used.
    pub fn new() -> Rcu {
        Rcu {
            global: Arc::new(Global::new()),
        }
    }

    /// Registers the calling thread as a participant.
    ///
    /// The thread stays registered until the returned handle is dropped.
    /// Registration blocks while a [`synchronize`](Rcu::synchronize) is in
    /// flight, so a new thread can never hold a reference to data unlinked
    /// before it joined.
    pub fn register(&self) -> LocalHandle {
        debug_assert!(membarrier::is_registered(), "register_process has not succeeded");
        LocalHandle {
            entry: self.global.register(),
            rcu: self.clone(),
            _marker: PhantomData,
        }
    }

    /// Waits until every registered thread has passed through a quiescent
    /// state, so that anything unlinked before this call can be destroyed
    /// after it returns.
    ///
    /// Writers are globally serialized: at most one `synchronize` runs at a
    /// time, and registration waits for it. Must not be called from inside a
    /// read-side critical section on the same domain, or it deadlocks on the
    /// caller's own entry.
    pub fn synchronize(&self) {
        self.global.synchronize();
    }
}

impl Clone for Rcu {
    /// Creates another handle to the same domain.
    fn clone(&self) -> Rcu {
        Rcu {
            global: self.global.clone(),
        }
    }
}

impl Default for Rcu {
    fn default() -> Rcu {
        Rcu::new()
    }
}

impl PartialEq for Rcu {
    /// Checks whether both handles point to the same domain.
    fn eq(&self, rhs: &Rcu) -> bool {
        Arc::ptr_eq(&self.global, &rhs.global)
    }
}

impl Eq for Rcu {}

impl fmt::Debug for Rcu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Rcu { .. }")
    }
}

/// A thread's registration in an RCU domain.
///
/// Owned by exactly one thread (`LocalHandle` is neither `Send` nor `Sync`):
/// the grace-period-and-nesting word behind it is written with plain relaxed
/// stores that are only sound single-writer. Dropping the handle unregisters
/// the thread; the borrow held by [`ReadGuard`] guarantees that can only
/// happen in a quiescent state.
pub struct LocalHandle {
    pub(crate) entry: Arc<CachePadded<Entry>>,
    rcu: Rcu,
    _marker: PhantomData<*mut ()>,
}

impl LocalHandle {
    /// Enters a read-side critical section.
    ///
    /// Never blocks, never allocates, never issues a syscall or a fence: two
    /// relaxed memory operations in total. Critical sections nest; every
    /// pointer read from a shared structure stays valid until the outermost
    /// guard is dropped.
    #[inline]
    pub fn read_lock(&self) -> ReadGuard<'_> {
        self.entry.read_lock(&self.rcu.global.gp);
        ReadGuard::new(self)
    }

    /// Whether this thread is outside every read-side critical section.
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        self.entry.is_quiescent()
    }

    /// The domain this handle is registered in.
    #[inline]
    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        self.rcu.global.unregister(&self.entry);
    }
}

impl fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("LocalHandle { .. }")
    }
}
