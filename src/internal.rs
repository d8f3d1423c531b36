//! The registry and the grace-period protocol.
//!
//! # Per-thread entries
//!
//! Every registered thread owns one `Entry` holding a single 64-bit word, the
//! grace-period-and-nesting counter. Bit 63 mirrors the global grace-period
//! bit as of the moment the thread entered its outermost critical section;
//! bits 0-62 count the nesting depth of critical sections. A zero nesting
//! count means the thread is quiescent.
//!
//! Only the owning thread writes its entry; `synchronize` reads every entry.
//!
//! # The global grace-period word
//!
//! A single bit at position 63, toggled under the writer mutex. The low bit
//! of the word is kept at 1 so that a reader entering its outermost critical
//! section can copy the whole word into its entry with one relaxed store,
//! simultaneously latching the grace-period bit and setting its nesting
//! count to 1.
//!
//! # Synchronize
//!
//! All ordering is borrowed from readers and produced lazily by the
//! expedited membarrier. `synchronize` brackets two toggle-and-wait passes
//! with process-wide barriers; after the second pass every registered thread
//! has demonstrably passed through a quiescent state since the first
//! barrier.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

use crate::membarrier;

/// Bit 63 of a grace-period-and-nesting word holds the grace-period bit.
pub(crate) const GP_BIT: u64 = 1 << 63;

/// The low 63 bits hold the nesting count.
pub(crate) const NESTING_MASK: u64 = !GP_BIT;

/// How long to sleep between polls of a still-active reader.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A registered thread's grace-period-and-nesting word.
pub(crate) struct Entry {
    /// Written only by the owning thread, with relaxed ordering.
    gpn: AtomicU64,

    /// Position in the registry. Read and written only under the registry
    /// lock; kept inside the entry so that unregistration is O(1).
    slot: AtomicUsize,
}

impl Entry {
    fn new() -> Entry {
        Entry {
            gpn: AtomicU64::new(0),
            slot: AtomicUsize::new(0),
        }
    }

    /// Enters a read-side critical section.
    ///
    /// The outermost entry copies the global word into the entry: one relaxed
    /// store that both latches the current grace-period bit and sets the
    /// nesting count to 1. Nested entries just bump the count.
    #[inline]
    pub(crate) fn read_lock(&self, global_gp: &AtomicU64) {
        let gpn = self.gpn.load(Ordering::Relaxed);
        if gpn & NESTING_MASK == 0 {
            self.gpn
                .store(global_gp.load(Ordering::Relaxed), Ordering::Relaxed);
        } else {
            self.gpn.store(gpn + 1, Ordering::Relaxed);
        }
        // Keep the compiler from hoisting critical-section reads above the
        // store. The CPU-level fence is issued by `synchronize` through the
        // membarrier on our behalf.
        core::sync::atomic::compiler_fence(Ordering::SeqCst);
    }

    /// Leaves the innermost read-side critical section.
    #[inline]
    pub(crate) fn read_unlock(&self) {
        core::sync::atomic::compiler_fence(Ordering::SeqCst);
        let gpn = self.gpn.load(Ordering::Relaxed);
        debug_assert_ne!(gpn & NESTING_MASK, 0, "unbalanced read_unlock");
        self.gpn.store(gpn - 1, Ordering::Relaxed);
    }

    /// Whether the owning thread is outside every critical section.
    #[inline]
    pub(crate) fn is_quiescent(&self) -> bool {
        self.gpn.load(Ordering::Relaxed) & NESTING_MASK == 0
    }
}

/// State shared by every handle to one RCU domain.
pub(crate) struct Global {
    /// The global grace-period word. Bit 63 is the grace-period bit; the low
    /// bit stays 1 (see the module docs). Written only under `registry`;
    /// read with relaxed ordering by readers.
    pub(crate) gp: CachePadded<AtomicU64>,

    /// The thread registry, doubling as the writer mutex: it guards the
    /// registry itself, all writes to `gp`, and serializes `synchronize`.
    registry: Mutex<Vec<Arc<CachePadded<Entry>>>>,
}

impl Global {
    pub(crate) fn new() -> Global {
        Global {
            gp: CachePadded::new(AtomicU64::new(1)),
            registry: Mutex::new(Vec::new()),
        }
    }

    /// Adds an entry for the calling thread and records its position.
    pub(crate) fn register(&self) -> Arc<CachePadded<Entry>> {
        let entry = Arc::new(CachePadded::new(Entry::new()));
        let mut registry = self.registry.lock().unwrap();
        entry.slot.store(registry.len(), Ordering::Relaxed);
        registry.push(entry.clone());
        entry
    }

    /// Removes `entry` from the registry.
    ///
    /// The owning thread must be quiescent. Removal swaps the last entry into
    /// the vacated slot and fixes up its recorded position, so positions stay
    /// valid across unrelated removals.
    pub(crate) fn unregister(&self, entry: &Arc<CachePadded<Entry>>) {
        debug_assert!(
            entry.is_quiescent(),
            "unregistering inside a critical section"
        );
        let mut registry = self.registry.lock().unwrap();
        let slot = entry.slot.load(Ordering::Relaxed);
        let removed = registry.swap_remove(slot);
        debug_assert!(Arc::ptr_eq(&removed, entry));
        if let Some(moved) = registry.get(slot) {
            moved.slot.store(slot, Ordering::Relaxed);
        }
    }

    /// Waits until every thread registered at the start of the call has
    /// passed through a quiescent state.
    ///
    /// Runs under the writer mutex, so calls are totally ordered and
    /// registration is blocked for the duration.
    pub(crate) fn synchronize(&self) {
        debug_assert!(membarrier::is_registered());
        let registry = self.registry.lock().unwrap();

        // Promote every reader's latest read_lock store to global visibility,
        // standing in for the fence the reader never issued.
        membarrier::all_threads();

        // After one toggle, a matching grace-period bit is ambiguous: the
        // thread may have latched it during the previous synchronize. The
        // second toggle excludes that, so a match then proves a fresh
        // quiescent state since the barrier above.
        self.toggle_and_wait(&registry);
        self.toggle_and_wait(&registry);

        // Make the drained critical sections' reads happen-before whatever
        // destruction the caller performs next.
        membarrier::all_threads();
    }

    /// Flips the grace-period bit, then waits for every registered thread to
    /// be quiescent or to have latched the new bit.
    fn toggle_and_wait(&self, registry: &[Arc<CachePadded<Entry>>]) {
        let gp = self.gp.load(Ordering::Relaxed) ^ GP_BIT;
        self.gp.store(gp, Ordering::Relaxed);

        for entry in registry {
            let backoff = Backoff::new();
            loop {
                let gpn = entry.gpn.load(Ordering::Relaxed);
                if gpn & NESTING_MASK == 0 || (gpn ^ gp) & GP_BIT == 0 {
                    break;
                }
                if backoff.is_completed() {
                    thread::sleep(POLL_INTERVAL);
                } else {
                    backoff.snooze();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_layout() {
        let global = Global::new();
        let entry = global.register();

        assert!(entry.is_quiescent());

        // Outermost entry latches the global word: nesting 1 plus the bit.
        entry.read_lock(&global.gp);
        let gpn = entry.gpn.load(Ordering::Relaxed);
        assert_eq!(gpn & NESTING_MASK, 1);
        assert_eq!(gpn & GP_BIT, global.gp.load(Ordering::Relaxed) & GP_BIT);

        // Nested entries only bump the count.
        entry.read_lock(&global.gp);
        entry.read_lock(&global.gp);
        assert_eq!(entry.gpn.load(Ordering::Relaxed) & NESTING_MASK, 3);

        entry.read_unlock();
        entry.read_unlock();
        entry.read_unlock();
        assert!(entry.is_quiescent());

        global.unregister(&entry);
    }

    #[test]
    fn latched_bit_follows_global() {
        let global = Global::new();
        let entry = global.register();

        let old = global.gp.load(Ordering::Relaxed);
        global.gp.store(old ^ GP_BIT, Ordering::Relaxed);

        entry.read_lock(&global.gp);
        let gpn = entry.gpn.load(Ordering::Relaxed);
        assert_eq!(gpn & GP_BIT, (old ^ GP_BIT) & GP_BIT);
        entry.read_unlock();

        global.unregister(&entry);
    }

    #[test]
    fn unregister_fixes_up_slots() {
        let global = Global::new();
        let a = global.register();
        let b = global.register();
        let c = global.register();

        assert_eq!(a.slot.load(Ordering::Relaxed), 0);
        assert_eq!(b.slot.load(Ordering::Relaxed), 1);
        assert_eq!(c.slot.load(Ordering::Relaxed), 2);

        // Removing the middle entry swaps the last one into its place.
        global.unregister(&b);
        assert_eq!(c.slot.load(Ordering::Relaxed), 1);
        assert_eq!(global.registry.lock().unwrap().len(), 2);

        global.unregister(&a);
        global.unregister(&c);
        assert!(global.registry.lock().unwrap().is_empty());
    }

    #[test]
    fn reregistration() {
        let global = Global::new();
        for _ in 0..3 {
            let entry = global.register();
            assert!(entry.is_quiescent());
            global.unregister(&entry);
        }
        assert!(global.registry.lock().unwrap().is_empty());
    }
}
