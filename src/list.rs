//! A lock-free singly-linked LIFO list protected by RCU.
//!
//! The simplest consumer of the grace-period machinery: push and pop are
//! Treiber-stack CAS loops, and every CAS is wrapped in a read-side critical
//! section. That wrapping is what makes the CAS sound. A head pointer
//! observed inside the critical section cannot have been popped, freed, and
//! reallocated in the meantime, because freeing waits for this thread to go
//! quiescent — so a successful compare-exchange really did see an unchanged
//! node, not a recycled address.
//!
//! Node removal follows Michael's list-based-set scheme: the low bit of a
//! node's `next` pointer is its deletion mark. A claimant first sets the mark
//! with a compare-exchange, which freezes the word for good, and only then
//! swings the predecessor link past the node. Unlinking compare-exchanges
//! always expect an unmarked pointer, so a claimed node can never be used as
//! a predecessor again — the mark is what proves the predecessor is still
//! live when an unlink commits.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::collector::{LocalHandle, Rcu};
use crate::garbage::{GarbageCollector, Reclaim};

/// The low bit of a `next` pointer marks the node as logically deleted.
const MARK: usize = 1;

fn marked(ptr: *mut Node) -> bool {
    ptr as usize & MARK != 0
}

fn with_mark(ptr: *mut Node) -> *mut Node {
    (ptr as usize | MARK) as *mut Node
}

fn unmark(ptr: *mut Node) -> *mut Node {
    (ptr as usize & !MARK) as *mut Node
}

/// A node in the list.
struct Node {
    /// The next node down. Once the deletion mark is set this word is never
    /// written again.
    next: AtomicPtr<Node>,

    /// The retire-stack link handed to the collector.
    gc: AtomicPtr<Node>,

    data: u64,
}

impl Reclaim for Node {
    fn gc_next(&self) -> &AtomicPtr<Node> {
        &self.gc
    }
}

/// A lock-free singly-linked stack of `u64`s.
///
/// Readers traverse concurrently with writers and never block. Removed nodes
/// are handed to an internal [`GarbageCollector`], which destroys them after
/// a grace period.
///
/// `push`, `pop`, and `remove` are linearizable at the compare-exchange that
/// publishes (`push`) or claims (`pop`, `remove`) a node. `search` is not
/// linearizable with respect to racing mutations — it may or may not observe
/// them — but it never reads freed memory and never sees a torn pointer.
pub struct RcuList {
    head: CachePadded<AtomicPtr<Node>>,
    gc: GarbageCollector<Node>,
}

impl RcuList {
    /// Creates an empty list whose reclamation is bound to `rcu`.
    pub fn new(rcu: &Rcu) -> RcuList {
        RcuList {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            gc: GarbageCollector::new(rcu),
        }
    }

    /// Pushes `data` onto the top of the list.
    pub fn push(&self, data: u64, handle: &LocalHandle) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            gc: AtomicPtr::new(ptr::null_mut()),
            data,
        }));

        loop {
            let _guard = handle.read_lock();
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pops the node that was on top when the head was read, or returns
    /// `None` if the list is observed empty.
    pub fn pop(&self, handle: &LocalHandle) -> Option<u64> {
        loop {
            let _guard = handle.read_lock();
            let cur = self.head.load(Ordering::Acquire);
            if cur.is_null() {
                return None;
            }
            let node = unsafe { &*cur };
            let next = node.next.load(Ordering::Acquire);

            if marked(next) {
                // Already claimed by a remover; unlink it and look again.
                if self
                    .head
                    .compare_exchange(cur, unmark(next), Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { self.gc.discard(cur, handle) };
                }
                continue;
            }

            // Marking, not the head swing, is what commits the pop: no other
            // claim and no unlink can touch a marked node.
            if node
                .next
                .compare_exchange(next, with_mark(next), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                let data = node.data;
                if self
                    .head
                    .compare_exchange(cur, next, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { self.gc.discard(cur, handle) };
                } else {
                    // A push buried the node between the head read and the
                    // claim; take it out of the middle instead.
                    self.unlink(cur, handle);
                }
                return Some(data);
            }
        }
    }

    /// Whether any node currently holds `data`.
    ///
    /// Nodes that are marked but not yet unlinked are already logically gone
    /// and do not count.
    pub fn search(&self, data: u64, handle: &LocalHandle) -> bool {
        let _guard = handle.read_lock();
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            let next = node.next.load(Ordering::Acquire);
            if !marked(next) && node.data == data {
                return true;
            }
            cur = unmark(next);
        }
        false
    }

    /// Unlinks the first live node holding `data`. Returns whether one was
    /// found.
    ///
    /// Restarts the traversal from the head whenever a compare-exchange loses
    /// a race; a marked node found along the way is unlinked before the walk
    /// steps past it, so the predecessor link only ever rests on live words.
    pub fn remove(&self, data: u64, handle: &LocalHandle) -> bool {
        'retry: loop {
            let _guard = handle.read_lock();
            let mut link: &AtomicPtr<Node> = &self.head;
            let mut cur = link.load(Ordering::Acquire);
            while !cur.is_null() {
                let node = unsafe { &*cur };
                let next = node.next.load(Ordering::Acquire);

                if marked(next) {
                    if link
                        .compare_exchange(cur, unmark(next), Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        unsafe { self.gc.discard(cur, handle) };
                        cur = unmark(next);
                        continue;
                    }
                    continue 'retry;
                }

                if node.data == data {
                    if node
                        .next
                        .compare_exchange(
                            next,
                            with_mark(next),
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        continue 'retry;
                    }
                    if link
                        .compare_exchange(cur, next, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        unsafe { self.gc.discard(cur, handle) };
                    } else {
                        self.unlink(cur, handle);
                    }
                    return true;
                }

                link = &node.next;
                cur = next;
            }
            return false;
        }
    }

    /// Finishes physically unlinking a node this thread has marked.
    ///
    /// Walks from the head until its own compare-exchange commits or the node
    /// turns out to be gone, unlinking any other marked node in the way. The
    /// caller must still be inside the critical section it claimed the node
    /// under: keeping it open is what stops the claimed address from being
    /// freed and recycled between walks.
    fn unlink(&self, target: *mut Node, handle: &LocalHandle) {
        'retry: loop {
            let mut link: &AtomicPtr<Node> = &self.head;
            let mut cur = link.load(Ordering::Acquire);
            while !cur.is_null() {
                let node = unsafe { &*cur };
                let next = node.next.load(Ordering::Acquire);

                if marked(next) {
                    if link
                        .compare_exchange(cur, unmark(next), Ordering::Release, Ordering::Relaxed)
                        .is_err()
                    {
                        continue 'retry;
                    }
                    unsafe { self.gc.discard(cur, handle) };
                    if cur == target {
                        return;
                    }
                    cur = unmark(next);
                    continue;
                }

                link = &node.next;
                cur = next;
            }
            // Unreachable from the head: whoever unlinked it discarded it.
            return;
        }
    }

    /// Stops the internal collector and waits for it to destroy everything
    /// unlinked so far. Called implicitly on drop.
    pub fn join_gc(&mut self) {
        self.gc.join();
    }
}

impl Drop for RcuList {
    fn drop(&mut self) {
        // Exclusive access: no reader or writer can hold a pointer into the
        // list anymore, so the remaining chain can be freed directly.
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = unmark(node.next.load(Ordering::Relaxed));
        }
    }
}

impl fmt::Debug for RcuList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("RcuList { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke() {
        assert!(crate::register_process());
        let rcu = Rcu::new();
        let handle = rcu.register();
        let list = RcuList::new(&rcu);

        assert!(list.pop(&handle).is_none());
        list.push(7, &handle);
        list.push(8, &handle);
        assert!(list.search(7, &handle));
        assert_eq!(list.pop(&handle), Some(8));
        assert_eq!(list.pop(&handle), Some(7));
        assert!(list.pop(&handle).is_none());
    }

    #[test]
    fn mark_encoding() {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            gc: AtomicPtr::new(ptr::null_mut()),
            data: 0,
        }));

        assert!(!marked(node));
        assert!(marked(with_mark(node)));
        assert_eq!(unmark(with_mark(node)), node);
        assert!(marked(with_mark(ptr::null_mut())));

        drop(unsafe { Box::from_raw(node) });
    }
}
