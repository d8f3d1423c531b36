//! Deferred destruction of retired objects.
//!
//! Threads that unlink an object from a shared structure hand it to a
//! [`GarbageCollector`] instead of destroying it. A worker thread drains the
//! retire stack, waits out a grace period, and only then drops the batch, so
//! no reader can ever hold a pointer into freed memory.
//!
//! The retire stack is a Treiber stack threaded through the objects
//! themselves: the element type donates one atomic link via [`Reclaim`],
//! which costs no extra allocation per retirement.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::collector::{LocalHandle, Rcu};

/// How long the worker sleeps when the retire stack is empty.
const COLLECT_INTERVAL: Duration = Duration::from_millis(1);

/// An object that can be handed to a [`GarbageCollector`].
///
/// The link returned by `gc_next` is owned by the collector from the moment
/// the object is discarded until it is destroyed; implementations only have
/// to reserve the field, never to read it.
pub trait Reclaim: Sized {
    /// Returns the intrusive link used to chain retired objects.
    fn gc_next(&self) -> &AtomicPtr<Self>;
}

struct Inner<T> {
    /// Head of the Treiber-style retire stack. Any registered thread pushes;
    /// only the worker swaps it out.
    head: CachePadded<AtomicPtr<T>>,

    /// Raised by `join` to stop the worker.
    shutdown: AtomicBool,
}

impl<T: Reclaim> Inner<T> {
    /// Claims the whole retire stack.
    ///
    /// The swap runs inside a read-side critical section for the same reason
    /// `discard`'s push does: a head pointer observed here cannot have been
    /// freed and reallocated mid-operation.
    fn claim(&self, handle: &LocalHandle) -> *mut T {
        let _guard = handle.read_lock();
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    fn run(inner: Arc<Inner<T>>, rcu: Rcu) {
        let handle = rcu.register();
        loop {
            let batch = inner.claim(&handle);
            if batch.is_null() {
                // Checking shutdown only when the stack is observed empty
                // means everything discarded before `join` gets destroyed.
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(COLLECT_INTERVAL);
                continue;
            }
            rcu.synchronize();
            unsafe { destroy_batch(batch) };
        }
        drop(handle);
    }
}

/// Walks a claimed batch, clearing each link and dropping each element.
///
/// # Safety
///
/// Every element in the batch must have been unlinked from all shared
/// structures before the grace period that just elapsed, and must have been
/// allocated with `Box::new`.
unsafe fn destroy_batch<T: Reclaim>(mut batch: *mut T) {
    while !batch.is_null() {
        let next = (*batch).gc_next().swap(ptr::null_mut(), Ordering::Relaxed);
        drop(Box::from_raw(batch));
        batch = next;
    }
}

/// Destroys retired objects after a grace period.
///
/// Construction spawns a worker thread that registers itself with the given
/// domain. Producers push retired objects with [`discard`]; the worker
/// periodically claims the whole stack, calls
/// [`synchronize`](Rcu::synchronize), and drops the batch.
///
/// Every discarded object is destroyed exactly once, and never before a
/// grace period that began no earlier than its `discard` call. Objects
/// discarded while [`join`] is racing the worker's final drain are leaked;
/// quiesce producers before joining.
///
/// [`discard`]: GarbageCollector::discard
/// [`join`]: GarbageCollector::join
pub struct GarbageCollector<T: Reclaim + Send + 'static> {
    inner: Arc<Inner<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Reclaim + Send + 'static> GarbageCollector<T> {
    /// Spawns a collector worker bound to `rcu`.
    pub fn new(rcu: &Rcu) -> GarbageCollector<T> {
        let inner = Arc::new(Inner {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            shutdown: AtomicBool::new(false),
        });
        let worker = {
            let inner = inner.clone();
            let rcu = rcu.clone();
            thread::spawn(move || Inner::run(inner, rcu))
        };
        GarbageCollector {
            inner,
            worker: Some(worker),
        }
    }

    /// Hands an unlinked object to the collector.
    ///
    /// Non-blocking: one CAS loop inside a read-side critical section. The
    /// critical section is what rules out ABA on the stack head. The head
    /// observed here can only be recycled after a grace period, and this
    /// thread refuses to go quiescent until the push lands.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated with `Box::new`, must be unreachable
    /// from every shared structure, and ownership passes to the collector:
    /// the caller must not touch it again.
    pub unsafe fn discard(&self, obj: *mut T, handle: &LocalHandle) {
        let _guard = handle.read_lock();
        let mut head = self.inner.head.load(Ordering::Acquire);
        loop {
            (*obj).gc_next().store(head, Ordering::Relaxed);
            match self
                .inner
                .head
                .compare_exchange_weak(head, obj, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// The worker destroys everything discarded before this call, then
    /// unregisters itself. Called implicitly on drop.
    pub fn join(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }
}

impl<T: Reclaim + Send + 'static> Drop for GarbageCollector<T> {
    fn drop(&mut self) {
        self.join();
    }
}

impl<T: Reclaim + Send + 'static> fmt::Debug for GarbageCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("GarbageCollector { .. }")
    }
}
