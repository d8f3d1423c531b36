//! Userspace read-copy-update with membarrier-elided read fences.
//!
//! An interesting problem concurrent collections deal with comes from the
//! remove operation. A thread that unlinks an element from a shared structure
//! cannot free it right away, because other threads may still be reading it.
//! RCU resolves this by splitting time into grace periods: readers bracket
//! their accesses in cheap critical sections, and a writer that wants to free
//! something first waits until every reader registered at that moment has
//! passed through a quiescent state.
//!
//! The scheme here (after Desnoyers et al.) makes the read side as close to
//! free as it gets: entering and leaving a critical section is one relaxed
//! load and one relaxed store on a thread-local counter, with no fence. The
//! fences readers would normally need are executed on their behalf by
//! writers, through the kernel's expedited private `membarrier` command,
//! which forces every thread in the process to run a full memory barrier
//! before the syscall returns.
//!
//! # Registration
//!
//! The process must enroll once with [`register_process`]; if it returns
//! `false` the kernel lacks the required membarrier commands and this crate
//! must not be used. Each participating thread then registers with an [`Rcu`]
//! domain and receives a [`LocalHandle`], which is how it enters read-side
//! critical sections.
//!
//! # Reclamation
//!
//! Writers hand unlinked objects to a [`GarbageCollector`], whose worker
//! thread batches them, waits out a grace period with
//! [`synchronize`](Rcu::synchronize), and drops them. Element types donate an
//! intrusive link through the [`Reclaim`] trait, so retirement costs no extra
//! allocation.
//!
//! # Example
//!
//! ```
//! use membarrier_rcu::{Rcu, RcuList};
//!
//! if membarrier_rcu::register_process() {
//!     let rcu = Rcu::new();
//!     let handle = rcu.register();
//!     let list = RcuList::new(&rcu);
//!
//!     list.push(1, &handle);
//!     list.push(2, &handle);
//!     assert!(list.search(1, &handle));
//!     assert_eq!(list.pop(&handle), Some(2));
//! }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod collector;
mod garbage;
mod guard;
mod internal;
mod list;
mod membarrier;

pub use crate::collector::{LocalHandle, Rcu};
pub use crate::garbage::{GarbageCollector, Reclaim};
pub use crate::guard::ReadGuard;
pub use crate::list::RcuList;
pub use crate::membarrier::register_process;
