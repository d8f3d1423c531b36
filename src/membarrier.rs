//! Process-wide memory barriers through the `membarrier` syscall.
//!
//! Readers never issue a fence of their own. Instead, `synchronize` executes
//! the fence on their behalf: the expedited private membarrier command makes
//! every other thread in the process run a full memory barrier (or be off-CPU,
//! which is just as good) before the call returns.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Process registration has not been attempted yet.
const UNKNOWN: usize = 0;
/// The kernel supports expedited private membarrier and we are enrolled.
const SUPPORTED: usize = 1;
/// The kernel does not support the commands we need.
const UNSUPPORTED: usize = 2;

static STATE: AtomicUsize = AtomicUsize::new(UNKNOWN);

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Commands from `linux/membarrier.h`.
        mod sys {
            pub(super) const CMD_QUERY: libc::c_int = 0;
            pub(super) const CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;
            pub(super) const CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

            pub(super) fn membarrier(cmd: libc::c_int) -> libc::c_long {
                unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0 as libc::c_int) }
            }
        }

        fn probe() -> bool {
            // QUERY returns a bitmask of supported commands, or a negative
            // value on kernels that predate the syscall.
            let mask = sys::membarrier(sys::CMD_QUERY);
            if mask < 0 {
                return false;
            }
            if mask & sys::CMD_REGISTER_PRIVATE_EXPEDITED as libc::c_long == 0 {
                return false;
            }
            if mask & sys::CMD_PRIVATE_EXPEDITED as libc::c_long == 0 {
                return false;
            }

            // Declare our intent to receive expedited barriers.
            if sys::membarrier(sys::CMD_REGISTER_PRIVATE_EXPEDITED) < 0 {
                return false;
            }

            // Issue one barrier right away. The kernel contract is that if the
            // command fails at all, it fails the first time, so checking here
            // lets every later call go unchecked.
            sys::membarrier(sys::CMD_PRIVATE_EXPEDITED) >= 0
        }

        /// Forces every other thread in the process to execute a full memory
        /// barrier before this call returns.
        pub(crate) fn all_threads() {
            let ret = sys::membarrier(sys::CMD_PRIVATE_EXPEDITED);
            // Cannot fail once registration has succeeded.
            assert!(ret >= 0, "membarrier failed after successful registration");
        }
    } else {
        fn probe() -> bool {
            false
        }

        pub(crate) fn all_threads() {
            unreachable!("membarrier is unsupported on this platform");
        }
    }
}

/// Enrolls the process with the kernel's expedited private membarrier.
///
/// Must be called, and must return `true`, before any other operation in this
/// crate is used. Returns `false` when the kernel lacks the required
/// commands; the crate is inoperable in that case.
///
/// Calling this again after a successful return is a no-op that returns
/// `true`.
pub fn register_process() -> bool {
    match STATE.load(Ordering::Acquire) {
        SUPPORTED => true,
        UNSUPPORTED => false,
        _ => {
            // Two threads may race the probe; registering twice is harmless.
            let ok = probe();
            let state = if ok { SUPPORTED } else { UNSUPPORTED };
            STATE.store(state, Ordering::Release);
            ok
        }
    }
}

/// Whether `register_process` has succeeded.
pub(crate) fn is_registered() -> bool {
    STATE.load(Ordering::Acquire) == SUPPORTED
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let first = register_process();
        assert_eq!(register_process(), first);
        assert_eq!(register_process(), first);
    }

    #[test]
    fn barrier_after_registration() {
        if register_process() {
            // Must not panic however many times it runs.
            for _ in 0..3 {
                all_threads();
            }
        }
    }
}
