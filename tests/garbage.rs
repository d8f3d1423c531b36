use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::thread::scope;
use membarrier_rcu::{GarbageCollector, Rcu, Reclaim};

#[test]
fn count_drops() {
    const THREADS: usize = 8;
    const COUNT: usize = 1000;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Elem {
        gc_next: AtomicPtr<Elem>,
        _data: u64,
    }

    impl Reclaim for Elem {
        fn gc_next(&self) -> &AtomicPtr<Elem> {
            &self.gc_next
        }
    }

    impl Drop for Elem {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    assert!(membarrier_rcu::register_process());
    let rcu = Rcu::new();
    let mut gc = GarbageCollector::<Elem>::new(&rcu);

    scope(|s| {
        let rcu = &rcu;
        let gc = &gc;

        for _ in 0..THREADS {
            s.spawn(move |_| {
                let handle = rcu.register();
                for i in 0..COUNT {
                    let e = Box::into_raw(Box::new(Elem {
                        gc_next: AtomicPtr::new(ptr::null_mut()),
                        _data: i as u64,
                    }));
                    unsafe { gc.discard(e, &handle) };
                }
            });
        }
    })
    .unwrap();

    // Producers are quiet; join drains everything discarded above.
    gc.join();
    assert_eq!(DROPS.load(Ordering::Relaxed), THREADS * COUNT);
}

#[test]
fn destruction_waits_for_readers() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Elem {
        gc_next: AtomicPtr<Elem>,
    }

    impl Reclaim for Elem {
        fn gc_next(&self) -> &AtomicPtr<Elem> {
            &self.gc_next
        }
    }

    impl Drop for Elem {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    assert!(membarrier_rcu::register_process());
    let rcu = Rcu::new();
    let gc = GarbageCollector::<Elem>::new(&rcu);
    let handle = rcu.register();

    let guard = handle.read_lock();
    let e = Box::into_raw(Box::new(Elem {
        gc_next: AtomicPtr::new(ptr::null_mut()),
    }));
    unsafe { gc.discard(e, &handle) };

    // The worker cannot complete a grace period while we sit inside this
    // critical section, so the element must survive it.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(DROPS.load(Ordering::Relaxed), 0);

    drop(guard);

    let deadline = Instant::now() + Duration::from_secs(10);
    while DROPS.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "retired element never destroyed");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(DROPS.load(Ordering::Relaxed), 1);
}

#[test]
fn drop_joins_idle_worker() {
    struct Elem {
        gc_next: AtomicPtr<Elem>,
    }

    impl Reclaim for Elem {
        fn gc_next(&self) -> &AtomicPtr<Elem> {
            &self.gc_next
        }
    }

    assert!(membarrier_rcu::register_process());
    let rcu = Rcu::new();

    // Never discards anything; dropping must still stop the worker.
    let gc = GarbageCollector::<Elem>::new(&rcu);
    drop(gc);
}

#[test]
fn join_is_idempotent() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Elem {
        gc_next: AtomicPtr<Elem>,
    }

    impl Reclaim for Elem {
        fn gc_next(&self) -> &AtomicPtr<Elem> {
            &self.gc_next
        }
    }

    impl Drop for Elem {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    assert!(membarrier_rcu::register_process());
    let rcu = Rcu::new();
    let mut gc = GarbageCollector::<Elem>::new(&rcu);
    let handle = rcu.register();

    let e = Box::into_raw(Box::new(Elem {
        gc_next: AtomicPtr::new(ptr::null_mut()),
    }));
    unsafe { gc.discard(e, &handle) };

    gc.join();
    gc.join();
    assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    // The drop impl joins a third time.
}
