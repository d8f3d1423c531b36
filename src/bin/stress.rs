//! End-to-end harness: registration churn, the single-threaded list vectors,
//! and a concurrent churn run. Takes no flags; exits 0 on success and 1 on
//! the first failed check.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_utils::thread::scope;
use membarrier_rcu::{Rcu, RcuList};

const LOWER: u64 = 10_000;
const UPPER: u64 = 20_000;

fn require(cond: bool) {
    if !cond {
        eprintln!("stress: check failed");
        process::exit(1);
    }
}

fn main() {
    if !membarrier_rcu::register_process() {
        eprintln!("stress: expedited membarrier is unsupported on this kernel");
        process::exit(1);
    }

    let rcu = Rcu::new();
    let main_handle = rcu.register();

    // Registration churn across eight short-lived threads.
    scope(|s| {
        let rcu = &rcu;
        for _ in 0..8 {
            s.spawn(move |_| {
                let handle = rcu.register();
                thread::sleep(Duration::from_millis(1));
                drop(handle);
            });
        }
    })
    .unwrap();

    let mut list = RcuList::new(&rcu);

    for i in 0..4 {
        list.push(i, &main_handle);
    }
    for i in 0..4 {
        require(list.search(i, &main_handle));
    }
    for i in 4..8 {
        require(!list.search(i, &main_handle));
    }
    for i in (0..4).rev() {
        require(list.pop(&main_handle) == Some(i));
    }
    require(list.pop(&main_handle).is_none());

    // Pre-populate with a range no mutator touches, then churn: two mutators
    // push and pop disjoint ranges while eight searchers scan. The
    // pre-populated values must all survive.
    for i in UPPER..UPPER + 10_000 {
        list.push(i, &main_handle);
    }

    let go = AtomicBool::new(false);

    scope(|s| {
        let rcu = &rcu;
        let list = &list;
        let go = &go;

        for (lower, upper) in [(0, LOWER), (LOWER, UPPER)] {
            s.spawn(move |_| {
                while !go.load(Ordering::Relaxed) {}
                let handle = rcu.register();
                for i in lower..upper {
                    list.push(i, &handle);
                }
                for _ in lower..upper {
                    list.pop(&handle);
                }
            });
        }

        for _ in 0..8 {
            s.spawn(move |_| {
                while !go.load(Ordering::Relaxed) {}
                let handle = rcu.register();
                let mut count = 0u64;
                for i in 0..UPPER {
                    count += u64::from(list.search(i, &handle));
                }
                println!("fraction: {}", count as f64 / UPPER as f64);
            });
        }

        go.store(true, Ordering::Relaxed);
    })
    .unwrap();

    for i in UPPER..UPPER + 10_000 {
        require(list.search(i, &main_handle));
    }

    list.join_gc();
}
