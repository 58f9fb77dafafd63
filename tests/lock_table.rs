//! Lock table behaviour across threads

use shadowbridge::{BridgeError, LockTable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn blocking_acquire_waits_for_release_from_another_thread() {
    let table = Arc::new(LockTable::new());
    let lock = table.allocate();
    let released = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(2));

    assert!(table.acquire(lock, true).expect("first acquire"));

    let waiter = {
        let table = table.clone();
        let released = released.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            assert!(table.acquire(lock, true).expect("blocking acquire"));
            let saw_release = released.load(Ordering::SeqCst);
            table.release(lock).expect("release");
            saw_release
        })
    };

    barrier.wait();
    thread::sleep(Duration::from_millis(50));
    released.store(true, Ordering::SeqCst);
    table.release(lock).expect("release");

    assert!(waiter.join().expect("waiter"));
    assert!(table.acquire(lock, false).expect("free again"));
}

#[test]
fn non_blocking_acquire_reports_a_held_lock() {
    let table = LockTable::new();
    let lock = table.allocate();

    assert!(table.acquire(lock, false).expect("acquire"));
    assert!(!table.acquire(lock, false).expect("held"));
    table.release(lock).expect("release");
    assert!(table.acquire(lock, false).expect("reacquire"));
}

#[test]
fn lock_provides_mutual_exclusion() {
    let table = Arc::new(LockTable::new());
    let lock = table.allocate();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let table = table.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    table.acquire(lock, true).expect("acquire");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    table.release(lock).expect("release");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn freed_handles_stay_invalid() {
    let table = LockTable::new();
    let first = table.allocate();
    let second = table.allocate();
    assert_ne!(first, second);
    assert_ne!(first.as_raw(), 0);

    table.free(first).expect("free");
    assert_eq!(table.acquire(first, false), Err(BridgeError::UnknownLock(first)));
    assert_eq!(table.release(first), Err(BridgeError::UnknownLock(first)));
    assert_eq!(table.free(first), Err(BridgeError::UnknownLock(first)));

    let third = table.allocate();
    assert_ne!(third, first);
    assert_eq!(table.len(), 2);
}

#[test]
fn releasing_an_unlocked_lock_is_ignored() {
    let table = LockTable::new();
    let lock = table.allocate();

    table.release(lock).expect("ignored");
    assert!(table.acquire(lock, false).expect("still acquirable"));
    assert!(!table.acquire(lock, false).expect("held once"));
}
