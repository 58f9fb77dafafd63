//! C API calls from threads native code spawns, which never enter a bridge

use shadowbridge::ffi::*;
use shadowbridge::Bridge;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn spawned_threads_use_the_installed_default_bridge() {
    let bridge = Bridge::new();
    bridge.install_default();

    let lock = thread::spawn(|| {
        assert!(Bridge::current().is_some());
        let lock = sb_thread_allocate_lock();
        assert_ne!(lock.as_raw(), 0);
        assert_eq!(sb_thread_acquire_lock(lock, 1), 1);
        lock
    })
    .join()
    .expect("allocating thread");

    // Held by the finished thread; any thread may release it
    assert_eq!(bridge.locks().acquire(lock, false), Ok(false));

    let (acquired_tx, acquired_rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let status = sb_thread_acquire_lock(lock, 1);
        acquired_tx.send(status).expect("send");
        sb_thread_release_lock(lock);
    });

    assert!(acquired_rx.recv_timeout(Duration::from_millis(50)).is_err());
    thread::spawn(move || sb_thread_release_lock(lock))
        .join()
        .expect("releasing thread");
    assert_eq!(acquired_rx.recv().expect("waiter status"), 1);
    waiter.join().expect("waiter");

    thread::spawn(move || sb_thread_free_lock(lock))
        .join()
        .expect("freeing thread");
    assert!(bridge.locks().is_empty());
    assert!(!bridge.has_pending_error());

    // The default does not outlive its bridge
    drop(bridge);
    let after = thread::spawn(|| sb_thread_allocate_lock().as_raw())
        .join()
        .expect("late thread");
    assert_eq!(after, 0);
}
