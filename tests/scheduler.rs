extern crate env_logger;
extern crate weft;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weft::{Options, Scheduler};

#[test]
fn test_spawn_join_basic() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);

    let guard = sched.spawn(|| 1);
    assert_eq!(1, guard.join().unwrap());

    sched.shutdown();
}

#[test]
fn test_spawn_many() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(4);
    let hits = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..200 {
        let hits = hits.clone();
        handles.push(sched.spawn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 200);

    sched.shutdown();
}

#[test]
fn test_yield_interleaves() {
    let _ = env_logger::try_init();
    // One worker: both coroutines share it and must take turns.
    let sched = Scheduler::new(1);
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let l1 = log.clone();
    let s1 = sched.clone();
    let a = sched.spawn(move || {
        for i in 0..3 {
            l1.lock().unwrap().push(("a", i));
            s1.yield_now();
        }
    });
    let l2 = log.clone();
    let s2 = sched.clone();
    let b = sched.spawn(move || {
        for i in 0..3 {
            l2.lock().unwrap().push(("b", i));
            s2.yield_now();
        }
    });

    a.join().unwrap();
    b.join().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 6);
    // Interleaved, not two straight runs.
    assert!(log[0].0 != log[1].0);

    sched.shutdown();
}

#[test]
fn test_sleep_ms() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);

    let s2 = sched.clone();
    let start = Instant::now();
    let h = sched.spawn(move || {
        s2.sleep_ms(30);
    });
    h.join().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));

    sched.shutdown();
}

#[test]
fn test_spawn_task_runs() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let hit = Arc::new(AtomicBool::new(false));

    let h2 = hit.clone();
    sched.spawn_task(move || {
        h2.store(true, Ordering::SeqCst);
    });
    sched.drain(1000);
    assert!(hit.load(Ordering::SeqCst));

    sched.shutdown();
}

#[test]
fn test_spawn_task_from_worker() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let hits = Arc::new(AtomicUsize::new(0));

    let s2 = sched.clone();
    let h2 = hits.clone();
    let h = sched.spawn(move || {
        // Submitted from a worker: lands on the worker's own deque.
        for _ in 0..10 {
            let h3 = h2.clone();
            s2.spawn_task(move || {
                h3.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    h.join().unwrap();
    sched.drain(1000);
    assert_eq!(hits.load(Ordering::SeqCst), 10);

    sched.shutdown();
}

#[test]
fn test_timer_fire() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let hit = Arc::new(AtomicBool::new(false));

    let h2 = hit.clone();
    sched
        .timer_after(10, Box::new(move || {
            h2.store(true, Ordering::SeqCst);
        }))
        .unwrap();

    thread::sleep(Duration::from_millis(80));
    assert!(hit.load(Ordering::SeqCst));

    sched.shutdown();
}

#[test]
fn test_timer_cancel_pending() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let hit = Arc::new(AtomicBool::new(false));

    let h2 = hit.clone();
    let handle = sched
        .timer_after(100, Box::new(move || {
            h2.store(true, Ordering::SeqCst);
        }))
        .unwrap();

    assert!(sched.timer_cancel(handle));
    thread::sleep(Duration::from_millis(150));
    assert!(!hit.load(Ordering::SeqCst));

    sched.shutdown();
}

#[test]
fn test_timer_cancel_after_fire() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);

    let handle = sched.timer_after(1, Box::new(|| {})).unwrap();
    thread::sleep(Duration::from_millis(60));
    assert!(!sched.timer_cancel(handle));

    sched.shutdown();
}

#[test]
fn test_spawn_after_shutdown_is_noop() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    sched.shutdown();

    // Must not hang or panic; the task is silently dropped.
    sched.spawn_task(|| panic!("must not run"));
    assert!(sched.timer_after(1, Box::new(|| {})).is_none());
}

#[test]
fn test_named_coroutine_option() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);

    let h = sched.spawn_opts(
        || 7,
        Options::new().stack_size(128 * 1024).name("worker-bee".to_string()),
    );
    assert_eq!(h.join().unwrap(), 7);

    sched.shutdown();
}

#[test]
fn test_zero_stack_spawn() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);

    // A zero stack request floors to one page and still runs.
    let h = sched.spawn_opts(|| 42, Options::new().stack_size(0));
    assert_eq!(h.join().unwrap(), 42);

    sched.shutdown();
}

#[test]
fn test_panic_propagates_to_join() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);

    let h = sched.spawn(|| -> u32 { panic!("boom") });
    assert!(h.join().is_err());

    sched.shutdown();
}

#[test]
fn test_stats_counters_move() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);

    let mut handles = Vec::new();
    for _ in 0..50 {
        handles.push(sched.spawn(|| {}));
    }
    for _ in 0..50 {
        sched.spawn_task(|| {});
    }
    for h in handles {
        h.join().unwrap();
    }
    sched.drain(2000);

    let stats = sched.stats();
    assert_eq!(stats.tasks_submitted, 50);
    assert_eq!(stats.tasks_completed, 50);
    assert!(stats.ready_enqueued >= 50);
    assert_eq!(stats.retired, 50);

    sched.shutdown();
}
