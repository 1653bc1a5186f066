extern crate env_logger;
extern crate weft;

use std::collections::HashSet;
use std::sync::Arc;

use weft::{
    Buffered, CancelToken, ChanError, Channel, Rendezvous, Scheduler, Select, SelectPolicy,
    Unbounded,
};

#[test]
fn test_select_immediate_recv() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let a: Arc<Buffered<u32>> = Buffered::new(&sched, 4);
    let b: Arc<Buffered<u32>> = Buffered::new(&sched, 4);

    let (a2, b2) = (a.clone(), b.clone());
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        b2.send(42, 0).unwrap();

        let mut sel = Select::new(&s2);
        sel.add_recv(&*a2);
        sel.add_recv(&*b2);
        let winner = sel.wait(-1).unwrap();
        assert_eq!(winner, 1);
        assert_eq!(sel.take_recv(1), Some(42));
    });
    h.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_select_timeout_no_winner() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let a: Arc<Rendezvous<u32>> = Rendezvous::new(&sched);
    let b: Arc<Rendezvous<u32>> = Rendezvous::new(&sched);

    let (a2, b2) = (a.clone(), b.clone());
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_recv(&*a2);
        sel.add_recv(&*b2);
        sel.wait(20)
    });
    assert_eq!(h.join().unwrap(), Err(ChanError::Timeout));

    // The losing clauses were swept: a later send finds no waiter.
    let a2 = a.clone();
    let h = sched.spawn(move || a2.send(1, 0));
    assert_eq!(h.join().unwrap(), Err(ChanError::WouldBlock));

    sched.shutdown();
}

#[test]
fn test_select_zero_timeout() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let a: Arc<Rendezvous<u32>> = Rendezvous::new(&sched);

    let a2 = a.clone();
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_recv(&*a2);
        sel.wait(0)
    });
    assert_eq!(h.join().unwrap(), Err(ChanError::WouldBlock));

    sched.shutdown();
}

#[test]
fn test_select_cancel_leaves_no_waiter() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let a: Arc<Rendezvous<u32>> = Rendezvous::new(&sched);
    let token = Arc::new(CancelToken::new());

    let a2 = a.clone();
    let t2 = token.clone();
    let s2 = sched.clone();
    let waiter = sched.spawn(move || {
        let mut sel = Select::new(&s2).with_cancel(&t2);
        sel.add_recv(&*a2);
        sel.wait(-1)
    });

    let t3 = token.clone();
    let s3 = sched.clone();
    let trigger = sched.spawn(move || {
        s3.sleep_ms(20);
        t3.trigger();
    });

    assert_eq!(waiter.join().unwrap(), Err(ChanError::Canceled));
    trigger.join().unwrap();

    // No lingering select waiter on the channel.
    let a2 = a.clone();
    let h = sched.spawn(move || a2.send(1, 0));
    assert_eq!(h.join().unwrap(), Err(ChanError::WouldBlock));

    sched.shutdown();
}

#[test]
fn test_select_parked_then_woken_by_send() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let a: Arc<Rendezvous<u32>> = Rendezvous::new(&sched);
    let b: Arc<Rendezvous<u32>> = Rendezvous::new(&sched);

    let (a2, b2) = (a.clone(), b.clone());
    let s2 = sched.clone();
    let waiter = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_recv(&*a2);
        sel.add_recv(&*b2);
        let winner = sel.wait(-1).unwrap();
        (winner, sel.take_recv(winner))
    });

    let b3 = b.clone();
    let s3 = sched.clone();
    let sender = sched.spawn(move || {
        s3.sleep_ms(20);
        b3.send(7, -1).unwrap();
    });

    assert_eq!(waiter.join().unwrap(), (1, Some(7)));
    sender.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_select_send_clause() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let full: Arc<Buffered<u32>> = Buffered::new(&sched, 1);
    let open: Arc<Buffered<u32>> = Buffered::new(&sched, 1);

    let f2 = full.clone();
    let o2 = open.clone();
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        f2.send(1, 0).unwrap(); // now full

        let mut sel = Select::new(&s2);
        sel.add_send(&*f2, 100);
        sel.add_send(&*o2, 200);
        let winner = sel.wait(-1).unwrap();
        assert_eq!(winner, 1);
        // The losing clause keeps its value.
        assert_eq!(sel.take_unsent(0), Some(100));
        assert_eq!(o2.recv(0).unwrap(), 200);
    });
    h.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_select_send_unblocks_when_space_frees() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let chan: Arc<Buffered<u32>> = Buffered::new(&sched, 1);

    let c2 = chan.clone();
    let s2 = sched.clone();
    let selector = sched.spawn(move || {
        c2.send(1, 0).unwrap();
        let mut sel = Select::new(&s2);
        sel.add_send(&*c2, 2);
        sel.wait(-1)
    });

    let c3 = chan.clone();
    let s3 = sched.clone();
    let drainer = sched.spawn(move || {
        s3.sleep_ms(20);
        assert_eq!(c3.recv(-1).unwrap(), 1);
        assert_eq!(c3.recv(-1).unwrap(), 2);
    });

    assert_eq!(selector.join().unwrap(), Ok(0));
    drainer.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_select_mixed_clauses() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let input: Arc<Unbounded<u32>> = Unbounded::new(&sched);
    let output: Arc<Buffered<u32>> = Buffered::new(&sched, 4);

    let (i2, o2) = (input.clone(), output.clone());
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        i2.send(5, 0).unwrap();

        let mut sel = Select::new(&s2);
        let ri = sel.add_recv(&*i2);
        sel.add_send(&*o2, 99);
        let winner = sel.wait(-1).unwrap();
        // Declaration order: the ready recv clause wins the probe.
        assert_eq!(winner, ri);
        assert_eq!(sel.take_recv(ri), Some(5));
    });
    h.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_select_randomized_policy_varies() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let a: Arc<Buffered<u32>> = Buffered::new(&sched, 64);
    let b: Arc<Buffered<u32>> = Buffered::new(&sched, 64);

    let (a2, b2) = (a.clone(), b.clone());
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            a2.send(1, 0).unwrap();
            b2.send(2, 0).unwrap();

            let mut sel = Select::new(&s2).with_policy(SelectPolicy::Randomized);
            sel.add_recv(&*a2);
            sel.add_recv(&*b2);
            let winner = sel.wait(-1).unwrap();
            seen.insert(winner);
            assert!(sel.take_recv(winner).is_some());

            // Drain the loser so the next round starts clean.
            while a2.recv(0).is_ok() {}
            while b2.recv(0).is_ok() {}
        }
        seen
    });
    let seen = h.join().unwrap();
    assert!(seen.contains(&0) && seen.contains(&1));

    sched.shutdown();
}

#[test]
fn test_select_closed_clause_reports() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let a: Arc<Buffered<u32>> = Buffered::new(&sched, 4);
    a.close();

    let a2 = a.clone();
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_recv(&*a2);
        sel.wait(-1)
    });
    assert_eq!(h.join().unwrap(), Err(ChanError::Closed));

    sched.shutdown();
}

#[test]
fn test_select_reusable_across_waits() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let a: Arc<Unbounded<u32>> = Unbounded::new(&sched);

    let a2 = a.clone();
    let s2 = sched.clone();
    let h = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_recv(&*a2);

        a2.send(1, 0).unwrap();
        assert_eq!(sel.wait(-1), Ok(0));
        assert_eq!(sel.take_recv(0), Some(1));

        a2.send(2, 0).unwrap();
        assert_eq!(sel.wait(-1), Ok(0));
        assert_eq!(sel.take_recv(0), Some(2));
    });
    h.join().unwrap();

    sched.shutdown();
}
