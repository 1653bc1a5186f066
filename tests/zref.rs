extern crate env_logger;
extern crate weft;

use std::thread;
use std::time::Duration;

use weft::{
    ChanError, Channel, DType, FormatMode, RegionMeta, RegionRegistry, Scheduler, Select,
    ZBuffered, ZDesc, ZRendezvous, FMT_ALIGN, FMT_DTYPE, FMT_ELEMBITS,
};

fn fp32_meta() -> RegionMeta {
    let mut meta = RegionMeta::default();
    meta.dtype = DType::Fp32;
    meta.elem_bits = 32;
    meta.align_bytes = 32;
    meta
}

#[test]
fn test_region_blocking_deregister() {
    let _ = env_logger::try_init();
    let reg = RegionRegistry::new();
    let id = reg.register(0x1000, 4096);

    assert!(reg.incref(id));
    assert!(reg.incref(id)); // refs = 3

    let reg2 = reg.clone();
    let dereg = thread::spawn(move || reg2.deregister(id));

    // The deregistering thread blocks while two refs are outstanding.
    thread::sleep(Duration::from_millis(30));
    assert!(reg.query(id).is_some());

    assert!(reg.decref(id));
    thread::sleep(Duration::from_millis(10));
    assert!(reg.query(id).is_some());

    assert!(reg.decref(id));
    assert!(dereg.join().unwrap());
    assert_eq!(reg.query(id), None);
}

#[test]
fn test_region_register_incref_decref_roundtrip() {
    let _ = env_logger::try_init();
    let reg = RegionRegistry::new();
    let id = reg.register(0x2000, 64);

    for _ in 0..5 {
        assert!(reg.incref(id));
    }
    for _ in 0..5 {
        assert!(reg.decref(id));
    }
    assert!(reg.deregister(id));
    assert_eq!(reg.query(id), None);
}

#[test]
fn test_descriptor_rendezvous_roundtrip() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let reg = RegionRegistry::new();
    let chan = ZRendezvous::new(&sched, &reg);

    let (p, id) = reg.alloc_aligned(1024, 64).unwrap();
    let desc = ZDesc {
        addr: p as usize,
        len: 1024,
        region_id: id,
        offset: 0,
        flags: 0,
    };

    let c2 = chan.clone();
    let receiver = sched.spawn(move || c2.recv(-1));

    let c3 = chan.clone();
    let reg2 = reg.clone();
    let sender = sched.spawn(move || {
        // Hold a ref across the transfer.
        assert!(reg2.incref(id));
        c3.send(desc, -1).unwrap();
    });

    let got = receiver.join().unwrap().unwrap();
    assert_eq!(got, desc);
    sender.join().unwrap();

    // Consumer releases the transfer ref; owner deregisters.
    assert!(reg.decref(id));
    assert!(reg.deregister(id));
    unsafe {
        reg.release_aligned(p);
    }

    let snap = chan.snapshot();
    assert_eq!(snap.total_sends, 1);
    assert_eq!(snap.total_recvs, 1);
    assert_eq!(snap.total_bytes_sent, 1024);
    assert!(snap.caps & weft::CAP_ZERO_COPY != 0);

    sched.shutdown();
}

#[test]
fn test_strict_policy_rejects_mismatch() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let reg = RegionRegistry::new();

    let chan = ZRendezvous::new(&sched, &reg);
    chan.require_format(fp32_meta(), FMT_DTYPE | FMT_ELEMBITS | FMT_ALIGN, FormatMode::Strict);

    // Matching region.
    let (p1, id1) = reg.alloc_aligned(1024, 32).unwrap();
    reg.set_meta(id1, fp32_meta());

    // Mismatched dtype.
    let (p2, id2) = reg.alloc_aligned(1024, 32).unwrap();
    let mut bad = fp32_meta();
    bad.dtype = DType::Fp16;
    bad.elem_bits = 16;
    reg.set_meta(id2, bad);

    let c2 = chan.clone();
    let p1_addr = p1 as usize;
    let p2_addr = p2 as usize;
    let h = sched.spawn(move || {
        let good = ZDesc {
            addr: p1_addr,
            len: 1024,
            region_id: id1,
            offset: 0,
            flags: 0,
        };
        let ugly = ZDesc {
            addr: p2_addr,
            len: 1024,
            region_id: id2,
            offset: 0,
            flags: 0,
        };

        // The mismatch fails before any rendezvous happens.
        assert_eq!(c2.send(ugly, 0), Err(ChanError::InvalidFormat));
        // The match proceeds to rendezvous semantics (no receiver here).
        assert_eq!(c2.send(good, 0), Err(ChanError::WouldBlock));
    });
    h.join().unwrap();

    reg.deregister(id1);
    reg.deregister(id2);
    unsafe {
        reg.release_aligned(p1);
        reg.release_aligned(p2);
    }
    sched.shutdown();
}

#[test]
fn test_advisory_policy_permits_mismatch() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let reg = RegionRegistry::new();

    let chan = ZRendezvous::new(&sched, &reg);
    chan.require_format(fp32_meta(), FMT_DTYPE | FMT_ALIGN, FormatMode::Advisory);

    let (p, id) = reg.alloc_aligned(1024, 8).unwrap();
    let mut meta = fp32_meta();
    meta.dtype = DType::U16;
    meta.align_bytes = 8;
    reg.set_meta(id, meta);

    let desc = ZDesc {
        addr: p as usize,
        len: 1024,
        region_id: id,
        offset: 0,
        flags: 0,
    };

    let c2 = chan.clone();
    let receiver = sched.spawn(move || c2.recv(-1));
    let c3 = chan.clone();
    let sender = sched.spawn(move || c3.send(desc, -1));

    assert_eq!(receiver.join().unwrap(), Ok(desc));
    assert_eq!(sender.join().unwrap(), Ok(()));

    reg.deregister(id);
    unsafe {
        reg.release_aligned(p);
    }
    sched.shutdown();
}

#[test]
fn test_zbuffered_policy_and_fifo() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1);
    let reg = RegionRegistry::new();

    let chan = ZBuffered::new(&sched, &reg, 8);
    chan.require_format(fp32_meta(), FMT_DTYPE | FMT_ELEMBITS | FMT_ALIGN, FormatMode::Strict);

    let (p1, id1) = reg.alloc_aligned(1024, 32).unwrap();
    reg.set_meta(id1, fp32_meta());
    let (p2, id2) = reg.alloc_aligned(1024, 32).unwrap();
    let mut bad = fp32_meta();
    bad.dtype = DType::Fp16;
    reg.set_meta(id2, bad);
    let (p3, id3) = reg.alloc_aligned(1024, 16).unwrap();
    let mut underaligned = fp32_meta();
    underaligned.align_bytes = 16;
    reg.set_meta(id3, underaligned);

    let c2 = chan.clone();
    let p1_addr = p1 as usize;
    let p2_addr = p2 as usize;
    let p3_addr = p3 as usize;
    let h = sched.spawn(move || {
        let good = ZDesc {
            addr: p1_addr,
            len: 1024,
            region_id: id1,
            offset: 0,
            flags: 0,
        };
        let wrong_dtype = ZDesc {
            addr: p2_addr,
            len: 1024,
            region_id: id2,
            offset: 0,
            flags: 0,
        };
        let wrong_align = ZDesc {
            addr: p3_addr,
            len: 1024,
            region_id: id3,
            offset: 0,
            flags: 0,
        };

        assert_eq!(c2.send(good, 0), Ok(()));
        assert_eq!(c2.send(wrong_dtype, 0), Err(ChanError::InvalidFormat));
        assert_eq!(c2.send(wrong_align, 0), Err(ChanError::InvalidFormat));

        assert_eq!(c2.len(), 1);
        assert_eq!(c2.recv(0).unwrap(), good);
    });
    h.join().unwrap();

    for (id, p) in [(id1, p1), (id2, p2), (id3, p3)].iter() {
        reg.deregister(*id);
        unsafe {
            reg.release_aligned(*p);
        }
    }
    sched.shutdown();
}

#[test]
fn test_descriptor_close_wakes_everyone() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let reg = RegionRegistry::new();
    let chan = ZRendezvous::new(&sched, &reg);

    let c2 = chan.clone();
    let receiver = sched.spawn(move || c2.recv(-1));

    let c3 = chan.clone();
    let s3 = sched.clone();
    let closer = sched.spawn(move || {
        s3.sleep_ms(20);
        c3.close();
    });

    assert_eq!(receiver.join().unwrap(), Err(ChanError::Closed));
    closer.join().unwrap();

    // Everything after close observes Closed.
    let c4 = chan.clone();
    let h = sched.spawn(move || {
        assert_eq!(c4.send(ZDesc::default(), 0), Err(ChanError::Closed));
        assert_eq!(c4.recv(0), Err(ChanError::Closed));
    });
    h.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_descriptor_select_recv() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let reg = RegionRegistry::new();
    let chan = ZRendezvous::new(&sched, &reg);

    let desc = ZDesc {
        addr: 0x7000,
        len: 256,
        region_id: 0,
        offset: 0,
        flags: 0,
    };

    let c2 = chan.clone();
    let s2 = sched.clone();
    let selector = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_recv(&*c2);
        let winner = sel.wait(-1).unwrap();
        sel.take_recv(winner)
    });

    let c3 = chan.clone();
    let s3 = sched.clone();
    let sender = sched.spawn(move || {
        s3.sleep_ms(20);
        c3.send(desc, -1).unwrap();
    });

    assert_eq!(selector.join().unwrap(), Some(desc));
    sender.join().unwrap();

    sched.shutdown();
}

#[test]
fn test_descriptor_select_send_matches_plain_recv() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(2);
    let reg = RegionRegistry::new();
    let chan = ZRendezvous::new(&sched, &reg);

    let desc = ZDesc {
        addr: 0x8000,
        len: 512,
        region_id: 0,
        offset: 0,
        flags: 0,
    };

    let c2 = chan.clone();
    let s2 = sched.clone();
    let selector = sched.spawn(move || {
        let mut sel = Select::new(&s2);
        sel.add_send(&*c2, desc);
        sel.wait(-1)
    });

    let c3 = chan.clone();
    let receiver = sched.spawn(move || c3.recv(-1));

    assert_eq!(selector.join().unwrap(), Ok(0));
    assert_eq!(receiver.join().unwrap(), Ok(desc));

    sched.shutdown();
}
