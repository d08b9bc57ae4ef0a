//! Integration tests for blocking and non-blocking point-to-point transfers.

use vmpi::error::KError;
use vmpi::parallel::{Request, run, wait_all};

#[test]
fn blocking_ring_with_offsets() {
    let results = run(4, |ch| {
        let r = ch.rank();
        let p = ch.size();
        let next = (r + 1) % p;
        let prev = (r + p - 1) % p;
        let data = [r as f64; 6];
        let mut buf = [-1.0; 6];
        // Even ranks send first so the blocking ring cannot deadlock.
        if r % 2 == 0 {
            ch.send_range(&data, 1, 3, next).unwrap();
            ch.recv_range(&mut buf, 2, 3, prev).unwrap();
        } else {
            ch.recv_range(&mut buf, 2, 3, prev).unwrap();
            ch.send_range(&data, 1, 3, next).unwrap();
        }
        buf
    })
    .unwrap();
    for (r, buf) in results.into_iter().enumerate() {
        let prev = ((r + 3) % 4) as f64;
        assert_eq!(buf, [-1.0, -1.0, prev, prev, prev, -1.0]);
    }
}

#[test]
fn async_messages_keep_issue_order() {
    let results = run(2, |ch| {
        let peer = 1 - ch.rank();
        let sends: Vec<Request<()>> = (0..8u32)
            .map(|k| ch.isend(&[k, ch.rank() as u32], peer).unwrap())
            .collect();
        let recvs: Vec<Request<Vec<u32>>> = (0..8).map(|_| ch.irecv(vec![0u32; 2], peer).unwrap()).collect();
        let got = wait_all(recvs).unwrap();
        wait_all(sends).unwrap();
        got
    })
    .unwrap();
    for (r, got) in results.into_iter().enumerate() {
        let peer = (1 - r) as u32;
        let expected: Vec<Vec<u32>> = (0..8).map(|k| vec![k, peer]).collect();
        assert_eq!(got, expected);
    }
}

#[test]
fn irecv_into_a_sub_range() {
    let results = run(2, |ch| {
        if ch.rank() == 0 {
            let req = ch.isend_range(&[1i64, 2, 3, 4], 1, 2, 1).unwrap();
            req.wait().map(|()| Vec::new())
        } else {
            let mut req = ch.irecv_range(vec![0i64; 5], 3, 2, 0).unwrap();
            while !req.test() {
                std::thread::yield_now();
            }
            req.wait()
        }
    })
    .unwrap();
    assert_eq!(results[1], Ok(vec![0, 0, 0, 2, 3]));
    assert_eq!(results[0], Ok(vec![]));
}

#[test]
fn sendrecv_shift() {
    let results = run(5, |ch| {
        let r = ch.rank();
        let p = ch.size();
        let mut got = [0usize; 2];
        ch.sendrecv(&[r, r * 2], (r + 1) % p, &mut got, (r + p - 1) % p).unwrap();
        got
    })
    .unwrap();
    for (r, got) in results.into_iter().enumerate() {
        let prev = (r + 4) % 5;
        assert_eq!(got, [prev, prev * 2]);
    }
}

#[test]
fn async_length_mismatch_reports_on_both_sides() {
    let results = run(2, |ch| {
        if ch.rank() == 0 {
            ch.isend(&[1.0f32; 4], 1).unwrap().wait().map(|()| 0)
        } else {
            ch.irecv(vec![0.0f32; 3], 0).unwrap().wait().map(|v| v.len())
        }
    })
    .unwrap();
    for r in results {
        assert_eq!(r, Err(KError::SizeMismatch { expected: 3, actual: 4 }));
    }
}

#[test]
fn element_type_mismatch_is_rejected() {
    let results = run(2, |ch| {
        if ch.rank() == 0 {
            ch.send(&[1u8, 2], 1)
        } else {
            let mut buf = [0u16; 2];
            ch.recv(&mut buf, 0)
        }
    })
    .unwrap();
    for r in results {
        assert!(matches!(r, Err(KError::InvalidArgument(_))));
    }
}
