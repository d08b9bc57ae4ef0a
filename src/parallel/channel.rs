//! Per-rank communication endpoint.
//!
//! A [`Channel`] binds one rank of a [`CollectiveGroup`] and owns its
//! point-to-point links to every other rank. Each direction of a link is a
//! zero-capacity envelope channel plus an acknowledgement channel: a send
//! only returns once the receiver has taken and validated the envelope, so
//! a length or type mismatch fails both sides.
//!
//! Non-blocking transfers run on lanes private to the channel, one
//! single-threaded FIFO pool per (peer, direction). A lane runs its
//! transfers one at a time in issue order, so two async operations on the
//! same peer and direction can never race for the link.
//!
//! Lanes start on first use, so a rank holds one lane thread per peer and
//! direction it actually talks to asynchronously: two per neighbour for a
//! nearest-neighbour halo, up to `2(P-1)` for all-to-all coupling.

use crate::error::{KError, Result};
use crate::parallel::group::CollectiveGroup;
use crate::parallel::reduce::{ReduceOp, Reducible};
use crate::parallel::request::{self, Request};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::fmt;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};

struct Envelope {
    len: usize,
    payload: Box<dyn Any + Send>,
}

type Ack = Result<()>;

struct Outbound {
    tx: SyncSender<Envelope>,
    acks: Receiver<Ack>,
}

struct Inbound {
    rx: Receiver<Envelope>,
    acks: SyncSender<Ack>,
}

/// One rank's ends of a bidirectional link with a peer.
pub(crate) struct LinkEnds {
    outbound: Outbound,
    inbound: Inbound,
}

impl LinkEnds {
    /// Create both directions of a link; returns (near ends, far ends).
    pub(crate) fn pair() -> (LinkEnds, LinkEnds) {
        let (near_tx, far_rx) = sync_channel(0);
        let (far_ack_tx, near_ack_rx) = sync_channel(1);
        let (far_tx, near_rx) = sync_channel(0);
        let (near_ack_tx, far_ack_rx) = sync_channel(1);
        let near = LinkEnds {
            outbound: Outbound { tx: near_tx, acks: near_ack_rx },
            inbound: Inbound { rx: near_rx, acks: near_ack_tx },
        };
        let far = LinkEnds {
            outbound: Outbound { tx: far_tx, acks: far_ack_rx },
            inbound: Inbound { rx: far_rx, acks: far_ack_tx },
        };
        (near, far)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send = 0,
    Recv = 1,
}

struct PeerLink {
    rank: usize,
    peer: usize,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    lanes: [Mutex<Option<Arc<ThreadPool>>>; 2],
}

impl PeerLink {
    fn new(rank: usize, peer: usize, ends: LinkEnds) -> Self {
        Self {
            rank,
            peer,
            outbound: Mutex::new(ends.outbound),
            inbound: Mutex::new(ends.inbound),
            lanes: [Mutex::new(None), Mutex::new(None)],
        }
    }

    fn hung_up(&self) -> KError {
        KError::comm(format!("rank {} lost its link to rank {}", self.rank, self.peer))
    }

    fn send_vec<T: Send + 'static>(&self, values: Vec<T>) -> Result<()> {
        let out = self.outbound.lock().map_err(|_| self.hung_up())?;
        let env = Envelope { len: values.len(), payload: Box::new(values) };
        out.tx.send(env).map_err(|_| self.hung_up())?;
        out.acks.recv().map_err(|_| self.hung_up())?
    }

    fn recv_into<T: Clone + Send + 'static>(&self, dst: &mut [T]) -> Result<()> {
        let inb = self.inbound.lock().map_err(|_| self.hung_up())?;
        let env = inb.rx.recv().map_err(|_| self.hung_up())?;
        let ack = if env.len != dst.len() {
            Err(KError::SizeMismatch { expected: dst.len(), actual: env.len })
        } else {
            match env.payload.downcast::<Vec<T>>() {
                Ok(values) => {
                    dst.clone_from_slice(&values);
                    Ok(())
                }
                Err(_) => Err(KError::InvalidArgument(format!(
                    "element type mismatch on link {} -> {}",
                    self.peer, self.rank
                ))),
            }
        };
        // The sender may already be gone; our own result still stands.
        let _ = inb.acks.send(ack.clone());
        ack
    }

    fn lane(&self, dir: Direction) -> Result<Arc<ThreadPool>> {
        let mut slot = self.lanes[dir as usize].lock().map_err(|_| self.hung_up())?;
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let (rank, peer) = (self.rank, self.peer);
        let pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(move |_| format!("vmpi-{rank}-{dir:?}-{peer}").to_lowercase())
            .build()
            .map_err(|e| KError::comm(format!("cannot start transfer lane: {e}")))?;
        let pool = Arc::new(pool);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }
}

/// A rank's view of its group: point-to-point links plus the collectives
/// with the rank bound in.
pub struct Channel {
    rank: usize,
    group: Arc<CollectiveGroup>,
    links: Vec<Option<Arc<PeerLink>>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("rank", &self.rank)
            .field("size", &self.size())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(rank: usize, group: Arc<CollectiveGroup>, ends: Vec<Option<LinkEnds>>) -> Self {
        let links = ends
            .into_iter()
            .enumerate()
            .map(|(peer, e)| e.map(|e| Arc::new(PeerLink::new(rank, peer, e))))
            .collect();
        Self { rank, group, links }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn group(&self) -> &Arc<CollectiveGroup> {
        &self.group
    }

    /// Number of transfer lanes (one thread each) started so far.
    pub fn lane_count(&self) -> usize {
        self.links
            .iter()
            .flatten()
            .flat_map(|link| link.lanes.iter())
            .filter(|lane| lane.lock().map(|l| l.is_some()).unwrap_or(false))
            .count()
    }

    fn link(&self, peer: usize) -> Result<&Arc<PeerLink>> {
        if peer == self.rank {
            return Err(KError::SelfMessage { rank: peer });
        }
        self.group.check_rank(peer)?;
        self.group.check_alive()?;
        self.links[peer]
            .as_ref()
            .ok_or_else(|| KError::comm(format!("no link from rank {} to rank {peer}", self.rank)))
    }

    fn check_range(capacity: usize, offset: usize, length: usize) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(KError::BufferOverflow { offset, length, capacity }),
        }
    }

    // ---- blocking point-to-point ----

    /// Send `data[offset..offset + length]` to `peer`, blocking until the
    /// peer has received it.
    pub fn send_range<T>(&self, data: &[T], offset: usize, length: usize, peer: usize) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let link = self.link(peer)?;
        Self::check_range(data.len(), offset, length)?;
        link.send_vec(data[offset..offset + length].to_vec())
    }

    /// Receive exactly `length` elements from `peer` into
    /// `data[offset..offset + length]`.
    pub fn recv_range<T>(&self, data: &mut [T], offset: usize, length: usize, peer: usize) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let link = self.link(peer)?;
        Self::check_range(data.len(), offset, length)?;
        link.recv_into(&mut data[offset..offset + length])
    }

    pub fn send<T: Clone + Send + 'static>(&self, data: &[T], peer: usize) -> Result<()> {
        self.send_range(data, 0, data.len(), peer)
    }

    pub fn recv<T: Clone + Send + 'static>(&self, data: &mut [T], peer: usize) -> Result<()> {
        let len = data.len();
        self.recv_range(data, 0, len, peer)
    }

    // ---- non-blocking point-to-point ----

    /// Start sending `data[offset..offset + length]` to `peer`.
    ///
    /// The range is copied before returning, so `data` may be reused
    /// immediately.
    pub fn isend_range<T>(&self, data: &[T], offset: usize, length: usize, peer: usize) -> Result<Request<()>>
    where
        T: Clone + Send + 'static,
    {
        let link = Arc::clone(self.link(peer)?);
        Self::check_range(data.len(), offset, length)?;
        let values = data[offset..offset + length].to_vec();
        let lane = link.lane(Direction::Send)?;
        let (tx, rx) = sync_channel(1);
        lane.spawn_fifo(move || {
            let _ = tx.send(link.send_vec(values));
        });
        Ok(Request::new(rx))
    }

    /// Start receiving `length` elements from `peer` into
    /// `buf[offset..offset + length]`; the filled buffer comes back from
    /// [`Request::wait`].
    pub fn irecv_range<T>(&self, buf: Vec<T>, offset: usize, length: usize, peer: usize) -> Result<Request<Vec<T>>>
    where
        T: Clone + Send + 'static,
    {
        let link = Arc::clone(self.link(peer)?);
        Self::check_range(buf.len(), offset, length)?;
        let lane = link.lane(Direction::Recv)?;
        let (tx, rx) = sync_channel(1);
        lane.spawn_fifo(move || {
            let mut buf = buf;
            let r = link.recv_into(&mut buf[offset..offset + length]).map(|()| buf);
            let _ = tx.send(r);
        });
        Ok(Request::new(rx))
    }

    pub fn isend<T: Clone + Send + 'static>(&self, data: &[T], peer: usize) -> Result<Request<()>> {
        self.isend_range(data, 0, data.len(), peer)
    }

    pub fn irecv<T: Clone + Send + 'static>(&self, buf: Vec<T>, peer: usize) -> Result<Request<Vec<T>>> {
        let len = buf.len();
        self.irecv_range(buf, 0, len, peer)
    }

    /// Wait for a set of requests; see [`request::wait_all`].
    pub fn wait_all<T>(&self, requests: Vec<Request<T>>) -> Result<Vec<T>> {
        request::wait_all(requests)
    }

    /// Exchange with two peers at once: send `send` to `dest` while
    /// receiving `recv` from `source`.
    ///
    /// The send is issued asynchronously, so symmetric exchanges between
    /// pairs of ranks do not deadlock.
    pub fn sendrecv<T>(&self, send: &[T], dest: usize, recv: &mut [T], source: usize) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let req = self.isend(send, dest)?;
        let received = self.recv(recv, source);
        let sent = req.wait();
        received.and(sent)
    }

    // ---- collectives, rank bound ----

    pub fn barrier(&self) -> Result<()> {
        self.group.barrier(self.rank)
    }

    pub fn broadcast<T: Clone + Send + 'static>(&self, buf: &mut [T], root: usize) -> Result<()> {
        self.group.broadcast(self.rank, buf, root)
    }

    pub fn gather<T: Clone + Send + 'static>(&self, send: &[T], recv: &mut [Vec<T>], root: usize) -> Result<()> {
        self.group.gather(self.rank, send, recv, root)
    }

    pub fn scatter<T: Clone + Send + 'static>(&self, send: &[Vec<T>], recv: &mut [T], root: usize) -> Result<()> {
        self.group.scatter(self.rank, send, recv, root)
    }

    pub fn all_gather<T: Clone + Send + 'static>(&self, send: &[T], recv: &mut [Vec<T>]) -> Result<()> {
        self.group.all_gather(self.rank, send, recv)
    }

    pub fn all_to_all<T: Clone + Send + 'static>(&self, send: &[Vec<T>], recv: &mut [Vec<T>]) -> Result<()> {
        self.group.all_to_all(self.rank, send, recv)
    }

    pub fn reduce<T: Reducible>(&self, send: &[T], recv: &mut [T], op: ReduceOp, root: usize) -> Result<()> {
        self.group.reduce(self.rank, send, recv, op, root)
    }

    pub fn all_reduce<T: Reducible>(&self, send: &[T], recv: &mut [T], op: ReduceOp) -> Result<()> {
        self.group.all_reduce(self.rank, send, recv, op)
    }

    /// All-reduce of a single value.
    pub fn all_reduce_scalar<T: Reducible>(&self, value: T, op: ReduceOp) -> Result<T> {
        let mut out = [value];
        self.all_reduce(&[value], &mut out, op)?;
        Ok(out[0])
    }

    /// Reduce of a single value; `Some` on `root` only.
    pub fn reduce_scalar<T: Reducible>(&self, value: T, op: ReduceOp, root: usize) -> Result<Option<T>> {
        let mut out = [value];
        self.reduce(&[value], &mut out, op, root)?;
        Ok((self.rank == root).then_some(out[0]))
    }

    /// All-gather of a single value per rank.
    pub fn all_gather_scalar<T: Clone + Default + Send + 'static>(&self, value: T) -> Result<Vec<T>> {
        let mut recv = vec![vec![T::default()]; self.size()];
        self.all_gather(&[value], &mut recv)?;
        Ok(recv.into_iter().flatten().collect())
    }

    /// Collective agreement on a locally computed result.
    ///
    /// Every rank learns whether all ranks succeeded, so a local validation
    /// failure on one rank fails the enclosing collective construction on
    /// every rank instead of leaving the others blocked.
    pub fn agree<T>(&self, local: Result<T>) -> Result<T> {
        let all_ok = self.all_reduce_scalar(local.is_ok(), ReduceOp::And)?;
        match local {
            Err(e) => Err(e),
            Ok(_) if !all_ok => Err(KError::InvalidArgument(
                "construction rejected on another rank".into(),
            )),
            Ok(v) => Ok(v),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.group.abort(self.rank, "rank panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::run;

    #[test]
    fn local_validation_needs_no_peer() {
        let results = run(2, |ch| {
            let data = [1.0, 2.0, 3.0];
            let me = ch.rank();
            (
                ch.send(&data, me),
                ch.send_range(&data, 2, 2, 1 - me),
                ch.send(&data, 5),
            )
        })
        .unwrap();
        for (r, (self_send, overflow, bad_peer)) in results.into_iter().enumerate() {
            assert_eq!(self_send, Err(KError::SelfMessage { rank: r }));
            assert_eq!(overflow, Err(KError::BufferOverflow { offset: 2, length: 2, capacity: 3 }));
            assert_eq!(bad_peer, Err(KError::InvalidRank { rank: 5, size: 2 }));
        }
    }

    #[test]
    fn length_mismatch_fails_both_sides() {
        let results = run(2, |ch| {
            if ch.rank() == 0 {
                ch.send(&[1u32, 2, 3], 1)
            } else {
                let mut buf = [0u32; 2];
                ch.recv(&mut buf, 0)
            }
        })
        .unwrap();
        for r in results {
            assert_eq!(r, Err(KError::SizeMismatch { expected: 2, actual: 3 }));
        }
    }

    #[test]
    fn agree_propagates_a_single_failure() {
        let results = run(3, |ch| {
            let local = if ch.rank() == 1 { Err(KError::Unsupported("x")) } else { Ok(ch.rank()) };
            ch.agree(local)
        })
        .unwrap();
        assert!(matches!(results[0], Err(KError::InvalidArgument(_))));
        assert_eq!(results[1], Err(KError::Unsupported("x")));
        assert!(matches!(results[2], Err(KError::InvalidArgument(_))));
    }
}
