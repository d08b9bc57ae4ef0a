//! Barrier-based collective operations shared by a fixed group of ranks.
//!
//! Every rank of a [`CollectiveGroup`] runs on its own thread. A collective
//! call deposits the caller's contribution into a rendezvous entry keyed by
//! the caller's operation sequence number; the last rank to arrive runs the
//! release action once (copy, reduce, validate) and hands every rank its own
//! result. Because entries are keyed by sequence number, ranks that issue
//! collectives in different orders are detected instead of silently
//! exchanging the wrong buffers.
//!
//! Release actions also check cross-rank consistency (same root, same
//! operator, matching buffer lengths, same element type). A violation fails
//! the operation on every participant; the group stays usable. A kind
//! mismatch or a dead participant breaks the group for good.

use crate::config::GroupOptions;
use crate::error::{KError, Result};
use crate::parallel::channel::{Channel, LinkEnds};
use crate::parallel::reduce::{self, ReduceOp, Reducible};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

type Payload = Box<dyn Any + Send>;

/// Collective operation kinds, used to detect mismatched call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Barrier,
    Broadcast,
    Gather,
    Scatter,
    AllGather,
    AllToAll,
    Reduce,
    AllReduce,
    Handshake,
}

impl OpKind {
    fn name(self) -> &'static str {
        match self {
            OpKind::Barrier => "barrier",
            OpKind::Broadcast => "broadcast",
            OpKind::Gather => "gather",
            OpKind::Scatter => "scatter",
            OpKind::AllGather => "all_gather",
            OpKind::AllToAll => "all_to_all",
            OpKind::Reduce => "reduce",
            OpKind::AllReduce => "all_reduce",
            OpKind::Handshake => "channel handshake",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Outcome {
    Done(Vec<Option<Payload>>),
    Failed(KError),
}

struct Rendezvous {
    kind: OpKind,
    inputs: Vec<Option<Payload>>,
    arrived: usize,
    outcome: Option<Outcome>,
    collected: usize,
}

impl Rendezvous {
    fn new(kind: OpKind, size: usize) -> Self {
        Self {
            kind,
            inputs: (0..size).map(|_| None).collect(),
            arrived: 0,
            outcome: None,
            collected: 0,
        }
    }
}

#[derive(Default)]
struct GroupState {
    ops: HashMap<u64, Rendezvous>,
    broken: Option<String>,
}

/// Shared state of a fixed-size group of ranks.
pub struct CollectiveGroup {
    size: usize,
    seqs: Vec<AtomicU64>,
    state: Mutex<GroupState>,
    released: Condvar,
    broken: AtomicBool,
}

impl fmt::Debug for CollectiveGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectiveGroup")
            .field("size", &self.size)
            .field("broken", &self.is_broken())
            .finish()
    }
}

// Per-rank argument records. Every rank ships its buffer shapes so that
// the release action can validate them for everybody at once.

struct BroadcastArgs<T> {
    root: usize,
    len: usize,
    data: Option<Vec<T>>,
}

struct GatherArgs<T> {
    root: usize,
    data: Vec<T>,
    recv_lens: Vec<usize>,
}

struct ScatterArgs<T> {
    root: usize,
    data: Vec<Vec<T>>,
    recv_len: usize,
}

struct AllGatherArgs<T> {
    data: Vec<T>,
    recv_lens: Vec<usize>,
}

struct AllToAllArgs<T> {
    data: Vec<Vec<T>>,
    recv_lens: Vec<usize>,
}

struct ReduceArgs<T> {
    root: usize,
    op: ReduceOp,
    data: Vec<T>,
    recv_len: usize,
}

impl CollectiveGroup {
    /// Create a group of `size` ranks.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(KError::InvalidArgument("group size must be positive".into()));
        }
        Ok(Self {
            size,
            seqs: (0..size).map(|_| AtomicU64::new(0)).collect(),
            state: Mutex::new(GroupState::default()),
            released: Condvar::new(),
            broken: AtomicBool::new(false),
        })
    }

    pub fn with_options(opts: &GroupOptions) -> Result<Self> {
        Self::new(opts.size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether a fatal failure has made the group unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn check_rank(&self, rank: usize) -> Result<()> {
        if rank < self.size {
            Ok(())
        } else {
            Err(KError::InvalidRank { rank, size: self.size })
        }
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_broken() {
            let state = self.lock()?;
            let reason = state.broken.clone().unwrap_or_else(|| "group broken".into());
            return Err(KError::Communication(reason));
        }
        Ok(())
    }

    /// Mark the group broken on behalf of `rank`, waking every blocked rank.
    pub fn abort(&self, rank: usize, reason: &str) {
        // A poisoned lock already fails every waiter.
        if let Ok(mut state) = self.state.lock() {
            self.break_locked(&mut state, format!("rank {rank}: {reason}"));
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| KError::comm("collective state poisoned by a failed rank"))
    }

    fn break_locked(&self, state: &mut GroupState, reason: String) {
        if state.broken.is_none() {
            tracing::warn!(%reason, "collective group broken");
            state.broken = Some(reason);
        }
        self.broken.store(true, Ordering::Release);
        self.released.notify_all();
    }

    /// Core rendezvous: deposit `input`, wait for all ranks, return this
    /// rank's share of the release result.
    fn rendezvous<I, O, F>(&self, rank: usize, kind: OpKind, input: I, release: F) -> Result<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(Vec<I>) -> Result<Vec<O>>,
    {
        self.check_rank(rank)?;
        let seq = self.seqs[rank].fetch_add(1, Ordering::Relaxed);
        let size = self.size;
        let mut state = self.lock()?;
        if let Some(reason) = &state.broken {
            return Err(KError::Communication(reason.clone()));
        }

        let entry = state
            .ops
            .entry(seq)
            .or_insert_with(|| Rendezvous::new(kind, size));
        if entry.kind != kind {
            let err = KError::CollectiveMismatch {
                seq,
                expected: entry.kind.name(),
                found: kind.name(),
            };
            self.break_locked(&mut state, err.to_string());
            return Err(err);
        }
        entry.inputs[rank] = Some(Box::new(input));
        entry.arrived += 1;

        if entry.arrived == size {
            let inputs: Vec<Payload> = entry.inputs.iter_mut().filter_map(Option::take).collect();
            let typed: Option<Vec<I>> = inputs
                .into_iter()
                .map(|p| p.downcast::<I>().ok().map(|b| *b))
                .collect();
            let outcome = match typed {
                None => Outcome::Failed(KError::InvalidArgument(format!(
                    "{kind} called with different element types on different ranks"
                ))),
                Some(typed) => match release(typed) {
                    Ok(outs) => Outcome::Done(
                        outs.into_iter().map(|o| Some(Box::new(o) as Payload)).collect(),
                    ),
                    Err(e) => Outcome::Failed(e),
                },
            };
            entry.outcome = Some(outcome);
            self.released.notify_all();
        } else {
            state = self
                .released
                .wait_while(state, |s| {
                    s.broken.is_none()
                        && s.ops.get(&seq).is_some_and(|r| r.outcome.is_none())
                })
                .map_err(|_| KError::comm("collective state poisoned by a failed rank"))?;
        }

        let broken = state.broken.clone();
        let entry = state
            .ops
            .get_mut(&seq)
            .ok_or_else(|| KError::comm(format!("{kind} #{seq} vanished before release")))?;
        let result = match entry.outcome.as_mut() {
            Some(Outcome::Done(outs)) => outs[rank]
                .take()
                .and_then(|b| b.downcast::<O>().ok())
                .map(|b| *b)
                .ok_or_else(|| KError::comm(format!("{kind} #{seq} produced no result for rank {rank}"))),
            Some(Outcome::Failed(e)) => Err(e.clone()),
            None => Err(KError::Communication(
                broken.unwrap_or_else(|| "group broken".into()),
            )),
        };
        entry.collected += 1;
        if entry.collected == size {
            state.ops.remove(&seq);
        }
        result
    }

    fn check_root(&self, roots: impl IntoIterator<Item = usize>) -> Result<usize> {
        let mut roots = roots.into_iter();
        let root = roots.next().unwrap_or(0);
        if root >= self.size {
            return Err(KError::InvalidRank { rank: root, size: self.size });
        }
        if roots.any(|r| r != root) {
            return Err(KError::InvalidArgument("ranks disagree on the root".into()));
        }
        Ok(root)
    }

    /// Block until all ranks have called `barrier`.
    pub fn barrier(&self, rank: usize) -> Result<()> {
        let size = self.size;
        self.rendezvous(rank, OpKind::Barrier, (), |_| Ok(vec![(); size]))
    }

    /// Copy root's `buf` into every other rank's `buf`.
    pub fn broadcast<T>(&self, rank: usize, buf: &mut [T], root: usize) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let args = BroadcastArgs {
            root,
            len: buf.len(),
            data: (rank == root).then(|| buf.to_vec()),
        };
        let out: Option<Vec<T>> =
            self.rendezvous(rank, OpKind::Broadcast, args, |mut args: Vec<BroadcastArgs<T>>| {
                let root = self.check_root(args.iter().map(|a| a.root))?;
                let data = args[root]
                    .data
                    .take()
                    .ok_or_else(|| KError::comm("broadcast root supplied no data"))?;
                if let Some(bad) = args.iter().find(|a| a.len != data.len()) {
                    return Err(KError::SizeMismatch { expected: data.len(), actual: bad.len });
                }
                Ok((0..args.len())
                    .map(|r| (r != root).then(|| data.clone()))
                    .collect())
            })?;
        if let Some(data) = out {
            buf.clone_from_slice(&data);
        }
        Ok(())
    }

    /// Collect every rank's `send` into `recv[rank]` on `root`.
    ///
    /// `recv` must hold one slot per rank, each as long as that rank's
    /// `send`; it is ignored on non-root ranks.
    pub fn gather<T>(&self, rank: usize, send: &[T], recv: &mut [Vec<T>], root: usize) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let args = GatherArgs {
            root,
            data: send.to_vec(),
            recv_lens: recv.iter().map(Vec::len).collect(),
        };
        let size = self.size;
        let out: Option<Vec<Vec<T>>> =
            self.rendezvous(rank, OpKind::Gather, args, |args: Vec<GatherArgs<T>>| {
                let root = self.check_root(args.iter().map(|a| a.root))?;
                check_slots(&args[root].recv_lens, args.iter().map(|a| a.data.len()), size)?;
                let mut outs: Vec<Option<Vec<Vec<T>>>> = (0..size).map(|_| None).collect();
                outs[root] = Some(args.into_iter().map(|a| a.data).collect());
                Ok(outs)
            })?;
        if let Some(parts) = out {
            for (slot, part) in recv.iter_mut().zip(parts) {
                slot.clone_from_slice(&part);
            }
        }
        Ok(())
    }

    /// Hand `send[rank]` from `root` to each rank's `recv`.
    ///
    /// `send` is only read on root and must hold one buffer per rank.
    pub fn scatter<T>(&self, rank: usize, send: &[Vec<T>], recv: &mut [T], root: usize) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let args = ScatterArgs {
            root,
            data: if rank == root { send.to_vec() } else { Vec::new() },
            recv_len: recv.len(),
        };
        let size = self.size;
        let out: Vec<T> = self.rendezvous(rank, OpKind::Scatter, args, |mut args: Vec<ScatterArgs<T>>| {
            let root = self.check_root(args.iter().map(|a| a.root))?;
            let data = std::mem::take(&mut args[root].data);
            if data.len() != size {
                return Err(KError::SizeMismatch { expected: size, actual: data.len() });
            }
            let recv_lens: Vec<usize> = args.iter().map(|a| a.recv_len).collect();
            check_slots(&recv_lens, data.iter().map(Vec::len), size)?;
            Ok(data)
        })?;
        recv.clone_from_slice(&out);
        Ok(())
    }

    /// Every rank receives every rank's `send`, indexed by source rank.
    pub fn all_gather<T>(&self, rank: usize, send: &[T], recv: &mut [Vec<T>]) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let args = AllGatherArgs {
            data: send.to_vec(),
            recv_lens: recv.iter().map(Vec::len).collect(),
        };
        let size = self.size;
        let out: Vec<Vec<T>> =
            self.rendezvous(rank, OpKind::AllGather, args, |args: Vec<AllGatherArgs<T>>| {
                for a in &args {
                    check_slots(&a.recv_lens, args.iter().map(|b| b.data.len()), size)?;
                }
                let data: Vec<Vec<T>> = args.into_iter().map(|a| a.data).collect();
                Ok(vec![data; size])
            })?;
        for (slot, part) in recv.iter_mut().zip(out) {
            slot.clone_from_slice(&part);
        }
        Ok(())
    }

    /// Personalized exchange: after the call `recv[j]` on rank `i` holds
    /// what rank `j` passed as `send[i]`.
    pub fn all_to_all<T>(&self, rank: usize, send: &[Vec<T>], recv: &mut [Vec<T>]) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let args = AllToAllArgs {
            data: send.to_vec(),
            recv_lens: recv.iter().map(Vec::len).collect(),
        };
        let size = self.size;
        let out: Vec<Vec<T>> =
            self.rendezvous(rank, OpKind::AllToAll, args, |mut args: Vec<AllToAllArgs<T>>| {
                if let Some(bad) = args.iter().find(|a| a.data.len() != size) {
                    return Err(KError::SizeMismatch { expected: size, actual: bad.data.len() });
                }
                for i in 0..size {
                    let incoming = args.iter().map(|a| a.data[i].len());
                    check_slots(&args[i].recv_lens, incoming, size)?;
                }
                let mut outs: Vec<Vec<Vec<T>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
                for a in args.iter_mut() {
                    for (dest, part) in a.data.drain(..).enumerate() {
                        outs[dest].push(part);
                    }
                }
                Ok(outs)
            })?;
        for (slot, part) in recv.iter_mut().zip(out) {
            slot.clone_from_slice(&part);
        }
        Ok(())
    }

    /// Combine every rank's `send` with `op` into root's `recv`.
    ///
    /// The fold starts from `op`'s identity and takes contributions in rank
    /// order 0..P, so floating-point results are reproducible run to run.
    /// `recv` is ignored on non-root ranks.
    pub fn reduce<T>(&self, rank: usize, send: &[T], recv: &mut [T], op: ReduceOp, root: usize) -> Result<()>
    where
        T: Reducible,
    {
        let args = ReduceArgs { root, op, data: send.to_vec(), recv_len: recv.len() };
        let size = self.size;
        let out: Option<Vec<T>> =
            self.rendezvous(rank, OpKind::Reduce, args, |args: Vec<ReduceArgs<T>>| {
                let root = self.check_root(args.iter().map(|a| a.root))?;
                let acc = fold_checked(&args, &[args[root].recv_len])?;
                let mut outs: Vec<Option<Vec<T>>> = (0..size).map(|_| None).collect();
                outs[root] = Some(acc);
                Ok(outs)
            })?;
        if let Some(acc) = out {
            recv.copy_from_slice(&acc);
        }
        Ok(())
    }

    /// Like [`reduce`](Self::reduce) but every rank receives the result.
    ///
    /// Bit-identical to a reduce to rank 0 followed by a broadcast: one
    /// rank-ordered fold is computed and copied to all ranks.
    pub fn all_reduce<T>(&self, rank: usize, send: &[T], recv: &mut [T], op: ReduceOp) -> Result<()>
    where
        T: Reducible,
    {
        let args = ReduceArgs { root: 0, op, data: send.to_vec(), recv_len: recv.len() };
        let size = self.size;
        let acc: Vec<T> = self.rendezvous(rank, OpKind::AllReduce, args, |args: Vec<ReduceArgs<T>>| {
            let recv_lens: Vec<usize> = args.iter().map(|a| a.recv_len).collect();
            let acc = fold_checked(&args, &recv_lens)?;
            Ok(vec![acc; size])
        })?;
        recv.copy_from_slice(&acc);
        Ok(())
    }

    /// Build `rank`'s point-to-point channel.
    ///
    /// Collective: every rank must call this exactly once, concurrently.
    /// For each unordered pair `(i, j)`, `i < j`, rank `i` creates the links
    /// for both directions and ships `j`'s ends through the rendezvous.
    pub fn create_channel(self: &Arc<Self>, rank: usize) -> Result<Channel> {
        self.check_rank(rank)?;
        let _span = tracing::debug_span!("create_channel", rank, size = self.size).entered();
        let size = self.size;
        let mut mine: Vec<Option<LinkEnds>> = (0..size).map(|_| None).collect();
        let mut theirs: Vec<Option<LinkEnds>> = (0..size).map(|_| None).collect();
        for peer in rank + 1..size {
            let (here, there) = LinkEnds::pair();
            mine[peer] = Some(here);
            theirs[peer] = Some(there);
        }
        let received: Vec<Option<LinkEnds>> =
            self.rendezvous(rank, OpKind::Handshake, theirs, |mut args: Vec<Vec<Option<LinkEnds>>>| {
                Ok((0..size)
                    .map(|j| (0..size).map(|i| args[i][j].take()).collect::<Vec<_>>())
                    .collect())
            })?;
        for (peer, ends) in received.into_iter().enumerate() {
            if peer < rank {
                mine[peer] = ends;
            }
        }
        Ok(Channel::new(rank, Arc::clone(self), mine))
    }
}

/// `slots[r]` must equal the r-th incoming length, with one slot per rank.
fn check_slots(slots: &[usize], incoming: impl Iterator<Item = usize>, size: usize) -> Result<()> {
    if slots.len() != size {
        return Err(KError::SizeMismatch { expected: size, actual: slots.len() });
    }
    for (&slot, len) in slots.iter().zip(incoming) {
        if slot != len {
            return Err(KError::SizeMismatch { expected: len, actual: slot });
        }
    }
    Ok(())
}

fn fold_checked<T: Reducible>(args: &[ReduceArgs<T>], recv_lens: &[usize]) -> Result<Vec<T>> {
    let op = args[0].op;
    if args.iter().any(|a| a.op != op) {
        return Err(KError::InvalidArgument("ranks disagree on the reduction operator".into()));
    }
    reduce::check_supported::<T>(op)?;
    let len = args[0].data.len();
    if let Some(bad) = args.iter().find(|a| a.data.len() != len) {
        return Err(KError::SizeMismatch { expected: len, actual: bad.data.len() });
    }
    if let Some(&bad) = recv_lens.iter().find(|&&l| l != len) {
        return Err(KError::SizeMismatch { expected: len, actual: bad });
    }
    Ok(reduce::reduce_in_rank_order(op, len, args.iter().map(|a| &a.data[..])))
}

/// Run `f` on `size` rank threads sharing one group, returning the per-rank
/// results in rank order.
///
/// Each thread builds its own [`Channel`] before calling `f`. A panic on any
/// rank breaks the group (so blocked peers fail instead of hanging) and is
/// re-raised here once all threads have finished.
pub fn run<R, F>(size: usize, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(Arc<Channel>) -> R + Sync,
{
    let group = Arc::new(CollectiveGroup::new(size)?);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for rank in 0..size {
            let g = Arc::clone(&group);
            let f = &f;
            let spawned = std::thread::Builder::new()
                .name(format!("vmpi-rank-{rank}"))
                .spawn_scoped(scope, move || -> Result<R> {
                    let channel = Arc::new(g.create_channel(rank)?);
                    Ok(f(channel))
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    group.abort(rank, &format!("failed to spawn rank thread: {e}"));
                    break;
                }
            }
        }
        let spawned = handles.len();
        let mut results = Vec::with_capacity(size);
        let mut panic = None;
        for h in handles {
            match h.join() {
                Ok(r) => results.push(r),
                Err(p) => {
                    panic.get_or_insert(p);
                }
            }
        }
        if let Some(p) = panic {
            std::panic::resume_unwind(p);
        }
        if spawned < size {
            return Err(KError::comm(format!("only {spawned} of {size} rank threads started")));
        }
        results.into_iter().collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_group_is_rejected() {
        assert!(CollectiveGroup::new(0).is_err());
    }

    #[test]
    fn single_rank_collectives_are_local() {
        let group = CollectiveGroup::new(1).unwrap();
        group.barrier(0).unwrap();
        let mut buf = vec![3, 4];
        group.broadcast(0, &mut buf, 0).unwrap();
        assert_eq!(buf, vec![3, 4]);
        let mut out = vec![0.0; 2];
        group.all_reduce(0, &[1.5, -2.0], &mut out, ReduceOp::Sum).unwrap();
        assert_eq!(out, vec![1.5, -2.0]);
        let mut gathered = vec![vec![0u8; 3]];
        group.gather(0, &[1, 2, 3], &mut gathered, 0).unwrap();
        assert_eq!(gathered, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn out_of_range_rank() {
        let group = CollectiveGroup::new(2).unwrap();
        assert_eq!(group.barrier(2), Err(KError::InvalidRank { rank: 2, size: 2 }));
    }

    #[test]
    fn abort_breaks_group() {
        let group = CollectiveGroup::new(2).unwrap();
        group.abort(1, "test abort");
        assert!(group.is_broken());
        assert!(matches!(group.barrier(0), Err(KError::Communication(_))));
    }

    #[test]
    fn run_returns_results_in_rank_order() {
        let results = run(3, |ch| (ch.rank(), ch.size(), ch.group().is_broken())).unwrap();
        assert_eq!(results, vec![(0, 3, false), (1, 3, false), (2, 3, false)]);
    }

    #[test]
    fn mismatched_kinds_are_detected() {
        let results = run(2, |ch| {
            if ch.rank() == 0 { ch.barrier() } else { ch.all_reduce_scalar(1u32, ReduceOp::Sum).map(|_| ()) }
        })
        .unwrap();
        for r in results {
            assert!(r.unwrap_err().is_fatal());
        }
    }
}
