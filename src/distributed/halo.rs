//! Ghost-value exchange for distributed matrix products.
//!
//! A [`HaloExchange`] knows, for every peer, which locally owned entries the
//! peer needs (`send_index`) and which of the peer's entries this rank needs
//! (`recv_index`). Ghost values live in a compact buffer laid out as the
//! concatenation of the per-peer receive lists. Since every receive list is
//! sorted and peers own ascending index ranges, the buffer is sorted by
//! global index and a ghost's slot is found by binary search.
//!
//! Two directions run over the same pattern:
//! * scatter: owners push values to the ranks holding them as ghosts;
//! * gather: ghost holders push partial contributions back to the owners.

use crate::distributed::ownership::Ownership;
use crate::error::{KError, Result};
use crate::parallel::{Channel, Request};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Scatter,
    Gather,
}

/// An exchange in flight, returned by the `start_*` calls and consumed by
/// the matching `end_*` call.
#[must_use = "a started exchange must be completed with an end_* call"]
pub struct PendingExchange {
    flow: Flow,
    sends: Vec<Request<()>>,
    recvs: Vec<(usize, Request<Vec<f64>>)>,
}

impl PendingExchange {
    fn finish(self, flow: Flow) -> Result<Vec<(usize, Vec<f64>)>> {
        if self.flow != flow {
            return Err(KError::InvalidArgument(format!(
                "{:?} exchange completed as {:?}",
                self.flow, flow
            )));
        }
        let mut first_err = None;
        let mut received = Vec::with_capacity(self.recvs.len());
        for (peer, req) in self.recvs {
            match req.wait() {
                Ok(v) => received.push((peer, v)),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        for req in self.sends {
            if let Err(e) = req.wait() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(received),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HaloExchange {
    comm: Arc<Channel>,
    local_start: usize,
    local_len: usize,
    send_index: Vec<Vec<usize>>,
    recv_index: Vec<Vec<usize>>,
    ghosts: Vec<usize>,
    recv_offsets: Vec<usize>,
}

impl HaloExchange {
    /// Collective: build the exchange pattern for the non-local global
    /// indices in `referenced`, owned according to `owners`.
    ///
    /// Locally owned indices in `referenced` are skipped; duplicates are
    /// allowed. Two all-to-all rounds tell every owner what to send: first
    /// the per-peer counts, then the index lists.
    pub fn build<I>(comm: Arc<Channel>, owners: &Ownership, referenced: I) -> Result<Self>
    where
        I: IntoIterator<Item = usize>,
    {
        let rank = comm.rank();
        let size = comm.size();
        let _span = tracing::debug_span!("halo_build", rank).entered();

        let mut wanted: Vec<usize> = referenced.into_iter().collect();
        wanted.sort_unstable();
        wanted.dedup();
        let local = owners.range(rank);
        wanted.retain(|g| !local.contains(g));

        let mut recv_index = vec![Vec::new(); size];
        let partition = wanted
            .iter()
            .try_for_each(|&g| match owners.owner(g) {
                Some(p) => {
                    recv_index[p].push(g);
                    Ok(())
                }
                None => Err(KError::InvalidArgument(format!(
                    "index {g} outside global size {}",
                    owners.size()
                ))),
            });
        comm.agree(partition)?;

        let counts: Vec<Vec<usize>> = recv_index.iter().map(|v| vec![v.len()]).collect();
        let mut peer_counts = vec![vec![0usize]; size];
        comm.all_to_all(&counts, &mut peer_counts)?;

        let mut send_index: Vec<Vec<usize>> = peer_counts.iter().map(|c| vec![0usize; c[0]]).collect();
        comm.all_to_all(&recv_index, &mut send_index)?;

        let mut recv_offsets = Vec::with_capacity(size + 1);
        recv_offsets.push(0);
        for v in &recv_index {
            recv_offsets.push(recv_offsets[recv_offsets.len() - 1] + v.len());
        }

        tracing::debug!(
            ghosts = wanted.len(),
            recv_peers = recv_index.iter().filter(|v| !v.is_empty()).count(),
            send_peers = send_index.iter().filter(|v| !v.is_empty()).count(),
            "halo pattern built"
        );

        Ok(Self {
            comm,
            local_start: local.start,
            local_len: local.len(),
            send_index,
            recv_index,
            ghosts: wanted,
            recv_offsets,
        })
    }

    /// Locally owned global indices `peer` needs from this rank.
    pub fn send_index(&self, peer: usize) -> &[usize] {
        &self.send_index[peer]
    }

    /// Global indices this rank needs from `peer`.
    pub fn recv_index(&self, peer: usize) -> &[usize] {
        &self.recv_index[peer]
    }

    /// All ghost indices in buffer order.
    pub fn ghost_indices(&self) -> &[usize] {
        &self.ghosts
    }

    pub fn ghost_len(&self) -> usize {
        self.ghosts.len()
    }

    /// Buffer slot of ghost index `global`.
    pub fn slot(&self, global: usize) -> Option<usize> {
        self.ghosts.binary_search(&global).ok()
    }

    fn check_ghost_len(&self, len: usize) -> Result<()> {
        if len == self.ghosts.len() {
            Ok(())
        } else {
            Err(KError::SizeMismatch { expected: self.ghosts.len(), actual: len })
        }
    }

    fn check_local_len(&self, len: usize) -> Result<()> {
        if len == self.local_len {
            Ok(())
        } else {
            Err(KError::SizeMismatch { expected: self.local_len, actual: len })
        }
    }

    fn peer_range(&self, peer: usize) -> std::ops::Range<usize> {
        self.recv_offsets[peer]..self.recv_offsets[peer + 1]
    }

    /// Begin pushing owned values in `local` to the ranks that ghost them.
    ///
    /// `local` must hold exactly the owned block; nothing is posted otherwise.
    pub fn start_scatter(&self, local: &[f64]) -> Result<PendingExchange> {
        self.check_local_len(local.len())?;
        let mut recvs = Vec::new();
        for (peer, idx) in self.recv_index.iter().enumerate() {
            if !idx.is_empty() {
                recvs.push((peer, self.comm.irecv(vec![0.0; idx.len()], peer)?));
            }
        }
        let mut sends = Vec::new();
        for (peer, idx) in self.send_index.iter().enumerate() {
            if idx.is_empty() {
                continue;
            }
            let values: Vec<f64> = idx.iter().map(|&g| local[g - self.local_start]).collect();
            sends.push(self.comm.isend(&values, peer)?);
        }
        Ok(PendingExchange { flow: Flow::Scatter, sends, recvs })
    }

    /// Complete a scatter, overwriting the ghost buffer.
    pub fn end_set_scatter(&self, pending: PendingExchange, ghost: &mut [f64]) -> Result<()> {
        self.check_ghost_len(ghost.len())?;
        for (peer, values) in pending.finish(Flow::Scatter)? {
            ghost[self.peer_range(peer)].copy_from_slice(&values);
        }
        Ok(())
    }

    /// Complete a scatter, adding into the ghost buffer.
    pub fn end_add_scatter(&self, pending: PendingExchange, ghost: &mut [f64]) -> Result<()> {
        self.check_ghost_len(ghost.len())?;
        for (peer, values) in pending.finish(Flow::Scatter)? {
            for (g, v) in ghost[self.peer_range(peer)].iter_mut().zip(values) {
                *g += v;
            }
        }
        Ok(())
    }

    /// Begin pushing ghost-buffer contributions back to their owners.
    pub fn start_gather(&self, ghost: &[f64]) -> Result<PendingExchange> {
        self.check_ghost_len(ghost.len())?;
        let mut recvs = Vec::new();
        for (peer, idx) in self.send_index.iter().enumerate() {
            if !idx.is_empty() {
                recvs.push((peer, self.comm.irecv(vec![0.0; idx.len()], peer)?));
            }
        }
        let mut sends = Vec::new();
        for (peer, idx) in self.recv_index.iter().enumerate() {
            if !idx.is_empty() {
                let range = self.peer_range(peer);
                sends.push(self.comm.isend_range(ghost, range.start, range.len(), peer)?);
            }
        }
        Ok(PendingExchange { flow: Flow::Gather, sends, recvs })
    }

    /// Complete a gather, overwriting owned entries of `local`.
    ///
    /// The transfers are drained before `local` is checked, so a short
    /// buffer leaves the channel in step with the peers.
    pub fn end_set_gather(&self, pending: PendingExchange, local: &mut [f64]) -> Result<()> {
        let received = pending.finish(Flow::Gather)?;
        self.check_local_len(local.len())?;
        for (peer, values) in received {
            for (&g, v) in self.send_index[peer].iter().zip(values) {
                local[g - self.local_start] = v;
            }
        }
        Ok(())
    }

    /// Complete a gather, adding into owned entries of `local`.
    pub fn end_add_gather(&self, pending: PendingExchange, local: &mut [f64]) -> Result<()> {
        let received = pending.finish(Flow::Gather)?;
        self.check_local_len(local.len())?;
        for (peer, values) in received {
            for (&g, v) in self.send_index[peer].iter().zip(values) {
                local[g - self.local_start] += v;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::run;

    // Ring of 3 ranks, 2 entries each; every rank ghosts the first entry of
    // its right neighbour.
    fn ring(ch: &Arc<Channel>) -> (Ownership, HaloExchange) {
        let own = Ownership::from_sizes(&[2, 2, 2]);
        let right = (ch.rank() + 1) % 3;
        let halo = HaloExchange::build(Arc::clone(ch), &own, [own.start(right), own.start(ch.rank())]).unwrap();
        (own, halo)
    }

    #[test]
    fn pattern_is_symmetric() {
        let results = run(3, |ch| {
            let (own, halo) = ring(&ch);
            let r = ch.rank();
            let left = (r + 2) % 3;
            let right = (r + 1) % 3;
            assert_eq!(halo.recv_index(right), &[own.start(right)]);
            assert_eq!(halo.send_index(left), &[own.start(r)]);
            assert!(halo.send_index(r).is_empty() && halo.recv_index(r).is_empty());
            assert_eq!(halo.ghost_len(), 1);
            assert_eq!(halo.slot(own.start(right)), Some(0));
            let local: Vec<f64> = own.range(r).map(|g| g as f64).collect();
            let mut ghost = [0.0];
            let pending = halo.start_scatter(&local).unwrap();
            halo.end_set_scatter(pending, &mut ghost).unwrap();
            // one send lane to the left, one receive lane from the right
            assert_eq!(ch.lane_count(), 2);
        })
        .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn scatter_then_gather() {
        let results = run(3, |ch| {
            let (own, halo) = ring(&ch);
            let local: Vec<f64> = own.range(ch.rank()).map(|g| g as f64).collect();
            let mut ghost = vec![0.0; 1];
            let pending = halo.start_scatter(&local).unwrap();
            halo.end_set_scatter(pending, &mut ghost).unwrap();

            let mut back = vec![1.0; 2];
            let pending = halo.start_gather(&[10.0]).unwrap();
            halo.end_add_gather(pending, &mut back).unwrap();
            (ghost[0], back)
        })
        .unwrap();
        assert_eq!(results[0], (2.0, vec![11.0, 1.0]));
        assert_eq!(results[1], (4.0, vec![11.0, 1.0]));
        assert_eq!(results[2], (0.0, vec![11.0, 1.0]));
    }

    // Two ranks of one entry each, each ghosting the other's entry.
    fn pair(ch: &Arc<Channel>) -> HaloExchange {
        let own = Ownership::from_sizes(&[1, 1]);
        HaloExchange::build(Arc::clone(ch), &own, [1 - ch.rank()]).unwrap()
    }

    fn scatter_round(halo: &HaloExchange, value: f64) -> f64 {
        let mut ghost = [0.0];
        let pending = halo.start_scatter(&[value]).unwrap();
        halo.end_set_scatter(pending, &mut ghost).unwrap();
        ghost[0]
    }

    #[test]
    fn short_owned_block_fails_before_posting() {
        let results = run(2, |ch| {
            let halo = pair(&ch);
            let r = ch.rank() as f64;
            let rejected = if ch.rank() == 0 { Some(halo.start_scatter(&[]).map(|_| ())) } else { None };
            let first = scatter_round(&halo, 100.0 + r);
            let second = scatter_round(&halo, 200.0 + r);
            (rejected, first, second)
        })
        .unwrap();
        assert_eq!(results[0].0, Some(Err(KError::SizeMismatch { expected: 1, actual: 0 })));
        assert_eq!((results[0].1, results[0].2), (101.0, 201.0));
        assert_eq!((results[1].1, results[1].2), (100.0, 200.0));
    }

    #[test]
    fn short_gather_target_keeps_channel_in_step() {
        let results = run(2, |ch| {
            let halo = pair(&ch);
            let pending = halo.start_gather(&[5.0]).unwrap();
            let mut target = vec![1.0; 1];
            let gathered = if ch.rank() == 0 {
                halo.end_add_gather(pending, &mut [])
            } else {
                halo.end_add_gather(pending, &mut target)
            };
            (gathered, target[0], scatter_round(&halo, ch.rank() as f64))
        })
        .unwrap();
        assert_eq!(results[0].0, Err(KError::SizeMismatch { expected: 1, actual: 0 }));
        assert_eq!(results[1], (Ok(()), 6.0, 0.0));
        assert_eq!(results[0].2, 1.0);
    }

    #[test]
    fn out_of_range_index_fails_everywhere() {
        let results = run(2, |ch| {
            let own = Ownership::from_sizes(&[1, 1]);
            let refs = if ch.rank() == 0 { vec![7] } else { vec![0] };
            HaloExchange::build(Arc::clone(&ch), &own, refs).map(|_| ())
        })
        .unwrap();
        assert!(results.iter().all(|r| matches!(r, Err(KError::InvalidArgument(_)))));
    }

    #[test]
    fn mismatched_completion_is_rejected() {
        let results = run(1, |ch| {
            let own = Ownership::from_sizes(&[3]);
            let halo = HaloExchange::build(Arc::clone(&ch), &own, [0, 1]).unwrap();
            let pending = halo.start_gather(&[]).unwrap();
            halo.end_set_scatter(pending, &mut []).is_err()
        })
        .unwrap();
        assert!(results[0]);
    }
}
