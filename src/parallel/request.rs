//! Handles for non-blocking point-to-point operations.

use crate::error::{KError, Result};
use std::sync::mpsc::{Receiver, TryRecvError};

/// A handle to an in-flight `isend`/`irecv`.
///
/// The transfer runs on a worker lane of the issuing channel. `wait` blocks
/// until it has finished and re-raises its failure. Dropping a request
/// without waiting detaches it: the transfer still completes, its result is
/// discarded.
#[must_use = "a request must be waited on to observe failures"]
pub struct Request<T> {
    rx: Receiver<Result<T>>,
    ready: Option<Result<T>>,
}

impl<T> Request<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx, ready: None }
    }

    /// Poll for completion without blocking.
    pub fn test(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(r) => {
                self.ready = Some(r);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.ready = Some(Err(KError::comm("transfer worker exited without reporting")));
                true
            }
        }
    }

    /// Block until the transfer completes.
    pub fn wait(self) -> Result<T> {
        match self.ready {
            Some(r) => r,
            None => self
                .rx
                .recv()
                .map_err(|_| KError::comm("transfer worker exited without reporting"))?,
        }
    }
}

/// Wait for every request, returning the results in order.
///
/// All requests are waited on even if one fails; the first failure is
/// returned.
pub fn wait_all<T>(requests: Vec<Request<T>>) -> Result<Vec<T>> {
    let mut first_err = None;
    let mut out = Vec::with_capacity(requests.len());
    for req in requests {
        match req.wait() {
            Ok(v) => out.push(v),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}
