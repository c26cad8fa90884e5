//! FIFO of accepted transfer requests, shared by a transport and its worker
//! thread.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{TransferOutcome, TransferRequest};

struct QueueState {
    pending: VecDeque<TransferRequest>,
    closed: bool,
}

/// Submission queue serviced by one worker thread.
///
/// Every request pushed is either popped by the worker or completed here as
/// [`TransferOutcome::Cancelled`]; none is dropped silently.
pub(crate) struct SubmissionQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl SubmissionQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a request. Hands it back if the queue is closed.
    pub(crate) fn push(&self, request: TransferRequest) -> Result<(), TransferRequest> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(request);
        }
        state.pending.push_back(request);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a request is available and remove it.
    ///
    /// `pick` chooses the index to take given the queue length (front is 0).
    /// Returns `None` once the queue is closed.
    pub(crate) fn pop_blocking<F>(&self, pick: F) -> Option<TransferRequest>
    where
        F: FnOnce(usize) -> usize,
    {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if !state.pending.is_empty() {
                let len = state.pending.len();
                let index = pick(len).min(len - 1);
                return state.pending.remove(index);
            }
            self.available.wait(&mut state);
        }
    }

    /// Complete every queued request as cancelled. Returns how many.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<TransferRequest> = self.state.lock().pending.drain(..).collect();
        let count = drained.len();
        for request in drained {
            request.complete(TransferOutcome::Cancelled);
        }
        if count > 0 {
            trace!(count, "Cancelled queued transfers");
        }
        count
    }

    /// Stop the worker and cancel whatever is still queued.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
        self.cancel_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
