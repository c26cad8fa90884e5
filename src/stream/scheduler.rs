//! Transfer scheduler: owns the buffer pool and the per-slot transfers of one
//! session and keeps them circulating through the transport.
//!
//! All methods run on the driver thread. The only state shared with other
//! threads is the phase and outstanding count in [`SessionShared`].

use std::sync::Arc;

use osmosdr_pool::{BufferPool, PoolStats};
use tracing::{debug, error, trace, warn};

use super::session::{SessionShared, SubmitRefused};
use super::transfer::{Transfer, TransferStatus};
use crate::error::{Result, TransportError};
use crate::transport::{Completion, SubmitError, TransferOutcome, TransferRequest};

/// What the driver should do after a completion was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextStep {
    /// Slot holds data: dispatch it, then resubmit.
    Dispatch(usize),
    /// Slot failed: resubmit without dispatching.
    Retry(usize),
    /// Nothing to do (cancelled transfer).
    Idle,
}

/// Transfer counters of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Transfers that delivered data.
    pub completed: u64,
    /// Transfers that failed at the transport, including refused submissions.
    pub failed: u64,
    /// Transfers cancelled while draining.
    pub cancelled: u64,
    /// Submissions after the initial round.
    pub resubmissions: u64,
}

/// Back-to-back submissions of one slot tried when the failure cap is
/// disabled.
const SUBMIT_ATTEMPTS: u32 = 16;

pub(crate) struct TransferScheduler {
    pool: BufferPool,
    transfers: Vec<Transfer>,
    shared: Arc<SessionShared>,
    max_consecutive_failures: u32,
    stats: SchedulerStats,
}

impl TransferScheduler {
    pub(crate) fn new(
        pool: BufferPool,
        shared: Arc<SessionShared>,
        max_consecutive_failures: u32,
    ) -> Self {
        let transfers = (0..pool.buf_num()).map(|_| Transfer::new()).collect();
        Self {
            pool,
            transfers,
            shared,
            max_consecutive_failures,
            stats: SchedulerStats::default(),
        }
    }

    /// Submit every transfer in slot order. Returns how many reached the
    /// transport.
    pub(crate) fn submit_all(&mut self) -> Result<usize> {
        let mut submitted = 0;
        for index in 0..self.transfers.len() {
            if self.submit(index)? {
                submitted += 1;
            }
        }
        debug!(
            session = self.shared.id(),
            submitted,
            buf_num = self.transfers.len(),
            "Initial transfers submitted"
        );
        Ok(submitted)
    }

    /// Process one completion: return its buffer to the pool and update the
    /// transfer.
    pub(crate) fn on_complete(&mut self, completion: Completion) -> Result<NextStep> {
        let Completion { buffer, outcome } = completion;
        let index = buffer.slot();
        self.shared.transfer_finished();

        let step = match outcome {
            TransferOutcome::Completed => {
                trace!(slot = index, len = buffer.filled(), "Transfer completed");
                self.pool.restore_ready(buffer)?;
                self.transfers[index].mark_completed();
                self.stats.completed += 1;
                NextStep::Dispatch(index)
            }
            TransferOutcome::Failed(error) => {
                self.pool.restore_free(buffer)?;
                self.record_failure(index, error);
                NextStep::Retry(index)
            }
            TransferOutcome::Cancelled => {
                self.pool.restore_free(buffer)?;
                self.transfers[index].mark_cancelled();
                self.stats.cancelled += 1;
                NextStep::Idle
            }
        };
        self.check_invariants();
        Ok(step)
    }

    /// Bytes of a slot whose transfer just completed.
    pub(crate) fn ready_data_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.pool.ready_data_mut(index)
    }

    /// Put a completed or failed transfer back in flight, reusing its buffer.
    ///
    /// Does nothing once the session has left RUNNING.
    pub(crate) fn resubmit(&mut self, index: usize) -> Result<bool> {
        let Some(transfer) = self.transfers.get(index) else {
            return Ok(false);
        };
        if !transfer.status().is_resubmittable() {
            return Ok(false);
        }
        let submitted = self.submit(index)?;
        if submitted {
            self.stats.resubmissions += 1;
        }
        self.check_invariants();
        Ok(submitted)
    }

    fn submit(&mut self, index: usize) -> Result<bool> {
        let mut attempts = 0u32;
        loop {
            let buffer = self.pool.lend(index)?;
            let request = TransferRequest {
                buffer,
                completions: self.shared.completion_sender().clone(),
            };

            match self.shared.try_submit(request) {
                Ok(()) => {
                    self.transfers[index].mark_pending();
                    return Ok(true);
                }
                Err(SubmitRefused::NotRunning(request)) => {
                    self.pool.restore_free(request.buffer)?;
                    return Ok(false);
                }
                Err(SubmitRefused::Rejected(SubmitError { request, error })) => {
                    self.pool.restore_free(request.buffer)?;
                    debug!(slot = index, %error, "Transport refused submission");
                    attempts += 1;
                    let fatal = error.is_fatal();
                    self.record_failure(index, error);
                    if fatal {
                        return Ok(false);
                    }
                    // No completion will arrive for a refused request, so the
                    // slot only stays in rotation if it is submitted again here.
                    if self.max_consecutive_failures == 0 && attempts >= SUBMIT_ATTEMPTS {
                        error!(
                            session = self.shared.id(),
                            slot = index,
                            attempts,
                            "Transport keeps refusing submissions; giving up on device"
                        );
                        self.shared
                            .fail(format!("slot {index} refused {attempts} submissions in a row"));
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn record_failure(&mut self, index: usize, error: TransportError) {
        self.stats.failed += 1;
        let fatal = error.is_fatal();
        let run = self.transfers[index].mark_failed();

        if fatal {
            error!(session = self.shared.id(), slot = index, %error, "Device lost");
            self.shared.fail(error.to_string());
        } else if self.max_consecutive_failures > 0 && run >= self.max_consecutive_failures {
            error!(
                session = self.shared.id(),
                slot = index,
                consecutive = run,
                %error,
                "Transfer keeps failing; giving up on device"
            );
            self.shared
                .fail(format!("slot {index} failed {run} times in a row: {error}"));
        } else {
            warn!(slot = index, consecutive = run, %error, "Transfer failed; resubmitting");
        }
    }

    /// Outstanding count equals the number of PENDING transfers.
    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            let pending = self
                .transfers
                .iter()
                .filter(|t| t.status() == TransferStatus::Pending)
                .count();
            debug_assert_eq!(self.shared.snapshot().outstanding, pending);
            debug_assert_eq!(self.pool.lent_count(), pending);
        }
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn status(&self, index: usize) -> TransferStatus {
        self.transfers[index].status()
    }

    /// Release the pool. Only valid once nothing is outstanding.
    pub(crate) fn release(self) -> Result<PoolStats> {
        Ok(self.pool.release()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::session::{SessionPhase, StopCause};
    use crate::transport::mock::{FaultScenario, MockOptions, MockTransport};
    use crate::transport::StreamEvent;
    use tokio::sync::mpsc;

    struct Harness {
        scheduler: TransferScheduler,
        shared: Arc<SessionShared>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        _transport: Arc<MockTransport>,
    }

    fn harness(options: MockOptions, buf_num: usize, max_failures: u32) -> Harness {
        let transport = Arc::new(MockTransport::new(options).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::new(transport.clone(), tx));
        let pool = BufferPool::allocate(buf_num, 512).unwrap();
        Harness {
            scheduler: TransferScheduler::new(pool, Arc::clone(&shared), max_failures),
            shared,
            events: rx,
            _transport: transport,
        }
    }

    fn next(h: &mut Harness) -> Completion {
        loop {
            match h.events.blocking_recv() {
                Some(StreamEvent::Completed(c)) => return c,
                Some(StreamEvent::Wake) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    #[test]
    fn test_submit_all_marks_pending() {
        let mut h = harness(MockOptions::default(), 4, 0);
        assert_eq!(h.scheduler.submit_all().unwrap(), 4);
        assert_eq!(h.shared.snapshot().outstanding, 4);
        assert!((0..4).all(|i| h.scheduler.status(i) == TransferStatus::Pending));
    }

    #[test]
    fn test_completion_then_resubmit() {
        let mut h = harness(MockOptions::default(), 2, 0);
        h.scheduler.submit_all().unwrap();

        let c = next(&mut h);
        let step = h.scheduler.on_complete(c).unwrap();
        let NextStep::Dispatch(slot) = step else {
            panic!("expected dispatch, got {step:?}");
        };
        assert_eq!(h.scheduler.ready_data_mut(slot).unwrap().len(), 512);
        assert_eq!(h.shared.snapshot().outstanding, 1);

        assert!(h.scheduler.resubmit(slot).unwrap());
        assert_eq!(h.scheduler.status(slot), TransferStatus::Pending);
        assert_eq!(h.shared.snapshot().outstanding, 2);
        assert_eq!(h.scheduler.stats().resubmissions, 1);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let options = MockOptions::default().with_fault(FaultScenario::FailSlotOnce {
            slot: 0,
            error: TransportError::Stall,
        });
        let mut h = harness(options, 1, 0);
        h.scheduler.submit_all().unwrap();

        let completion = next(&mut h);
        let step = h.scheduler.on_complete(completion).unwrap();
        assert_eq!(step, NextStep::Retry(0));
        assert_eq!(h.scheduler.status(0), TransferStatus::Failed);
        assert!(h.scheduler.resubmit(0).unwrap());

        let completion = next(&mut h);
        let step = h.scheduler.on_complete(completion).unwrap();
        assert_eq!(step, NextStep::Dispatch(0));
        assert_eq!(h.shared.snapshot().phase, SessionPhase::Running);
    }

    #[test]
    fn test_refused_resubmission_keeps_slot_in_rotation() {
        let options = MockOptions::default().with_fault(FaultScenario::RejectNthSubmission {
            n: 2,
            error: TransportError::Stall,
        });
        let mut h = harness(options, 2, 0);
        assert_eq!(h.scheduler.submit_all().unwrap(), 2);

        let completion = next(&mut h);
        let NextStep::Dispatch(slot) = h.scheduler.on_complete(completion).unwrap() else {
            panic!("expected dispatch");
        };
        assert!(h.scheduler.resubmit(slot).unwrap());
        assert_eq!(h.scheduler.status(slot), TransferStatus::Pending);
        assert_eq!(h.shared.snapshot().outstanding, 2);
        assert_eq!(h.shared.snapshot().phase, SessionPhase::Running);

        let stats = h.scheduler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.resubmissions, 1);
    }

    #[test]
    fn test_refusals_count_toward_failure_cap() {
        let options = MockOptions::default()
            .with_fault(FaultScenario::RejectNthSubmission {
                n: 0,
                error: TransportError::Stall,
            })
            .with_fault(FaultScenario::RejectNthSubmission {
                n: 1,
                error: TransportError::Stall,
            });
        let mut h = harness(options, 1, 2);

        assert_eq!(h.scheduler.submit_all().unwrap(), 0);
        assert_eq!(h.scheduler.stats().failed, 2);
        assert_eq!(h.shared.snapshot().phase, SessionPhase::Draining);
        assert_eq!(h.shared.snapshot().outstanding, 0);
    }

    #[test]
    fn test_failure_cap_ends_session() {
        let options = MockOptions::default().with_fault(FaultScenario::RandomFailures { rate: 1.0 });
        let mut h = harness(options, 1, 3);
        h.scheduler.submit_all().unwrap();

        for _ in 0..2 {
            let completion = next(&mut h);
            let step = h.scheduler.on_complete(completion).unwrap();
            assert_eq!(step, NextStep::Retry(0));
            assert!(h.scheduler.resubmit(0).unwrap());
        }
        let completion = next(&mut h);
        h.scheduler.on_complete(completion).unwrap();
        assert_eq!(h.shared.snapshot().phase, SessionPhase::Draining);
        assert!(!h.scheduler.resubmit(0).unwrap());
        assert!(matches!(
            h.shared.finish(SessionPhase::Stopped),
            Some(StopCause::DeviceLost(_))
        ));
    }

    #[test]
    fn test_rejected_submissions_fail_start() {
        let options =
            MockOptions::default().with_fault(FaultScenario::DeviceLostAfter { completions: 0 });
        let mut h = harness(options, 3, 0);

        assert_eq!(h.scheduler.submit_all().unwrap(), 0);
        assert_eq!(h.scheduler.stats().failed, 1);
        assert_eq!(h.shared.snapshot().outstanding, 0);
        assert_eq!(h.shared.snapshot().phase, SessionPhase::Draining);
        h.scheduler.release().unwrap();
    }

    #[test]
    fn test_cancel_drains_and_releases() {
        let options = MockOptions::default().with_delay(std::time::Duration::from_millis(5));
        let mut h = harness(options, 4, 0);
        h.scheduler.submit_all().unwrap();
        assert!(h.shared.request_cancel());

        while h.shared.snapshot().outstanding > 0 {
            let completion = next(&mut h);
            let step = h.scheduler.on_complete(completion).unwrap();
            if let NextStep::Dispatch(slot) | NextStep::Retry(slot) = step {
                assert!(!h.scheduler.resubmit(slot).unwrap());
            }
        }
        let stats = h.scheduler.stats();
        assert_eq!(stats.completed + stats.cancelled + stats.failed, 4);
        assert_eq!(
            h.shared.finish(SessionPhase::Stopped),
            Some(StopCause::Cancelled)
        );

        let Harness { scheduler, .. } = h;
        let pool_stats = scheduler.release().unwrap();
        assert_eq!(pool_stats.lends, pool_stats.restores);
    }
}
