//! Streaming controller: the `read_async` / `cancel_async` state machine.
//!
//! ```text
//!   IDLE ──start_session──▶ RUNNING ──cancel / device lost──▶ DRAINING
//!              │                                                  │
//!              └──no transfer accepted──▶ FAILED_START            │
//!                                                outstanding == 0 ▼
//!                                                             STOPPED
//! ```
//!
//! [`ActiveSession::run`] is the driver loop. It blocks on the completion
//! channel, hands completed buffers to the callback, resubmits their
//! transfers, and returns once the session is STOPPED and the buffer pool is
//! released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::config::StreamConfig;
use super::dispatch::{CallbackDispatcher, ReadCallback};
use super::scheduler::{NextStep, TransferScheduler};
use super::session::{
    CancelHandle, SessionPhase, SessionShared, SessionSlot, SessionSnapshot, StopCause,
};
use crate::config::StreamingSettings;
use crate::error::{Result, SdrError};
use crate::transport::{CompletionReceiver, StreamEvent, Transport};

/// Outcome of a finished streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSummary {
    /// Resolved buffer count.
    pub buf_num: u32,
    /// Resolved buffer length.
    pub buf_len: u32,
    /// Buffers handed to the callback.
    pub buffers_delivered: u64,
    /// Bytes handed to the callback.
    pub bytes_delivered: u64,
    /// Transfers that failed (and were resubmitted while running).
    pub transfer_failures: u64,
    /// Transfers cancelled while draining.
    pub cancelled_transfers: u64,
    /// Submissions after the initial round.
    pub resubmissions: u64,
    /// Callback invocations that panicked.
    pub callback_faults: u64,
    /// Wall time from start to STOPPED.
    pub duration: Duration,
}

/// A started session that has not been driven yet.
///
/// Created by [`Device::start_session`](crate::Device::start_session).
/// Dropping it without calling [`run`](Self::run) cancels the session and
/// drains it on the dropping thread.
pub struct ActiveSession {
    config: StreamConfig,
    shared: Arc<SessionShared>,
    slot: Arc<SessionSlot>,
    scheduler: Option<TransferScheduler>,
    events: CompletionReceiver,
    started: Instant,
}

impl ActiveSession {
    /// Validate, allocate and submit. The session is installed in `slot`
    /// before the first submission so it can be cancelled at once.
    pub(crate) fn start(
        slot: &Arc<SessionSlot>,
        transport: &Arc<dyn Transport>,
        config: StreamConfig,
        settings: &StreamingSettings,
    ) -> Result<Self> {
        let resolved = config.resolve(settings);
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();

        let (shared, pool) = {
            let mut active = slot.lock();
            if active.is_some() {
                return Err(SdrError::AlreadyRunning);
            }
            let pool = resolved.allocate(settings)?;
            let shared = Arc::new(SessionShared::new(Arc::clone(transport), tx));
            *active = Some(Arc::clone(&shared));
            (shared, pool)
        };

        let mut scheduler =
            TransferScheduler::new(pool, Arc::clone(&shared), settings.max_consecutive_failures);
        let submitted = scheduler.submit_all();

        let mut session = Self {
            config: resolved,
            shared,
            slot: Arc::clone(slot),
            scheduler: Some(scheduler),
            events,
            started: Instant::now(),
        };

        match submitted {
            // Cancelled from another thread before anything went out; `run`
            // returns at once.
            Ok(0) if session.shared.stop_cause() == Some(StopCause::Cancelled) => Ok(session),
            Ok(0) => {
                let message = match session.teardown(SessionPhase::FailedStart) {
                    Some(StopCause::DeviceLost(reason)) => reason,
                    _ => "no transfer could be submitted".to_string(),
                };
                error!(%message, "Streaming session failed to start");
                Err(SdrError::device_unavailable(message))
            }
            Ok(submitted) => {
                info!(
                    session = session.shared.id(),
                    buf_num = resolved.buf_num,
                    buf_len = resolved.buf_len,
                    submitted,
                    "Streaming session started"
                );
                Ok(session)
            }
            Err(e) => {
                session.shared.fail(e.to_string());
                if let Err(drain_err) = session.drain(&mut CallbackDispatcher::new(|_: &[u8]| {})) {
                    error!(error = %drain_err, "Draining aborted session failed");
                }
                session.teardown(SessionPhase::FailedStart);
                Err(e)
            }
        }
    }

    /// Resolved buffer geometry.
    #[must_use]
    pub fn config(&self) -> StreamConfig {
        self.config
    }

    /// Handle bound to this session.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::for_session(&self.shared)
    }

    /// Current phase and outstanding count.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Drive the session until it stops, invoking `callback` for every
    /// completed buffer on the calling thread.
    ///
    /// Blocks on the completion channel, so it must not be called from
    /// inside an async runtime.
    ///
    /// Returns the session summary after a cancellation, or
    /// [`SdrError::DeviceUnavailable`] if the device was lost. Either way all
    /// transfers have finished and the buffers are released when this
    /// returns.
    pub fn run<C: ReadCallback>(mut self, callback: C) -> Result<StreamSummary> {
        let mut dispatcher = CallbackDispatcher::new(callback);
        let drive_result = self.drain(&mut dispatcher);

        let scheduler_stats = self
            .scheduler
            .as_ref()
            .map(TransferScheduler::stats)
            .unwrap_or_default();
        let cause = self.teardown(SessionPhase::Stopped);
        drive_result?;

        let dispatch = dispatcher.stats();
        let summary = StreamSummary {
            buf_num: self.config.buf_num,
            buf_len: self.config.buf_len,
            buffers_delivered: dispatch.buffers,
            bytes_delivered: dispatch.bytes,
            transfer_failures: scheduler_stats.failed,
            cancelled_transfers: scheduler_stats.cancelled,
            resubmissions: scheduler_stats.resubmissions,
            callback_faults: dispatch.faults,
            duration: self.started.elapsed(),
        };

        match cause {
            Some(StopCause::DeviceLost(reason)) => {
                error!(
                    session = self.shared.id(),
                    %reason,
                    buffers = summary.buffers_delivered,
                    "Streaming session ended: device unavailable"
                );
                Err(SdrError::device_unavailable(reason))
            }
            _ => {
                info!(
                    session = self.shared.id(),
                    buffers = summary.buffers_delivered,
                    bytes = summary.bytes_delivered,
                    failures = summary.transfer_failures,
                    callback_faults = summary.callback_faults,
                    elapsed_ms = summary.duration.as_millis() as u64,
                    "Streaming session stopped"
                );
                Ok(summary)
            }
        }
    }

    /// Process completions until nothing is outstanding.
    fn drain<C: ReadCallback>(&mut self, dispatcher: &mut CallbackDispatcher<C>) -> Result<()> {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(());
        };

        loop {
            let snapshot = self.shared.snapshot();
            if snapshot.outstanding == 0 {
                if snapshot.phase == SessionPhase::Running {
                    // Every resubmission was refused.
                    self.shared.fail("no transfers in flight");
                }
                return Ok(());
            }

            match self.events.blocking_recv() {
                Some(StreamEvent::Completed(completion)) => {
                    match scheduler.on_complete(completion)? {
                        NextStep::Dispatch(slot) => {
                            if let Some(data) = scheduler.ready_data_mut(slot) {
                                dispatcher.dispatch(slot, data);
                            }
                            scheduler.resubmit(slot)?;
                        }
                        NextStep::Retry(slot) => {
                            scheduler.resubmit(slot)?;
                        }
                        NextStep::Idle => {}
                    }
                }
                Some(StreamEvent::Wake) => {
                    debug!(
                        session = self.shared.id(),
                        outstanding = snapshot.outstanding,
                        "Driver woken"
                    );
                }
                None => {
                    return Err(SdrError::device_unavailable("completion channel closed"));
                }
            }
        }
    }

    /// Enter the terminal phase, release the pool and vacate the device slot.
    fn teardown(&mut self, terminal: SessionPhase) -> Option<StopCause> {
        let cause = self.shared.finish(terminal);
        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.release() {
                error!(error = %e, "Buffer pool release failed");
            }
        }

        let mut active = self.slot.lock();
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.shared))
        {
            *active = None;
        }
        cause
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.scheduler.is_none() {
            return;
        }
        debug!(session = self.shared.id(), "Session dropped without run; cancelling");
        self.shared.request_cancel();
        if let Err(e) = self.drain(&mut CallbackDispatcher::new(|_: &[u8]| {})) {
            error!(error = %e, "Draining dropped session failed");
        }
        self.teardown(SessionPhase::Stopped);
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("config", &self.config)
            .field("snapshot", &self.shared.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{FaultScenario, MockOptions, MockTransport};
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    fn start(
        options: MockOptions,
        config: StreamConfig,
    ) -> (Arc<SessionSlot>, Result<ActiveSession>) {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(options).unwrap());
        let slot = Arc::new(Mutex::new(None));
        let session =
            ActiveSession::start(&slot, &transport, config, &StreamingSettings::default());
        (slot, session)
    }

    #[traced_test]
    #[test]
    fn test_session_lifecycle_is_logged() {
        let (slot, session) = start(MockOptions::default(), StreamConfig::new(2, 512));
        let session = session.unwrap();
        let cancel = session.cancel_handle();
        let mut seen = 0;
        let summary = session
            .run(|_: &[u8]| {
                seen += 1;
                if seen == 3 {
                    cancel.cancel();
                }
            })
            .unwrap();

        assert!(summary.buffers_delivered >= 3);
        assert!(slot.lock().is_none());
        assert!(logs_contain("Streaming session started"));
        assert!(logs_contain("Cancellation requested"));
        assert!(logs_contain("Streaming session stopped"));
    }

    #[traced_test]
    #[test]
    fn test_failed_start_is_logged() {
        let (slot, session) = start(
            MockOptions::default().with_fault(FaultScenario::DeviceLostAfter { completions: 0 }),
            StreamConfig::new(2, 512),
        );
        assert!(session.unwrap_err().is_device_unavailable());
        assert!(slot.lock().is_none());
        assert!(logs_contain("failed to start"));
    }

    #[test]
    fn test_cancel_before_run_returns_summary() {
        let (_slot, session) = start(
            MockOptions::default().with_delay(Duration::from_millis(5)),
            StreamConfig::new(4, 512),
        );
        let session = session.unwrap();
        assert!(session.cancel_handle().cancel());

        let summary = session.run(|_: &[u8]| {}).unwrap();
        assert_eq!(summary.buf_num, 4);
        assert!(summary.buffers_delivered <= 4);
        assert_eq!(
            summary.buffers_delivered + summary.cancelled_transfers + summary.transfer_failures,
            4
        );
    }

    #[test]
    fn test_invalid_geometry_leaves_slot_empty() {
        let (slot, session) = start(MockOptions::default(), StreamConfig::new(2, 500));
        assert!(session.unwrap_err().is_invalid_argument());
        assert!(slot.lock().is_none());
    }
}
