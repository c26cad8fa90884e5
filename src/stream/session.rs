//! State shared between the driver thread and control threads.
//!
//! Only the session phase and the outstanding-transfer count are touched from
//! more than one thread. Both live behind one `parking_lot::Mutex`, and every
//! transport submission and cancellation happens while holding it, so a
//! cancel can never slip between "phase is RUNNING" and "transfer submitted".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::transport::{CompletionSender, StreamEvent, SubmitError, TransferRequest, Transport};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Phase of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No session.
    Idle,
    /// Transfers are being submitted and resubmitted.
    Running,
    /// No new submissions; waiting for in-flight transfers to finish.
    Draining,
    /// All transfers finished and buffers released.
    Stopped,
    /// No transfer could be submitted at start.
    FailedStart,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current phase.
    pub phase: SessionPhase,
    /// Submitted transfers whose completion has not been processed.
    pub outstanding: usize,
}

impl SessionSnapshot {
    pub(crate) const IDLE: SessionSnapshot = SessionSnapshot {
        phase: SessionPhase::Idle,
        outstanding: 0,
    };
}

/// Why a session left RUNNING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StopCause {
    Cancelled,
    DeviceLost(String),
}

struct SessionState {
    phase: SessionPhase,
    outstanding: usize,
    cause: Option<StopCause>,
}

/// A submission that did not reach the transport.
pub(crate) enum SubmitRefused {
    /// The session is no longer RUNNING.
    NotRunning(TransferRequest),
    /// The transport refused it.
    Rejected(SubmitError),
}

pub(crate) struct SessionShared {
    id: u64,
    state: Mutex<SessionState>,
    transport: Arc<dyn Transport>,
    events: CompletionSender,
}

impl SessionShared {
    pub(crate) fn new(transport: Arc<dyn Transport>, events: CompletionSender) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Running,
                outstanding: 0,
                cause: None,
            }),
            transport,
            events,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn completion_sender(&self) -> &CompletionSender {
        &self.events
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            phase: state.phase,
            outstanding: state.outstanding,
        }
    }

    /// Submit `request` if and only if the session is RUNNING.
    pub(crate) fn try_submit(&self, request: TransferRequest) -> Result<(), SubmitRefused> {
        let mut state = self.state.lock();
        if state.phase != SessionPhase::Running {
            return Err(SubmitRefused::NotRunning(request));
        }
        self.transport
            .submit(request)
            .map_err(SubmitRefused::Rejected)?;
        state.outstanding += 1;
        Ok(())
    }

    /// Account for one processed completion.
    pub(crate) fn transfer_finished(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.outstanding > 0, "completion without submission");
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    /// RUNNING -> DRAINING on user request. Returns whether this call made the
    /// transition.
    pub(crate) fn request_cancel(&self) -> bool {
        let transitioned = self.begin_drain(StopCause::Cancelled);
        if transitioned {
            info!(session = self.id, "Cancellation requested");
            let _ = self.events.send(StreamEvent::Wake);
        }
        transitioned
    }

    /// RUNNING -> DRAINING because the device can no longer stream.
    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        self.begin_drain(StopCause::DeviceLost(reason.into()))
    }

    fn begin_drain(&self, cause: StopCause) -> bool {
        let mut state = self.state.lock();
        if state.phase != SessionPhase::Running {
            return false;
        }
        state.phase = SessionPhase::Draining;
        debug!(session = self.id, outstanding = state.outstanding, ?cause, "Draining");
        state.cause = Some(cause);
        self.transport.cancel_pending();
        true
    }

    pub(crate) fn stop_cause(&self) -> Option<StopCause> {
        self.state.lock().cause.clone()
    }

    /// Enter `terminal` (STOPPED or FAILED_START) and report why the session
    /// left RUNNING.
    pub(crate) fn finish(&self, terminal: SessionPhase) -> Option<StopCause> {
        let mut state = self.state.lock();
        debug_assert_eq!(state.outstanding, 0);
        if !matches!(state.phase, SessionPhase::Stopped | SessionPhase::FailedStart) {
            state.phase = terminal;
        }
        state.cause.take()
    }
}

impl fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// The device's single session slot.
pub(crate) type SessionSlot = Mutex<Option<Arc<SessionShared>>>;

/// Cancels a streaming session from any thread.
///
/// A handle from [`Device::cancel_handle`](crate::Device::cancel_handle)
/// targets whatever session is active on the device at the time of the call.
/// A handle from [`ActiveSession::cancel_handle`](super::ActiveSession::cancel_handle)
/// is bound to that one session and does nothing once it has stopped.
#[derive(Clone)]
pub struct CancelHandle {
    target: CancelTarget,
}

#[derive(Clone)]
enum CancelTarget {
    Device(Arc<SessionSlot>),
    Session(Weak<SessionShared>),
}

impl CancelHandle {
    pub(crate) fn for_device(slot: Arc<SessionSlot>) -> Self {
        Self {
            target: CancelTarget::Device(slot),
        }
    }

    pub(crate) fn for_session(shared: &Arc<SessionShared>) -> Self {
        Self {
            target: CancelTarget::Session(Arc::downgrade(shared)),
        }
    }

    fn session(&self) -> Option<Arc<SessionShared>> {
        match &self.target {
            CancelTarget::Device(slot) => slot.lock().clone(),
            CancelTarget::Session(weak) => weak.upgrade(),
        }
    }

    /// Ask the session to stop. Returns immediately.
    ///
    /// Returns `true` if a RUNNING session was moved to DRAINING, `false` if
    /// there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        match self.session() {
            Some(shared) => shared.request_cancel(),
            None => false,
        }
    }

    /// Whether the targeted session is still RUNNING or DRAINING.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session().is_some_and(|shared| {
            matches!(
                shared.snapshot().phase,
                SessionPhase::Running | SessionPhase::Draining
            )
        })
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
