//! Transfer transports and device backends.
//!
//! A [`Transport`] accepts bulk IN transfer requests, each carrying one lent
//! [`SlotBuffer`], and reports every request exactly once as a
//! [`StreamEvent::Completed`] on the request's completion channel. The
//! streaming engine never touches the hardware directly; it only submits,
//! cancels and waits for completions.
//!
//! A [`DeviceBackend`] enumerates devices and opens them into a transport plus
//! a [`ControlPort`] for the scalar register surface.
//!
//! Two backends exist:
//!
//! - [`mock::MockBackend`]: simulated receivers with deterministic fault
//!   injection, always built
//! - `usb::UsbBackend`: libusb bulk transport via `rusb`, behind the `usb`
//!   feature

pub mod mock;
mod queue;
#[cfg(feature = "usb")]
pub mod usb;

pub(crate) use queue::SubmissionQueue;

use std::fmt;
use std::sync::Arc;

use osmosdr_pool::SlotBuffer;
use tokio::sync::mpsc;

use crate::config::{BackendKind, SdrConfig};
use crate::device::ControlPort;
use crate::error::{Result, TransportError};

/// Sender half of a session's completion channel.
pub type CompletionSender = mpsc::UnboundedSender<StreamEvent>;

/// Receiver half of a session's completion channel.
pub type CompletionReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Event delivered to the streaming driver thread.
#[derive(Debug)]
pub enum StreamEvent {
    /// A submitted transfer finished, failed, or was cancelled.
    Completed(Completion),
    /// Re-check session state (posted by `cancel_async`).
    Wake,
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Data arrived; `SlotBuffer::filled` bytes are valid.
    Completed,
    /// The transport reported an error.
    Failed(TransportError),
    /// Cancelled before or during execution.
    Cancelled,
}

/// A finished transfer, returning its buffer to the engine.
#[derive(Debug)]
pub struct Completion {
    /// The buffer that was submitted.
    pub buffer: SlotBuffer,
    /// Result of the transfer.
    pub outcome: TransferOutcome,
}

/// One bulk IN transfer request.
pub struct TransferRequest {
    /// Destination buffer.
    pub buffer: SlotBuffer,
    /// Where to post the completion.
    pub completions: CompletionSender,
}

impl TransferRequest {
    /// Post the completion for this request.
    ///
    /// If the session has already gone away the buffer is dropped with the
    /// event.
    pub fn complete(self, outcome: TransferOutcome) {
        let TransferRequest {
            buffer,
            completions,
        } = self;
        let _ = completions.send(StreamEvent::Completed(Completion { buffer, outcome }));
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("slot", &self.buffer.slot())
            .field("len", &self.buffer.capacity())
            .finish()
    }
}

/// A submission the transport refused; the request is handed back.
#[derive(Debug)]
pub struct SubmitError {
    /// The rejected request, buffer included.
    pub request: TransferRequest,
    /// Why it was refused.
    pub error: TransportError,
}

/// Asynchronous bulk transfer engine of one open device.
///
/// Implementations post exactly one completion for every accepted request,
/// including requests removed by [`cancel_pending`](Self::cancel_pending).
pub trait Transport: Send + Sync {
    /// Queue a transfer. Returns immediately.
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError>;

    /// Cancel every queued transfer. Does not block; cancelled requests are
    /// reported as [`TransferOutcome::Cancelled`].
    fn cancel_pending(&self);

    /// Perform one blocking bulk read into `buf`.
    fn read_sync(&self, buf: &mut [u8]) -> std::result::Result<usize, TransportError>;
}

/// Everything needed to drive one opened device.
pub struct OpenedDevice {
    /// Display name.
    pub name: String,
    /// Transfer engine.
    pub transport: Arc<dyn Transport>,
    /// Scalar register surface.
    pub control: Box<dyn ControlPort>,
}

impl fmt::Debug for OpenedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedDevice")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Device enumeration and opening.
pub trait DeviceBackend: Send + Sync {
    /// Number of discoverable devices.
    fn device_count(&self) -> usize;

    /// Display name of device `index`, `None` if out of range.
    fn device_name(&self, index: usize) -> Option<String>;

    /// Open device `index`.
    fn open(&self, index: usize) -> Result<OpenedDevice>;
}

/// Build the backend selected by `application.backend`.
pub fn backend_from_config(config: &SdrConfig) -> Result<Box<dyn DeviceBackend>> {
    match config.application.backend {
        BackendKind::Mock => Ok(Box::new(mock::MockBackend::from_settings(&config.mock))),
        #[cfg(feature = "usb")]
        BackendKind::Usb => Ok(Box::new(usb::UsbBackend::new(config.usb.clone())?)),
        #[cfg(not(feature = "usb"))]
        BackendKind::Usb => Err(crate::error::SdrError::unsupported(
            "USB backend not compiled in (enable the `usb` feature)",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmosdr_pool::BufferPool;

    #[test]
    fn test_complete_posts_event() {
        let mut pool = BufferPool::allocate(1, 512).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = TransferRequest {
            buffer: pool.lend(0).unwrap(),
            completions: tx,
        };
        request.complete(TransferOutcome::Failed(TransportError::Stall));

        match rx.try_recv().unwrap() {
            StreamEvent::Completed(c) => {
                assert_eq!(c.buffer.slot(), 0);
                assert_eq!(c.outcome, TransferOutcome::Failed(TransportError::Stall));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_mock_backend_selected_by_default() {
        let backend = backend_from_config(&SdrConfig::default()).unwrap();
        assert_eq!(backend.device_count(), 1);
    }

    #[cfg(not(feature = "usb"))]
    #[test]
    fn test_usb_backend_requires_feature() {
        let mut config = SdrConfig::default();
        config.application.backend = BackendKind::Usb;
        let err = backend_from_config(&config).err().unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::Unsupported);
    }
}
