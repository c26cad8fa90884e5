//! libusb bulk transport.
//!
//! Devices are matched by vendor and product ID. Opening follows the usual
//! sequence: detach any kernel driver, select configuration 1, claim the
//! interface. Transfers are serviced by one worker thread that fills each
//! buffer with blocking bulk reads of `read_chunk_len` bytes, each bounded by
//! `poll_timeout_ms`, so a cancellation is observed within one slice even
//! when the device is idle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, error, info, warn};

use super::{
    DeviceBackend, OpenedDevice, SubmissionQueue, SubmitError, TransferOutcome, TransferRequest,
    Transport,
};
use crate::config::UsbSettings;
use crate::device::{ControlPort, Register};
use crate::error::{Result, SdrError, TransportError};

/// Backend enumerating receivers on the USB bus.
pub struct UsbBackend {
    context: Context,
    settings: UsbSettings,
}

impl UsbBackend {
    /// Create a libusb context.
    pub fn new(settings: UsbSettings) -> Result<Self> {
        let context = Context::new()?;
        Ok(Self { context, settings })
    }

    fn matching(&self) -> Result<Vec<rusb::Device<Context>>> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() == self.settings.vendor_id
                && desc.product_id() == self.settings.product_id
            {
                found.push(device);
            }
        }
        Ok(found)
    }

    fn open_handle(&self, device: &rusb::Device<Context>) -> Result<DeviceHandle<Context>> {
        let interface = self.settings.interface;
        let mut handle = device.open()?;

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                debug!(interface, "Detaching kernel driver");
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(interface, error = %e, "Failed to detach kernel driver");
                }
            }
        }

        if let Err(e) = handle.set_active_configuration(1) {
            debug!(error = %e, "Set configuration failed (may already be set)");
        }
        handle.claim_interface(interface)?;
        Ok(handle)
    }
}

impl DeviceBackend for UsbBackend {
    fn device_count(&self) -> usize {
        match self.matching() {
            Ok(devices) => devices.len(),
            Err(e) => {
                warn!(error = %e, "USB enumeration failed");
                0
            }
        }
    }

    fn device_name(&self, index: usize) -> Option<String> {
        let devices = self.matching().ok()?;
        let device = devices.get(index)?;
        Some(format!(
            "OsmoSDR (bus {:03} device {:03})",
            device.bus_number(),
            device.address()
        ))
    }

    fn open(&self, index: usize) -> Result<OpenedDevice> {
        let devices = self.matching()?;
        let device = devices.get(index).ok_or_else(|| {
            SdrError::invalid_argument(format!(
                "device index {index} out of range ({} devices)",
                devices.len()
            ))
        })?;
        let name = format!(
            "OsmoSDR (bus {:03} device {:03})",
            device.bus_number(),
            device.address()
        );

        let handle = self.open_handle(device).map_err(|e| {
            SdrError::device_unavailable(format!("failed to open {name}: {e}"))
        })?;
        let transport = UsbTransport::new(handle, self.settings.clone())?;
        info!(index, name = %name, "Opened USB device");

        Ok(OpenedDevice {
            name,
            transport: Arc::new(transport),
            control: Box::new(UsbControl),
        })
    }
}

struct UsbShared {
    handle: DeviceHandle<Context>,
    queue: SubmissionQueue,
    settings: UsbSettings,
    /// Bumped by every `cancel_pending`; a read started under an older epoch
    /// gives up at its next poll slice.
    cancel_epoch: AtomicU64,
    lost: AtomicBool,
}

/// Result of filling one buffer chunk by chunk.
#[derive(Debug, PartialEq)]
enum ChunkedRead {
    /// Bytes received; less than the buffer when the device sent a short
    /// packet.
    Filled(usize),
    Cancelled,
    Failed(rusb::Error),
}

/// Fill `buf` with reads of at most `chunk_len` bytes, each written at the
/// current offset.
///
/// A timed-out read is retried at the same offset unless `cancelled` reports
/// true. libusb discards the partial count of a timed-out read, which is why
/// a chunk must be small enough to complete within one timeout.
fn read_chunked<R, C>(
    buf: &mut [u8],
    chunk_len: usize,
    cancelled: C,
    mut read: R,
) -> ChunkedRead
where
    R: FnMut(&mut [u8]) -> std::result::Result<usize, rusb::Error>,
    C: Fn() -> bool,
{
    let chunk_len = chunk_len.max(1);
    let mut offset = 0;
    while offset < buf.len() {
        if cancelled() {
            return ChunkedRead::Cancelled;
        }
        let end = (offset + chunk_len).min(buf.len());
        match read(&mut buf[offset..end]) {
            Ok(n) => {
                offset += n;
                if offset < end {
                    // short packet ends the transfer
                    return ChunkedRead::Filled(offset);
                }
            }
            Err(rusb::Error::Timeout) => {}
            Err(e) => return ChunkedRead::Failed(e),
        }
    }
    ChunkedRead::Filled(offset)
}

impl UsbShared {
    fn execute(&self, request: &mut TransferRequest) -> TransferOutcome {
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let timeout = Duration::from_millis(self.settings.poll_timeout_ms);
        let endpoint = self.settings.endpoint;

        let result = read_chunked(
            request.buffer.as_mut_slice(),
            self.settings.read_chunk_len as usize,
            || self.cancel_epoch.load(Ordering::SeqCst) != epoch,
            |chunk| self.handle.read_bulk(endpoint, chunk, timeout),
        );
        match result {
            ChunkedRead::Filled(n) => match request.buffer.set_filled(n) {
                Ok(()) => TransferOutcome::Completed,
                Err(_) => TransferOutcome::Failed(TransportError::Overflow),
            },
            ChunkedRead::Cancelled => TransferOutcome::Cancelled,
            ChunkedRead::Failed(e) => {
                let error = TransportError::from(e);
                if error.is_fatal() && !self.lost.swap(true, Ordering::SeqCst) {
                    error!(%error, "USB device lost");
                }
                TransferOutcome::Failed(error)
            }
        }
    }
}

/// Bulk IN transport over libusb.
pub struct UsbTransport {
    shared: Arc<UsbShared>,
    worker: Option<JoinHandle<()>>,
}

impl UsbTransport {
    fn new(handle: DeviceHandle<Context>, settings: UsbSettings) -> Result<Self> {
        let shared = Arc::new(UsbShared {
            handle,
            queue: SubmissionQueue::new(),
            settings,
            cancel_epoch: AtomicU64::new(0),
            lost: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("osmosdr-usb".to_string())
            .spawn(move || {
                while let Some(mut request) = worker_shared.queue.pop_blocking(|_| 0) {
                    let outcome = worker_shared.execute(&mut request);
                    request.complete(outcome);
                }
                debug!("USB transport worker exiting");
            })
            .map_err(|e| SdrError::device_unavailable(format!("usb worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

impl Transport for UsbTransport {
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        if self.shared.lost.load(Ordering::SeqCst) {
            return Err(SubmitError {
                request,
                error: TransportError::NoDevice,
            });
        }
        self.shared.queue.push(request).map_err(|request| SubmitError {
            request,
            error: TransportError::NoDevice,
        })
    }

    fn cancel_pending(&self) {
        self.shared.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        let cancelled = self.shared.queue.cancel_all();
        debug!(cancelled, "Cancelled queued USB transfers");
    }

    fn read_sync(&self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        let timeout = Duration::from_millis(self.shared.settings.sync_timeout_ms);
        self.shared
            .handle
            .read_bulk(self.shared.settings.endpoint, buf, timeout)
            .map_err(TransportError::from)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.shared.queue.close();
        self.shared.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("USB transport worker panicked");
            }
        }
    }
}

/// Register access is not exposed by the bulk-only firmware interface.
struct UsbControl;

impl ControlPort for UsbControl {
    fn write_register(&mut self, register: Register, _value: u32) -> Result<()> {
        Err(SdrError::unsupported(format!(
            "register {register:?} is not writable over USB"
        )))
    }

    fn read_register(&mut self, register: Register) -> Result<u32> {
        Err(SdrError::unsupported(format!(
            "register {register:?} is not readable over USB"
        )))
    }
}
