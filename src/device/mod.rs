//! Device handle: ownership of one open receiver.
//!
//! A [`Device`] owns the transport that transfers are submitted against, the
//! register surface behind the scalar setters, and at most one streaming
//! session. [`Device::close`] consumes the handle, so nothing can be called on
//! a closed device.
//!
//! # Example
//! ```no_run
//! use osmosdr::{Device, MockBackend, StreamConfig};
//!
//! # fn main() -> osmosdr::Result<()> {
//! let device = Device::open(&MockBackend::new(1), 0)?;
//! device.set_sample_rate(2_048_000)?;
//! device.set_center_freq(433_920_000)?;
//!
//! let mut received = 0usize;
//! let summary = device.read_async(
//!     |buf: &[u8]| {
//!         received += buf.len();
//!         if received >= 1 << 20 {
//!             device.cancel_async().ok();
//!         }
//!     },
//!     StreamConfig::default(),
//! )?;
//! println!("{} buffers", summary.buffers_delivered);
//! device.close();
//! # Ok(())
//! # }
//! ```

mod control;

pub use control::{
    baseband_filter_for, nearest_gain, tuned_frequency, ControlPort, Register,
    BASEBAND_FILTERS_HZ, E4000_GAINS, MAX_CLOCK_HZ, SAMPLE_RATE_RANGE_HZ, TUNER_RANGE_HZ,
    TUNER_STEP_HZ,
};

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::config::StreamingSettings;
use crate::error::{Result, SdrError};
use crate::stream::{
    ActiveSession, CancelHandle, ReadCallback, SampleStream, SessionSlot, SessionSnapshot,
    SinkConfig, StreamConfig, StreamSummary,
};
use crate::transport::{DeviceBackend, OpenedDevice, Transport};

/// An open receiver.
pub struct Device {
    name: String,
    transport: Arc<dyn Transport>,
    control: Mutex<Box<dyn ControlPort>>,
    session: Arc<SessionSlot>,
    settings: StreamingSettings,
}

impl Device {
    /// Open device `index` of `backend` with default streaming settings.
    pub fn open(backend: &dyn DeviceBackend, index: usize) -> Result<Self> {
        Self::open_with_settings(backend, index, StreamingSettings::default())
    }

    /// Open device `index` of `backend`.
    pub fn open_with_settings(
        backend: &dyn DeviceBackend,
        index: usize,
        settings: StreamingSettings,
    ) -> Result<Self> {
        let count = backend.device_count();
        if index >= count {
            return Err(SdrError::invalid_argument(format!(
                "device index {index} out of range ({count} devices)"
            )));
        }
        let opened = backend.open(index)?;
        Ok(Self::from_parts(opened, settings))
    }

    /// Wrap an already opened transport and control port.
    #[must_use]
    pub fn from_parts(opened: OpenedDevice, settings: StreamingSettings) -> Self {
        let OpenedDevice {
            name,
            transport,
            control,
        } = opened;
        info!(device = %name, "Device opened");
        Self {
            name,
            transport,
            control: Mutex::new(control),
            session: Arc::new(Mutex::new(None)),
            settings,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Streaming settings used for defaults and limits.
    #[must_use]
    pub fn settings(&self) -> &StreamingSettings {
        &self.settings
    }

    /// Close the device.
    ///
    /// A session started with [`start_session`](Self::start_session) or
    /// [`stream`](Self::stream) that is still running is cancelled; it keeps
    /// the transport alive until it has drained.
    pub fn close(self) {
        if self.cancel_handle().cancel() {
            debug!(device = %self.name, "Cancelled active session on close");
        }
        info!(device = %self.name, "Device closed");
    }

    // ---- scalar control surface ----

    /// Set the ADC and tuner reference clocks, in Hz.
    pub fn set_clock_freq(&self, adc_freq: u32, tuner_freq: u32) -> Result<()> {
        control::check_clock("adc", adc_freq)?;
        control::check_clock("tuner", tuner_freq)?;
        let mut control = self.control.lock();
        control.write_register(Register::AdcClock, adc_freq)?;
        control.write_register(Register::TunerClock, tuner_freq)?;
        debug!(adc_freq, tuner_freq, "Reference clocks set");
        Ok(())
    }

    /// ADC and tuner reference clocks, in Hz.
    pub fn clock_freq(&self) -> Result<(u32, u32)> {
        let mut control = self.control.lock();
        Ok((
            control.read_register(Register::AdcClock)?,
            control.read_register(Register::TunerClock)?,
        ))
    }

    /// Tune to `freq` Hz. Returns the frequency actually tuned.
    pub fn set_center_freq(&self, freq: u32) -> Result<u32> {
        let tuned = tuned_frequency(freq)?;
        self.control
            .lock()
            .write_register(Register::CenterFreq, tuned)?;
        debug!(requested = freq, tuned, "Center frequency set");
        Ok(tuned)
    }

    /// Tuned center frequency, in Hz.
    pub fn center_freq(&self) -> Result<u32> {
        self.control.lock().read_register(Register::CenterFreq)
    }

    /// Set the tuner gain in tenths of dB, snapped to the nearest supported
    /// step. Requires manual gain mode. Returns the gain applied.
    pub fn set_tuner_gain(&self, gain: i32) -> Result<i32> {
        let mut control = self.control.lock();
        if control.read_register(Register::GainMode)? != 1 {
            return Err(SdrError::invalid_argument(
                "tuner gain can only be set in manual gain mode",
            ));
        }
        let applied = nearest_gain(gain);
        control.write_register(Register::TunerGain, applied as u32)?;
        debug!(requested = gain, applied, "Tuner gain set");
        Ok(applied)
    }

    /// Tuner gain, in tenths of dB.
    pub fn tuner_gain(&self) -> Result<i32> {
        Ok(self.control.lock().read_register(Register::TunerGain)? as i32)
    }

    /// Select manual (`true`) or automatic gain control.
    pub fn set_tuner_gain_mode(&self, manual: bool) -> Result<()> {
        self.control
            .lock()
            .write_register(Register::GainMode, u32::from(manual))?;
        debug!(manual, "Tuner gain mode set");
        Ok(())
    }

    /// Whether manual gain mode is selected.
    pub fn tuner_gain_mode(&self) -> Result<bool> {
        Ok(self.control.lock().read_register(Register::GainMode)? == 1)
    }

    /// Set the sample rate in Hz. Also selects the matching baseband filter.
    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        control::check_sample_rate(rate)?;
        let filter = baseband_filter_for(rate);
        let mut control = self.control.lock();
        control.write_register(Register::SampleRate, rate)?;
        control.write_register(Register::BasebandFilter, filter)?;
        debug!(rate, filter, "Sample rate set");
        Ok(())
    }

    /// Sample rate, in Hz.
    pub fn sample_rate(&self) -> Result<u32> {
        self.control.lock().read_register(Register::SampleRate)
    }

    /// Baseband filter bandwidth, in Hz.
    pub fn baseband_filter(&self) -> Result<u32> {
        self.control.lock().read_register(Register::BasebandFilter)
    }

    // ---- synchronous read ----

    /// Read one bulk transfer into `buf`. Returns the number of bytes read.
    ///
    /// Refused with [`SdrError::AlreadyRunning`] while a session is active.
    pub fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(SdrError::invalid_argument("read buffer is empty"));
        }
        if self.session.lock().is_some() {
            return Err(SdrError::AlreadyRunning);
        }
        self.transport.read_sync(buf).map_err(|e| {
            if e.is_fatal() {
                SdrError::device_unavailable(e.to_string())
            } else {
                SdrError::TransferError(e)
            }
        })
    }

    // ---- asynchronous streaming ----

    /// Stream until cancelled, calling `callback` with every completed buffer.
    ///
    /// Blocks the calling thread until the session has STOPPED; call
    /// [`cancel_async`](Self::cancel_async) from the callback or from another
    /// thread to end it. Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// - [`SdrError::AlreadyRunning`] if a session is active on this device
    /// - [`SdrError::InvalidArgument`] for bad buffer geometry, before any
    ///   transfer is submitted
    /// - [`SdrError::DeviceUnavailable`] if no transfer could be submitted, or
    ///   the device was lost mid-stream (after draining)
    #[instrument(skip(self, callback), fields(device = %self.name))]
    pub fn read_async<C: ReadCallback>(
        &self,
        callback: C,
        config: StreamConfig,
    ) -> Result<StreamSummary> {
        self.start_session(config)?.run(callback)
    }

    /// Stop the active session. Returns immediately; a no-op when idle.
    pub fn cancel_async(&self) -> Result<()> {
        if !self.cancel_handle().cancel() {
            debug!(device = %self.name, "cancel_async with no running session");
        }
        Ok(())
    }

    /// A handle that cancels this device's active session from any thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::for_device(Arc::clone(&self.session))
    }

    /// Validate, allocate and submit, without driving the session.
    ///
    /// The returned session must be [`run`](ActiveSession::run) (or dropped,
    /// which cancels and drains it).
    pub fn start_session(&self, config: StreamConfig) -> Result<ActiveSession> {
        ActiveSession::start(&self.session, &self.transport, config, &self.settings)
    }

    /// Phase and outstanding count of the active session, or IDLE.
    #[must_use]
    pub fn session_snapshot(&self) -> SessionSnapshot {
        match self.session.lock().as_ref() {
            Some(shared) => shared.snapshot(),
            None => SessionSnapshot::IDLE,
        }
    }

    /// Stream into a bounded channel on a dedicated driver thread.
    pub fn stream(&self, config: StreamConfig, sink: SinkConfig) -> Result<SampleStream> {
        if sink.buffer_size == 0 {
            return Err(SdrError::invalid_argument("sink buffer_size must be > 0"));
        }
        let session = self.start_session(config)?;
        SampleStream::spawn(session, sink)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("session", &self.session_snapshot())
            .finish_non_exhaustive()
    }
}
