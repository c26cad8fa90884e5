//! Simulated receiver backend.
//!
//! [`MockTransport`] services transfer requests on a worker thread and fills
//! each buffer with a ramp: byte `j` of the `k`-th successful transfer is
//! `(k + j) as u8`, so consumers can check both payload integrity and
//! delivery order.
//!
//! Faults are injected deterministically through [`FaultScenario`]:
//!
//! | Scenario | Effect |
//! |----------|--------|
//! | `FailNth` | the n-th executed transfer (0-based) fails once |
//! | `FailSlotOnce` | the first transfer executed on a slot fails |
//! | `RandomFailures` | each transfer fails with probability `rate` (seeded) |
//! | `DeviceLostAfter` | after n executed transfers the device disappears |
//! | `RejectNthSubmission` | the n-th call to `submit` (0-based) is refused |
//!
//! # Example
//!
//! ```
//! use osmosdr::transport::mock::{FaultScenario, MockBackend, MockOptions};
//! use osmosdr::error::TransportError;
//!
//! let backend = MockBackend::new(2).with_options(
//!     MockOptions::default()
//!         .with_seed(7)
//!         .with_fault(FaultScenario::FailNth { n: 3, error: TransportError::Stall }),
//! );
//! assert_eq!(osmosdr::DeviceBackend::device_count(&backend), 2);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};

use super::{
    DeviceBackend, OpenedDevice, SubmissionQueue, SubmitError, TransferOutcome, TransferRequest,
    Transport,
};
use crate::config::MockSettings;
use crate::device::{ControlPort, Register};
use crate::error::{Result, SdrError, TransportError};

/// Prefix of simulated device names.
pub const MOCK_DEVICE_NAME: &str = "OsmoSDR Simulator";

/// A deterministic failure to inject.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultScenario {
    /// Fail the `n`-th executed transfer (0-based) with `error`.
    FailNth {
        /// Transfer index.
        n: u64,
        /// Reported error.
        error: TransportError,
    },
    /// Fail the first transfer executed on `slot` with `error`.
    FailSlotOnce {
        /// Buffer slot.
        slot: usize,
        /// Reported error.
        error: TransportError,
    },
    /// Fail each transfer with probability `rate` (0.0 to 1.0) as a timeout.
    RandomFailures {
        /// Failure probability.
        rate: f64,
    },
    /// Report the device as disconnected once `completions` transfers have
    /// executed. `0` makes every submission fail.
    DeviceLostAfter {
        /// Transfers executed before the loss.
        completions: u64,
    },
    /// Refuse the `n`-th call to `submit` (0-based) synchronously with
    /// `error`, without queueing the request.
    RejectNthSubmission {
        /// Submission index.
        n: u64,
        /// Reported error.
        error: TransportError,
    },
}

/// Order in which queued transfers are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    /// Submission order.
    #[default]
    Fifo,
    /// Random queued transfer first (seeded by [`MockOptions::seed`]).
    Shuffled,
}

/// Behaviour of a simulated device.
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Sleep before each transfer completes.
    pub completion_delay: Duration,
    /// Execution order of queued transfers.
    pub order: CompletionOrder,
    /// Injected failures, checked in order.
    pub faults: Vec<FaultScenario>,
    /// RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl MockOptions {
    /// Set the per-transfer delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    /// Set the execution order.
    #[must_use]
    pub fn with_order(mut self, order: CompletionOrder) -> Self {
        self.order = order;
        self
    }

    /// Add a fault scenario.
    #[must_use]
    pub fn with_fault(mut self, fault: FaultScenario) -> Self {
        self.faults.push(fault);
        self
    }

    /// Seed the RNG.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Seeded RNG shared by the worker and the submitting thread.
struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    fn index(&self, len: usize) -> usize {
        self.inner.lock().gen_range(0..len)
    }
}

struct MockShared {
    queue: SubmissionQueue,
    options: MockOptions,
    rng: MockRng,
    /// Indices into `options.faults` of one-shot faults that already fired.
    fired: Mutex<HashSet<usize>>,
    unplugged: AtomicBool,
    executed: AtomicU64,
    failed: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
    cancel_requests: AtomicU64,
    sequence: AtomicU64,
}

impl MockShared {
    fn is_lost(&self) -> bool {
        if self.unplugged.load(Ordering::SeqCst) {
            return true;
        }
        let executed = self.executed.load(Ordering::SeqCst);
        self.options.faults.iter().any(|fault| {
            matches!(fault, FaultScenario::DeviceLostAfter { completions } if executed >= *completions)
        })
    }

    fn refusal(&self, index: u64) -> Option<TransportError> {
        self.options.faults.iter().find_map(|fault| match fault {
            FaultScenario::RejectNthSubmission { n, error } if index == *n => Some(error.clone()),
            _ => None,
        })
    }

    fn pick(&self, len: usize) -> usize {
        match self.options.order {
            CompletionOrder::Fifo => 0,
            CompletionOrder::Shuffled => self.rng.index(len),
        }
    }

    fn injected_fault(&self, index: u64, slot: usize) -> Option<TransportError> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Some(TransportError::NoDevice);
        }
        for (i, fault) in self.options.faults.iter().enumerate() {
            match fault {
                FaultScenario::DeviceLostAfter { completions } if index >= *completions => {
                    if !self.unplugged.swap(true, Ordering::SeqCst) {
                        warn!(after = index, "Simulated device disconnected");
                    }
                    return Some(TransportError::NoDevice);
                }
                FaultScenario::FailNth { n, error } if index == *n => {
                    return Some(error.clone());
                }
                FaultScenario::FailSlotOnce { slot: target, error } if *target == slot => {
                    if self.fired.lock().insert(i) {
                        return Some(error.clone());
                    }
                }
                FaultScenario::RandomFailures { rate } => {
                    if self.rng.should_fail(*rate) {
                        return Some(TransportError::Timeout);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Write the ramp for the next transfer.
    fn fill(&self, buf: &mut [u8]) {
        let start = self.sequence.fetch_add(1, Ordering::SeqCst) as u8;
        for (j, byte) in buf.iter_mut().enumerate() {
            *byte = start.wrapping_add(j as u8);
        }
    }

    fn execute(&self, request: &mut TransferRequest) -> TransferOutcome {
        let index = self.executed.fetch_add(1, Ordering::SeqCst);
        let slot = request.buffer.slot();

        if let Some(error) = self.injected_fault(index, slot) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            debug!(slot, index, %error, "Injected transfer failure");
            return TransferOutcome::Failed(error);
        }

        self.fill(request.buffer.as_mut_slice());
        let len = request.buffer.capacity();
        match request.buffer.set_filled(len) {
            Ok(()) => TransferOutcome::Completed,
            Err(_) => TransferOutcome::Failed(TransportError::Overflow),
        }
    }
}

/// Counters of a [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MockStats {
    /// Transfers taken off the queue by the worker.
    pub executed: u64,
    /// Executed transfers that failed.
    pub failed: u64,
    /// Calls to `submit`.
    pub submitted: u64,
    /// Submissions refused without queueing.
    pub rejected: u64,
    /// Calls to `cancel_pending`.
    pub cancel_requests: u64,
}

/// Simulated bulk transport with a worker thread.
pub struct MockTransport {
    shared: Arc<MockShared>,
    worker: Option<JoinHandle<()>>,
}

impl MockTransport {
    /// Start a simulated transport.
    pub fn new(options: MockOptions) -> Result<Self> {
        let shared = Arc::new(MockShared {
            queue: SubmissionQueue::new(),
            rng: MockRng::new(options.seed),
            options,
            fired: Mutex::new(HashSet::new()),
            unplugged: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancel_requests: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("osmosdr-mock".to_string())
            .spawn(move || Self::worker_loop(&worker_shared))
            .map_err(|e| SdrError::device_unavailable(format!("mock worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    fn worker_loop(shared: &MockShared) {
        let delay = shared.options.completion_delay;
        while let Some(mut request) = shared.queue.pop_blocking(|len| shared.pick(len)) {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let outcome = shared.execute(&mut request);
            request.complete(outcome);
        }
        debug!("Mock transport worker exiting");
    }

    /// Simulate pulling the plug: every later transfer fails with
    /// [`TransportError::NoDevice`].
    pub fn unplug(&self) {
        if !self.shared.unplugged.swap(true, Ordering::SeqCst) {
            warn!("Simulated device unplugged");
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MockStats {
        MockStats {
            executed: self.shared.executed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
            submitted: self.shared.submitted.load(Ordering::SeqCst),
            rejected: self.shared.rejected.load(Ordering::SeqCst),
            cancel_requests: self.shared.cancel_requests.load(Ordering::SeqCst),
        }
    }
}

impl Transport for MockTransport {
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        let index = self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.shared.refusal(index) {
            self.shared.rejected.fetch_add(1, Ordering::SeqCst);
            debug!(index, %error, "Injected submission refusal");
            return Err(SubmitError { request, error });
        }
        if self.shared.is_lost() {
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
        self.shared.cancel_requests.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.cancel_all();
    }

    fn read_sync(&self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        if self.shared.is_lost() {
            return Err(TransportError::NoDevice);
        }
        let delay = self.shared.options.completion_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.shared.fill(buf);
        Ok(buf.len())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.shared.queue.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Mock transport worker panicked");
            }
        }
    }
}

/// Register file of a simulated device.
#[derive(Debug)]
pub struct MockControl {
    registers: HashMap<Register, u32>,
}

impl MockControl {
    /// Power-on register values.
    #[must_use]
    pub fn new() -> Self {
        let registers = HashMap::from([
            (Register::AdcClock, 32_000_000),
            (Register::TunerClock, 26_000_000),
            (Register::CenterFreq, 100_000_000),
            (Register::TunerGain, 0),
            (Register::GainMode, 0),
            (Register::SampleRate, 1_000_000),
            (Register::BasebandFilter, 2_150_000),
        ]);
        Self { registers }
    }
}

impl Default for MockControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPort for MockControl {
    fn write_register(&mut self, register: Register, value: u32) -> Result<()> {
        debug!(?register, value, "Mock register write");
        self.registers.insert(register, value);
        Ok(())
    }

    fn read_register(&mut self, register: Register) -> Result<u32> {
        self.registers
            .get(&register)
            .copied()
            .ok_or_else(|| SdrError::unsupported(format!("register {register:?} not present")))
    }
}

/// Backend enumerating `devices` simulated receivers.
#[derive(Debug, Clone)]
pub struct MockBackend {
    devices: usize,
    options: MockOptions,
}

impl MockBackend {
    /// Backend with `devices` receivers and default behaviour.
    #[must_use]
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            options: MockOptions::default(),
        }
    }

    /// Backend configured from the `[mock]` settings section.
    #[must_use]
    pub fn from_settings(settings: &MockSettings) -> Self {
        let mut options =
            MockOptions::default().with_delay(Duration::from_micros(settings.completion_delay_us));
        options.seed = settings.seed;
        Self {
            devices: settings.devices,
            options,
        }
    }

    /// Replace the behaviour of every device opened from this backend.
    #[must_use]
    pub fn with_options(mut self, options: MockOptions) -> Self {
        self.options = options;
        self
    }

    /// Open device `index` and keep a handle on its transport.
    pub fn open_simulated(&self, index: usize) -> Result<(OpenedDevice, Arc<MockTransport>)> {
        let name = self.device_name(index).ok_or_else(|| {
            SdrError::invalid_argument(format!(
                "device index {index} out of range ({} devices)",
                self.devices
            ))
        })?;

        let transport = Arc::new(MockTransport::new(self.options.clone())?);
        info!(index, name = %name, "Opened simulated device");

        let opened = OpenedDevice {
            name,
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            control: Box::new(MockControl::new()),
        };
        Ok((opened, transport))
    }
}

impl DeviceBackend for MockBackend {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn device_name(&self, index: usize) -> Option<String> {
        (index < self.devices).then(|| format!("{MOCK_DEVICE_NAME} #{index}"))
    }

    fn open(&self, index: usize) -> Result<OpenedDevice> {
        self.open_simulated(index).map(|(opened, _)| opened)
    }
}
