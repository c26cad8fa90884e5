//! # osmosdr
//!
//! Streaming runtime for OsmoSDR-class receivers. A [`Device`] keeps a ring of
//! bulk IN transfers in flight, hands every completed buffer to a user
//! callback and resubmits it, until the stream is cancelled from any thread.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered `SdrConfig` (TOML file, then `OSMOSDR_` environment).
//! - **`device`**: the [`Device`] handle and its scalar control surface.
//! - **`error`**: [`SdrError`], [`TransportError`] and the C status codes.
//! - **`logging`**: tracing subscriber setup.
//! - **`stream`**: the asynchronous streaming engine (scheduler, dispatcher,
//!   session state machine, channel sink).
//! - **`transport`**: the [`Transport`] and [`DeviceBackend`] seams, with a
//!   simulated backend and, behind the `usb` feature, a libusb backend.
//! - **`capi`** (`capi` feature): the `osmosdr_*` C functions.
//!
//! Buffers come from the `osmosdr-pool` crate, re-exported as [`pool`].
//!
//! ## Quick start
//!
//! ```no_run
//! use osmosdr::{Device, MockBackend, StreamConfig};
//!
//! # fn main() -> osmosdr::Result<()> {
//! let device = Device::open(&MockBackend::new(1), 0)?;
//! let cancel = device.cancel_handle();
//! let mut total = 0usize;
//! let summary = device.read_async(
//!     move |buf: &[u8]| {
//!         total += buf.len();
//!         if total > 8 << 20 {
//!             cancel.cancel();
//!         }
//!     },
//!     StreamConfig::new(0, 0),
//! )?;
//! assert_eq!(summary.buf_num, osmosdr::DEFAULT_BUF_NUM);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod stream;
pub mod transport;

#[cfg(feature = "capi")]
pub mod capi;

pub use osmosdr_pool as pool;

pub use config::SdrConfig;
pub use device::{ControlPort, Device, Register};
pub use error::{ErrorCode, Result, SdrError, TransportError};
pub use stream::{
    ActiveSession, CancelHandle, ReadCallback, SampleStream, SessionPhase, SessionSnapshot,
    SinkConfig, SinkStats, StreamConfig, StreamSummary, DEFAULT_BUF_LEN, DEFAULT_BUF_NUM,
};
pub use transport::mock::{FaultScenario, MockBackend, MockOptions};
pub use transport::{backend_from_config, DeviceBackend, Transport};
