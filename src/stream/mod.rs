//! Asynchronous streaming engine.
//!
//! A session keeps `buf_num` bulk transfers in flight against the device's
//! transport. Each completion comes back to the driver thread as a
//! [`StreamEvent`](crate::transport::StreamEvent); the driver hands the
//! buffer to the user callback and resubmits the same transfer with the same
//! buffer. Cancellation moves the session to DRAINING, after which nothing is
//! resubmitted and the session stops once the last transfer has completed.
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | buffer geometry and defaults |
//! | `transfer` | per-slot transfer status |
//! | `scheduler` | submission, completion accounting, resubmission |
//! | `dispatch` | callback invocation with panic isolation |
//! | `session` | phase and outstanding count shared with control threads |
//! | `controller` | start, driver loop, teardown |
//! | `sink` | channel-based consumer on a dedicated thread |

pub mod config;
mod controller;
mod dispatch;
mod scheduler;
mod session;
mod sink;
mod transfer;

pub use config::{StreamConfig, DEFAULT_BUF_LEN, DEFAULT_BUF_NUM};
pub use controller::{ActiveSession, StreamSummary};
pub use dispatch::{DispatchStats, ReadCallback};
pub use scheduler::SchedulerStats;
pub use session::{CancelHandle, SessionPhase, SessionSnapshot};
pub use sink::{SampleStream, SinkConfig, SinkStats};
pub use transfer::TransferStatus;

pub(crate) use session::SessionSlot;
