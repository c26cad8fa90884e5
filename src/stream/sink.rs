//! Channel-based consumption of a streaming session.
//!
//! [`SampleStream`] runs the session's driver loop on a dedicated thread and
//! copies each completed buffer into a [`Bytes`] offered to a bounded tokio
//! channel. When the consumer falls behind the channel fills up and buffers
//! are dropped and counted; the device stream itself never stalls.
//!
//! # Example
//! ```no_run
//! use osmosdr::{Device, MockBackend, SinkConfig, StreamConfig};
//!
//! # async fn demo() -> osmosdr::Result<()> {
//! let device = Device::open(&MockBackend::new(1), 0)?;
//! let mut stream = device.stream(StreamConfig::new(8, 16 * 512), SinkConfig::default())?;
//!
//! while let Some(chunk) = stream.recv().await {
//!     println!("{} bytes", chunk.len());
//!     if stream.stats().delivered >= 100 {
//!         break;
//!     }
//! }
//! let dropped = stream.stats().dropped;
//! let summary = stream.stop()?;
//! println!("{} buffers, {dropped} dropped", summary.buffers_delivered);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use super::controller::{ActiveSession, StreamSummary};
use super::session::CancelHandle;
use crate::error::{Result, SdrError};

/// Configuration of a sample sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Name of the sink (for logging and the driver thread name)
    pub name: String,
    /// Channel capacity in buffers
    pub buffer_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            buffer_size: 64,
        }
    }
}

/// Counters of a [`SampleStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkStats {
    /// Buffers accepted by the channel.
    pub delivered: u64,
    /// Bytes accepted by the channel.
    pub bytes_delivered: u64,
    /// Buffers dropped because the channel was full.
    pub dropped: u64,
}

#[derive(Default)]
struct SinkCounters {
    delivered: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

/// Receiving end of a device stream.
pub struct SampleStream {
    name: String,
    receiver: mpsc::Receiver<Bytes>,
    cancel: CancelHandle,
    driver: Option<JoinHandle<Result<StreamSummary>>>,
    counters: Arc<SinkCounters>,
}

impl SampleStream {
    pub(crate) fn spawn(session: ActiveSession, config: SinkConfig) -> Result<Self> {
        let cancel = session.cancel_handle();

        let (sender, receiver) = mpsc::channel(config.buffer_size);
        let counters = Arc::new(SinkCounters::default());
        let thread_counters = Arc::clone(&counters);
        let sink_name = config.name.clone();

        let callback = move |data: &[u8]| {
            let chunk = Bytes::copy_from_slice(data);
            let len = chunk.len() as u64;
            match sender.try_send(chunk) {
                Ok(()) => {
                    thread_counters.delivered.fetch_add(1, Ordering::Relaxed);
                    thread_counters.bytes.fetch_add(len, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    thread_counters.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(sink = %sink_name, "Dropped buffer (sink full)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(sink = %sink_name, "Sink closed");
                }
            }
        };

        let driver = thread::Builder::new()
            .name(format!("osmosdr-sink-{}", config.name))
            .spawn(move || session.run(callback))
            .map_err(|e| SdrError::device_unavailable(format!("sink thread: {e}")))?;

        debug!(sink = %config.name, capacity = config.buffer_size, "Sample stream started");
        Ok(Self {
            name: config.name,
            receiver,
            cancel,
            driver: Some(driver),
            counters,
        })
    }

    /// Next buffer, or `None` once the session has stopped and the channel is
    /// empty.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv) for synchronous consumers.
    pub fn blocking_recv(&mut self) -> Option<Bytes> {
        self.receiver.blocking_recv()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            bytes_delivered: self.counters.bytes.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Handle that cancels the underlying session.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the session and wait for it to drain.
    ///
    /// Blocks the calling thread until the driver thread exits.
    pub fn stop(mut self) -> Result<StreamSummary> {
        self.cancel.cancel();
        let result = self.join();
        let stats = self.stats();
        info!(
            sink = %self.name,
            delivered = stats.delivered,
            dropped = stats.dropped,
            bytes = stats.bytes_delivered,
            "Sample stream stopped"
        );
        result
    }

    fn join(&mut self) -> Result<StreamSummary> {
        match self.driver.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                error!(sink = %self.name, "Sink driver thread panicked");
                Err(SdrError::device_unavailable("sink driver thread panicked"))
            }),
            None => Err(SdrError::NotRunning),
        }
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.cancel.cancel();
            if let Err(e) = self.join() {
                debug!(sink = %self.name, error = %e, "Sample stream ended with error");
            }
        }
    }
}

impl fmt::Debug for SampleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleStream")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}
