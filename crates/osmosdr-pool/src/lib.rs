//! Fixed slot arena of sample buffers for the osmosdr streaming engine.
//!
//! The streaming engine keeps a device continuously fed with bulk transfer
//! requests. Every request needs a receive buffer, and those buffers must
//! keep a stable address for the whole session because the callback contract
//! hands them to user code by reference. This crate provides that arena:
//!
//! - [`BufferPool`]: `buf_num` buffers of `buf_len` bytes, allocated once,
//!   addressed by slot index
//! - [`SlotBuffer`]: a buffer lent out of the pool, moved by value to the
//!   transport and moved back on completion
//!
//! # Ownership Model
//!
//! A buffer is in exactly one place at any time: inside the pool or inside a
//! `SlotBuffer`. Lending moves the `Vec<u8>` out of its slot; restoring moves
//! it back. The allocation is never reallocated or resized while it travels,
//! so the data pointer a callback observes for slot `i` is the same on every
//! cycle.
//!
//! ```text
//!   FREE ──lend──▶ SUBMITTED ──restore_ready──▶ READY ──lend──▶ SUBMITTED ...
//!     ▲                │
//!     └─restore_free───┘
//!
//!   release(): every slot FREE or READY ──▶ RETIRED, memory dropped
//! ```
//!
//! Double lending fails with [`PoolError::SlotBusy`]. Releasing while a
//! buffer is still lent fails with [`PoolError::BuffersOutstanding`].
//! [`BufferPool::release`] consumes the pool, so a second release does not
//! compile.
//!
//! # Example
//!
//! ```
//! use osmosdr_pool::{BufferPool, SlotState};
//!
//! let mut pool = BufferPool::allocate(4, 512)?;
//!
//! let mut buf = pool.lend(2)?;
//! buf.as_mut_slice()[..3].copy_from_slice(b"iq!");
//! buf.set_filled(3)?;
//! pool.restore_ready(buf)?;
//!
//! assert_eq!(pool.state(2), Some(SlotState::Ready));
//! assert_eq!(pool.ready_data(2), Some(&b"iq!"[..]));
//!
//! let stats = pool.release()?;
//! assert_eq!(stats.lends, 1);
//! # Ok::<(), osmosdr_pool::PoolError>(())
//! ```

pub mod buffer_pool;

pub use buffer_pool::{BufferPool, PoolStats, SlotBuffer};

use thiserror::Error;

/// Every buffer length must be a multiple of this many bytes (USB bulk packet
/// granularity).
pub const BUFFER_ALIGNMENT: usize = 512;

/// Upper bound on `buf_num * buf_len` unless overridden with
/// [`BufferPool::with_limit`].
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 256 * 1024 * 1024;

/// Lifecycle state of one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Owned by the pool, no valid data.
    Free,
    /// Lent to an in-flight transfer.
    Submitted,
    /// Owned by the pool, holds data from a completed transfer.
    Ready,
    /// Pool released; memory freed.
    Retired,
}

/// Errors produced by [`BufferPool`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `buf_num` was zero.
    #[error("buffer count must be greater than zero")]
    ZeroBuffers,

    /// `buf_len` was zero or not aligned.
    #[error("buffer length {len} is not a positive multiple of {alignment}")]
    MisalignedLength { len: usize, alignment: usize },

    /// Total memory above the configured limit.
    #[error("{buf_num} x {buf_len} bytes exceeds the {limit} byte buffer limit")]
    TooLarge {
        buf_num: usize,
        buf_len: usize,
        limit: usize,
    },

    /// Slot index outside `0..buf_num`.
    #[error("slot {slot} out of range (pool has {buf_num} slots)")]
    NoSuchSlot { slot: usize, buf_num: usize },

    /// Slot already lent to a transfer.
    #[error("slot {slot} is already lent out")]
    SlotBusy { slot: usize },

    /// A restore targeted a slot that was not lent.
    #[error("slot {slot} was not lent out")]
    SlotNotLent { slot: usize },

    /// Filled length larger than the slot.
    #[error("filled length {filled} exceeds slot capacity {capacity}")]
    Overfilled { filled: usize, capacity: usize },

    /// Release attempted with buffers still lent out.
    #[error("cannot release pool: {count} buffer(s) still lent out")]
    BuffersOutstanding { count: usize },
}

impl PoolError {
    /// True for errors caused by the requested geometry rather than by
    /// misuse of the lend/restore protocol.
    pub fn is_invalid_geometry(&self) -> bool {
        matches!(
            self,
            Self::ZeroBuffers | Self::MisalignedLength { .. } | Self::TooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_errors_classified() {
        assert!(PoolError::ZeroBuffers.is_invalid_geometry());
        assert!(PoolError::MisalignedLength {
            len: 500,
            alignment: BUFFER_ALIGNMENT
        }
        .is_invalid_geometry());
        assert!(!PoolError::SlotBusy { slot: 0 }.is_invalid_geometry());
        assert!(!PoolError::BuffersOutstanding { count: 2 }.is_invalid_geometry());
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::MisalignedLength {
            len: 500,
            alignment: 512,
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("512"));
    }
}
