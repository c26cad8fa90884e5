//! Slot arena implementation.
//!
//! See the crate documentation for the ownership model. The pool itself is
//! not shared between threads: the streaming driver thread owns it, and only
//! [`SlotBuffer`] values cross into transport worker threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::{PoolError, SlotState, BUFFER_ALIGNMENT, DEFAULT_MAX_TOTAL_BYTES};

/// Source of per-pool identities, used to reject buffers restored into the
/// wrong pool.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Slot {
    /// `None` while the buffer is lent out.
    data: Option<Vec<u8>>,
    state: SlotState,
    /// Valid bytes when `Ready`.
    filled: usize,
}

/// Fixed set of equally sized buffers addressed by slot index.
pub struct BufferPool {
    id: u64,
    slots: Vec<Slot>,
    buf_len: usize,
    lent: usize,
    total_lends: u64,
    total_restores: u64,
}

/// Usage counters returned by [`BufferPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Number of slots.
    pub buf_num: usize,
    /// Bytes per slot.
    pub buf_len: usize,
    /// Lends over the pool lifetime.
    pub lends: u64,
    /// Restores over the pool lifetime.
    pub restores: u64,
}

impl BufferPool {
    /// Allocate `buf_num` buffers of `buf_len` bytes under the default
    /// memory limit.
    ///
    /// # Errors
    ///
    /// - [`PoolError::ZeroBuffers`] if `buf_num` is 0
    /// - [`PoolError::MisalignedLength`] if `buf_len` is 0 or not a multiple
    ///   of [`BUFFER_ALIGNMENT`]
    /// - [`PoolError::TooLarge`] if the total exceeds
    ///   [`DEFAULT_MAX_TOTAL_BYTES`]
    pub fn allocate(buf_num: usize, buf_len: usize) -> Result<Self, PoolError> {
        Self::with_limit(buf_num, buf_len, DEFAULT_MAX_TOTAL_BYTES)
    }

    /// Allocate with an explicit limit on `buf_num * buf_len`.
    pub fn with_limit(buf_num: usize, buf_len: usize, limit: usize) -> Result<Self, PoolError> {
        if buf_num == 0 {
            return Err(PoolError::ZeroBuffers);
        }
        if buf_len == 0 || buf_len % BUFFER_ALIGNMENT != 0 {
            return Err(PoolError::MisalignedLength {
                len: buf_len,
                alignment: BUFFER_ALIGNMENT,
            });
        }
        let total = buf_num
            .checked_mul(buf_len)
            .filter(|total| *total <= limit)
            .ok_or(PoolError::TooLarge {
                buf_num,
                buf_len,
                limit,
            })?;

        let slots = (0..buf_num)
            .map(|_| Slot {
                data: Some(vec![0u8; buf_len]),
                state: SlotState::Free,
                filled: 0,
            })
            .collect();

        info!(
            buf_num,
            buf_len,
            total_mb = total as f64 / (1024.0 * 1024.0),
            "BufferPool allocated"
        );

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            slots,
            buf_len,
            lent: 0,
            total_lends: 0,
            total_restores: 0,
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn buf_num(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per slot.
    #[must_use]
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Number of buffers currently lent out.
    #[must_use]
    pub fn lent_count(&self) -> usize {
        self.lent
    }

    /// State of `slot`, or `None` if out of range.
    #[must_use]
    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Lends since allocation.
    #[must_use]
    pub fn total_lends(&self) -> u64 {
        self.total_lends
    }

    /// Restores since allocation.
    #[must_use]
    pub fn total_restores(&self) -> u64 {
        self.total_restores
    }

    /// Move the buffer of `slot` out of the pool.
    ///
    /// Valid from `Free` or `Ready`; the slot becomes `Submitted`. Any data
    /// the slot held is overwritten in place by the next transfer.
    pub fn lend(&mut self, slot: usize) -> Result<SlotBuffer, PoolError> {
        let buf_num = self.slots.len();
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(PoolError::NoSuchSlot { slot, buf_num })?;

        let data = match entry.state {
            SlotState::Free | SlotState::Ready => entry.data.take(),
            SlotState::Submitted | SlotState::Retired => None,
        }
        .ok_or(PoolError::SlotBusy { slot })?;

        entry.state = SlotState::Submitted;
        entry.filled = 0;
        self.lent += 1;
        self.total_lends += 1;

        Ok(SlotBuffer {
            pool_id: self.id,
            slot,
            data,
            filled: 0,
        })
    }

    /// Return a buffer that holds valid data; the slot becomes `Ready`.
    pub fn restore_ready(&mut self, buffer: SlotBuffer) -> Result<(), PoolError> {
        self.restore(buffer, SlotState::Ready)
    }

    /// Return a buffer whose contents are not valid (failed or cancelled
    /// transfer); the slot becomes `Free`.
    pub fn restore_free(&mut self, buffer: SlotBuffer) -> Result<(), PoolError> {
        self.restore(buffer, SlotState::Free)
    }

    fn restore(&mut self, buffer: SlotBuffer, state: SlotState) -> Result<(), PoolError> {
        let SlotBuffer {
            pool_id,
            slot,
            data,
            filled,
        } = buffer;

        if pool_id != self.id {
            return Err(PoolError::SlotNotLent { slot });
        }
        let buf_num = self.slots.len();
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(PoolError::NoSuchSlot { slot, buf_num })?;
        if entry.state != SlotState::Submitted || entry.data.is_some() {
            return Err(PoolError::SlotNotLent { slot });
        }

        entry.filled = if state == SlotState::Ready { filled } else { 0 };
        entry.data = Some(data);
        entry.state = state;
        self.lent -= 1;
        self.total_restores += 1;
        Ok(())
    }

    /// Filled bytes of a `Ready` slot.
    #[must_use]
    pub fn ready_data(&self, slot: usize) -> Option<&[u8]> {
        let entry = self.slots.get(slot)?;
        if entry.state != SlotState::Ready {
            return None;
        }
        entry.data.as_deref().map(|data| &data[..entry.filled])
    }

    /// Filled bytes of a `Ready` slot, writable in place until the slot is
    /// lent again.
    pub fn ready_data_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        let entry = self.slots.get_mut(slot)?;
        if entry.state != SlotState::Ready {
            return None;
        }
        let filled = entry.filled;
        entry.data.as_deref_mut().map(|data| &mut data[..filled])
    }

    /// Retire every slot and free all buffer memory.
    ///
    /// # Errors
    ///
    /// [`PoolError::BuffersOutstanding`] if any buffer is still lent out. The
    /// pool is dropped either way; buffers still lent are freed by whoever
    /// holds them.
    pub fn release(mut self) -> Result<PoolStats, PoolError> {
        if self.lent > 0 {
            debug!(lent = self.lent, "BufferPool release refused");
            return Err(PoolError::BuffersOutstanding { count: self.lent });
        }

        for slot in &mut self.slots {
            slot.state = SlotState::Retired;
            slot.data = None;
            slot.filled = 0;
        }

        let stats = PoolStats {
            buf_num: self.slots.len(),
            buf_len: self.buf_len,
            lends: self.total_lends,
            restores: self.total_restores,
        };
        info!(
            buf_num = stats.buf_num,
            lends = stats.lends,
            restores = stats.restores,
            "BufferPool released"
        );
        Ok(stats)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_num", &self.slots.len())
            .field("buf_len", &self.buf_len)
            .field("lent", &self.lent)
            .finish()
    }
}

/// A buffer lent out of a [`BufferPool`].
///
/// Transports fill [`as_mut_slice`](Self::as_mut_slice) and record how many
/// bytes arrived with [`set_filled`](Self::set_filled).
pub struct SlotBuffer {
    pool_id: u64,
    slot: usize,
    data: Vec<u8>,
    filled: usize,
}

impl SlotBuffer {
    /// Slot index this buffer belongs to.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Full buffer length.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written by the last transfer.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Record how many bytes the transfer wrote.
    pub fn set_filled(&mut self, filled: usize) -> Result<(), PoolError> {
        if filled > self.data.len() {
            return Err(PoolError::Overfilled {
                filled,
                capacity: self.data.len(),
            });
        }
        self.filled = filled;
        Ok(())
    }

    /// Filled portion.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Whole buffer, for the transport to write into.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Address of the first byte; stable for the lifetime of the pool.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl fmt::Debug for SlotBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotBuffer")
            .field("slot", &self.slot)
            .field("capacity", &self.data.len())
            .field("filled", &self.filled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_geometry() {
        let pool = BufferPool::allocate(4, 1024).unwrap();
        assert_eq!(pool.buf_num(), 4);
        assert_eq!(pool.buf_len(), 1024);
        assert_eq!(pool.lent_count(), 0);
        assert!((0..4).all(|i| pool.state(i) == Some(SlotState::Free)));
        assert_eq!(pool.state(4), None);
    }

    #[test]
    fn test_allocate_rejects_bad_geometry() {
        assert_eq!(
            BufferPool::allocate(0, 512).unwrap_err(),
            PoolError::ZeroBuffers
        );
        assert!(matches!(
            BufferPool::allocate(4, 500),
            Err(PoolError::MisalignedLength { len: 500, .. })
        ));
        assert!(matches!(
            BufferPool::allocate(4, 0),
            Err(PoolError::MisalignedLength { len: 0, .. })
        ));
        assert!(matches!(
            BufferPool::with_limit(8, 4096, 8 * 4096 - 1),
            Err(PoolError::TooLarge { .. })
        ));
        assert!(matches!(
            BufferPool::allocate(usize::MAX / 2, 4096),
            Err(PoolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_lend_and_restore_ready() {
        let mut pool = BufferPool::allocate(2, 512).unwrap();

        let mut buf = pool.lend(1).unwrap();
        assert_eq!(buf.slot(), 1);
        assert_eq!(buf.capacity(), 512);
        assert_eq!(pool.state(1), Some(SlotState::Submitted));
        assert_eq!(pool.lent_count(), 1);

        buf.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.set_filled(4).unwrap();
        pool.restore_ready(buf).unwrap();

        assert_eq!(pool.state(1), Some(SlotState::Ready));
        assert_eq!(pool.ready_data(1), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(pool.lent_count(), 0);

        pool.ready_data_mut(1).unwrap().fill(9);
        assert_eq!(pool.ready_data(1), Some(&[9u8; 4][..]));
        assert!(pool.ready_data_mut(0).is_none());
    }

    #[test]
    fn test_double_lend_rejected() {
        let mut pool = BufferPool::allocate(2, 512).unwrap();
        let _held = pool.lend(0).unwrap();

        assert_eq!(pool.lend(0).unwrap_err(), PoolError::SlotBusy { slot: 0 });
        assert!(pool.lend(1).is_ok());
        assert!(matches!(
            pool.lend(7),
            Err(PoolError::NoSuchSlot { slot: 7, .. })
        ));
    }

    #[test]
    fn test_restore_free_discards_data() {
        let mut pool = BufferPool::allocate(1, 512).unwrap();
        let mut buf = pool.lend(0).unwrap();
        buf.set_filled(100).unwrap();
        pool.restore_free(buf).unwrap();

        assert_eq!(pool.state(0), Some(SlotState::Free));
        assert_eq!(pool.ready_data(0), None);
    }

    #[test]
    fn test_buffer_address_stable_across_cycles() {
        let mut pool = BufferPool::allocate(1, 4096).unwrap();

        let buf = pool.lend(0).unwrap();
        let first = buf.as_ptr();
        pool.restore_ready(buf).unwrap();

        for _ in 0..10 {
            let buf = pool.lend(0).unwrap();
            assert_eq!(buf.as_ptr(), first);
            pool.restore_ready(buf).unwrap();
        }
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let mut a = BufferPool::allocate(1, 512).unwrap();
        let mut b = BufferPool::allocate(1, 512).unwrap();

        let from_a = a.lend(0).unwrap();
        let _from_b = b.lend(0).unwrap();
        assert_eq!(
            b.restore_ready(from_a).unwrap_err(),
            PoolError::SlotNotLent { slot: 0 }
        );
    }

    #[test]
    fn test_set_filled_overflow() {
        let mut pool = BufferPool::allocate(1, 512).unwrap();
        let mut buf = pool.lend(0).unwrap();
        assert!(matches!(
            buf.set_filled(513),
            Err(PoolError::Overfilled {
                filled: 513,
                capacity: 512
            })
        ));
    }

    #[test]
    fn test_release_refused_while_lent() {
        let mut pool = BufferPool::allocate(3, 512).unwrap();
        let _a = pool.lend(0).unwrap();
        let _b = pool.lend(2).unwrap();

        assert_eq!(
            pool.release().unwrap_err(),
            PoolError::BuffersOutstanding { count: 2 }
        );
    }

    #[test]
    fn test_release_reports_stats() {
        let mut pool = BufferPool::allocate(2, 512).unwrap();
        for _ in 0..3 {
            let buf = pool.lend(0).unwrap();
            pool.restore_ready(buf).unwrap();
        }
        let buf = pool.lend(1).unwrap();
        pool.restore_free(buf).unwrap();

        let stats = pool.release().unwrap();
        assert_eq!(
            stats,
            PoolStats {
                buf_num: 2,
                buf_len: 512,
                lends: 4,
                restores: 4,
            }
        );
    }
}
