//! Per-session buffer geometry.

use osmosdr_pool::BufferPool;

use crate::config::StreamingSettings;
use crate::error::Result;

/// Buffer count used when a session asks for 0.
pub const DEFAULT_BUF_NUM: u32 = 32;

/// Buffer length used when a session asks for 0 (16 x 32 x 512 bytes).
pub const DEFAULT_BUF_LEN: u32 = 16 * 32 * 512;

/// Buffer geometry requested for one streaming session.
///
/// Zero in either field selects the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamConfig {
    /// Number of buffers (and concurrent transfers).
    pub buf_num: u32,
    /// Bytes per buffer; a multiple of 512.
    pub buf_len: u32,
}

impl StreamConfig {
    /// Geometry with explicit values.
    #[must_use]
    pub fn new(buf_num: u32, buf_len: u32) -> Self {
        Self { buf_num, buf_len }
    }

    /// Replace zero fields with the defaults from `settings`.
    #[must_use]
    pub fn resolve(&self, settings: &StreamingSettings) -> StreamConfig {
        StreamConfig {
            buf_num: if self.buf_num == 0 {
                settings.default_buf_num
            } else {
                self.buf_num
            },
            buf_len: if self.buf_len == 0 {
                settings.default_buf_len
            } else {
                self.buf_len
            },
        }
    }

    /// Resolve and allocate the session's buffer pool.
    ///
    /// Fails with `InvalidArgument` on bad geometry.
    pub(crate) fn allocate(&self, settings: &StreamingSettings) -> Result<BufferPool> {
        let resolved = self.resolve(settings);
        let pool = BufferPool::with_limit(
            resolved.buf_num as usize,
            resolved.buf_len as usize,
            settings.max_total_bytes,
        )?;
        Ok(pool)
    }
}
