//! Delivery of completed buffers to user code.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{trace, warn};

/// Consumer of sample buffers.
///
/// Implemented for every `FnMut(&[u8])`, so a closure is the usual callback;
/// the closure's captures play the role of a C context pointer. The slice is
/// the buffer slot itself: it is only valid for the duration of the call and
/// may be modified in place, since the slot is refilled before its next
/// delivery.
pub trait ReadCallback {
    /// Handle one completed buffer.
    fn on_samples(&mut self, data: &mut [u8]);
}

impl<F> ReadCallback for F
where
    F: FnMut(&[u8]),
{
    fn on_samples(&mut self, data: &mut [u8]) {
        self(&*data)
    }
}

/// Counters kept by a [`CallbackDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    /// Buffers handed to the callback.
    pub buffers: u64,
    /// Bytes handed to the callback.
    pub bytes: u64,
    /// Callback invocations that panicked.
    pub faults: u64,
}

/// Invokes the callback for completed buffers and contains its panics.
pub(crate) struct CallbackDispatcher<C> {
    callback: C,
    stats: DispatchStats,
}

impl<C: ReadCallback> CallbackDispatcher<C> {
    pub(crate) fn new(callback: C) -> Self {
        Self {
            callback,
            stats: DispatchStats::default(),
        }
    }

    /// Call the callback with `data`. Returns `false` if it panicked.
    pub(crate) fn dispatch(&mut self, slot: usize, data: &mut [u8]) -> bool {
        trace!(slot, len = data.len(), "Dispatching buffer");
        self.stats.buffers += 1;
        self.stats.bytes += data.len() as u64;

        let callback = &mut self.callback;
        match panic::catch_unwind(AssertUnwindSafe(|| callback.on_samples(data))) {
            Ok(()) => true,
            Err(payload) => {
                self.stats.faults += 1;
                warn!(
                    slot,
                    faults = self.stats.faults,
                    panic = panic_message(payload.as_ref()),
                    "Read callback panicked; continuing"
                );
                false
            }
        }
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        self.stats
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_receives_exact_bytes() {
        let mut seen = Vec::new();
        {
            let mut dispatcher = CallbackDispatcher::new(|data: &[u8]| seen.push(data.to_vec()));
            assert!(dispatcher.dispatch(0, &mut [1, 2, 3]));
            assert!(dispatcher.dispatch(1, &mut []));
            assert_eq!(
                dispatcher.stats(),
                DispatchStats {
                    buffers: 2,
                    bytes: 3,
                    faults: 0
                }
            );
        }
        assert_eq!(seen, vec![vec![1, 2, 3], vec![]]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut calls = 0;
        let mut dispatcher = CallbackDispatcher::new(|data: &[u8]| {
            calls += 1;
            if data[0] == 0xff {
                panic!("bad sample");
            }
        });

        assert!(dispatcher.dispatch(0, &mut [0x00]));
        assert!(!dispatcher.dispatch(1, &mut [0xff]));
        assert!(dispatcher.dispatch(2, &mut [0x01]));
        assert_eq!(dispatcher.stats().faults, 1);
        assert_eq!(dispatcher.stats().buffers, 3);
        drop(dispatcher);
        assert_eq!(calls, 3);
    }

    struct Invert(usize);

    impl ReadCallback for Invert {
        fn on_samples(&mut self, data: &mut [u8]) {
            self.0 += data.len();
            data.iter_mut().for_each(|b| *b = !*b);
        }
    }

    #[test]
    fn test_callback_may_modify_buffer_in_place() {
        let mut buf = [0x0fu8; 512];
        let mut dispatcher = CallbackDispatcher::new(Invert(0));
        assert!(dispatcher.dispatch(0, &mut buf));
        assert_eq!(dispatcher.callback.0, 512);
        assert!(buf.iter().all(|&b| b == 0xf0));
    }
}
