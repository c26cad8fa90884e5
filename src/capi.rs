//! C-linkage `osmosdr_*` surface.
//!
//! Every function takes the opaque handle returned by [`osmosdr_open`]. The
//! backend is built once, on first use, from the configuration found by
//! [`SdrConfig::load`]. Status codes are [`ErrorCode`] values: 0 on success,
//! negative on failure.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_uchar, c_void, CString};
use std::ptr;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::config::{SdrConfig, StreamingSettings};
use crate::device::Device;
use crate::error::{ErrorCode, Result};
use crate::stream::{ReadCallback, StreamConfig};
use crate::transport::{backend_from_config, DeviceBackend};

/// Opaque device handle (`osmosdr_dev_t`).
pub struct OsmosdrDev {
    device: Device,
}

/// Signature of the `osmosdr_read_async` callback.
///
/// `buf` points at the pool slot holding `len` received bytes. It may be read
/// and written during the call; it is refilled after the callback returns.
pub type ReadAsyncCallback = extern "C" fn(buf: *mut c_uchar, len: u32, ctx: *mut c_void);

/// A C callback and its context pointer.
struct ForeignCallback {
    cb: ReadAsyncCallback,
    ctx: *mut c_void,
}

impl ReadCallback for ForeignCallback {
    fn on_samples(&mut self, data: &mut [u8]) {
        (self.cb)(data.as_mut_ptr(), data.len() as u32, self.ctx);
    }
}

struct CapiContext {
    backend: Box<dyn DeviceBackend>,
    settings: StreamingSettings,
}

static CONTEXT: Lazy<std::result::Result<CapiContext, String>> = Lazy::new(|| {
    let config = SdrConfig::load().map_err(|e| e.to_string())?;
    config.validate()?;
    let backend = backend_from_config(&config).map_err(|e| e.to_string())?;
    Ok(CapiContext {
        backend,
        settings: config.streaming,
    })
});

/// Device names handed out to C callers. Entries are never replaced, so
/// returned pointers stay valid for the life of the process.
static NAMES: Lazy<Mutex<HashMap<u32, CString>>> = Lazy::new(|| Mutex::new(HashMap::new()));

const EMPTY: &[u8] = b"\0";

fn context() -> Option<&'static CapiContext> {
    match &*CONTEXT {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            error!(error = %e, "osmosdr backend unavailable");
            None
        }
    }
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => ErrorCode::Success.into(),
        Err(e) => {
            warn!(error = %e, code = e.code().name(), "osmosdr call failed");
            e.code().into()
        }
    }
}

/// # Safety
/// `dev` must be null or a handle returned by [`osmosdr_open`] and not yet
/// closed.
unsafe fn device<'a>(dev: *mut OsmosdrDev) -> Option<&'a Device> {
    // SAFETY: guaranteed by the caller.
    unsafe { dev.as_ref() }.map(|d| &d.device)
}

/// Number of discoverable devices; 0 if none or the backend failed to load.
#[no_mangle]
pub extern "C" fn osmosdr_get_device_count() -> u32 {
    context().map_or(0, |ctx| ctx.backend.device_count() as u32)
}

/// Display name of device `index`, or an empty string.
#[no_mangle]
pub extern "C" fn osmosdr_get_device_name(index: u32) -> *const c_char {
    let Some(ctx) = context() else {
        return EMPTY.as_ptr().cast();
    };
    let mut names = NAMES.lock();
    if let Some(name) = names.get(&index) {
        return name.as_ptr();
    }
    match ctx
        .backend
        .device_name(index as usize)
        .and_then(|name| CString::new(name).ok())
    {
        Some(name) => names.entry(index).or_insert(name).as_ptr(),
        None => EMPTY.as_ptr().cast(),
    }
}

/// Open device `index` and store its handle in `*dev`.
///
/// # Safety
/// `dev` must be a valid pointer to writable storage for one handle.
#[no_mangle]
pub unsafe extern "C" fn osmosdr_open(dev: *mut *mut OsmosdrDev, index: u32) -> c_int {
    if dev.is_null() {
        return ErrorCode::InvalidArgument.into();
    }
    let Some(ctx) = context() else {
        return ErrorCode::Config.into();
    };
    match Device::open_with_settings(&*ctx.backend, index as usize, ctx.settings.clone()) {
        Ok(device) => {
            let handle = Box::into_raw(Box::new(OsmosdrDev { device }));
            // SAFETY: `dev` is non-null and writable per the contract.
            unsafe { ptr::write(dev, handle) };
            ErrorCode::Success.into()
        }
        Err(e) => status(Err(e)),
    }
}

/// Close a handle, cancelling any active session.
///
/// # Safety
/// `dev` must be a handle from [`osmosdr_open`]. It is invalid afterwards.
/// No other call on the same handle may be in progress.
#[no_mangle]
pub unsafe extern "C" fn osmosdr_close(dev: *mut OsmosdrDev) -> c_int {
    if dev.is_null() {
        return ErrorCode::InvalidArgument.into();
    }
    // SAFETY: `dev` came from `Box::into_raw` in `osmosdr_open`.
    let handle = unsafe { Box::from_raw(dev) };
    handle.device.close();
    ErrorCode::Success.into()
}

/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_set_clock_freq(
    dev: *mut OsmosdrDev,
    adc_clock: u32,
    tun_clock: u32,
) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    status(device.set_clock_freq(adc_clock, tun_clock))
}

/// # Safety
/// `dev` must be a live handle; `adc_clock` and `tun_clock` must be null or
/// writable.
#[no_mangle]
pub unsafe extern "C" fn osmosdr_get_clock_freq(
    dev: *mut OsmosdrDev,
    adc_clock: *mut u32,
    tun_clock: *mut u32,
) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    match device.clock_freq() {
        Ok((adc, tun)) => {
            // SAFETY: null checked by `as_mut`; writable per the contract.
            if let Some(out) = unsafe { adc_clock.as_mut() } {
                *out = adc;
            }
            if let Some(out) = unsafe { tun_clock.as_mut() } {
                *out = tun;
            }
            ErrorCode::Success.into()
        }
        Err(e) => status(Err(e)),
    }
}

/// Returns 0 on error, else the tuned frequency in Hz. Frequencies above
/// `INT_MAX` come back negative and are recovered by a cast to `uint32_t`.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_set_center_freq(dev: *mut OsmosdrDev, freq: u32) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return 0;
    };
    match device.set_center_freq(freq) {
        Ok(tuned) => tuned as c_int,
        Err(e) => {
            warn!(error = %e, "osmosdr_set_center_freq failed");
            0
        }
    }
}

/// Tuned frequency in Hz, 0 on error.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_get_center_freq(dev: *mut OsmosdrDev) -> u32 {
    unsafe { device(dev) }
        .and_then(|d| d.center_freq().ok())
        .unwrap_or(0)
}

/// Set the gain in tenths of dB. Requires manual gain mode.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_set_tuner_gain(dev: *mut OsmosdrDev, gain: c_int) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    status(device.set_tuner_gain(gain).map(|_| ()))
}

/// Gain in tenths of dB, 0 on error.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_get_tuner_gain(dev: *mut OsmosdrDev) -> c_int {
    unsafe { device(dev) }
        .and_then(|d| d.tuner_gain().ok())
        .unwrap_or(0)
}

/// `manual == 1` selects manual gain.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_set_tuner_gain_mode(dev: *mut OsmosdrDev, manual: c_int) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    status(device.set_tuner_gain_mode(manual == 1))
}

/// Set the sample rate; selects the baseband filter to match.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_set_sample_rate(dev: *mut OsmosdrDev, rate: u32) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    status(device.set_sample_rate(rate))
}

/// Sample rate in Hz, 0 on error.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_get_sample_rate(dev: *mut OsmosdrDev) -> u32 {
    unsafe { device(dev) }
        .and_then(|d| d.sample_rate().ok())
        .unwrap_or(0)
}

/// One blocking bulk read of up to `len` bytes.
///
/// # Safety
/// `dev` must be a live handle, `buf` must be writable for `len` bytes and
/// `n_read` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn osmosdr_read_sync(
    dev: *mut OsmosdrDev,
    buf: *mut c_void,
    len: c_int,
    n_read: *mut c_int,
) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    if buf.is_null() || len <= 0 {
        return ErrorCode::InvalidArgument.into();
    }
    // SAFETY: `buf` is non-null and writable for `len` bytes per the contract.
    let slice = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len as usize) };
    match device.read_sync(slice) {
        Ok(n) => {
            if let Some(out) = unsafe { n_read.as_mut() } {
                *out = n as c_int;
            }
            ErrorCode::Success.into()
        }
        Err(e) => status(Err(e)),
    }
}

/// Stream until [`osmosdr_cancel_async`]. `buf_num` and `buf_len` of 0 pick
/// the defaults. The buffer passed to `cb` is valid only during the call.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`]. `cb` is called on this
/// thread with `ctx`.
#[no_mangle]
pub unsafe extern "C" fn osmosdr_read_async(
    dev: *mut OsmosdrDev,
    cb: Option<ReadAsyncCallback>,
    ctx: *mut c_void,
    buf_num: u32,
    buf_len: u32,
) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    let Some(cb) = cb else {
        return ErrorCode::InvalidArgument.into();
    };
    let callback = ForeignCallback { cb, ctx };
    status(
        device
            .read_async(callback, StreamConfig::new(buf_num, buf_len))
            .map(|_| ()),
    )
}

/// Request the running session to stop. Returns immediately; 0 when idle.
///
/// # Safety
/// `dev` must be a live handle from [`osmosdr_open`].
#[no_mangle]
pub unsafe extern "C" fn osmosdr_cancel_async(dev: *mut OsmosdrDev) -> c_int {
    let Some(device) = (unsafe { device(dev) }) else {
        return ErrorCode::InvalidArgument.into();
    };
    status(device.cancel_async())
}
