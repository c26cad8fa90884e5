//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the runtime.
//! Configuration is layered:
//! 1. Built-in defaults ([`SdrConfig::default`])
//! 2. `config/osmosdr.toml` (or an explicit path)
//! 3. Environment variables prefixed with `OSMOSDR_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use osmosdr::config::SdrConfig;
//!
//! // OSMOSDR_STREAMING__DEFAULT_BUF_NUM=64 overrides the file
//! let config = SdrConfig::load()?;
//! println!("Backend: {:?}", config.application.backend);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::stream::config::{DEFAULT_BUF_LEN, DEFAULT_BUF_NUM};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/osmosdr.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SdrConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Streaming engine settings
    #[serde(default)]
    pub streaming: StreamingSettings,
    /// USB transport settings
    #[serde(default)]
    pub usb: UsbSettings,
    /// Simulated device settings
    #[serde(default)]
    pub mock: MockSettings,
}

/// Which device backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Simulated device, always available.
    #[default]
    Mock,
    /// libusb bulk transport (requires the `usb` feature).
    Usb,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Device backend
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backend: BackendKind::default(),
        }
    }
}

/// Streaming engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Buffer count used when a session requests 0
    #[serde(default = "default_buf_num")]
    pub default_buf_num: u32,
    /// Buffer length used when a session requests 0
    #[serde(default = "default_buf_len")]
    pub default_buf_len: u32,
    /// Upper bound on buf_num * buf_len in bytes
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    /// Consecutive failures on one slot after which the device is considered
    /// lost (0 = never)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            default_buf_num: default_buf_num(),
            default_buf_len: default_buf_len(),
            max_total_bytes: default_max_total_bytes(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// USB transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// USB vendor ID to match during enumeration
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    /// USB product ID to match during enumeration
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    /// Interface claimed on open
    #[serde(default)]
    pub interface: u8,
    /// Bulk IN endpoint carrying samples
    #[serde(default = "default_endpoint")]
    pub endpoint: u8,
    /// Bulk read slice used to observe cancellation, in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Timeout for `read_sync`, in milliseconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,
    /// Bytes requested per bulk read while filling a streaming buffer. Must
    /// be a multiple of 512 small enough to arrive within one poll slice at
    /// the lowest sample rate.
    #[serde(default = "default_read_chunk_len")]
    pub read_chunk_len: u32,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            interface: 0,
            endpoint: default_endpoint(),
            poll_timeout_ms: default_poll_timeout(),
            sync_timeout_ms: default_sync_timeout(),
            read_chunk_len: default_read_chunk_len(),
        }
    }
}

/// Simulated device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockSettings {
    /// Number of simulated devices reported by enumeration
    #[serde(default = "default_mock_devices")]
    pub devices: usize,
    /// Delay before each simulated completion, in microseconds
    #[serde(default)]
    pub completion_delay_us: u64,
    /// Seed for random fault injection
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            devices: default_mock_devices(),
            completion_delay_us: 0,
            seed: None,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_buf_num() -> u32 {
    DEFAULT_BUF_NUM
}

fn default_buf_len() -> u32 {
    DEFAULT_BUF_LEN
}

fn default_max_total_bytes() -> usize {
    osmosdr_pool::DEFAULT_MAX_TOTAL_BYTES
}

fn default_max_consecutive_failures() -> u32 {
    64
}

fn default_vendor_id() -> u16 {
    0x16c0
}

fn default_product_id() -> u16 {
    0x0763
}

fn default_endpoint() -> u8 {
    0x86
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_sync_timeout() -> u64 {
    1000
}

fn default_read_chunk_len() -> u32 {
    // 32 ms of samples at 250 kS/s
    16 * 1024
}

fn default_mock_devices() -> usize {
    1
}

impl SdrConfig {
    /// Load configuration from `config/osmosdr.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `OSMOSDR_`.
    /// Example: `OSMOSDR_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SdrConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("OSMOSDR_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let streaming = &self.streaming;
        if streaming.default_buf_num == 0 {
            return Err("streaming.default_buf_num must be greater than 0".to_string());
        }
        let alignment = osmosdr_pool::BUFFER_ALIGNMENT as u32;
        if streaming.default_buf_len == 0 || streaming.default_buf_len % alignment != 0 {
            return Err(format!(
                "streaming.default_buf_len {} must be a positive multiple of {}",
                streaming.default_buf_len, alignment
            ));
        }
        let default_total = streaming.default_buf_num as usize * streaming.default_buf_len as usize;
        if default_total > streaming.max_total_bytes {
            return Err(format!(
                "default buffers ({} bytes) exceed streaming.max_total_bytes ({})",
                default_total, streaming.max_total_bytes
            ));
        }

        if self.usb.endpoint & 0x80 == 0 {
            return Err(format!(
                "usb.endpoint 0x{:02x} is not an IN endpoint",
                self.usb.endpoint
            ));
        }
        if self.usb.poll_timeout_ms == 0 {
            return Err("usb.poll_timeout_ms must be greater than 0".to_string());
        }
        if self.usb.read_chunk_len == 0 || self.usb.read_chunk_len % alignment != 0 {
            return Err(format!(
                "usb.read_chunk_len {} must be a positive multiple of {}",
                self.usb.read_chunk_len, alignment
            ));
        }

        if self.application.backend == BackendKind::Usb && !cfg!(feature = "usb") {
            return Err("backend 'usb' requires building with --features usb".to_string());
        }

        Ok(())
    }
}
