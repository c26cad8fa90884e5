//! osmosdr_rx: capture raw samples to a file or stdout.
//!
//! ```bash
//! # 8 MiB from the simulated receiver
//! osmosdr_rx --num-bytes 8388608 capture.bin
//!
//! # 10 seconds from real hardware at 433.92 MHz, 2.048 MS/s, 24 dB gain
//! osmosdr_rx --backend usb --freq 433920000 --rate 2048000 --gain 240 \
//!     --duration-secs 10 - > capture.bin
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use osmosdr::config::{BackendKind, SdrConfig};
use osmosdr::{backend_from_config, logging, Device, StreamConfig};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Mock,
    Usb,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Mock => BackendKind::Mock,
            Backend::Usb => BackendKind::Usb,
        }
    }
}

#[derive(Parser)]
#[command(name = "osmosdr_rx")]
#[command(about = "Capture raw samples from an OsmoSDR receiver", long_about = None)]
struct Cli {
    /// Output file, `-` for stdout
    output: PathBuf,

    /// Configuration file
    #[arg(long, default_value = osmosdr::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Device index
    #[arg(short, long, default_value_t = 0)]
    device: usize,

    /// Center frequency in Hz
    #[arg(short, long)]
    freq: Option<u32>,

    /// Sample rate in Hz
    #[arg(short, long)]
    rate: Option<u32>,

    /// Tuner gain in tenths of dB (enables manual gain)
    #[arg(short, long, allow_hyphen_values = true)]
    gain: Option<i32>,

    /// Number of transfer buffers (0 = default)
    #[arg(long, default_value_t = 0)]
    buf_num: u32,

    /// Length of each buffer, a multiple of 512 (0 = default)
    #[arg(long, default_value_t = 0)]
    buf_len: u32,

    /// Stop after this many bytes
    #[arg(short = 'n', long)]
    num_bytes: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn open_output(path: &PathBuf) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout().lock())));
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SdrConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(backend) = cli.backend {
        config.application.backend = backend.into();
    }
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let backend = backend_from_config(&config)?;
    let count = backend.device_count();
    if count == 0 {
        bail!("no devices found");
    }
    for index in 0..count {
        if let Some(name) = backend.device_name(index) {
            info!(index, %name, "Found device");
        }
    }

    let device = Device::open_with_settings(&*backend, cli.device, config.streaming.clone())
        .context("failed to open device")?;

    if let Some(rate) = cli.rate {
        device.set_sample_rate(rate)?;
    }
    if let Some(freq) = cli.freq {
        let tuned = device.set_center_freq(freq)?;
        info!(requested = freq, tuned, "Tuned");
    }
    if let Some(gain) = cli.gain {
        device.set_tuner_gain_mode(true)?;
        let applied = device.set_tuner_gain(gain)?;
        info!(requested = gain, applied, "Manual gain");
    }

    let cancel = device.cancel_handle();
    if let Some(secs) = cli.duration_secs {
        let timer_cancel = cancel.clone();
        thread::Builder::new()
            .name("osmosdr-rx-timer".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                timer_cancel.cancel();
            })
            .context("failed to start timer thread")?;
    }

    let mut out = open_output(&cli.output)?;
    let mut written: u64 = 0;
    let mut write_error: Option<io::Error> = None;
    let budget = cli.num_bytes;

    let summary = device.read_async(
        |buf: &[u8]| {
            if write_error.is_some() {
                return;
            }
            let take = match budget {
                Some(limit) => buf.len().min(limit.saturating_sub(written) as usize),
                None => buf.len(),
            };
            if let Err(e) = out.write_all(&buf[..take]) {
                warn!(error = %e, "Write failed; stopping");
                write_error = Some(e);
                cancel.cancel();
                return;
            }
            written += take as u64;
            if budget.is_some_and(|limit| written >= limit) {
                cancel.cancel();
            }
        },
        StreamConfig::new(cli.buf_num, cli.buf_len),
    )?;

    if let Some(e) = write_error {
        return Err(e).context("failed to write samples");
    }
    out.flush().context("failed to flush output")?;
    device.close();

    eprintln!(
        "{} bytes written, {} buffers ({} x {} bytes), {} transfer failures, {} callback faults, {:.2}s",
        written,
        summary.buffers_delivered,
        summary.buf_num,
        summary.buf_len,
        summary.transfer_failures,
        summary.callback_faults,
        summary.duration.as_secs_f64()
    );
    Ok(())
}
