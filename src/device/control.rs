//! Scalar control surface: registers, limits and lookup tables.

use crate::error::{Result, SdrError};

/// Gain steps of the E4000 tuner, in tenths of dB.
pub const E4000_GAINS: [i32; 18] = [
    -10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420, 430, 450, 470, 490,
];

/// E4000 channel filter bandwidths, in Hz, ascending.
pub const BASEBAND_FILTERS_HZ: [u32; 16] = [
    2_150_000, 2_200_000, 2_300_000, 2_400_000, 2_500_000, 2_600_000, 2_800_000, 3_000_000,
    3_200_000, 3_400_000, 3_600_000, 3_800_000, 4_000_000, 4_400_000, 4_800_000, 5_500_000,
];

/// Tunable range of the E4000, in Hz.
pub const TUNER_RANGE_HZ: std::ops::RangeInclusive<u32> = 52_000_000..=2_200_000_000;

/// Tuning resolution, in Hz.
pub const TUNER_STEP_HZ: u32 = 1_000;

/// Supported ADC sample rates, in Hz.
pub const SAMPLE_RATE_RANGE_HZ: std::ops::RangeInclusive<u32> = 250_000..=4_000_000;

/// Highest reference clock accepted for either the ADC or the tuner, in Hz.
pub const MAX_CLOCK_HZ: u32 = 64_000_000;

/// Device registers behind the scalar setters and getters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// ADC reference clock, Hz.
    AdcClock,
    /// Tuner reference clock, Hz.
    TunerClock,
    /// Tuned center frequency, Hz.
    CenterFreq,
    /// Tuner gain, tenths of dB (two's complement).
    TunerGain,
    /// 1 = manual gain, 0 = automatic.
    GainMode,
    /// ADC sample rate, Hz.
    SampleRate,
    /// Baseband channel filter bandwidth, Hz.
    BasebandFilter,
}

/// Register-level access to a device.
pub trait ControlPort: Send {
    /// Write one register.
    fn write_register(&mut self, register: Register, value: u32) -> Result<()>;

    /// Read one register.
    fn read_register(&mut self, register: Register) -> Result<u32>;
}

/// Nearest supported gain step to `gain` (tenths of dB). Ties pick the lower
/// step.
#[must_use]
pub fn nearest_gain(gain: i32) -> i32 {
    let mut best = E4000_GAINS[0];
    for &step in &E4000_GAINS[1..] {
        if (step - gain).abs() < (best - gain).abs() {
            best = step;
        }
    }
    best
}

/// Narrowest channel filter at least as wide as `sample_rate`, or the widest
/// filter if none is.
#[must_use]
pub fn baseband_filter_for(sample_rate: u32) -> u32 {
    BASEBAND_FILTERS_HZ
        .iter()
        .copied()
        .find(|bw| *bw >= sample_rate)
        .unwrap_or(BASEBAND_FILTERS_HZ[BASEBAND_FILTERS_HZ.len() - 1])
}

/// Round `freq` to the tuner step and check it is tunable.
pub fn tuned_frequency(freq: u32) -> Result<u32> {
    if !TUNER_RANGE_HZ.contains(&freq) {
        return Err(SdrError::invalid_argument(format!(
            "center frequency {freq} Hz outside {}..={} Hz",
            TUNER_RANGE_HZ.start(),
            TUNER_RANGE_HZ.end()
        )));
    }
    let rounded = (u64::from(freq) + u64::from(TUNER_STEP_HZ / 2)) / u64::from(TUNER_STEP_HZ)
        * u64::from(TUNER_STEP_HZ);
    Ok((rounded as u32).min(*TUNER_RANGE_HZ.end()))
}

pub(crate) fn check_clock(name: &str, freq: u32) -> Result<()> {
    if freq == 0 || freq > MAX_CLOCK_HZ {
        return Err(SdrError::invalid_argument(format!(
            "{name} clock {freq} Hz outside 1..={MAX_CLOCK_HZ} Hz"
        )));
    }
    Ok(())
}

pub(crate) fn check_sample_rate(rate: u32) -> Result<()> {
    if !SAMPLE_RATE_RANGE_HZ.contains(&rate) {
        return Err(SdrError::invalid_argument(format!(
            "sample rate {rate} Hz outside {}..={} Hz",
            SAMPLE_RATE_RANGE_HZ.start(),
            SAMPLE_RATE_RANGE_HZ.end()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_gain() {
        assert_eq!(nearest_gain(-100), -10);
        assert_eq!(nearest_gain(0), -10);
        assert_eq!(nearest_gain(3), 15);
        assert_eq!(nearest_gain(300), 290);
        assert_eq!(nearest_gain(380), 340);
        assert_eq!(nearest_gain(425), 420);
        assert_eq!(nearest_gain(1000), 490);
        assert!(E4000_GAINS.iter().all(|g| nearest_gain(*g) == *g));
    }

    #[test]
    fn test_baseband_filter_selection() {
        assert_eq!(baseband_filter_for(1_000_000), 2_150_000);
        assert_eq!(baseband_filter_for(2_400_000), 2_400_000);
        assert_eq!(baseband_filter_for(2_401_000), 2_500_000);
        assert_eq!(baseband_filter_for(9_000_000), 5_500_000);
    }

    #[test]
    fn test_tuned_frequency() {
        assert_eq!(tuned_frequency(100_000_400).unwrap(), 100_000_000);
        assert_eq!(tuned_frequency(100_000_500).unwrap(), 100_001_000);
        assert!(tuned_frequency(10_000_000).unwrap_err().is_invalid_argument());
        assert!(tuned_frequency(3_000_000_000).is_err());
    }

    #[test]
    fn test_clock_and_rate_limits() {
        assert!(check_clock("adc", 0).is_err());
        assert!(check_clock("adc", 32_000_000).is_ok());
        assert!(check_sample_rate(100).is_err());
        assert!(check_sample_rate(2_048_000).is_ok());
    }
}
