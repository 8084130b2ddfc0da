//! Volume curves
//!
//! The mixer reports a percentage of its control range. The host sees a
//! percentage of the calibrated window `min_volume..max_volume`, optionally
//! passed through a perceptual curve first. Both directions truncate toward
//! zero, so a round trip can land slightly below where it started.

use crate::{MixerError, VolumeScale};

/// Calibrated window and curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    min_volume: f64,
    max_volume: f64,
    scale: VolumeScale,
}

impl Calibration {
    pub fn new(min_volume: f64, max_volume: f64, scale: VolumeScale) -> crate::Result<Self> {
        if !(max_volume > min_volume) {
            return Err(MixerError::configuration(format!(
                "max_volume ({}) must be greater than min_volume ({})",
                max_volume, min_volume
            )));
        }
        Ok(Self {
            min_volume,
            max_volume,
            scale,
        })
    }

    pub fn min_volume(&self) -> f64 {
        self.min_volume
    }

    pub fn max_volume(&self) -> f64 {
        self.max_volume
    }

    pub fn scale(&self) -> VolumeScale {
        self.scale
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            min_volume: 0.0,
            max_volume: 100.0,
            scale: VolumeScale::default(),
        }
    }
}

/// GStreamer's cubic to linear stream volume conversion
pub fn cubic_to_linear(cubic: f64) -> f64 {
    cubic * cubic * cubic
}

/// GStreamer's linear to cubic stream volume conversion
pub fn linear_to_cubic(linear: f64) -> f64 {
    linear.cbrt()
}

/// Convert a mixer percentage to host volume, clamped to 0-100
pub fn to_host_volume(mixer_volume: i64, calibration: &Calibration) -> u8 {
    let mut volume = mixer_volume as f64;
    match calibration.scale {
        VolumeScale::Linear => {}
        VolumeScale::Cubic => volume = cubic_to_linear(volume / 100.0) * 100.0,
        // The mixer value is treated as decibel-like; this is intentionally
        // not GStreamer's linear/dB conversion.
        VolumeScale::Logarithmic => volume = 10f64.powf(volume / 50.0),
    }

    let volume = (volume - calibration.min_volume) * 100.0
        / (calibration.max_volume - calibration.min_volume);
    (volume as i64).clamp(0, 100) as u8
}

/// Convert host volume to a mixer percentage.
///
/// The result is not clamped. With the log curve a window starting at 0 maps
/// host volume 0 to `i64::MIN`, which the device rejects.
pub fn to_mixer_volume(volume: u8, calibration: &Calibration) -> i64 {
    let mut mixer_volume = calibration.min_volume
        + f64::from(volume) * (calibration.max_volume - calibration.min_volume) / 100.0;
    match calibration.scale {
        VolumeScale::Linear => {}
        VolumeScale::Cubic => mixer_volume = linear_to_cubic(mixer_volume / 100.0) * 100.0,
        VolumeScale::Logarithmic => mixer_volume = 50.0 * mixer_volume.log10(),
    }
    mixer_volume as i64
}
