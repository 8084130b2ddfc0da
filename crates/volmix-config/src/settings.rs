//! Mixer settings

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Curve used to convert between mixer and host volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeScale {
    /// Mixer percentage passed through unchanged
    Linear,
    /// Perceptual cubic curve
    #[default]
    Cubic,
    /// Mixer percentage treated as a decibel-like value
    #[serde(rename = "log", alias = "logarithmic")]
    Logarithmic,
}

impl VolumeScale {
    pub fn name(&self) -> &'static str {
        match self {
            VolumeScale::Linear => "linear",
            VolumeScale::Cubic => "cubic",
            VolumeScale::Logarithmic => "log",
        }
    }
}

impl fmt::Display for VolumeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VolumeScale {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(VolumeScale::Linear),
            "cubic" => Ok(VolumeScale::Cubic),
            "log" | "logarithmic" => Ok(VolumeScale::Logarithmic),
            other => Err(ConfigError::Invalid(format!(
                "unknown volume scale '{}', expected linear, cubic or log",
                other
            ))),
        }
    }
}

/// `[alsamixer]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerSettings {
    /// Card index; takes precedence over `device` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<u32>,

    /// ALSA device name such as "default" or "hw:1"
    #[serde(default = "default_device")]
    pub device: String,

    /// Simple mixer control name
    #[serde(default = "default_control")]
    pub control: String,

    /// Mixer percentage mapped to host volume 0
    #[serde(default = "default_min_volume")]
    pub min_volume: u8,

    /// Mixer percentage mapped to host volume 100
    #[serde(default = "default_max_volume")]
    pub max_volume: u8,

    #[serde(default)]
    pub volume_scale: VolumeScale,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_control() -> String {
    "Master".to_string()
}

fn default_min_volume() -> u8 {
    0
}

fn default_max_volume() -> u8 {
    100
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            card: None,
            device: default_device(),
            control: default_control(),
            min_volume: default_min_volume(),
            max_volume: default_max_volume(),
            volume_scale: VolumeScale::default(),
        }
    }
}

impl MixerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_volume > 100 || self.max_volume > 100 {
            return Err(ConfigError::Invalid(format!(
                "min_volume ({}) and max_volume ({}) must be within 0-100",
                self.min_volume, self.max_volume
            )));
        }
        if self.max_volume <= self.min_volume {
            return Err(ConfigError::Invalid(format!(
                "max_volume ({}) must be greater than min_volume ({})",
                self.max_volume, self.min_volume
            )));
        }
        if self.control.trim().is_empty() {
            return Err(ConfigError::Invalid("control must not be empty".into()));
        }
        if self.card.is_none() && self.device.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "either card or device must be set".into(),
            ));
        }
        Ok(())
    }
}
