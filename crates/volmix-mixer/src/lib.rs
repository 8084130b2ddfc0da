//! Mixer control for volmix
//!
//! Bridges a mixer device and a host that thinks in 0-100 volume plus a mute
//! flag:
//!
//! - [`scale`]: conversion between mixer percentage and host volume
//! - [`MixerController`]: get/set volume and mute, change notification
//! - [`Observer`]: background thread waiting on control change descriptors
//!
//! # Example
//!
//! ```no_run
//! use std::sync::{Arc, mpsc};
//! use volmix_config::MixerSettings;
//! use volmix_hal::AlsaBackend;
//! use volmix_mixer::{MixerController, MixerEvent};
//!
//! fn main() -> volmix_mixer::Result<()> {
//!     let (tx, rx) = mpsc::channel::<MixerEvent>();
//!     let settings = MixerSettings::default();
//!     let mut mixer = MixerController::from_settings(AlsaBackend::new(), &settings, Arc::new(tx))?;
//!
//!     mixer.start()?;
//!     mixer.set_volume(40);
//!     while let Ok(event) = rx.recv() {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod controller;
pub mod observer;
pub mod scale;

pub use controller::{MixerController, MixerEvent, MixerListener, ObservedState};
pub use observer::{Observer, ObserverOptions, ObserverState};
pub use scale::{Calibration, to_host_volume, to_mixer_volume};
pub use volmix_config::VolumeScale;
pub use volmix_hal::{CardSelector, DeviceError, DeviceIdentity};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MixerError {
    /// The configured card or control does not exist
    #[error("{message}")]
    Configuration { message: String, known: Vec<String> },

    #[error("Mixer device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Mixer observer setup failed: {0}")]
    ObserverSetup(String),
}

impl MixerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        MixerError::Configuration {
            message: message.into(),
            known: Vec::new(),
        }
    }
}

/// Mixer Result type
pub type Result<T> = std::result::Result<T, MixerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = MixerError::Configuration {
            message: "Could not find ALSA mixer control Foo".into(),
            known: vec!["Master".into()],
        };
        assert_eq!(err.to_string(), "Could not find ALSA mixer control Foo");
    }

    #[test]
    fn test_device_error_conversion() {
        let err: MixerError = DeviceError::Unavailable("unplugged".into()).into();
        assert!(matches!(err, MixerError::Device(_)));
        assert!(err.to_string().contains("unplugged"));
    }
}
