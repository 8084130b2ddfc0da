//! Mixer device abstraction
//!
//! This crate describes the mixer devices volmix talks to: sound cards, their
//! simple mixer controls and the descriptors that signal control changes.
//!
//! # Backends
//!
//! - [`AlsaBackend`]: ALSA through `amixer` and `/dev/snd/controlC*`
//! - [`mock::MockBackend`]: in-memory cards for tests and desktop development
//!
//! # Example
//!
//! ```no_run
//! use volmix_hal::{AlsaBackend, CardSelector, MixerBackend, MixerHandle};
//!
//! fn main() -> volmix_hal::Result<()> {
//!     let backend = AlsaBackend::new();
//!     println!("Cards: {:?}", backend.cards());
//!
//!     let handle = backend.open(&CardSelector::Index(0), "Master")?;
//!     println!("Volumes: {:?}", handle.channel_volumes()?);
//!     Ok(())
//! }
//! ```

pub mod alsa;
pub mod ctl;
pub mod device;
pub mod mock;

pub use alsa::{AlsaBackend, AlsaHandle, CardEntry};
pub use ctl::ControlDevice;
pub use device::{
    CardSelector, DeviceError, DeviceIdentity, MixerBackend, MixerHandle, PollDescriptor,
};

/// HAL Result type
pub type Result<T> = std::result::Result<T, DeviceError>;
