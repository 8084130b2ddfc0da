//! Mixer device contract
//!
//! A backend enumerates sound cards and their simple mixer controls and opens
//! short-lived handles on one control. Handles never cache channel state, so a
//! fresh handle always reflects changes made by other processes.

use std::fmt;
use std::os::unix::io::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Mixer device unavailable: {0}")]
    Unavailable(String),

    #[error("Volume {0} is outside the mixer range 0-100")]
    VolumeOutOfRange(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),
}

impl DeviceError {
    /// Whether the card or control has gone away (as opposed to a bad request)
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, DeviceError::VolumeOutOfRange(_))
    }
}

/// Selects a sound card either by its index or by an ALSA device name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CardSelector {
    Index(u32),
    Name(String),
}

impl CardSelector {
    /// Human readable description used in log and error messages
    pub fn describe(&self) -> String {
        match self {
            CardSelector::Index(index) => format!("soundcard with index {}", index),
            CardSelector::Name(name) => format!("soundcard with name '{}'", name),
        }
    }
}

impl fmt::Display for CardSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardSelector::Index(index) => write!(f, "{}", index),
            CardSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Card plus simple mixer control name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub selector: CardSelector,
    pub control: String,
}

impl DeviceIdentity {
    pub fn new(selector: CardSelector, control: impl Into<String>) -> Self {
        Self {
            selector,
            control: control.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, mixer control '{}'", self.selector.describe(), self.control)
    }
}

/// A descriptor to wait on for control change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDescriptor {
    pub fd: RawFd,
    /// epoll readiness mask (`EPOLLIN`, ...)
    pub events: u32,
}

impl PollDescriptor {
    pub fn new(fd: RawFd, events: u32) -> Self {
        Self { fd, events }
    }

    /// Some drivers report unused slots as -1 (or 0xFFFF_FFFF read as unsigned)
    pub fn is_valid(&self) -> bool {
        self.fd >= 0 && self.fd as u32 != u32::MAX
    }
}

/// Source of mixer handles
pub trait MixerBackend: Send + Sync + 'static {
    type Handle: MixerHandle;

    /// Names of the sound cards present on the system
    fn cards(&self) -> Vec<String>;

    /// Simple mixer controls of a card; fails when the selector does not resolve
    fn controls(&self, selector: &CardSelector) -> crate::Result<Vec<String>>;

    /// Open one control of a card
    fn open(&self, selector: &CardSelector, control: &str) -> crate::Result<Self::Handle>;

    fn open_identity(&self, identity: &DeviceIdentity) -> crate::Result<Self::Handle> {
        self.open(&identity.selector, &identity.control)
    }
}

/// One open session on a mixer control
pub trait MixerHandle: Send {
    /// Per-channel volume as a 0-100 percentage of the control's range
    fn channel_volumes(&self) -> crate::Result<Vec<i64>>;

    /// Per-channel mute state
    fn channel_mutes(&self) -> crate::Result<Vec<bool>>;

    /// Set all channels; values outside 0-100 are rejected
    fn set_volume(&self, percent: i64) -> crate::Result<()>;

    fn set_mute(&self, mute: bool) -> crate::Result<()>;

    /// Descriptors that become readable when the control changes.
    /// They stay valid for as long as the handle is alive.
    fn poll_descriptors(&self) -> crate::Result<Vec<PollDescriptor>>;

    /// Consume queued change notifications after a wake-up
    fn drain_events(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Reject volumes the control cannot represent
pub fn check_volume_range(percent: i64) -> crate::Result<()> {
    if (0..=100).contains(&percent) {
        Ok(())
    } else {
        Err(DeviceError::VolumeOutOfRange(percent))
    }
}
