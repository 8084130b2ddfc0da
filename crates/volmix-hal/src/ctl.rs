//! ALSA control device event subscription
//!
//! `/dev/snd/controlC<N>` becomes readable whenever any control element on the
//! card changes, once events have been subscribed with an ioctl.

use crate::{DeviceError, PollDescriptor};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// `struct snd_ctl_event` is a 4 byte type plus a 60 byte union
const CTL_EVENT_SIZE: usize = 64;

// SNDRV_CTL_IOCTL_SUBSCRIBE_EVENTS = _IOWR('U', 0x16, int)
nix::ioctl_readwrite!(snd_ctl_subscribe_events, b'U', 0x16, libc::c_int);

/// Subscribed control device of one card
#[derive(Debug)]
pub struct ControlDevice {
    file: File,
    path: PathBuf,
}

impl ControlDevice {
    /// Path of the control device for a card index
    pub fn path_for(dev_root: &Path, card: u32) -> PathBuf {
        dev_root.join(format!("controlC{}", card))
    }

    /// Open non-blocking and subscribe to element change events
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                DeviceError::Unavailable(format!("cannot open {}: {}", path.display(), e))
            })?;

        let mut subscribe: libc::c_int = 1;
        // SAFETY: the fd is open for the duration of the call and `subscribe`
        // outlives it.
        unsafe { snd_ctl_subscribe_events(file.as_raw_fd(), &mut subscribe) }?;

        tracing::debug!("Subscribed to control events on {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> PollDescriptor {
        PollDescriptor::new(self.file.as_raw_fd(), libc::EPOLLIN as u32)
    }

    /// Read queued events until the queue is empty
    pub fn drain(&self) -> Result<usize, DeviceError> {
        let mut buf = [0u8; CTL_EVENT_SIZE * 16];
        let mut drained = 0;
        let mut file = &self.file;

        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => drained += n / CTL_EVENT_SIZE,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(drained)
    }
}
