//! Mock mixer backend for testing without sound hardware
//!
//! Cards and controls live in shared memory. Every change, whether made through
//! a handle or simulated as an external change, signals an eventfd per open
//! watch so that a real epoll based observer can be exercised.
//!
//! # Usage
//!
//! ```no_run
//! use volmix_hal::mock::MockBackend;
//! use volmix_hal::{CardSelector, MixerBackend, MixerHandle};
//!
//! let backend = MockBackend::new();
//! let handle = backend.open(&CardSelector::Index(0), "Master").unwrap();
//! assert_eq!(handle.channel_volumes().unwrap(), vec![50, 50]);
//!
//! // Simulate another application changing the volume
//! backend.set_volumes("Master", vec![80, 80]);
//! ```

use crate::device::check_volume_range;
use crate::{CardSelector, DeviceError, MixerBackend, MixerHandle, PollDescriptor};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::cell::OnceCell;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// State of one simple mixer control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockControl {
    pub volumes: Vec<i64>,
    pub mutes: Vec<bool>,
    pub has_switch: bool,
}

impl MockControl {
    pub fn stereo(volume: i64, muted: bool) -> Self {
        Self {
            volumes: vec![volume; 2],
            mutes: vec![muted; 2],
            has_switch: true,
        }
    }

    /// A volume-only control such as a hardware PCM slider
    pub fn without_switch(volumes: Vec<i64>) -> Self {
        Self {
            mutes: Vec::new(),
            volumes,
            has_switch: false,
        }
    }
}

/// A sound card with named controls
#[derive(Debug, Clone)]
pub struct MockCard {
    pub index: u32,
    pub name: String,
    pub controls: Vec<(String, MockControl)>,
}

impl MockCard {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            controls: Vec::new(),
        }
    }

    pub fn with_control(mut self, name: impl Into<String>, control: MockControl) -> Self {
        self.controls.push((name.into(), control));
        self
    }

    fn control_mut(&mut self, name: &str) -> Option<&mut MockControl> {
        self.controls
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    fn control(&self, name: &str) -> Option<&MockControl> {
        self.controls.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }
}

/// Write ends kept by the backend for each handle that asked for descriptors
struct Watch {
    events: Arc<EventFd>,
    // Closing this end hangs up the handle's read end
    _hangup: OwnedFd,
}

/// Shared mock state
struct MockState {
    pub cards: Vec<MockCard>,
    /// When false every open, read and write fails as if the card was unplugged
    pub available: bool,
    /// When true writes fail while reads keep working
    pub fail_writes: bool,
    /// When true new handles get a descriptor that reports `EPOLLERR`
    pub fail_descriptors: bool,
    watches: Vec<Watch>,
}

impl MockState {
    fn resolve(&self, selector: &CardSelector) -> Option<usize> {
        match selector {
            CardSelector::Index(index) => self.cards.iter().position(|c| c.index == *index),
            CardSelector::Name(name) if name == "default" => {
                if self.cards.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            CardSelector::Name(name) => {
                let by_index = name
                    .strip_prefix("hw:")
                    .and_then(|n| n.parse::<u32>().ok());
                self.cards.iter().position(|c| {
                    c.name == *name || Some(c.index) == by_index
                })
            }
        }
    }

    fn notify(&mut self) {
        self.watches.retain(|w| Arc::strong_count(&w.events) > 1);
        for watch in &self.watches {
            let _ = watch.events.write(1);
        }
    }
}

struct MockInner {
    state: RwLock<MockState>,
    opened: AtomicUsize,
    live: AtomicUsize,
}

/// In-memory mixer backend; clones share the same state
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl MockBackend {
    /// One card "Mock" with a stereo "Master" at 50% and a stereo "PCM" at 75%
    pub fn new() -> Self {
        Self::with_cards(vec![
            MockCard::new(0, "Mock")
                .with_control("Master", MockControl::stereo(50, false))
                .with_control("PCM", MockControl::stereo(75, false)),
        ])
    }

    pub fn with_cards(cards: Vec<MockCard>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: RwLock::new(MockState {
                    cards,
                    available: true,
                    fail_writes: false,
                    fail_descriptors: false,
                    watches: Vec::new(),
                }),
                opened: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MockState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MockState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate another process changing a control on the first card that has it
    pub fn external_change(&self, control: &str, change: impl FnOnce(&mut MockControl)) {
        let mut state = self.write_state();
        if let Some(ctl) = state.cards.iter_mut().find_map(|c| c.control_mut(control)) {
            change(ctl);
            state.notify();
        }
    }

    pub fn set_volumes(&self, control: &str, volumes: Vec<i64>) {
        self.external_change(control, |c| c.volumes = volumes);
    }

    pub fn set_mutes(&self, control: &str, mutes: Vec<bool>) {
        self.external_change(control, |c| c.mutes = mutes);
    }

    /// Snapshot of a control on the first card that has it
    pub fn control(&self, control: &str) -> Option<MockControl> {
        self.read_state()
            .cards
            .iter()
            .find_map(|c| c.control(control))
            .cloned()
    }

    pub fn set_available(&self, available: bool) {
        let mut state = self.write_state();
        state.available = available;
        state.notify();
    }

    /// Unplug the card: fail every operation and hang up all open watches
    pub fn disconnect(&self) {
        let mut state = self.write_state();
        state.available = false;
        state.watches.clear();
        tracing::debug!("[MOCK] Mixer disconnected");
    }

    /// Hand out descriptors that report an error to handles that ask from now on
    pub fn set_fail_descriptors(&self, fail: bool) {
        self.write_state().fail_descriptors = fail;
    }

    pub fn reconnect(&self) {
        self.write_state().available = true;
        tracing::debug!("[MOCK] Mixer reconnected");
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.write_state().fail_writes = fail;
    }

    /// Number of open attempts so far, successful or not
    pub fn open_count(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Handles currently alive
    pub fn live_handles(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Handles whose change descriptors are still registered
    pub fn active_watches(&self) -> usize {
        let mut state = self.write_state();
        state.watches.retain(|w| Arc::strong_count(&w.events) > 1);
        state.watches.len()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MixerBackend for MockBackend {
    type Handle = MockHandle;

    fn cards(&self) -> Vec<String> {
        self.read_state().cards.iter().map(|c| c.name.clone()).collect()
    }

    fn controls(&self, selector: &CardSelector) -> crate::Result<Vec<String>> {
        let state = self.read_state();
        if !state.available {
            return Err(DeviceError::Unavailable("[MOCK] mixer unplugged".into()));
        }
        let card = state.resolve(selector).ok_or_else(|| {
            DeviceError::Unavailable(format!("[MOCK] no {}", selector.describe()))
        })?;
        Ok(state.cards[card]
            .controls
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn open(&self, selector: &CardSelector, control: &str) -> crate::Result<MockHandle> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        let state = self.read_state();
        if !state.available {
            return Err(DeviceError::Unavailable("[MOCK] mixer unplugged".into()));
        }
        let card = state
            .resolve(selector)
            .filter(|&i| state.cards[i].control(control).is_some())
            .ok_or_else(|| {
                DeviceError::Unavailable(format!(
                    "[MOCK] no control '{}' on {}",
                    control,
                    selector.describe()
                ))
            })?;

        self.inner.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            backend: self.clone(),
            card: state.cards[card].index,
            control: control.to_string(),
            watch: OnceCell::new(),
        })
    }
}

/// Descriptors owned by one handle
struct HandleWatch {
    events: Arc<EventFd>,
    hangup: OwnedFd,
    /// Write end of a pipe without reader
    broken: Option<OwnedFd>,
}

/// Handle on a mock control
pub struct MockHandle {
    backend: MockBackend,
    card: u32,
    control: String,
    watch: OnceCell<HandleWatch>,
}

impl MockHandle {
    fn with_control<T>(&self, f: impl FnOnce(&MockControl) -> T) -> crate::Result<T> {
        let state = self.backend.read_state();
        if !state.available {
            return Err(DeviceError::Unavailable("[MOCK] mixer unplugged".into()));
        }
        state
            .cards
            .iter()
            .find(|c| c.index == self.card)
            .and_then(|c| c.control(&self.control))
            .map(f)
            .ok_or_else(|| DeviceError::Unavailable(format!("[MOCK] {} vanished", self.control)))
    }

    fn update(&self, f: impl FnOnce(&mut MockControl) -> crate::Result<()>) -> crate::Result<()> {
        let mut state = self.backend.write_state();
        if !state.available || state.fail_writes {
            return Err(DeviceError::Unavailable("[MOCK] write rejected".into()));
        }
        let control = state
            .cards
            .iter_mut()
            .find(|c| c.index == self.card)
            .and_then(|c| c.control_mut(&self.control))
            .ok_or_else(|| DeviceError::Unavailable(format!("[MOCK] {} vanished", self.control)))?;
        f(control)?;
        state.notify();
        Ok(())
    }
}

impl MixerHandle for MockHandle {
    fn channel_volumes(&self) -> crate::Result<Vec<i64>> {
        self.with_control(|c| c.volumes.clone())
    }

    fn channel_mutes(&self) -> crate::Result<Vec<bool>> {
        let (has_switch, mutes) = self.with_control(|c| (c.has_switch, c.mutes.clone()))?;
        if !has_switch {
            return Err(DeviceError::Unavailable(format!(
                "[MOCK] {} has no mute switch",
                self.control
            )));
        }
        Ok(mutes)
    }

    fn set_volume(&self, percent: i64) -> crate::Result<()> {
        check_volume_range(percent)?;
        self.update(|c| {
            c.volumes.iter_mut().for_each(|v| *v = percent);
            Ok(())
        })?;
        tracing::debug!("[MOCK] {} volume set to {}%", self.control, percent);
        Ok(())
    }

    fn set_mute(&self, mute: bool) -> crate::Result<()> {
        let control = self.control.clone();
        self.update(|c| {
            if !c.has_switch {
                return Err(DeviceError::Unavailable(format!(
                    "[MOCK] {} has no mute switch",
                    control
                )));
            }
            c.mutes.iter_mut().for_each(|m| *m = mute);
            Ok(())
        })?;
        tracing::debug!("[MOCK] {} muted: {}", self.control, mute);
        Ok(())
    }

    fn poll_descriptors(&self) -> crate::Result<Vec<PollDescriptor>> {
        if self.watch.get().is_none() {
            let mut state = self.backend.write_state();
            if !state.available {
                return Err(DeviceError::Unavailable("[MOCK] mixer unplugged".into()));
            }

            let events = Arc::new(EventFd::from_flags(
                EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
            )?);
            let (read_end, write_end) = nix::unistd::pipe()?;
            let broken = if state.fail_descriptors {
                let (reader, orphan) = nix::unistd::pipe()?;
                drop(reader);
                Some(orphan)
            } else {
                None
            };
            state.watches.push(Watch {
                events: Arc::clone(&events),
                _hangup: write_end,
            });
            let _ = self.watch.set(HandleWatch {
                events,
                hangup: read_end,
                broken,
            });
        }

        let watch = self
            .watch
            .get()
            .ok_or_else(|| DeviceError::Unavailable("[MOCK] watch not registered".into()))?;
        let mut descriptors = vec![
            PollDescriptor::new(watch.events.as_fd().as_raw_fd(), libc::EPOLLIN as u32),
            PollDescriptor::new(watch.hangup.as_raw_fd(), libc::EPOLLIN as u32),
        ];
        if let Some(broken) = &watch.broken {
            descriptors.push(PollDescriptor::new(broken.as_raw_fd(), libc::EPOLLOUT as u32));
        }
        Ok(descriptors)
    }

    fn drain_events(&self) -> crate::Result<()> {
        if let Some(watch) = self.watch.get() {
            // EAGAIN just means nothing was pending
            let _ = watch.events.read();
        }
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.backend.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}
