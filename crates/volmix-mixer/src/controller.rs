//! Mixer controller
//!
//! Opens a fresh device handle for every read and write so that changes made
//! by other applications are always visible, and turns observer wake-ups into
//! volume and mute change notifications.

use crate::observer::{Observer, ObserverOptions};
use crate::scale::{Calibration, to_host_volume, to_mixer_volume};
use crate::{MixerError, Result};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use volmix_config::MixerSettings;
use volmix_hal::{CardSelector, DeviceIdentity, MixerBackend, MixerHandle};

/// Receives volume and mute changes.
///
/// Called from `reconcile` with its lock held, possibly on the observer
/// thread; implementations must not call back into the controller.
pub trait MixerListener: Send + Sync {
    fn on_volume_changed(&self, volume: Option<u8>);
    fn on_mute_changed(&self, mute: Option<bool>);
}

/// Change notification as a value, for channel based hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerEvent {
    VolumeChanged(Option<u8>),
    MuteChanged(Option<bool>),
}

impl MixerListener for Sender<MixerEvent> {
    fn on_volume_changed(&self, volume: Option<u8>) {
        let _ = self.send(MixerEvent::VolumeChanged(volume));
    }

    fn on_mute_changed(&self, mute: Option<bool>) {
        let _ = self.send(MixerEvent::MuteChanged(mute));
    }
}

/// Last values reported to the listener; `None` means unknown or mixed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedState {
    pub last_volume: Option<u8>,
    pub last_mute: Option<bool>,
}

/// State shared between the controller and its observer callback
struct Shared<B: MixerBackend> {
    backend: Arc<B>,
    identity: DeviceIdentity,
    calibration: Calibration,
    listener: Arc<dyn MixerListener>,
    observed: Mutex<ObservedState>,
}

impl<B: MixerBackend> Shared<B> {
    fn open(&self) -> volmix_hal::Result<B::Handle> {
        self.backend.open_identity(&self.identity)
    }

    fn lock_observed(&self) -> MutexGuard<'_, ObservedState> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn volume(&self) -> Option<u8> {
        let channels = match self.open().and_then(|handle| handle.channel_volumes()) {
            Ok(channels) => channels,
            Err(e) => {
                debug!("Reading volume of {} failed: {}", self.identity, e);
                return None;
            }
        };

        let (first, rest) = channels.split_first()?;
        if rest.iter().all(|v| v == first) {
            Some(to_host_volume(*first, &self.calibration))
        } else {
            // Not all channels have the same volume
            None
        }
    }

    fn set_volume(&self, volume: u8) -> bool {
        let volume = volume.min(100);
        let mixer_volume = to_mixer_volume(volume, &self.calibration);
        match self.open().and_then(|handle| handle.set_volume(mixer_volume)) {
            Ok(()) => true,
            Err(e) if e.is_unavailable() => {
                debug!("Setting volume failed: {}", e);
                false
            }
            Err(e) => {
                debug!(
                    "Volume {} maps to mixer value {}, which {} rejects: {}",
                    volume, mixer_volume, self.identity, e
                );
                false
            }
        }
    }

    fn mute(&self) -> Option<bool> {
        let channels = match self.open().and_then(|handle| handle.channel_mutes()) {
            Ok(channels) => channels,
            Err(e) => {
                debug!("Reading mute state of {} failed: {}", self.identity, e);
                return None;
            }
        };

        if channels.is_empty() {
            None
        } else if channels.iter().all(|&muted| muted) {
            Some(true)
        } else if channels.iter().all(|&muted| !muted) {
            Some(false)
        } else {
            // Not all channels have the same mute state
            None
        }
    }

    fn set_mute(&self, mute: bool) -> bool {
        match self.open().and_then(|handle| handle.set_mute(mute)) {
            Ok(()) => true,
            Err(e) => {
                debug!("Setting mute state failed: {}", e);
                false
            }
        }
    }

    fn reconcile(&self) {
        let mut observed = self.lock_observed();

        let volume = self.volume();
        let mute = self.mute();
        let previous = std::mem::replace(
            &mut *observed,
            ObservedState {
                last_volume: volume,
                last_mute: mute,
            },
        );

        if previous.last_volume != volume {
            self.listener.on_volume_changed(volume);
        }
        if previous.last_mute != mute {
            self.listener.on_mute_changed(mute);
        }
    }
}

/// Volume and mute of one mixer control, as seen by a host
pub struct MixerController<B: MixerBackend> {
    shared: Arc<Shared<B>>,
    observer: Option<Observer>,
    options: ObserverOptions,
}

impl<B: MixerBackend> MixerController<B> {
    /// Check that the card and control exist and build a controller
    pub fn new(
        backend: B,
        identity: DeviceIdentity,
        calibration: Calibration,
        listener: Arc<dyn MixerListener>,
    ) -> Result<Self> {
        let card = identity.selector.describe();

        let known_controls = backend.controls(&identity.selector).map_err(|_| {
            let known_cards = backend.cards();
            MixerError::Configuration {
                message: format!(
                    "Could not find ALSA {}. Known soundcards include: {}",
                    card,
                    known_cards.join(", ")
                ),
                known: known_cards,
            }
        })?;

        if !known_controls.contains(&identity.control) {
            return Err(MixerError::Configuration {
                message: format!(
                    "Could not find ALSA mixer control {} on {}. Known mixers on {} include: {}",
                    identity.control,
                    card,
                    card,
                    known_controls.join(", ")
                ),
                known: known_controls,
            });
        }

        info!(
            "Mixing using ALSA, {}, mixer control {:?}.",
            card, identity.control
        );

        Ok(Self {
            shared: Arc::new(Shared {
                backend: Arc::new(backend),
                identity,
                calibration,
                listener,
                observed: Mutex::new(ObservedState::default()),
            }),
            observer: None,
            options: ObserverOptions::default(),
        })
    }

    /// Build from the `[alsamixer]` configuration section
    pub fn from_settings(
        backend: B,
        settings: &MixerSettings,
        listener: Arc<dyn MixerListener>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| MixerError::configuration(e.to_string()))?;

        let selector = match settings.card {
            Some(index) => CardSelector::Index(index),
            None => CardSelector::Name(settings.device.clone()),
        };
        let calibration = Calibration::new(
            f64::from(settings.min_volume),
            f64::from(settings.max_volume),
            settings.volume_scale,
        )?;

        Self::new(
            backend,
            DeviceIdentity::new(selector, settings.control.clone()),
            calibration,
            listener,
        )
    }

    pub fn with_observer_options(mut self, options: ObserverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn calibration(&self) -> &Calibration {
        &self.shared.calibration
    }

    /// Snapshot of the last reported values
    pub fn observed(&self) -> ObservedState {
        *self.shared.lock_observed()
    }

    /// Current volume; `None` if the device is unavailable or channels differ
    pub fn volume(&self) -> Option<u8> {
        self.shared.volume()
    }

    /// Returns false if the device rejected the write
    pub fn set_volume(&self, volume: u8) -> bool {
        self.shared.set_volume(volume)
    }

    /// Current mute state; `None` if the device is unavailable or channels differ
    pub fn mute(&self) -> Option<bool> {
        self.shared.mute()
    }

    /// Returns false if the device rejected the write
    pub fn set_mute(&self, mute: bool) -> bool {
        self.shared.set_mute(mute)
    }

    /// Re-read volume and mute and notify the listener about what changed.
    ///
    /// Calls are serialized with the observer's.
    pub fn reconcile(&self) {
        self.shared.reconcile();
    }

    /// Start watching the control for changes made by anyone
    pub fn start(&mut self) -> Result<()> {
        if self.observer.is_some() {
            return Ok(());
        }

        let shared = Arc::downgrade(&self.shared);
        let observer = Observer::start(
            Arc::clone(&self.shared.backend),
            self.shared.identity.clone(),
            self.options.clone(),
            move || match shared.upgrade() {
                Some(shared) => {
                    shared.reconcile();
                    true
                }
                None => false,
            },
        )?;

        self.observer = Some(observer);
        Ok(())
    }

    /// Stop the observer and wait for its thread to exit
    pub fn stop(&mut self) {
        if let Some(mut observer) = self.observer.take() {
            observer.stop();
        }
    }

    pub fn is_observing(&self) -> bool {
        self.observer.as_ref().is_some_and(Observer::is_running)
    }
}

impl<B: MixerBackend> Drop for MixerController<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VolumeScale;
    use std::sync::mpsc::{self, Receiver};
    use volmix_hal::mock::{MockBackend, MockCard, MockControl};

    fn linear() -> Calibration {
        Calibration::new(0.0, 100.0, VolumeScale::Linear).unwrap()
    }

    fn controller(
        backend: &MockBackend,
        calibration: Calibration,
    ) -> (MixerController<MockBackend>, Receiver<MixerEvent>) {
        let (tx, rx) = mpsc::channel();
        let controller = MixerController::new(
            backend.clone(),
            DeviceIdentity::new(CardSelector::Index(0), "Master"),
            calibration,
            Arc::new(tx),
        )
        .unwrap();
        (controller, rx)
    }

    fn three_channels(volume: i64) -> MockBackend {
        MockBackend::with_cards(vec![MockCard::new(0, "Mock").with_control(
            "Master",
            MockControl {
                volumes: vec![volume; 3],
                mutes: vec![false; 3],
                has_switch: true,
            },
        )])
    }

    #[test]
    fn test_unknown_card_is_configuration_error() {
        let (tx, _rx) = mpsc::channel();
        let result = MixerController::new(
            MockBackend::new(),
            DeviceIdentity::new(CardSelector::Index(7), "Master"),
            linear(),
            Arc::new(tx),
        );

        match result {
            Err(MixerError::Configuration { message, known }) => {
                assert!(message.contains("soundcard with index 7"));
                assert!(message.contains("Mock"));
                assert_eq!(known, vec!["Mock"]);
            }
            _ => panic!("Expected configuration error"),
        }
    }

    #[test]
    fn test_unknown_control_is_configuration_error() {
        let (tx, _rx) = mpsc::channel();
        let result = MixerController::new(
            MockBackend::new(),
            DeviceIdentity::new(CardSelector::Name("default".into()), "Speaker"),
            linear(),
            Arc::new(tx),
        );

        match result {
            Err(MixerError::Configuration { message, known }) => {
                assert!(message.contains("mixer control Speaker"));
                assert_eq!(known, vec!["Master", "PCM"]);
            }
            _ => panic!("Expected configuration error"),
        }
    }

    #[test]
    fn test_from_settings() {
        let (tx, _rx) = mpsc::channel();
        let settings = MixerSettings {
            card: Some(0),
            control: "PCM".into(),
            min_volume: 10,
            max_volume: 90,
            volume_scale: VolumeScale::Linear,
            ..MixerSettings::default()
        };

        let controller =
            MixerController::from_settings(MockBackend::new(), &settings, Arc::new(tx)).unwrap();
        assert_eq!(controller.identity().selector, CardSelector::Index(0));
        assert_eq!(controller.identity().control, "PCM");
        assert_eq!(controller.calibration().min_volume(), 10.0);
        // (75 - 10) * 100 / 80 = 81.25
        assert_eq!(controller.volume(), Some(81));
    }

    #[test]
    fn test_from_settings_rejects_invalid_window() {
        let (tx, _rx) = mpsc::channel();
        let settings = MixerSettings {
            min_volume: 60,
            max_volume: 60,
            ..MixerSettings::default()
        };
        let result = MixerController::from_settings(MockBackend::new(), &settings, Arc::new(tx));
        assert!(matches!(result, Err(MixerError::Configuration { .. })));
    }

    #[test]
    fn test_volume_equal_channels() {
        let backend = three_channels(50);
        let (mixer, _rx) = controller(&backend, linear());
        assert_eq!(mixer.volume(), Some(50));

        let (cubic, _rx) = controller(&backend, Calibration::default());
        assert_eq!(cubic.volume(), Some(12));
    }

    #[test]
    fn test_volume_disagreeing_channels() {
        let backend = MockBackend::new();
        backend.set_volumes("Master", vec![50, 60]);
        let (mixer, _rx) = controller(&backend, linear());
        assert_eq!(mixer.volume(), None);
    }

    #[test]
    fn test_volume_no_channels() {
        let backend = MockBackend::new();
        backend.set_volumes("Master", vec![]);
        let (mixer, _rx) = controller(&backend, linear());
        assert_eq!(mixer.volume(), None);
    }

    #[test]
    fn test_mute_states() {
        let backend = MockBackend::new();
        let (mixer, _rx) = controller(&backend, linear());

        backend.set_mutes("Master", vec![true, true]);
        assert_eq!(mixer.mute(), Some(true));

        backend.set_mutes("Master", vec![true, false]);
        assert_eq!(mixer.mute(), None);

        backend.set_mutes("Master", vec![false, false]);
        assert_eq!(mixer.mute(), Some(false));

        backend.set_mutes("Master", vec![]);
        assert_eq!(mixer.mute(), None);
    }

    #[test]
    fn test_reads_unavailable_device() {
        let backend = MockBackend::new();
        let (mixer, _rx) = controller(&backend, linear());

        backend.set_available(false);
        assert_eq!(mixer.volume(), None);
        assert_eq!(mixer.mute(), None);
    }

    #[test]
    fn test_set_volume_and_mute() {
        let backend = MockBackend::new();
        let (mixer, _rx) = controller(&backend, Calibration::default());

        assert!(mixer.set_volume(50));
        // cbrt(0.5) * 100 = 79.37
        assert_eq!(backend.control("Master").unwrap().volumes, vec![79, 79]);
        assert!(mixer.set_mute(true));
        assert_eq!(mixer.mute(), Some(true));
    }

    #[test]
    fn test_set_volume_clamps_host_value() {
        let backend = MockBackend::new();
        let (mixer, _rx) = controller(&backend, linear());

        assert!(mixer.set_volume(250));
        assert_eq!(mixer.volume(), Some(100));
    }

    #[test]
    fn test_writes_fail_without_panicking() {
        let backend = MockBackend::new();
        let (mixer, _rx) = controller(&backend, linear());

        backend.set_available(false);
        assert!(!mixer.set_volume(40));
        assert!(!mixer.set_mute(true));

        backend.set_available(true);
        backend.set_fail_writes(true);
        assert!(!mixer.set_volume(40));
        assert!(!mixer.set_mute(false));
    }

    #[test]
    fn test_set_volume_rejected_out_of_mixer_range() {
        let backend = MockBackend::new();
        let log = Calibration::new(0.0, 100.0, VolumeScale::Logarithmic).unwrap();
        let (mixer, _rx) = controller(&backend, log);

        // log10(0) has no mixer representation
        assert!(!mixer.set_volume(0));
        assert!(mixer.set_volume(10));
        assert_eq!(backend.control("Master").unwrap().volumes, vec![50, 50]);
    }

    #[test]
    fn test_writes_do_not_touch_observed_state() {
        let backend = MockBackend::new();
        let (mixer, rx) = controller(&backend, linear());

        assert!(mixer.set_volume(30));
        assert_eq!(mixer.observed(), ObservedState::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_first_reconcile_fires_both() {
        let backend = MockBackend::new();
        backend.set_volumes("Master", vec![40, 40]);
        let (mixer, rx) = controller(&backend, linear());

        mixer.reconcile();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                MixerEvent::VolumeChanged(Some(40)),
                MixerEvent::MuteChanged(Some(false)),
            ]
        );
        assert_eq!(
            mixer.observed(),
            ObservedState {
                last_volume: Some(40),
                last_mute: Some(false),
            }
        );
    }

    #[test]
    fn test_second_reconcile_is_silent() {
        let backend = MockBackend::new();
        let (mixer, rx) = controller(&backend, linear());

        mixer.reconcile();
        assert_eq!(rx.try_iter().count(), 2);

        mixer.reconcile();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_reconcile_reports_only_changed_field() {
        let backend = MockBackend::new();
        let (mixer, rx) = controller(&backend, linear());
        mixer.reconcile();
        rx.try_iter().for_each(drop);

        backend.set_mutes("Master", vec![true, true]);
        mixer.reconcile();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![MixerEvent::MuteChanged(Some(true))]
        );

        backend.set_volumes("Master", vec![10, 20]);
        mixer.reconcile();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![MixerEvent::VolumeChanged(None)]
        );
    }

    #[test]
    fn test_reconcile_unknown_to_unknown_is_silent() {
        let backend = MockBackend::new();
        backend.set_available(false);
        let (tx, rx) = mpsc::channel();
        let mixer = MixerController {
            shared: Arc::new(Shared {
                backend: Arc::new(backend.clone()),
                identity: DeviceIdentity::new(CardSelector::Index(0), "Master"),
                calibration: linear(),
                listener: Arc::new(tx),
                observed: Mutex::new(ObservedState::default()),
            }),
            observer: None,
            options: ObserverOptions::default(),
        };

        mixer.reconcile();
        assert_eq!(rx.try_iter().count(), 0);

        backend.set_available(true);
        mixer.reconcile();
        assert_eq!(rx.try_iter().count(), 2);

        backend.set_available(false);
        mixer.reconcile();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![MixerEvent::VolumeChanged(None), MixerEvent::MuteChanged(None)]
        );
    }

    #[test]
    fn test_every_operation_releases_its_handle() {
        let backend = MockBackend::new();
        let (mixer, _rx) = controller(&backend, linear());

        mixer.volume();
        mixer.mute();
        mixer.set_volume(20);
        mixer.set_mute(true);
        mixer.reconcile();

        assert_eq!(backend.live_handles(), 0);
        assert_eq!(backend.open_count(), 6);
    }
}
