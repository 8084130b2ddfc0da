//! ALSA mixer backend
//!
//! Volumes and mute switches are read and written through `amixer`, cards are
//! enumerated from `/proc/asound/cards`, and change notification comes from
//! the card's control device.

use crate::ctl::ControlDevice;
use crate::device::check_volume_range;
use crate::{CardSelector, DeviceError, MixerBackend, MixerHandle, PollDescriptor};
use std::cell::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// A card listed in `/proc/asound/cards`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardEntry {
    pub index: u32,
    pub id: String,
}

/// Parse the contents of `/proc/asound/cards`
pub fn parse_cards(contents: &str) -> Vec<CardEntry> {
    let mut cards = Vec::new();

    for line in contents.lines() {
        if let Some(start) = line.find('[')
            && let Some(end) = line.find(']')
            && start < end
            && let Ok(index) = line[..start].trim().parse::<u32>()
        {
            let id = line[start + 1..end].trim();
            if !id.is_empty() {
                cards.push(CardEntry {
                    index,
                    id: id.to_string(),
                });
            }
        }
    }

    cards
}

/// Parse `amixer scontrols` output into control names
pub fn parse_scontrols(output: &str) -> Vec<String> {
    let mut controls: Vec<String> = Vec::new();

    for line in output.lines() {
        if let Some(start) = line.find('\'')
            && let Some(end) = line.rfind('\'')
            && start < end
        {
            let name = &line[start + 1..end];
            if !controls.iter().any(|c| c == name) {
                controls.push(name.to_string());
            }
        }
    }

    controls
}

/// One channel line of `amixer sget`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReading {
    pub name: String,
    pub playback: bool,
    pub percent: Option<i64>,
    pub switch_on: Option<bool>,
}

/// Parse the channel lines of `amixer sget <control>`.
///
/// Playback channels are preferred; capture channels are only returned for
/// controls that have no playback side.
pub fn parse_sget(output: &str) -> Vec<ChannelReading> {
    let mut readings = Vec::new();

    for line in output.lines() {
        let Some((name, rest)) = line.trim().split_once(':') else {
            continue;
        };
        let rest = rest.trim();
        let playback = if rest.starts_with("Playback") {
            true
        } else if rest.starts_with("Capture") {
            false
        } else {
            continue;
        };

        // "Limits: Playback 0 - 87" has no bracketed values
        let mut percent = None;
        let mut switch_on = None;
        for token in rest.split('[').skip(1) {
            let Some(value) = token.split(']').next() else {
                continue;
            };
            if let Some(number) = value.strip_suffix('%') {
                percent = number.parse().ok();
            } else if value == "on" {
                switch_on = Some(true);
            } else if value == "off" {
                switch_on = Some(false);
            }
        }

        if percent.is_none() && switch_on.is_none() {
            continue;
        }

        readings.push(ChannelReading {
            name: name.trim().to_string(),
            playback,
            percent,
            switch_on,
        });
    }

    if readings.iter().any(|r| r.playback) {
        readings.retain(|r| r.playback);
    }
    readings
}

/// Mixer backend driving ALSA through `amixer`
#[derive(Debug, Clone)]
pub struct AlsaBackend {
    paths: Arc<AlsaPaths>,
}

#[derive(Debug)]
struct AlsaPaths {
    amixer: PathBuf,
    proc_root: PathBuf,
    dev_root: PathBuf,
}

impl AlsaPaths {
    fn card_entries(&self) -> Vec<CardEntry> {
        fs::read_to_string(self.proc_root.join("cards"))
            .map(|contents| parse_cards(&contents))
            .unwrap_or_default()
    }

    /// Card index used for the control device
    fn resolve_card(&self, selector: &CardSelector) -> crate::Result<u32> {
        resolve_card_index(selector, &self.card_entries()).ok_or_else(|| {
            DeviceError::Unavailable(format!("cannot resolve {}", selector.describe()))
        })
    }
}

impl AlsaBackend {
    pub fn new() -> Self {
        Self::with_paths("amixer", "/proc/asound", "/dev/snd")
    }

    /// Use a different `amixer` binary and ALSA roots
    pub fn with_paths(
        amixer: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            paths: Arc::new(AlsaPaths {
                amixer: amixer.into(),
                proc_root: proc_root.into(),
                dev_root: dev_root.into(),
            }),
        }
    }

    pub fn card_entries(&self) -> Vec<CardEntry> {
        self.paths.card_entries()
    }

    fn run(&self, selector: &CardSelector, args: &[&str]) -> crate::Result<String> {
        run_amixer(&self.paths.amixer, selector, args)
    }
}

impl Default for AlsaBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Map "hw:1", "hw:CARD=PCH,DEV=0", "plughw:PCH" or "default" onto a card index
pub fn resolve_card_index(selector: &CardSelector, cards: &[CardEntry]) -> Option<u32> {
    match selector {
        CardSelector::Index(index) => Some(*index),
        CardSelector::Name(name) => {
            let name = name.trim();
            if name == "default" || name == "sysdefault" {
                return Some(cards.first().map_or(0, |c| c.index));
            }

            let card = name.split_once(':').map_or(name, |(_, rest)| rest);
            let card = card.split(',').next().unwrap_or(card);
            let card = card.strip_prefix("CARD=").unwrap_or(card);

            if let Ok(index) = card.parse::<u32>() {
                return Some(index);
            }
            cards.iter().find(|c| c.id == card).map(|c| c.index)
        }
    }
}

fn selector_args(selector: &CardSelector) -> Vec<String> {
    match selector {
        CardSelector::Index(index) => vec!["-c".to_string(), index.to_string()],
        CardSelector::Name(name) => vec!["-D".to_string(), name.clone()],
    }
}

fn run_amixer(amixer: &Path, selector: &CardSelector, args: &[&str]) -> crate::Result<String> {
    let output = Command::new(amixer)
        .args(selector_args(selector))
        .args(args)
        .output()
        .map_err(|e| DeviceError::Unavailable(format!("failed to run amixer: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeviceError::Unavailable(format!(
            "amixer {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl MixerBackend for AlsaBackend {
    type Handle = AlsaHandle;

    fn cards(&self) -> Vec<String> {
        self.card_entries().into_iter().map(|c| c.id).collect()
    }

    fn controls(&self, selector: &CardSelector) -> crate::Result<Vec<String>> {
        let output = self.run(selector, &["scontrols"])?;
        Ok(parse_scontrols(&output))
    }

    fn open(&self, selector: &CardSelector, control: &str) -> crate::Result<AlsaHandle> {
        let handle = AlsaHandle {
            paths: Arc::clone(&self.paths),
            selector: selector.clone(),
            control: control.to_string(),
            ctl: OnceCell::new(),
        };

        // amixer fails for unknown cards and controls
        handle.read()?;
        Ok(handle)
    }
}

/// Handle on one ALSA simple mixer control
#[derive(Debug)]
pub struct AlsaHandle {
    paths: Arc<AlsaPaths>,
    selector: CardSelector,
    control: String,
    ctl: OnceCell<ControlDevice>,
}

impl AlsaHandle {
    fn read(&self) -> crate::Result<Vec<ChannelReading>> {
        let output = run_amixer(
            &self.paths.amixer,
            &self.selector,
            &["sget", &self.control],
        )?;
        Ok(parse_sget(&output))
    }

    fn control_device(&self) -> crate::Result<&ControlDevice> {
        if let Some(ctl) = self.ctl.get() {
            return Ok(ctl);
        }

        let index = self.paths.resolve_card(&self.selector)?;
        let device = ControlDevice::open(&ControlDevice::path_for(&self.paths.dev_root, index))?;
        Ok(self.ctl.get_or_init(|| device))
    }
}

impl MixerHandle for AlsaHandle {
    fn channel_volumes(&self) -> crate::Result<Vec<i64>> {
        Ok(self.read()?.into_iter().filter_map(|r| r.percent).collect())
    }

    fn channel_mutes(&self) -> crate::Result<Vec<bool>> {
        let mutes: Vec<bool> = self
            .read()?
            .into_iter()
            .filter_map(|r| r.switch_on.map(|on| !on))
            .collect();

        if mutes.is_empty() {
            return Err(DeviceError::Unavailable(format!(
                "mixer control '{}' has no mute switch",
                self.control
            )));
        }
        Ok(mutes)
    }

    fn set_volume(&self, percent: i64) -> crate::Result<()> {
        check_volume_range(percent)?;
        let value = format!("{}%", percent);
        run_amixer(
            &self.paths.amixer,
            &self.selector,
            &["-q", "sset", &self.control, &value],
        )?;
        tracing::debug!("Set {} to {}", self.control, value);
        Ok(())
    }

    fn set_mute(&self, mute: bool) -> crate::Result<()> {
        let state = if mute { "mute" } else { "unmute" };
        run_amixer(
            &self.paths.amixer,
            &self.selector,
            &["-q", "sset", &self.control, state],
        )?;
        tracing::debug!("Set {} to {}", self.control, state);
        Ok(())
    }

    fn poll_descriptors(&self) -> crate::Result<Vec<PollDescriptor>> {
        Ok(vec![self.control_device()?.descriptor()])
    }

    fn drain_events(&self) -> crate::Result<()> {
        if let Some(ctl) = self.ctl.get() {
            let drained = ctl.drain()?;
            tracing::trace!("Drained {} control events from {}", drained, ctl.path().display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARDS: &str = " 0 [PCH            ]: HDA-Intel - HDA Intel PCH
                      HDA Intel PCH at 0xf7f10000 irq 32
 1 [HDMI           ]: HDA-Intel - HDA ATI HDMI
                      HDA ATI HDMI at 0xf7e60000 irq 33
";

    const SGET_STEREO: &str = "Simple mixer control 'Master',0
  Capabilities: pvolume pswitch pswitch-joined
  Playback channels: Front Left - Front Right
  Limits: Playback 0 - 87
  Mono:
  Front Left: Playback 60 [69%] [-20.25dB] [on]
  Front Right: Playback 52 [60%] [-26.25dB] [off]
";

    const SGET_CAPTURE: &str = "Simple mixer control 'Capture',0
  Capabilities: cvolume cswitch
  Capture channels: Front Left - Front Right
  Limits: Capture 0 - 63
  Front Left: Capture 39 [62%] [12.00dB] [on]
  Front Right: Capture 39 [62%] [12.00dB] [on]
";

    #[test]
    fn test_parse_cards() {
        let cards = parse_cards(CARDS);
        assert_eq!(
            cards,
            vec![
                CardEntry {
                    index: 0,
                    id: "PCH".into()
                },
                CardEntry {
                    index: 1,
                    id: "HDMI".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_cards_empty() {
        assert!(parse_cards("--- no soundcards ---").is_empty());
    }

    #[test]
    fn test_parse_scontrols() {
        let output = "Simple mixer control 'Master',0\n\
                      Simple mixer control 'PCM',0\n\
                      Simple mixer control 'Mic Boost',0\n\
                      Simple mixer control 'Mic Boost',1\n";
        assert_eq!(parse_scontrols(output), vec!["Master", "PCM", "Mic Boost"]);
    }

    #[test]
    fn test_parse_sget_playback() {
        let readings = parse_sget(SGET_STEREO);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].name, "Front Left");
        assert_eq!(readings[0].percent, Some(69));
        assert_eq!(readings[0].switch_on, Some(true));
        assert_eq!(readings[1].percent, Some(60));
        assert_eq!(readings[1].switch_on, Some(false));
    }

    #[test]
    fn test_parse_sget_capture_only() {
        let readings = parse_sget(SGET_CAPTURE);
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| !r.playback));
        assert!(readings.iter().all(|r| r.percent == Some(62)));
    }

    #[test]
    fn test_parse_sget_mono_without_switch() {
        let output = "Simple mixer control 'PCM',0
  Capabilities: pvolume pvolume-joined
  Playback channels: Mono
  Limits: Playback 0 - 255
  Mono: Playback 255 [100%] [0.00dB]
";
        let readings = parse_sget(output);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].percent, Some(100));
        assert_eq!(readings[0].switch_on, None);
    }

    #[test]
    fn test_resolve_card_index() {
        let cards = parse_cards(CARDS);
        let resolve = |name: &str| resolve_card_index(&CardSelector::Name(name.into()), &cards);

        assert_eq!(resolve("default"), Some(0));
        assert_eq!(resolve("hw:1"), Some(1));
        assert_eq!(resolve("hw:HDMI"), Some(1));
        assert_eq!(resolve("hw:CARD=PCH,DEV=0"), Some(0));
        assert_eq!(resolve("plughw:PCH"), Some(0));
        assert_eq!(resolve("hw:USB"), None);
        assert_eq!(resolve_card_index(&CardSelector::Index(4), &cards), Some(4));
    }

    #[test]
    fn test_card_entries_from_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cards"), CARDS).unwrap();

        let backend = AlsaBackend::with_paths("amixer", dir.path(), dir.path());
        assert_eq!(backend.cards(), vec!["PCH", "HDMI"]);
        assert_eq!(
            backend
                .paths
                .resolve_card(&CardSelector::Name("hw:HDMI".into()))
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_missing_amixer_is_unavailable() {
        let backend = AlsaBackend::with_paths(
            "/nonexistent/amixer",
            "/nonexistent/proc",
            "/nonexistent/dev",
        );
        assert!(backend.cards().is_empty());

        let result = backend.controls(&CardSelector::Index(0));
        assert!(matches!(result, Err(DeviceError::Unavailable(_))));
        assert!(backend.open(&CardSelector::Index(0), "Master").is_err());
    }
}
