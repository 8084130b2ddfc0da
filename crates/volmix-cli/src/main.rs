//! volmix command line
//!
//! Reads and changes the volume of an ALSA mixer control the way a media
//! player sees it (0-100 plus mute), and can watch it for changes made by
//! other applications.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info};
use volmix_config::{MixerSettings, VolmixConfig, VolumeScale};
use volmix_hal::{AlsaBackend, CardSelector, MixerBackend};
use volmix_mixer::{MixerController, MixerEvent};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// volmix - ALSA mixer volume for media players
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "VOLMIX_CONFIG")]
    config: Option<PathBuf>,

    /// Card index, overrides the configured device
    #[arg(long)]
    card: Option<u32>,

    /// ALSA device name such as "default" or "hw:1"
    #[arg(short, long)]
    device: Option<String>,

    /// Simple mixer control name
    #[arg(short = 'm', long)]
    control: Option<String>,

    /// Volume curve (linear, cubic, log)
    #[arg(long)]
    scale: Option<VolumeScale>,

    /// Mixer percentage mapped to volume 0
    #[arg(long)]
    min_volume: Option<u8>,

    /// Mixer percentage mapped to volume 100
    #[arg(long)]
    max_volume: Option<u8>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show current volume and mute state
    Get,
    /// Set volume (0-100)
    SetVolume { volume: u8 },
    Mute,
    Unmute,
    /// List soundcards
    Cards,
    /// List mixer controls of the selected card
    Controls,
    /// Print volume and mute changes until interrupted
    Watch,
}

#[derive(Serialize)]
struct Status {
    mixer: String,
    volume: Option<u8>,
    mute: Option<bool>,
}

#[derive(Serialize)]
struct Card {
    index: u32,
    id: String,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Change {
    Volume { volume: Option<u8> },
    Mute { mute: Option<bool> },
}

impl From<MixerEvent> for Change {
    fn from(event: MixerEvent) -> Self {
        match event {
            MixerEvent::VolumeChanged(volume) => Change::Volume { volume },
            MixerEvent::MuteChanged(mute) => Change::Mute { mute },
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging();

    let settings = load_settings(&args)?;
    debug!("Mixer settings: {:?}", settings);

    let backend = AlsaBackend::new();

    match args.command {
        Command::Cards => list_cards(&backend, args.json),
        Command::Controls => list_controls(&backend, &settings, args.json),
        Command::Get => {
            let (tx, _rx) = mpsc::channel();
            let mixer = MixerController::from_settings(backend, &settings, Arc::new(tx))?;
            print_status(&mixer, args.json)
        }
        Command::SetVolume { volume } => {
            if volume > 100 {
                bail!("Volume must be within 0-100, got {}", volume);
            }
            let (tx, _rx) = mpsc::channel();
            let mixer = MixerController::from_settings(backend, &settings, Arc::new(tx))?;
            if !mixer.set_volume(volume) {
                bail!("Failed to set volume of {}", mixer.identity());
            }
            print_status(&mixer, args.json)
        }
        Command::Mute | Command::Unmute => {
            let mute = matches!(args.command, Command::Mute);
            let (tx, _rx) = mpsc::channel();
            let mixer = MixerController::from_settings(backend, &settings, Arc::new(tx))?;
            if !mixer.set_mute(mute) {
                bail!("Failed to change mute state of {}", mixer.identity());
            }
            print_status(&mixer, args.json)
        }
        Command::Watch => watch(backend, &settings, args.json),
    }
}

/// Setup logging to stderr
fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Configuration file merged with command line overrides
fn load_settings(args: &Args) -> Result<MixerSettings> {
    let config = match &args.config {
        Some(path) => VolmixConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => VolmixConfig::load_default().context("Failed to load config")?,
    };

    let mut settings = config.alsamixer;
    if let Some(card) = args.card {
        settings.card = Some(card);
    }
    if let Some(device) = &args.device {
        settings.card = None;
        settings.device = device.clone();
    }
    if let Some(control) = &args.control {
        settings.control = control.clone();
    }
    if let Some(scale) = args.scale {
        settings.volume_scale = scale;
    }
    if let Some(min) = args.min_volume {
        settings.min_volume = min;
    }
    if let Some(max) = args.max_volume {
        settings.max_volume = max;
    }

    settings.validate().context("Invalid mixer settings")?;
    Ok(settings)
}

fn selector(settings: &MixerSettings) -> CardSelector {
    match settings.card {
        Some(index) => CardSelector::Index(index),
        None => CardSelector::Name(settings.device.clone()),
    }
}

fn list_cards(backend: &AlsaBackend, json: bool) -> Result<()> {
    let cards: Vec<Card> = backend
        .card_entries()
        .into_iter()
        .map(|entry| Card {
            index: entry.index,
            id: entry.id,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&cards)?);
    } else if cards.is_empty() {
        println!("No soundcards found");
    } else {
        for card in &cards {
            println!("{:>2}  {}", card.index, card.id);
        }
    }
    Ok(())
}

fn list_controls(backend: &AlsaBackend, settings: &MixerSettings, json: bool) -> Result<()> {
    let selector = selector(settings);
    let controls = backend
        .controls(&selector)
        .with_context(|| format!("Failed to list mixer controls of {}", selector.describe()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&controls)?);
    } else {
        for control in &controls {
            println!("{}", control);
        }
    }
    Ok(())
}

fn print_status(mixer: &MixerController<AlsaBackend>, json: bool) -> Result<()> {
    let status = Status {
        mixer: mixer.identity().to_string(),
        volume: mixer.volume(),
        mute: mixer.mute(),
    };

    if json {
        println!("{}", serde_json::to_string(&status)?);
    } else {
        println!("{}", status.mixer);
        println!("  volume: {}", describe(status.volume));
        println!("  mute:   {}", describe(status.mute));
    }
    Ok(())
}

fn describe<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

fn watch(backend: AlsaBackend, settings: &MixerSettings, json: bool) -> Result<()> {
    setup_signal_handlers()?;

    let (tx, rx) = mpsc::channel();
    let mut mixer = MixerController::from_settings(backend, settings, Arc::new(tx))?;
    mixer.start()?;
    mixer.reconcile();
    info!("Watching {}, press Ctrl-C to stop", mixer.identity());

    while !SHUTDOWN.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => print_change(event, json)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Received shutdown signal");
    mixer.stop();
    Ok(())
}

fn print_change(event: MixerEvent, json: bool) -> Result<()> {
    let change = Change::from(event);
    if json {
        println!("{}", serde_json::to_string(&change)?);
    } else {
        match change {
            Change::Volume { volume } => println!("volume: {}", describe(volume)),
            Change::Mute { mute } => println!("mute: {}", describe(mute)),
        }
    }
    Ok(())
}

/// Setup signal handlers for graceful shutdown
fn setup_signal_handlers() -> Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }

    Ok(())
}

extern "C" fn handle_signal(_sig: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}
