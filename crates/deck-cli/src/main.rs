//! `deck`: drives the playback core against the in-process engine.
//!
//! ## Commands
//! - `play`: play files, cue sub-tracks and stream urls in order on a virtual clock and
//!   print every notification and a periodic status snapshot as JSON lines.
//! - `devices`: list output devices per driver, seeded from the host's real devices.
//! - `eq`: show or edit the equalizer document in the profile directory.
//!
//! Media files are probed with Symphonia; `--virtual-secs` replaces them with
//! synthetic media so playlists can be exercised without audio files.

mod cli;
mod device;
mod timeline;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use audio_deck::backend::device_name;
use audio_deck::config::DeckConfig;
use audio_deck::engine::memory::MemoryEngine;
use audio_deck::equalizer::{BAND_COUNT, EqualizerSettings};
use audio_deck_types::{DeviceSelector, OutputDriver};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,audio_deck=info")),
        )
        .init();

    let config = load_config(&args)?;

    match &args.cmd {
        cli::Command::Play(play) => {
            let interrupted = Arc::new(AtomicBool::new(false));
            let flag = interrupted.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                if flag.swap(true, Ordering::SeqCst) {
                    std::process::exit(130);
                }
            }) {
                tracing::warn!("ctrl-c handler not installed: {e}");
            }

            let engine = Arc::new(MemoryEngine::new());
            device::seed_from_host(&engine);
            timeline::register_media(&engine, &play.tracks, play.virtual_secs);

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let finish = timeline::run(engine, config, play, &interrupted, &mut out)?;
            if finish == timeline::Finish::Failed {
                return Err(anyhow!("playback failed"));
            }
        }
        cli::Command::Devices => {
            let engine = MemoryEngine::new();
            device::seed_from_host(&engine);
            for driver in [
                OutputDriver::Buffered,
                OutputDriver::ExclusiveEvent,
                OutputDriver::Multichannel,
            ] {
                println!("{}:", driver.label());
                for (i, name) in (0..).map_while(|i| device_name(&engine, driver, i)).enumerate() {
                    if !name.is_empty() {
                        println!("  #{i}: {name}");
                    }
                }
            }
        }
        cli::Command::Eq { action } => {
            let path = config
                .equalizer_path()
                .context("no profile directory; pass --profile or set profile_dir")?;
            run_eq(action, &path)?;
        }
    }

    Ok(())
}

fn load_config(args: &cli::Args) -> Result<DeckConfig> {
    let mut config = match &args.config {
        Some(path) => DeckConfig::load(path)?,
        None => DeckConfig::default(),
    };
    if let Some(driver) = args.driver {
        config.driver = driver.into();
    }
    if let Some(index) = args.device {
        config.device = DeviceSelector::Index(index);
    }
    if let Some(profile) = &args.profile {
        config.profile_dir = Some(profile.clone());
    }
    Ok(config)
}

fn load_or_default(path: &Path) -> Result<EqualizerSettings> {
    if path.exists() {
        EqualizerSettings::load(path)
    } else {
        tracing::info!(path = ?path, "no equalizer document yet, using defaults");
        Ok(EqualizerSettings::default())
    }
}

fn run_eq(action: &cli::EqAction, path: &Path) -> Result<()> {
    let mut settings = load_or_default(path)?;
    match action {
        cli::EqAction::Show => {}
        cli::EqAction::Set {
            bands,
            preamp,
            preset,
            enable,
        } => {
            for &(index, gain) in bands {
                let slot = settings
                    .gains_db
                    .get_mut(index)
                    .ok_or_else(|| anyhow!("band {index} out of range (0..{BAND_COUNT})"))?;
                *slot = gain;
            }
            if let Some(db) = preamp {
                settings.preamp_db = *db;
            }
            if let Some(name) = preset {
                settings.preset = name.clone();
            }
            if let Some(enable) = enable {
                settings.enabled = *enable;
            }
            settings.save(path)?;
            tracing::info!(path = ?path, "equalizer saved");
        }
        cli::EqAction::Save => {
            settings.save(path)?;
            tracing::info!(path = ?path, "equalizer saved");
        }
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_set_edits_and_persists_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Equalizer").join("Equalizer.xml");
        let action = cli::EqAction::Set {
            bands: vec![(0, 3.5), (9, -2.0)],
            preamp: Some(-1.0),
            preset: Some("Rock".into()),
            enable: Some(true),
        };
        run_eq(&action, &path).unwrap();

        let saved = EqualizerSettings::load(&path).unwrap();
        assert!(saved.enabled);
        assert_eq!(saved.preset, "Rock");
        assert_eq!(saved.preamp_db, -1.0);
        assert_eq!(saved.gains_db[0], 3.5);
        assert_eq!(saved.gains_db[9], -2.0);
    }

    #[test]
    fn eq_set_rejects_out_of_range_band() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Equalizer.xml");
        let action = cli::EqAction::Set {
            bands: vec![(BAND_COUNT, 1.0)],
            preamp: None,
            preset: None,
            enable: None,
        };
        assert!(run_eq(&action, &path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn command_line_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.toml");
        std::fs::write(&path, "driver = \"multichannel\"\nfirst_channel = 2\n").unwrap();
        let args = cli::Args::parse_from([
            "deck",
            "--config",
            path.to_str().unwrap(),
            "--driver",
            "exclusive",
            "--device",
            "3",
            "devices",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.driver, OutputDriver::ExclusiveEvent);
        assert_eq!(config.device, DeviceSelector::Index(3));
        assert_eq!(config.first_channel, 2);
    }
}
