//! Player configuration loading.
//!
//! Every field has a default so a missing or partial TOML file still yields a usable
//! configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fade::FadeTimes;
use crate::types::{DeviceSelector, OutputDriver, ProxyConfig};

/// Top-level player configuration loaded from TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckConfig {
    /// Output backend, fixed for the life of a player.
    pub driver: OutputDriver,
    pub device: DeviceSelector,
    /// Opaque window handle handed to buffered output for cooperative-level setup.
    pub window: Option<u64>,
    /// Profile directory holding `Equalizer/Equalizer.xml`.
    pub profile_dir: Option<PathBuf>,
    /// Load the equalizer document at init.
    pub load_equalizer: bool,
    /// 32-bit float output on buffered output, when the device supports it.
    pub float_output: bool,
    /// Software mixing on buffered output.
    pub software_mixing: bool,
    /// Event-driven exclusive mode.
    pub exclusive_event: bool,
    /// First output channel on multichannel devices.
    pub first_channel: u32,
    pub fades: FadeTimes,
    /// Buffered output device buffer length.
    pub device_buffer_ms: u32,
    /// Decode read-ahead kept queued for pull-model output, in seconds.
    pub read_ahead_secs: f64,
    pub net: NetConfig,
}

/// Network stream settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub proxy: ProxyConfig,
    /// User-Agent sent with network opens. Empty keeps the engine default.
    pub user_agent: Option<String>,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            driver: OutputDriver::Buffered,
            device: DeviceSelector::Default,
            window: None,
            profile_dir: None,
            load_equalizer: false,
            float_output: true,
            software_mixing: false,
            exclusive_event: true,
            first_channel: 0,
            fades: FadeTimes::default(),
            device_buffer_ms: 1000,
            read_ahead_secs: 1.0,
            net: NetConfig::default(),
        }
    }
}

impl DeckConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {:?}", path))?;
        let config: DeckConfig =
            toml::from_str(&raw).with_context(|| format!("parse config {:?}", path))?;
        Ok(config)
    }

    /// Location of the persisted equalizer document, when a profile is configured.
    pub fn equalizer_path(&self) -> Option<PathBuf> {
        self.profile_dir
            .as_ref()
            .map(|dir| dir.join("Equalizer").join("Equalizer.xml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.toml");
        std::fs::write(
            &path,
            r#"
driver = "multichannel"
first_channel = 2

[device]
index = 1

[fades]
stop_ms = 800

[net.proxy]
mode = "http"
host = "proxy.local"
port = 3128
"#,
        )
        .unwrap();

        let config = DeckConfig::load(&path).unwrap();
        assert_eq!(config.driver, OutputDriver::Multichannel);
        assert_eq!(config.device, DeviceSelector::Index(1));
        assert_eq!(config.first_channel, 2);
        assert_eq!(config.fades.stop_ms, 800);
        assert_eq!(config.fades.pause_ms, 500);
        assert_eq!(config.fades.mute_ms, 100);
        assert_eq!(config.device_buffer_ms, 1000);
        assert_eq!(config.net.proxy.address().as_deref(), Some("proxy.local:3128"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = DeckConfig::load(Path::new("/nonexistent/deck.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }

    #[test]
    fn equalizer_document_lives_under_profile() {
        let config = DeckConfig {
            profile_dir: Some(PathBuf::from("/home/me/.deck")),
            ..DeckConfig::default()
        };
        assert_eq!(
            config.equalizer_path(),
            Some(PathBuf::from("/home/me/.deck/Equalizer/Equalizer.xml"))
        );
        assert_eq!(DeckConfig::default().equalizer_path(), None);
    }
}
