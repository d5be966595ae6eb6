//! Shared vocabulary between the playback core and its collaborators.
//!
//! Everything here is plain data: notifications posted to the GUI layer, the
//! error taxonomy returned by playback operations, and the small value types the
//! configuration layer deserializes.

use serde::{Deserialize, Serialize};

/// Opaque engine stream handle.
///
/// Handles are never reused by an engine while the process lives, so a stale
/// handle carried in a notification can be compared safely against live ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamHandle(pub u32);

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Output driver family selected at init. Immutable for the life of a player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDriver {
    /// Buffered push-model output; the engine plays a mixer natively.
    #[default]
    Buffered,
    /// Exclusive-mode output pulling from a decode mixer, event driven.
    ExclusiveEvent,
    /// Low-latency multichannel output pulling from a decode mixer.
    Multichannel,
}

impl OutputDriver {
    /// `true` for drivers whose device pulls data through a callback.
    ///
    /// Pull-model drivers need the buffer pump to keep read-ahead data queued.
    pub fn is_pull_model(self) -> bool {
        !matches!(self, OutputDriver::Buffered)
    }

    /// Short lowercase label used in logs and CLI output.
    pub fn label(self) -> &'static str {
        match self {
            OutputDriver::Buffered => "buffered",
            OutputDriver::ExclusiveEvent => "exclusive",
            OutputDriver::Multichannel => "multichannel",
        }
    }
}

/// Output device choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// Whatever the system reports as its default output.
    #[default]
    Default,
    /// Device by enumeration index. Index 0 is the "no sound" device on buffered output.
    Index(u32),
}

/// Error taxonomy for playback operations. `Ok(())` stands for "no error".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum PlayError {
    /// The media could not be opened: missing, unreadable or unsupported.
    #[error("media could not be opened")]
    File,
    /// The output device failed to initialize or start.
    #[error("output device failed")]
    Device,
    /// A network stream failed: no network, timeout, bad address or unknown.
    #[error("network stream failed")]
    Network,
}

/// Asynchronous notifications posted to the GUI collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// The playlist cursor should advance.
    ///
    /// `stopped` is set when the end of the list was reached and playback halted;
    /// `url` is set when the new entry is a network stream still being opened.
    TrackChanged { stopped: bool, url: bool },
    /// The radio stream published new metadata.
    RadioMeta,
    /// A radio open finished. `error` is `None` on success.
    RadioReady {
        error: Option<PlayError>,
        reconnect: bool,
    },
    /// A pull-model device finished its pause or stop fade for `stream`.
    OutputHalted { stream: StreamHandle, stopped: bool },
    /// A faded-out decode stream was released.
    StreamFreed { stream: StreamHandle },
    /// The output could not be restarted during a track transition; playback is idle.
    PlaybackFailed { error: PlayError },
}

/// Coarse transport state reported to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Network stream playback; no seek or position semantics.
    Radio,
}

/// Container/codec family of a radio stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioFormat {
    #[default]
    Unknown,
    Mp3,
    Ogg,
    Wma,
    Aac,
    Mp4,
}

impl RadioFormat {
    /// Numeric code shown in the GUI status line.
    pub fn code(self) -> u8 {
        match self {
            RadioFormat::Unknown => 0,
            RadioFormat::Mp3 => 1,
            RadioFormat::Ogg => 2,
            RadioFormat::Wma => 3,
            RadioFormat::Aac => 4,
            RadioFormat::Mp4 => 5,
        }
    }
}

/// Technical details of the current radio stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioInfo {
    pub format: RadioFormat,
    /// Bitrate in kbps, `0` when unknown.
    pub kbps: u32,
    pub channels: u16,
    pub rate_hz: u32,
    /// Raw `StreamTitle` text, when the stream publishes one.
    pub meta: Option<String>,
}

/// Now-playing text parsed from the radio stream metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioTags {
    pub title: String,
    pub artist: String,
    pub album: String,
}

/// Proxy used for network stream opens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProxyConfig {
    #[default]
    None,
    Http {
        host: String,
        port: u16,
    },
    Authenticated {
        host: String,
        port: u16,
        login: String,
        password: String,
    },
}

impl ProxyConfig {
    /// Proxy address in the `[login:password@]host:port` form, `None` for a direct connection.
    pub fn address(&self) -> Option<String> {
        match self {
            ProxyConfig::None => None,
            ProxyConfig::Http { host, port } => Some(format!("{host}:{port}")),
            ProxyConfig::Authenticated {
                host,
                port,
                login,
                password,
            } => Some(format!("{login}:{password}@{host}:{port}")),
        }
    }
}

/// Snapshot of the playback session for status displays.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DeckStatus {
    pub state: PlaybackState,
    pub driver: OutputDriver,
    /// File or URL currently loaded.
    pub now_playing: Option<String>,
    /// Normalized position in `0..100000`.
    pub position: u32,
    /// Elapsed whole seconds.
    pub elapsed_secs: u64,
    /// Logical track length in seconds.
    pub duration_secs: f64,
    /// Requested volume in `0..=100000`.
    pub volume: u32,
    pub muted: bool,
    pub equalizer_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_address_formats_each_mode() {
        assert_eq!(ProxyConfig::None.address(), None);
        let http = ProxyConfig::Http {
            host: "proxy.local".into(),
            port: 3128,
        };
        assert_eq!(http.address().as_deref(), Some("proxy.local:3128"));
        let auth = ProxyConfig::Authenticated {
            host: "proxy.local".into(),
            port: 8080,
            login: "me".into(),
            password: "secret".into(),
        };
        assert_eq!(auth.address().as_deref(), Some("me:secret@proxy.local:8080"));
    }

    #[test]
    fn radio_format_codes_are_stable() {
        let codes: Vec<u8> = [
            RadioFormat::Unknown,
            RadioFormat::Mp3,
            RadioFormat::Ogg,
            RadioFormat::Wma,
            RadioFormat::Aac,
            RadioFormat::Mp4,
        ]
        .iter()
        .map(|f| f.code())
        .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn only_buffered_driver_is_push_model() {
        assert!(!OutputDriver::Buffered.is_pull_model());
        assert!(OutputDriver::ExclusiveEvent.is_pull_model());
        assert!(OutputDriver::Multichannel.is_pull_model());
    }

    #[test]
    fn player_event_serializes_with_event_tag() {
        let json = serde_json::to_string(&PlayerEvent::TrackChanged {
            stopped: false,
            url: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"track_changed","stopped":false,"url":true}"#);

        let json = serde_json::to_string(&PlayerEvent::StreamFreed {
            stream: StreamHandle(7),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"stream_freed","stream":7}"#);
    }
}
