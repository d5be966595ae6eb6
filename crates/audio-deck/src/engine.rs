//! Audio Engine capability consumed by the playback core.
//!
//! The engine owns decoding, mixing and device I/O. The core only ever talks to it
//! through [`AudioEngine`] and the three device traits below, using opaque handles:
//! - [`StreamHandle`] for file, url, push and mixer streams
//! - [`SyncHandle`] for registered completion callbacks
//! - [`FxHandle`] for effects attached to a stream
//!
//! ## Callback contract
//! Sync callbacks may run on any engine thread. Engines must invoke them without
//! holding their own internal locks so a callback can call back into the engine.

pub mod memory;

use std::path::Path;
use std::sync::Arc;

pub use audio_deck_types::StreamHandle;
use audio_deck_types::OutputDriver;

/// Registered completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncHandle(pub u32);

/// Effect attached to a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FxHandle(pub u32);

/// Engine failure codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine or device not initialized")]
    Init,
    #[error("no network connection")]
    NoNetwork,
    #[error("connection timed out")]
    Timeout,
    #[error("illegal parameter")]
    IllegalParam,
    #[error("unknown engine failure")]
    Unknown,
    #[error("file could not be opened")]
    FileOpen,
    #[error("unsupported format")]
    Format,
    #[error("invalid handle")]
    Handle,
    #[error("requested feature not available")]
    NotAvailable,
}

/// Codec family reported for a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodecTag {
    #[default]
    Pcm,
    Mp3,
    Ogg,
    Wma,
    /// MP3 carried inside a WMA container.
    WmaMp3,
    Aac,
    Mp4,
    Other,
}

/// Sample format of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub rate: u32,
    pub channels: u16,
    pub codec: CodecTag,
}

impl ChannelInfo {
    /// Whether a stream of `other` format can be spliced into a mixer built for `self`.
    pub fn same_format(&self, other: &ChannelInfo) -> bool {
        self.rate == other.rate && self.channels == other.channels
    }
}

/// Options for opening file and url streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Decode-only stream: data is pulled by a mixer or by the caller, never played directly.
    pub decode: bool,
    /// 32-bit float samples.
    pub float: bool,
    /// Software mixing on buffered output.
    pub software: bool,
}

/// Options for creating a mixer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MixerFlags {
    pub decode: bool,
    pub float: bool,
    /// The mixer ends once every source has ended, firing end syncs.
    pub end_when_drained: bool,
}

/// Options for attaching a source to a mixer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachFlags {
    /// Skip the short volume ramp on the first samples (gapless splices).
    pub no_ramp_in: bool,
    /// Downmix to the mixer channel count.
    pub downmix: bool,
}

/// What a sync waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKind {
    /// The stream (or every source of a mixer) reached its end.
    EndOfTrack,
    /// The stream position crossed the byte offset.
    PreRoll(u64),
    /// Stream metadata changed (network streams).
    MetaChanged,
    /// A volume slide on the stream finished.
    SlideDone,
}

/// Registration options for a sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSpec {
    pub kind: SyncKind,
    /// Fire while mixing, ahead of the audible position.
    pub mix_time: bool,
    /// Remove the sync after it fires once.
    pub one_time: bool,
}

impl SyncSpec {
    pub fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            mix_time: false,
            one_time: false,
        }
    }

    pub fn mix_time(mut self) -> Self {
        self.mix_time = true;
        self
    }

    pub fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }
}

/// Payload handed to a sync callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineEvent {
    pub sync: SyncHandle,
    pub stream: StreamHandle,
    pub kind: SyncKind,
}

pub type SyncCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// What happens when a fade to silence completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeEnd {
    /// Pause the stream, keeping its position.
    Pause,
    /// Free the stream and every source attached to it.
    Free,
}

/// Result of pulling decoded data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Read {
    Data(usize),
    Ended,
}

/// Effect types the core attaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectKind {
    Volume,
    ParamEq,
}

/// Effect parameter blocks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EffectParams {
    /// Linear gain applied instantly.
    Volume { gain: f32 },
    ParamEq {
        center_hz: f32,
        bandwidth_semitones: f32,
        gain_db: f32,
    },
}

/// Enumerated device description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub enabled: bool,
    pub is_default: bool,
    pub is_input: bool,
}

/// Byte counters of a network stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileCounter {
    /// Bytes downloaded into the network buffer so far.
    Buffered,
    /// Total size, absent for endless streams.
    Size,
}

/// Core engine operations shared by every driver.
pub trait AudioEngine: Send + Sync {
    fn open_file(&self, path: &Path, flags: OpenFlags) -> Result<StreamHandle, EngineError>;
    /// Blocking open of a network stream.
    fn open_url(&self, url: &str, flags: OpenFlags) -> Result<StreamHandle, EngineError>;
    /// Decode stream fed by [`AudioEngine::push_data`].
    fn create_push_stream(&self, rate: u32, channels: u16) -> Result<StreamHandle, EngineError>;
    fn create_mixer(&self, rate: u32, channels: u16, flags: MixerFlags) -> Result<StreamHandle, EngineError>;
    fn mixer_attach(&self, mixer: StreamHandle, source: StreamHandle, flags: AttachFlags) -> Result<(), EngineError>;
    fn mixer_detach(&self, source: StreamHandle) -> Result<(), EngineError>;
    /// Mixer a source is currently attached to.
    fn mixer_of(&self, source: StreamHandle) -> Option<StreamHandle>;
    fn free_stream(&self, stream: StreamHandle) -> Result<(), EngineError>;

    fn channel_info(&self, stream: StreamHandle) -> Result<ChannelInfo, EngineError>;
    fn length_bytes(&self, stream: StreamHandle) -> Result<u64, EngineError>;
    /// Read position. For a mixer source this is the position the mixer has consumed.
    fn position_bytes(&self, stream: StreamHandle) -> Result<u64, EngineError>;
    fn set_position_bytes(&self, stream: StreamHandle, pos: u64) -> Result<(), EngineError>;
    fn bytes_to_seconds(&self, stream: StreamHandle, bytes: u64) -> f64;
    fn seconds_to_bytes(&self, stream: StreamHandle, secs: f64) -> u64;

    fn set_volume(&self, stream: StreamHandle, volume: f32) -> Result<(), EngineError>;
    /// Linear volume slide. Replaces any slide in progress on the stream.
    fn slide_volume(&self, stream: StreamHandle, target: f32, ms: u32) -> Result<(), EngineError>;
    /// Slide to silence, then pause or free the stream.
    fn fade_out(&self, stream: StreamHandle, ms: u32, end: FadeEnd) -> Result<(), EngineError>;

    /// Start native playback of a non-decode stream.
    fn play(&self, stream: StreamHandle) -> Result<(), EngineError>;
    fn pause(&self, stream: StreamHandle) -> Result<(), EngineError>;
    fn stop(&self, stream: StreamHandle) -> Result<(), EngineError>;

    fn set_sync(&self, stream: StreamHandle, spec: SyncSpec, callback: SyncCallback) -> Result<SyncHandle, EngineError>;
    fn remove_sync(&self, stream: StreamHandle, sync: SyncHandle) -> Result<(), EngineError>;

    fn read(&self, stream: StreamHandle, buf: &mut [u8]) -> Result<Read, EngineError>;
    fn push_data(&self, stream: StreamHandle, data: &[u8]) -> Result<(), EngineError>;
    /// Mark a push stream as complete; it ends once drained.
    fn push_end(&self, stream: StreamHandle) -> Result<(), EngineError>;
    /// Bytes queued in a push stream, `None` if the stream no longer exists.
    fn push_queued(&self, stream: StreamHandle) -> Option<usize>;

    fn add_effect(&self, stream: StreamHandle, kind: EffectKind, priority: i32) -> Result<FxHandle, EngineError>;
    fn remove_effect(&self, stream: StreamHandle, fx: FxHandle) -> Result<(), EngineError>;
    fn set_effect_params(&self, fx: FxHandle, params: EffectParams) -> Result<(), EngineError>;

    /// Fill `out` with FFT magnitudes of the most recent output of `stream`.
    fn fft(&self, stream: StreamHandle, out: &mut [f32]) -> Result<(), EngineError>;
    /// Shoutcast style `StreamTitle='...';` metadata.
    fn meta_tag(&self, stream: StreamHandle) -> Option<String>;
    /// Header tags as `Key=Value` entries (WMA streams).
    fn header_tags(&self, stream: StreamHandle) -> Vec<String>;
    fn file_counter(&self, stream: StreamHandle, counter: FileCounter) -> Option<u64>;
    /// Network pre-buffer length in milliseconds.
    fn net_buffer_ms(&self) -> u32;
    fn set_proxy(&self, address: Option<&str>);
    fn set_user_agent(&self, agent: &str);

    fn device_info(&self, driver: OutputDriver, index: u32) -> Option<DeviceInfo>;
    /// Name of an output channel of the active multichannel device.
    fn channel_name(&self, channel: u32) -> Option<String>;

    fn buffered(&self) -> &dyn BufferedDevice;
    fn exclusive(&self) -> &dyn ExclusiveDevice;
    fn multichannel(&self) -> &dyn MultichannelDevice;

    /// Release everything the engine holds.
    fn shutdown(&self);
}

/// Buffered push-model output: non-decode mixers play natively once started.
pub trait BufferedDevice: Send + Sync {
    /// `device` of `None` selects the system default.
    fn init(&self, device: Option<u32>, rate: u32, window: Option<u64>, buffer_ms: u32) -> Result<(), EngineError>;
    /// Whether the device accepts 32-bit float streams.
    fn supports_float(&self) -> bool;
}

/// Exclusive-mode output pulling from a decode mixer.
pub trait ExclusiveDevice: Send + Sync {
    /// Open the device near the requested format; returns the format actually granted.
    fn init(&self, device: u32, rate: u32, channels: u16, event_driven: bool) -> Result<ChannelInfo, EngineError>;
    /// Mixer the device pulls from. `None` produces silence.
    fn set_feed(&self, mixer: Option<StreamHandle>);
    fn start(&self) -> Result<(), EngineError>;
    /// Stop the device, discarding buffered output when `reset`.
    fn stop(&self, reset: bool) -> Result<(), EngineError>;
    fn is_started(&self) -> bool;
    fn free(&self);
}

/// Multichannel low-latency output pulling from a decode mixer per channel group.
pub trait MultichannelDevice: Send + Sync {
    fn init(&self, device: u32) -> Result<(), EngineError>;
    /// Fails with [`EngineError::Init`] when the device is not initialized.
    fn stop(&self) -> Result<(), EngineError>;
    fn reset_channels(&self);
    fn enable_channel(&self, channel: u32, feed: StreamHandle) -> Result<(), EngineError>;
    fn mirror_channel(&self, channel: u32, source: u32) -> Result<(), EngineError>;
    fn join_channel(&self, channel: u32, target: u32) -> Result<(), EngineError>;
    fn set_channel_float(&self, channel: u32) -> Result<(), EngineError>;
    fn set_channel_rate(&self, channel: u32, rate: u32) -> Result<(), EngineError>;
    /// Device sample rate; fails when the hardware refuses the rate.
    fn set_rate(&self, rate: u32) -> Result<(), EngineError>;
    fn start(&self) -> Result<(), EngineError>;
    fn is_started(&self) -> bool;
    fn free(&self);
}
