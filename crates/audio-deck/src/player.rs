//! Playback state machine.
//!
//! [`Player`] owns one active stream, the output mixer and at most one preloaded
//! successor. Public operations run on the caller's thread; engine sync callbacks,
//! the buffer pump and the radio worker drive the remaining transitions:
//! - `transport`: open, start, seek, pause, stop and teardown
//! - `handoff`: preload staging, end-of-track handoff and radio start
//!
//! Every stream handle lives in exactly one session slot at a time and is taken out
//! of it before it is freed, so no transition can release a handle twice.
//!
//! Lock order: session, then engine internals, then the pump queue. The pump worker
//! and the radio worker take the session lock, so [`Player::free`] joins them without
//! holding it.

mod handoff;
mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::backend::{self, OutputBackend};
use crate::config::DeckConfig;
use crate::cue::{CueId, CueLocator};
use crate::engine::{AudioEngine, ChannelInfo, StreamHandle, SyncHandle};
use crate::equalizer::{Equalizer, EqualizerSettings};
use crate::fade::VolumePolicy;
use crate::lock;
use crate::pump::BufferPump;
use crate::radio::{self, RadioOpener};
use crate::tracks::TrackSource;
use crate::types::{
    DeckStatus, OutputDriver, PlayError, PlaybackState, PlayerEvent, ProxyConfig, RadioInfo, RadioTags,
};

/// Full scale of normalized positions.
pub const POSITION_SCALE: u64 = 100_000;

/// Bins returned by [`Player::fft`].
pub const FFT_BINS: usize = 1024;

const RADIO_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Length of a logical track.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct TrackLength {
    bytes: u64,
    secs: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Transport {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Next track staged ahead of the current one's end.
///
/// A non-empty `file` without a stream is a url or a file that failed to open;
/// a `cue` without a stream is a contiguous cut inside the current container.
#[derive(Debug, Default)]
struct Preload {
    stream: Option<StreamHandle>,
    file: String,
    cue: Option<CueId>,
    cue_offset: u64,
    length: TrackLength,
    container: TrackLength,
    /// Rate and channels match the active stream, so the mixer can splice it in.
    same_format: bool,
}

impl Preload {
    /// Whether anything is staged, including a url or a file that failed to open.
    fn is_staged(&self) -> bool {
        self.stream.is_some() || self.cue.is_some() || !self.file.is_empty()
    }
}

/// Syncs registered on the current mixer.
#[derive(Debug, Default)]
struct Syncs {
    end: Option<SyncHandle>,
    end_mix: Option<SyncHandle>,
    end_cue: Option<SyncHandle>,
    end_mix_cue: Option<SyncHandle>,
}

/// Where the end sync of a fixed-length cue track goes.
#[derive(Clone, Copy, Debug)]
struct CueMark {
    cue: CueId,
    length_secs: f64,
    /// Byte position playback resumed from.
    position: u64,
    /// Byte offset of the cue start.
    offset: u64,
}

struct Session {
    backend: Box<dyn OutputBackend>,
    transport: Transport,
    radio: bool,
    /// File of the current track.
    file: String,
    play: Option<StreamHandle>,
    mixer: Option<StreamHandle>,
    cue: Option<CueId>,
    cue_offset: u64,
    /// Source byte position the buffer stream of a pull-model track starts at.
    pos_plus: u64,
    length: TrackLength,
    container: TrackLength,
    preload: Preload,
    syncs: Syncs,
    /// Format of the last stream faded out, for the same-format splice check.
    last_format: Option<ChannelInfo>,
    volume: VolumePolicy,
    eq: Equalizer,
    radio_bitrate: u32,
    radio_live: bool,
    radio_reconnect: bool,
}

impl Session {
    fn new(backend: Box<dyn OutputBackend>, eq: EqualizerSettings) -> Self {
        Self {
            backend,
            transport: Transport::Idle,
            radio: false,
            file: String::new(),
            play: None,
            mixer: None,
            cue: None,
            cue_offset: 0,
            pos_plus: 0,
            length: TrackLength::default(),
            container: TrackLength::default(),
            preload: Preload::default(),
            syncs: Syncs::default(),
            last_format: None,
            volume: VolumePolicy::default(),
            eq: Equalizer::new(eq),
            radio_bitrate: 0,
            radio_live: false,
            radio_reconnect: false,
        }
    }

    fn is_playing(&self) -> bool {
        self.transport != Transport::Idle
    }

    fn is_paused(&self) -> bool {
        self.transport == Transport::Paused
    }
}

struct Shared {
    engine: Arc<dyn AudioEngine>,
    config: DeckConfig,
    driver: OutputDriver,
    tracks: Arc<dyn TrackSource>,
    cues: Arc<dyn CueLocator>,
    events: Sender<PlayerEvent>,
    session: Mutex<Session>,
    pump: Option<BufferPump>,
    radio: RadioOpener,
    me: Weak<Shared>,
    freed: AtomicBool,
}

/// Handles currently held by the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActiveStreams {
    pub play: Option<StreamHandle>,
    pub mixer: Option<StreamHandle>,
    pub preload: Option<StreamHandle>,
}

/// The playback core. Dropping it frees every engine resource.
pub struct Player {
    shared: Arc<Shared>,
    events: Receiver<PlayerEvent>,
}

impl Player {
    /// Bring up the output backend and, for pull-model drivers, the buffer pump.
    pub fn init(
        engine: Arc<dyn AudioEngine>,
        config: DeckConfig,
        tracks: Arc<dyn TrackSource>,
        cues: Arc<dyn CueLocator>,
    ) -> Result<Self, PlayError> {
        let backend = backend::open_backend(engine.as_ref(), &config).map_err(|e| {
            tracing::warn!(driver = config.driver.label(), "output init failed: {e}");
            PlayError::Device
        })?;
        engine.set_proxy(config.net.proxy.address().as_deref());
        if let Some(agent) = config.net.user_agent.as_deref().filter(|a| !a.is_empty()) {
            engine.set_user_agent(agent);
        }
        let settings = if config.load_equalizer {
            load_equalizer_settings(&config)
        } else {
            EqualizerSettings::default()
        };

        let (tx, rx) = unbounded();
        let driver = config.driver;
        let shared = Arc::new_cyclic(|me: &Weak<Shared>| {
            let pump = driver.is_pull_model().then(|| {
                let hook_owner = me.clone();
                BufferPump::new(
                    engine.clone(),
                    Box::new(move || {
                        if let Some(shared) = hook_owner.upgrade() {
                            shared.preload_step();
                        }
                    }),
                )
            });
            Shared {
                engine,
                config,
                driver,
                tracks,
                cues,
                events: tx,
                session: Mutex::new(Session::new(backend, settings)),
                pump,
                radio: RadioOpener::new(),
                me: me.clone(),
                freed: AtomicBool::new(false),
            }
        });

        if let Some(pump) = &shared.pump {
            if let Err(e) = pump.start() {
                tracing::warn!("buffer pump not started: {e}");
                shared.free();
                return Err(PlayError::Device);
            }
        }
        tracing::info!(driver = driver.label(), device = ?shared.config.device, "player ready");
        Ok(Self { shared, events: rx })
    }

    /// Notification stream for the GUI layer.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    pub fn driver(&self) -> OutputDriver {
        self.shared.driver
    }

    /// Play `path`, optionally a cue sub-track inside it.
    ///
    /// Fades out whatever is playing without waiting for the fade.
    pub fn play_file(&self, path: &str, cue: Option<CueId>) -> Result<(), PlayError> {
        self.shared.play_file(path, cue)
    }

    /// Open a network stream in the background.
    ///
    /// The outcome arrives as [`PlayerEvent::RadioReady`].
    pub fn play_url(&self, url: &str, reconnect: bool) {
        let mut s = lock(&self.shared.session);
        self.shared.play_url_locked(&mut s, url, reconnect);
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn pause(&self) {
        self.shared.pause();
    }

    /// Resume after [`Player::pause`].
    pub fn play(&self) {
        self.shared.resume();
    }

    /// Drop the staged successor. No-op when nothing is staged.
    pub fn free_preload(&self) {
        let mut s = lock(&self.shared.session);
        self.shared.free_preload(&mut s);
    }

    /// Seek to a normalized position in `0..100000`.
    pub fn set_position(&self, position: u32) {
        self.shared.set_position(position);
    }

    /// Normalized position in `0..100000`; 0 for radio or when idle.
    pub fn position(&self) -> u32 {
        let s = lock(&self.shared.session);
        self.shared.position_of(&s)
    }

    /// Elapsed whole seconds of the current track.
    pub fn time_position(&self) -> u64 {
        let s = lock(&self.shared.session);
        self.shared.time_position_of(&s)
    }

    /// Set the volume on the `0..=100000` scale.
    pub fn set_volume(&self, volume: u32) {
        self.shared.set_volume(volume);
    }

    pub fn volume(&self) -> u32 {
        lock(&self.shared.session).volume.requested()
    }

    pub fn set_mute(&self, muted: bool) {
        self.shared.set_mute(muted);
    }

    /// External volume mode. Only pull-model drivers honour `no_volume` and `no_effect`.
    pub fn set_no_volume_effect(&self, no_volume: bool, no_effect: bool, reset: bool) {
        self.shared.set_no_volume_effect(no_volume, no_effect, reset);
    }

    pub fn enable_eq(&self, enable: bool) {
        let mut s = lock(&self.shared.session);
        let playing = s.is_playing();
        let taps = self.shared.taps(&s);
        s.eq.set_enabled(self.shared.engine.as_ref(), enable, playing, taps);
    }

    /// Set one band gain. Returns `false` for an index outside `0..10`.
    pub fn set_eq_band(&self, index: usize, gain_db: f32) -> bool {
        let mut s = lock(&self.shared.session);
        let playing = s.is_playing();
        s.eq.set_band(self.shared.engine.as_ref(), index, gain_db, playing)
    }

    pub fn set_preamp(&self, db: f32) {
        let mut s = lock(&self.shared.session);
        let playing = s.is_playing();
        s.eq.set_preamp(self.shared.engine.as_ref(), db, playing);
    }

    pub fn set_eq_preset(&self, name: &str) {
        lock(&self.shared.session).eq.set_preset(name);
    }

    pub fn equalizer(&self) -> EqualizerSettings {
        lock(&self.shared.session).eq.settings().clone()
    }

    /// Write the equalizer document to the profile directory.
    pub fn save_equalizer(&self) -> Result<()> {
        let path = self
            .shared
            .config
            .equalizer_path()
            .context("no profile directory configured")?;
        let settings = self.equalizer();
        settings.save(&path)?;
        tracing::debug!(path = ?path, "equalizer saved");
        Ok(())
    }

    /// Reload the equalizer document and apply it to the running output.
    pub fn load_equalizer(&self) -> Result<()> {
        let path = self
            .shared
            .config
            .equalizer_path()
            .context("no profile directory configured")?;
        let settings = EqualizerSettings::load(&path)?;
        let mut s = lock(&self.shared.session);
        let engine = self.shared.engine.as_ref();
        let enabled = settings.enabled;
        s.eq.replace_settings(settings);
        if s.is_playing() {
            let taps = self.shared.taps(&s);
            s.eq.set_enabled(engine, enabled, true, taps);
        }
        Ok(())
    }

    pub fn set_proxy(&self, proxy: &ProxyConfig) {
        self.shared.engine.set_proxy(proxy.address().as_deref());
    }

    /// Ignored when empty.
    pub fn set_user_agent(&self, agent: &str) {
        if !agent.is_empty() {
            self.shared.engine.set_user_agent(agent);
        }
    }

    /// Name of output device `index` for this player's driver. See [`backend::device_name`].
    pub fn device_name(&self, index: u32) -> Option<String> {
        backend::device_name(self.shared.engine.as_ref(), self.shared.driver, index)
    }

    /// Name of an output channel on the open multichannel device.
    pub fn channel_name(&self, channel: u32) -> Option<String> {
        self.shared.engine.channel_name(channel)
    }

    /// Artist and title from the radio stream metadata.
    pub fn radio_tags(&self) -> Option<RadioTags> {
        let play = lock(&self.shared.session).play?;
        let meta = self.shared.engine.meta_tag(play)?;
        radio::parse_radio_tags(&meta)
    }

    pub fn radio_info(&self) -> Option<RadioInfo> {
        let s = lock(&self.shared.session);
        if !s.is_playing() || !s.radio {
            return None;
        }
        let play = s.play?;
        let engine = self.shared.engine.as_ref();
        let info = engine.channel_info(play).ok()?;
        Some(RadioInfo {
            format: radio::radio_format(info.codec),
            kbps: s.radio_bitrate,
            channels: info.channels,
            rate_hz: info.rate,
            meta: engine
                .meta_tag(play)
                .as_deref()
                .and_then(radio::stream_title)
                .map(str::to_string),
        })
    }

    /// Magnitude spectrum of the active stream, zeros when idle.
    pub fn fft(&self) -> Vec<f32> {
        let mut out = vec![0.0; FFT_BINS];
        if let Some(play) = lock(&self.shared.session).play {
            if let Err(e) = self.shared.engine.fft(play, &mut out) {
                tracing::debug!(stream = %play, "fft unavailable: {e}");
            }
        }
        out
    }

    pub fn state(&self) -> PlaybackState {
        state_of(&lock(&self.shared.session))
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared.session).is_playing()
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.session).is_paused()
    }

    pub fn streams(&self) -> ActiveStreams {
        let s = lock(&self.shared.session);
        ActiveStreams {
            play: s.play,
            mixer: s.mixer,
            preload: s.preload.stream,
        }
    }

    pub fn status(&self) -> DeckStatus {
        let s = lock(&self.shared.session);
        let now_playing = if s.radio {
            Some(self.shared.radio.wanted()).filter(|u| !u.is_empty())
        } else {
            Some(s.file.clone()).filter(|f| !f.is_empty() && s.is_playing())
        };
        DeckStatus {
            state: state_of(&s),
            driver: self.shared.driver,
            now_playing,
            position: self.shared.position_of(&s),
            elapsed_secs: self.shared.time_position_of(&s),
            duration_secs: s.length.secs,
            volume: s.volume.requested(),
            muted: s.volume.is_muted(),
            equalizer_enabled: s.eq.settings().enabled,
        }
    }

    /// Run one buffer pump pass on the calling thread. No-op on buffered output.
    pub fn service_buffers(&self) {
        if let Some(pump) = &self.shared.pump {
            pump.run_once();
        }
    }

    /// Release the pump, the device and every stream. Idempotent.
    pub fn free(&self) {
        self.shared.free();
    }

    /// Save the equalizer, stop without a fade and free.
    pub fn shutdown(&self) {
        if self.shared.config.equalizer_path().is_some() {
            if let Err(e) = self.save_equalizer() {
                tracing::warn!("equalizer not saved: {e:#}");
            }
        }
        {
            let mut s = lock(&self.shared.session);
            self.shared.free_preload(&mut s);
            self.shared.radio.clear();
            if s.is_playing() {
                self.shared.halt(&mut s);
            }
        }
        self.shared.free();
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.free();
    }
}

fn state_of(s: &Session) -> PlaybackState {
    match s.transport {
        Transport::Idle => PlaybackState::Idle,
        _ if s.radio => PlaybackState::Radio,
        Transport::Paused => PlaybackState::Paused,
        Transport::Playing => PlaybackState::Playing,
    }
}

fn load_equalizer_settings(config: &DeckConfig) -> EqualizerSettings {
    let Some(path) = config.equalizer_path() else {
        return EqualizerSettings::default();
    };
    match EqualizerSettings::load(&path) {
        Ok(settings) => {
            tracing::info!(path = ?path, enabled = settings.enabled, "equalizer loaded");
            settings
        }
        Err(e) => {
            tracing::warn!("equalizer not loaded: {e:#}");
            EqualizerSettings::default()
        }
    }
}

impl Shared {
    fn emit(&self, event: PlayerEvent) {
        tracing::debug!(?event, "player event");
        let _ = self.events.send(event);
    }

    /// Release the pump, the device and the engine. Idempotent.
    fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = &self.pump {
            let left = pump.shutdown();
            tracing::debug!(left, "buffer pump joined");
        }
        {
            let mut s = lock(&self.session);
            s.backend.release(self.engine.as_ref());
            s.transport = Transport::Idle;
            s.radio = false;
            s.play = None;
            s.mixer = None;
            s.preload = Preload::default();
            s.syncs = Syncs::default();
            s.eq.forget();
        }
        self.radio.clear();
        self.engine.shutdown();
        if !self.radio.join_timeout(RADIO_JOIN_TIMEOUT) {
            tracing::warn!("radio worker still running after {:?}", RADIO_JOIN_TIMEOUT);
        }
        tracing::info!("player freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cue::CueSheet;
    use crate::engine::EffectParams;
    use crate::engine::memory::{MediaSpec, MemoryEngine, UrlSpec};
    use crate::equalizer::{BAND_COUNT, preamp_gain};
    use crate::tracks::QueueTrackSource;

    pub(super) struct Rig {
        pub engine: Arc<MemoryEngine>,
        pub tracks: Arc<QueueTrackSource>,
        pub player: Player,
        pub events: Receiver<PlayerEvent>,
    }

    impl Rig {
        pub fn new(driver: OutputDriver) -> Self {
            Self::with_cues(driver, CueSheet::new())
        }

        pub fn with_cues(driver: OutputDriver, cues: CueSheet) -> Self {
            let engine = Arc::new(MemoryEngine::new());
            let tracks = Arc::new(QueueTrackSource::default());
            let config = DeckConfig {
                driver,
                ..DeckConfig::default()
            };
            let player = Player::init(engine.clone(), config, tracks.clone(), Arc::new(cues)).unwrap();
            let events = player.events();
            Self {
                engine,
                tracks,
                player,
                events,
            }
        }

        /// Advance the clock in pump-sized steps, servicing buffers in between.
        pub fn run(&self, ms: u64) {
            let mut left = ms;
            while left > 0 {
                let step = left.min(100);
                self.engine.advance(step);
                self.player.service_buffers();
                left -= step;
            }
        }

        pub fn drain(&self) -> Vec<PlayerEvent> {
            self.events.try_iter().collect()
        }
    }

    #[test]
    fn play_file_starts_at_zero() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));

        assert_eq!(rig.player.play_file("a.flac", None), Ok(()));

        assert_eq!(rig.player.state(), PlaybackState::Playing);
        assert_eq!(rig.player.position(), 0);
        let streams = rig.player.streams();
        let mixer = streams.mixer.unwrap();
        assert!(rig.engine.is_playing(mixer));
        assert_eq!(rig.engine.mixer_sources(mixer), vec![streams.play.unwrap()]);
    }

    #[test]
    fn missing_file_reports_file_error_and_stays_idle() {
        let rig = Rig::new(OutputDriver::Buffered);
        assert_eq!(rig.player.play_file("missing.flac", None), Err(PlayError::File));
        assert!(!rig.player.is_playing());
        assert_eq!(rig.player.streams(), ActiveStreams::default());
    }

    #[test]
    fn position_round_trips_through_seek() {
        for driver in [OutputDriver::Buffered, OutputDriver::ExclusiveEvent] {
            let rig = Rig::new(driver);
            rig.engine.add_media("long.flac", MediaSpec::new(44_100, 2, 10.0));
            rig.player.play_file("long.flac", None).unwrap();

            for p in [0, 1, 12_345, 50_000, 77_777, 98_000] {
                rig.player.set_position(p);
                let got = rig.player.position();
                assert!(got.abs_diff(p) <= 2, "{driver:?}: set {p}, got {got}");
            }
            rig.player.set_position(50_000);
            assert_eq!(rig.player.time_position(), 5);
        }
    }

    #[test]
    fn seek_clamps_before_the_end() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 10.0));
        rig.player.play_file("a.flac", None).unwrap();

        rig.player.set_position(99_999);

        assert!(rig.player.position().abs_diff(99_000) <= 1);
        assert!(rig.player.is_playing());
    }

    #[test]
    fn stop_and_free_preload_are_idempotent() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.player.stop();
        rig.player.free_preload();
        rig.player.stop();
        assert_eq!(rig.player.state(), PlaybackState::Idle);
        assert_eq!(rig.engine.invalid_frees(), 0);
        assert!(rig.drain().is_empty());
    }

    #[test]
    fn paused_implies_playing() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.pause();
        assert!(!rig.player.is_paused());

        rig.player.play_file("a.flac", None).unwrap();
        rig.player.pause();
        assert!(rig.player.is_paused() && rig.player.is_playing());
        rig.run(600);
        assert!(!rig.engine.is_playing(rig.player.streams().mixer.unwrap()));

        rig.player.play();
        assert!(!rig.player.is_paused());
        assert!(rig.engine.is_playing(rig.player.streams().mixer.unwrap()));

        rig.player.pause();
        rig.player.set_position(10_000);
        assert_eq!(rig.player.state(), PlaybackState::Playing);

        rig.player.pause();
        rig.player.stop();
        assert!(!rig.player.is_paused() && !rig.player.is_playing());
    }

    #[test]
    fn switching_tracks_frees_faded_stream_once() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.engine.add_media("b.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        let old = rig.player.streams();
        rig.run(1000);

        rig.player.play_file("b.flac", None).unwrap();
        assert!(rig.engine.is_live(old.play.unwrap()));
        rig.run(600);

        assert_eq!(rig.engine.free_count(old.play.unwrap()), 1);
        assert_eq!(rig.engine.free_count(old.mixer.unwrap()), 1);
        let freed: Vec<_> = rig
            .drain()
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::StreamFreed { .. }))
            .collect();
        assert_eq!(freed, vec![PlayerEvent::StreamFreed { stream: old.play.unwrap() }]);
        assert!(rig.engine.is_live(rig.player.streams().play.unwrap()));
        assert_eq!(rig.engine.invalid_frees(), 0);
    }

    #[test]
    fn pull_output_frees_faded_stream_once() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.engine.add_media("b.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        let old = rig.player.streams();
        rig.run(500);

        rig.player.play_file("b.flac", None).unwrap();
        let new = rig.player.streams();
        assert_eq!(new.mixer, old.mixer);
        rig.run(600);

        assert_eq!(rig.engine.free_count(old.play.unwrap()), 1);
        assert!(rig
            .drain()
            .contains(&PlayerEvent::StreamFreed { stream: old.play.unwrap() }));
        assert_eq!(rig.engine.mixer_sources(new.mixer.unwrap()), vec![new.play.unwrap()]);
        assert_eq!(rig.engine.invalid_frees(), 0);
    }

    #[test]
    fn stop_fades_then_tears_down() {
        for driver in [OutputDriver::Buffered, OutputDriver::ExclusiveEvent] {
            let rig = Rig::new(driver);
            rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
            rig.player.play_file("a.flac", None).unwrap();
            let active = rig.player.streams();

            rig.player.stop();
            assert!(!rig.player.is_playing());
            assert!(rig.engine.is_live(active.play.unwrap()));
            rig.run(600);

            assert_eq!(rig.engine.free_count(active.play.unwrap()), 1, "{driver:?}");
            assert_eq!(rig.engine.free_count(active.mixer.unwrap()), 1, "{driver:?}");
            assert_eq!(rig.engine.invalid_frees(), 0);
        }
    }

    #[test]
    fn stop_without_effects_frees_immediately() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.set_no_volume_effect(false, true, false);
        rig.player.play_file("a.flac", None).unwrap();
        let active = rig.player.streams();

        rig.player.stop();

        assert_eq!(rig.engine.free_count(active.play.unwrap()), 1);
        assert_eq!(rig.engine.free_count(active.mixer.unwrap()), 1);
        assert_eq!(rig.engine.exclusive_format(), None);
    }

    #[test]
    fn buffered_stop_without_effects_halts_mixer_at_once() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.set_no_volume_effect(false, true, false);
        rig.player.play_file("a.flac", None).unwrap();
        let active = rig.player.streams();

        rig.player.stop();

        assert_eq!(rig.player.state(), PlaybackState::Idle);
        assert_eq!(rig.engine.free_count(active.play.unwrap()), 1);
        assert_eq!(rig.engine.free_count(active.mixer.unwrap()), 1);
        assert_eq!(rig.engine.live_streams(), 0);
    }

    #[test]
    fn pull_pause_halts_device_after_fade() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        let play = rig.player.streams().play.unwrap();
        assert!(rig.engine.exclusive().is_started());

        rig.player.pause();
        rig.run(600);
        assert!(!rig.engine.exclusive().is_started());
        assert!(rig
            .drain()
            .contains(&PlayerEvent::OutputHalted { stream: play, stopped: false }));

        rig.player.play();
        assert!(rig.engine.exclusive().is_started());
        rig.run(600);
        assert_eq!(rig.engine.volume(play), Some(1.0));
    }

    #[test]
    fn multichannel_pause_stops_device() {
        let rig = Rig::new(OutputDriver::Multichannel);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        assert!(rig.engine.multichannel().is_started());

        rig.player.pause();
        rig.run(600);
        assert!(!rig.engine.multichannel().is_started());
        assert!(rig.player.is_paused());

        rig.player.play();
        assert!(rig.engine.multichannel().is_started());
    }

    #[test]
    fn volume_and_mute_apply_to_tap() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        let mixer = rig.player.streams().mixer.unwrap();

        rig.player.set_volume(40_000);
        assert_eq!(rig.engine.volume(mixer), Some(0.4));
        rig.player.set_mute(true);
        rig.run(200);
        assert_eq!(rig.engine.volume(mixer), Some(0.0));
        rig.player.set_volume(70_000);
        assert_eq!(rig.player.volume(), 70_000);
        assert_eq!(rig.engine.volume(mixer), Some(0.0));
        rig.player.set_mute(false);
        rig.run(200);
        assert_eq!(rig.engine.volume(mixer), Some(0.7));
    }

    #[test]
    fn reenabled_equalizer_reapplies_preamp_with_new_handles() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        let tap = rig.player.streams().play.unwrap();

        rig.player.enable_eq(true);
        rig.player.set_preamp(6.0);
        let first = rig.engine.effects_on(tap);
        assert_eq!(first.len(), BAND_COUNT + 1);

        rig.player.enable_eq(false);
        assert!(rig.engine.effects_on(tap).is_empty());
        rig.player.enable_eq(true);

        let second = rig.engine.effects_on(tap);
        assert_eq!(second.len(), BAND_COUNT + 1);
        assert!(second.iter().all(|(h, _)| first.iter().all(|(old, _)| old != h)));
        assert_eq!(second[0].1, Some(EffectParams::Volume { gain: preamp_gain(6.0) }));
    }

    #[test]
    fn equalizer_band_pushes_to_live_effect() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.player.enable_eq(true);
        rig.player.play_file("a.flac", None).unwrap();
        let tap = rig.player.streams().mixer.unwrap();

        assert!(rig.player.set_eq_band(4, -3.5));
        assert!(!rig.player.set_eq_band(10, 1.0));

        let effects = rig.engine.effects_on(tap);
        assert_eq!(effects.len(), BAND_COUNT + 1);
        assert!(matches!(
            effects[5].1,
            Some(EffectParams::ParamEq { center_hz, gain_db, .. }) if center_hz == 500.0 && gain_db == -3.5
        ));
    }

    #[test]
    fn radio_reports_ready_info_and_tags() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_url(
            "http://radio/stream",
            UrlSpec {
                buffered_bytes: Some(80_000),
                meta: Some("StreamTitle='Band - Song';StreamUrl='';".into()),
                ..UrlSpec::live(44_100, 2)
            },
        );

        rig.player.play_url("http://radio/stream", false);
        let ready = rig.events.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(ready, PlayerEvent::RadioReady { error: None, reconnect: false });
        assert_eq!(rig.player.state(), PlaybackState::Radio);
        assert_eq!(rig.player.position(), 0);
        let info = rig.player.radio_info().unwrap();
        assert_eq!(info.kbps, 128);
        assert_eq!(info.format.code(), 1);
        assert_eq!(info.meta.as_deref(), Some("Band - Song"));
        let tags = rig.player.radio_tags().unwrap();
        assert_eq!((tags.artist.as_str(), tags.title.as_str()), ("Band", "Song"));

        let play = rig.player.streams().play.unwrap();
        rig.engine.set_meta(play, "StreamTitle='Other - Tune';");
        assert_eq!(rig.drain(), vec![PlayerEvent::RadioMeta]);
    }

    #[test]
    fn stale_radio_url_is_discarded() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_url(
            "http://slow",
            UrlSpec {
                connect_delay: Duration::from_millis(100),
                ..UrlSpec::live(44_100, 2)
            },
        );
        rig.engine.add_url("http://fast", UrlSpec::live(48_000, 2));

        rig.player.play_url("http://slow", false);
        rig.player.play_url("http://fast", false);
        let ready = rig.events.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(ready, PlayerEvent::RadioReady { error: None, reconnect: false });
        assert_eq!(rig.player.status().now_playing.as_deref(), Some("http://fast"));
        assert_eq!(rig.player.radio_info().unwrap().rate_hz, 48_000);
        // play stream and its mixer
        assert_eq!(rig.engine.live_streams(), 2);
    }

    #[test]
    fn radio_errors_are_classified() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.player.play_url("http://nowhere", true);
        let ready = rig.events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            ready,
            PlayerEvent::RadioReady {
                error: Some(PlayError::Network),
                reconnect: true
            }
        );
        assert_eq!(rig.player.state(), PlaybackState::Idle);
    }

    #[test]
    fn free_is_idempotent_and_releases_everything() {
        let rig = Rig::new(OutputDriver::Multichannel);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 1, 5.0));
        rig.player.play_file("a.flac", None).unwrap();
        assert_eq!(rig.engine.multichannel_layout().mirrored, vec![(1, 0)]);

        rig.player.free();
        rig.player.free();

        assert!(!rig.player.is_playing());
        assert_eq!(rig.engine.live_streams(), 0);
        assert_eq!(rig.engine.multichannel_device(), None);
    }

    #[test]
    fn shutdown_saves_equalizer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let config = DeckConfig {
            profile_dir: Some(dir.path().to_path_buf()),
            ..DeckConfig::default()
        };
        let player = Player::init(
            engine.clone(),
            config.clone(),
            Arc::new(QueueTrackSource::default()),
            Arc::new(CueSheet::new()),
        )
        .unwrap();
        player.set_eq_band(0, 4.5);
        player.set_eq_preset("Bass");
        player.shutdown();

        let saved = EqualizerSettings::load(&config.equalizer_path().unwrap()).unwrap();
        assert_eq!(saved.preset, "Bass");
        assert_eq!(saved.gains_db[0], 4.5);
    }

    #[test]
    fn no_sound_device_fails_init() {
        let engine = Arc::new(MemoryEngine::new());
        let config = DeckConfig {
            device: crate::types::DeviceSelector::Index(0),
            ..DeckConfig::default()
        };
        let result = Player::init(
            engine,
            config,
            Arc::new(QueueTrackSource::default()),
            Arc::new(CueSheet::new()),
        );
        assert_eq!(result.err(), Some(PlayError::Device));
    }
}
