//! Opening, starting and tearing down the output chain.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::cue::{CueId, CueSpan};
use crate::engine::{
    AttachFlags, EngineError, EngineEvent, FadeEnd, OpenFlags, StreamHandle, SyncCallback, SyncHandle,
    SyncKind, SyncSpec,
};
use crate::equalizer::Taps;
use crate::lock;
use crate::types::{PlayError, PlayerEvent};

use super::{CueMark, POSITION_SCALE, Session, Shared, Syncs, TrackLength, Transport};

/// Seeks land at least this far before the end of the track.
const SEEK_END_GUARD_SECS: f64 = 0.1;

/// A freshly opened file, already wrapped in a buffer stream on pull-model output.
pub(super) struct OpenedTrack {
    pub stream: StreamHandle,
    pub length: TrackLength,
    pub container: TrackLength,
    pub cue_offset: u64,
    /// Source byte position the stream starts at.
    pub byte_pos: u64,
}

impl Shared {
    /// Sync callback that forwards to `handler` while the player is alive.
    pub(super) fn callback(&self, handler: fn(&Shared, EngineEvent)) -> SyncCallback {
        let me = self.me.clone();
        Arc::new(move |event| {
            if let Some(shared) = me.upgrade() {
                if !shared.freed.load(Ordering::SeqCst) {
                    handler(&shared, event);
                }
            }
        })
    }

    /// Callback announcing that `stream` went away with a faded mixer.
    fn freed_notice(&self, stream: StreamHandle) -> SyncCallback {
        let events = self.events.clone();
        Arc::new(move |_| {
            let _ = events.send(PlayerEvent::StreamFreed { stream });
        })
    }

    pub(super) fn add_sync(&self, stream: StreamHandle, spec: SyncSpec, callback: SyncCallback) -> Option<SyncHandle> {
        self.engine
            .set_sync(stream, spec, callback)
            .inspect_err(|e| tracing::warn!(stream = %stream, kind = ?spec.kind, "sync not registered: {e}"))
            .ok()
    }

    pub(super) fn remove_sync(&self, stream: StreamHandle, sync: &mut Option<SyncHandle>) {
        if let Some(handle) = sync.take() {
            if let Err(e) = self.engine.remove_sync(stream, handle) {
                tracing::debug!(stream = %stream, "remove sync: {e}");
            }
        }
    }

    pub(super) fn free_stream(&self, stream: StreamHandle, what: &str) {
        if let Err(e) = self.engine.free_stream(stream) {
            tracing::warn!(stream = %stream, "free {what}: {e}");
        }
    }

    pub(super) fn wake_pump(&self) {
        if let Some(pump) = &self.pump {
            pump.signal_all();
        }
    }

    pub(super) fn taps(&self, s: &Session) -> Taps {
        if self.driver.is_pull_model() {
            Taps {
                primary: s.mixer,
                fallback: s.play,
            }
        } else {
            Taps {
                primary: s.play,
                fallback: s.mixer,
            }
        }
    }

    /// Stream the volume is applied to.
    fn volume_tap(&self, s: &Session) -> Option<StreamHandle> {
        if self.driver.is_pull_model() { s.play } else { s.mixer }
    }

    pub(super) fn current_cue_mark(&self, s: &Session) -> Option<CueMark> {
        s.cue.map(|cue| CueMark {
            cue,
            length_secs: s.length.secs,
            position: s.pos_plus,
            offset: s.cue_offset,
        })
    }

    /// Whether the current track is a cue cut with a fixed end inside its container.
    pub(super) fn splits_cue(&self, s: &Session) -> bool {
        s.cue
            .is_some_and(|cue| self.cues.locate(cue).length_secs.is_some())
    }

    pub(super) fn byte_position(&self, s: &Session) -> Option<u64> {
        if s.radio {
            return None;
        }
        let play = s.play?;
        let pos = self.engine.position_bytes(play).ok()?;
        Some(if self.driver.is_pull_model() {
            pos + s.pos_plus
        } else {
            pos
        })
    }

    pub(super) fn position_of(&self, s: &Session) -> u32 {
        let Some(pos) = self.byte_position(s) else {
            return 0;
        };
        if s.length.bytes == 0 {
            return 0;
        }
        let scaled = pos.saturating_sub(s.cue_offset) * POSITION_SCALE / s.length.bytes;
        scaled.min(POSITION_SCALE) as u32
    }

    pub(super) fn time_position_of(&self, s: &Session) -> u64 {
        match (self.byte_position(s), s.play) {
            (Some(pos), Some(play)) => self
                .engine
                .bytes_to_seconds(play, pos.saturating_sub(s.cue_offset))
                .round() as u64,
            _ => 0,
        }
    }

    /// Open `path` positioned at `start_secs`.
    ///
    /// On pull-model output the decode stream is handed to the pump and a buffer
    /// stream of the same format is returned in its place.
    fn open_media(&self, flags: OpenFlags, path: &str, start_secs: Option<f64>) -> Result<OpenedTrack, EngineError> {
        let engine = self.engine.as_ref();
        let file = engine.open_file(Path::new(path), flags)?;
        let bytes = engine.length_bytes(file).unwrap_or(0);
        let length = TrackLength {
            bytes,
            secs: engine.bytes_to_seconds(file, bytes),
        };
        let mut byte_pos = 0;
        if let Some(secs) = start_secs {
            byte_pos = engine.seconds_to_bytes(file, secs);
            if let Err(e) = engine.set_position_bytes(file, byte_pos) {
                tracing::debug!(path, secs, "seek on open: {e}");
            }
        }

        let Some(pump) = &self.pump else {
            return Ok(OpenedTrack {
                stream: file,
                length,
                container: length,
                cue_offset: 0,
                byte_pos,
            });
        };
        let buffer = match engine
            .channel_info(file)
            .and_then(|info| engine.create_push_stream(info.rate, info.channels))
        {
            Ok(buffer) => buffer,
            Err(e) => {
                self.free_stream(file, "source");
                return Err(e);
            }
        };
        let quota = engine.seconds_to_bytes(file, self.config.read_ahead_secs) as usize;
        pump.enqueue(file, buffer, quota);
        Ok(OpenedTrack {
            stream: buffer,
            length,
            container: length,
            cue_offset: 0,
            byte_pos,
        })
    }

    /// Open a whole file or a cue cut, `seek_secs` into the track.
    pub(super) fn open_track(
        &self,
        flags: OpenFlags,
        path: &str,
        cue: Option<CueId>,
        seek_secs: Option<f64>,
    ) -> Result<OpenedTrack, EngineError> {
        let Some(cue) = cue else {
            return self.open_media(flags, path, seek_secs);
        };
        let span = self.cues.locate(cue);
        let mut track = self.open_media(flags, path, Some(span.offset_secs + seek_secs.unwrap_or(0.0)))?;
        track.cue_offset = self.engine.seconds_to_bytes(track.stream, span.offset_secs);
        track.length = self.cue_length(track.stream, span, track.container, track.cue_offset);
        Ok(track)
    }

    /// Length of a cue cut: fixed, or the rest of the container.
    pub(super) fn cue_length(&self, stream: StreamHandle, span: CueSpan, container: TrackLength, cue_offset: u64) -> TrackLength {
        match span.length_secs {
            Some(secs) => TrackLength {
                bytes: self.engine.seconds_to_bytes(stream, secs),
                secs,
            },
            None => TrackLength {
                bytes: container.bytes.saturating_sub(cue_offset),
                secs: (container.secs - span.offset_secs).max(0.0),
            },
        }
    }

    /// Free the mixer and the active stream right away.
    pub(super) fn release_streams(&self, s: &mut Session) {
        s.syncs = Syncs::default();
        if let Some(mixer) = s.mixer.take() {
            self.free_stream(mixer, "mixer");
        }
        if let Some(play) = s.play.take() {
            self.free_stream(play, "play");
        }
        s.eq.forget();
    }

    /// Close the device and free every active stream.
    pub(super) fn teardown_output(&self, s: &mut Session) {
        s.backend.release(self.engine.as_ref());
        self.release_streams(s);
    }

    /// Stop without a fade.
    pub(super) fn halt(&self, s: &mut Session) {
        self.reset_cue_sync(s, None);
        self.teardown_output(s);
        s.transport = Transport::Idle;
        s.radio = false;
    }

    pub(super) fn free_preload(&self, s: &mut Session) {
        let preload = std::mem::take(&mut s.preload);
        if let Some(stream) = preload.stream {
            self.free_stream(stream, "preload");
            tracing::debug!(stream = %stream, file = %preload.file, "preload dropped");
        }
    }

    /// Fade the buffered mixer out and let the engine free it with its source.
    ///
    /// Returns `false` when no fade was started.
    fn fade_out_buffered(&self, s: &mut Session, ms: u32) -> bool {
        let (Some(play), Some(mixer)) = (s.play, s.mixer) else {
            return false;
        };
        self.remove_sync(mixer, &mut s.syncs.end);
        self.remove_sync(mixer, &mut s.syncs.end_mix);
        self.add_sync(
            mixer,
            SyncSpec::new(SyncKind::SlideDone).one_time(),
            self.freed_notice(play),
        );
        if let Err(e) = self.engine.fade_out(mixer, ms, FadeEnd::Free) {
            tracing::warn!(mixer = %mixer, "fade out: {e}");
            return false;
        }
        s.play = None;
        s.mixer = None;
        s.syncs = Syncs::default();
        s.eq.forget();
        tracing::debug!(play = %play, mixer = %mixer, ms, "output fading out");
        true
    }

    /// Release the current stream ahead of opening another one, fading over `fade_ms`.
    pub(super) fn prepare_open(&self, s: &mut Session, fade_ms: Option<u32>) {
        self.reset_cue_sync(s, None);
        let ms = fade_ms.unwrap_or(0);
        let fade = fade_ms.is_some() && s.transport == Transport::Playing && s.volume.fades_enabled();

        if !self.driver.is_pull_model() {
            if fade {
                self.fade_out_buffered(s, ms);
            }
            self.release_streams(s);
            return;
        }

        if let Some(play) = s.play {
            s.last_format = self.engine.channel_info(play).ok();
        }
        if let Some(mixer) = s.mixer {
            self.remove_sync(mixer, &mut s.syncs.end_mix);
        }
        if fade {
            if let Some(play) = s.play {
                self.add_sync(
                    play,
                    SyncSpec::new(SyncKind::SlideDone).mix_time().one_time(),
                    self.callback(Shared::on_faded_stream),
                );
                match self.engine.slide_volume(play, 0.0, ms) {
                    Ok(()) => {
                        s.eq.tap_freed(play);
                        s.play = None;
                        tracing::debug!(play = %play, ms, "stream fading out");
                    }
                    Err(e) => tracing::warn!(play = %play, "fade out: {e}"),
                }
            }
        }
        if let Some(play) = s.play.take() {
            s.eq.tap_freed(play);
            self.free_stream(play, "play");
        }
    }

    fn apply_start_volume(&self, tap: StreamHandle, level: f32, fade_in: bool) {
        let result = if fade_in {
            self.engine
                .set_volume(tap, 0.0)
                .and_then(|()| self.engine.slide_volume(tap, level, self.config.fades.position_ms))
        } else {
            self.engine.set_volume(tap, level)
        };
        if let Err(e) = result {
            tracing::debug!(tap = %tap, "start volume: {e}");
        }
    }

    /// Build the output chain around the active stream and start it.
    ///
    /// `gapless` restarts the output after a format change at a track boundary:
    /// the previous mixer is dropped and no fade-in is applied.
    pub(super) fn start_play(&self, s: &mut Session, need_fade: bool, gapless: bool) -> Result<(), EngineError> {
        let play = s.play.ok_or(EngineError::Handle)?;
        if self.driver.is_pull_model() {
            self.start_pull(s, play, need_fade, gapless)
        } else {
            self.start_buffered(s, play, need_fade, gapless)
        }
    }

    fn start_buffered(&self, s: &mut Session, play: StreamHandle, need_fade: bool, gapless: bool) -> Result<(), EngineError> {
        let engine = self.engine.as_ref();
        if gapless {
            if let Some(old) = s.mixer.take() {
                s.syncs = Syncs::default();
                self.free_stream(old, "mixer");
            }
        }
        let info = engine.channel_info(play)?;
        let mixer = engine.create_mixer(info.rate, info.channels, s.backend.mixer_flags())?;
        s.mixer = Some(mixer);
        engine.mixer_attach(mixer, play, s.backend.attach_flags())?;
        let taps = self.taps(s);
        s.eq.apply(engine, taps);

        s.syncs.end = self.add_sync(
            mixer,
            SyncSpec::new(SyncKind::EndOfTrack),
            self.callback(Shared::on_end),
        );
        s.syncs.end_mix = self.add_sync(
            mixer,
            SyncSpec::new(SyncKind::EndOfTrack).mix_time(),
            self.callback(Shared::on_mix_end_buffered),
        );
        let mark = self.current_cue_mark(s);
        self.reset_cue_sync(s, mark);

        let fade_in = need_fade && !gapless && s.volume.fades_enabled();
        self.apply_start_volume(mixer, s.volume.real(), fade_in);
        if !s.is_paused() {
            s.backend.start(engine, mixer)?;
        }
        tracing::info!(
            mixer = %mixer,
            rate_hz = info.rate,
            channels = info.channels,
            gapless,
            "buffered output started"
        );
        Ok(())
    }

    fn start_pull(&self, s: &mut Session, play: StreamHandle, need_fade: bool, gapless: bool) -> Result<(), EngineError> {
        let engine = self.engine.as_ref();
        let info = engine.channel_info(play)?;

        if gapless {
            if let Some(old) = s.mixer.take() {
                s.syncs = Syncs::default();
                self.free_stream(old, "mixer");
                s.eq.forget();
            }
            self.apply_start_volume(play, s.volume.real(), false);
        } else {
            self.apply_start_volume(play, s.volume.real(), need_fade && s.volume.fades_enabled());
            if let Some(mixer) = s.mixer {
                if s.last_format.is_some_and(|f| f.same_format(&info)) {
                    s.syncs.end_mix = self.add_sync(
                        mixer,
                        SyncSpec::new(SyncKind::EndOfTrack).mix_time(),
                        self.callback(Shared::on_mix_end_pull),
                    );
                    let splice = AttachFlags {
                        no_ramp_in: true,
                        ..s.backend.attach_flags()
                    };
                    engine.mixer_attach(mixer, play, splice)?;
                    engine.set_position_bytes(mixer, 0)?;
                    let mark = self.current_cue_mark(s);
                    self.reset_cue_sync(s, mark);
                    if !s.backend.is_started(engine) {
                        s.backend.start(engine, mixer)?;
                    }
                    self.wake_pump();
                    tracing::debug!(mixer = %mixer, play = %play, "spliced into running output");
                    return Ok(());
                }
                s.mixer = None;
                s.syncs = Syncs::default();
                self.free_stream(mixer, "mixer");
                s.eq.forget();
            }
        }

        let granted = s.backend.prepare(engine, info)?;
        let mixer = engine.create_mixer(granted.rate, granted.channels, s.backend.mixer_flags())?;
        s.mixer = Some(mixer);
        s.syncs.end_mix = self.add_sync(
            mixer,
            SyncSpec::new(SyncKind::EndOfTrack).mix_time(),
            self.callback(Shared::on_mix_end_pull),
        );
        let mark = self.current_cue_mark(s);
        self.reset_cue_sync(s, mark);
        let taps = self.taps(s);
        s.eq.apply(engine, taps);

        engine.mixer_attach(mixer, play, s.backend.attach_flags())?;
        s.backend.connect(engine, mixer, info)?;
        if !s.is_paused() {
            s.backend.start(engine, mixer)?;
            self.wake_pump();
        }
        tracing::info!(
            driver = self.driver.label(),
            mixer = %mixer,
            rate_hz = granted.rate,
            channels = granted.channels,
            gapless,
            "pull output started"
        );
        Ok(())
    }

    /// Replace the cue end syncs on the mixer.
    ///
    /// Syncs are only installed for a cue with a fixed length; open-ended cuts end
    /// with their container.
    pub(super) fn reset_cue_sync(&self, s: &mut Session, mark: Option<CueMark>) {
        let Some(mixer) = s.mixer else {
            s.syncs.end_cue = None;
            s.syncs.end_mix_cue = None;
            return;
        };
        self.remove_sync(mixer, &mut s.syncs.end_cue);
        self.remove_sync(mixer, &mut s.syncs.end_mix_cue);
        let Some(mark) = mark else {
            return;
        };
        if self.cues.locate(mark.cue).length_secs.is_none() {
            return;
        }

        let engine = self.engine.as_ref();
        let remaining = if mark.position == mark.offset {
            mark.length_secs
        } else {
            let played = s.play.map_or(0.0, |play| {
                engine.bytes_to_seconds(play, mark.position.saturating_sub(mark.offset))
            });
            mark.length_secs - played
        };
        let at = engine.position_bytes(mixer).unwrap_or(0) + engine.seconds_to_bytes(mixer, remaining);

        if self.driver.is_pull_model() {
            s.syncs.end_cue = self.add_sync(
                mixer,
                SyncSpec::new(SyncKind::PreRoll(at)).mix_time(),
                self.callback(Shared::on_mix_end_pull),
            );
            let lead = engine
                .seconds_to_bytes(mixer, self.config.read_ahead_secs)
                .min(at);
            s.syncs.end_mix_cue = self.add_sync(
                mixer,
                SyncSpec::new(SyncKind::PreRoll(at - lead)).mix_time(),
                self.callback(Shared::on_cue_preload),
            );
        } else {
            s.syncs.end_cue = self.add_sync(
                mixer,
                SyncSpec::new(SyncKind::PreRoll(at)),
                self.callback(Shared::on_end),
            );
            s.syncs.end_mix_cue = self.add_sync(
                mixer,
                SyncSpec::new(SyncKind::PreRoll(at)).mix_time(),
                self.callback(Shared::on_mix_end_buffered),
            );
        }
        tracing::debug!(cue = ?mark.cue, at, remaining_secs = remaining, "cue end sync set");
    }

    pub(super) fn play_file(&self, path: &str, cue: Option<CueId>) -> Result<(), PlayError> {
        let mut s = lock(&self.session);
        self.free_preload(&mut s);
        let need_fade = s.is_playing();
        self.prepare_open(&mut s, Some(self.config.fades.stop_ms));
        self.radio.clear();
        s.radio = false;
        s.file = path.to_string();
        s.cue = cue;
        s.cue_offset = 0;
        s.pos_plus = 0;

        let flags = s.backend.open_flags();
        let track = match self.open_track(flags, path, cue, None) {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!(path, cue = ?cue, "open failed: {e}");
                self.teardown_output(&mut s);
                s.transport = Transport::Idle;
                return Err(if e == EngineError::Init {
                    PlayError::Device
                } else {
                    PlayError::File
                });
            }
        };
        s.play = Some(track.stream);
        s.length = track.length;
        s.container = track.container;
        s.cue_offset = track.cue_offset;
        s.pos_plus = track.byte_pos;
        s.transport = Transport::Playing;

        if let Err(e) = self.start_play(&mut s, need_fade, false) {
            tracing::warn!(path, "output start failed: {e}");
            s.transport = Transport::Idle;
            self.release_streams(&mut s);
            self.wake_pump();
            return Err(PlayError::Device);
        }
        tracing::info!(path, cue = ?cue, secs = s.length.secs, "playing");
        Ok(())
    }

    pub(super) fn set_position(&self, position: u32) {
        let mut s = lock(&self.session);
        if s.radio || s.play.is_none() {
            return;
        }
        self.free_preload(&mut s);
        if s.is_paused() {
            s.transport = Transport::Playing;
        }
        self.prepare_open(&mut s, Some(self.config.fades.position_ms));

        let secs = s.length.secs;
        let wanted = u64::from(position).min(POSITION_SCALE) as f64 * secs / POSITION_SCALE as f64;
        let target = wanted.min(secs - SEEK_END_GUARD_SECS).max(0.0);
        let file = s.file.clone();
        let cue = s.cue;
        let flags = s.backend.open_flags();

        let track = match self.open_track(flags, &file, cue, Some(target)) {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!(path = %file, "reopen for seek failed: {e}");
                self.halt(&mut s);
                drop(s);
                self.emit(PlayerEvent::PlaybackFailed { error: PlayError::File });
                return;
            }
        };
        s.play = Some(track.stream);
        s.length = track.length;
        s.container = track.container;
        s.cue_offset = track.cue_offset;
        s.pos_plus = track.byte_pos;

        if let Err(e) = self.start_play(&mut s, true, false) {
            tracing::warn!(path = %file, "output restart after seek failed: {e}");
            self.halt(&mut s);
            drop(s);
            self.emit(PlayerEvent::PlaybackFailed { error: PlayError::Device });
            return;
        }
        tracing::debug!(path = %file, position, target_secs = target, "seeked");
    }

    pub(super) fn stop(&self) {
        let mut s = lock(&self.session);
        self.free_preload(&mut s);
        self.reset_cue_sync(&mut s, None);
        self.radio.clear();
        if !s.is_playing() {
            return;
        }
        s.transport = Transport::Idle;
        s.radio = false;
        let ms = self.config.fades.stop_ms;

        if !s.volume.fades_enabled() {
            if let Some(mixer) = s.mixer.filter(|_| !self.driver.is_pull_model()) {
                if let Err(e) = self.engine.stop(mixer) {
                    tracing::debug!(mixer = %mixer, "stop mixer: {e}");
                }
            }
            self.teardown_output(&mut s);
            tracing::info!("stopped");
            return;
        }

        if !self.driver.is_pull_model() {
            if !self.fade_out_buffered(&mut s, ms) {
                self.release_streams(&mut s);
            }
            tracing::info!(ms, "stopping with fade");
            return;
        }

        let Some(play) = s.play else {
            self.teardown_output(&mut s);
            return;
        };
        if let Some(mixer) = s.mixer {
            self.remove_sync(mixer, &mut s.syncs.end_mix);
        }
        self.add_sync(
            play,
            SyncSpec::new(SyncKind::SlideDone).mix_time().one_time(),
            self.callback(Shared::on_stop_faded),
        );
        if let Err(e) = self.engine.slide_volume(play, 0.0, ms) {
            tracing::warn!(play = %play, "stop fade: {e}");
            self.teardown_output(&mut s);
            return;
        }
        s.play = None;
        s.mixer = None;
        s.syncs = Syncs::default();
        s.eq.forget();
        tracing::info!(ms, "stopping with fade");
    }

    pub(super) fn pause(&self) {
        let mut s = lock(&self.session);
        if s.transport != Transport::Playing {
            return;
        }
        s.transport = Transport::Paused;
        let engine = self.engine.as_ref();
        let fades = s.volume.fades_enabled();
        let ms = self.config.fades.pause_ms;

        if !self.driver.is_pull_model() {
            let Some(mixer) = s.mixer else {
                return;
            };
            let result = if fades {
                engine.fade_out(mixer, ms, FadeEnd::Pause)
            } else {
                engine.pause(mixer)
            };
            if let Err(e) = result {
                tracing::warn!(mixer = %mixer, "pause: {e}");
            }
        } else if !fades {
            let mixer = s.mixer;
            s.backend.pause(engine, mixer);
            if let Some(pump) = &self.pump {
                pump.close_gate();
            }
        } else if let Some(play) = s.play {
            self.add_sync(
                play,
                SyncSpec::new(SyncKind::SlideDone).mix_time().one_time(),
                self.callback(Shared::on_pause_faded),
            );
            if let Err(e) = engine.slide_volume(play, 0.0, ms) {
                tracing::warn!(play = %play, "pause fade: {e}");
            }
        }
        tracing::info!("paused");
    }

    pub(super) fn resume(&self) {
        let mut s = lock(&self.session);
        if !s.is_paused() {
            return;
        }
        s.transport = Transport::Playing;
        let engine = self.engine.as_ref();
        let fades = s.volume.fades_enabled();
        let ms = self.config.fades.pause_ms;
        let level = s.volume.real();

        if self.driver.is_pull_model() {
            self.wake_pump();
            if let Some(play) = s.play.filter(|_| fades) {
                if let Err(e) = engine.slide_volume(play, level, ms) {
                    tracing::debug!(play = %play, "resume fade: {e}");
                }
            }
        } else if let Some(mixer) = s.mixer.filter(|_| fades) {
            if let Err(e) = engine.slide_volume(mixer, level, ms) {
                tracing::debug!(mixer = %mixer, "resume fade: {e}");
            }
        }
        if let Some(mixer) = s.mixer {
            if let Err(e) = s.backend.start(engine, mixer) {
                tracing::warn!(mixer = %mixer, "resume: {e}");
            }
        }
        tracing::info!("resumed");
    }

    /// A pull-model stream finished its fade to silence on a track switch.
    pub(super) fn on_faded_stream(&self, event: EngineEvent) {
        lock(&self.session).eq.tap_freed(event.stream);
        self.free_stream(event.stream, "faded stream");
        self.emit(PlayerEvent::StreamFreed { stream: event.stream });
    }

    fn on_pause_faded(&self, event: EngineEvent) {
        self.on_output_halted(event.stream, false);
    }

    fn on_stop_faded(&self, event: EngineEvent) {
        self.on_output_halted(event.stream, true);
    }

    /// Finish a pull-model pause or stop once the fade reached silence.
    fn on_output_halted(&self, stream: StreamHandle, stopped: bool) {
        let mut s = lock(&self.session);
        let engine = self.engine.as_ref();
        if stopped {
            if !s.is_playing() {
                s.backend.release(engine);
            }
            if let Some(mixer) = engine.mixer_of(stream).filter(|m| Some(*m) != s.mixer) {
                s.eq.tap_freed(mixer);
                self.free_stream(mixer, "mixer");
            }
            s.eq.tap_freed(stream);
            self.free_stream(stream, "play");
        } else if s.is_paused() {
            let mixer = s.mixer;
            s.backend.pause(engine, mixer);
            if let Some(pump) = &self.pump {
                pump.close_gate();
            }
        }
        drop(s);
        tracing::debug!(stream = %stream, stopped, "output halted");
        self.emit(PlayerEvent::OutputHalted { stream, stopped });
    }

    pub(super) fn set_volume(&self, volume: u32) {
        let mut s = lock(&self.session);
        let Some(level) = s.volume.set_requested(volume) else {
            return;
        };
        if let Some(tap) = self.volume_tap(&s) {
            if let Err(e) = self.engine.set_volume(tap, level) {
                tracing::debug!(tap = %tap, "set volume: {e}");
            }
        }
    }

    pub(super) fn set_mute(&self, muted: bool) {
        let mut s = lock(&self.session);
        let Some(level) = s.volume.set_muted(muted) else {
            return;
        };
        let Some(tap) = self.volume_tap(&s) else {
            return;
        };
        let result = if s.volume.fades_enabled() {
            self.engine.slide_volume(tap, level, self.config.fades.mute_ms)
        } else {
            self.engine.set_volume(tap, level)
        };
        if let Err(e) = result {
            tracing::debug!(tap = %tap, muted, "mute: {e}");
        }
    }

    pub(super) fn set_no_volume_effect(&self, no_volume: bool, no_effect: bool, reset: bool) {
        let mut s = lock(&self.session);
        s.volume
            .set_external(self.driver.is_pull_model(), no_volume, no_effect, reset);
        if reset || no_volume {
            if let Some(tap) = self.volume_tap(&s) {
                if let Err(e) = self.engine.set_volume(tap, s.volume.real()) {
                    tracing::debug!(tap = %tap, "external volume: {e}");
                }
            }
        }
    }
}
