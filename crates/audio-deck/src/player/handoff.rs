//! Preload staging and end-of-track handoff.
//!
//! Buffered output learns about a track end twice: a mix-time sync while the mixer
//! is still rendering ahead, where the preload is opened and spliced in, and a late
//! sync when the end is audible, where the session swaps over. Pull-model output
//! stages the preload from the pump hook a read-ahead early and does both halves in
//! the mix-time sync.

use std::sync::atomic::Ordering;

use crate::engine::{AttachFlags, EngineEvent, FileCounter, StreamHandle, SyncKind, SyncSpec};
use crate::lock;
use crate::radio::{self, RadioOpen};
use crate::tracks;
use crate::types::{PlayError, PlayerEvent};

use super::{CueMark, Preload, Session, Shared, TrackLength, Transport};

impl Shared {
    /// Pump hook entry point.
    pub(super) fn preload_step(&self) {
        if self.freed.load(Ordering::SeqCst) {
            return;
        }
        let mut s = lock(&self.session);
        self.preload_next(&mut s);
    }

    /// Stage the next playlist entry unless something is staged already.
    fn preload_next(&self, s: &mut Session) {
        if !s.is_playing() || s.radio || s.preload.is_staged() {
            return;
        }
        let Some(next) = self.tracks.next_track() else {
            tracing::debug!("playlist exhausted, nothing to preload");
            return;
        };

        if let (Some(cue), Some(current), Some(play)) = (next.cue, s.cue, s.play) {
            if next.path == s.file && self.cues.is_next(current, cue) {
                let span = self.cues.locate(cue);
                let cue_offset = self.engine.seconds_to_bytes(play, span.offset_secs);
                s.preload = Preload {
                    cue: Some(cue),
                    cue_offset,
                    length: self.cue_length(play, span, s.container, cue_offset),
                    container: s.container,
                    same_format: true,
                    ..Preload::default()
                };
                tracing::debug!(cue = ?cue, "next cue continues the open container");
                return;
            }
        }

        if tracks::is_url(&next.path) {
            tracing::debug!(url = %next.path, "next entry is a network stream");
            s.preload.file = next.path;
            return;
        }

        let flags = s.backend.open_flags();
        match self.open_track(flags, &next.path, next.cue, None) {
            Ok(track) => {
                let current = s.play.and_then(|play| self.engine.channel_info(play).ok());
                let same_format = match (current, self.engine.channel_info(track.stream)) {
                    (Some(a), Ok(b)) => a.same_format(&b),
                    _ => false,
                };
                tracing::debug!(path = %next.path, cue = ?next.cue, same_format, "preload staged");
                s.preload = Preload {
                    stream: Some(track.stream),
                    file: next.path,
                    cue: next.cue,
                    cue_offset: track.cue_offset,
                    length: track.length,
                    container: track.container,
                    same_format,
                };
            }
            Err(e) => {
                tracing::warn!(path = %next.path, "preload failed: {e}");
                s.preload.file = next.path;
            }
        }
    }

    /// Splice a same-format preload into the mixer in place of the current stream.
    fn splice_preload(&self, s: &mut Session, mixer: StreamHandle) {
        let Some(next) = s.preload.stream.filter(|_| s.preload.same_format) else {
            return;
        };
        let engine = self.engine.as_ref();
        if self.splits_cue(s) {
            if let Some(play) = s.play {
                if let Err(e) = engine.mixer_detach(play) {
                    tracing::debug!(play = %play, "detach cue container: {e}");
                }
            }
            self.remove_sync(mixer, &mut s.syncs.end_mix_cue);
        }
        if self.driver.is_pull_model() {
            if let Err(e) = engine.set_volume(next, s.volume.real()) {
                tracing::debug!(stream = %next, "preload volume: {e}");
            }
        }
        let flags = AttachFlags {
            no_ramp_in: true,
            ..s.backend.attach_flags()
        };
        if let Err(e) = engine.mixer_attach(mixer, next, flags) {
            tracing::warn!(mixer = %mixer, stream = %next, "splice preload: {e}");
            return;
        }
        if let Err(e) = engine.set_position_bytes(mixer, 0) {
            tracing::debug!(mixer = %mixer, "rewind mixer: {e}");
        }
        tracing::debug!(mixer = %mixer, stream = %next, "preload spliced");
    }

    /// Move the cue end syncs to the staged cue when the mixer keeps running.
    fn carry_cue_sync(&self, s: &mut Session) {
        if (s.preload.cue.is_some() || s.cue.is_some()) && s.preload.same_format {
            let mark = s.preload.cue.map(|cue| CueMark {
                cue,
                length_secs: s.preload.length.secs,
                position: 0,
                offset: 0,
            });
            self.reset_cue_sync(s, mark);
        }
    }

    /// Buffered output, mix time: open the next track and splice it in.
    pub(super) fn on_mix_end_buffered(&self, event: EngineEvent) {
        let mut s = lock(&self.session);
        if !s.is_playing() || s.mixer != Some(event.stream) {
            return;
        }
        self.preload_next(&mut s);
        self.splice_preload(&mut s, event.stream);
    }

    /// Buffered output, audible end: swap the session over.
    pub(super) fn on_end(&self, event: EngineEvent) {
        let mut s = lock(&self.session);
        if !s.is_playing() || s.mixer != Some(event.stream) {
            return;
        }
        self.carry_cue_sync(&mut s);
        self.handoff(&mut s);
    }

    /// Pull-model output: splice, move cue syncs and swap in one step.
    pub(super) fn on_mix_end_pull(&self, event: EngineEvent) {
        let mut s = lock(&self.session);
        if !s.is_playing() || s.mixer != Some(event.stream) {
            return;
        }
        self.splice_preload(&mut s, event.stream);
        self.carry_cue_sync(&mut s);
        if s.is_paused() {
            let mixer = s.mixer;
            s.backend.pause(self.engine.as_ref(), mixer);
            if let Some(pump) = &self.pump {
                pump.close_gate();
            }
        }
        self.handoff(&mut s);
    }

    /// A cue cut is one read-ahead from its end; stage the next one on the pump thread.
    pub(super) fn on_cue_preload(&self, _event: EngineEvent) {
        if let Some(pump) = &self.pump {
            pump.request_next_cue();
        }
    }

    fn on_radio_meta(&self, event: EngineEvent) {
        tracing::debug!(stream = %event.stream, "radio metadata changed");
        self.emit(PlayerEvent::RadioMeta);
    }

    /// Promote the preload to the current track, or stop at the end of the list.
    fn handoff(&self, s: &mut Session) {
        if !s.is_playing() {
            return;
        }
        if !s.radio && s.preload.is_staged() {
            let preload = std::mem::take(&mut s.preload);
            if let Some(next) = preload.stream {
                if let Some(old) = s.play.replace(next) {
                    s.eq.tap_freed(old);
                    self.free_stream(old, "play");
                }
                s.file = preload.file;
                s.length = preload.length;
                s.container = preload.container;
                s.cue = preload.cue;
                s.cue_offset = preload.cue_offset;
                s.pos_plus = preload.cue_offset;
                if !preload.same_format {
                    if let Err(e) = self.start_play(s, false, true) {
                        tracing::warn!(path = %s.file, "output restart at track change failed: {e}");
                        self.emit(PlayerEvent::PlaybackFailed { error: PlayError::Device });
                        self.end_of_list(s);
                        return;
                    }
                } else if !self.driver.is_pull_model() {
                    let taps = self.taps(s);
                    s.eq.apply(self.engine.as_ref(), taps);
                }
                tracing::info!(path = %s.file, cue = ?s.cue, gapless = preload.same_format, "track changed");
                self.emit(PlayerEvent::TrackChanged {
                    stopped: false,
                    url: false,
                });
                return;
            }
            if tracks::is_url(&preload.file) {
                tracing::info!(url = %preload.file, "track changed to network stream");
                self.play_url_locked(s, &preload.file, false);
                self.emit(PlayerEvent::TrackChanged {
                    stopped: false,
                    url: true,
                });
                return;
            }
            if let (Some(cue), true) = (preload.cue, preload.file.is_empty()) {
                s.cue = Some(cue);
                s.cue_offset = preload.cue_offset;
                s.length = preload.length;
                tracing::info!(cue = ?cue, "cue track changed");
                self.emit(PlayerEvent::TrackChanged {
                    stopped: false,
                    url: false,
                });
                return;
            }
            tracing::debug!(path = %preload.file, "next track unavailable");
        }
        self.end_of_list(s);
    }

    fn end_of_list(&self, s: &mut Session) {
        self.halt(s);
        tracing::info!("playback reached the end of the list");
        self.emit(PlayerEvent::TrackChanged {
            stopped: true,
            url: false,
        });
    }

    /// Switch to a network stream; the open itself runs on the radio worker.
    pub(super) fn play_url_locked(&self, s: &mut Session, url: &str, reconnect: bool) {
        self.free_preload(s);
        s.radio_reconnect = reconnect;
        self.radio.set_wanted(url);
        s.file.clear();
        s.cue = None;
        s.cue_offset = 0;
        s.pos_plus = 0;
        s.length = TrackLength::default();
        s.container = TrackLength::default();
        if self.radio.is_running() {
            tracing::debug!(%url, "radio open in flight, wanted url replaced");
            return;
        }
        self.prepare_open(s, (!reconnect).then_some(self.config.fades.stop_ms));

        let me = self.me.clone();
        let spawned = self
            .radio
            .spawn(self.engine.clone(), s.backend.open_flags(), move |open| {
                if let Some(shared) = me.upgrade() {
                    shared.start_radio(open);
                }
            });
        match spawned {
            Ok(()) => tracing::info!(%url, reconnect, "opening network stream"),
            Err(e) => {
                tracing::warn!(%url, "radio worker not started: {e}");
                self.radio.clear();
                self.emit(PlayerEvent::RadioReady {
                    error: Some(PlayError::Network),
                    reconnect,
                });
            }
        }
    }

    /// Radio worker delivery: start the opened stream or report the failure.
    fn start_radio(&self, open: RadioOpen) {
        if self.freed.load(Ordering::SeqCst) {
            return;
        }
        let mut s = lock(&self.session);
        if self.radio.wanted() != open.url {
            if let Ok(stream) = open.result {
                self.free_stream(stream, "stale radio stream");
            }
            tracing::debug!(url = %open.url, "radio open no longer wanted");
            return;
        }
        let reconnect = s.radio_reconnect;
        if let Some(stale) = s.play.take() {
            s.eq.tap_freed(stale);
            self.free_stream(stale, "play");
        }

        let stream = match open.result {
            Ok(stream) => stream,
            Err(e) => {
                let error = radio::classify(e);
                tracing::warn!(url = %open.url, ?error, "network stream failed: {e}");
                self.radio.clear();
                self.halt(&mut s);
                drop(s);
                self.emit(PlayerEvent::RadioReady {
                    error: Some(error),
                    reconnect,
                });
                return;
            }
        };

        let engine = self.engine.as_ref();
        s.play = Some(stream);
        s.radio_bitrate = radio::estimate_bitrate(engine, stream);
        self.add_sync(
            stream,
            SyncSpec::new(SyncKind::MetaChanged),
            self.callback(Shared::on_radio_meta),
        );
        s.radio_live = engine.file_counter(stream, FileCounter::Size).is_none();
        s.transport = Transport::Playing;
        s.radio = true;

        let error = match self.start_play(&mut s, true, false) {
            Ok(()) => {
                tracing::info!(url = %open.url, kbps = s.radio_bitrate, live = s.radio_live, "radio playing");
                None
            }
            Err(e) => {
                tracing::warn!(url = %open.url, "radio output start failed: {e}");
                self.radio.clear();
                self.halt(&mut s);
                Some(PlayError::Device)
            }
        };
        drop(s);
        self.emit(PlayerEvent::RadioReady { error, reconnect });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::tests::Rig;
    use crate::cue::CueSheet;
    use crate::engine::AudioEngine;
    use crate::engine::memory::{MediaSpec, UrlSpec};
    use crate::tracks::TrackRef;
    use crate::types::{OutputDriver, PlayError, PlaybackState, PlayerEvent};

    fn track_changes(events: &[PlayerEvent]) -> Vec<(bool, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::TrackChanged { stopped, url } => Some((*stopped, *url)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffered_same_format_handoff_is_gapless() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 2.0));
        rig.engine.add_media("b.flac", MediaSpec::new(44_100, 2, 3.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();
        let first = rig.player.streams();

        rig.run(2100);

        let now = rig.player.streams();
        assert_eq!(now.mixer, first.mixer);
        assert_ne!(now.play, first.play);
        assert_eq!(rig.engine.free_count(first.play.unwrap()), 1);
        assert_eq!(rig.engine.mixer_sources(now.mixer.unwrap()), vec![now.play.unwrap()]);
        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);
        assert_eq!(rig.player.status().now_playing.as_deref(), Some("b.flac"));
        assert_eq!(rig.player.time_position(), 0);

        rig.run(3100);
        assert_eq!(track_changes(&rig.drain()), vec![(true, false)]);
        assert!(!rig.player.is_playing());
        assert_eq!(rig.engine.live_streams(), 0);
        assert_eq!(rig.engine.invalid_frees(), 0);
    }

    #[test]
    fn buffered_format_change_rebuilds_mixer() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.0));
        rig.engine.add_media("b.flac", MediaSpec::new(48_000, 2, 2.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();
        let first = rig.player.streams();

        rig.run(1100);

        let now = rig.player.streams();
        assert_ne!(now.mixer, first.mixer);
        assert_eq!(rig.engine.free_count(first.mixer.unwrap()), 1);
        assert_eq!(rig.engine.free_count(first.play.unwrap()), 1);
        assert!(rig.engine.is_playing(now.mixer.unwrap()));
        assert_eq!(rig.engine.volume(now.mixer.unwrap()), Some(1.0));
        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);
    }

    #[test]
    fn cue_tracks_hand_off_inside_one_container() {
        let mut sheet = CueSheet::new();
        let cues = sheet.add_container("album.flac", &[0.0, 4.0, 7.0]);
        let rig = Rig::with_cues(OutputDriver::Buffered, sheet);
        rig.engine.add_media("album.flac", MediaSpec::new(44_100, 2, 10.0));
        rig.tracks.push(TrackRef::cue("album.flac", cues[1]));
        rig.tracks.push(TrackRef::cue("album.flac", cues[2]));

        rig.player.play_file("album.flac", Some(cues[0])).unwrap();
        let play = rig.player.streams().play;
        assert_eq!(rig.player.status().duration_secs, 4.0);

        rig.run(4500);
        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);
        assert_eq!(rig.player.streams().play, play);
        assert_eq!(rig.player.status().duration_secs, 3.0);
        assert!(rig.player.position().abs_diff(16_666) <= 2);

        rig.run(3000);
        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);
        assert_eq!(rig.player.time_position(), 1);

        rig.run(3000);
        assert_eq!(track_changes(&rig.drain()), vec![(true, false)]);
        assert_eq!(rig.player.state(), PlaybackState::Idle);
    }

    #[test]
    fn cue_seek_is_relative_to_the_cut() {
        let mut sheet = CueSheet::new();
        let cues = sheet.add_container("album.flac", &[0.0, 4.0, 7.0]);
        let rig = Rig::with_cues(OutputDriver::Buffered, sheet);
        rig.engine.add_media("album.flac", MediaSpec::new(44_100, 2, 10.0));

        rig.player.play_file("album.flac", Some(cues[1])).unwrap();
        assert_eq!(rig.player.position(), 0);
        rig.player.set_position(50_000);
        assert!(rig.player.position().abs_diff(50_000) <= 2);
        assert_eq!(rig.player.time_position(), 2);

        // the cut ends at 7 s: 1.5 s left
        rig.run(1600);
        assert_eq!(track_changes(&rig.drain()), vec![(true, false)]);
    }

    #[test]
    fn exclusive_output_hands_off_from_pump_preload() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 2.0));
        rig.engine.add_media("b.flac", MediaSpec::new(44_100, 2, 2.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();
        let first = rig.player.streams();

        rig.run(1500);
        assert!(rig.player.streams().preload.is_some());

        rig.run(700);
        let now = rig.player.streams();
        assert_eq!(now.mixer, first.mixer);
        assert_ne!(now.play, first.play);
        assert_eq!(rig.engine.free_count(first.play.unwrap()), 1);
        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);
        assert!(rig.engine.exclusive().is_started());

        rig.run(2500);
        assert_eq!(track_changes(&rig.drain()), vec![(true, false)]);
        assert_eq!(rig.engine.exclusive_format(), None);
        assert_eq!(rig.engine.invalid_frees(), 0);
    }

    #[test]
    fn exclusive_output_reopens_device_on_format_change() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.5));
        rig.engine.add_media("b.flac", MediaSpec::new(96_000, 2, 2.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();
        assert_eq!(rig.engine.exclusive_format().map(|f| f.rate), Some(44_100));

        rig.run(1700);

        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);
        assert_eq!(rig.engine.exclusive_format().map(|f| f.rate), Some(96_000));
        assert_eq!(rig.engine.exclusive_feed(), rig.player.streams().mixer);
    }

    #[test]
    fn exclusive_restart_failure_at_handoff_reports_device() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.5));
        rig.engine.add_media("b.flac", MediaSpec::new(96_000, 2, 2.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();

        rig.run(700);
        rig.engine.fail_init(OutputDriver::ExclusiveEvent, true);
        rig.run(1000);

        let outcome: Vec<_> = rig
            .drain()
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::PlaybackFailed { .. } | PlayerEvent::TrackChanged { .. }))
            .collect();
        assert_eq!(
            outcome,
            vec![
                PlayerEvent::PlaybackFailed {
                    error: PlayError::Device
                },
                PlayerEvent::TrackChanged {
                    stopped: true,
                    url: false
                },
            ]
        );
        assert_eq!(rig.player.state(), PlaybackState::Idle);
        assert_eq!(rig.engine.live_streams(), 0);
        assert_eq!(rig.engine.invalid_frees(), 0);
    }

    #[test]
    fn multichannel_same_format_handoff_keeps_mixer() {
        let rig = Rig::new(OutputDriver::Multichannel);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 2.0));
        rig.engine.add_media("b.flac", MediaSpec::new(44_100, 2, 2.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();
        let first = rig.player.streams();

        rig.run(2200);

        let now = rig.player.streams();
        assert_eq!(now.mixer, first.mixer);
        assert_ne!(now.play, first.play);
        assert_eq!(rig.engine.free_count(first.play.unwrap()), 1);
        assert_eq!(track_changes(&rig.drain()), vec![(false, false)]);

        rig.run(2500);
        assert_eq!(track_changes(&rig.drain()), vec![(true, false)]);
        assert_eq!(rig.engine.live_streams(), 0);
        assert_eq!(rig.engine.invalid_frees(), 0);
    }

    #[test]
    fn missing_next_file_stops_on_pull_output() {
        for driver in [OutputDriver::ExclusiveEvent, OutputDriver::Multichannel] {
            let rig = Rig::new(driver);
            rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.0));
            rig.tracks.push(TrackRef::file("gone.flac"));
            rig.player.play_file("a.flac", None).unwrap();

            rig.run(1500);

            assert_eq!(track_changes(&rig.drain()), vec![(true, false)], "{driver:?}");
            assert_eq!(rig.player.state(), PlaybackState::Idle, "{driver:?}");
            assert_eq!(rig.engine.live_streams(), 0, "{driver:?}");
            assert_eq!(rig.engine.invalid_frees(), 0, "{driver:?}");
        }
    }

    #[test]
    fn missing_next_file_stops_at_track_end() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.0));
        rig.tracks.push(TrackRef::file("gone.flac"));
        rig.player.play_file("a.flac", None).unwrap();

        rig.run(1100);

        assert_eq!(track_changes(&rig.drain()), vec![(true, false)]);
        assert!(rig.tracks.is_empty());
        assert_eq!(rig.engine.live_streams(), 0);
    }

    #[test]
    fn url_entry_switches_to_radio() {
        let rig = Rig::new(OutputDriver::Buffered);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.0));
        rig.engine.add_url("http://radio/live", UrlSpec::live(44_100, 2));
        rig.tracks.push(TrackRef::file("http://radio/live"));
        rig.player.play_file("a.flac", None).unwrap();

        rig.run(1100);
        assert_eq!(
            rig.events.recv_timeout(Duration::from_secs(5)).unwrap(),
            PlayerEvent::TrackChanged {
                stopped: false,
                url: true
            }
        );
        assert_eq!(
            rig.events.recv_timeout(Duration::from_secs(5)).unwrap(),
            PlayerEvent::RadioReady {
                error: None,
                reconnect: false
            }
        );
        assert_eq!(rig.player.state(), PlaybackState::Radio);
    }

    #[test]
    fn explicit_play_discards_staged_preload() {
        let rig = Rig::new(OutputDriver::ExclusiveEvent);
        rig.engine.add_media("a.flac", MediaSpec::new(44_100, 2, 1.5));
        rig.engine.add_media("b.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.engine.add_media("c.flac", MediaSpec::new(44_100, 2, 5.0));
        rig.tracks.push(TrackRef::file("b.flac"));
        rig.player.play_file("a.flac", None).unwrap();
        rig.run(800);
        let staged = rig.player.streams().preload.unwrap();

        rig.player.play_file("c.flac", None).unwrap();

        assert_eq!(rig.engine.free_count(staged), 1);
        assert_eq!(rig.player.streams().preload, None);
        rig.player.free_preload();
        assert_eq!(rig.engine.invalid_frees(), 0);
    }
}
