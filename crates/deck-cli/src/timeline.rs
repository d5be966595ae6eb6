//! Virtual-clock playback session.
//!
//! Drives a [`Player`] over the in-process engine one tick at a time and writes every
//! notification and periodic status snapshot as one JSON object per line.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use audio_deck::config::DeckConfig;
use audio_deck::cue::{CueId, CueSheet};
use audio_deck::engine::memory::{MediaSpec, MemoryEngine, UrlSpec};
use audio_deck::player::Player;
use audio_deck::tracks::{QueueTrackSource, TrackRef, is_url};
use audio_deck_types::PlayerEvent;
use serde_json::json;

use crate::cli::PlayArgs;

/// Playlist built from the command line.
pub struct Playlist {
    pub first: TrackRef,
    pub rest: Vec<TrackRef>,
    pub cues: CueSheet,
}

impl Playlist {
    /// Split the first track into cues when offsets are given.
    pub fn build(tracks: &[String], cue_offsets: &[f64]) -> Result<Self> {
        let mut cues = CueSheet::new();
        let mut refs: Vec<TrackRef> = Vec::new();
        for (i, path) in tracks.iter().enumerate() {
            if i == 0 && !cue_offsets.is_empty() {
                if is_url(path) {
                    return Err(anyhow!("cue offsets need a file, got url {path}"));
                }
                let ids: Vec<CueId> = cues.add_container(path, cue_offsets);
                refs.extend(ids.into_iter().map(|id| TrackRef::cue(path.clone(), id)));
            } else {
                refs.push(TrackRef::file(path.clone()));
            }
        }
        let mut refs = refs.into_iter();
        let first = refs.next().context("no tracks given")?;
        Ok(Self {
            first,
            rest: refs.collect(),
            cues,
        })
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finish {
    EndOfList,
    Failed,
    Interrupted,
    TimeLimit,
}

/// Register urls as endless streams and, with `virtual_secs`, files as virtual media.
pub fn register_media(engine: &MemoryEngine, tracks: &[String], virtual_secs: Option<f64>) {
    for path in tracks {
        if is_url(path) {
            engine.add_url(path.clone(), UrlSpec::live(44_100, 2));
        } else if let Some(secs) = virtual_secs {
            engine.add_media(path.clone(), MediaSpec::new(44_100, 2, secs));
        }
    }
}

/// Run one playlist to completion, writing the timeline to `out`.
pub fn run(
    engine: Arc<MemoryEngine>,
    config: DeckConfig,
    args: &PlayArgs,
    interrupted: &AtomicBool,
    out: &mut dyn Write,
) -> Result<Finish> {
    let playlist = Playlist::build(&args.tracks, &args.cues)?;
    let tracks = Arc::new(QueueTrackSource::new(playlist.rest));
    let stop_fade_ms = u64::from(config.fades.stop_ms);
    let player = Player::init(engine.clone(), config, tracks, Arc::new(playlist.cues))
        .map_err(|e| anyhow!("player init: {e}"))?;
    let events = player.events();

    if args.eq {
        player.enable_eq(true);
    }
    if let Some(volume) = args.volume {
        player.set_volume(volume);
    }

    let first = &playlist.first;
    if first.is_url() {
        player.play_url(&first.path, false);
    } else {
        player
            .play_file(&first.path, first.cue)
            .map_err(|e| anyhow!("play {}: {e}", first.path))?;
    }
    tracing::info!(track = %first.path, driver = player.driver().label(), "playback started");

    let tick_ms = args.tick_ms.max(1);
    let max_ms = (args.max_secs * 1000.0) as u64;
    let status_ms = (args.status_secs * 1000.0) as u64;
    let mut next_status = status_ms;
    let mut stop_deadline: Option<u64> = None;

    let finish = loop {
        if stop_deadline.is_none() && interrupted.load(Ordering::SeqCst) {
            tracing::info!("interrupted, stopping");
            player.stop();
            stop_deadline = Some(engine.clock_ms() + stop_fade_ms + tick_ms);
        }

        engine.advance(tick_ms);
        player.service_buffers();
        let now = engine.clock_ms();

        let mut ended = None;
        for event in events.try_iter() {
            writeln!(out, "{}", json!({ "at_ms": now, "notify": &event }))?;
            match event {
                PlayerEvent::TrackChanged { stopped: true, .. } => ended = Some(Finish::EndOfList),
                PlayerEvent::PlaybackFailed { .. } => ended = Some(Finish::Failed),
                PlayerEvent::RadioReady { error: Some(_), .. } => ended = Some(Finish::Failed),
                _ => {}
            }
        }
        if let Some(finish) = ended {
            break finish;
        }

        if status_ms > 0 && now >= next_status {
            writeln!(out, "{}", json!({ "at_ms": now, "status": player.status() }))?;
            next_status = now + status_ms;
        }

        if let Some(deadline) = stop_deadline {
            if now >= deadline {
                break Finish::Interrupted;
            }
        }
        if now >= max_ms {
            break Finish::TimeLimit;
        }
        if args.realtime {
            std::thread::sleep(Duration::from_millis(tick_ms));
        }
    };

    writeln!(out, "{}", json!({ "at_ms": engine.clock_ms(), "status": player.status() }))?;
    out.flush()?;
    player.shutdown();
    tracing::info!(?finish, live_streams = engine.live_streams(), "session finished");
    Ok(finish)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_deck_types::OutputDriver;
    use clap::Parser;

    use crate::cli::{Args, Command};

    fn play_args(argv: &[&str]) -> PlayArgs {
        let mut full = vec!["deck", "play"];
        full.extend_from_slice(argv);
        match Args::parse_from(full).cmd {
            Command::Play(play) => play,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn lines(out: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn notifications(lines: &[serde_json::Value]) -> Vec<serde_json::Value> {
        lines.iter().filter_map(|l| l.get("notify").cloned()).collect()
    }

    #[test]
    fn playlist_splits_first_track_into_cues() {
        let playlist = Playlist::build(&["album.flac".into(), "b.flac".into()], &[0.0, 120.0]).unwrap();
        assert_eq!(playlist.first.path, "album.flac");
        assert!(playlist.first.cue.is_some());
        assert_eq!(playlist.rest.len(), 2);
        assert!(playlist.rest[0].cue.is_some());
        assert_eq!(playlist.rest[1], TrackRef::file("b.flac"));

        assert!(Playlist::build(&["http://radio".into()], &[0.0]).is_err());
    }

    #[test]
    fn virtual_playlist_runs_to_end_of_list() {
        let engine = Arc::new(MemoryEngine::new());
        let args = play_args(&["a.flac", "b.flac", "--virtual-secs", "2", "--status-secs", "0"]);
        register_media(&engine, &args.tracks, args.virtual_secs);

        let mut out = Vec::new();
        let finish = run(engine.clone(), DeckConfig::default(), &args, &AtomicBool::new(false), &mut out).unwrap();

        assert_eq!(finish, Finish::EndOfList);
        let notes = notifications(&lines(&out));
        let changes: Vec<_> = notes.iter().filter(|n| n["event"] == "track_changed").collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["stopped"], false);
        assert_eq!(changes[1]["stopped"], true);
        assert!(engine.clock_ms() >= 4000);
        assert_eq!(engine.live_streams(), 0);
    }

    #[test]
    fn interrupt_stops_with_fade_and_reports_idle() {
        let engine = Arc::new(MemoryEngine::new());
        let args = play_args(&["long.flac", "--virtual-secs", "60", "--status-secs", "0"]);
        register_media(&engine, &args.tracks, args.virtual_secs);

        let mut out = Vec::new();
        let finish = run(engine.clone(), DeckConfig::default(), &args, &AtomicBool::new(true), &mut out).unwrap();

        assert_eq!(finish, Finish::Interrupted);
        let all = lines(&out);
        let last = all.last().unwrap();
        assert_eq!(last["status"]["state"], "idle");
        assert!(engine.clock_ms() < 2000);
        assert_eq!(engine.live_streams(), 0);
    }

    #[test]
    fn time_limit_ends_endless_radio() {
        let engine = Arc::new(MemoryEngine::new());
        let args = play_args(&["http://radio.example/stream", "--max-secs", "1", "--status-secs", "0"]);
        register_media(&engine, &args.tracks, args.virtual_secs);
        let config = DeckConfig {
            driver: OutputDriver::Multichannel,
            ..DeckConfig::default()
        };

        let mut out = Vec::new();
        let finish = run(engine.clone(), config, &args, &AtomicBool::new(false), &mut out).unwrap();

        assert_eq!(finish, Finish::TimeLimit);
        assert_eq!(engine.live_streams(), 0);
    }

    #[test]
    fn missing_file_is_reported() {
        let engine = Arc::new(MemoryEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.flac").to_string_lossy().into_owned();
        let args = play_args(&[path.as_str()]);

        let err = run(engine, DeckConfig::default(), &args, &AtomicBool::new(false), &mut Vec::new())
            .unwrap_err();
        assert!(format!("{err:#}").contains("absent.flac"));
    }
}
