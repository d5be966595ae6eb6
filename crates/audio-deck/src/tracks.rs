//! Playlist collaborator seam.
//!
//! The player never decides what plays next; it asks a [`TrackSource`] when it is
//! time to stage a preload. [`QueueTrackSource`] is a simple FIFO used by the CLI and
//! tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::cue::CueId;
use crate::lock;

/// Next playlist entry: a file path or network URL, optionally a cue sub-track.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub path: String,
    #[serde(default)]
    pub cue: Option<CueId>,
}

impl TrackRef {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cue: None,
        }
    }

    pub fn cue(path: impl Into<String>, cue: CueId) -> Self {
        Self {
            path: path.into(),
            cue: Some(cue),
        }
    }

    pub fn is_url(&self) -> bool {
        is_url(&self.path)
    }
}

/// Whether `path` names a network stream rather than a local file.
pub fn is_url(path: &str) -> bool {
    let Some((scheme, rest)) = path.split_once("://") else {
        return false;
    };
    !rest.is_empty()
        && matches!(
            scheme.to_ascii_lowercase().as_str(),
            "http" | "https" | "ftp" | "mms"
        )
}

/// Supplies the track after the current one.
///
/// Called from engine callback threads and the buffer pump worker, so
/// implementations must not block on the player.
pub trait TrackSource: Send + Sync {
    /// Advance the cursor and return the next entry, `None` at the end of the list.
    fn next_track(&self) -> Option<TrackRef>;
}

/// FIFO playlist.
#[derive(Debug, Default)]
pub struct QueueTrackSource {
    queue: Mutex<VecDeque<TrackRef>>,
}

impl QueueTrackSource {
    pub fn new(tracks: impl IntoIterator<Item = TrackRef>) -> Self {
        Self {
            queue: Mutex::new(tracks.into_iter().collect()),
        }
    }

    pub fn push(&self, track: TrackRef) {
        lock(&self.queue).push_back(track);
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.queue).clear();
    }
}

impl TrackSource for QueueTrackSource {
    fn next_track(&self) -> Option<TrackRef> {
        lock(&self.queue).pop_front()
    }
}
