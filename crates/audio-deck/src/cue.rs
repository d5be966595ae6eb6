//! Cue sheet sub-tracks.
//!
//! A cue reference names a byte range inside a shared container file. The player
//! only needs three facts about it: where the range starts, whether it has a fixed
//! length, and whether another reference continues it directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Opaque cue sub-track id. `None` in an `Option<CueId>` means "whole file".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CueId(pub u64);

/// Location of a sub-track inside its container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CueSpan {
    /// Start of the sub-track, seconds from the container start.
    pub offset_secs: f64,
    /// Fixed length; `None` plays to the end of the container.
    pub length_secs: Option<f64>,
}

/// Resolves cue references. Implementations must be cheap and side-effect free.
pub trait CueLocator: Send + Sync {
    /// Span of `cue`. Unknown references resolve to an open-ended span at offset 0.
    fn locate(&self, cue: CueId) -> CueSpan;

    /// Whether `candidate` starts exactly where `current` ends in the same container.
    fn is_next(&self, current: CueId, candidate: CueId) -> bool;
}

#[derive(Clone, Debug, PartialEq)]
struct CueEntry {
    container: PathBuf,
    index: usize,
    span: CueSpan,
}

/// In-memory cue sheet registry.
///
/// Tracks are added per container in play order; lengths are derived from the next
/// track's offset, and the last track of a container plays to the end of the file.
#[derive(Debug, Default)]
pub struct CueSheet {
    next_id: u64,
    entries: HashMap<CueId, CueEntry>,
}

impl CueSheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container and the start offsets of its tracks, in order.
    ///
    /// Returns one id per offset.
    pub fn add_container(&mut self, container: impl AsRef<Path>, offsets: &[f64]) -> Vec<CueId> {
        let container = container.as_ref().to_path_buf();
        let mut ids = Vec::with_capacity(offsets.len());
        for (index, offset) in offsets.iter().enumerate() {
            self.next_id += 1;
            let id = CueId(self.next_id);
            let length_secs = offsets.get(index + 1).map(|next| (next - offset).max(0.0));
            self.entries.insert(
                id,
                CueEntry {
                    container: container.clone(),
                    index,
                    span: CueSpan {
                        offset_secs: *offset,
                        length_secs,
                    },
                },
            );
            ids.push(id);
        }
        ids
    }

    /// Container file of `cue`, if registered.
    pub fn container(&self, cue: CueId) -> Option<&Path> {
        self.entries.get(&cue).map(|e| e.container.as_path())
    }
}

impl CueLocator for CueSheet {
    fn locate(&self, cue: CueId) -> CueSpan {
        self.entries.get(&cue).map(|e| e.span).unwrap_or_default()
    }

    fn is_next(&self, current: CueId, candidate: CueId) -> bool {
        match (self.entries.get(&current), self.entries.get(&candidate)) {
            (Some(a), Some(b)) => a.container == b.container && b.index == a.index + 1,
            _ => false,
        }
    }
}
