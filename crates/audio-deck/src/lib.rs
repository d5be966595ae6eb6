//! Playback core of a desktop media player.
//!
//! The crate drives an external [`engine::AudioEngine`] through one of three output
//! backends and keeps a single active stream plus one preloaded successor so tracks
//! change without gaps. See [`player::Player`] for the public surface.

pub mod backend;
pub mod config;
pub mod cue;
pub mod engine;
pub mod equalizer;
pub mod fade;
pub mod player;
pub mod pump;
pub mod radio;
pub mod tracks;

pub use audio_deck_types as types;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
