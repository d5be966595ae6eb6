//! Volume policy and fade timing.
//!
//! The player applies volume to one tap stream: the mixer on buffered output and
//! the decode stream on pull-model output. [`VolumePolicy`] tracks what the user asked
//! for separately from what is actually applied, so mute and external-volume modes
//! can override the applied level without losing the requested one.

use serde::{Deserialize, Serialize};

/// Fade durations in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeTimes {
    /// Pause and resume.
    pub pause_ms: u32,
    pub stop_ms: u32,
    /// Fade-out of the old output on seek or track switch, and the fade-in after it.
    pub position_ms: u32,
    pub mute_ms: u32,
}

impl Default for FadeTimes {
    fn default() -> Self {
        Self {
            pause_ms: 500,
            stop_ms: 500,
            position_ms: 500,
            mute_ms: 100,
        }
    }
}

/// Requested vs applied volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumePolicy {
    requested: f32,
    real: f32,
    muted: bool,
    no_volume: bool,
    no_effect: bool,
}

impl Default for VolumePolicy {
    fn default() -> Self {
        Self {
            requested: 1.0,
            real: 1.0,
            muted: false,
            no_volume: false,
            no_effect: false,
        }
    }
}

/// Full scale of the public volume value.
pub const VOLUME_SCALE: u32 = 100_000;

impl VolumePolicy {
    /// Level currently applied to the tap.
    pub fn real(&self) -> f32 {
        self.real
    }

    /// Requested level on the public `0..=100000` scale.
    pub fn requested(&self) -> u32 {
        (self.requested * VOLUME_SCALE as f32).round() as u32
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Whether pause/stop/mute/seek fades are enabled.
    pub fn fades_enabled(&self) -> bool {
        !self.no_effect
    }

    /// Store a new requested level. Returns the level to apply, if any.
    pub fn set_requested(&mut self, volume: u32) -> Option<f32> {
        self.requested = volume.min(VOLUME_SCALE) as f32 / VOLUME_SCALE as f32;
        if self.no_volume || self.muted {
            return None;
        }
        self.real = self.requested;
        Some(self.real)
    }

    /// Toggle mute. Returns the slide target, `None` under external volume control.
    pub fn set_muted(&mut self, muted: bool) -> Option<f32> {
        self.muted = muted;
        if self.no_volume {
            return None;
        }
        self.real = if muted { 0.0 } else { self.requested };
        Some(self.real)
    }

    /// Switch external-volume mode.
    ///
    /// Only pull-model drivers honour the flags; on buffered output `reset` clears
    /// both flags and restores the requested level.
    pub fn set_external(&mut self, pull_model: bool, no_volume: bool, no_effect: bool, reset: bool) {
        if pull_model {
            self.no_volume = no_volume;
            self.no_effect = no_effect;
            if no_volume {
                self.real = 1.0;
            }
        } else if reset {
            self.no_volume = false;
            self.no_effect = false;
            self.real = self.requested;
        }
    }
}
