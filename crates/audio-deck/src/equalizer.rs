//! Ten-band equalizer controller and its persisted document.
//!
//! The equalizer is a chain of engine effects on the output tap: one volume effect
//! acting as pre-amplifier plus ten parametric bands. Effect handles die with the
//! tap stream, so [`Equalizer::apply`] rebuilds the chain every time a new tap is
//! created.
//!
//! Settings persist as a small XML document:
//!
//! ```xml
//! <Equalizer Enable="1" Preset="Rock">
//!   <Preamp Gain="-2.0"/>
//!   <Band01 Gain="3.5"/>
//!   ...
//!   <Band10 Gain="0.0"/>
//! </Equalizer>
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use roxmltree::Document;
use serde::{Deserialize, Serialize};

use crate::engine::{AudioEngine, EffectKind, EffectParams, FxHandle, StreamHandle};

pub const BAND_COUNT: usize = 10;

/// Band centre frequencies in Hz.
pub const BAND_FREQUENCIES: [f32; BAND_COUNT] = [
    31.5, 63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// Wide bands for a musical rather than surgical character.
pub const BANDWIDTH_SEMITONES: f32 = 18.0;

const PREAMP_PRIORITY: i32 = 0;
const FIRST_BAND_PRIORITY: i32 = 2;

/// Linear gain for a pre-amp level in dB.
pub fn preamp_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Persisted equalizer settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EqualizerSettings {
    pub enabled: bool,
    /// Display-only preset label.
    pub preset: String,
    pub preamp_db: f32,
    pub gains_db: [f32; BAND_COUNT],
}

impl EqualizerSettings {
    /// Render the XML document. Gains keep one decimal place.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<Equalizer Enable=\"{}\" Preset=\"{}\">\n",
            u8::from(self.enabled),
            escape_xml(&self.preset)
        ));
        out.push_str(&format!("  <Preamp Gain=\"{:.1}\"/>\n", self.preamp_db));
        for (i, gain) in self.gains_db.iter().enumerate() {
            out.push_str(&format!("  <Band{:02} Gain=\"{:.1}\"/>\n", i + 1, gain));
        }
        out.push_str("</Equalizer>\n");
        out
    }

    /// Parse the XML document. Missing or malformed gains read as 0 dB.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).context("parse equalizer document")?;
        let root = doc.root_element();
        if root.tag_name().name() != "Equalizer" {
            bail!("missing Equalizer element, found {:?}", root.tag_name().name());
        }
        let gain_of = |name: &str| -> f32 {
            root.children()
                .find(|n| n.is_element() && n.tag_name().name() == name)
                .and_then(|n| n.attribute("Gain"))
                .and_then(|g| g.trim().parse().ok())
                .unwrap_or(0.0)
        };
        let mut gains_db = [0.0; BAND_COUNT];
        for (i, gain) in gains_db.iter_mut().enumerate() {
            *gain = gain_of(&format!("Band{:02}", i + 1));
        }
        Ok(Self {
            enabled: root
                .attribute("Enable")
                .and_then(|v| v.trim().parse::<i32>().ok())
                .is_some_and(|v| v != 0),
            preset: root.attribute("Preset").unwrap_or_default().to_string(),
            preamp_db: gain_of("Preamp"),
            gains_db,
        })
    }

    /// Write the document, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
        }
        std::fs::write(path, self.to_xml()).with_context(|| format!("write equalizer {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read equalizer {:?}", path))?;
        Self::from_xml(&raw).with_context(|| format!("load equalizer {:?}", path))
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Output tap candidates, preferred first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Taps {
    pub primary: Option<StreamHandle>,
    pub fallback: Option<StreamHandle>,
}

/// Equalizer settings plus the live effect chain.
#[derive(Debug, Default)]
pub struct Equalizer {
    settings: EqualizerSettings,
    tap: Option<StreamHandle>,
    preamp_fx: Option<FxHandle>,
    band_fx: [Option<FxHandle>; BAND_COUNT],
}

impl Equalizer {
    pub fn new(settings: EqualizerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &EqualizerSettings {
        &self.settings
    }

    /// Replace the stored settings without touching the live chain.
    pub fn replace_settings(&mut self, settings: EqualizerSettings) {
        self.settings = settings;
    }

    pub fn set_preset(&mut self, name: &str) {
        self.settings.preset = name.to_string();
    }

    /// Stream carrying the live chain, if any.
    pub fn tap(&self) -> Option<StreamHandle> {
        self.tap
    }

    /// Live band handles, `None` for inactive bands.
    pub fn band_handles(&self) -> [Option<FxHandle>; BAND_COUNT] {
        self.band_fx
    }

    pub fn preamp_handle(&self) -> Option<FxHandle> {
        self.preamp_fx
    }

    /// Store the enable flag; while playing, build or tear down the chain.
    pub fn set_enabled(&mut self, engine: &dyn AudioEngine, enable: bool, playing: bool, taps: Taps) {
        self.settings.enabled = enable;
        if !playing {
            return;
        }
        if enable {
            self.apply(engine, taps);
        } else {
            self.detach(engine);
        }
    }

    /// Store a band gain and push it to the live band.
    ///
    /// Returns `false` for an out-of-range index.
    pub fn set_band(&mut self, engine: &dyn AudioEngine, index: usize, gain_db: f32, playing: bool) -> bool {
        if index >= BAND_COUNT {
            tracing::warn!(index, "equalizer band out of range");
            return false;
        }
        self.settings.gains_db[index] = gain_db;
        if playing {
            self.push_band(engine, index);
        }
        true
    }

    /// Store the pre-amp level and push it to the live pre-amp.
    pub fn set_preamp(&mut self, engine: &dyn AudioEngine, db: f32, playing: bool) {
        self.settings.preamp_db = db;
        if playing {
            self.push_preamp(engine);
        }
    }

    /// Rebuild the chain on the current tap and push every stored value.
    ///
    /// Does nothing while disabled.
    pub fn apply(&mut self, engine: &dyn AudioEngine, taps: Taps) {
        if !self.settings.enabled {
            return;
        }
        self.detach(engine);
        let Some(tap) = pick_tap(engine, taps) else {
            tracing::warn!("equalizer has no tap stream");
            return;
        };
        self.tap = Some(tap);

        self.preamp_fx = engine
            .add_effect(tap, EffectKind::Volume, PREAMP_PRIORITY)
            .inspect_err(|e| tracing::warn!(tap = %tap, "equalizer pre-amp not created: {e}"))
            .ok();
        let mut failed = 0;
        for (i, slot) in self.band_fx.iter_mut().enumerate() {
            *slot = engine
                .add_effect(tap, EffectKind::ParamEq, FIRST_BAND_PRIORITY + i as i32)
                .inspect_err(|e| {
                    tracing::warn!(band = i, hz = BAND_FREQUENCIES[i], "equalizer band not created: {e}")
                })
                .ok();
            if slot.is_none() {
                failed += 1;
            }
        }
        tracing::debug!(tap = %tap, failed, "equalizer chain attached");

        self.push_preamp(engine);
        for i in 0..BAND_COUNT {
            self.push_band(engine, i);
        }
    }

    /// Remove every live effect from the tap. Safe when nothing is attached.
    pub fn detach(&mut self, engine: &dyn AudioEngine) {
        let Some(tap) = self.tap.take() else {
            self.forget();
            return;
        };
        let handles = self.preamp_fx.take().into_iter().chain(self.band_fx.iter_mut().filter_map(Option::take));
        for fx in handles {
            if let Err(e) = engine.remove_effect(tap, fx) {
                tracing::debug!(tap = %tap, "remove equalizer effect: {e}");
            }
        }
    }

    /// Drop handles whose tap stream is gone.
    pub fn forget(&mut self) {
        self.tap = None;
        self.preamp_fx = None;
        self.band_fx = [None; BAND_COUNT];
    }

    /// Forget handles if `stream` was the tap.
    pub fn tap_freed(&mut self, stream: StreamHandle) {
        if self.tap == Some(stream) {
            self.forget();
        }
    }

    fn push_band(&self, engine: &dyn AudioEngine, index: usize) {
        let Some(fx) = self.band_fx[index] else {
            tracing::warn!(band = index, "equalizer band not initialized");
            return;
        };
        let params = EffectParams::ParamEq {
            center_hz: BAND_FREQUENCIES[index],
            bandwidth_semitones: BANDWIDTH_SEMITONES,
            gain_db: self.settings.gains_db[index],
        };
        if let Err(e) = engine.set_effect_params(fx, params) {
            tracing::warn!(band = index, "equalizer band update failed: {e}");
        }
    }

    fn push_preamp(&self, engine: &dyn AudioEngine) {
        let Some(fx) = self.preamp_fx else {
            tracing::warn!("equalizer pre-amp not initialized");
            return;
        };
        let params = EffectParams::Volume {
            gain: preamp_gain(self.settings.preamp_db),
        };
        if let Err(e) = engine.set_effect_params(fx, params) {
            tracing::warn!("equalizer pre-amp update failed: {e}");
        }
    }
}

/// Primary tap when it is a live stream, otherwise the fallback.
fn pick_tap(engine: &dyn AudioEngine, taps: Taps) -> Option<StreamHandle> {
    if let Some(primary) = taps.primary {
        if engine.channel_info(primary).is_ok() {
            return Some(primary);
        }
    }
    if taps.fallback.is_some() {
        tracing::warn!(primary = ?taps.primary, fallback = ?taps.fallback, "equalizer tap invalid, using fallback");
    }
    taps.fallback
}
