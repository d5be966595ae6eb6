use std::path::PathBuf;

use audio_deck_types::OutputDriver;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "deck", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Player configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output driver, overrides the config file
    #[arg(long, value_enum, global = true)]
    pub driver: Option<DriverArg>,

    /// Output device by enumeration index, overrides the config file
    #[arg(long, global = true)]
    pub device: Option<u32>,

    /// Profile directory holding the equalizer document
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play files or stream urls in order and print the notification timeline
    Play(PlayArgs),

    /// List output devices as each driver sees them
    Devices,

    /// Show or edit the persisted equalizer
    Eq {
        #[command(subcommand)]
        action: EqAction,
    },
}

#[derive(clap::Args, Debug)]
pub struct PlayArgs {
    /// Files or http(s) urls, played in order
    #[arg(required = true)]
    pub tracks: Vec<String>,

    /// Treat the first track as a cue container split at these offsets (seconds)
    #[arg(long, value_delimiter = ',')]
    pub cues: Vec<f64>,

    /// Register every file as virtual stereo 44.1 kHz media of this many seconds
    /// instead of probing it from disk
    #[arg(long)]
    pub virtual_secs: Option<f64>,

    /// Virtual clock step in milliseconds
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,

    /// Sleep one tick between steps instead of running as fast as possible
    #[arg(long)]
    pub realtime: bool,

    /// Stop after this much virtual time (seconds)
    #[arg(long, default_value_t = 3600.0)]
    pub max_secs: f64,

    /// Print a status line every this many virtual seconds (0 disables)
    #[arg(long, default_value_t = 1.0)]
    pub status_secs: f64,

    /// Start with the equalizer enabled
    #[arg(long)]
    pub eq: bool,

    /// Initial volume in 0..=100000
    #[arg(long)]
    pub volume: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum EqAction {
    /// Print the equalizer document as JSON
    Show,

    /// Change settings and write the document back
    Set {
        /// Band gain as INDEX=DB, repeatable
        #[arg(long = "band", value_parser = parse_band)]
        bands: Vec<(usize, f32)>,

        /// Pre-amp level in dB
        #[arg(long)]
        preamp: Option<f32>,

        /// Preset label
        #[arg(long)]
        preset: Option<String>,

        #[arg(long)]
        enable: Option<bool>,
    },

    /// Write the current document (defaults when absent)
    Save,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DriverArg {
    Buffered,
    Exclusive,
    Multichannel,
}

impl From<DriverArg> for OutputDriver {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Buffered => OutputDriver::Buffered,
            DriverArg::Exclusive => OutputDriver::ExclusiveEvent,
            DriverArg::Multichannel => OutputDriver::Multichannel,
        }
    }
}

fn parse_band(raw: &str) -> Result<(usize, f32), String> {
    let (index, gain) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected INDEX=DB, got {raw:?}"))?;
    let index = index
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("band index {index:?}: {e}"))?;
    let gain = gain
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("band gain {gain:?}: {e}"))?;
    Ok((index, gain))
}
