//! Output backends.
//!
//! The player hides the three output families behind [`OutputBackend`]:
//! - [`BufferedOutput`]: the engine plays a non-decode mixer natively
//! - [`ExclusiveOutput`]: an exclusive-mode device pulls from a decode mixer
//! - [`MultichannelOutput`]: a multichannel device pulls from a decode mixer on a
//!   channel group
//!
//! A backend owns the device, never the streams. Stream lifetimes stay with the
//! player so every handle is freed at exactly one transition point.

mod buffered;
mod exclusive;
mod multichannel;

pub use buffered::BufferedOutput;
pub use exclusive::ExclusiveOutput;
pub use multichannel::MultichannelOutput;

use crate::config::DeckConfig;
use crate::engine::{
    AttachFlags, AudioEngine, ChannelInfo, EngineError, MixerFlags, OpenFlags, StreamHandle,
};
use crate::types::{DeviceSelector, OutputDriver};

/// Devices scanned when resolving the system default.
const DEFAULT_SCAN_LIMIT: u32 = 20;

/// Device-facing half of the playback pipeline.
pub trait OutputBackend: Send {
    fn driver(&self) -> OutputDriver;

    /// Flags for opening file and network decode streams.
    fn open_flags(&self) -> OpenFlags;

    /// Flags for creating the output mixer.
    fn mixer_flags(&self) -> MixerFlags;

    /// Flags for attaching a freshly opened stream to a new mixer.
    fn attach_flags(&self) -> AttachFlags;

    /// Bring the device up for a source of format `source`.
    ///
    /// Returns the format the output mixer must be created with.
    fn prepare(&mut self, engine: &dyn AudioEngine, source: ChannelInfo) -> Result<ChannelInfo, EngineError>;

    /// Route `mixer` to the device.
    fn connect(&mut self, engine: &dyn AudioEngine, mixer: StreamHandle, source: ChannelInfo) -> Result<(), EngineError>;

    /// Start output of `mixer`.
    fn start(&mut self, engine: &dyn AudioEngine, mixer: StreamHandle) -> Result<(), EngineError>;

    /// Halt output, keeping the device open.
    fn pause(&mut self, engine: &dyn AudioEngine, mixer: Option<StreamHandle>);

    /// Stop and close the device. Safe to call when nothing is open.
    fn release(&mut self, engine: &dyn AudioEngine);

    fn is_started(&self, engine: &dyn AudioEngine) -> bool;
}

/// Build the backend for `config.driver`, initializing devices that live for the whole session.
pub fn open_backend(engine: &dyn AudioEngine, config: &DeckConfig) -> Result<Box<dyn OutputBackend>, EngineError> {
    let backend: Box<dyn OutputBackend> = match config.driver {
        OutputDriver::Buffered => Box::new(BufferedOutput::init(engine, config)?),
        OutputDriver::ExclusiveEvent => Box::new(ExclusiveOutput::new(config)),
        OutputDriver::Multichannel => Box::new(MultichannelOutput::new(config)),
    };
    tracing::info!(driver = backend.driver().label(), device = ?config.device, "output backend ready");
    Ok(backend)
}

/// Resolve a device selector to an index, scanning for the default flag.
///
/// Falls back to device 0 when no device claims to be the default.
pub fn resolve_device(engine: &dyn AudioEngine, driver: OutputDriver, selector: DeviceSelector) -> u32 {
    match selector {
        DeviceSelector::Index(index) => index,
        DeviceSelector::Default => (0..DEFAULT_SCAN_LIMIT)
            .find(|i| engine.device_info(driver, *i).is_some_and(|d| d.is_default))
            .unwrap_or_else(|| {
                tracing::debug!(driver = driver.label(), "no default device reported, using 0");
                0
            }),
    }
}

/// Display name of device `index` for `driver`.
///
/// `None` past the end of the list; an empty string for devices the driver cannot
/// use (buffered: disabled or the default alias; exclusive: disabled or input).
pub fn device_name(engine: &dyn AudioEngine, driver: OutputDriver, index: u32) -> Option<String> {
    let info = engine.device_info(driver, index)?;
    let usable = match driver {
        OutputDriver::Buffered => info.enabled && !info.is_default,
        OutputDriver::ExclusiveEvent => info.enabled && !info.is_input,
        OutputDriver::Multichannel => true,
    };
    Some(if usable { info.name.unwrap_or_default() } else { String::new() })
}
