//! Exclusive-mode pull output.
//!
//! The device is reopened whenever the source format changes, and the format it
//! grants decides the mixer format; the mixer resamples anything else.

use crate::config::DeckConfig;
use crate::engine::{
    AttachFlags, AudioEngine, ChannelInfo, EngineError, MixerFlags, OpenFlags, StreamHandle,
};
use crate::types::{DeviceSelector, OutputDriver};

use super::{OutputBackend, resolve_device};

#[derive(Debug)]
pub struct ExclusiveOutput {
    device: DeviceSelector,
    event_driven: bool,
}

impl ExclusiveOutput {
    pub fn new(config: &DeckConfig) -> Self {
        Self {
            device: config.device,
            event_driven: config.exclusive_event,
        }
    }
}

impl OutputBackend for ExclusiveOutput {
    fn driver(&self) -> OutputDriver {
        OutputDriver::ExclusiveEvent
    }

    fn open_flags(&self) -> OpenFlags {
        OpenFlags {
            decode: true,
            float: true,
            software: false,
        }
    }

    fn mixer_flags(&self) -> MixerFlags {
        MixerFlags {
            decode: true,
            float: true,
            end_when_drained: true,
        }
    }

    fn attach_flags(&self) -> AttachFlags {
        AttachFlags {
            no_ramp_in: false,
            downmix: true,
        }
    }

    fn prepare(&mut self, engine: &dyn AudioEngine, source: ChannelInfo) -> Result<ChannelInfo, EngineError> {
        let device = engine.exclusive();
        device.set_feed(None);
        device.free();
        let index = resolve_device(engine, OutputDriver::ExclusiveEvent, self.device);
        let granted = device
            .init(index, source.rate, source.channels, self.event_driven)
            .inspect_err(|e| tracing::warn!(device = index, rate_hz = source.rate, "exclusive init failed: {e}"))?;
        tracing::info!(
            device = index,
            rate_hz = granted.rate,
            channels = granted.channels,
            event = self.event_driven,
            "exclusive output opened"
        );
        Ok(granted)
    }

    fn connect(&mut self, engine: &dyn AudioEngine, mixer: StreamHandle, _source: ChannelInfo) -> Result<(), EngineError> {
        engine.exclusive().set_feed(Some(mixer));
        Ok(())
    }

    fn start(&mut self, engine: &dyn AudioEngine, _mixer: StreamHandle) -> Result<(), EngineError> {
        engine.exclusive().start()
    }

    fn pause(&mut self, engine: &dyn AudioEngine, _mixer: Option<StreamHandle>) {
        if let Err(e) = engine.exclusive().stop(true) {
            tracing::debug!("exclusive stop: {e}");
        }
    }

    fn release(&mut self, engine: &dyn AudioEngine) {
        let device = engine.exclusive();
        if let Err(e) = device.stop(true) {
            tracing::debug!("exclusive stop on release: {e}");
        }
        device.set_feed(None);
        device.free();
    }

    fn is_started(&self, engine: &dyn AudioEngine) -> bool {
        engine.exclusive().is_started()
    }
}
