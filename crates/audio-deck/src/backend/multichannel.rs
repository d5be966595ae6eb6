//! Multichannel low-latency pull output.
//!
//! The device stays open across tracks; each new mixer is routed to a channel
//! group starting at the configured first channel. Mono sources are mirrored onto
//! the next channel, wider sources join the following channels to the first one.

use crate::config::DeckConfig;
use crate::engine::{
    AttachFlags, AudioEngine, ChannelInfo, EngineError, MixerFlags, OpenFlags, StreamHandle,
};
use crate::types::{DeviceSelector, OutputDriver};

use super::{OutputBackend, resolve_device};

/// Device rates tried after the source rate is refused.
const FALLBACK_RATES: [u32; 2] = [48_000, 44_100];

#[derive(Debug)]
pub struct MultichannelOutput {
    device: DeviceSelector,
    first_channel: u32,
}

impl MultichannelOutput {
    pub fn new(config: &DeckConfig) -> Self {
        Self {
            device: config.device,
            first_channel: config.first_channel,
        }
    }

    /// Negotiate the device rate: source rate, then the fallback ladder.
    fn negotiate_rate(&self, engine: &dyn AudioEngine, source_rate: u32) -> Option<u32> {
        let device = engine.multichannel();
        std::iter::once(source_rate)
            .chain(FALLBACK_RATES)
            .find(|rate| device.set_rate(*rate).is_ok())
    }
}

impl OutputBackend for MultichannelOutput {
    fn driver(&self) -> OutputDriver {
        OutputDriver::Multichannel
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
        AttachFlags::default()
    }

    fn prepare(&mut self, _engine: &dyn AudioEngine, source: ChannelInfo) -> Result<ChannelInfo, EngineError> {
        Ok(source)
    }

    fn connect(&mut self, engine: &dyn AudioEngine, mixer: StreamHandle, source: ChannelInfo) -> Result<(), EngineError> {
        let device = engine.multichannel();
        match device.stop() {
            Ok(()) => {}
            Err(EngineError::Init) => {
                let index = resolve_device(engine, OutputDriver::Multichannel, self.device);
                device
                    .init(index)
                    .inspect_err(|e| tracing::warn!(device = index, "multichannel init failed: {e}"))?;
                tracing::info!(device = index, "multichannel output opened");
            }
            Err(e) => tracing::debug!("multichannel stop: {e}"),
        }

        let first = self.first_channel;
        device.reset_channels();
        device.enable_channel(first, mixer)?;
        if source.channels == 1 {
            device.mirror_channel(first + 1, first)?;
        } else {
            for channel in first + 1..first + u32::from(source.channels) {
                device.join_channel(channel, first)?;
            }
        }
        device.set_channel_float(first)?;
        device.set_channel_rate(first, source.rate)?;

        match self.negotiate_rate(engine, source.rate) {
            Some(rate) if rate != source.rate => {
                tracing::info!(source_hz = source.rate, device_hz = rate, "device rate fallback")
            }
            Some(_) => {}
            None => tracing::warn!(source_hz = source.rate, "device refused every rate, keeping current"),
        }
        Ok(())
    }

    fn start(&mut self, engine: &dyn AudioEngine, _mixer: StreamHandle) -> Result<(), EngineError> {
        engine.multichannel().start()
    }

    fn pause(&mut self, engine: &dyn AudioEngine, _mixer: Option<StreamHandle>) {
        if let Err(e) = engine.multichannel().stop() {
            tracing::debug!("multichannel stop: {e}");
        }
    }

    fn release(&mut self, engine: &dyn AudioEngine) {
        let device = engine.multichannel();
        if let Err(e) = device.stop() {
            tracing::debug!("multichannel stop on release: {e}");
        }
        device.free();
    }

    fn is_started(&self, engine: &dyn AudioEngine) -> bool {
        engine.multichannel().is_started()
    }
}
