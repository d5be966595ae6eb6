//! Buffered push-model output.

use crate::config::DeckConfig;
use crate::engine::{
    AttachFlags, AudioEngine, ChannelInfo, EngineError, MixerFlags, OpenFlags, StreamHandle,
};
use crate::types::{DeviceSelector, OutputDriver};

use super::OutputBackend;

/// Rate the buffered device is opened at; mixers resample to it.
const DEVICE_RATE: u32 = 44_100;

/// The engine plays a non-decode mixer wrapping the decode stream.
#[derive(Debug)]
pub struct BufferedOutput {
    float: bool,
    software: bool,
}

impl BufferedOutput {
    /// Open the device. Index 0 is the "no sound" device and is refused.
    pub fn init(engine: &dyn AudioEngine, config: &DeckConfig) -> Result<Self, EngineError> {
        let device = match config.device {
            DeviceSelector::Index(0) => {
                tracing::warn!("buffered output cannot use the no-sound device");
                return Err(EngineError::Init);
            }
            DeviceSelector::Index(i) => Some(i),
            DeviceSelector::Default => None,
        };
        engine
            .buffered()
            .init(device, DEVICE_RATE, config.window, config.device_buffer_ms)?;

        let float = config.float_output && engine.buffered().supports_float();
        if config.float_output && !float {
            tracing::info!("device refuses float output, using 16-bit");
        }
        Ok(Self {
            float,
            software: config.software_mixing,
        })
    }
}

impl OutputBackend for BufferedOutput {
    fn driver(&self) -> OutputDriver {
        OutputDriver::Buffered
    }

    fn open_flags(&self) -> OpenFlags {
        OpenFlags {
            decode: true,
            float: self.float,
            software: self.software,
        }
    }

    fn mixer_flags(&self) -> MixerFlags {
        MixerFlags {
            decode: false,
            float: self.float,
            end_when_drained: true,
        }
    }

    fn attach_flags(&self) -> AttachFlags {
        AttachFlags::default()
    }

    fn prepare(&mut self, _engine: &dyn AudioEngine, source: ChannelInfo) -> Result<ChannelInfo, EngineError> {
        Ok(source)
    }

    fn connect(&mut self, _engine: &dyn AudioEngine, _mixer: StreamHandle, _source: ChannelInfo) -> Result<(), EngineError> {
        Ok(())
    }

    fn start(&mut self, engine: &dyn AudioEngine, mixer: StreamHandle) -> Result<(), EngineError> {
        engine.play(mixer)
    }

    fn pause(&mut self, engine: &dyn AudioEngine, mixer: Option<StreamHandle>) {
        if let Some(mixer) = mixer {
            if let Err(e) = engine.pause(mixer) {
                tracing::debug!(mixer = %mixer, "pause: {e}");
            }
        }
    }

    fn release(&mut self, _engine: &dyn AudioEngine) {}

    fn is_started(&self, _engine: &dyn AudioEngine) -> bool {
        true
    }
}
