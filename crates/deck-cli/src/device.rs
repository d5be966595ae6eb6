//! Host device discovery.
//!
//! The in-process engine reports whatever device lists it is given, so the CLI seeds it
//! from CPAL:
//! - buffered output gets the "No sound" device, the default alias, then every output
//! - exclusive output sees inputs and outputs, with the host default flagged
//! - multichannel output sees every output

use anyhow::{Context, Result};
use audio_deck::engine::DeviceInfo;
use audio_deck::engine::memory::MemoryEngine;
use audio_deck_types::OutputDriver;
use cpal::traits::{DeviceTrait, HostTrait};

/// Device names reported by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostDevices {
    pub outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub default_output: Option<String>,
}

impl HostDevices {
    pub fn probe(host: &cpal::Host) -> Result<Self> {
        let mut outputs = Vec::new();
        for d in host.output_devices().context("No output devices")? {
            outputs.push(d.description()?.to_string());
        }
        let mut inputs = Vec::new();
        match host.input_devices() {
            Ok(devices) => {
                for d in devices {
                    inputs.push(d.description()?.to_string());
                }
            }
            Err(e) => tracing::debug!("input devices unavailable: {e}"),
        }
        let default_output = host
            .default_output_device()
            .and_then(|d| d.description().ok().map(|desc| desc.to_string()));
        Ok(Self {
            outputs,
            inputs,
            default_output,
        })
    }

    /// Device lists per driver.
    pub fn lists(&self) -> Vec<(OutputDriver, Vec<DeviceInfo>)> {
        let output = |name: &String| DeviceInfo {
            name: Some(name.clone()),
            enabled: true,
            is_default: self.default_output.as_ref() == Some(name),
            is_input: false,
        };

        let mut buffered = vec![
            DeviceInfo {
                name: Some("No sound".into()),
                enabled: true,
                ..DeviceInfo::default()
            },
            DeviceInfo {
                name: Some("Default".into()),
                enabled: true,
                is_default: true,
                is_input: false,
            },
        ];
        buffered.extend(self.outputs.iter().map(|name| DeviceInfo {
            is_default: false,
            ..output(name)
        }));

        let mut exclusive: Vec<DeviceInfo> = self
            .inputs
            .iter()
            .map(|name| DeviceInfo {
                name: Some(name.clone()),
                enabled: true,
                is_default: false,
                is_input: true,
            })
            .collect();
        exclusive.extend(self.outputs.iter().map(output));

        let multichannel = self.outputs.iter().map(output).collect();

        vec![
            (OutputDriver::Buffered, buffered),
            (OutputDriver::ExclusiveEvent, exclusive),
            (OutputDriver::Multichannel, multichannel),
        ]
    }

    /// Replace the engine's device lists. Keeps the built-in lists when the host has no outputs.
    pub fn seed(&self, engine: &MemoryEngine) {
        if self.outputs.is_empty() {
            tracing::warn!("host reports no output devices; keeping built-in device list");
            return;
        }
        for (driver, devices) in self.lists() {
            tracing::debug!(driver = driver.label(), count = devices.len(), "seeding devices");
            engine.set_devices(driver, devices);
        }
    }
}

/// Probe the default host and seed `engine`. Probe failures leave the built-in lists.
pub fn seed_from_host(engine: &MemoryEngine) {
    let host = cpal::default_host();
    match HostDevices::probe(&host) {
        Ok(devices) => devices.seed(engine),
        Err(e) => tracing::warn!("device probe failed: {e:#}"),
    }
}
