//! Channel registry: the immutable channel table of one run.
//!
//! Built once from configuration and then passed by reference to the
//! consumer (calibration, display names) and to device bring-up (queue
//! modes and ranges). There is no process-wide channel state and no way to
//! swap calibration mid-run.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::calibration::CalibrationRecord;
use crate::config::{AcquisitionConfig, CalibrationProfile, ChannelConfig};
use crate::error::{AppResult, LoggerError};
use crate::hardware::{HardwareRange, InputMode, QueueElement};
use crate::storage::header_record;

/// Everything the run needs to know about one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBinding {
    pub record: CalibrationRecord,
    pub input_mode: InputMode,
    pub range: HardwareRange,
}

impl ChannelBinding {
    /// Hardware channel number.
    pub fn channel_id(&self) -> u32 {
        self.record.channel_id
    }

    /// Calibrate a raw voltage for this channel.
    #[inline]
    pub fn map(&self, raw_voltage: f64) -> f64 {
        self.record.map(raw_voltage)
    }

    fn from_config(channel: &ChannelConfig, profile: &CalibrationProfile) -> Self {
        let unit_suffix = if profile.unit.is_empty() {
            String::new()
        } else {
            format!(" ({})", profile.unit)
        };
        let record = CalibrationRecord {
            channel_id: channel.id,
            voltage_domain: (profile.min_voltage, profile.max_voltage),
            unit_range: (profile.min_value, profile.max_value),
            unit: profile.unit.clone(),
            display_name_raw: channel
                .name_raw
                .clone()
                .unwrap_or_else(|| format!("Channel {} (V)", channel.id)),
            display_name_mapped: channel
                .name_mapped
                .clone()
                .unwrap_or_else(|| format!("Channel {}{unit_suffix}", channel.id)),
        };
        Self {
            record,
            input_mode: channel.input_mode,
            range: channel.range,
        }
    }
}

/// Ordered, validated channel table.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    bindings: Vec<ChannelBinding>,
}

impl ChannelRegistry {
    /// Build the registry from configuration.
    ///
    /// Fails with [`LoggerError::Configuration`] when the channel list is
    /// empty, a channel id repeats, a channel names an unknown calibration
    /// profile, or a profile's voltage domain is degenerate.
    pub fn build(
        acquisition: &AcquisitionConfig,
        profiles: &BTreeMap<String, CalibrationProfile>,
    ) -> AppResult<Self> {
        let bindings = acquisition
            .channels
            .iter()
            .map(|channel| {
                profiles
                    .get(&channel.profile)
                    .map(|profile| ChannelBinding::from_config(channel, profile))
                    .ok_or_else(|| {
                        LoggerError::Configuration(format!(
                            "channel {} references unknown calibration profile '{}'",
                            channel.id, channel.profile
                        ))
                    })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Self::from_bindings(bindings)
    }

    /// Build the registry from ready-made bindings.
    pub fn from_bindings(bindings: Vec<ChannelBinding>) -> AppResult<Self> {
        if bindings.is_empty() {
            return Err(LoggerError::Configuration(
                "At least one channel is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for binding in &bindings {
            if !seen.insert(binding.channel_id()) {
                return Err(LoggerError::Configuration(format!(
                    "Duplicate channel id: {}",
                    binding.channel_id()
                )));
            }
            binding.record.validate()?;

            let (v_min, v_max) = binding.record.voltage_domain;
            if !binding.range.contains(v_min, v_max) {
                warn!(
                    channel = binding.channel_id(),
                    range = %binding.range,
                    v_min,
                    v_max,
                    "Calibration voltage domain exceeds the hardware range"
                );
            }
        }

        debug!(channels = bindings.len(), "Channel registry built");
        Ok(Self { bindings })
    }

    /// Bindings in buffer order.
    pub fn bindings(&self) -> &[ChannelBinding] {
        &self.bindings
    }

    /// Number of channels per acquisition cycle.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Always false for a constructed registry.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Channel ids in buffer order; also the CSV column order.
    pub fn channel_ids(&self) -> Vec<u32> {
        self.bindings.iter().map(ChannelBinding::channel_id).collect()
    }

    /// CSV column labels, `Time` first.
    pub fn header(&self) -> Vec<String> {
        header_record(&self.channel_ids())
    }

    /// Look up a binding by channel id.
    pub fn get(&self, channel_id: u32) -> Option<&ChannelBinding> {
        self.bindings.iter().find(|b| b.channel_id() == channel_id)
    }

    /// Gain queue to load into the device.
    pub fn queue(&self) -> Vec<QueueElement> {
        self.bindings
            .iter()
            .map(|b| QueueElement {
                channel: b.channel_id(),
                input_mode: b.input_mode,
                range: b.range,
            })
            .collect()
    }
}
