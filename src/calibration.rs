//! Linear voltage-to-engineering-unit calibration.
//!
//! Every monitored channel carries one [`CalibrationRecord`]: the voltage
//! window the sensor electronics guarantee and the engineering-unit window
//! (inches of shock travel, PSI of line pressure) that window maps onto.
//!
//! ```text
//! mapped = (raw - v_min) / (v_max - v_min) * (u_max - u_min) + u_min
//! ```
//!
//! The mapping is unconditional: readings outside the voltage window are
//! extrapolated, never clamped. Sensors routinely overshoot their nominal
//! window for a few samples and those excursions must stay visible in the
//! output.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, LoggerError};

/// Per-channel linear calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Hardware channel number
    pub channel_id: u32,
    /// `(min_voltage, max_voltage)` guaranteed by the selected range
    pub voltage_domain: (f64, f64),
    /// `(min_value, max_value)` in engineering units
    pub unit_range: (f64, f64),
    /// Unit label (e.g. "in", "psi")
    pub unit: String,
    /// Label used for raw-voltage columns in logs and listings
    pub display_name_raw: String,
    /// Label used for engineering-unit columns in logs and listings
    pub display_name_mapped: String,
}

impl CalibrationRecord {
    /// Create a record with generated display names.
    pub fn new(channel_id: u32, voltage_domain: (f64, f64), unit_range: (f64, f64)) -> Self {
        Self {
            channel_id,
            voltage_domain,
            unit_range,
            unit: String::new(),
            display_name_raw: format!("Channel {channel_id} (V)"),
            display_name_mapped: format!("Channel {channel_id}"),
        }
    }

    /// Set the unit label.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set both display names.
    pub fn with_display_names(
        mut self,
        raw: impl Into<String>,
        mapped: impl Into<String>,
    ) -> Self {
        self.display_name_raw = raw.into();
        self.display_name_mapped = mapped.into();
        self
    }

    /// Width of the voltage window.
    pub fn voltage_span(&self) -> f64 {
        self.voltage_domain.1 - self.voltage_domain.0
    }

    /// Check the record invariants.
    ///
    /// The voltage window must be finite and strictly increasing so that
    /// [`map_value`] never divides by zero. The unit window only has to be
    /// finite; an inverted unit range is a legitimate falling transfer curve.
    pub fn validate(&self) -> AppResult<()> {
        let (v_min, v_max) = self.voltage_domain;
        let (u_min, u_max) = self.unit_range;

        if !v_min.is_finite() || !v_max.is_finite() {
            return Err(LoggerError::Configuration(format!(
                "channel {}: voltage domain ({v_min}, {v_max}) is not finite",
                self.channel_id
            )));
        }
        if v_max <= v_min {
            return Err(LoggerError::Configuration(format!(
                "channel {}: max_voltage {v_max} must be greater than min_voltage {v_min}",
                self.channel_id
            )));
        }
        if !u_min.is_finite() || !u_max.is_finite() {
            return Err(LoggerError::Configuration(format!(
                "channel {}: unit range ({u_min}, {u_max}) is not finite",
                self.channel_id
            )));
        }
        Ok(())
    }

    /// Convert a raw voltage with this record.
    #[inline]
    pub fn map(&self, raw_voltage: f64) -> f64 {
        map_value(raw_voltage, self)
    }
}

/// Map a raw voltage to engineering units.
///
/// The record is assumed valid; [`CalibrationRecord::validate`] runs once
/// when the channel registry is built, not per sample.
#[inline]
pub fn map_value(raw_voltage: f64, record: &CalibrationRecord) -> f64 {
    let (v_min, v_max) = record.voltage_domain;
    let (u_min, u_max) = record.unit_range;
    (raw_voltage - v_min) / (v_max - v_min) * (u_max - u_min) + u_min
}
