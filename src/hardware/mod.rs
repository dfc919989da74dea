//! Acquisition hardware boundary.
//!
//! The consumer only ever talks to a [`ScanDevice`]: the producer that owns
//! the circular buffer and advances its write cursor in the background.
//! Everything behind that trait (driver bindings, DMA, firmware pacing) is
//! opaque to the logger.
//!
//! Two implementations ship with the crate:
//!
//! - [`simulated::SimulatedScanDevice`] - a paced software producer used by
//!   the binary when no hardware backend is available, and by integration
//!   tests that need a live cursor.
//! - [`scripted::ScriptedScanDevice`] - replays a fixed sequence of status
//!   reports against a static buffer so cursor handling can be tested
//!   deterministically.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AcquisitionConfig;
use crate::error::{AppResult, LoggerError};

pub mod scripted;
pub mod simulated;

pub use scripted::{ScriptStep, ScriptedScanDevice};
pub use simulated::SimulatedScanDevice;

/// Analog input wiring mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    SingleEnded,
    Differential,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleEnded => f.pad("SINGLE_ENDED"),
            Self::Differential => f.pad("DIFFERENTIAL"),
        }
    }
}

/// Bipolar input range selected for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareRange {
    #[default]
    Bip10Volts,
    Bip5Volts,
    Bip2Volts,
    Bip1Volts,
}

impl HardwareRange {
    /// Voltage limits of the range.
    pub fn bounds(self) -> (f64, f64) {
        let limit = match self {
            Self::Bip10Volts => 10.0,
            Self::Bip5Volts => 5.0,
            Self::Bip2Volts => 2.0,
            Self::Bip1Volts => 1.0,
        };
        (-limit, limit)
    }

    /// Whether `[min, max]` lies inside the range.
    pub fn contains(self, min: f64, max: f64) -> bool {
        let (low, high) = self.bounds();
        min >= low && max <= high
    }
}

impl fmt::Display for HardwareRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bip10Volts => f.pad("BIP10VOLTS"),
            Self::Bip5Volts => f.pad("BIP5VOLTS"),
            Self::Bip2Volts => f.pad("BIP2VOLTS"),
            Self::Bip1Volts => f.pad("BIP1VOLTS"),
        }
    }
}

/// One entry of the device's channel gain queue.
///
/// Queue order defines the interleaving of the circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueElement {
    pub channel: u32,
    pub input_mode: InputMode,
    pub range: HardwareRange,
}

/// Identification of a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub product_name: String,
    pub unique_id: String,
}

impl DeviceDescriptor {
    /// Human readable identification string.
    pub fn dev_string(&self) -> String {
        format!("{} ({})", self.product_name, self.unique_id)
    }
}

/// Background scan state reported by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
    Error,
}

/// Snapshot of the producer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatus {
    /// Current scan state
    pub state: ScanState,
    /// Buffer index of the first slot of the most recently completed
    /// acquisition cycle, `None` before the first cycle completes
    pub cursor: Option<usize>,
    /// Samples transferred since the scan started (all channels)
    pub total_count: u64,
    /// Complete cycles transferred since the scan started
    pub scan_count: u64,
}

impl ScanStatus {
    /// A running scan whose newest completed cycle starts at `cursor`.
    pub fn running(cursor: usize) -> Self {
        Self {
            state: ScanState::Running,
            cursor: Some(cursor),
            total_count: 0,
            scan_count: 0,
        }
    }

    /// A scan that has faulted.
    pub fn error() -> Self {
        Self {
            state: ScanState::Error,
            cursor: None,
            total_count: 0,
            scan_count: 0,
        }
    }
}

/// Producer boundary: a hardware-paced analog input device.
///
/// # Contract
/// - `query_status` is bounded and short; the cursor it reports only ever
///   names cycles whose slots are fully written.
/// - `read_slot` may be called for any index below
///   `channel_count * samples_per_channel` once the scan has started.
/// - `stop_scan` and `release` are idempotent.
///
/// # Thread Safety
/// All methods take `&self`; implementations use interior mutability.
#[async_trait]
pub trait ScanDevice: Send + Sync {
    /// Identification of the connected device.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Load the channel gain queue. Must precede `start_scan`.
    async fn load_queue(&self, queue: &[QueueElement]) -> AppResult<()>;

    /// Start a continuous scan into a buffer of
    /// `queue.len() * samples_per_channel` slots.
    ///
    /// Returns the rate the hardware actually achieved.
    async fn start_scan(&self, samples_per_channel: usize, rate_hz: f64) -> AppResult<f64>;

    /// Current scan state and write cursor.
    async fn query_status(&self) -> AppResult<ScanStatus>;

    /// Raw voltage held in a buffer slot.
    async fn read_slot(&self, index: usize) -> AppResult<f64>;

    /// Stop the background scan.
    async fn stop_scan(&self) -> AppResult<()>;

    /// Disconnect and release the device handle.
    async fn release(&self) -> AppResult<()>;
}

/// Connect to the acquisition device named by the configuration.
pub fn connect(config: &AcquisitionConfig) -> AppResult<Box<dyn ScanDevice>> {
    match config.backend.as_str() {
        "simulated" => Ok(Box::new(SimulatedScanDevice::new(config.simulation.clone()))),
        other => Err(LoggerError::DeviceUnavailable(format!(
            "No DAQ devices found for backend '{other}'"
        ))),
    }
}
