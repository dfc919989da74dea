//! # shock_logger
//!
//! Continuous logger for suspension potentiometers and brake-pressure
//! transducers. A hardware-paced acquisition device fills a circular,
//! channel-interleaved buffer in the background; this crate polls the
//! device's write cursor, pulls out each newly completed cycle, converts it
//! to engineering units and appends it to two CSV files (raw volts and
//! calibrated values).
//!
//! ## Crate Structure
//!
//! - **`calibration`**: linear voltage to engineering-unit mapping.
//! - **`registry`**: the immutable, validated channel table of a run.
//! - **`consumer`**: the polling state machine that tracks the cursor,
//!   extracts cycles and handles buffer wrap.
//! - **`storage`**: the dual-stream CSV sink and output file naming.
//! - **`handshake`**: the pointer file a live plotter uses to find the
//!   newest calibrated stream.
//! - **`hardware`**: the `ScanDevice` producer boundary plus simulated and
//!   scripted devices.
//! - **`run`**: bring-up, output setup and teardown around one consumer run.
//! - **`config`**, **`logging`**, **`error`**: configuration loading,
//!   tracing setup and the crate error type.

pub mod calibration;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handshake;
pub mod hardware;
pub mod logging;
pub mod registry;
pub mod run;
pub mod storage;

pub use calibration::{map_value, CalibrationRecord};
pub use consumer::{ConsumptionPolicy, RunSummary, ScanConsumer, StopReason};
pub use error::{AppResult, LoggerError};
