//! Scripted device for deterministic consumer tests.
//!
//! Each `query_status` call consumes the next [`ScriptStep`]; once the
//! script is exhausted the last status repeats (and, if configured, a
//! shutdown signal is sent so the consumer loop ends). Slot values come from
//! a static buffer the test fills up front or patches between steps.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = ScriptedScanDevice::new(2, 4, |slot| slot as f64 * 0.1)
//!     .with_steps([ScriptStep::cursor(0), ScriptStep::cursor(2), ScriptStep::fault()]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{DeviceDescriptor, QueueElement, ScanDevice, ScanState, ScanStatus};
use crate::error::{AppResult, LoggerError};

/// One scripted answer to `query_status`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Report this status.
    Status(ScanStatus),
    /// Fail the query with a transient read error.
    Transient(String),
    /// Fail the query as if the device had disappeared.
    Unavailable(String),
    /// Overwrite a slot, then move on to the next step.
    SetSlot(usize, f64),
}

impl ScriptStep {
    /// A running scan with its cursor at `slot`.
    pub fn cursor(slot: usize) -> Self {
        Self::Status(ScanStatus::running(slot))
    }

    /// A running scan that has not completed a cycle yet.
    pub fn pending() -> Self {
        Self::Status(ScanStatus {
            cursor: None,
            ..ScanStatus::running(0)
        })
    }

    /// A faulted scan.
    pub fn fault() -> Self {
        Self::Status(ScanStatus::error())
    }
}

/// Device replaying a fixed status script.
pub struct ScriptedScanDevice {
    descriptor: DeviceDescriptor,
    buffer: Mutex<Vec<f64>>,
    steps: Mutex<VecDeque<ScriptStep>>,
    last_status: Mutex<ScanStatus>,
    queue: Mutex<Vec<QueueElement>>,
    reads: Mutex<Vec<usize>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    start_error: Mutex<Option<String>>,
    actual_rate: Mutex<Option<f64>>,
    stopped: AtomicBool,
    released: AtomicBool,
    stop_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl ScriptedScanDevice {
    /// A device whose buffer holds `fill(slot)` in every slot.
    pub fn new(
        channel_count: usize,
        samples_per_channel: usize,
        fill: impl Fn(usize) -> f64,
    ) -> Self {
        let buffer = (0..channel_count * samples_per_channel).map(fill).collect();
        Self {
            descriptor: DeviceDescriptor {
                product_name: "Scripted analog input".to_string(),
                unique_id: "SCRIPT-0".to_string(),
            },
            buffer: Mutex::new(buffer),
            steps: Mutex::new(VecDeque::new()),
            last_status: Mutex::new(ScanStatus {
                state: ScanState::Idle,
                cursor: None,
                total_count: 0,
                scan_count: 0,
            }),
            queue: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            start_error: Mutex::new(None),
            actual_rate: Mutex::new(None),
            stopped: AtomicBool::new(false),
            released: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    /// Append steps to the script.
    pub fn with_steps(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.steps.lock().extend(steps);
        self
    }

    /// Append one running status per cursor value.
    pub fn with_cursors(self, cursors: impl IntoIterator<Item = usize>) -> Self {
        self.with_steps(cursors.into_iter().map(ScriptStep::cursor))
    }

    /// Signal shutdown once the script runs out.
    pub fn with_shutdown_on_exhaustion(self, sender: watch::Sender<bool>) -> Self {
        *self.shutdown.lock() = Some(sender);
        self
    }

    /// Make `start_scan` fail as if the device had no pacer available.
    pub fn with_start_error(self, message: impl Into<String>) -> Self {
        *self.start_error.lock() = Some(message.into());
        self
    }

    /// Report `rate_hz` from `start_scan` instead of the requested rate.
    pub fn with_actual_rate(self, rate_hz: f64) -> Self {
        *self.actual_rate.lock() = Some(rate_hz);
        self
    }

    /// Overwrite a buffer slot.
    pub fn set_slot(&self, index: usize, value: f64) {
        if let Some(slot) = self.buffer.lock().get_mut(index) {
            *slot = value;
        }
    }

    /// Number of `stop_scan` calls so far.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of `release` calls so far.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Slots read so far, in order.
    pub fn reads(&self) -> Vec<usize> {
        self.reads.lock().clone()
    }

    /// Gain queue loaded by the caller.
    pub fn loaded_queue(&self) -> Vec<QueueElement> {
        self.queue.lock().clone()
    }

    /// Steps not yet consumed.
    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().len()
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut steps = self.steps.lock();
        loop {
            match steps.pop_front() {
                Some(ScriptStep::SetSlot(index, value)) => self.set_slot(index, value),
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ScanDevice for ScriptedScanDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn load_queue(&self, queue: &[QueueElement]) -> AppResult<()> {
        *self.queue.lock() = queue.to_vec();
        Ok(())
    }

    async fn start_scan(&self, _samples_per_channel: usize, rate_hz: f64) -> AppResult<f64> {
        if let Some(message) = self.start_error.lock().clone() {
            return Err(LoggerError::DeviceUnavailable(message));
        }
        self.last_status.lock().state = ScanState::Running;
        Ok(self.actual_rate.lock().unwrap_or(rate_hz))
    }

    async fn query_status(&self) -> AppResult<ScanStatus> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LoggerError::DeviceUnavailable("released".to_string()));
        }
        if self.stopped.load(Ordering::SeqCst) {
            let mut status = *self.last_status.lock();
            if status.state == ScanState::Running {
                status.state = ScanState::Idle;
            }
            return Ok(status);
        }

        match self.next_step() {
            Some(ScriptStep::Status(status)) => {
                *self.last_status.lock() = status;
                Ok(status)
            }
            Some(ScriptStep::Transient(msg)) => Err(LoggerError::TransientRead(msg)),
            Some(ScriptStep::Unavailable(msg)) => Err(LoggerError::DeviceUnavailable(msg)),
            Some(ScriptStep::SetSlot(..)) | None => {
                if let Some(sender) = self.shutdown.lock().as_ref() {
                    let _ = sender.send(true);
                }
                Ok(*self.last_status.lock())
            }
        }
    }

    async fn read_slot(&self, index: usize) -> AppResult<f64> {
        self.reads.lock().push(index);
        self.buffer.lock().get(index).copied().ok_or_else(|| {
            LoggerError::TransientRead(format!("slot {index} outside scripted buffer"))
        })
    }

    async fn stop_scan(&self) -> AppResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> AppResult<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}
