//! Software producer for bench runs without acquisition hardware.
//!
//! A tokio task plays the part of the device firmware: it fills the
//! interleaved circular buffer one cycle at a time at the requested rate and
//! publishes the cursor only once every slot of the cycle is written. Each
//! channel carries a slow sine inside its hardware range plus uniform noise.
//!
//! The task is paced from elapsed time rather than one tick per cycle, so a
//! late wakeup writes every cycle that came due in the meantime.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{DeviceDescriptor, QueueElement, ScanDevice, ScanState, ScanStatus};
use crate::config::SimulationConfig;
use crate::error::{AppResult, LoggerError};

/// Fastest pacing the simulated device accepts.
pub const MAX_RATE_HZ: f64 = 100_000.0;

const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Shared {
    queue: Vec<QueueElement>,
    buffer: Vec<f64>,
    samples_per_channel: usize,
    state: ScanState,
    cursor: Option<usize>,
    total_count: u64,
    scan_count: u64,
}

impl Shared {
    fn status(&self) -> ScanStatus {
        ScanStatus {
            state: self.state,
            cursor: self.cursor,
            total_count: self.total_count,
            scan_count: self.scan_count,
        }
    }
}

/// Simulated analog input device.
pub struct SimulatedScanDevice {
    descriptor: DeviceDescriptor,
    config: SimulationConfig,
    shared: Arc<RwLock<Shared>>,
    running: Arc<AtomicBool>,
    released: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedScanDevice {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                product_name: "Simulated analog input".to_string(),
                unique_id: "SIM-0001".to_string(),
            },
            config,
            shared: Arc::new(RwLock::new(Shared {
                queue: Vec::new(),
                buffer: Vec::new(),
                samples_per_channel: 0,
                state: ScanState::Idle,
                cursor: None,
                total_count: 0,
                scan_count: 0,
            })),
            running: Arc::new(AtomicBool::new(false)),
            released: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Whether the producer task is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether `release` has been called.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.is_released() {
            return Err(LoggerError::DeviceUnavailable(format!(
                "{} has been released",
                self.descriptor.dev_string()
            )));
        }
        Ok(())
    }

    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Sensor waveform for the channel at queue position `index`.
fn waveform(element: &QueueElement, index: usize, t: f64) -> f64 {
    // Sensors are unipolar 0-5 V parts; keep the swing inside both.
    let (_, high) = element.range.bounds();
    let span = high.min(5.0);
    let center = span / 2.0;
    let amplitude = span * 0.3;
    let frequency = 0.5 + 0.25 * index as f64;
    center + amplitude * (TAU * frequency * t).sin()
}

async fn produce(
    shared: Arc<RwLock<Shared>>,
    running: Arc<AtomicBool>,
    rate_hz: f64,
    config: SimulationConfig,
) {
    let mut rng = StdRng::from_entropy();
    let tick = Duration::from_secs_f64(1.0 / rate_hz).max(MIN_TICK);
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let started = Instant::now();
    let noise = config.noise_volts;

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        let due = (started.elapsed().as_secs_f64() * rate_hz) as u64;

        let mut guard = shared.write();
        let state = &mut *guard;
        let n = state.queue.len();
        while state.scan_count < due {
            if config
                .fault_after_cycles
                .is_some_and(|limit| state.scan_count >= limit)
            {
                state.state = ScanState::Error;
                running.store(false, Ordering::SeqCst);
                error!(cycles = state.scan_count, "Simulated scan overrun");
                return;
            }

            let cycle = (state.scan_count % state.samples_per_channel as u64) as usize;
            let slot = cycle * n;
            let t = state.scan_count as f64 / rate_hz;
            for (i, element) in state.queue.iter().enumerate() {
                let jitter = if noise > 0.0 {
                    rng.gen_range(-noise..=noise)
                } else {
                    0.0
                };
                state.buffer[slot + i] = waveform(element, i, t) + jitter;
            }
            state.cursor = Some(slot);
            state.scan_count += 1;
            state.total_count += n as u64;
        }
    }
    debug!("Simulated producer exiting");
}

#[async_trait]
impl ScanDevice for SimulatedScanDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn load_queue(&self, queue: &[QueueElement]) -> AppResult<()> {
        self.ensure_connected()?;
        if queue.is_empty() {
            return Err(LoggerError::Configuration(
                "gain queue must not be empty".to_string(),
            ));
        }
        if self.is_running() {
            return Err(LoggerError::Configuration(
                "cannot load a gain queue while scanning".to_string(),
            ));
        }
        self.shared.write().queue = queue.to_vec();
        debug!(elements = queue.len(), "Gain queue loaded");
        Ok(())
    }

    async fn start_scan(&self, samples_per_channel: usize, rate_hz: f64) -> AppResult<f64> {
        self.ensure_connected()?;
        if self.is_running() {
            return Err(LoggerError::Configuration("scan already running".to_string()));
        }
        if samples_per_channel == 0 || !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(LoggerError::Configuration(format!(
                "invalid scan parameters: {samples_per_channel} samples per channel at {rate_hz} Hz"
            )));
        }
        let actual_rate = if rate_hz > MAX_RATE_HZ {
            warn!(requested = rate_hz, actual = MAX_RATE_HZ, "Scan rate limited");
            MAX_RATE_HZ
        } else {
            rate_hz
        };

        {
            let mut state = self.shared.write();
            if state.queue.is_empty() {
                return Err(LoggerError::Configuration(
                    "gain queue must be loaded before scanning".to_string(),
                ));
            }
            state.buffer = vec![0.0; state.queue.len() * samples_per_channel];
            state.samples_per_channel = samples_per_channel;
            state.state = ScanState::Running;
            state.cursor = None;
            state.total_count = 0;
            state.scan_count = 0;
        }

        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(produce(
            Arc::clone(&self.shared),
            Arc::clone(&self.running),
            actual_rate,
            self.config.clone(),
        ));
        *self.task.lock() = Some(handle);

        info!(
            device = %self.descriptor.dev_string(),
            samples_per_channel,
            rate_hz = actual_rate,
            "Simulated scan started"
        );
        Ok(actual_rate)
    }

    async fn query_status(&self) -> AppResult<ScanStatus> {
        self.ensure_connected()?;
        Ok(self.shared.read().status())
    }

    async fn read_slot(&self, index: usize) -> AppResult<f64> {
        self.ensure_connected()?;
        let state = self.shared.read();
        state.buffer.get(index).copied().ok_or_else(|| {
            LoggerError::TransientRead(format!(
                "slot {index} outside buffer of {} slots",
                state.buffer.len()
            ))
        })
    }

    async fn stop_scan(&self) -> AppResult<()> {
        self.halt();
        let mut state = self.shared.write();
        if state.state == ScanState::Running {
            state.state = ScanState::Idle;
            info!(cycles = state.scan_count, "Simulated scan stopped");
        }
        Ok(())
    }

    async fn release(&self) -> AppResult<()> {
        self.halt();
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!(device = %self.descriptor.dev_string(), "Device released");
        }
        Ok(())
    }
}

impl Drop for SimulatedScanDevice {
    fn drop(&mut self) {
        self.halt();
    }
}
