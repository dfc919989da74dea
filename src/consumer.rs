//! Continuous scan-buffer consumer.
//!
//! The acquisition device fills a flat, channel-interleaved circular buffer
//! and publishes a write cursor naming the first slot of the newest completed
//! cycle. This module drains that buffer without ever reading a slot the
//! producer has not finished:
//!
//! ```text
//!  slot:   0   1   2   3   4   5 | 6   7   8  ...        | 5994 ... 5999
//!  chan:   5   6  13  14   4  12 | 5   6  13  ...        |   5  ...   12
//!  cycle:          0             |       1               |      999
//!                                                          ^ final cycle slot
//! ```
//!
//! # Lifecycle
//!
//! `Idle` until the first successful status query, `Draining` while polling,
//! `Stopped` after cancellation or a producer fault. On the way to `Stopped`
//! the consumer stops the scan if it is still running, releases the device
//! and closes the sink, on every exit path.
//!
//! # Cursor protocol
//!
//! The decision of what to extract is [`ScanConsumer::observe`], a pure
//! function of the status snapshot and the [`CursorState`]. Extraction only
//! commits the cursor after the rows are persisted, so a transient anomaly
//! leaves the state exactly as it was and the next tick retries.
//!
//! With [`ConsumptionPolicy::LatestCycle`] (the default) each poll that sees
//! the cursor move extracts one cycle: the newest one. If polling falls
//! behind the producer the cycles in between are skipped, not caught up.
//! [`ConsumptionPolicy::DrainBacklog`] instead extracts every completed cycle
//! since the last one observed, across a wrap if needed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{AppResult, LoggerError};
use crate::hardware::{ScanDevice, ScanState, ScanStatus};
use crate::registry::ChannelRegistry;
use crate::storage::SampleSink;

/// How many newly completed cycles one poll consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionPolicy {
    /// Extract only the newest completed cycle per poll.
    #[default]
    LatestCycle,
    /// Extract every completed cycle since the last observed one.
    DrainBacklog,
}

/// Shape of the circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    channel_count: usize,
    samples_per_channel: usize,
}

impl BufferGeometry {
    /// Geometry for `channel_count` interleaved channels of
    /// `samples_per_channel` samples each.
    pub fn new(channel_count: usize, samples_per_channel: usize) -> AppResult<Self> {
        if channel_count == 0 {
            return Err(LoggerError::Configuration(
                "buffer needs at least one channel".to_string(),
            ));
        }
        if samples_per_channel < 2 {
            return Err(LoggerError::Configuration(format!(
                "buffer depth must be at least 2 samples per channel, got {samples_per_channel}"
            )));
        }
        Ok(Self {
            channel_count,
            samples_per_channel,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.channel_count * self.samples_per_channel
    }

    /// First slot of the last cycle in the buffer.
    pub fn final_cycle_slot(&self) -> usize {
        self.channel_count * (self.samples_per_channel - 1)
    }

    /// Cycle number of a slot.
    pub fn cycle_of(&self, slot: usize) -> usize {
        slot / self.channel_count
    }

    /// Check that a reported cursor names the start of a cycle.
    pub fn check_cursor(&self, cursor: usize) -> AppResult<usize> {
        if cursor >= self.slot_count() || cursor % self.channel_count != 0 {
            return Err(LoggerError::TransientRead(format!(
                "cursor {cursor} is not a cycle boundary of a {}-slot buffer",
                self.slot_count()
            )));
        }
        Ok(cursor)
    }

    /// Cycle start slots from `first` through `last`, inclusive.
    fn slots_between(&self, first: usize, last: usize) -> impl Iterator<Item = usize> {
        (first..=last).step_by(self.channel_count)
    }
}

/// Last observed position of the producer's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    /// Nothing extracted yet this run.
    #[default]
    Unset,
    /// The cycle starting at this slot was the last one extracted.
    At(usize),
    /// The final cycle slot was extracted; the next lower cursor is fresh data
    /// from the start of the buffer.
    Wrapped,
}

/// Outcome of comparing a status snapshot with the cursor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    /// Nothing new since the last poll.
    NoData,
    /// Extract the cycles starting at these slots, oldest first.
    Extract(Vec<usize>),
    /// The cursor fell below the last observed slot without the final cycle
    /// ever being seen. Only reported under `LatestCycle`; the consumer
    /// waits for the cursor to pass the last observed slot again.
    MissedWrap { cursor: usize, last: usize },
    /// The producer reported a fault.
    Fault,
}

/// Consumer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Draining,
    Stopped,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    ProducerFault(String),
    Failed(String),
}

/// One channel of one extracted cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    pub channel_id: u32,
    pub raw: f64,
    pub mapped: f64,
}

/// One extracted cycle, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    /// Seconds since the consumer started
    pub elapsed_secs: f64,
    /// Buffer slot of the cycle's first channel
    pub slot: usize,
    /// Samples in channel order
    pub samples: Vec<ChannelSample>,
}

impl SampleSet {
    pub fn raw_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.raw)
    }

    pub fn mapped_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.mapped)
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub polls: u64,
    pub rows_written: u64,
    pub transient_anomalies: u64,
    pub wraps: u64,
    pub missed_wraps: u64,
    pub stop_reason: Option<StopReason>,
}

/// The polling state machine.
pub struct ScanConsumer<'a> {
    registry: &'a ChannelRegistry,
    geometry: BufferGeometry,
    policy: ConsumptionPolicy,
    poll_interval: Duration,
    sample_period: f64,
    last_elapsed: f64,
    cursor: CursorState,
    state: ConsumerState,
    last_state: Option<ScanState>,
    missed_wrap_reported: bool,
    summary: RunSummary,
}

impl<'a> ScanConsumer<'a> {
    /// Create a consumer for a buffer of `samples_per_channel` cycles
    /// scanned at `rate_hz`.
    pub fn new(
        registry: &'a ChannelRegistry,
        samples_per_channel: usize,
        rate_hz: f64,
        policy: ConsumptionPolicy,
        poll_interval: Duration,
    ) -> AppResult<Self> {
        let geometry = BufferGeometry::new(registry.len(), samples_per_channel)?;
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(LoggerError::Configuration(format!("Invalid rate_hz {rate_hz}")));
        }
        Ok(Self {
            registry,
            geometry,
            policy,
            poll_interval,
            sample_period: 1.0 / rate_hz,
            last_elapsed: 0.0,
            cursor: CursorState::Unset,
            state: ConsumerState::Idle,
            last_state: None,
            missed_wrap_reported: false,
            summary: RunSummary::default(),
        })
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    pub fn cursor(&self) -> CursorState {
        self.cursor
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Decide what a status snapshot means for the current cursor state.
    ///
    /// Total over every `(status, cursor)` pair: a fault is always
    /// [`PollDecision::Fault`], a malformed cursor is a transient read error,
    /// and everything else is one of the remaining decisions.
    pub fn observe(&self, status: &ScanStatus) -> AppResult<PollDecision> {
        if status.state == ScanState::Error {
            return Ok(PollDecision::Fault);
        }
        let Some(cursor) = status.cursor else {
            return Ok(PollDecision::NoData);
        };
        let cursor = self.geometry.check_cursor(cursor)?;
        let final_slot = self.geometry.final_cycle_slot();
        let step = self.geometry.channel_count;

        let decision = match (self.policy, self.cursor) {
            (ConsumptionPolicy::LatestCycle, CursorState::Unset) => {
                PollDecision::Extract(vec![cursor])
            }
            (ConsumptionPolicy::LatestCycle, CursorState::Wrapped) => {
                if cursor < final_slot {
                    PollDecision::Extract(vec![cursor])
                } else {
                    PollDecision::NoData
                }
            }
            (ConsumptionPolicy::LatestCycle, CursorState::At(last)) => {
                if cursor > last {
                    PollDecision::Extract(vec![cursor])
                } else if cursor < last {
                    PollDecision::MissedWrap { cursor, last }
                } else {
                    PollDecision::NoData
                }
            }
            (ConsumptionPolicy::DrainBacklog, CursorState::Unset) => {
                PollDecision::Extract(self.geometry.slots_between(0, cursor).collect())
            }
            (ConsumptionPolicy::DrainBacklog, CursorState::Wrapped) => {
                if cursor < final_slot {
                    PollDecision::Extract(self.geometry.slots_between(0, cursor).collect())
                } else {
                    PollDecision::NoData
                }
            }
            (ConsumptionPolicy::DrainBacklog, CursorState::At(last)) => {
                if cursor > last {
                    PollDecision::Extract(self.geometry.slots_between(last + step, cursor).collect())
                } else if cursor < last {
                    PollDecision::Extract(
                        self.geometry
                            .slots_between(last + step, final_slot)
                            .chain(self.geometry.slots_between(0, cursor))
                            .collect(),
                    )
                } else {
                    PollDecision::NoData
                }
            }
        };
        Ok(decision)
    }

    /// Record that the cycle at `slot` has been persisted.
    pub fn commit(&mut self, slot: usize) {
        if slot == self.geometry.final_cycle_slot() {
            self.cursor = CursorState::Wrapped;
            self.summary.wraps += 1;
            debug!(slot, "Final cycle consumed, cursor reset for wrap");
        } else {
            self.cursor = CursorState::At(slot);
        }
    }

    /// Read and calibrate the cycle starting at `slot`.
    async fn extract<D>(&self, device: &D, slot: usize, elapsed_secs: f64) -> AppResult<SampleSet>
    where
        D: ScanDevice + ?Sized,
    {
        let mut samples = Vec::with_capacity(self.registry.len());
        for (offset, binding) in self.registry.bindings().iter().enumerate() {
            let raw = device.read_slot(slot + offset).await?;
            if !raw.is_finite() {
                return Err(LoggerError::TransientRead(format!(
                    "slot {} (channel {}) holds {raw}",
                    slot + offset,
                    binding.channel_id()
                )));
            }
            samples.push(ChannelSample {
                channel_id: binding.channel_id(),
                raw,
                mapped: binding.map(raw),
            });
        }
        Ok(SampleSet {
            elapsed_secs,
            slot,
            samples,
        })
    }

    /// Run one poll: query, decide, extract, persist, commit.
    ///
    /// Returns the number of rows written. Nothing is written and the cursor
    /// is left untouched unless every slot of every extracted cycle was read
    /// successfully.
    pub async fn poll_once<D, S>(&mut self, device: &D, sink: &mut S, started: Instant) -> AppResult<usize>
    where
        D: ScanDevice + ?Sized,
        S: SampleSink + ?Sized,
    {
        self.summary.polls += 1;
        let status = device.query_status().await?;
        self.last_state = Some(status.state);
        if self.state == ConsumerState::Idle {
            self.state = ConsumerState::Draining;
        }

        trace!(
            cursor = ?status.cursor,
            total_count = status.total_count,
            scan_count = status.scan_count,
            "Scan status"
        );

        let slots = match self.observe(&status)? {
            PollDecision::NoData => return Ok(0),
            PollDecision::Fault => {
                return Err(LoggerError::Producer(
                    "scan status reported a hardware or driver error".to_string(),
                ))
            }
            PollDecision::MissedWrap { cursor, last } => {
                if !self.missed_wrap_reported {
                    self.missed_wrap_reported = true;
                    self.summary.missed_wraps += 1;
                    warn!(
                        cursor,
                        last,
                        "Cursor wrapped before the final cycle was observed; poll faster or use drain_backlog"
                    );
                }
                return Ok(0);
            }
            PollDecision::Extract(slots) => slots,
        };
        self.missed_wrap_reported = false;

        let elapsed = started.elapsed().as_secs_f64();
        let newest = slots.len() - 1;
        let mut sets = Vec::with_capacity(slots.len());
        for (i, &slot) in slots.iter().enumerate() {
            // Older backlog cycles are back-dated by whole sample periods,
            // never earlier than the last row written.
            let lag = (newest - i) as f64 * self.sample_period;
            let stamp = (elapsed - lag).max(self.last_elapsed);
            sets.push(self.extract(device, slot, stamp).await?);
        }

        for set in &sets {
            sink.write_row(set)?;
            self.commit(set.slot);
            self.last_elapsed = set.elapsed_secs;
            self.summary.rows_written += 1;
            trace!(
                cycle = self.geometry.cycle_of(set.slot),
                elapsed = set.elapsed_secs,
                "Cycle persisted"
            );
        }
        Ok(sets.len())
    }

    /// Drive the polling loop until cancellation or a fatal error.
    ///
    /// Writes the sink header first unless the sink was opened with one.
    /// `shutdown` flipping to `true` (or its
    /// sender being dropped) is the operator interrupt and ends the run
    /// cleanly. Teardown runs on every exit path.
    #[instrument(skip_all, fields(channels = self.geometry.channel_count, depth = self.geometry.samples_per_channel))]
    pub async fn run<D, S>(
        &mut self,
        device: &D,
        sink: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<RunSummary>
    where
        D: ScanDevice + ?Sized,
        S: SampleSink + ?Sized,
    {
        let outcome = self.drain(device, sink, &mut shutdown).await;
        self.state = ConsumerState::Stopped;
        let teardown = self.teardown(device, sink).await;

        self.summary.stop_reason = Some(match &outcome {
            Ok(()) => StopReason::Cancelled,
            Err(LoggerError::Producer(msg)) => StopReason::ProducerFault(msg.clone()),
            Err(e) => StopReason::Failed(e.to_string()),
        });
        info!(
            polls = self.summary.polls,
            rows = self.summary.rows_written,
            anomalies = self.summary.transient_anomalies,
            wraps = self.summary.wraps,
            reason = ?self.summary.stop_reason,
            "Consumer stopped"
        );

        outcome?;
        teardown?;
        Ok(self.summary.clone())
    }

    async fn drain<D, S>(
        &mut self,
        device: &D,
        sink: &mut S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AppResult<()>
    where
        D: ScanDevice + ?Sized,
        S: SampleSink + ?Sized,
    {
        if !sink.has_header() {
            sink.write_header(&self.registry.channel_ids())?;
        }
        let started = Instant::now();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.poll_once(device, sink, started).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    self.summary.transient_anomalies += 1;
                    warn!(error = %e, "Skipping poll");
                }
                Err(e) => {
                    error!(error = %e, "Fatal error while draining scan buffer");
                    return Err(e);
                }
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop the scan if still running, release the device, close the sink.
    ///
    /// Every step is attempted even if an earlier one fails; the first error
    /// is returned.
    async fn teardown<D, S>(&mut self, device: &D, sink: &mut S) -> AppResult<()>
    where
        D: ScanDevice + ?Sized,
        S: SampleSink + ?Sized,
    {
        let mut first_error: Option<LoggerError> = None;

        let running = match device.query_status().await {
            Ok(status) => status.state == ScanState::Running,
            Err(e) => {
                warn!(error = %e, "Status query failed during teardown, stopping scan anyway");
                self.last_state != Some(ScanState::Error)
            }
        };
        if running {
            if let Err(e) = device.stop_scan().await {
                error!(error = %e, "Failed to stop scan");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = device.release().await {
            error!(error = %e, "Failed to release device");
            first_error.get_or_insert(e);
        }
        if let Err(e) = sink.close() {
            error!(error = %e, "Failed to close output streams");
            first_error.get_or_insert(e);
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRecord;
    use crate::hardware::{HardwareRange, InputMode};
    use crate::registry::ChannelBinding;

    fn registry(channels: &[u32]) -> ChannelRegistry {
        let bindings = channels
            .iter()
            .map(|&id| ChannelBinding {
                record: CalibrationRecord::new(id, (0.5, 4.5), (2.0, 8.0)),
                input_mode: InputMode::SingleEnded,
                range: HardwareRange::Bip10Volts,
            })
            .collect();
        ChannelRegistry::from_bindings(bindings).unwrap()
    }

    fn consumer(registry: &ChannelRegistry, depth: usize, policy: ConsumptionPolicy) -> ScanConsumer<'_> {
        ScanConsumer::new(registry, depth, 1000.0, policy, Duration::ZERO).unwrap()
    }

    /// Feed a cursor sequence through observe/commit, returning extracted cycles.
    fn replay(consumer: &mut ScanConsumer<'_>, cursors: &[usize]) -> Vec<usize> {
        let mut cycles = Vec::new();
        for &cursor in cursors {
            if let PollDecision::Extract(slots) = consumer.observe(&ScanStatus::running(cursor)).unwrap() {
                for slot in slots {
                    cycles.push(consumer.geometry().cycle_of(slot));
                    consumer.commit(slot);
                }
            }
        }
        cycles
    }

    #[test]
    fn test_geometry() {
        let g = BufferGeometry::new(6, 1000).unwrap();
        assert_eq!(g.slot_count(), 6000);
        assert_eq!(g.final_cycle_slot(), 5994);
        assert_eq!(g.cycle_of(5994), 999);
        assert!(g.check_cursor(12).is_ok());
        assert!(g.check_cursor(13).unwrap_err().is_transient());
        assert!(g.check_cursor(6000).unwrap_err().is_transient());
        assert!(BufferGeometry::new(0, 10).is_err());
        assert!(BufferGeometry::new(6, 1).is_err());
    }

    #[test]
    fn test_one_extraction_per_strict_increase() {
        let reg = registry(&[5, 6, 13, 14, 4, 12]);
        let mut c = consumer(&reg, 1000, ConsumptionPolicy::LatestCycle);
        let cycles = replay(&mut c, &[0, 0, 6, 6, 6, 12, 18, 18, 24]);
        assert_eq!(cycles, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_latest_cycle_skips_backlog() {
        let reg = registry(&[5, 6]);
        let mut c = consumer(&reg, 100, ConsumptionPolicy::LatestCycle);
        let cycles = replay(&mut c, &[0, 10, 40]);
        assert_eq!(cycles, vec![0, 5, 20]);
    }

    #[test]
    fn test_wrap_scenario_six_channels() {
        let reg = registry(&[5, 6, 13, 14, 4, 12]);
        let mut c = consumer(&reg, 1000, ConsumptionPolicy::LatestCycle);

        let mut cursors: Vec<usize> = (0..1000).map(|cycle| cycle * 6).collect();
        cursors.extend([0, 6]);

        let cycles = replay(&mut c, &cursors);
        let mut expected: Vec<usize> = (0..1000).collect();
        expected.extend([0, 1]);
        assert_eq!(cycles, expected);
        assert_eq!(c.summary().wraps, 1);
        assert_eq!(c.cursor(), CursorState::At(6));
    }

    #[test]
    fn test_final_slot_not_reextracted_after_wrap() {
        let reg = registry(&[1, 2]);
        let mut c = consumer(&reg, 4, ConsumptionPolicy::LatestCycle);
        // final slot is 6; the poller sees it twice before the producer wraps
        let cycles = replay(&mut c, &[0, 2, 4, 6, 6, 0]);
        assert_eq!(cycles, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_missed_wrap_reported() {
        let reg = registry(&[1, 2]);
        let mut c = consumer(&reg, 4, ConsumptionPolicy::LatestCycle);
        replay(&mut c, &[0, 4]);
        assert_eq!(
            c.observe(&ScanStatus::running(2)).unwrap(),
            PollDecision::MissedWrap { cursor: 2, last: 4 }
        );
    }

    #[test]
    fn test_drain_backlog_catches_up() {
        let reg = registry(&[5, 6]);
        let mut c = consumer(&reg, 100, ConsumptionPolicy::DrainBacklog);
        let cycles = replay(&mut c, &[4, 10]);
        assert_eq!(cycles, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_drain_backlog_across_wrap() {
        let reg = registry(&[1, 2]);
        let mut c = consumer(&reg, 4, ConsumptionPolicy::DrainBacklog);
        // cycles 0..=1, then the cursor wraps to cycle 1 without final slot seen
        let cycles = replay(&mut c, &[2, 2]);
        assert_eq!(cycles, vec![0, 1]);
        let cycles = replay(&mut c, &[2, 0]);
        assert_eq!(cycles, vec![2, 3, 0]);
        assert_eq!(c.summary().wraps, 1);
    }

    #[test]
    fn test_fault_and_missing_cursor() {
        let reg = registry(&[1, 2]);
        let c = consumer(&reg, 4, ConsumptionPolicy::LatestCycle);
        assert_eq!(c.observe(&ScanStatus::error()).unwrap(), PollDecision::Fault);

        let mut pending = ScanStatus::running(0);
        pending.cursor = None;
        assert_eq!(c.observe(&pending).unwrap(), PollDecision::NoData);

        assert!(c.observe(&ScanStatus::running(3)).unwrap_err().is_transient());
    }

    #[test]
    fn test_new_rejects_bad_rate() {
        let reg = registry(&[1]);
        assert!(ScanConsumer::new(&reg, 10, 0.0, ConsumptionPolicy::LatestCycle, Duration::ZERO).is_err());
    }
}
