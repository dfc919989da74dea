//! One logging run, from device bring-up to teardown.
//!
//! Order of operations:
//! 1. validate configuration and build the channel registry (no device yet)
//! 2. connect the device and load the gain queue
//! 3. open both CSV streams with their header and rewrite the pointer file
//! 4. archive the effective configuration next to the streams
//! 5. start the scan and hand everything to the consumer
//!
//! A failure after step 2 releases the device before returning. The
//! streams carry their header from the moment they exist, so a run that
//! never starts still leaves well-formed files behind.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::Local;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::LoggerConfig;
use crate::consumer::{RunSummary, ScanConsumer};
use crate::error::{AppResult, LoggerError};
use crate::handshake::write_pointer_file;
use crate::hardware::{self, ScanDevice};
use crate::registry::ChannelRegistry;
use crate::storage::{DualCsvSink, RunFiles};

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub files: RunFiles,
    /// Absolute path written to the pointer file
    pub pointer_target: PathBuf,
    pub archived_config: Option<PathBuf>,
    /// Rate the device actually scanned at
    pub actual_rate_hz: f64,
    pub summary: RunSummary,
}

/// A connected device with its queue loaded, waiting to start.
pub struct PreparedRun {
    config: LoggerConfig,
    registry: ChannelRegistry,
    device: Box<dyn ScanDevice>,
}

impl PreparedRun {
    /// Validate, build the registry, then connect the configured backend.
    pub async fn prepare(config: LoggerConfig) -> AppResult<Self> {
        config.validate()?;
        let registry = ChannelRegistry::build(&config.acquisition, &config.calibration)?;
        let device = hardware::connect(&config.acquisition)?;
        Self::bring_up(config, registry, device).await
    }

    /// Same as [`PreparedRun::prepare`] with a caller-supplied device.
    pub async fn with_device(config: LoggerConfig, device: Box<dyn ScanDevice>) -> AppResult<Self> {
        config.validate()?;
        let registry = ChannelRegistry::build(&config.acquisition, &config.calibration)?;
        Self::bring_up(config, registry, device).await
    }

    async fn bring_up(
        config: LoggerConfig,
        registry: ChannelRegistry,
        device: Box<dyn ScanDevice>,
    ) -> AppResult<Self> {
        info!(device = %device.descriptor().dev_string(), "Connected");
        if let Err(e) = device.load_queue(&registry.queue()).await {
            return Err(release_after(device.as_ref(), e).await);
        }
        Ok(Self {
            config,
            registry,
            device,
        })
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// Operator summary of what is about to be scanned.
    pub fn describe(&self) -> String {
        let acq = &self.config.acquisition;
        let mut out = String::new();
        let _ = writeln!(out, "{} ready", self.device.descriptor().dev_string());
        let _ = writeln!(out, "    Channels: {:?}", self.registry.channel_ids());
        for binding in self.registry.bindings() {
            let _ = writeln!(
                out,
                "        Channel: {:>3}; Input mode: {}; Range: {}; {}",
                binding.channel_id(),
                binding.input_mode,
                binding.range,
                binding.record.display_name_mapped
            );
        }
        let _ = writeln!(out, "    Samples per channel: {}", acq.samples_per_channel);
        let _ = writeln!(out, "    Rate: {} Hz", acq.rate_hz);
        let _ = write!(out, "    Consumption: {:?}", acq.consumption);
        out
    }

    /// Give up before starting; releases the device.
    pub async fn abort(self) -> AppResult<()> {
        info!("Run aborted before acquisition");
        self.device.release().await
    }

    /// Open the outputs, start the scan and drain it until `shutdown`.
    pub async fn execute(self, shutdown: watch::Receiver<bool>) -> AppResult<RunReport> {
        let storage = &self.config.storage;
        let acq = &self.config.acquisition;
        let device = self.device.as_ref();
        let files = RunFiles::new(&storage.output_dir, &storage.file_prefix, Local::now());

        let mut sink = match DualCsvSink::for_run(&files, storage.precision, &self.registry.channel_ids()) {
            Ok(sink) => sink,
            Err(e) => return Err(release_after(device, e).await),
        };

        let pointer_target = match write_pointer_file(&storage.pointer_path(), &files.mapped) {
            Ok(path) => path,
            Err(e) => return Err(release_after(device, e).await),
        };

        let archived_config = if storage.archive_config {
            let path = files.sibling("toml");
            match archive_config(&self.config, &path) {
                Ok(()) => Some(path),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not archive configuration");
                    None
                }
            }
        } else {
            None
        };

        let actual_rate_hz = match device.start_scan(acq.samples_per_channel, acq.rate_hz).await {
            Ok(rate) => rate,
            Err(e) => return Err(release_after(device, e).await),
        };
        info!(
            requested = acq.rate_hz,
            actual = actual_rate_hz,
            samples_per_channel = acq.samples_per_channel,
            "Acquisition started"
        );

        let mut consumer = match ScanConsumer::new(
            &self.registry,
            acq.samples_per_channel,
            actual_rate_hz,
            acq.consumption,
            acq.poll_interval(),
        ) {
            Ok(consumer) => consumer,
            Err(e) => return Err(stop_and_release(device, e).await),
        };

        let summary = consumer.run(device, &mut sink, shutdown).await?;
        Ok(RunReport {
            files,
            pointer_target,
            archived_config,
            actual_rate_hz,
            summary,
        })
    }
}

/// Copy of the effective configuration, environment overrides included.
fn archive_config(config: &LoggerConfig, path: &std::path::Path) -> AppResult<()> {
    let text = toml::to_string_pretty(config)
        .map_err(|e| LoggerError::Storage(format!("Failed to serialize configuration: {e}")))?;
    std::fs::write(path, text)?;
    info!(path = %path.display(), "Configuration archived");
    Ok(())
}

async fn stop_and_release(device: &dyn ScanDevice, cause: LoggerError) -> LoggerError {
    if let Err(e) = device.stop_scan().await {
        error!(error = %e, "Failed to stop scan after error");
    }
    release_after(device, cause).await
}

async fn release_after(device: &dyn ScanDevice, cause: LoggerError) -> LoggerError {
    if let Err(e) = device.release().await {
        error!(error = %e, "Failed to release device after error");
    }
    cause
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::hardware::{DeviceDescriptor, QueueElement, ScanStatus, ScriptedScanDevice};

    /// Lets a test keep a handle on the device after the run takes it.
    struct Shared(Arc<ScriptedScanDevice>);

    #[async_trait]
    impl ScanDevice for Shared {
        fn descriptor(&self) -> &DeviceDescriptor {
            self.0.descriptor()
        }
        async fn load_queue(&self, queue: &[QueueElement]) -> AppResult<()> {
            self.0.load_queue(queue).await
        }
        async fn start_scan(&self, samples_per_channel: usize, rate_hz: f64) -> AppResult<f64> {
            self.0.start_scan(samples_per_channel, rate_hz).await
        }
        async fn query_status(&self) -> AppResult<ScanStatus> {
            self.0.query_status().await
        }
        async fn read_slot(&self, index: usize) -> AppResult<f64> {
            self.0.read_slot(index).await
        }
        async fn stop_scan(&self) -> AppResult<()> {
            self.0.stop_scan().await
        }
        async fn release(&self) -> AppResult<()> {
            self.0.release().await
        }
    }

    fn config(output_dir: &std::path::Path) -> LoggerConfig {
        let mut config = LoggerConfig::from_toml_str(
            r#"
            [acquisition]
            samples_per_channel = 4
            rate_hz = 100.0
            poll_interval_ms = 0

            [[acquisition.channels]]
            id = 5
            profile = "long"

            [[acquisition.channels]]
            id = 4
            profile = "brake"
            range = "bip2_volts"

            [calibration.long]
            min_voltage = 0.5
            max_voltage = 4.5
            min_value = 2.0
            max_value = 8.0
            unit = "in"

            [calibration.brake]
            min_voltage = 0.2
            max_voltage = 1.8
            min_value = 0.0
            max_value = 1000.0
            unit = "psi"
            "#,
        )
        .unwrap();
        config.storage.output_dir = output_dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_bring_up_loads_queue() {
        let dir = tempdir().unwrap();
        let device = ScriptedScanDevice::new(2, 4, |_| 1.0);
        let run = PreparedRun::with_device(config(dir.path()), Box::new(device))
            .await
            .unwrap();
        assert_eq!(run.registry().channel_ids(), vec![5, 4]);

        let text = run.describe();
        assert!(text.contains("Scripted analog input"));
        assert!(text.contains("Samples per channel: 4"));
        assert!(text.contains("BIP2VOLTS"));
        run.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_configuration_error_before_device() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.acquisition.channels[1].profile = "missing".to_string();
        let device = ScriptedScanDevice::new(2, 4, |_| 1.0);
        let err = PreparedRun::with_device(config, Box::new(device))
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.acquisition.backend = "usb".to_string();
        let err = PreparedRun::prepare(config).await.err().unwrap();
        assert!(matches!(err, LoggerError::DeviceUnavailable(_)));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_execute_writes_streams_pointer_and_archive() {
        let dir = tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        let device = ScriptedScanDevice::new(2, 4, |slot| if slot % 2 == 0 { 2.5 } else { 1.0 })
            .with_cursors([0, 2, 4])
            .with_shutdown_on_exhaustion(tx);
        let run = PreparedRun::with_device(config(dir.path()), Box::new(device))
            .await
            .unwrap();

        let report = run.execute(rx).await.unwrap();
        assert_eq!(report.summary.rows_written, 3);
        assert_eq!(report.actual_rate_hz, 100.0);

        let mapped = std::fs::read_to_string(&report.files.mapped).unwrap();
        let lines: Vec<&str> = mapped.lines().collect();
        assert_eq!(lines[0], "Time,5,4");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with(",5.000000,500.000000"));

        let raw = std::fs::read_to_string(&report.files.raw).unwrap();
        assert!(raw.lines().nth(1).unwrap().ends_with(",2.500000,1.000000"));

        let pointer = std::fs::read_to_string(dir.path().join("latest_csv_path.txt")).unwrap();
        assert_eq!(PathBuf::from(pointer), report.pointer_target);
        assert!(report.pointer_target.ends_with(report.files.mapped.file_name().unwrap()));

        let archived = report.archived_config.unwrap();
        let restored = LoggerConfig::from_toml_str(&std::fs::read_to_string(archived).unwrap()).unwrap();
        assert_eq!(restored.acquisition.channels.len(), 2);
    }

    fn header_only(files: &RunFiles) {
        for path in [&files.raw, &files.mapped] {
            assert_eq!(std::fs::read_to_string(path).unwrap(), "Time,5,4\n");
        }
    }

    #[tokio::test]
    async fn test_failed_start_leaves_well_formed_outputs() {
        let dir = tempdir().unwrap();
        let device = Arc::new(ScriptedScanDevice::new(2, 4, |_| 1.0).with_start_error("pacer not available"));
        let run = PreparedRun::with_device(config(dir.path()), Box::new(Shared(Arc::clone(&device))))
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let err = run.execute(rx).await.err().unwrap();
        assert!(matches!(err, LoggerError::DeviceUnavailable(_)));
        assert!(device.is_released());
        assert_eq!(device.stop_calls(), 0);

        let pointer = std::fs::read_to_string(dir.path().join("latest_csv_path.txt")).unwrap();
        let mapped = PathBuf::from(&pointer);
        let raw = PathBuf::from(pointer.replace("_MAPPED.csv", "_RAW.csv"));
        for path in [raw, mapped] {
            assert_eq!(std::fs::read_to_string(path).unwrap(), "Time,5,4\n");
        }
    }

    #[tokio::test]
    async fn test_rejected_rate_stops_scan() {
        let dir = tempdir().unwrap();
        let device = Arc::new(ScriptedScanDevice::new(2, 4, |_| 1.0).with_actual_rate(0.0));
        let run = PreparedRun::with_device(config(dir.path()), Box::new(Shared(Arc::clone(&device))))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = run.execute(rx).await.err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(device.stop_calls(), 1);
        assert!(device.is_released());

        let csvs = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|x| x == "csv"))
            .collect::<Vec<_>>();
        assert_eq!(csvs.len(), 2);
        for path in csvs {
            assert_eq!(std::fs::read_to_string(path).unwrap(), "Time,5,4\n");
        }
    }

    #[tokio::test]
    async fn test_outputs_have_header_before_first_poll() {
        let dir = tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let device = ScriptedScanDevice::new(2, 4, |_| 1.0).with_cursors([0]);
        let run = PreparedRun::with_device(config(dir.path()), Box::new(device))
            .await
            .unwrap();

        let report = run.execute(rx).await.unwrap();
        assert_eq!(report.summary.polls, 0);
        header_only(&report.files);
    }
}
