//! End-to-end runs against the simulated device.
//!
//! Each test points the output directory at a temp dir, starts a real run
//! and checks the files a downstream plotter would read.

use std::path::Path;
use std::time::Duration;

use shock_logger::config::LoggerConfig;
use shock_logger::consumer::{ConsumptionPolicy, StopReason};
use shock_logger::error::LoggerError;
use shock_logger::handshake::read_pointer_file;
use shock_logger::run::PreparedRun;
use tempfile::tempdir;
use tokio::sync::watch;

fn create_test_config(output_dir: &Path) -> LoggerConfig {
    let toml_str = r#"
        [application]
        name = "shock_logger test"
        log_level = "warn"

        [acquisition]
        backend = "simulated"
        samples_per_channel = 50
        rate_hz = 1000.0
        poll_interval_ms = 1

        [[acquisition.channels]]
        id = 5
        profile = "long"

        [[acquisition.channels]]
        id = 6
        profile = "short"

        [[acquisition.channels]]
        id = 4
        profile = "front_brake"
        range = "bip2_volts"

        [acquisition.simulation]
        noise_volts = 0.0

        [calibration.long]
        min_voltage = 0.5
        max_voltage = 4.5
        min_value = 2.0
        max_value = 8.0
        unit = "in"

        [calibration.short]
        min_voltage = 0.5
        max_voltage = 4.5
        min_value = 1.0
        max_value = 4.0
        unit = "in"

        [calibration.front_brake]
        min_voltage = 0.2
        max_voltage = 1.8
        min_value = 0.0
        max_value = 1000.0
        unit = "psi"
    "#;
    let mut config: LoggerConfig = toml::from_str(toml_str).expect("Failed to parse test config");
    config.storage.output_dir = output_dir.to_path_buf();
    config
}

fn read_rows(path: &Path) -> (String, Vec<Vec<f64>>) {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap().to_string();
    let rows = lines
        .map(|l| l.split(',').map(|v| v.parse::<f64>().unwrap()).collect())
        .collect();
    (header, rows)
}

#[tokio::test]
async fn test_cancelled_run_leaves_valid_files() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path());
    let prepared = PreparedRun::prepare(config).await.unwrap();

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(true);
    });

    let report = prepared.execute(rx).await.unwrap();
    assert_eq!(report.summary.stop_reason, Some(StopReason::Cancelled));
    assert!(report.summary.rows_written > 0);

    let (raw_header, raw_rows) = read_rows(&report.files.raw);
    let (mapped_header, mapped_rows) = read_rows(&report.files.mapped);
    assert_eq!(raw_header, "Time,5,6,4");
    assert_eq!(mapped_header, raw_header);
    assert_eq!(raw_rows.len() as u64, report.summary.rows_written);
    assert_eq!(mapped_rows.len(), raw_rows.len());

    for (raw, mapped) in raw_rows.iter().zip(&mapped_rows) {
        assert_eq!(raw.len(), 4);
        assert_eq!(mapped.len(), 4);
        assert_eq!(raw[0], mapped[0]);
        // long pot: 2-8 in over 0.5-4.5 V
        let expected = (raw[1] - 0.5) / 4.0 * 6.0 + 2.0;
        assert!((mapped[1] - expected).abs() < 1e-5);
        // simulated brake stays inside its 2 V range
        assert!(raw[3] > 0.0 && raw[3] < 2.0);
    }
    let times: Vec<f64> = raw_rows.iter().map(|r| r[0]).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    let pointer = read_pointer_file(&dir.path().join("latest_csv_path.txt")).unwrap();
    assert_eq!(pointer, report.pointer_target);
    assert!(pointer.is_absolute());
    assert!(pointer.to_string_lossy().ends_with("_MCC_DAQ_DATA_MAPPED.csv"));

    let archived = report.archived_config.expect("config archived");
    assert_eq!(archived.extension().unwrap(), "toml");
    let restored: LoggerConfig = toml::from_str(&std::fs::read_to_string(archived).unwrap()).unwrap();
    assert_eq!(restored.acquisition.samples_per_channel, 50);
}

#[tokio::test]
async fn test_run_survives_buffer_wraps() {
    let dir = tempdir().unwrap();
    let mut config = create_test_config(dir.path());
    config.acquisition.samples_per_channel = 10;
    config.acquisition.consumption = ConsumptionPolicy::DrainBacklog;
    let prepared = PreparedRun::prepare(config).await.unwrap();

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(true);
    });

    let report = prepared.execute(rx).await.unwrap();
    assert!(report.summary.wraps > 0, "summary: {:?}", report.summary);

    let (_, rows) = read_rows(&report.files.raw);
    assert_eq!(rows.len() as u64, report.summary.rows_written);
    assert!(rows.len() > 10);
}

#[tokio::test]
async fn test_producer_fault_ends_run_with_rows_kept() {
    let dir = tempdir().unwrap();
    let mut config = create_test_config(dir.path());
    config.acquisition.simulation.fault_after_cycles = Some(30);
    config.storage.archive_config = false;
    let prepared = PreparedRun::prepare(config).await.unwrap();

    // Never fires; the fault has to end the run.
    let (_tx, rx) = watch::channel(false);
    let err = tokio::time::timeout(Duration::from_secs(5), prepared.execute(rx))
        .await
        .expect("run should end on producer fault")
        .unwrap_err();
    assert!(matches!(err, LoggerError::Producer(_)));

    let mut csvs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "csv"))
        .collect();
    csvs.sort();
    assert_eq!(csvs.len(), 2);
    assert!(!dir.path().read_dir().unwrap().any(|e| {
        e.unwrap().path().extension().is_some_and(|x| x == "toml")
    }));

    let (_, mapped_rows) = read_rows(&csvs[0]);
    let (_, raw_rows) = read_rows(&csvs[1]);
    assert_eq!(mapped_rows.len(), raw_rows.len());
    assert!(raw_rows.len() <= 30);
}

#[tokio::test]
async fn test_unknown_backend_opens_nothing() {
    let dir = tempdir().unwrap();
    let mut config = create_test_config(dir.path());
    config.acquisition.backend = "uldaq".to_string();

    let err = PreparedRun::prepare(config).await.err().unwrap();
    assert!(matches!(err, LoggerError::DeviceUnavailable(_)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_shipped_config_is_valid() {
    let config = LoggerConfig::from_toml_str(include_str!("../config/shock_logger.toml")).unwrap();
    config.validate().unwrap();
    let registry = shock_logger::registry::ChannelRegistry::build(
        &config.acquisition,
        &config.calibration,
    )
    .unwrap();
    assert_eq!(registry.channel_ids(), vec![5, 6, 13, 14, 4, 12]);
    assert_eq!(
        registry.get(4).unwrap().record.display_name_mapped,
        "Front brake pressure (PSI)"
    );
}
