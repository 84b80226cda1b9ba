//! End-to-end scans against the simulated rig, recorded to CSV.

#![cfg(feature = "storage_csv")]

use pas_daq::config::Settings;
use pas_daq::data::storage::{metadata_path, CSV_HEADER};
use pas_daq::data::CsvRecorder;
use pas_daq::error::DaqError;
use pas_daq::experiment::{AcquisitionSequencer, ScanEvent, ScanPlan};
use pas_daq::frequency::FrequencyUnit;
use pas_daq::hardware::capabilities::FrequencyMeter;
use pas_daq::session::InstrumentSession;
use tokio::sync::watch;

fn scan_settings() -> Settings {
    let mut settings = Settings::default();
    settings.scan.averages = 2;
    settings.scan.save_every = 2;
    settings.scan.acoustic_frequency_hz = Some(1540.0);
    settings
}

fn plan() -> ScanPlan {
    ScanPlan::stepped(13157.0, 13157.2, 0.1, FrequencyUnit::Wavenumber).unwrap()
}

#[tokio::test(start_paused = true)]
async fn scan_writes_csv_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("o2_a_band.csv");
    let settings = scan_settings();
    let session = InstrumentSession::simulated(&settings).await.unwrap();
    session.identify_all().await;

    let sequencer = AcquisitionSequencer::new();
    let mut events = sequencer.subscribe();
    let mut recorder = CsvRecorder::new(&output);
    let (_cancel_tx, cancel) = watch::channel(false);

    let summary = sequencer
        .run(&session, &plan(), &mut recorder, cancel)
        .await
        .unwrap();
    session.close().await.unwrap();

    assert_eq!(summary.points, 3);
    assert_eq!(summary.locked_points, 3);
    assert_eq!(summary.samples, 6);

    let text = std::fs::read_to_string(&output).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), CSV_HEADER.join(","));
    let rows: Vec<Vec<String>> = lines
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect();
    assert_eq!(rows.len(), 6);
    for (row, expected) in rows.iter().zip([13157.0, 13157.0, 13157.1, 13157.1, 13157.2, 13157.2]) {
        assert_eq!(row.len(), 7);
        chrono::DateTime::parse_from_rfc3339(&row[0]).unwrap();
        let ghz: f64 = row[1].parse().unwrap();
        let expected_ghz = pas_daq::frequency::Frequency::from_wavenumber(expected).ghz();
        assert!((ghz - expected_ghz).abs() < 0.01, "{} vs {}", ghz, expected_ghz);
        let power: f64 = row[4].parse().unwrap();
        assert!(power > 0.0);
        assert!(!row[5].is_empty());
    }

    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(metadata_path(&output)).unwrap()).unwrap();
    assert_eq!(meta["simulated"], true);
    assert_eq!(meta["plan"].as_array().unwrap().len(), 3);
    assert_eq!(meta["scan"]["averages"], 2);
    let lockin = meta["instruments"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["role"] == "lockin")
        .unwrap();
    assert!(lockin["identity"].as_str().unwrap().contains("SR830"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let finished = seen
        .iter()
        .filter(|e| matches!(e, ScanEvent::PointFinished { samples: 2, .. }))
        .count();
    assert_eq!(finished, 3);
    assert!(matches!(seen.last(), Some(ScanEvent::Finished(_))));
}

#[tokio::test(start_paused = true)]
async fn existing_output_is_refused_before_tuning() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("taken.csv");
    std::fs::write(&output, "keep me\n").unwrap();

    let settings = scan_settings();
    let session = InstrumentSession::simulated(&settings).await.unwrap();
    let grating_before = session.tuner().unwrap().wavelength_nm().await.unwrap();
    let reads_before = session.wavemeter().read_frequency().await.unwrap();

    let mut recorder = CsvRecorder::new(&output);
    let (_cancel_tx, cancel) = watch::channel(false);
    let err = AcquisitionSequencer::new()
        .run(&session, &plan(), &mut recorder, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::OutputExists(_)), "{err}");
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "keep me\n");
    assert_eq!(session.tuner().unwrap().wavelength_nm().await.unwrap(), grating_before);
    let reads_after = session.wavemeter().read_frequency().await.unwrap();
    assert!(reads_after.abs_diff(reads_before).mhz() < 5.0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_scan_keeps_collected_rows() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("cancelled.csv");
    let mut settings = scan_settings();
    settings.scan.save_every = 10;
    let session = InstrumentSession::simulated(&settings).await.unwrap();

    let sequencer = AcquisitionSequencer::new();
    let mut events = sequencer.subscribe();
    let (cancel_tx, cancel) = watch::channel(false);
    let canceller = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, ScanEvent::PointFinished { index: 0, .. }) {
                cancel_tx.send(true).unwrap();
                break;
            }
        }
    });

    let mut recorder = CsvRecorder::new(&output);
    let summary = sequencer
        .run(&session, &plan(), &mut recorder, cancel)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert!(summary.cancelled);
    assert!(summary.points >= 1 && summary.points < 3, "{:?}", summary);
    let text = std::fs::read_to_string(&output).unwrap();
    assert_eq!(text.lines().count(), 1 + summary.samples);
    assert!(summary.samples >= 2);
}
