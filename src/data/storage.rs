//! Session recorders.
//!
//! A [`SessionRecorder`] receives the session metadata once, then batches of
//! [`Measurement`]s as the sequencer flushes them, then a final `finish`.
//!
//! [`CsvRecorder`] writes the spectrometer's CSV layout:
//!
//! ```text
//! Time,Laser Frequency (GHz),Lock-in Channel X (Mic),Lock-in Channel Y (Mic),Laser Power,Temperature (C),Pressure
//! 2026-03-02T10:15:01.123456+00:00,394459.6125,0.0099,0.0005,0.02,22.5,
//! ```
//!
//! plus `<stem>.meta.json` next to it with the [`SessionMetadata`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use crate::session::SessionMetadata;

/// CSV header row.
pub const CSV_HEADER: [&str; 7] = [
    "Time",
    "Laser Frequency (GHz)",
    "Lock-in Channel X (Mic)",
    "Lock-in Channel Y (Mic)",
    "Laser Power",
    "Temperature (C)",
    "Pressure",
];

/// Destination of one session's samples.
#[async_trait]
pub trait SessionRecorder: Send {
    /// Prepare the output. Must fail with [`DaqError::OutputExists`] rather than
    /// overwrite earlier data.
    async fn begin(&mut self, metadata: &SessionMetadata) -> AppResult<()>;

    /// Append samples and make them durable.
    async fn write(&mut self, samples: &[Measurement]) -> AppResult<()>;

    /// Flush and release the output.
    async fn finish(&mut self) -> AppResult<()>;
}

/// Path of the metadata sidecar for `csv`.
pub fn metadata_path(csv: &Path) -> PathBuf {
    csv.with_extension("meta.json")
}

/// One CSV row for `m`. Missing temperature or pressure are empty fields.
pub fn csv_row(m: &Measurement) -> [String; 7] {
    [
        m.timestamp.to_rfc3339(),
        m.laser_frequency.ghz().to_string(),
        m.mic_x.to_string(),
        m.mic_y.to_string(),
        m.laser_power.to_string(),
        m.temperature_c.map(|t| t.to_string()).unwrap_or_default(),
        m.pressure.map(|p| p.to_string()).unwrap_or_default(),
    ]
}

/// A writer for CSV files.
#[cfg(feature = "storage_csv")]
pub struct CsvRecorder {
    path: PathBuf,
    writer: Option<csv::Writer<std::fs::File>>,
    rows: usize,
}

#[cfg(feature = "storage_csv")]
impl CsvRecorder {
    /// Recorder writing to `path` (created in [`SessionRecorder::begin`]).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            rows: 0,
        }
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// A writer for CSV files (compiled without `storage_csv`).
#[cfg(not(feature = "storage_csv"))]
pub struct CsvRecorder {
    path: PathBuf,
}

#[cfg(not(feature = "storage_csv"))]
impl CsvRecorder {
    /// Recorder writing to `path`. Every operation fails without `storage_csv`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
fn storage_error(e: impl std::fmt::Display) -> DaqError {
    DaqError::Storage(e.to_string())
}

#[async_trait]
impl SessionRecorder for CsvRecorder {
    async fn begin(&mut self, metadata: &SessionMetadata) -> AppResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = metadata;
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            let sidecar = metadata_path(&self.path);
            for existing in [&self.path, &sidecar] {
                if existing.exists() {
                    return Err(DaqError::OutputExists(existing.clone()));
                }
            }
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(storage_error)?;
            }

            let file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::AlreadyExists => DaqError::OutputExists(self.path.clone()),
                    _ => DaqError::Storage(format!(
                        "Failed to create {}: {}",
                        self.path.display(),
                        e
                    )),
                })?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(CSV_HEADER).map_err(storage_error)?;
            writer.flush().map_err(storage_error)?;

            let sidecar_written = serde_json::to_string_pretty(metadata)
                .map_err(DaqError::from)
                .and_then(|json| std::fs::write(&sidecar, json).map_err(storage_error));
            if let Err(e) = sidecar_written {
                drop(writer);
                // Leave nothing behind that would block a retry.
                if let Err(remove) = std::fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %remove, "Could not remove partial CSV");
                }
                return Err(e);
            }

            self.writer = Some(writer);
            tracing::info!(path = %self.path.display(), "CSV recorder started");
            Ok(())
        }
    }

    async fn write(&mut self, samples: &[Measurement]) -> AppResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = samples;
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            let writer = self.writer.as_mut().ok_or_else(|| {
                DaqError::Storage("CSV recorder written before begin()".to_string())
            })?;
            for sample in samples {
                writer.write_record(csv_row(sample)).map_err(storage_error)?;
            }
            writer.flush().map_err(storage_error)?;
            self.rows += samples.len();
            tracing::debug!(rows = samples.len(), total = self.rows, "Flushed samples");
            Ok(())
        }
    }

    async fn finish(&mut self) -> AppResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));

        #[cfg(feature = "storage_csv")]
        {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().map_err(storage_error)?;
            }
            tracing::info!(path = %self.path.display(), rows = self.rows, "CSV recorder finished");
            Ok(())
        }
    }
}

/// Recorder keeping everything in memory, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    inner: Arc<Mutex<MemoryLog>>,
}

#[derive(Default)]
struct MemoryLog {
    metadata: Option<SessionMetadata>,
    batches: Vec<Vec<Measurement>>,
    finished: bool,
}

impl MemoryRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata passed to `begin`.
    pub fn metadata(&self) -> Option<SessionMetadata> {
        self.log().metadata.clone()
    }

    /// Batches in the order they were written, including empty ones.
    pub fn batches(&self) -> Vec<Vec<Measurement>> {
        self.log().batches.clone()
    }

    /// All samples written.
    pub fn samples(&self) -> Vec<Measurement> {
        self.log().batches.iter().flatten().cloned().collect()
    }

    /// `finish` was called.
    pub fn is_finished(&self) -> bool {
        self.log().finished
    }

    fn log(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionRecorder for MemoryRecorder {
    async fn begin(&mut self, metadata: &SessionMetadata) -> AppResult<()> {
        self.log().metadata = Some(metadata.clone());
        Ok(())
    }

    async fn write(&mut self, samples: &[Measurement]) -> AppResult<()> {
        self.log().batches.push(samples.to_vec());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.log().finished = true;
        Ok(())
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::frequency::Frequency;
    use crate::session::InstrumentSession;
    use chrono::Utc;

    fn sample(temperature: Option<f64>) -> Measurement {
        Measurement {
            timestamp: Utc::now(),
            setpoint: Frequency::from_ghz(394_459.6),
            laser_frequency: Frequency::from_ghz(394_459.6125),
            mic_x: 0.0099,
            mic_y: 0.0005,
            laser_power: 0.02,
            temperature_c: temperature,
            pressure: None,
        }
    }

    async fn metadata() -> SessionMetadata {
        InstrumentSession::simulated(&Settings::default())
            .await
            .unwrap()
            .metadata()
    }

    #[test]
    fn row_leaves_missing_readings_empty() {
        let row = csv_row(&sample(None));
        assert_eq!(row[1], "394459.6125");
        assert_eq!(row[5], "");
        assert_eq!(row[6], "");
        assert_eq!(csv_row(&sample(Some(22.5)))[5], "22.5");
    }

    #[tokio::test]
    async fn writes_header_rows_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("scan.csv");
        let mut recorder = CsvRecorder::new(&path);

        recorder.begin(&metadata().await).await.unwrap();
        recorder.write(&[sample(Some(22.5)), sample(None)]).await.unwrap();
        recorder.write(&[]).await.unwrap();
        recorder.finish().await.unwrap();
        assert_eq!(recorder.rows(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert!(lines[1].ends_with(",394459.6125,0.0099,0.0005,0.02,22.5,"), "{}", lines[1]);
        assert!(lines[2].ends_with(",0.02,,"), "{}", lines[2]);

        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("runs/scan.meta.json")).unwrap())
                .unwrap();
        assert!(meta["run_id"].is_string());
    }

    #[tokio::test]
    async fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        std::fs::write(&path, "old data").unwrap();

        let mut recorder = CsvRecorder::new(&path);
        let err = recorder.begin(&metadata().await).await.unwrap_err();
        assert!(matches!(err, DaqError::OutputExists(_)), "{err}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_sidecar_removes_the_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let sidecar = metadata_path(&path);
        std::os::unix::fs::symlink(dir.path().join("missing/scan.meta.json"), &sidecar).unwrap();

        let mut recorder = CsvRecorder::new(&path);
        assert!(recorder.begin(&metadata().await).await.is_err());
        assert!(!path.exists());

        std::fs::remove_file(&sidecar).unwrap();
        let mut retry = CsvRecorder::new(&path);
        retry.begin(&metadata().await).await.unwrap();
        retry.finish().await.unwrap();
        assert!(path.exists() && sidecar.exists());
    }

    #[tokio::test]
    async fn write_before_begin_is_an_error() {
        let mut recorder = CsvRecorder::new("unused.csv");
        assert!(recorder.write(&[sample(None)]).await.is_err());
    }

    #[tokio::test]
    async fn memory_recorder_keeps_batches() {
        let recorder = MemoryRecorder::new();
        let mut writer = recorder.clone();
        writer.begin(&metadata().await).await.unwrap();
        writer.write(&[sample(None)]).await.unwrap();
        writer.write(&[]).await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(recorder.batches().len(), 2);
        assert_eq!(recorder.samples().len(), 1);
        assert!(recorder.is_finished());
        assert!(recorder.metadata().is_some());
    }
}
