//! Acquisition sequencer.
//!
//! Runs one scan: for every setpoint of a [`ScanPlan`] the laser is coarse-tuned,
//! locked, and sampled `averages` times while the lock holds. Samples are buffered
//! and handed to the [`SessionRecorder`] every `save_every` setpoints, and once more
//! at the end whatever happened.
//!
//! ```text
//! begin ─▶ [function generator] ─▶ for each setpoint:
//!            flush? ─▶ go_to_frequency ─▶ lock ─▶ wait_locked(lock_wait)
//!              ─▶ averages × (lock-in XY, power, frequency, T, p) ─▶ stop_locking
//!        ─▶ final flush ─▶ finish
//! ```
//!
//! Progress is broadcast as [`ScanEvent`]s.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::Instrument;

use crate::error::{AppResult, DaqError};
use crate::error_recovery::retry_transient;
use crate::experiment::plan::ScanPlan;
use crate::frequency::Frequency;
use crate::data::SessionRecorder;
use crate::measurement::Measurement;
use crate::procedures::LockWatch;
use crate::session::InstrumentSession;

/// Capacity of the progress channel.
const EVENT_CAPACITY: usize = 256;

/// Progress of a running scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Recorder is ready, first setpoint next
    Started {
        /// Setpoints in the plan
        points: usize,
    },
    /// Tuning to a setpoint
    PointStarted {
        /// Position in the plan
        index: usize,
        /// Target frequency
        setpoint: Frequency,
    },
    /// Setpoint sampled
    PointFinished {
        /// Position in the plan
        index: usize,
        /// Target frequency
        setpoint: Frequency,
        /// Samples taken
        samples: usize,
    },
    /// Setpoint abandoned
    PointSkipped {
        /// Position in the plan
        index: usize,
        /// Target frequency
        setpoint: Frequency,
        /// Why
        reason: String,
    },
    /// Buffered samples handed to the recorder
    Flushed {
        /// Samples written
        samples: usize,
    },
    /// Scan over
    Finished(ScanSummary),
}

/// Counts for a completed (or cancelled) scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Setpoints visited
    pub points: usize,
    /// Setpoints where the lock was acquired and samples taken
    pub locked_points: usize,
    /// Setpoints skipped
    pub skipped_points: usize,
    /// Samples recorded
    pub samples: usize,
    /// The scan stopped early on request
    pub cancelled: bool,
}

enum PointOutcome {
    Sampled(usize),
    Skipped(String),
}

/// Drives scans over an [`InstrumentSession`].
pub struct AcquisitionSequencer {
    events: broadcast::Sender<ScanEvent>,
}

impl Default for AcquisitionSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionSequencer {
    /// Sequencer with no subscribers yet.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { events }
    }

    /// Receive progress events of subsequent scans.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run `plan`, recording into `recorder`.
    ///
    /// Setting `cancel` to `true` stops the scan between setpoints or samples; the
    /// buffered samples are still written and the summary has `cancelled` set.
    /// Tuning, lock and read errors that are not transient abort the scan after the
    /// buffered samples have been written.
    pub async fn run<R>(
        &self,
        session: &InstrumentSession,
        plan: &ScanPlan,
        recorder: &mut R,
        cancel: watch::Receiver<bool>,
    ) -> AppResult<ScanSummary>
    where
        R: SessionRecorder + ?Sized,
    {
        if plan.is_empty() {
            return Err(DaqError::Configuration("Scan plan is empty".to_string()));
        }

        let span = tracing::info_span!("scan", run_id = %session.run_id(), points = plan.len());
        async move {
            let mut metadata = session.metadata();
            metadata.plan = plan.points().to_vec();
            recorder.begin(&metadata).await?;
            self.emit(ScanEvent::Started { points: plan.len() });

            let mut summary = ScanSummary::default();
            let mut pending = Vec::new();
            let outcome = self
                .acquire(session, plan, recorder, cancel, &mut summary, &mut pending)
                .await;

            let flushed = self.flush(recorder, &mut pending).await;
            let finished = recorder.finish().await;
            if let Err(e) = outcome {
                if let Err(flush_error) = flushed.and(finished) {
                    tracing::error!(error = %flush_error, "Could not save buffered samples");
                }
                tracing::error!(error = %e, points = summary.points, "Scan aborted");
                return Err(e);
            }
            flushed?;
            finished?;

            tracing::info!(
                points = summary.points,
                locked = summary.locked_points,
                skipped = summary.skipped_points,
                samples = summary.samples,
                cancelled = summary.cancelled,
                "Scan finished"
            );
            self.emit(ScanEvent::Finished(summary.clone()));
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn acquire<R>(
        &self,
        session: &InstrumentSession,
        plan: &ScanPlan,
        recorder: &mut R,
        mut cancel: watch::Receiver<bool>,
        summary: &mut ScanSummary,
        pending: &mut Vec<Measurement>,
    ) -> AppResult<()>
    where
        R: SessionRecorder + ?Sized,
    {
        let settings = session.settings();
        if let Some(hz) = settings.scan.acoustic_frequency_hz {
            match session.function_generator() {
                Some(generator) => {
                    retry_transient(&settings.retry, "function generator frequency", move || {
                        generator.set_frequency(hz)
                    })
                    .await?;
                    tracing::info!(hz, "Acoustic modulation set");
                }
                None => tracing::warn!(hz, "No function generator, acoustic frequency not set"),
            }
        }

        let save_every = settings.scan.save_every.max(1);
        for (index, &setpoint) in plan.points().iter().enumerate() {
            if *cancel.borrow() {
                summary.cancelled = true;
                tracing::warn!(index, "Scan cancelled");
                return Ok(());
            }
            if index % save_every == 0 {
                self.flush(recorder, pending).await?;
            }

            self.emit(ScanEvent::PointStarted { index, setpoint });
            let span = tracing::info_span!("point", index, setpoint = %setpoint);
            let outcome = self
                .measure_point(session, setpoint, pending, &mut cancel)
                .instrument(span)
                .await?;
            summary.points += 1;
            match outcome {
                PointOutcome::Sampled(samples) => {
                    summary.locked_points += 1;
                    summary.samples += samples;
                    self.emit(ScanEvent::PointFinished {
                        index,
                        setpoint,
                        samples,
                    });
                }
                PointOutcome::Skipped(reason) => {
                    summary.skipped_points += 1;
                    tracing::warn!(index, setpoint = %setpoint, reason = %reason, "Setpoint skipped");
                    self.emit(ScanEvent::PointSkipped {
                        index,
                        setpoint,
                        reason,
                    });
                }
            }
        }
        if *cancel.borrow() {
            summary.cancelled = true;
        }
        Ok(())
    }

    async fn measure_point(
        &self,
        session: &InstrumentSession,
        setpoint: Frequency,
        pending: &mut Vec<Measurement>,
        cancel: &mut watch::Receiver<bool>,
    ) -> AppResult<PointOutcome> {
        let settings = session.settings();
        let laser = session.laser();

        let tuned = laser
            .go_to_frequency(setpoint, &settings.tuning, &settings.lock)
            .await?;
        if !tuned {
            tracing::debug!("Coarse tuning did not settle, relying on the measurement lock");
        }

        let lock = laser.lock(setpoint, &settings.lock).await?;
        let sampled = self
            .sample_while_locked(session, &lock, setpoint, pending, cancel)
            .await;

        match laser.stop_locking().await {
            Ok(()) | Err(DaqError::LockFailed { .. }) => sampled,
            Err(e) => match sampled {
                Ok(_) => Err(e),
                Err(sample_error) => {
                    tracing::warn!(error = %e, "Lock ended with an error");
                    Err(sample_error)
                }
            },
        }
    }

    async fn sample_while_locked(
        &self,
        session: &InstrumentSession,
        lock: &LockWatch,
        setpoint: Frequency,
        pending: &mut Vec<Measurement>,
        cancel: &mut watch::Receiver<bool>,
    ) -> AppResult<PointOutcome> {
        let scan = &session.settings().scan;
        if !lock.wait_locked(scan.lock_wait).await {
            return Ok(PointOutcome::Skipped(format!(
                "lock not acquired within {}",
                humantime::format_duration(scan.lock_wait)
            )));
        }

        let mut taken = 0;
        for i in 0..scan.averages {
            if *cancel.borrow() {
                break;
            }
            // Only sample while the lock still holds.
            if !lock.is_locked() {
                tracing::warn!(samples = taken, "Lock lost, ending setpoint early");
                break;
            }
            let mut states = lock.subscribe();
            states.borrow_and_update();
            let sample = self.sample(session, setpoint).await?;
            // Keep the sample only if the lock held for all of it.
            if states.has_changed().unwrap_or(true) {
                tracing::warn!(samples = taken, "Lock lost while sampling, ending setpoint early");
                break;
            }
            pending.push(sample);
            taken += 1;
            if i + 1 < scan.averages && pause(cancel, scan.sample_interval).await {
                break;
            }
        }
        if taken == 0 {
            Ok(PointOutcome::Skipped("lock lost before sampling".to_string()))
        } else {
            Ok(PointOutcome::Sampled(taken))
        }
    }

    async fn sample(&self, session: &InstrumentSession, setpoint: Frequency) -> AppResult<Measurement> {
        let retry = &session.settings().retry;
        let timestamp = Utc::now();
        let (mic_x, mic_y) =
            retry_transient(retry, "lock-in read", move || session.lockin().read_xy()).await?;
        let laser_power =
            retry_transient(retry, "power meter read", move || session.power_meter().read()).await?;
        let laser_frequency = retry_transient(retry, "wavemeter read", move || {
            session.wavemeter().read_frequency()
        })
        .await?;
        let temperature_c = match session.thermometer() {
            Some(thermometer) => {
                Some(retry_transient(retry, "temperature read", move || thermometer.read()).await?)
            }
            None => None,
        };
        let pressure = match session.pressure_gauge() {
            Some(gauge) => Some(retry_transient(retry, "pressure read", move || gauge.read()).await?),
            None => None,
        };

        let measurement = Measurement {
            timestamp,
            setpoint,
            laser_frequency,
            mic_x,
            mic_y,
            laser_power,
            temperature_c,
            pressure,
        };
        tracing::trace!(
            mic_r = measurement.mic_magnitude(),
            laser_power,
            frequency = %laser_frequency,
            "sample"
        );
        Ok(measurement)
    }

    async fn flush<R>(&self, recorder: &mut R, pending: &mut Vec<Measurement>) -> AppResult<()>
    where
        R: SessionRecorder + ?Sized,
    {
        if pending.is_empty() {
            return Ok(());
        }
        recorder.write(pending).await?;
        self.emit(ScanEvent::Flushed {
            samples: pending.len(),
        });
        pending.clear();
        Ok(())
    }
}

/// Sleep for `interval`. Returns `true` if cancellation was requested; any other
/// change of the watch leaves the sleep running.
async fn pause(cancel: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return *cancel.borrow(),
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow() => return true,
                Ok(()) => {}
                Err(_) => {
                    // Nobody can cancel any more.
                    (&mut sleep).await;
                    return *cancel.borrow();
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::data::MemoryRecorder;
    use crate::frequency::FrequencyUnit;
    use crate::hardware::capabilities::{FrequencyMeter, Identifiable, LockInAmplifier};
    use crate::hardware::mock::{SimulatedLockIn, SimulatedRig, SimulatedWavemeter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.scan.averages = 3;
        settings.scan.save_every = 2;
        settings.scan.acoustic_frequency_hz = Some(1540.0);
        settings
    }

    async fn session(settings: &Settings) -> InstrumentSession {
        InstrumentSession::simulated(settings).await.unwrap()
    }

    fn plan() -> ScanPlan {
        ScanPlan::stepped(760.0, 760.02, 0.01, FrequencyUnit::Nm).unwrap()
    }

    fn never_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test(start_paused = true)]
    async fn pause_runs_full_interval_unless_cancelled() {
        let (tx, mut rx) = watch::channel(false);
        let start = tokio::time::Instant::now();
        let resend = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(false).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx
        });
        assert!(!pause(&mut rx, Duration::from_millis(200)).await);
        assert!(start.elapsed() >= Duration::from_millis(200));

        let tx = resend.await.unwrap();
        let start = tokio::time::Instant::now();
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });
        assert!(pause(&mut rx, Duration::from_millis(200)).await);
        assert!(start.elapsed() < Duration::from_millis(200));
        drop(cancel.await.unwrap());

        let start = tokio::time::Instant::now();
        let mut orphan = never_cancel();
        assert!(!pause(&mut orphan, Duration::from_millis(200)).await);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_flushes_every_save_every_points() {
        let settings = settings();
        let session = session(&settings).await;
        let mut recorder = MemoryRecorder::new();
        let sequencer = AcquisitionSequencer::new();
        let mut events = sequencer.subscribe();

        let summary = sequencer
            .run(&session, &plan(), &mut recorder, never_cancel())
            .await
            .unwrap();

        assert_eq!(
            summary,
            ScanSummary {
                points: 3,
                locked_points: 3,
                skipped_points: 0,
                samples: 9,
                cancelled: false,
            }
        );
        let sizes: Vec<usize> = recorder.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![6, 3]);
        assert!(recorder.is_finished());
        assert_eq!(recorder.metadata().unwrap().plan.len(), 3);

        let samples = recorder.samples();
        assert!(samples.iter().all(|m| m.lock_error().mhz() < 10.0));
        assert!(samples.iter().all(|m| m.temperature_c.is_some() && m.pressure.is_some()));

        assert_eq!(events.recv().await.unwrap(), ScanEvent::Started { points: 3 });
        let generator = session.function_generator().unwrap();
        assert_eq!(generator.frequency().await.unwrap(), 1540.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unlockable_points_are_skipped() {
        let mut settings = settings();
        settings.scan.lock_wait = Duration::from_millis(50);
        let session = session(&settings).await;
        let mut recorder = MemoryRecorder::new();

        let summary = AcquisitionSequencer::new()
            .run(&session, &plan(), &mut recorder, never_cancel())
            .await
            .unwrap();
        assert_eq!(summary.skipped_points, 3);
        assert_eq!(summary.samples, 0);
        assert!(recorder.batches().is_empty());
        assert!(recorder.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scan_still_finishes_recorder() {
        let settings = settings();
        let session = session(&settings).await;
        let mut recorder = MemoryRecorder::new();
        let (tx, rx) = watch::channel(true);

        let summary = AcquisitionSequencer::new()
            .run(&session, &plan(), &mut recorder, rx)
            .await
            .unwrap();
        drop(tx);
        assert!(summary.cancelled);
        assert_eq!(summary.points, 0);
        assert!(recorder.is_finished());
    }

    /// Shared trigger: once armed, the laser reads `shift` off.
    #[derive(Default)]
    struct ModeHop {
        lockin_reads: AtomicU32,
        hopped: AtomicBool,
    }

    struct HoppingWavemeter {
        inner: Arc<SimulatedWavemeter>,
        hop: Arc<ModeHop>,
    }

    #[async_trait]
    impl Identifiable for HoppingWavemeter {
        async fn identify(&self) -> AppResult<String> {
            self.inner.identify().await
        }
    }

    #[async_trait]
    impl FrequencyMeter for HoppingWavemeter {
        async fn read_frequency(&self) -> AppResult<Frequency> {
            let f = self.inner.read_frequency().await?;
            if self.hop.hopped.load(Ordering::SeqCst) {
                Ok(f + Frequency::from_ghz(100.0))
            } else {
                Ok(f)
            }
        }
    }

    /// Lock-in whose `hop_at`-th read hops the laser and times out once.
    struct HoppingLockIn {
        inner: Arc<SimulatedLockIn>,
        hop: Arc<ModeHop>,
        hop_at: u32,
    }

    #[async_trait]
    impl Identifiable for HoppingLockIn {
        async fn identify(&self) -> AppResult<String> {
            self.inner.identify().await
        }
    }

    #[async_trait]
    impl LockInAmplifier for HoppingLockIn {
        async fn read_xy(&self) -> AppResult<(f64, f64)> {
            let n = self.hop.lockin_reads.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.hop_at {
                self.hop.hopped.store(true, Ordering::SeqCst);
                return Err(crate::error_recovery::timeout_error("OUTP? 1", Duration::from_secs(1)));
            }
            self.inner.read_xy().await
        }
    }

    async fn hopping_session(settings: &Settings, hop_at: u32) -> InstrumentSession {
        let rig = SimulatedRig::new(&settings.simulation, &settings.motor)
            .await
            .unwrap();
        let hop = Arc::new(ModeHop::default());
        InstrumentSession::builder(settings.clone())
            .laser(rig.laser, "sim")
            .wavemeter(
                Arc::new(HoppingWavemeter {
                    inner: rig.wavemeter,
                    hop: hop.clone(),
                }),
                "sim",
            )
            .lockin(
                Arc::new(HoppingLockIn {
                    inner: rig.lockin,
                    hop,
                    hop_at,
                }),
                "sim",
            )
            .power_meter(rig.power_meter, "sim")
            .tuner(rig.tuner, "sim")
            .build()
            .unwrap()
    }

    fn hop_settings() -> Settings {
        let mut settings = settings();
        settings.scan.averages = 4;
        // Long enough for the lock to notice the hop while the read is retried.
        settings.retry.backoff = Duration::from_secs(1);
        settings
    }

    #[tokio::test(start_paused = true)]
    async fn lock_lost_mid_point_keeps_earlier_samples() {
        let settings = hop_settings();
        let session = hopping_session(&settings, 3).await;
        let mut recorder = MemoryRecorder::new();
        let sequencer = AcquisitionSequencer::new();
        let mut events = sequencer.subscribe();
        let setpoint = Frequency::from_nm(760.0);

        let summary = sequencer
            .run(&session, &ScanPlan::from_points(vec![setpoint]), &mut recorder, never_cancel())
            .await
            .unwrap();

        assert_eq!(summary.locked_points, 1);
        assert_eq!(summary.samples, 2);
        assert_eq!(recorder.samples().len(), 2);
        assert!(recorder.samples().iter().all(|m| m.lock_error().mhz() < 10.0));

        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let ScanEvent::PointFinished { samples, .. } = event {
                finished = Some(samples);
            }
        }
        assert_eq!(finished, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_lost_during_first_sample_skips_point() {
        let settings = hop_settings();
        let session = hopping_session(&settings, 1).await;
        let mut recorder = MemoryRecorder::new();
        let sequencer = AcquisitionSequencer::new();
        let mut events = sequencer.subscribe();
        let setpoint = Frequency::from_nm(760.0);

        let summary = sequencer
            .run(&session, &ScanPlan::from_points(vec![setpoint]), &mut recorder, never_cancel())
            .await
            .unwrap();

        assert_eq!(summary.skipped_points, 1);
        assert_eq!(summary.samples, 0);
        assert!(recorder.batches().is_empty());

        let mut skipped = None;
        while let Ok(event) = events.try_recv() {
            if let ScanEvent::PointSkipped { index, reason, .. } = event {
                skipped = Some((index, reason));
            }
        }
        assert_eq!(skipped, Some((0, "lock lost before sampling".to_string())));
    }

    #[tokio::test]
    async fn empty_plan_is_rejected_before_recording() {
        let settings = settings();
        let session = session(&settings).await;
        let mut recorder = MemoryRecorder::new();
        let err = AcquisitionSequencer::new()
            .run(&session, &ScanPlan::from_points(Vec::new()), &mut recorder, never_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(recorder.metadata().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_setpoint_aborts_after_saving() {
        let settings = settings();
        let session = session(&settings).await;
        let mut recorder = MemoryRecorder::new();
        let plan = ScanPlan::from_points(vec![
            Frequency::from_nm(760.0),
            Frequency::from_nm(900.0),
        ]);

        let result = AcquisitionSequencer::new()
            .run(&session, &plan, &mut recorder, never_cancel())
            .await;
        assert!(result.is_err());
        assert_eq!(recorder.samples().len(), 3);
        assert!(recorder.is_finished());
    }
}
