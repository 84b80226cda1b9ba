//! CLI Entry Point for pas_daq
//!
//! Provides command-line interface for:
//! - Running a frequency scan into a CSV file
//! - Identifying the configured instruments and reporting their status
//! - Holding the laser locked to a frequency
//! - Logging wavemeter readings
//!
//! # Usage
//!
//! ```bash
//! pas_daq --simulate scan --output o2.csv --start 13150 --stop 13152 --step 0.05 --unit cm-1
//! pas_daq --config config/pas_daq.toml lock --target "760.01 nm" --duration 5m
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use pas_daq::config::Settings;
use pas_daq::data::CsvRecorder;
use pas_daq::error::{AppResult, DaqError};
use pas_daq::experiment::{AcquisitionSequencer, ScanEvent, ScanPlan};
use pas_daq::frequency::{Frequency, FrequencyUnit};
use pas_daq::procedures::LockState;
use pas_daq::session::InstrumentSession;
use pas_daq::tracing_setup;

#[derive(Parser)]
#[command(name = "pas_daq")]
#[command(about = "Photoacoustic spectrometer acquisition and laser control", long_about = None)]
struct Cli {
    /// Settings file (defaults to config/pas_daq.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated rig instead of real instruments
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step the laser across a plan and record the photoacoustic signal
    Scan {
        /// Output CSV, resolved against storage.output_dir
        #[arg(long)]
        output: PathBuf,

        /// First setpoint
        #[arg(long, requires_all = ["stop", "step"], conflicts_with = "points")]
        start: Option<f64>,

        /// Last setpoint (inclusive)
        #[arg(long)]
        stop: Option<f64>,

        /// Setpoint spacing
        #[arg(long)]
        step: Option<f64>,

        /// Unit of start/stop/step and of unitless lines in --points
        #[arg(long)]
        unit: Option<FrequencyUnit>,

        /// File with one setpoint per line
        #[arg(long)]
        points: Option<PathBuf>,
    },

    /// Print the identity of every connected instrument
    Identify,

    /// Print a snapshot of every reading
    Status,

    /// Lock the laser to a frequency and hold it
    Lock {
        /// Target, e.g. "760.01 nm" or "13157.7 cm-1"
        #[arg(long)]
        target: Frequency,

        /// How long to hold the lock (until Ctrl-C if omitted)
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Skip the grating coarse tuning
        #[arg(long)]
        no_tune: bool,
    },

    /// Print wavemeter readings
    Wavemeter {
        /// Number of readings
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// Pause between readings
        #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
        interval: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::load().context("Failed to load settings")?,
    };
    settings.validate().context("Invalid settings")?;
    tracing_setup::init_from_settings(&settings).context("Failed to initialise logging")?;

    let session = open_session(&settings, cli.simulate).await?;
    let result = match cli.command {
        Commands::Scan {
            output,
            start,
            stop,
            step,
            unit,
            points,
        } => {
            let unit = unit.unwrap_or(settings.scan.unit);
            let plan = match (start, stop, step, points) {
                (Some(start), Some(stop), Some(step), None) => {
                    ScanPlan::stepped(start, stop, step, unit)?
                }
                (None, None, None, Some(file)) => ScanPlan::from_file(&file, unit)
                    .with_context(|| format!("Failed to read plan {}", file.display()))?,
                (None, None, None, None) => ScanPlan::from_config(&settings.scan)?.context(
                    "No scan plan: give --start/--stop/--step, --points, or [scan] start/stop/step",
                )?,
                _ => bail!("Use either --start/--stop/--step or --points"),
            };
            run_scan(&session, &plan, settings.storage.resolve(&output)).await
        }
        Commands::Identify => identify(&session).await,
        Commands::Status => status(&session).await,
        Commands::Lock {
            target,
            duration,
            no_tune,
        } => hold_lock(&session, target, duration, no_tune).await,
        Commands::Wavemeter { count, interval } => wavemeter(&session, count, interval).await,
    };

    let closed = session.close().await;
    result?;
    closed.context("Instrument shutdown failed")?;
    Ok(())
}

async fn open_session(settings: &Settings, simulate: bool) -> Result<InstrumentSession> {
    if simulate {
        InstrumentSession::simulated(settings)
            .await
            .context("Failed to build simulated rig")
    } else {
        InstrumentSession::connect(settings)
            .await
            .context("Failed to connect instruments")
    }
}

/// Watch channel set to `true` on Ctrl-C.
fn ctrl_c_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, stopping");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_scan(session: &InstrumentSession, plan: &ScanPlan, output: PathBuf) -> Result<()> {
    session.identify_all().await;
    let sequencer = AcquisitionSequencer::new();
    let mut events = sequencer.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ScanEvent::PointStarted { index, setpoint }) => {
                    println!(
                        "[{}] {:.4} cm-1 ({:.6} nm)",
                        index + 1,
                        setpoint.wavenumber(),
                        setpoint.nm()
                    );
                }
                Ok(ScanEvent::PointSkipped { reason, .. }) => println!("    skipped: {}", reason),
                Ok(ScanEvent::PointFinished { samples, .. }) => println!("    {} samples", samples),
                Ok(ScanEvent::Finished(_)) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(missed = n, "Progress display lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recorder = CsvRecorder::new(&output);
    let result = sequencer
        .run(session, plan, &mut recorder, ctrl_c_signal())
        .await;
    drop(sequencer);
    let _ = progress.await;

    let summary = result.with_context(|| format!("Scan into {} failed", output.display()))?;
    println!(
        "{} of {} setpoints recorded ({} samples) to {}{}",
        summary.locked_points,
        plan.len(),
        summary.samples,
        output.display(),
        if summary.cancelled { ", cancelled" } else { "" }
    );
    if summary.cancelled {
        return Err(DaqError::Cancelled.into());
    }
    Ok(())
}

async fn identify(session: &InstrumentSession) -> Result<()> {
    for record in session.identify_all().await {
        println!(
            "{:<20} {:<28} {}",
            record.role,
            record.resource,
            record.identity.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn status(session: &InstrumentSession) -> Result<()> {
    let frequency = session
        .wavemeter()
        .read_frequency()
        .await
        .context("Wavemeter read failed")?;
    println!(
        "Laser frequency   {:.4} GHz  ({:.6} nm, {:.4} cm-1)",
        frequency.ghz(),
        frequency.nm(),
        frequency.wavenumber()
    );
    println!("Piezo offset      {:.3} V", session.piezo().piezo_voltage().await?);
    if let Some(tuner) = session.tuner() {
        println!("Grating           {:.4} nm", tuner.wavelength_nm().await?);
    }
    if let Some(diagnostics) = session.diagnostics() {
        let laser = diagnostics.system_status().await?;
        if laser.is_ok() {
            println!("Laser status      OK");
        } else {
            println!("Laser status      {} ({})", laser.code, laser.faults.join("; "));
        }
        println!("Diode current     {:.1} mA", diagnostics.current_ma().await?);
        println!("Working hours     {}", diagnostics.working_hours().await?);
    }
    let (x, y) = session.lockin().read_xy().await?;
    println!("Lock-in X / Y     {:.4e} V / {:.4e} V", x, y);
    println!("Laser power       {:.4e} W", session.power_meter().read().await?);
    if let Some(thermometer) = session.thermometer() {
        println!("Temperature       {:.2} C", thermometer.read().await?);
    }
    if let Some(gauge) = session.pressure_gauge() {
        println!("Pressure          {:.2}", gauge.read().await?);
    }
    if let Some(generator) = session.function_generator() {
        println!("Acoustic drive    {:.2} Hz", generator.frequency().await?);
    }
    Ok(())
}

async fn hold_lock(
    session: &InstrumentSession,
    target: Frequency,
    duration: Option<Duration>,
    no_tune: bool,
) -> Result<()> {
    let settings = session.settings();
    let laser = session.laser();
    if !no_tune {
        let reached = laser
            .go_to_frequency(target, &settings.tuning, &settings.lock)
            .await?;
        println!("Coarse tuning {}", if reached { "reached target" } else { "did not settle" });
    }

    let lock = laser.lock(target, &settings.lock).await?;
    let mut states = lock.subscribe();
    let mut cancel = ctrl_c_signal();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.changed() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("Lock {:?}", state);
                if state.is_terminal() {
                    break;
                }
            }
        }
    }

    let final_state = lock.state();
    let stopped = laser.stop_locking().await;
    lock_outcome(target, final_state, stopped)
}

/// Result of a held lock. A failed lock is reported as such even when stopping it
/// returned the lock error.
fn lock_outcome(target: Frequency, final_state: LockState, stopped: AppResult<()>) -> Result<()> {
    if final_state == LockState::Failed {
        stopped.with_context(|| format!("Lock to {} failed", target))?;
        bail!("Lock to {} failed", target);
    }
    stopped.with_context(|| format!("Lock to {} ended with an error", target))
}

async fn wavemeter(session: &InstrumentSession, count: u32, interval: Duration) -> Result<()> {
    let cancel = ctrl_c_signal();
    for i in 0..count {
        if *cancel.borrow() {
            break;
        }
        match session.wavemeter().read_frequency().await {
            Ok(f) => println!("{:.4} GHz  {:.6} nm  {:.4} cm-1", f.ghz(), f.nm(), f.wavenumber()),
            Err(e) => println!("read failed: {}", e),
        }
        if i + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Frequency {
        Frequency::from_nm(760.01)
    }

    #[test]
    fn failed_lock_names_the_target() {
        let err = lock_outcome(
            target(),
            LockState::Failed,
            Err(DaqError::LockFailed {
                setpoint_ghz: target().ghz(),
                elapsed: Duration::from_secs(30),
            }),
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Lock to"), "{err}");
        assert!(err.to_string().contains("failed"), "{err}");
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::LockFailed { .. })
        ));

        let err = lock_outcome(target(), LockState::Failed, Ok(())).unwrap_err();
        assert!(err.to_string().contains("failed"), "{err}");
    }

    #[test]
    fn stopped_lock_is_success() {
        assert!(lock_outcome(target(), LockState::Stopped, Ok(())).is_ok());
        assert!(lock_outcome(target(), LockState::Locked, Ok(())).is_ok());
        let err = lock_outcome(
            target(),
            LockState::Locked,
            Err(DaqError::Instrument("piezo write failed".into())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ended with an error"), "{err}");
    }
}
