//! Coarse tuning and the piezo lock driven through a session on the simulated rig.

use std::sync::Arc;
use std::time::Duration;

use pas_daq::config::Settings;
use pas_daq::frequency::Frequency;
use pas_daq::hardware::capabilities::{FrequencyMeter, WavelengthTuner};
use pas_daq::hardware::mock::{SimulatedRig, SimulatedWavemeter};
use pas_daq::procedures::LockState;
use pas_daq::session::InstrumentSession;

async fn session() -> (InstrumentSession, Arc<SimulatedWavemeter>) {
    let settings = Settings::default();
    let rig = SimulatedRig::new(&settings.simulation, &settings.motor)
        .await
        .unwrap();
    let wavemeter = rig.wavemeter.clone();
    (InstrumentSession::from_rig(settings, rig).unwrap(), wavemeter)
}

#[tokio::test(start_paused = true)]
async fn tune_then_lock_holds_the_target() {
    let (session, wavemeter) = session().await;
    let settings = session.settings().clone();
    let target = Frequency::from_nm(760.01);

    let reached = session
        .laser()
        .go_to_frequency(target, &settings.tuning, &settings.lock)
        .await
        .unwrap();
    assert!(reached);
    let grating = session.tuner().unwrap().wavelength_nm().await.unwrap();
    assert!((grating - 760.01).abs() < 0.05, "grating at {grating}");

    let lock = session.laser().lock(target, &settings.lock).await.unwrap();
    assert!(lock.wait_locked(Duration::from_secs(30)).await);
    assert_eq!(session.laser().lock_state().await, Some(LockState::Locked));

    // The lock keeps correcting while held.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(lock.is_locked());
    let measured = wavemeter.read_frequency().await.unwrap();
    assert!(measured.abs_diff(target).mhz() < 5.0, "{measured} vs {target}");

    session.laser().stop_locking().await.unwrap();
    assert_eq!(lock.state(), LockState::Stopped);
    assert_eq!(session.laser().lock_state().await, None);
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lock_rides_out_wavemeter_timeouts() {
    let (session, wavemeter) = session().await;
    let settings = session.settings().clone();
    let target = Frequency::from_nm(760.01);
    session
        .laser()
        .go_to_frequency(target, &settings.tuning, &settings.lock)
        .await
        .unwrap();

    wavemeter.inject_timeouts(3);
    let lock = session.laser().lock(target, &settings.lock).await.unwrap();
    assert!(lock.wait_locked(Duration::from_secs(30)).await);
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lock_without_tuning_fails_far_from_the_grating() {
    let (session, _wavemeter) = session().await;
    let mut params = session.settings().lock.clone();
    params.acquire_timeout = Duration::from_secs(5);

    // Grating is parked at 765 nm, far outside the piezo range.
    let lock = session
        .laser()
        .lock(Frequency::from_nm(760.01), &params)
        .await
        .unwrap();
    assert!(!lock.wait_locked(Duration::from_secs(10)).await);
    assert_eq!(lock.state(), LockState::Failed);

    let err = session.laser().stop_locking().await.unwrap_err();
    assert!(matches!(err, pas_daq::error::DaqError::LockFailed { .. }), "{err}");
    session.close().await.unwrap();
}
