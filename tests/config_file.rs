//! The shipped settings file loads, validates, and takes environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use pas_daq::config::Settings;
use pas_daq::frequency::FrequencyUnit;
use pas_daq::hardware::transport::{Parity, ResourceAddress};

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/pas_daq.toml")
}

#[test]
fn shipped_config_loads_and_validates() {
    let settings = Settings::load_from(shipped_config()).unwrap();
    settings.validate().unwrap();

    assert_eq!(settings.gpib.gateway.as_deref(), Some("192.168.1.50"));
    assert_eq!(settings.gpib.timeout, Duration::from_secs(3));

    let instruments = &settings.instruments;
    let laser = instruments.laser.as_ref().unwrap();
    assert_eq!(
        laser.resource,
        ResourceAddress::Gpib {
            board: 0,
            address: 12
        }
    );
    assert_eq!(laser.timeout, Duration::from_secs(2));

    let wavemeter = instruments.wavemeter.as_ref().unwrap();
    assert_eq!(
        wavemeter.connection.resource,
        ResourceAddress::TcpSocket {
            board: 0,
            host: "192.168.1.60".to_string(),
            port: 5025
        }
    );
    assert_eq!(wavemeter.unit, FrequencyUnit::THz);

    let thermometer = instruments.thermometer.as_ref().unwrap();
    let serial = thermometer.serial.as_ref().unwrap();
    assert_eq!(serial.data_bits, 7);
    assert_eq!(serial.parity, Parity::Odd);

    assert!((settings.lock.tolerance.mhz() - 3.0).abs() < 1e-9);
    assert_eq!(settings.lock.acquire_timeout, Duration::from_secs(30));
    assert!((settings.tuning.tolerance.mhz() - 10.0).abs() < 1e-9);
    assert_eq!(settings.scan.acoustic_frequency_hz, Some(1540.0));
    assert_eq!(settings.scan.unit, FrequencyUnit::Wavenumber);
    assert_eq!(settings.scan.sample_interval, Duration::from_millis(200));
    assert_eq!(settings.retry.max_attempts, 3);
}

#[test]
fn environment_overrides_the_file() {
    std::env::set_var("PAS_DAQ_SCAN__AVERAGES", "12");
    let settings = Settings::load_from(shipped_config());
    std::env::remove_var("PAS_DAQ_SCAN__AVERAGES");

    let settings = settings.unwrap();
    assert_eq!(settings.scan.averages, 12);
    assert_eq!(settings.scan.save_every, 5);
}

#[test]
fn missing_file_is_a_configuration_error() {
    let err = Settings::load_from("/nonexistent/pas_daq.toml").unwrap_err();
    assert!(err.to_string().contains("does not exist"), "{err}");
}
