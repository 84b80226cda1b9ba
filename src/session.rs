//! Instrument session for one acquisition run.
//!
//! An [`InstrumentSession`] owns every connected instrument, the
//! [`LaserController`] built on top of the laser and wavemeter, and a snapshot of
//! the [`Settings`] it was created from. Sessions come from three places:
//!
//! - [`InstrumentSession::connect`]: real hardware from `[instruments]`
//! - [`InstrumentSession::simulated`]: the simulated rig, for `--simulate`
//! - [`InstrumentSession::builder`]: any trait objects, e.g. a grating tuner bound
//!   to a vendor SDK
//!
//! The session ends with [`InstrumentSession::close`], which stops any running lock.
//!
//! ## Metadata
//!
//! [`SessionMetadata`] is the serialisable summary written next to the data file:
//! run id, start time, host, instrument inventory with identities, and the scan and
//! lock parameters in force.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::{InstrumentConfig, ScanConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::frequency::Frequency;
use crate::hardware::capabilities::{
    FrequencyMeter, FunctionGenerator, Identifiable, LaserDiagnostics, LockInAmplifier,
    PiezoActuator, Readable, WavelengthTuner,
};
use crate::hardware::ds335::Ds335;
use crate::hardware::lakeshore_211::LakeShore211;
use crate::hardware::mock::SimulatedRig;
use crate::hardware::newport_1830c::Newport1830C;
use crate::hardware::sacher_lion::SacherLion;
use crate::hardware::sr830::Sr830;
use crate::hardware::wavemeter::ScpiWavemeter;
use crate::hardware::{ConnectionDefaults, Connector};
use crate::procedures::{LaserController, LockParams, TuningParams};

/// Resource label used for simulated instruments.
const SIMULATED_RESOURCE: &str = "SIM";

/// One entry of the instrument inventory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentRecord {
    /// Role in the experiment (`laser`, `lockin`, ...)
    pub role: String,
    /// Resource string it was opened with
    pub resource: String,
    /// `*IDN?`-style identity, once queried
    pub identity: Option<String>,
}

/// Serialisable summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    /// Unique run id
    pub run_id: Uuid,
    /// When the session was opened
    pub started_at: DateTime<Utc>,
    /// Host the acquisition ran on
    pub host: String,
    /// Application name from the settings
    pub application: String,
    /// Whether the instruments were simulated
    pub simulated: bool,
    /// Connected instruments
    pub instruments: Vec<InstrumentRecord>,
    /// Acquisition cycle parameters
    pub scan: ScanConfig,
    /// Measurement lock parameters
    pub lock: LockParams,
    /// Coarse tuning parameters
    pub tuning: TuningParams,
    /// Setpoints of the scan, when attached by the sequencer
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<Frequency>,
}

/// The instruments of one acquisition run.
pub struct InstrumentSession {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    settings: Settings,
    simulated: bool,
    laser: Arc<LaserController>,
    piezo: Arc<dyn PiezoActuator>,
    wavemeter: Arc<dyn FrequencyMeter>,
    lockin: Arc<dyn LockInAmplifier>,
    power_meter: Arc<dyn Readable>,
    function_generator: Option<Arc<dyn FunctionGenerator>>,
    thermometer: Option<Arc<dyn Readable>>,
    pressure_gauge: Option<Arc<dyn Readable>>,
    diagnostics: Option<Arc<dyn LaserDiagnostics>>,
    tuner: Option<Arc<dyn WavelengthTuner>>,
    identifiable: Vec<(String, Arc<dyn Identifiable>)>,
    inventory: Mutex<Vec<InstrumentRecord>>,
}

impl InstrumentSession {
    /// Start building a session from trait objects.
    pub fn builder(settings: Settings) -> SessionBuilder {
        SessionBuilder::new(settings)
    }

    /// Open the hardware configured under `[instruments]`.
    ///
    /// The laser, wavemeter, lock-in and power meter are required. The grating tuner
    /// needs a vendor binding and is only available through [`Self::builder`].
    pub async fn connect(settings: &Settings) -> AppResult<Self> {
        let connector = Connector::new(settings.gpib.clone());
        let instruments = &settings.instruments;
        let mut builder = Self::builder(settings.clone());

        let config = required(&instruments.laser, "laser")?;
        let transport = connector.open(config, &SacherLion::connection_defaults()).await?;
        builder = builder.laser(Arc::new(SacherLion::new(transport)), config.resource.to_string());

        let wavemeter = instruments
            .wavemeter
            .as_ref()
            .ok_or_else(|| missing_role("wavemeter"))?;
        let transport = connector
            .open(&wavemeter.connection, &ScpiWavemeter::connection_defaults())
            .await?;
        builder = builder.wavemeter(
            Arc::new(ScpiWavemeter::with_query(
                transport,
                wavemeter.query.clone(),
                wavemeter.unit,
            )),
            wavemeter.connection.resource.to_string(),
        );

        let config = required(&instruments.lockin, "lockin")?;
        let transport = connector.open(config, &Sr830::connection_defaults()).await?;
        builder = builder.lockin(Arc::new(Sr830::new(transport)), config.resource.to_string());

        let config = required(&instruments.power_meter, "power_meter")?;
        let transport = connector.open(config, &Newport1830C::connection_defaults()).await?;
        builder = builder.power_meter(
            Arc::new(Newport1830C::new(transport)),
            config.resource.to_string(),
        );

        if let Some(config) = &instruments.function_generator {
            let transport = connector.open(config, &Ds335::connection_defaults()).await?;
            builder = builder.function_generator(
                Arc::new(Ds335::new(transport)),
                config.resource.to_string(),
            );
        }

        if let Some(config) = &instruments.thermometer {
            let transport = connector
                .open(config, &LakeShore211::connection_defaults())
                .await?;
            builder = builder.thermometer(
                Arc::new(LakeShore211::new(transport)),
                config.resource.to_string(),
            );
        }

        builder.build()
    }

    /// Session over the simulated rig described by `[simulation]`.
    pub async fn simulated(settings: &Settings) -> AppResult<Self> {
        let rig = SimulatedRig::new(&settings.simulation, &settings.motor).await?;
        Self::from_rig(settings.clone(), rig)
    }

    /// Session over an existing simulated rig.
    pub fn from_rig(settings: Settings, rig: SimulatedRig) -> AppResult<Self> {
        let mut session = Self::builder(settings)
            .laser(rig.laser, SIMULATED_RESOURCE)
            .wavemeter(rig.wavemeter, SIMULATED_RESOURCE)
            .lockin(rig.lockin, SIMULATED_RESOURCE)
            .power_meter(rig.power_meter, SIMULATED_RESOURCE)
            .function_generator(rig.function_generator, SIMULATED_RESOURCE)
            .thermometer(rig.thermometer, SIMULATED_RESOURCE)
            .pressure_gauge(rig.pressure_gauge, SIMULATED_RESOURCE)
            .tuner(rig.tuner, SIMULATED_RESOURCE)
            .build()?;
        session.simulated = true;
        Ok(session)
    }

    /// Unique id of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// When the session was opened.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Settings snapshot.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Instruments are simulated.
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Tuning and locking.
    pub fn laser(&self) -> &Arc<LaserController> {
        &self.laser
    }

    /// Laser piezo.
    pub fn piezo(&self) -> &Arc<dyn PiezoActuator> {
        &self.piezo
    }

    /// Wavelength meter.
    pub fn wavemeter(&self) -> &Arc<dyn FrequencyMeter> {
        &self.wavemeter
    }

    /// Microphone lock-in.
    pub fn lockin(&self) -> &Arc<dyn LockInAmplifier> {
        &self.lockin
    }

    /// Laser power meter.
    pub fn power_meter(&self) -> &Arc<dyn Readable> {
        &self.power_meter
    }

    /// Acoustic function generator.
    pub fn function_generator(&self) -> Option<&Arc<dyn FunctionGenerator>> {
        self.function_generator.as_ref()
    }

    /// Cell temperature, °C.
    pub fn thermometer(&self) -> Option<&Arc<dyn Readable>> {
        self.thermometer.as_ref()
    }

    /// Cell pressure.
    pub fn pressure_gauge(&self) -> Option<&Arc<dyn Readable>> {
        self.pressure_gauge.as_ref()
    }

    /// Laser status and counters.
    pub fn diagnostics(&self) -> Option<&Arc<dyn LaserDiagnostics>> {
        self.diagnostics.as_ref()
    }

    /// Grating tuner.
    pub fn tuner(&self) -> Option<&Arc<dyn WavelengthTuner>> {
        self.tuner.as_ref()
    }

    /// Query the identity of every identifiable instrument.
    ///
    /// Failures are logged and leave the identity empty. The result is remembered
    /// for [`Self::metadata`].
    pub async fn identify_all(&self) -> Vec<InstrumentRecord> {
        let mut identities = Vec::with_capacity(self.identifiable.len());
        for (role, instrument) in &self.identifiable {
            match instrument.identify().await {
                Ok(identity) => {
                    tracing::info!(role = %role, identity = %identity.trim(), "Identified instrument");
                    identities.push((role.clone(), identity.trim().to_string()));
                }
                Err(e) => tracing::warn!(role = %role, error = %e, "Identification failed"),
            }
        }

        let mut inventory = lock(&self.inventory);
        for (role, identity) in identities {
            if let Some(record) = inventory.iter_mut().find(|r| r.role == role) {
                record.identity = Some(identity);
            }
        }
        inventory.clone()
    }

    /// Snapshot of the session for the data sidecar.
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            run_id: self.run_id,
            started_at: self.started_at,
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            application: self.settings.application.name.clone(),
            simulated: self.simulated,
            instruments: lock(&self.inventory).clone(),
            scan: self.settings.scan.clone(),
            lock: self.settings.lock.clone(),
            tuning: self.settings.tuning.clone(),
            plan: Vec::new(),
        }
    }

    /// End the session, stopping any running lock.
    pub async fn close(self) -> AppResult<()> {
        let mut errors = Vec::new();
        match self.laser.stop_locking().await {
            Ok(()) | Err(DaqError::LockFailed { .. }) => {}
            Err(e) => errors.push(e),
        }
        if errors.is_empty() {
            tracing::info!(run_id = %self.run_id, "Session closed");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

/// Assembles an [`InstrumentSession`] from trait objects.
pub struct SessionBuilder {
    settings: Settings,
    piezo: Option<Arc<dyn PiezoActuator>>,
    wavemeter: Option<Arc<dyn FrequencyMeter>>,
    lockin: Option<Arc<dyn LockInAmplifier>>,
    power_meter: Option<Arc<dyn Readable>>,
    function_generator: Option<Arc<dyn FunctionGenerator>>,
    thermometer: Option<Arc<dyn Readable>>,
    pressure_gauge: Option<Arc<dyn Readable>>,
    diagnostics: Option<Arc<dyn LaserDiagnostics>>,
    tuner: Option<Arc<dyn WavelengthTuner>>,
    identifiable: Vec<(String, Arc<dyn Identifiable>)>,
    inventory: Vec<InstrumentRecord>,
}

impl SessionBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            piezo: None,
            wavemeter: None,
            lockin: None,
            power_meter: None,
            function_generator: None,
            thermometer: None,
            pressure_gauge: None,
            diagnostics: None,
            tuner: None,
            identifiable: Vec::new(),
            inventory: Vec::new(),
        }
    }

    fn record(&mut self, role: &str, resource: String) {
        self.inventory.retain(|r| r.role != role);
        self.identifiable.retain(|(r, _)| r != role);
        self.inventory.push(InstrumentRecord {
            role: role.to_string(),
            resource,
            identity: None,
        });
    }

    fn identified(&mut self, role: &str, resource: String, instrument: Arc<dyn Identifiable>) {
        self.record(role, resource);
        self.identifiable.push((role.to_string(), instrument));
    }

    /// Laser with piezo, diagnostics and identity.
    pub fn laser<L>(mut self, laser: Arc<L>, resource: impl Into<String>) -> Self
    where
        L: PiezoActuator + LaserDiagnostics + Identifiable + 'static,
    {
        self.identified("laser", resource.into(), laser.clone());
        self.diagnostics = Some(laser.clone());
        self.piezo = Some(laser);
        self
    }

    /// Bare piezo actuator, for lasers without diagnostics.
    pub fn piezo(mut self, piezo: Arc<dyn PiezoActuator>, resource: impl Into<String>) -> Self {
        self.record("laser", resource.into());
        self.diagnostics = None;
        self.piezo = Some(piezo);
        self
    }

    /// Wavelength meter.
    pub fn wavemeter<W>(mut self, wavemeter: Arc<W>, resource: impl Into<String>) -> Self
    where
        W: FrequencyMeter + Identifiable + 'static,
    {
        self.identified("wavemeter", resource.into(), wavemeter.clone());
        self.wavemeter = Some(wavemeter);
        self
    }

    /// Microphone lock-in amplifier.
    pub fn lockin<L>(mut self, lockin: Arc<L>, resource: impl Into<String>) -> Self
    where
        L: LockInAmplifier + Identifiable + 'static,
    {
        self.identified("lockin", resource.into(), lockin.clone());
        self.lockin = Some(lockin);
        self
    }

    /// Laser power meter.
    pub fn power_meter(mut self, meter: Arc<dyn Readable>, resource: impl Into<String>) -> Self {
        self.record("power_meter", resource.into());
        self.power_meter = Some(meter);
        self
    }

    /// Acoustic function generator.
    pub fn function_generator<G>(mut self, generator: Arc<G>, resource: impl Into<String>) -> Self
    where
        G: FunctionGenerator + Identifiable + 'static,
    {
        self.identified("function_generator", resource.into(), generator.clone());
        self.function_generator = Some(generator);
        self
    }

    /// Cell thermometer reading °C.
    pub fn thermometer<T>(mut self, thermometer: Arc<T>, resource: impl Into<String>) -> Self
    where
        T: Readable + Identifiable + 'static,
    {
        self.identified("thermometer", resource.into(), thermometer.clone());
        self.thermometer = Some(thermometer);
        self
    }

    /// Cell pressure gauge.
    pub fn pressure_gauge(mut self, gauge: Arc<dyn Readable>, resource: impl Into<String>) -> Self {
        self.record("pressure_gauge", resource.into());
        self.pressure_gauge = Some(gauge);
        self
    }

    /// Grating tuner used for coarse tuning.
    pub fn tuner(mut self, tuner: Arc<dyn WavelengthTuner>, resource: impl Into<String>) -> Self {
        self.record("tuner", resource.into());
        self.tuner = Some(tuner);
        self
    }

    /// Finish, checking that the required roles are present.
    pub fn build(self) -> AppResult<InstrumentSession> {
        let piezo = self.piezo.ok_or_else(|| missing_role("laser"))?;
        let wavemeter = self.wavemeter.ok_or_else(|| missing_role("wavemeter"))?;
        let lockin = self.lockin.ok_or_else(|| missing_role("lockin"))?;
        let power_meter = self.power_meter.ok_or_else(|| missing_role("power_meter"))?;

        let laser = Arc::new(LaserController::new(
            piezo.clone(),
            wavemeter.clone(),
            self.tuner.clone(),
        ));
        let session = InstrumentSession {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            settings: self.settings,
            simulated: false,
            laser,
            piezo,
            wavemeter,
            lockin,
            power_meter,
            function_generator: self.function_generator,
            thermometer: self.thermometer,
            pressure_gauge: self.pressure_gauge,
            diagnostics: self.diagnostics,
            tuner: self.tuner,
            identifiable: self.identifiable,
            inventory: Mutex::new(self.inventory),
        };
        tracing::info!(
            run_id = %session.run_id,
            instruments = lock(&session.inventory).len(),
            "Instrument session opened"
        );
        Ok(session)
    }
}

fn required<'a>(config: &'a Option<InstrumentConfig>, role: &str) -> AppResult<&'a InstrumentConfig> {
    config.as_ref().ok_or_else(|| missing_role(role))
}

fn missing_role(role: &str) -> DaqError {
    DaqError::Configuration(format!(
        "No instrument configured for required role '{}' (instruments.{})",
        role, role
    ))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
