//! Guided calibration workflows: moisture probe, tank depth, pump flow.
//!
//! All three walk the same step machine, observable through a `watch`
//! channel so a front end can render progress:
//!
//! `Idle -> MeasuringFirstPoint -> AwaitingUserAction -> MeasuringSecondPoint
//! -> Ready -> Saved`
//!
//! `advance()` drives the machine forward, `cancel()` aborts from any
//! non-terminal state.  A cancelled measurement task exits without touching
//! the session, so nothing half-measured ever gets persisted.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::pump::PumpController;
use crate::sensor::{DepthCalibration, MoistureCalibration, MoistureReader, TankReader};
use crate::store::{
    LocalCache, KEY_DEPTH_CALIBRATION, KEY_MOISTURE_CALIBRATION, KEY_PUMP_CAPACITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    Idle,
    MeasuringFirstPoint,
    AwaitingUserAction,
    MeasuringSecondPoint,
    Ready,
    Saved,
}

/// Raw-sample spacing during a moisture sweep.
const SWEEP_SAMPLE_PERIOD: Duration = Duration::from_millis(50);
/// Length of one moisture sweep unless overridden.
pub const DEFAULT_SWEEP_DURATION: Duration = Duration::from_secs(10);
/// Water volume the pump calibration times by default, liters.
pub const DEFAULT_PUMP_CAL_VOLUME_L: f64 = 0.5;

struct SweepTask {
    handle: CancelHandle,
    join: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Moisture: two sweeps, dry endpoint then wet endpoint
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum SweepPhase {
    /// Probe held in dry air; the endpoint is the highest raw value seen.
    DryAir,
    /// Probe submerged; the endpoint is the lowest raw value seen.
    Submerged,
}

#[derive(Default)]
struct MoistureSession {
    dry: Option<f64>,
    wet: Option<f64>,
}

struct MoistureShared {
    step_tx: watch::Sender<CalibrationStep>,
    session: StdMutex<MoistureSession>,
}

pub struct MoistureCalibrator {
    reader: Arc<MoistureReader>,
    cache: Arc<LocalCache>,
    sweep_duration: Duration,
    shared: Arc<MoistureShared>,
    task: Mutex<Option<SweepTask>>,
}

impl MoistureCalibrator {
    pub fn new(reader: Arc<MoistureReader>, cache: Arc<LocalCache>) -> Self {
        Self::with_sweep_duration(reader, cache, DEFAULT_SWEEP_DURATION)
    }

    pub fn with_sweep_duration(
        reader: Arc<MoistureReader>,
        cache: Arc<LocalCache>,
        sweep_duration: Duration,
    ) -> Self {
        let (step_tx, _) = watch::channel(CalibrationStep::Idle);
        Self {
            reader,
            cache,
            sweep_duration,
            shared: Arc::new(MoistureShared {
                step_tx,
                session: StdMutex::new(MoistureSession::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn step(&self) -> CalibrationStep {
        *self.shared.step_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CalibrationStep> {
        self.shared.step_tx.subscribe()
    }

    pub async fn advance(&self) -> Result<CalibrationStep> {
        let mut task = self.task.lock().await;
        match self.step() {
            CalibrationStep::Idle => {
                self.shared.session.lock().expect("session lock poisoned").dry = None;
                self.shared.step_tx.send_replace(CalibrationStep::MeasuringFirstPoint);
                *task = Some(self.spawn_sweep(SweepPhase::DryAir));
            }
            CalibrationStep::AwaitingUserAction => {
                self.shared.session.lock().expect("session lock poisoned").wet = None;
                self.shared.step_tx.send_replace(CalibrationStep::MeasuringSecondPoint);
                *task = Some(self.spawn_sweep(SweepPhase::Submerged));
            }
            CalibrationStep::Ready => {
                self.save()?;
            }
            CalibrationStep::MeasuringFirstPoint | CalibrationStep::MeasuringSecondPoint => {
                bail!("a measurement sweep is running");
            }
            CalibrationStep::Saved => bail!("calibration already saved"),
        }
        Ok(self.step())
    }

    /// Abort the session.  Joins any running sweep so no late sample can
    /// mutate the discarded session.
    pub async fn cancel(&self) {
        let mut task = self.task.lock().await;
        if let Some(sweep) = task.take() {
            sweep.handle.cancel();
            let _ = sweep.join.await;
        }
        *self.shared.session.lock().expect("session lock poisoned") = MoistureSession::default();
        self.shared.step_tx.send_replace(CalibrationStep::Idle);
    }

    fn spawn_sweep(&self, phase: SweepPhase) -> SweepTask {
        let (handle, token) = cancel_pair();
        let join = tokio::spawn(moisture_sweep(
            Arc::clone(&self.shared),
            Arc::clone(&self.reader),
            token,
            self.sweep_duration,
            phase,
        ));
        SweepTask { handle, join }
    }

    fn save(&self) -> Result<()> {
        let (dry, wet) = {
            let session = self.shared.session.lock().expect("session lock poisoned");
            (session.dry, session.wet)
        };
        let (Some(absolute_dry), Some(absolute_wet)) = (dry, wet) else {
            bail!("both sweep endpoints are required before saving");
        };
        if absolute_dry <= absolute_wet {
            bail!(
                "dry endpoint ({absolute_dry}) must exceed wet endpoint ({absolute_wet})"
            );
        }
        let calibration = MoistureCalibration {
            absolute_dry,
            absolute_wet,
        };
        self.reader.set_calibration(calibration);
        self.cache.set(KEY_MOISTURE_CALIBRATION, &calibration);
        self.shared.step_tx.send_replace(CalibrationStep::Saved);
        info!(?calibration, "moisture calibration saved");
        Ok(())
    }
}

async fn moisture_sweep(
    shared: Arc<MoistureShared>,
    reader: Arc<MoistureReader>,
    mut token: CancelToken,
    duration: Duration,
    phase: SweepPhase,
) {
    let deadline = tokio::time::Instant::now() + duration;
    let mut endpoint: Option<f64> = None;

    loop {
        match reader.read_raw() {
            Ok(raw) => {
                endpoint = Some(match (endpoint, phase) {
                    (None, _) => raw,
                    (Some(e), SweepPhase::DryAir) => e.max(raw),
                    (Some(e), SweepPhase::Submerged) => e.min(raw),
                });
            }
            Err(e) => warn!("sweep sample failed: {e}"),
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if token.sleep(SWEEP_SAMPLE_PERIOD).await {
            return;
        }
    }
    // A cancel observed here also discards the sweep.
    if token.is_cancelled() {
        return;
    }

    let Some(value) = endpoint else {
        warn!("sweep produced no readings, returning to the previous step");
        shared.step_tx.send_replace(match phase {
            SweepPhase::DryAir => CalibrationStep::Idle,
            SweepPhase::Submerged => CalibrationStep::AwaitingUserAction,
        });
        return;
    };

    {
        let mut session = shared.session.lock().expect("session lock poisoned");
        match phase {
            SweepPhase::DryAir => session.dry = Some(value),
            SweepPhase::Submerged => session.wet = Some(value),
        }
    }
    shared.step_tx.send_replace(match phase {
        SweepPhase::DryAir => CalibrationStep::AwaitingUserAction,
        SweepPhase::Submerged => CalibrationStep::Ready,
    });
}

// ---------------------------------------------------------------------------
// Depth: two instantaneous reads plus a user-supplied tank volume
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DepthSession {
    empty_cm: Option<f64>,
    full_cm: Option<f64>,
    tank_volume_l: Option<f64>,
}

pub struct DepthCalibrator {
    tank: Arc<TankReader>,
    cache: Arc<LocalCache>,
    step_tx: watch::Sender<CalibrationStep>,
    session: StdMutex<DepthSession>,
}

impl DepthCalibrator {
    pub fn new(tank: Arc<TankReader>, cache: Arc<LocalCache>) -> Self {
        let (step_tx, _) = watch::channel(CalibrationStep::Idle);
        Self {
            tank,
            cache,
            step_tx,
            session: StdMutex::new(DepthSession::default()),
        }
    }

    pub fn step(&self) -> CalibrationStep {
        *self.step_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CalibrationStep> {
        self.step_tx.subscribe()
    }

    /// How much water the tank holds when full, required before saving.
    pub fn set_target_volume(&self, liters: f64) {
        self.session
            .lock()
            .expect("session lock poisoned")
            .tank_volume_l = Some(liters);
    }

    pub fn advance(&self) -> Result<CalibrationStep> {
        match self.step() {
            CalibrationStep::Idle => {
                self.step_tx.send_replace(CalibrationStep::MeasuringFirstPoint);
                let distance = match self.tank.read_distance_cm() {
                    Ok(d) => d,
                    Err(e) => {
                        self.step_tx.send_replace(CalibrationStep::Idle);
                        return Err(e);
                    }
                };
                self.session.lock().expect("session lock poisoned").empty_cm = Some(distance);
                self.step_tx.send_replace(CalibrationStep::AwaitingUserAction);
            }
            CalibrationStep::AwaitingUserAction => {
                self.step_tx.send_replace(CalibrationStep::MeasuringSecondPoint);
                let distance = match self.tank.read_distance_cm() {
                    Ok(d) => d,
                    Err(e) => {
                        self.step_tx.send_replace(CalibrationStep::AwaitingUserAction);
                        return Err(e);
                    }
                };
                self.session.lock().expect("session lock poisoned").full_cm = Some(distance);
                self.step_tx.send_replace(CalibrationStep::Ready);
            }
            CalibrationStep::Ready => self.save()?,
            CalibrationStep::MeasuringFirstPoint | CalibrationStep::MeasuringSecondPoint => {
                bail!("a measurement is running");
            }
            CalibrationStep::Saved => bail!("calibration already saved"),
        }
        Ok(self.step())
    }

    pub fn cancel(&self) {
        *self.session.lock().expect("session lock poisoned") = DepthSession::default();
        self.step_tx.send_replace(CalibrationStep::Idle);
    }

    fn save(&self) -> Result<()> {
        let (empty_cm, full_cm, volume) = {
            let session = self.session.lock().expect("session lock poisoned");
            (session.empty_cm, session.full_cm, session.tank_volume_l)
        };
        let (Some(empty_cm), Some(full_cm)) = (empty_cm, full_cm) else {
            bail!("both distance measurements are required before saving");
        };
        let Some(volume) = volume else {
            bail!("tank volume is required before saving");
        };
        let calibration = DepthCalibration::from_two_point(empty_cm, full_cm, volume)?;
        self.tank.set_calibration(calibration);
        self.cache.set(KEY_DEPTH_CALIBRATION, &calibration);
        self.step_tx.send_replace(CalibrationStep::Saved);
        info!(?calibration, "depth calibration saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pump flow: time a known dispensed volume
// ---------------------------------------------------------------------------

pub struct PumpCalibrator {
    pump: Arc<PumpController>,
    cache: Arc<LocalCache>,
    step_tx: watch::Sender<CalibrationStep>,
    session: StdMutex<PumpSession>,
}

#[derive(Default)]
struct PumpSession {
    started: Option<tokio::time::Instant>,
    target_volume_l: f64,
    capacity: Option<f64>,
}

impl PumpCalibrator {
    pub fn new(pump: Arc<PumpController>, cache: Arc<LocalCache>) -> Self {
        let (step_tx, _) = watch::channel(CalibrationStep::Idle);
        Self {
            pump,
            cache,
            step_tx,
            session: StdMutex::new(PumpSession {
                started: None,
                target_volume_l: DEFAULT_PUMP_CAL_VOLUME_L,
                capacity: None,
            }),
        }
    }

    pub fn step(&self) -> CalibrationStep {
        *self.step_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CalibrationStep> {
        self.step_tx.subscribe()
    }

    /// Volume the operator will time, in liters.
    pub fn set_target_volume(&self, liters: f64) {
        self.session
            .lock()
            .expect("session lock poisoned")
            .target_volume_l = liters;
    }

    /// Idle: start the pump and the clock.  MeasuringFirstPoint: the target
    /// volume has been dispensed, stop the pump and derive the flow rate.
    /// Ready: persist it.
    pub async fn advance(&self) -> Result<CalibrationStep> {
        match self.step() {
            CalibrationStep::Idle => {
                self.pump.engage_raw(true).await?;
                self.session.lock().expect("session lock poisoned").started =
                    Some(tokio::time::Instant::now());
                self.step_tx.send_replace(CalibrationStep::MeasuringFirstPoint);
            }
            CalibrationStep::MeasuringFirstPoint => {
                self.pump.engage_raw(false).await?;
                let mut session = self.session.lock().expect("session lock poisoned");
                let Some(started) = session.started.take() else {
                    bail!("pump timer was never started");
                };
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed <= 0.0 {
                    bail!("elapsed time too short to derive a flow rate");
                }
                session.capacity = Some(session.target_volume_l / elapsed);
                drop(session);
                self.step_tx.send_replace(CalibrationStep::Ready);
            }
            CalibrationStep::Ready => self.save()?,
            CalibrationStep::AwaitingUserAction | CalibrationStep::MeasuringSecondPoint => {
                bail!("pump calibration has no second measurement");
            }
            CalibrationStep::Saved => bail!("calibration already saved"),
        }
        Ok(self.step())
    }

    /// Abort: force the pump off and discard the session.
    pub async fn cancel(&self) {
        if let Err(e) = self.pump.engage_raw(false).await {
            warn!("pump off during calibration cancel failed: {e}");
        }
        let mut session = self.session.lock().expect("session lock poisoned");
        session.started = None;
        session.capacity = None;
        drop(session);
        self.step_tx.send_replace(CalibrationStep::Idle);
    }

    fn save(&self) -> Result<()> {
        let capacity = self
            .session
            .lock()
            .expect("session lock poisoned")
            .capacity;
        let Some(capacity) = capacity else {
            bail!("no measured flow rate to save");
        };
        self.pump.set_capacity_l_per_s(capacity);
        self.cache.set(KEY_PUMP_CAPACITY, &capacity);
        self.step_tx.send_replace(CalibrationStep::Saved);
        info!(capacity_l_per_s = capacity, "pump capacity saved");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
