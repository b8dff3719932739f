//! Single-owner pump cycles.
//!
//! All watering goes through `PumpController::water_for_quantity`.  At most
//! one cycle runs at a time; a second request while the pump is on is
//! rejected rather than queued.  Every run is capped by a configurable
//! maximum duration so a miscalibrated capacity cannot flood the plant, and
//! the pump is always driven OFF on the way out, cancelled or not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cancel::{cancel_pair, CancelHandle};
use crate::events::{EventLogger, Trigger, WateringCycleRecord};
use crate::hw::PumpActuator;
use crate::remote::RemoteConfigStore;
use crate::sensor::TankReader;

/// Measured flow rate of the stock pump, liters per second.
pub const DEFAULT_PUMP_CAPACITY_L_PER_S: f64 = 0.017857143;

/// Hard ceiling on a single run when the config does not override it.
pub const DEFAULT_MAX_RUN_SECS: f64 = 300.0;

/// Interval between live status publications while the pump runs.
const STATUS_TICK: Duration = Duration::from_secs(1);

/// Live snapshot of the pump, pushed on every tick and on idle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WateringStatus {
    pub is_watering: bool,
    pub elapsed_sec: f64,
    pub liters_delivered: f64,
}

impl WateringStatus {
    fn idle() -> Self {
        Self {
            is_watering: false,
            elapsed_sec: 0.0,
            liters_delivered: 0.0,
        }
    }
}

/// How a `water_for_quantity` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The requested (possibly capped) duration elapsed.
    Completed,
    /// `manual_stop` ended the cycle early.
    Stopped,
    /// Another cycle already owns the pump.
    AlreadyWatering,
    /// The tank was empty, nothing was pumped.
    TankEmpty,
}

struct ActiveCycle {
    handle: CancelHandle,
}

pub struct PumpController {
    pump: Arc<dyn PumpActuator>,
    tank: Arc<TankReader>,
    events: Arc<EventLogger>,
    remote: Arc<dyn RemoteConfigStore>,
    capacity_l_per_s: RwLock<f64>,
    max_run_secs: f64,
    /// Single-owner slot: `Some` exactly while a cycle is running.
    active: Mutex<Option<ActiveCycle>>,
    watering: AtomicBool,
    status_tx: broadcast::Sender<WateringStatus>,
}

impl PumpController {
    pub fn new(
        pump: Arc<dyn PumpActuator>,
        tank: Arc<TankReader>,
        events: Arc<EventLogger>,
        remote: Arc<dyn RemoteConfigStore>,
        capacity_l_per_s: f64,
        max_run_secs: f64,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            pump,
            tank,
            events,
            remote,
            capacity_l_per_s: RwLock::new(capacity_l_per_s),
            max_run_secs,
            active: Mutex::new(None),
            watering: AtomicBool::new(false),
            status_tx,
        }
    }

    pub fn capacity_l_per_s(&self) -> f64 {
        *self.capacity_l_per_s.read().expect("capacity lock poisoned")
    }

    /// Install a new flow rate (pump calibration completion only).
    pub fn set_capacity_l_per_s(&self, capacity: f64) {
        *self.capacity_l_per_s.write().expect("capacity lock poisoned") = capacity;
    }

    /// Cheap check usable from any task, no lock taken.
    pub fn is_watering(&self) -> bool {
        self.watering.load(Ordering::SeqCst)
    }

    /// Subscribe to live status updates.
    pub fn subscribe_status(&self) -> broadcast::Receiver<WateringStatus> {
        self.status_tx.subscribe()
    }

    /// Drive the pump directly while no cycle owns it.  Used by the pump
    /// calibration flow to time a known quantity.
    pub async fn engage_raw(&self, on: bool) -> Result<()> {
        let active = self.active.lock().await;
        if active.is_some() {
            anyhow::bail!("a watering cycle is running");
        }
        self.pump.set(on);
        Ok(())
    }

    /// Open-ended manual run: the pump stays on until `manual_stop` or the
    /// safety cap ends it.  Waits for the cycle to finish.
    pub async fn start(&self) -> CycleOutcome {
        let quantity = self.capacity_l_per_s() * self.max_run_secs;
        self.water_for_quantity(quantity, Trigger::Manual).await
    }

    /// Stop the running cycle, if any.  Returns whether one was running.
    /// The cycle itself logs the shortened run.
    pub async fn manual_stop(&self) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(cycle) => {
                cycle.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one watering cycle for `quantity_l` liters and wait for it to end.
    ///
    /// The run duration is `quantity / capacity`, capped at the configured
    /// maximum; the logged liters always reflect the time the pump actually
    /// ran.  An unreadable tank sensor does not block watering.
    pub async fn water_for_quantity(&self, quantity_l: f64, trigger: Trigger) -> CycleOutcome {
        let now_ts = crate::now_ts();

        let mut token = {
            let mut active = self.active.lock().await;
            if active.is_some() {
                warn!("watering request rejected, pump already running");
                return CycleOutcome::AlreadyWatering;
            }

            match self.tank.is_empty().await {
                Ok(true) => {
                    info!("tank empty, skipping watering cycle");
                    self.events.log_tank_empty(now_ts).await;
                    return CycleOutcome::TankEmpty;
                }
                Ok(false) => {}
                Err(e) => warn!("tank level unreadable, watering anyway: {e}"),
            }

            let (handle, token) = cancel_pair();
            *active = Some(ActiveCycle { handle });
            token
        };

        let capacity = self.capacity_l_per_s();
        let requested_secs = quantity_l / capacity;
        let run_secs = requested_secs.min(self.max_run_secs);
        if run_secs < requested_secs {
            warn!(
                requested_secs,
                capped_secs = run_secs,
                "watering duration exceeds the safety cap, truncating"
            );
        }

        self.watering.store(true, Ordering::SeqCst);
        self.pump.set(true);
        let started = Instant::now();
        info!(quantity_l, run_secs, ?trigger, "watering cycle started");

        let mut stopped = false;
        loop {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed >= run_secs {
                break;
            }
            self.publish(WateringStatus {
                is_watering: true,
                elapsed_sec: elapsed,
                liters_delivered: elapsed * capacity,
            })
            .await;
            let step = (run_secs - elapsed).min(STATUS_TICK.as_secs_f64());
            if token.sleep(Duration::from_secs_f64(step)).await {
                stopped = true;
                break;
            }
        }

        // Fail-safe: the pump goes OFF before anything else happens.
        self.pump.set(false);
        let duration_sec = started.elapsed().as_secs_f64().min(run_secs);
        let liters = duration_sec * capacity;
        self.watering.store(false, Ordering::SeqCst);
        *self.active.lock().await = None;

        self.publish(WateringStatus::idle()).await;
        info!(duration_sec, liters, stopped, "watering cycle ended");

        self.events
            .log_cycle(&WateringCycleRecord {
                start_ts: now_ts,
                duration_sec,
                liters,
                trigger,
            })
            .await;

        match self.tank.current_volume().await {
            Ok(volume) if volume < self.tank.thresholds().low_l => {
                self.events.log_low_water(volume, crate::now_ts()).await;
            }
            Ok(_) => {}
            Err(e) => warn!("post-cycle tank check failed: {e}"),
        }

        if stopped {
            CycleOutcome::Stopped
        } else {
            CycleOutcome::Completed
        }
    }

    async fn publish(&self, status: WateringStatus) {
        let _ = self.status_tx.send(status);
        if let Err(e) = self.remote.publish_status(&status).await {
            warn!("status publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
