//! Schedule engine: one watering loop and one moisture-check loop per
//! active program.
//!
//! Rescheduling is strict: the previous task pair is cancelled and joined
//! before a new one spawns, so two generations never overlap.  "No active
//! program" and "programs disabled" are valid terminal states in which both
//! loops are stopped and the next trigger is cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::events::{EventLogger, Trigger};
use crate::program::{LastWatering, ScheduleState, WateringProgram};
use crate::pump::{CycleOutcome, PumpController};
use crate::remote::{RemoteChange, RemoteConfigStore};
use crate::sensor::MoistureReader;
use crate::store::{
    LocalCache, KEY_ACTIVE_PROGRAM_ID, KEY_LAST_WATERING, KEY_PROGRAMS, KEY_PROGRAMS_ENABLED,
};

/// Default cadence of the moisture-check loop.
pub const DEFAULT_MOISTURE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay until the program's next trigger, anchored so restarts do not
/// replay missed cycles.
///
/// A future `starting_date_time` waits until it.  Otherwise the anchor is
/// the recorded last watering for this program (falling back to the start
/// time) and the delay is the remainder of the current interval; an elapsed
/// time landing exactly on a boundary advances a full interval, so the
/// computed trigger is always strictly in the future.
pub fn compute_initial_delay(
    program: &WateringProgram,
    last: Option<&LastWatering>,
    now_ts: i64,
) -> Duration {
    if program.starting_date_time > now_ts {
        return Duration::from_secs((program.starting_date_time - now_ts) as u64);
    }
    let anchor = match last {
        Some(lw) if lw.program_id == program.id && lw.ts <= now_ts => lw.ts,
        _ => program.starting_date_time,
    };
    let interval = program.interval_secs();
    let elapsed = now_ts - anchor;
    let delay = interval - (elapsed % interval);
    Duration::from_secs(delay as u64)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct TaskPair {
    handle: CancelHandle,
    watering: JoinHandle<()>,
    moisture: JoinHandle<()>,
}

/// Everything the background loops need; owned per generation so a stale
/// loop never observes a newer program.
#[derive(Clone)]
struct LoopCtx {
    program: WateringProgram,
    pump: Arc<PumpController>,
    moisture: Arc<MoistureReader>,
    events: Arc<EventLogger>,
    cache: Arc<LocalCache>,
    enabled: Arc<AtomicBool>,
    state: Arc<StdMutex<ScheduleState>>,
}

pub struct ScheduleEngine {
    remote: Arc<dyn RemoteConfigStore>,
    cache: Arc<LocalCache>,
    pump: Arc<PumpController>,
    moisture: Arc<MoistureReader>,
    events: Arc<EventLogger>,
    moisture_check_interval: Duration,
    programs: StdMutex<Vec<WateringProgram>>,
    state: Arc<StdMutex<ScheduleState>>,
    enabled: Arc<AtomicBool>,
    /// Running-task slot; the lock also serializes schedule mutation.
    tasks: Mutex<Option<TaskPair>>,
    change_tx: broadcast::Sender<RemoteChange>,
}

impl ScheduleEngine {
    pub fn new(
        remote: Arc<dyn RemoteConfigStore>,
        cache: Arc<LocalCache>,
        pump: Arc<PumpController>,
        moisture: Arc<MoistureReader>,
        events: Arc<EventLogger>,
        moisture_check_interval: Duration,
    ) -> Self {
        let (change_tx, _) = broadcast::channel(32);
        Self {
            remote,
            cache,
            pump,
            moisture,
            events,
            moisture_check_interval,
            programs: StdMutex::new(Vec::new()),
            state: Arc::new(StdMutex::new(ScheduleState {
                active_program_id: None,
                programs_enabled: true,
                next_trigger_time: None,
            })),
            enabled: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(None),
            change_tx,
        }
    }

    pub fn state(&self) -> ScheduleState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    pub fn programs(&self) -> Vec<WateringProgram> {
        self.programs.lock().expect("programs lock poisoned").clone()
    }

    /// Local observers of the merged change feed.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RemoteChange> {
        self.change_tx.subscribe()
    }

    /// Startup fetch: remote first, cache fallback, then the first schedule.
    pub async fn load_initial(&self) {
        match self.remote.list_programs().await {
            Ok(programs) => {
                self.cache.set(KEY_PROGRAMS, &programs);
                *self.programs.lock().expect("programs lock poisoned") = programs;
            }
            Err(e) => {
                warn!("program fetch failed, using cached programs: {e}");
                let cached = self.cache.get::<Vec<WateringProgram>>(KEY_PROGRAMS);
                *self.programs.lock().expect("programs lock poisoned") =
                    cached.unwrap_or_default();
            }
        }

        let active_id = match self.remote.active_program_id().await {
            Ok(id) => {
                self.cache.set(KEY_ACTIVE_PROGRAM_ID, &id);
                id
            }
            Err(e) => {
                warn!("active program fetch failed, using cached: {e}");
                self.cache.get::<Option<String>>(KEY_ACTIVE_PROGRAM_ID).flatten()
            }
        };
        let enabled = match self.remote.programs_enabled().await {
            Ok(enabled) => {
                self.cache.set(KEY_PROGRAMS_ENABLED, &enabled);
                enabled
            }
            Err(e) => {
                warn!("enabled flag fetch failed, using cached: {e}");
                self.cache.get::<bool>(KEY_PROGRAMS_ENABLED).unwrap_or(true)
            }
        };

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.active_program_id = active_id;
            state.programs_enabled = enabled;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        self.events.refresh_prefs().await;
        self.reschedule().await;
    }

    /// Switch the active program.  The remote write is best-effort; the
    /// local schedule follows the new selection either way.
    pub async fn set_active_program(&self, id: Option<&str>) {
        if let Err(e) = self.remote.set_active_program_id(id).await {
            warn!("active program remote write failed, applying locally: {e}");
        }
        let id = id.map(str::to_string);
        self.cache.set(KEY_ACTIVE_PROGRAM_ID, &id);
        self.state.lock().expect("state lock poisoned").active_program_id = id;
        self.reschedule().await;
    }

    pub async fn set_programs_enabled(&self, enabled: bool) {
        if let Err(e) = self.remote.set_programs_enabled(enabled).await {
            warn!("enabled flag remote write failed, applying locally: {e}");
        }
        self.cache.set(KEY_PROGRAMS_ENABLED, &enabled);
        self.state.lock().expect("state lock poisoned").programs_enabled = enabled;
        self.enabled.store(enabled, Ordering::SeqCst);
        self.reschedule().await;
    }

    /// Merge one remote change, reschedule when it affects the running
    /// schedule, and forward it to local subscribers.
    pub async fn on_remote_change(&self, change: RemoteChange) {
        let needs_reschedule = match &change {
            RemoteChange::ProgramAdded(program) | RemoteChange::ProgramModified(program) => {
                let mut programs = self.programs.lock().expect("programs lock poisoned");
                match programs.iter_mut().find(|p| p.id == program.id) {
                    Some(existing) => *existing = program.clone(),
                    None => programs.push(program.clone()),
                }
                self.cache.set(KEY_PROGRAMS, &*programs);
                drop(programs);
                self.state().active_program_id.as_deref() == Some(program.id.as_str())
            }
            RemoteChange::ProgramRemoved(id) => {
                let mut programs = self.programs.lock().expect("programs lock poisoned");
                programs.retain(|p| p.id != *id);
                self.cache.set(KEY_PROGRAMS, &*programs);
                drop(programs);
                self.state().active_program_id.as_deref() == Some(id.as_str())
            }
            RemoteChange::ActiveProgramChanged(id) => {
                self.cache.set(KEY_ACTIVE_PROGRAM_ID, id);
                self.state.lock().expect("state lock poisoned").active_program_id = id.clone();
                true
            }
            RemoteChange::EnabledChanged(enabled) => {
                self.cache.set(KEY_PROGRAMS_ENABLED, enabled);
                self.state.lock().expect("state lock poisoned").programs_enabled = *enabled;
                self.enabled.store(*enabled, Ordering::SeqCst);
                true
            }
        };

        if needs_reschedule {
            self.reschedule().await;
        }
        let _ = self.change_tx.send(change);
    }

    /// Tear down the current task pair and, if a program is active and
    /// programs are enabled, spawn the next generation.
    pub async fn reschedule(&self) {
        let mut tasks = self.tasks.lock().await;

        if let Some(previous) = tasks.take() {
            previous.handle.cancel();
            let _ = previous.watering.await;
            let _ = previous.moisture.await;
        }

        let (active_id, enabled) = {
            let state = self.state.lock().expect("state lock poisoned");
            (state.active_program_id.clone(), state.programs_enabled)
        };
        let program = active_id.as_ref().and_then(|id| {
            self.programs
                .lock()
                .expect("programs lock poisoned")
                .iter()
                .find(|p| p.id == *id)
                .cloned()
        });

        let program = match (enabled, program) {
            (true, Some(program)) => program,
            _ => {
                self.state.lock().expect("state lock poisoned").next_trigger_time = None;
                info!(?active_id, enabled, "schedule stopped");
                return;
            }
        };

        let now = crate::now_ts();
        let last = self.cache.get::<LastWatering>(KEY_LAST_WATERING);
        let delay = compute_initial_delay(&program, last.as_ref(), now);
        self.state.lock().expect("state lock poisoned").next_trigger_time =
            Some(now + delay.as_secs() as i64);
        info!(
            program = %program.id,
            delay_secs = delay.as_secs(),
            "schedule armed"
        );

        let ctx = LoopCtx {
            program,
            pump: Arc::clone(&self.pump),
            moisture: Arc::clone(&self.moisture),
            events: Arc::clone(&self.events),
            cache: Arc::clone(&self.cache),
            enabled: Arc::clone(&self.enabled),
            state: Arc::clone(&self.state),
        };
        let (handle, token) = cancel_pair();
        let watering = tokio::spawn(watering_loop(ctx.clone(), token.clone(), delay));
        let moisture = tokio::spawn(moisture_check_loop(
            ctx,
            token,
            self.moisture_check_interval,
        ));
        *tasks = Some(TaskPair {
            handle,
            watering,
            moisture,
        });
    }

    /// Stop both loops (shutdown path).
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.take() {
            previous.handle.cancel();
            let _ = previous.watering.await;
            let _ = previous.moisture.await;
        }
        self.state.lock().expect("state lock poisoned").next_trigger_time = None;
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn watering_loop(ctx: LoopCtx, mut token: CancelToken, mut delay: Duration) {
    loop {
        if token.sleep(delay).await {
            return;
        }
        let woke = tokio::time::Instant::now();

        if ctx.enabled.load(Ordering::SeqCst) {
            let skip = match ctx.moisture.percentage() {
                Ok(p) if p >= ctx.program.max_moisture => {
                    info!(moisture = p, max = ctx.program.max_moisture, "soil moist enough, skipping cycle");
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!("moisture unreadable at trigger, watering anyway: {e}");
                    false
                }
            };
            // A moist-soil skip still anchors the next restart so a reboot
            // right after it does not replay the cycle; a rejected cycle
            // (empty tank, pump busy) leaves the anchor where it was.
            let anchor = if skip {
                true
            } else {
                matches!(
                    ctx.pump
                        .water_for_quantity(ctx.program.quantity_l, Trigger::Auto)
                        .await,
                    CycleOutcome::Completed | CycleOutcome::Stopped
                )
            };
            if anchor {
                ctx.cache.set(
                    KEY_LAST_WATERING,
                    &LastWatering {
                        ts: crate::now_ts(),
                        program_id: ctx.program.id.clone(),
                    },
                );
            }
        }

        delay = ctx.program.interval().saturating_sub(woke.elapsed());
        ctx.state.lock().expect("state lock poisoned").next_trigger_time =
            Some(crate::now_ts() + delay.as_secs() as i64);
    }
}

async fn moisture_check_loop(ctx: LoopCtx, mut token: CancelToken, cadence: Duration) {
    loop {
        if token.sleep(cadence).await {
            return;
        }
        let percentage = match ctx.moisture.percentage() {
            Ok(p) => p,
            Err(e) => {
                warn!("moisture check failed: {e}");
                continue;
            }
        };
        ctx.events
            .log_moisture_measurement(percentage, crate::now_ts())
            .await;

        // Out-of-band top-up; the main trigger stays where it is.
        if ctx.enabled.load(Ordering::SeqCst) && percentage < ctx.program.min_moisture {
            info!(
                moisture = percentage,
                min = ctx.program.min_moisture,
                "soil too dry, topping up"
            );
            ctx.pump
                .water_for_quantity(ctx.program.quantity_l, Trigger::Auto)
                .await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
