//! Watering-cycle and measurement event log.
//!
//! Every completed (or safety-capped) pump cycle, moisture measurement and
//! tank-level warning becomes a `LogEvent`: appended to the remote log when
//! reachable, always mirrored into the local cache and a bounded in-memory
//! ring, and forwarded to the notification service when its kind is enabled
//! in the preferences.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::remote::{NotificationService, RemoteConfigStore};
use crate::store::{LocalCache, KEY_LOG_ENTRIES};

/// Maximum number of events retained in the in-memory ring and the cache.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AutoWateringCycle,
    ManualWateringCycle,
    MoistureMeasurement,
    LowWaterLevel,
    EmptyWaterTank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub message: String,
}

/// What happened during one pump run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Auto,
}

/// Append-only record of a completed or safety-capped cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct WateringCycleRecord {
    pub start_ts: i64,
    pub duration_sec: f64,
    pub liters: f64,
    pub trigger: Trigger,
}

/// Per-kind notification switches.  An empty map means "notify everything".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub enabled: HashMap<EventKind, bool>,
}

impl NotificationPrefs {
    pub fn allows(&self, kind: EventKind) -> bool {
        if self.enabled.is_empty() {
            return true;
        }
        self.enabled.get(&kind).copied().unwrap_or(false)
    }
}

fn format_ts(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

pub struct EventLogger {
    device_id: String,
    remote: Arc<dyn RemoteConfigStore>,
    cache: Arc<LocalCache>,
    notifier: Arc<dyn NotificationService>,
    prefs: Mutex<NotificationPrefs>,
    recent: Mutex<VecDeque<LogEvent>>,
}

impl EventLogger {
    pub fn new(
        device_id: impl Into<String>,
        remote: Arc<dyn RemoteConfigStore>,
        cache: Arc<LocalCache>,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        let recent = cache
            .get::<Vec<LogEvent>>(KEY_LOG_ENTRIES)
            .unwrap_or_default()
            .into();
        let prefs = cache
            .get::<NotificationPrefs>(crate::store::KEY_NOTIFICATION_PREFS)
            .unwrap_or_default();
        Self {
            device_id: device_id.into(),
            remote,
            cache,
            notifier,
            prefs: Mutex::new(prefs),
            recent: Mutex::new(recent),
        }
    }

    /// Pull notification preferences from the remote store, falling back to
    /// whatever the cache had.
    pub async fn refresh_prefs(&self) {
        match self.remote.notification_prefs().await {
            Ok(prefs) => {
                self.cache.set(crate::store::KEY_NOTIFICATION_PREFS, &prefs);
                *self.prefs.lock().expect("prefs lock poisoned") = prefs;
            }
            Err(e) => warn!("notification prefs fetch failed, using cached: {e}"),
        }
    }

    pub fn set_prefs(&self, prefs: NotificationPrefs) {
        self.cache.set(crate::store::KEY_NOTIFICATION_PREFS, &prefs);
        *self.prefs.lock().expect("prefs lock poisoned") = prefs;
    }

    /// Snapshot of the recent-events ring, newest last.
    pub fn recent(&self) -> Vec<LogEvent> {
        self.recent
            .lock()
            .expect("recent lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub async fn log_cycle(&self, record: &WateringCycleRecord) {
        let kind = match record.trigger {
            Trigger::Auto => EventKind::AutoWateringCycle,
            Trigger::Manual => EventKind::ManualWateringCycle,
        };
        let which = match record.trigger {
            Trigger::Auto => "Automatic",
            Trigger::Manual => "Manual",
        };
        let message = format!(
            "{which} watering cycle started at {} and lasted {:.2} seconds. Watered {:.2} liters.",
            format_ts(record.start_ts),
            record.duration_sec,
            record.liters,
        );
        self.append(LogEvent {
            ts: record.start_ts,
            kind,
            message,
        })
        .await;
    }

    pub async fn log_moisture_measurement(&self, percentage: f64, ts: i64) {
        self.append(LogEvent {
            ts,
            kind: EventKind::MoistureMeasurement,
            message: format!(
                "At {} the soil moisture was {percentage:.0}%.",
                format_ts(ts)
            ),
        })
        .await;
    }

    pub async fn log_low_water(&self, volume_l: f64, ts: i64) {
        self.append(LogEvent {
            ts,
            kind: EventKind::LowWaterLevel,
            message: format!(
                "At {} the water level was low ({volume_l:.2}L).",
                format_ts(ts)
            ),
        })
        .await;
    }

    pub async fn log_tank_empty(&self, ts: i64) {
        self.append(LogEvent {
            ts,
            kind: EventKind::EmptyWaterTank,
            message: format!(
                "At {} the water tank was empty so no watering occurred.",
                format_ts(ts)
            ),
        })
        .await;
    }

    async fn append(&self, event: LogEvent) {
        if let Err(e) = self.remote.append_log_entry(&event).await {
            warn!(kind = ?event.kind, "remote log append failed, keeping local copy: {e}");
        }

        {
            let mut recent = self.recent.lock().expect("recent lock poisoned");
            if recent.len() >= MAX_EVENTS {
                recent.pop_front();
            }
            recent.push_back(event.clone());
            let snapshot: Vec<LogEvent> = recent.iter().cloned().collect();
            self.cache.set(KEY_LOG_ENTRIES, &snapshot);
        }

        let notify = self
            .prefs
            .lock()
            .expect("prefs lock poisoned")
            .allows(event.kind);
        if notify {
            if let Err(e) = self.notifier.notify(&self.device_id, &event.message).await {
                warn!("notification send failed: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
