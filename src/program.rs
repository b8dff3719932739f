//! Watering-program data model and schedule snapshot types.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named watering rule set fetched from the remote store and cached
/// locally.  Field names on the wire are camelCase, matching the remote
/// document format ("frequencyDays", "quantityL", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WateringProgram {
    pub id: String,
    pub name: String,
    /// Days between scheduled cycles.  Fractional values are allowed
    /// (0.5 = twice a day).
    pub frequency_days: f64,
    /// Liters delivered per scheduled cycle.
    pub quantity_l: f64,
    /// Unix seconds of the program's first intended trigger.
    pub starting_date_time: i64,
    /// Below this moisture percentage the moisture-check loop tops up.
    pub min_moisture: f64,
    /// At or above this moisture percentage a scheduled cycle is skipped.
    pub max_moisture: f64,
}

impl WateringProgram {
    /// Whole seconds between scheduled cycles, floored at 1 so a degenerate
    /// frequency never produces a zero-length interval.
    pub fn interval_secs(&self) -> i64 {
        ((self.frequency_days * 86_400.0) as i64).max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs() as u64)
    }

    /// Serialize to a plain key-value record.
    pub fn to_record(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(), // struct serialization cannot fail into non-object
        }
    }

    /// Rebuild a program from a key-value record.
    pub fn from_record(record: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(record))
            .context("invalid watering program record")
    }
}

/// Snapshot of the engine's scheduling state; written only by the
/// `ScheduleEngine`, read by any number of observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleState {
    pub active_program_id: Option<String>,
    pub programs_enabled: bool,
    /// Unix seconds of the next scheduled cycle, `None` while no program is
    /// scheduled.
    pub next_trigger_time: Option<i64>,
}

/// Last successful watering, cached so the schedule can anchor to it across
/// restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastWatering {
    pub ts: i64,
    pub program_id: String,
}

// ===========================================================================
// Tests
// ===========================================================================
