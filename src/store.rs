//! Durable local key-value cache.
//!
//! One JSON document on disk holding last-known configuration, calibration
//! constants, the last-watering record and recent log entries.  Reads fall
//! back to "absent" on a missing or corrupted file; writes are best-effort
//! and write-through.  Remote outages never have to touch the disk format:
//! callers read typed values by key and get `None` for anything unusable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

// Well-known keys.
pub const KEY_PROGRAMS: &str = "programs";
pub const KEY_ACTIVE_PROGRAM_ID: &str = "active_program_id";
pub const KEY_PROGRAMS_ENABLED: &str = "programs_enabled";
pub const KEY_MOISTURE_CALIBRATION: &str = "moisture_calibration";
pub const KEY_DEPTH_CALIBRATION: &str = "depth_calibration";
pub const KEY_PUMP_CAPACITY: &str = "pump_capacity";
pub const KEY_LAST_WATERING: &str = "last_watering";
pub const KEY_LOG_ENTRIES: &str = "log_entries";
pub const KEY_NOTIFICATION_PREFS: &str = "notification_prefs";

pub struct LocalCache {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl LocalCache {
    /// Open (or create) the cache at `path`.  A missing file starts empty; a
    /// corrupted file is treated as absent with a warning.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), "cache file corrupted, starting empty: {e}");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    /// Read a typed value.  Anything missing or undeserializable is `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().expect("cache lock poisoned");
        let value = data.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, "cache entry undeserializable, treating as absent: {e}");
                None
            }
        }
    }

    /// Write a typed value and flush the whole document to disk.  Disk
    /// failures are logged, never surfaced: the in-memory copy still serves
    /// readers for the rest of the process lifetime.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let json = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, "cache value unserializable, dropping write: {e}");
                return;
            }
        };
        let mut data = self.data.lock().expect("cache lock poisoned");
        data.insert(key.to_string(), json);
        self.flush(&data);
    }

    fn flush(&self, data: &Map<String, Value>) {
        let contents = match serde_json::to_string_pretty(data) {
            Ok(s) => s,
            Err(e) => {
                warn!("cache serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, contents) {
            warn!(path = %self.path.display(), "cache write failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{LastWatering, WateringProgram};

    fn temp_cache() -> (tempfile::TempDir, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path().join("cache.json"));
        (dir, cache)
    }

    #[test]
    fn missing_file_reads_as_absent() {
        let (_dir, cache) = temp_cache();
        assert_eq!(cache.get::<bool>(KEY_PROGRAMS_ENABLED), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, cache) = temp_cache();
        cache.set(KEY_PROGRAMS_ENABLED, &true);
        assert_eq!(cache.get::<bool>(KEY_PROGRAMS_ENABLED), Some(true));
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let last = LastWatering {
            ts: 1_700_000_000,
            program_id: "p1".into(),
        };
        {
            let cache = LocalCache::open(&path);
            cache.set(KEY_LAST_WATERING, &last);
        }
        let cache = LocalCache::open(&path);
        assert_eq!(cache.get::<LastWatering>(KEY_LAST_WATERING), Some(last));
    }

    #[test]
    fn corrupted_file_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"{not json at all").unwrap();

        let cache = LocalCache::open(&path);
        assert_eq!(cache.get::<bool>(KEY_PROGRAMS_ENABLED), None);

        // And the cache still works afterwards.
        cache.set(KEY_PROGRAMS_ENABLED, &false);
        assert_eq!(cache.get::<bool>(KEY_PROGRAMS_ENABLED), Some(false));
    }

    #[test]
    fn wrong_type_reads_as_absent() {
        let (_dir, cache) = temp_cache();
        cache.set(KEY_ACTIVE_PROGRAM_ID, &"p1");
        assert_eq!(cache.get::<i64>(KEY_ACTIVE_PROGRAM_ID), None);
        assert_eq!(
            cache.get::<String>(KEY_ACTIVE_PROGRAM_ID).as_deref(),
            Some("p1")
        );
    }

    #[test]
    fn program_list_round_trips() {
        let (_dir, cache) = temp_cache();
        let programs = vec![WateringProgram {
            id: "p1".into(),
            name: "Ficus".into(),
            frequency_days: 1.0,
            quantity_l: 1.0,
            starting_date_time: 0,
            min_moisture: 30.0,
            max_moisture: 70.0,
        }];
        cache.set(KEY_PROGRAMS, &programs);
        assert_eq!(cache.get::<Vec<WateringProgram>>(KEY_PROGRAMS), Some(programs));
    }
}
