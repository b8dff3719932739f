//! Remote configuration store and notification collaborators.
//!
//! The wire protocol is out of scope: the engine talks to a
//! `RemoteConfigStore` trait and falls back to the local cache whenever a
//! call fails.  Configuration changes arrive as a typed feed of discrete
//! events rather than the document-snapshot callback the remote actually
//! delivers, so handlers can match exhaustively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::warn;

use crate::events::{LogEvent, NotificationPrefs};
use crate::program::WateringProgram;
use crate::pump::WateringStatus;

/// One discrete remote configuration change.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    ProgramAdded(WateringProgram),
    ProgramModified(WateringProgram),
    ProgramRemoved(String),
    ActiveProgramChanged(Option<String>),
    EnabledChanged(bool),
}

/// Remote document store holding the device's watering configuration.
/// Every call may fail; callers fall back to the local cache.
#[async_trait]
pub trait RemoteConfigStore: Send + Sync {
    async fn list_programs(&self) -> Result<Vec<WateringProgram>>;
    async fn active_program_id(&self) -> Result<Option<String>>;
    async fn set_active_program_id(&self, id: Option<&str>) -> Result<()>;
    async fn programs_enabled(&self) -> Result<bool>;
    async fn set_programs_enabled(&self, enabled: bool) -> Result<()>;
    async fn notification_prefs(&self) -> Result<NotificationPrefs>;
    async fn set_notification_prefs(&self, prefs: &NotificationPrefs) -> Result<()>;
    async fn append_log_entry(&self, entry: &LogEvent) -> Result<()>;
    /// Live watering status sink, published on every status tick.
    async fn publish_status(&self, status: &WateringStatus) -> Result<()>;
    /// Subscribe to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<RemoteChange>;
}

/// Best-effort outbound push message to the paired mobile device.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, device_id: &str, text: &str) -> Result<()>;
}

/// Notifier that only logs; the default when no push backend is wired up.
pub struct LogNotifier;

#[async_trait]
impl NotificationService for LogNotifier {
    async fn notify(&self, device_id: &str, text: &str) -> Result<()> {
        tracing::info!(device_id, "notification: {text}");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process store (development + tests)
// ---------------------------------------------------------------------------

struct RemoteState {
    /// Programs live as plain key-value documents, like the real store.
    programs: Vec<Map<String, Value>>,
    active_id: Option<String>,
    enabled: bool,
    prefs: NotificationPrefs,
    log: Vec<LogEvent>,
    last_status: Option<WateringStatus>,
}

impl Default for RemoteState {
    fn default() -> Self {
        // Programs are enabled until somebody switches them off.
        Self {
            programs: Vec::new(),
            active_id: None,
            enabled: true,
            prefs: NotificationPrefs::default(),
            log: Vec::new(),
            last_status: None,
        }
    }
}

/// In-process `RemoteConfigStore`.  Failure toggles let tests exercise the
/// cache-fallback paths.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    change_tx: broadcast::Sender<RemoteChange>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        let (change_tx, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(RemoteState::default()),
            change_tx,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl InMemoryRemote {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("remote unavailable");
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("remote unavailable");
        }
        Ok(())
    }

    fn emit(&self, change: RemoteChange) {
        // No subscribers is fine.
        let _ = self.change_tx.send(change);
    }

    /// Add or replace a program and emit the matching change event.
    pub fn upsert_program(&self, program: WateringProgram) {
        let record = program.to_record();
        let id = Value::String(program.id.clone());
        let mut state = self.state.lock().expect("remote lock poisoned");
        let change = match state.programs.iter_mut().find(|r| r.get("id") == Some(&id)) {
            Some(existing) => {
                *existing = record;
                RemoteChange::ProgramModified(program)
            }
            None => {
                state.programs.push(record);
                RemoteChange::ProgramAdded(program)
            }
        };
        drop(state);
        self.emit(change);
    }

    pub fn remove_program(&self, id: &str) {
        let mut state = self.state.lock().expect("remote lock poisoned");
        let before = state.programs.len();
        state
            .programs
            .retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        let removed = state.programs.len() != before;
        drop(state);
        if removed {
            self.emit(RemoteChange::ProgramRemoved(id.to_string()));
        }
    }

    pub fn log_entries(&self) -> Vec<LogEvent> {
        self.state.lock().expect("remote lock poisoned").log.clone()
    }

    pub fn last_status(&self) -> Option<WateringStatus> {
        self.state.lock().expect("remote lock poisoned").last_status
    }
}

#[async_trait]
impl RemoteConfigStore for InMemoryRemote {
    async fn list_programs(&self) -> Result<Vec<WateringProgram>> {
        self.check_read()?;
        let records = self.state.lock().expect("remote lock poisoned").programs.clone();
        Ok(records
            .into_iter()
            .filter_map(|record| match WateringProgram::from_record(record) {
                Ok(program) => Some(program),
                Err(e) => {
                    warn!("skipping malformed program record: {e}");
                    None
                }
            })
            .collect())
    }

    async fn active_program_id(&self) -> Result<Option<String>> {
        self.check_read()?;
        Ok(self.state.lock().expect("remote lock poisoned").active_id.clone())
    }

    async fn set_active_program_id(&self, id: Option<&str>) -> Result<()> {
        self.check_write()?;
        let id = id.map(str::to_string);
        self.state.lock().expect("remote lock poisoned").active_id = id.clone();
        self.emit(RemoteChange::ActiveProgramChanged(id));
        Ok(())
    }

    async fn programs_enabled(&self) -> Result<bool> {
        self.check_read()?;
        Ok(self.state.lock().expect("remote lock poisoned").enabled)
    }

    async fn set_programs_enabled(&self, enabled: bool) -> Result<()> {
        self.check_write()?;
        self.state.lock().expect("remote lock poisoned").enabled = enabled;
        self.emit(RemoteChange::EnabledChanged(enabled));
        Ok(())
    }

    async fn notification_prefs(&self) -> Result<NotificationPrefs> {
        self.check_read()?;
        Ok(self.state.lock().expect("remote lock poisoned").prefs.clone())
    }

    async fn set_notification_prefs(&self, prefs: &NotificationPrefs) -> Result<()> {
        self.check_write()?;
        self.state.lock().expect("remote lock poisoned").prefs = prefs.clone();
        Ok(())
    }

    async fn append_log_entry(&self, entry: &LogEvent) -> Result<()> {
        self.check_write()?;
        self.state
            .lock()
            .expect("remote lock poisoned")
            .log
            .push(entry.clone());
        Ok(())
    }

    async fn publish_status(&self, status: &WateringStatus) -> Result<()> {
        self.check_write()?;
        self.state.lock().expect("remote lock poisoned").last_status = Some(*status);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.change_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn program(id: &str) -> WateringProgram {
        WateringProgram {
            id: id.into(),
            name: "Ficus".into(),
            frequency_days: 1.0,
            quantity_l: 1.0,
            starting_date_time: 0,
            min_moisture: 30.0,
            max_moisture: 70.0,
        }
    }

    #[tokio::test]
    async fn upsert_emits_added_then_modified() {
        let remote = InMemoryRemote::default();
        let mut rx = remote.subscribe();

        remote.upsert_program(program("p1"));
        assert!(matches!(rx.recv().await.unwrap(), RemoteChange::ProgramAdded(p) if p.id == "p1"));

        let mut changed = program("p1");
        changed.quantity_l = 2.0;
        remote.upsert_program(changed);
        assert!(
            matches!(rx.recv().await.unwrap(), RemoteChange::ProgramModified(p) if p.quantity_l == 2.0)
        );
    }

    #[tokio::test]
    async fn remove_emits_only_for_known_programs() {
        let remote = InMemoryRemote::default();
        remote.upsert_program(program("p1"));
        let mut rx = remote.subscribe();

        remote.remove_program("nope");
        remote.remove_program("p1");

        assert_eq!(
            rx.recv().await.unwrap(),
            RemoteChange::ProgramRemoved("p1".into())
        );
        assert!(remote.list_programs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let remote = InMemoryRemote::default();
        remote.upsert_program(program("p1"));
        remote
            .state
            .lock()
            .unwrap()
            .programs
            .push(Map::new());

        let programs = remote.list_programs().await.unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].id, "p1");
    }

    #[tokio::test]
    async fn setters_emit_field_changes() {
        let remote = InMemoryRemote::default();
        let mut rx = remote.subscribe();

        remote.set_active_program_id(Some("p1")).await.unwrap();
        remote.set_programs_enabled(false).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            RemoteChange::ActiveProgramChanged(Some("p1".into()))
        );
        assert_eq!(rx.recv().await.unwrap(), RemoteChange::EnabledChanged(false));
    }

    #[tokio::test]
    async fn failure_toggles_reject_calls() {
        let remote = InMemoryRemote::default();
        remote.fail_writes(true);
        assert!(remote.set_programs_enabled(false).await.is_err());
        // Reads still work and the failed write left no trace.
        assert!(remote.programs_enabled().await.unwrap());

        remote.fail_reads(true);
        assert!(remote.programs_enabled().await.is_err());
    }
}
