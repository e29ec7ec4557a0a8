//! Guest records.
//!
//! A [`Guest`] is the in-memory view of one VM: the last snapshot the refresh loop
//! received for it plus the state of its export task. Workflows never poll DSM
//! themselves; they block on the refresh signal and re-read the record.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::client::Envelope;
use crate::error::Result;
use crate::signal::RefreshSignal;
use crate::task::{self, TaskId};

/// Power state as reported by DSM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GuestStatus {
    Running,
    Shutdown,
    /// Any other DSM status (`booting`, `stopping`, ...).
    Other(String),
}

impl GuestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            GuestStatus::Running => "running",
            GuestStatus::Shutdown => "shutdown",
            GuestStatus::Other(s) => s,
        }
    }
}

impl From<String> for GuestStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => GuestStatus::Running,
            "shutdown" => GuestStatus::Shutdown,
            _ => GuestStatus::Other(s),
        }
    }
}

impl From<&str> for GuestStatus {
    fn from(s: &str) -> Self {
        GuestStatus::from(s.to_string())
    }
}

impl From<GuestStatus> for String {
    fn from(status: GuestStatus) -> Self {
        match status {
            GuestStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of reading an arbitrary snapshot field by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Found(Value),
    Missing,
}

/// One entry of the DSM guest listing.
///
/// The fields the exporter relies on are typed; everything else DSM sends is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub guest_id: String,
    pub guest_name: String,
    pub status: GuestStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GuestSnapshot {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Look up any listing field by its DSM name.
    pub fn field(&self, name: &str) -> Field {
        let value = match name {
            "guest_id" => Some(Value::String(self.guest_id.clone())),
            "guest_name" => Some(Value::String(self.guest_name.clone())),
            "status" => Some(Value::String(self.status.to_string())),
            _ => self.extra.get(name).cloned(),
        };
        value.map_or(Field::Missing, Field::Found)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Default)]
struct ExportTracking {
    task_id: Option<TaskId>,
    task: Option<Envelope>,
    finished: bool,
}

#[derive(Debug)]
struct GuestState {
    snapshot: GuestSnapshot,
    export: ExportTracking,
}

/// Live record for one guest, shared between the refresh loop and a worker.
#[derive(Debug)]
pub struct Guest {
    id: String,
    state: Mutex<GuestState>,
    signal: Arc<RefreshSignal>,
}

impl Guest {
    pub fn new(snapshot: GuestSnapshot, signal: Arc<RefreshSignal>) -> Self {
        Self {
            id: snapshot.guest_id.clone(),
            state: Mutex::new(GuestState {
                snapshot,
                export: ExportTracking::default(),
            }),
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current name, as of the latest snapshot.
    pub fn name(&self) -> String {
        self.lock().snapshot.guest_name.clone()
    }

    pub fn snapshot(&self) -> GuestSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn status(&self) -> GuestStatus {
        self.lock().snapshot.status.clone()
    }

    pub fn field(&self, name: &str) -> Field {
        self.lock().snapshot.field(name)
    }

    /// Swap in a newer listing entry for this guest.
    pub fn replace_snapshot(&self, snapshot: GuestSnapshot) {
        self.lock().snapshot = snapshot;
    }

    /// Start tracking a freshly started export task.
    pub fn begin_export(&self, task_id: TaskId) {
        self.lock().export = ExportTracking {
            task_id: Some(task_id),
            task: None,
            finished: false,
        };
    }

    /// The outstanding export task, if any.
    pub fn export_task_id(&self) -> Option<TaskId> {
        self.lock().export.task_id.clone()
    }

    /// Store a fetched task status envelope. Once it reports the task as over, the
    /// task id is cleared and the export marked finished.
    ///
    /// Returns whether the export is now finished.
    pub fn record_task_status(&self, envelope: Envelope) -> bool {
        let finished = task::is_finished(&envelope);
        let mut state = self.lock();
        state.export.task = Some(envelope);
        if finished {
            state.export.task_id = None;
            state.export.finished = true;
        }
        state.export.finished
    }

    /// Last fetched task status envelope.
    pub fn export_task(&self) -> Option<Envelope> {
        self.lock().export.task.clone()
    }

    pub fn export_finished(&self) -> bool {
        self.lock().export.finished
    }

    /// Block until the refresh loop completes its next cycle.
    pub fn await_next_refresh(&self) -> Result<()> {
        self.signal.wait()
    }

    /// Block until a refresh cycle stores a snapshot with `status == target`.
    ///
    /// Always waits for at least one refresh; there is no timeout.
    pub fn wait_for_status(&self, target: &GuestStatus) -> Result<()> {
        self.wait_until(|guest| guest.status() == *target)
    }

    /// Block until a refresh cycle marks the export task finished.
    pub fn wait_for_export_finished(&self) -> Result<()> {
        self.wait_until(Guest::export_finished)
    }

    fn wait_until(&self, done: impl Fn(&Guest) -> bool) -> Result<()> {
        loop {
            self.await_next_refresh()?;
            if done(self) {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;
    use std::time::{Duration, Instant};

    fn snapshot(status: &str) -> GuestSnapshot {
        GuestSnapshot::from_value(json!({
            "guest_id": "g-1",
            "guest_name": "web01",
            "status": status,
            "vcpu_num": 2
        }))
        .unwrap()
    }

    fn envelope(raw: Value) -> Envelope {
        serde_json::from_value(raw).unwrap()
    }

    fn release_when_pending(signal: &RefreshSignal) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while signal.pending() == 0 {
            assert!(Instant::now() < deadline, "nobody waited");
            thread::sleep(Duration::from_millis(1));
        }
        signal.release();
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(GuestStatus::from("running"), GuestStatus::Running);
        assert_eq!(GuestStatus::from("shutdown"), GuestStatus::Shutdown);
        assert_eq!(
            GuestStatus::from("booting"),
            GuestStatus::Other("booting".to_string())
        );
        assert_eq!(String::from(GuestStatus::from("booting")), "booting");
    }

    #[test]
    fn test_snapshot_field_access() {
        let snap = snapshot("running");
        assert_eq!(snap.field("vcpu_num"), Field::Found(json!(2)));
        assert_eq!(snap.field("status"), Field::Found(json!("running")));
        assert_eq!(snap.field("ram_size"), Field::Missing);
    }

    #[test]
    fn test_numeric_guest_id() {
        let snap = GuestSnapshot::from_value(json!({
            "guest_id": 7, "guest_name": "db01", "status": "shutdown"
        }))
        .unwrap();
        assert_eq!(snap.guest_id, "7");
    }

    #[test]
    fn test_replace_snapshot_is_wholesale() {
        let guest = Guest::new(snapshot("running"), Arc::new(RefreshSignal::new()));
        let replacement = GuestSnapshot::from_value(json!({
            "guest_id": "g-1", "guest_name": "web01", "status": "shutdown"
        }))
        .unwrap();
        guest.replace_snapshot(replacement);
        assert_eq!(guest.status(), GuestStatus::Shutdown);
        assert_eq!(guest.field("vcpu_num"), Field::Missing);
    }

    #[test]
    fn test_name_follows_latest_snapshot() {
        let guest = Guest::new(snapshot("running"), Arc::new(RefreshSignal::new()));
        assert_eq!(guest.name(), "web01");
        let renamed = GuestSnapshot::from_value(json!({
            "guest_id": "g-1", "guest_name": "web01-old", "status": "running"
        }))
        .unwrap();
        guest.replace_snapshot(renamed);
        assert_eq!(guest.name(), "web01-old");
        assert_eq!(guest.id(), "g-1");
    }

    #[test]
    fn test_replace_snapshot_idempotent() {
        let guest = Guest::new(snapshot("running"), Arc::new(RefreshSignal::new()));
        guest.replace_snapshot(snapshot("shutdown"));
        let (status, finished) = (guest.status(), guest.export_finished());
        guest.replace_snapshot(snapshot("shutdown"));
        assert_eq!(guest.status(), status);
        assert_eq!(guest.export_finished(), finished);
        assert_eq!(guest.snapshot(), snapshot("shutdown"));
    }

    #[test]
    fn test_record_task_status() {
        let guest = Guest::new(snapshot("shutdown"), Arc::new(RefreshSignal::new()));
        guest.begin_export(TaskId::new("42"));

        let running = envelope(json!({"success": true, "data": {"finish": false}}));
        assert!(!guest.record_task_status(running.clone()));
        assert_eq!(guest.export_task_id(), Some(TaskId::new("42")));
        assert_eq!(guest.export_task(), Some(running));

        let done = envelope(json!({"success": true, "data": {"finish": true, "success": true}}));
        assert!(guest.record_task_status(done.clone()));
        assert_eq!(guest.export_task_id(), None);
        assert!(guest.export_finished());
        assert_eq!(guest.export_task(), Some(done));
    }

    #[test]
    fn test_wait_for_status_needs_a_refresh() {
        let signal = Arc::new(RefreshSignal::new());
        let guest = Guest::new(snapshot("shutdown"), Arc::clone(&signal));

        thread::scope(|s| {
            // Already shutdown, but the wait still only returns after a refresh.
            let waiter = s.spawn(|| guest.wait_for_status(&GuestStatus::Shutdown));
            release_when_pending(&signal);
            assert!(waiter.join().unwrap().is_ok());
        });
    }

    #[test]
    fn test_wait_for_status_rewaits_until_match() {
        let signal = Arc::new(RefreshSignal::new());
        let guest = Guest::new(snapshot("running"), Arc::clone(&signal));

        thread::scope(|s| {
            let waiter = s.spawn(|| guest.wait_for_status(&GuestStatus::Shutdown));

            release_when_pending(&signal);
            release_when_pending(&signal);
            assert!(!waiter.is_finished());

            guest.replace_snapshot(snapshot("shutdown"));
            while !waiter.is_finished() {
                signal.release();
                thread::sleep(Duration::from_millis(1));
            }
            assert!(waiter.join().unwrap().is_ok());
        });
    }

    #[test]
    fn test_wait_for_export_finished_cancelled() {
        let signal = Arc::new(RefreshSignal::new());
        let guest = Guest::new(snapshot("shutdown"), Arc::clone(&signal));
        guest.begin_export(TaskId::new("1"));

        thread::scope(|s| {
            let waiter = s.spawn(|| guest.wait_for_export_finished());
            let deadline = Instant::now() + Duration::from_secs(5);
            while signal.pending() == 0 {
                assert!(Instant::now() < deadline);
                thread::sleep(Duration::from_millis(1));
            }
            signal.cancel();
            assert!(matches!(
                waiter.join().unwrap(),
                Err(crate::error::Error::Cancelled)
            ));
        });
    }
}
