//! Per-guest export workflow.
//!
//! For one guest:
//! 1. Delete the previous `{target}/{guest_name}.ova`
//! 2. Power the guest off (unless already shut down) and wait for `shutdown`
//! 3. Start the export and wait for its task to finish
//! 4. Report the task result
//! 5. If the guest was running to begin with, power it back on and wait for
//!    `running`

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client::{DsmClient, API_GUEST_ACTION, API_TASK_INFO};
use crate::codes;
use crate::error::{Error, Result};
use crate::guest::{Guest, GuestStatus};
use crate::signal::RefreshSignal;
use crate::task::TaskOutcome;
use crate::transport::Transport;

/// Default per-call timeout for power-on.
pub const DEFAULT_POWER_ON_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pause after DSM refuses a power-on.
pub const DEFAULT_POWER_ON_RETRY_DELAY: Duration = Duration::from_secs(60);

/// How hard to try powering a guest back on.
///
/// A guest that has just been exported can keep refusing power-on for a while
/// (DSM still reports it `shutdown`, so there is no status to wait for), so
/// power-on is retried: timeouts immediately, refusals after `retry_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerOnPolicy {
    /// Timeout of each power-on call.
    pub timeout: Duration,
    /// Pause after a refusal before the next attempt.
    pub retry_delay: Duration,
    /// Give up after this many attempts (`None` = never).
    pub max_attempts: Option<u32>,
}

impl Default for PowerOnPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POWER_ON_TIMEOUT,
            retry_delay: DEFAULT_POWER_ON_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

/// Step of the export workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    /// Removing the previous export artifact.
    Deleting,
    /// Powering off and waiting for shutdown.
    PoweringOff,
    /// Export task running.
    Exporting,
    /// Powering back on and waiting for the guest to run.
    PoweringOn,
    /// Workflow finished.
    Complete,
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportPhase::Deleting => write!(f, "Deleting old export"),
            ExportPhase::PoweringOff => write!(f, "Powering off"),
            ExportPhase::Exporting => write!(f, "Exporting"),
            ExportPhase::PoweringOn => write!(f, "Powering on"),
            ExportPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Progress notification from a running workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEvent {
    pub guest: String,
    pub phase: ExportPhase,
}

/// Type alias for the workflow event callback.
pub type EventCallback = Box<dyn Fn(ExportEvent) + Send + Sync>;

/// What happened to one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    /// Status before the workflow touched the guest.
    pub initial_status: GuestStatus,
    /// How the export task ended.
    pub task: TaskOutcome,
    /// Whether the guest was powered back on.
    pub restarted: bool,
}

/// Remote path of a guest's export artifact.
pub fn artifact_path(target_path: &str, guest_name: &str) -> String {
    format!("{}/{guest_name}.ova", target_path.trim_end_matches('/'))
}

pub struct Workflow<'a, T> {
    client: &'a DsmClient<T>,
    signal: &'a RefreshSignal,
    target_path: &'a str,
    power_on: &'a PowerOnPolicy,
    events: Option<&'a EventCallback>,
}

impl<'a, T: Transport> Workflow<'a, T> {
    pub fn new(
        client: &'a DsmClient<T>,
        signal: &'a RefreshSignal,
        target_path: &'a str,
        power_on: &'a PowerOnPolicy,
    ) -> Self {
        Self {
            client,
            signal,
            target_path,
            power_on,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<&'a EventCallback>) -> Self {
        self.events = events;
        self
    }

    fn emit(&self, guest: &Guest, phase: ExportPhase) {
        if let Some(callback) = self.events {
            callback(ExportEvent {
                guest: guest.name(),
                phase,
            });
        }
    }

    /// Run the whole workflow for `guest`.
    pub fn export(&self, guest: &Guest) -> Result<ExportOutcome> {
        let initial_status = guest.status();
        info!(guest = %guest.name(), status = %initial_status, "Exporting guest");

        self.emit(guest, ExportPhase::Deleting);
        self.client
            .delete_file(&artifact_path(self.target_path, &guest.name()))?;

        if guest.status() != GuestStatus::Shutdown {
            self.emit(guest, ExportPhase::PoweringOff);
            info!(guest = %guest.name(), "Powering off");
            self.client.power_off(&guest.name())?;
            guest.wait_for_status(&GuestStatus::Shutdown)?;
        }

        self.emit(guest, ExportPhase::Exporting);
        let task_id = self
            .client
            .start_export(guest.id(), &guest.name(), self.target_path)?;
        info!(guest = %guest.name(), task = %task_id, "Export started");
        guest.begin_export(task_id);
        guest.wait_for_export_finished()?;
        let task = report_export(guest);

        if initial_status != GuestStatus::Running {
            debug!(guest = %guest.name(), "Guest was not running, leaving it off");
            self.emit(guest, ExportPhase::Complete);
            return Ok(ExportOutcome {
                initial_status,
                task,
                restarted: false,
            });
        }

        self.emit(guest, ExportPhase::PoweringOn);
        self.power_on(guest)?;
        guest.wait_for_status(&GuestStatus::Running)?;
        info!(guest = %guest.name(), "Guest running again");

        self.emit(guest, ExportPhase::Complete);
        Ok(ExportOutcome {
            initial_status,
            task,
            restarted: true,
        })
    }

    /// Keep sending power-on until DSM accepts it or says the guest is already
    /// running.
    pub fn power_on(&self, guest: &Guest) -> Result<()> {
        let policy = self.power_on;
        let mut attempt = 0u32;
        loop {
            if self.signal.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            let name = guest.name();
            let (last_error, pause) = match self.client.power_on(&name, policy.timeout) {
                Ok(envelope) if envelope.success => return Ok(()),
                Ok(envelope) if envelope.error_code() == Some(codes::GUEST_ALREADY_RUNNING) => {
                    debug!(guest = %name, "Guest already running");
                    return Ok(());
                }
                Ok(envelope) => {
                    warn!(
                        guest = %name,
                        attempt,
                        code = envelope.error_code(),
                        "Power-on refused"
                    );
                    (Error::remote(API_GUEST_ACTION, "poweron", envelope), true)
                }
                Err(e) if e.is_timeout() => {
                    warn!(guest = %name, attempt, "Power-on timed out");
                    (e, false)
                }
                Err(e) => return Err(e),
            };

            if policy.max_attempts.is_some_and(|max| attempt >= max) {
                error!(guest = %name, attempt, "Giving up on power-on");
                return Err(last_error);
            }
            if pause {
                self.signal.sleep(policy.retry_delay)?;
            }
        }
    }
}

/// Log the result of a finished export task. Never fails the workflow.
fn report_export(guest: &Guest) -> TaskOutcome {
    let Some(envelope) = guest.export_task() else {
        return TaskOutcome::Failed { code: None };
    };
    let outcome = TaskOutcome::classify(&envelope);
    match &outcome {
        TaskOutcome::Succeeded => info!(guest = %guest.name(), "Export finished"),
        TaskOutcome::LookupRaced => {
            debug!(guest = %guest.name(), "Export task no longer known to DSM, assuming success")
        }
        TaskOutcome::Failed { code } => {
            error!(guest = %guest.name(), code, "Failed exporting guest");
            if let Some(code) = code {
                for message in codes::describe(API_TASK_INFO, *code) {
                    error!(guest = %guest.name(), code, "Error: {message}");
                }
            }
            error!(
                guest = %guest.name(),
                response = %envelope.to_json(),
                "Full task status from DSM"
            );
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use crate::client::Envelope;
    use crate::guest::GuestSnapshot;
    use crate::task::TaskId;

    /// Log sink for a thread-local subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Report a finished task whose last status was `raw`, returning the outcome
    /// and everything that was logged.
    fn report(raw: Value) -> (TaskOutcome, String) {
        let snapshot = GuestSnapshot::from_value(json!({
            "guest_id": "g-1", "guest_name": "web01", "status": "shutdown"
        }))
        .unwrap();
        let guest = Guest::new(snapshot, Arc::new(RefreshSignal::new()));
        guest.begin_export(TaskId::new("42"));
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        guest.record_task_status(envelope);

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let outcome = tracing::subscriber::with_default(subscriber, || report_export(&guest));

        let logged = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
        (outcome, logged)
    }

    #[test]
    fn test_report_successful_task_logs_no_error() {
        let (outcome, logged) =
            report(json!({"success": true, "data": {"finish": true, "success": true}}));
        assert_eq!(outcome, TaskOutcome::Succeeded);
        assert!(logged.contains("Export finished"));
        assert!(!logged.contains("ERROR"));
        assert!(!logged.contains("Failed exporting guest"));
    }

    #[test]
    fn test_report_lookup_race_logs_no_error() {
        let (outcome, logged) = report(json!({"success": false, "error": {"code": 1000}}));
        assert_eq!(outcome, TaskOutcome::LookupRaced);
        assert!(!logged.contains("ERROR"));
        assert!(!logged.contains("Failed exporting guest"));
    }

    #[test]
    fn test_report_failed_task_logs_diagnostics() {
        let (outcome, logged) = report(json!({
            "success": true,
            "data": {"finish": true, "success": false, "error": {"code": 700}}
        }));
        assert_eq!(outcome, TaskOutcome::Failed { code: Some(700) });
        assert!(logged.contains("Failed exporting guest"));
        assert!(logged.contains("The storage is invalid."));
        assert!(logged.contains("Full task status from DSM"));
    }

    #[test]
    fn test_artifact_path() {
        assert_eq!(artifact_path("/share/VMM", "web01"), "/share/VMM/web01.ova");
        assert_eq!(artifact_path("/share/VMM/", "web01"), "/share/VMM/web01.ova");
    }

    #[test]
    fn test_power_on_policy_default() {
        let policy = PowerOnPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(60));
        assert_eq!(policy.retry_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn test_export_phase_display() {
        assert_eq!(format!("{}", ExportPhase::Deleting), "Deleting old export");
        assert_eq!(format!("{}", ExportPhase::PoweringOff), "Powering off");
        assert_eq!(format!("{}", ExportPhase::Exporting), "Exporting");
        assert_eq!(format!("{}", ExportPhase::PoweringOn), "Powering on");
        assert_eq!(format!("{}", ExportPhase::Complete), "Complete");
    }
}
