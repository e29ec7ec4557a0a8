//! Export orchestrator.
//!
//! Ties the pieces together for one run:
//! 1. Log in and list guests
//! 2. Select guests with the include/exclude filter
//! 3. Start the refresh loop on its own thread
//! 4. Drain the job queue with the worker pool
//! 5. Stop the refresh loop, cancel outstanding waits and log out
//!
//! # Example
//!
//! ```no_run
//! use vmm_export_core::{run_export, ExportConfig, HttpTransport};
//!
//! let config = ExportConfig::new("192.168.1.100:5000", "admin", "secret", "/Backups/VMM")
//!     .with_workers(2);
//! let report = run_export(&config, HttpTransport::new().unwrap(), None).unwrap();
//! println!("{} of {} guests exported", report.succeeded(), report.outcomes.len());
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::{info, warn};

use crate::client::DsmClient;
use crate::error::{Error, Result};
use crate::filter::GuestFilter;
use crate::guest::{Guest, GuestSnapshot};
use crate::pool::{GuestOutcome, WorkerPool};
use crate::refresh::{RefreshLoop, DEFAULT_POLL_INTERVAL};
use crate::signal::RefreshSignal;
use crate::transport::Transport;
use crate::workflow::{EventCallback, PowerOnPolicy, Workflow};

/// Everything one export run needs.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// DSM address, `host[:port]` or a full URL.
    pub dsm_url: String,
    pub username: String,
    pub password: String,
    /// Remote directory the OVAs are written to, e.g. `/Backups/VMM`.
    pub target_path: String,
    /// Guests exported in parallel.
    pub workers: usize,
    pub filter: GuestFilter,
    /// Time between refresh cycles.
    pub poll_interval: Duration,
    pub power_on: PowerOnPolicy,
}

impl ExportConfig {
    /// Create a config with one worker, no filter and default timings.
    pub fn new(
        dsm_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        target_path: impl Into<String>,
    ) -> Self {
        Self {
            dsm_url: dsm_url.into(),
            username: username.into(),
            password: password.into(),
            target_path: target_path.into(),
            workers: 1,
            filter: GuestFilter::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            power_on: PowerOnPolicy::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_filter(mut self, filter: GuestFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_power_on(mut self, power_on: PowerOnPolicy) -> Self {
        self.power_on = power_on;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dsm_url.trim().is_empty() {
            return Err(Error::config("DSM URL must not be empty"));
        }
        if self.target_path.trim().is_empty() {
            return Err(Error::config("export path must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::config("worker count must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.power_on.timeout.is_zero() {
            return Err(Error::config("power-on timeout must be greater than zero"));
        }
        if self.power_on.retry_delay.is_zero() {
            return Err(Error::config("power-on retry delay must be greater than zero"));
        }
        if self.power_on.max_attempts == Some(0) {
            return Err(Error::config("power-on attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// One entry per selected guest, in queue order.
    pub outcomes: Vec<GuestOutcome>,
}

impl ExportReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Build live records for the guests the filter lets through, one per guest id.
pub fn select_guests(
    listing: Vec<GuestSnapshot>,
    filter: &GuestFilter,
    signal: &Arc<RefreshSignal>,
) -> Vec<Arc<Guest>> {
    let mut seen = HashSet::new();
    listing
        .into_iter()
        .filter(|snapshot| filter.allows(&snapshot.guest_name))
        .filter(|snapshot| seen.insert(snapshot.guest_id.clone()))
        .map(|snapshot| Arc::new(Guest::new(snapshot, Arc::clone(signal))))
        .collect()
}

/// Run a complete export against the DSM reachable through `transport`.
///
/// Per-guest failures end up in the report; only setup failures (invalid config,
/// login, the initial listing) are returned as errors.
pub fn run_export<T: Transport>(
    config: &ExportConfig,
    transport: T,
    events: Option<EventCallback>,
) -> Result<ExportReport> {
    config.validate()?;
    let pool = WorkerPool::new(config.workers)?;

    let mut client = DsmClient::new(transport, &config.dsm_url);
    client.login(&config.username, &config.password)?;
    info!(dsm = client.base_url(), "Logged in");

    let signal = Arc::new(RefreshSignal::new());
    let guests = select_guests(client.list_guests()?, &config.filter, &signal);
    info!(
        guests = guests.len(),
        workers = pool.workers(),
        "Selected guests for export"
    );

    let outcomes = thread::scope(|s| {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let refresher = RefreshLoop::new(&client, &guests, &signal, config.poll_interval);
        let refresh_thread = thread::Builder::new()
            .name("refresh".to_string())
            .spawn_scoped(s, move || refresher.run(&shutdown_rx))
            .map_err(|e| Error::worker(format!("failed to spawn refresh thread: {e}")))?;

        let workflow = Workflow::new(&client, &signal, &config.target_path, &config.power_on)
            .with_events(events.as_ref());
        let result = pool.run(guests.iter().cloned(), &workflow);

        // Queue drained: stop polling and abandon anything still waiting.
        let _ = shutdown.send(());
        signal.cancel();
        if refresh_thread.join().is_err() {
            warn!("Refresh thread panicked");
        }
        result
    })?;

    if let Err(e) = client.logout() {
        warn!(error = %e, "Logout failed");
    }

    let report = ExportReport { outcomes };
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Export run finished"
    );
    Ok(report)
}
