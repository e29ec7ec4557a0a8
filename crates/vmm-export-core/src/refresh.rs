//! State refresh loop.
//!
//! A single thread re-reads guest and export-task state on a fixed interval and
//! then releases everyone blocked on the [`RefreshSignal`]. Cycles never overlap:
//! the ticker holds at most one pending tick, so a slow cycle drops ticks instead
//! of queueing them. Nothing is fetched while nobody is waiting.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use tracing::{debug, error, warn};

use crate::client::{log_failure, DsmClient};
use crate::codes;
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::signal::RefreshSignal;
use crate::task::TaskId;
use crate::transport::Transport;

/// Default time between refresh cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What one refresh cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Local guest records whose snapshot was replaced.
    pub guests_updated: usize,
    /// Export tasks observed finishing in this cycle.
    pub tasks_finished: usize,
    /// Task status fetches that failed.
    pub task_errors: usize,
    /// Waiters released at the end of the cycle.
    pub released: usize,
}

pub struct RefreshLoop<'a, T> {
    client: &'a DsmClient<T>,
    guests: &'a [Arc<Guest>],
    signal: &'a RefreshSignal,
    interval: Duration,
}

impl<'a, T: Transport> RefreshLoop<'a, T> {
    pub fn new(
        client: &'a DsmClient<T>,
        guests: &'a [Arc<Guest>],
        signal: &'a RefreshSignal,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            guests,
            signal,
            interval,
        }
    }

    /// Tick until `shutdown` yields a message or is disconnected.
    pub fn run(&self, shutdown: &Receiver<()>) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(e) = self.tick() {
                        warn!(error = %e, "Refresh cycle aborted, retrying next tick");
                    }
                }
            }
        }
        debug!("Refresh loop stopped");
    }

    /// Run a cycle if anyone is waiting for one.
    pub fn tick(&self) -> Result<Option<CycleReport>> {
        if self.signal.pending() == 0 {
            return Ok(None);
        }
        self.refresh().map(Some)
    }

    /// Run one full cycle: listing, then tasks, then release.
    ///
    /// A listing failure aborts the cycle before anything is released, so waiters
    /// stay registered for the next one. Task fetch failures are logged per guest.
    pub fn refresh(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for snapshot in self.client.list_guests()? {
            if let Some(guest) = self.guests.iter().find(|g| g.id() == snapshot.guest_id) {
                guest.replace_snapshot(snapshot);
                report.guests_updated += 1;
            }
        }

        for guest in self.guests {
            let Some(task_id) = guest.export_task_id() else {
                continue;
            };
            match self.refresh_task(guest, &task_id) {
                Ok(true) => report.tasks_finished += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        guest = %guest.name(),
                        task = %task_id,
                        error = %e,
                        "Failed to refresh export task"
                    );
                    report.task_errors += 1;
                }
            }
        }

        report.released = self.signal.release();
        debug!(?report, "Refresh cycle complete");
        Ok(report)
    }

    fn refresh_task(&self, guest: &Guest, task_id: &TaskId) -> Result<bool> {
        let envelope = self.client.task_status(task_id)?;
        if envelope.success || envelope.error_code() == Some(codes::TASK_NOT_FOUND) {
            return Ok(guest.record_task_status(envelope));
        }

        // Kept for diagnostics; a failed lookup never finishes the task.
        let request = DsmClient::<T>::task_request(task_id);
        log_failure(request.api(), request.method(), &envelope);
        guest.record_task_status(envelope.clone());
        Err(Error::remote(request.api(), request.method(), envelope))
    }
}
