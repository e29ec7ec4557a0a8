//! Worker pool.
//!
//! A fixed number of threads drain one FIFO job queue. The queue is seeded once
//! and its sender dropped, so each worker stops by itself when the queue runs dry.
//! A failing guest is logged and recorded; the worker moves on to the next job.
//! A panicking workflow counts as that guest's failure.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::transport::Transport;
use crate::workflow::{ExportOutcome, Workflow};

/// One queued export.
#[derive(Debug, Clone)]
pub struct Job {
    /// Position in the queue.
    pub seq: usize,
    pub guest: Arc<Guest>,
}

/// Result of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestOutcome {
    pub guest: String,
    /// The workflow outcome, or the error that aborted it.
    pub result: std::result::Result<ExportOutcome, String>,
}

impl GuestOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::config("worker count must be at least 1"));
        }
        Ok(Self { workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Export every guest in `guests`, at most `workers` at a time.
    ///
    /// Blocks until the queue is drained. Outcomes come back in queue order.
    pub fn run<T, I>(&self, guests: I, workflow: &Workflow<'_, T>) -> Result<Vec<GuestOutcome>>
    where
        T: Transport,
        I: IntoIterator<Item = Arc<Guest>>,
    {
        let (queue, jobs) = unbounded();
        for (seq, guest) in guests.into_iter().enumerate() {
            queue
                .send(Job { seq, guest })
                .map_err(|_| Error::worker("job queue closed while seeding"))?;
        }
        drop(queue);
        debug!(jobs = jobs.len(), workers = self.workers, "Job queue seeded");

        let mut finished = thread::scope(|s| {
            let handles = (0..self.workers)
                .map(|id| {
                    let jobs = jobs.clone();
                    thread::Builder::new()
                        .name(format!("export-worker-{id}"))
                        .spawn_scoped(s, move || drain(id, &jobs, workflow))
                        .map_err(|e| Error::worker(format!("failed to spawn worker {id}: {e}")))
                })
                .collect::<Result<Vec<_>>>()?;

            let mut finished = Vec::new();
            for handle in handles {
                let outcomes = handle
                    .join()
                    .map_err(|_| Error::worker("worker thread panicked"))?;
                finished.extend(outcomes);
            }
            Ok::<_, Error>(finished)
        })?;

        finished.sort_by_key(|(seq, _)| *seq);
        Ok(finished.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

fn drain<T: Transport>(
    worker: usize,
    jobs: &Receiver<Job>,
    workflow: &Workflow<'_, T>,
) -> Vec<(usize, GuestOutcome)> {
    let mut outcomes = Vec::new();
    for job in jobs.iter() {
        let name = job.guest.name();
        debug!(worker, guest = %name, "Picked up job");
        let result = match panic::catch_unwind(AssertUnwindSafe(|| workflow.export(&job.guest))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                error!(worker, guest = %name, error = %e, "Export workflow failed");
                Err(e.to_string())
            }
            Err(payload) => {
                let message = format!("export workflow panicked: {}", panic_message(&*payload));
                error!(worker, guest = %name, "{message}");
                Err(message)
            }
        };
        outcomes.push((job.seq, GuestOutcome { guest: name, result }));
    }
    debug!(worker, "Queue drained");
    outcomes
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
