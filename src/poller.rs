use std::collections::HashSet;
use std::time::Duration;

use crate::app::{ProgressSink, emit};
use crate::client::JobStore;
use crate::clock::Clock;
use crate::domain::{JobStatus, RemoteJob};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollOptions {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// Final partition of the polled ids. Jobs in `succeeded` and `failed` are
/// the records observed when they turned terminal.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub succeeded: Vec<RemoteJob>,
    pub failed: Vec<RemoteJob>,
    pub timed_out: Vec<String>,
    pub rounds: usize,
}

impl PollOutcome {
    pub fn is_complete(&self) -> bool {
        self.timed_out.is_empty()
    }
}

/// Polls `ids` until each reports a terminal status or `options.deadline`
/// has elapsed. Every pending id is queried once per round; a failed query
/// leaves the id pending. Reaching the deadline is reported through
/// `timed_out`, not as an error. Remote jobs are never cancelled.
pub fn poll_until_terminal<S: JobStore + ?Sized, C: Clock + ?Sized>(
    store: &S,
    clock: &C,
    ids: &[String],
    options: PollOptions,
    sink: &dyn ProgressSink,
) -> PollOutcome {
    let mut seen = HashSet::new();
    let mut pending = ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    let mut outcome = PollOutcome::default();
    let start = clock.now();

    while !pending.is_empty() && clock.now().duration_since(start) < options.deadline {
        outcome.rounds += 1;
        let mut still_pending = Vec::with_capacity(pending.len());

        for id in pending {
            match store.get_job(&id) {
                Ok(job) => match job.status() {
                    JobStatus::Succeeded => {
                        emit(sink, format!("job finished: {id}"));
                        tracing::info!(job = %id, "job succeeded");
                        outcome.succeeded.push(job);
                    }
                    JobStatus::Failed => {
                        let detail = job.error.as_deref().unwrap_or("no error detail");
                        emit(sink, format!("job failed: {id} (error: {detail})"));
                        tracing::warn!(job = %id, error = detail, "job failed");
                        outcome.failed.push(job);
                    }
                    JobStatus::Pending => still_pending.push(id),
                },
                Err(err) => {
                    tracing::debug!(
                        job = %id,
                        error = %err,
                        "status query failed; keeping job pending"
                    );
                    still_pending.push(id);
                }
            }
        }

        pending = still_pending;
        if !pending.is_empty() {
            tracing::debug!(pending = pending.len(), round = outcome.rounds, "waiting for jobs");
            clock.sleep(options.interval);
        }
    }

    if !pending.is_empty() {
        emit(sink, format!("timeout waiting for {} job(s)", pending.len()));
        tracing::warn!(pending = pending.len(), "deadline reached with jobs still pending");
    }
    outcome.timed_out = pending;
    outcome
}
