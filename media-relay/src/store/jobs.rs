//! Registry of job statuses.
//!
//! Every write goes through one `RwLock`, and readers get clones. Updates
//! carry the run number of the job that produced them, so a late update from
//! a superseded run is dropped instead of overwriting a retry.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::job::model::{Job, JobState, JobStatus};

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(JobStatus),
    NotCancellable(JobState),
    NotFound,
}

impl CancelOutcome {
    /// Human-readable result for the caller.
    pub fn message(&self, id: &str) -> String {
        match self {
            Self::Cancelled(_) => format!("Job {id} cancelled"),
            Self::NotCancellable(state) => format!("Job {id} is {state} and cannot be cancelled"),
            Self::NotFound => format!("Job {id} not found"),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Why a retry was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryRefusal {
    NotRetryable(JobState),
    NotFound,
}

struct Entry {
    job: Job,
    status: JobStatus,
}

#[derive(Default)]
pub struct JobRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `queued`.
    pub fn insert(&self, job: Job, message: &str) -> JobStatus {
        let status = JobStatus::queued(&job, message);
        self.entries.write().insert(
            job.id.clone(),
            Entry {
                job,
                status: status.clone(),
            },
        );
        status
    }

    pub fn get(&self, id: &str) -> Option<JobStatus> {
        self.entries.read().get(id).map(|e| e.status.clone())
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.entries.read().get(id).map(|e| e.job.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Consistent copy of every status, oldest first.
    pub fn snapshot(&self) -> Vec<JobStatus> {
        let mut list: Vec<JobStatus> = self
            .entries
            .read()
            .values()
            .map(|e| e.status.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Apply `f` to the status of `id` if it belongs to `run`.
    fn update<F>(&self, id: &str, run: u32, f: F) -> Option<JobStatus>
    where
        F: FnOnce(&mut JobStatus) -> bool,
    {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(id)?;
        if entry.status.run != run {
            debug!(job_id = %id, run, current = entry.status.run, "Dropping update from stale run");
            return None;
        }
        if f(&mut entry.status) {
            Some(entry.status.clone())
        } else {
            None
        }
    }

    /// Move to `state` if the lifecycle allows it.
    pub fn advance(
        &self,
        id: &str,
        run: u32,
        state: JobState,
        message: impl Into<String>,
    ) -> Option<JobStatus> {
        let message = message.into();
        self.update(id, run, |status| {
            if !status.state.can_transition_to(state) {
                debug!(job_id = %id, from = %status.state, to = %state, "Refusing transition");
                return false;
            }
            status.state = state;
            status.progress = message;
            if state.is_terminal() {
                status.finished_at = Some(Utc::now());
            }
            true
        })
    }

    /// Record a progress line. The percentage never goes down, and nothing
    /// changes once the job is terminal.
    pub fn record_progress(
        &self,
        id: &str,
        run: u32,
        percent: Option<f64>,
        message: impl Into<String>,
    ) -> Option<JobStatus> {
        let message = message.into();
        self.update(id, run, |status| {
            if status.state.is_terminal() {
                return false;
            }
            if let Some(p) = percent.filter(|p| p.is_finite()) {
                status.percent = status.percent.max(p.clamp(0.0, 100.0));
            }
            status.progress = message;
            true
        })
    }

    pub fn complete(
        &self,
        id: &str,
        run: u32,
        output: Option<String>,
        message: impl Into<String>,
    ) -> Option<JobStatus> {
        let message = message.into();
        self.update(id, run, |status| {
            if !status.state.can_transition_to(JobState::Completed) {
                return false;
            }
            status.state = JobState::Completed;
            status.percent = 100.0;
            status.progress = message;
            status.output = output;
            status.finished_at = Some(Utc::now());
            true
        })
    }

    pub fn fail(&self, id: &str, run: u32, error: impl Into<String>) -> Option<JobStatus> {
        let error = error.into();
        self.update(id, run, |status| {
            if !status.state.can_transition_to(JobState::Error) {
                return false;
            }
            status.state = JobState::Error;
            status.progress = error.clone();
            status.error = Some(error);
            status.finished_at = Some(Utc::now());
            true
        })
    }

    /// Mark the job cancelled and fire its cancellation handle.
    pub fn cancel(&self, id: &str, message: &str) -> CancelOutcome {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            return CancelOutcome::NotFound;
        };
        if !entry.status.state.is_cancellable() {
            return CancelOutcome::NotCancellable(entry.status.state);
        }

        entry.status.state = JobState::Cancelled;
        entry.status.progress = message.to_string();
        entry.status.finished_at = Some(Utc::now());
        entry.job.cancel_token().cancel();
        CancelOutcome::Cancelled(entry.status.clone())
    }

    /// Next run of a retryable job, without touching its status.
    pub fn retry_candidate(&self, id: &str) -> Result<Job, RetryRefusal> {
        let entries = self.entries.read();
        let entry = entries.get(id).ok_or(RetryRefusal::NotFound)?;
        if !entry.status.state.is_retryable() {
            return Err(RetryRefusal::NotRetryable(entry.status.state));
        }
        Ok(entry.job.next_run())
    }

    /// Install `job` as the current run of its id, resetting the status to
    /// `queued`. Refused if the job left its retryable state meanwhile.
    pub fn requeue(&self, job: Job, message: &str) -> Result<JobStatus, RetryRefusal> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&job.id).ok_or(RetryRefusal::NotFound)?;
        if !entry.status.state.is_retryable() || entry.status.run + 1 != job.run {
            return Err(RetryRefusal::NotRetryable(entry.status.state));
        }

        let mut status = JobStatus::queued(&job, message);
        status.created_at = entry.status.created_at;
        entry.status = status.clone();
        entry.job = job;
        Ok(status)
    }

    /// Drop the job if run `run` has finished. Returns whether it was removed.
    pub fn remove_finished(&self, id: &str, run: u32) -> bool {
        let mut entries = self.entries.write();
        let finished = entries
            .get(id)
            .is_some_and(|e| e.status.run == run && e.status.state.is_terminal());
        if finished {
            entries.remove(id);
        }
        finished
    }

    /// Remove every completed or failed job. Returns how many were removed.
    pub fn clear_terminal(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !matches!(e.status.state, JobState::Completed | JobState::Error));
        before - entries.len()
    }

    /// Fire the cancellation handle of every job without changing statuses.
    pub fn cancel_all_tokens(&self) {
        for entry in self.entries.read().values() {
            entry.job.cancel_token().cancel();
        }
    }
}
