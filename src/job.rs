use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::MySqlPool;
use tracing::{debug, instrument};

use crate::errors::ScheduleError;
use crate::schema::{JobRow, ScheduledJobRow, parameters_from_text};
use crate::sieve::{PollKind, SieveKey};
use crate::storage;

/// The status identifiers that terminate a job chain.
pub mod status {
    /// The chain finished successfully.
    pub const DONE: &str = "done";
    /// The chain exhausted its retry budget.
    pub const FAILED: &str = "failed";
    /// The chain was canceled.
    pub const CANCELED: &str = "canceled";
}

/// Terminal statuses. A job in one of these persists no further continuation
/// and triggers deletion of its originating scheduled job.
pub(crate) const ULTIMATE_STATUSES: [&str; 3] = [status::CANCELED, status::FAILED, status::DONE];

/// Maximum attempts of a single status before the chain is persisted as
/// failed.
pub(crate) const MAX_RETRIES: i32 = 5;

pub(crate) fn is_ultimate(status: &str) -> bool {
    ULTIMATE_STATUSES.contains(&status)
}

/// One step of an execution chain. Immutable; transitions produce new
/// values via [`Job::beget`] and [`Job::retry`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Job {
    /// Persistent id, 0 until the row is inserted.
    pub(crate) id: u64,
    pub(crate) scheduled_job_id: u64,
    pub(crate) parent_id: u64,
    pub(crate) name: String,
    pub(crate) status: String,
    pub(crate) parameters: Value,
    pub(crate) attempt: i32,
}

impl Job {
    pub(crate) fn is_finished(&self) -> bool {
        is_ultimate(&self.status)
    }

    /// The continuation persisted after a handler step. Re-yielding the
    /// current status counts as a retry; a new status resets the attempt
    /// counter.
    pub(crate) fn beget(&self, status: &str, parameters: Value) -> Job {
        let attempt = if status == self.status { self.attempt + 1 } else { 1 };
        Job {
            id: 0,
            scheduled_job_id: self.scheduled_job_id,
            parent_id: self.id,
            name: self.name.clone(),
            status: status.to_owned(),
            parameters,
            attempt,
        }
    }

    /// The continuation persisted after a handler error: the same status
    /// again while the attempt budget lasts, `failed` once it is exhausted.
    pub(crate) fn retry(&self) -> Job {
        if self.attempt < MAX_RETRIES {
            self.beget(&self.status, self.parameters.clone())
        } else {
            self.beget(status::FAILED, self.parameters.clone())
        }
    }

    pub(crate) fn persisted(mut self, id: u64) -> Job {
        self.id = id;
        self
    }
}

/// A pending scheduled job picked up by the scheduler publisher.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScheduledJob {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) status: String,
    pub(crate) parameters: Value,
    pub(crate) scheduled_for: DateTime<Utc>,
}

impl ScheduledJob {
    /// The root job of a fresh chain.
    pub(crate) fn beget(&self) -> Job {
        Job {
            id: 0,
            scheduled_job_id: self.id,
            parent_id: 0,
            name: self.name.clone(),
            status: self.status.clone(),
            parameters: self.parameters.clone(),
            attempt: 1,
        }
    }
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = serde_json::Error;

    fn try_from(row: ScheduledJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            status: row.status,
            parameters: parameters_from_text(&row.parameters)?,
            scheduled_for: row.scheduled_for,
        })
    }
}

/// A `jobs` row in a non-terminal status whose `updated_at` is older than
/// the recovery threshold: its worker crashed or lost the row mid-flight.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StuckJob {
    pub(crate) id: u64,
    pub(crate) scheduled_job_id: u64,
    pub(crate) name: String,
    pub(crate) status: String,
    pub(crate) parameters: Value,
    pub(crate) attempt: i32,
}

impl StuckJob {
    /// The recovery continuation: same status, one more attempt, parented to
    /// the stuck row. If the chain was already continued elsewhere the
    /// insert hits the uniqueness predicate and is treated as a lost race.
    pub(crate) fn beget(&self) -> Job {
        Job {
            id: 0,
            scheduled_job_id: self.scheduled_job_id,
            parent_id: self.id,
            name: self.name.clone(),
            status: self.status.clone(),
            parameters: self.parameters.clone(),
            attempt: self.attempt + 1,
        }
    }
}

impl TryFrom<JobRow> for StuckJob {
    type Error = serde_json::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            scheduled_job_id: row.scheduled_job_id,
            name: row.name,
            status: row.status,
            parameters: parameters_from_text(&row.parameters)?,
            attempt: row.attempt,
        })
    }
}

/// A value traversing the publisher → dedup → consumer pipeline. `Job`
/// values never enter the pipeline; they exist only inside a consumer's
/// continuation chain.
#[derive(Debug, Clone)]
pub(crate) enum PolledJob {
    Scheduled(ScheduledJob),
    Stuck(StuckJob),
}

impl PolledJob {
    pub(crate) fn id(&self) -> u64 {
        match self {
            PolledJob::Scheduled(job) => job.id,
            PolledJob::Stuck(job) => job.id,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            PolledJob::Scheduled(job) => &job.name,
            PolledJob::Stuck(job) => &job.name,
        }
    }

    /// Deduplication key. A scheduled job and a stuck job with the same
    /// numeric id are distinct.
    pub(crate) fn key(&self) -> SieveKey {
        match self {
            PolledJob::Scheduled(job) => (PollKind::Scheduled, job.id),
            PolledJob::Stuck(job) => (PollKind::Stuck, job.id),
        }
    }
}

/// Persist a scheduled job that becomes runnable at or after `due_at`.
///
/// `name` must match a handler registered on the worker that should execute
/// the job; `status` is handed to the first handler invocation. Returns the
/// new row's id.
#[instrument(name = "stagehand.schedule", skip(pool, parameters), fields(job.name = name, job.status = status))]
pub async fn schedule(
    pool: &MySqlPool,
    name: &str,
    status: &str,
    parameters: Value,
    due_at: DateTime<Utc>,
) -> Result<u64, ScheduleError> {
    let scheduled = ScheduledJob {
        id: 0,
        name: name.to_owned(),
        status: status.to_owned(),
        parameters,
        scheduled_for: due_at,
    };
    let id = storage::insert_scheduled_job(pool, &scheduled).await?;
    debug!(scheduled_job.id = id, "Scheduled job");
    Ok(id)
}

/// Cancel a pending scheduled job.
///
/// Idempotent; a chain already started from this scheduled job is not
/// interrupted.
#[instrument(name = "stagehand.cancel", skip(pool))]
pub async fn cancel(pool: &MySqlPool, scheduled_job_id: u64) -> Result<(), sqlx::Error> {
    storage::delete_scheduled_job_by_id(pool, scheduled_job_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(status: &str, attempt: i32) -> Job {
        Job {
            id: 17,
            scheduled_job_id: 3,
            parent_id: 9,
            name: "pipeline".into(),
            status: status.into(),
            parameters: json!({"n": 1}),
            attempt,
        }
    }

    #[test]
    fn beget_resets_attempt_on_new_status() {
        let child = job("start", 4).beget("phase2", json!({"n": 2}));
        assert_eq!(child.attempt, 1);
        assert_eq!(child.parent_id, 17);
        assert_eq!(child.scheduled_job_id, 3);
        assert_eq!(child.status, "phase2");
        assert_eq!(child.id, 0);
    }

    #[test]
    fn beget_counts_same_status_as_retry() {
        let child = job("start", 2).beget("start", json!({"n": 1}));
        assert_eq!(child.attempt, 3);
    }

    #[test]
    fn retry_keeps_status_while_budget_lasts() {
        let child = job("start", 4).retry();
        assert_eq!(child.status, "start");
        assert_eq!(child.attempt, 5);
    }

    #[test]
    fn retry_fails_chain_once_budget_is_exhausted() {
        let child = job("start", MAX_RETRIES).retry();
        assert_eq!(child.status, status::FAILED);
        assert_eq!(child.attempt, 1);
        assert!(child.is_finished());
    }

    #[test]
    fn scheduled_job_begets_a_root() {
        let scheduled = ScheduledJob {
            id: 7,
            name: "greet".into(),
            status: "start".into(),
            parameters: json!({"name": "world"}),
            scheduled_for: Utc::now(),
        };
        let root = scheduled.beget();
        assert_eq!(root.scheduled_job_id, 7);
        assert_eq!(root.parent_id, 0);
        assert_eq!(root.attempt, 1);
        assert_eq!(root.status, "start");
    }

    #[test]
    fn stuck_job_begets_a_recovery_continuation() {
        let stuck = StuckJob {
            id: 21,
            scheduled_job_id: 7,
            name: "greet".into(),
            status: "start".into(),
            parameters: json!({}),
            attempt: 1,
        };
        let recovery = stuck.beget();
        assert_eq!(recovery.parent_id, 21);
        assert_eq!(recovery.scheduled_job_id, 7);
        assert_eq!(recovery.attempt, 2);
        assert_eq!(recovery.status, "start");
    }

    #[test]
    fn dedup_keys_distinguish_kinds() {
        let scheduled = PolledJob::Scheduled(ScheduledJob {
            id: 7,
            name: "greet".into(),
            status: "start".into(),
            parameters: Value::Null,
            scheduled_for: Utc::now(),
        });
        let stuck = PolledJob::Stuck(StuckJob {
            id: 7,
            scheduled_job_id: 0,
            name: "greet".into(),
            status: "start".into(),
            parameters: Value::Null,
            attempt: 1,
        });
        assert_ne!(scheduled.key(), stuck.key());
    }

    #[test]
    fn ultimate_statuses_are_terminal() {
        for terminal in ULTIMATE_STATUSES {
            assert!(job(terminal, 1).is_finished());
        }
        assert!(!job("start", 1).is_finished());
    }
}
