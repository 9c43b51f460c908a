use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures_util::FutureExt;
use serde_json::Value;
use sqlx::MySqlPool;
use tracing::{Instrument, debug, info_span, warn};

use crate::handler::{HandlerMap, Transition};
use crate::job::{Job, PolledJob, status};
use crate::storage;
use crate::util::{Reporter, try_to_extract_panic_info};

/// Advances a single job exactly one step and persists the result.
pub(crate) struct Executor {
    pool: MySqlPool,
    handlers: Arc<HandlerMap>,
    reporter: Reporter,
}

impl Executor {
    pub(crate) fn new(pool: MySqlPool, handlers: Arc<HandlerMap>, reporter: Reporter) -> Self {
        Self {
            pool,
            handlers,
            reporter,
        }
    }

    /// First step for a value arriving from the pipeline: persist the job
    /// row the polled item begets. No handler runs here; the returned job is
    /// advanced by the consumer's chain loop.
    pub(crate) async fn execute(&self, polled: PolledJob) -> anyhow::Result<Option<Job>> {
        match polled {
            PolledJob::Scheduled(scheduled) => {
                debug!(
                    scheduled_job.id = scheduled.id,
                    job.name = %scheduled.name,
                    "Starting scheduled job"
                );
                self.persist(scheduled.beget()).await
            }
            PolledJob::Stuck(stuck) => {
                warn!(
                    job.id = stuck.id,
                    job.name = %stuck.name,
                    job.attempt = stuck.attempt,
                    "Recovering stuck job"
                );
                self.persist(stuck.beget()).await
            }
        }
    }

    /// Advance a persisted job one step.
    ///
    /// A terminal job gets its cleanup (the originating scheduled row is
    /// deleted) and ends the chain. A non-terminal job runs its handler and
    /// persists the continuation; handler errors and panics burn one attempt
    /// and the chain is persisted as failed once the budget is exhausted.
    pub(crate) async fn advance(&self, job: Job) -> anyhow::Result<Option<Job>> {
        if job.is_finished() {
            debug!(job.id = job.id, job.status = %job.status, "Chain finished, cleaning up");
            if job.scheduled_job_id != 0 {
                storage::delete_scheduled_job_by_id(&self.pool, job.scheduled_job_id).await?;
            }
            return Ok(None);
        }

        let handler = self
            .handlers
            .get(&job.name)
            .ok_or_else(|| anyhow!("no handler registered for job {}", job.name))?;

        let span = info_span!(
            "job",
            job.id = job.id,
            job.name = %job.name,
            job.status = %job.status,
            job.attempt = job.attempt,
        );
        let outcome = AssertUnwindSafe(handler(job.status.clone(), job.parameters.clone()))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .map_err(|panic| try_to_extract_panic_info(&*panic))
            .and_then(std::convert::identity);

        let next = span.in_scope(|| match outcome {
            Ok(Transition::To { status, parameters }) => job.beget(&status, parameters),
            Ok(Transition::Done) => job.beget(status::DONE, Value::Null),
            Err(error) => {
                warn!("Handler failed: {error:#}");
                self.reporter.report(&error);
                job.retry()
            }
        });
        self.persist(next).await
    }

    /// Insert a continuation row. A unique violation means another worker
    /// already persisted this continuation; the race is benign and the
    /// chain ends here for this worker.
    async fn persist(&self, job: Job) -> anyhow::Result<Option<Job>> {
        match storage::insert_job(&self.pool, &job).await {
            Ok(id) => Ok(Some(job.persisted(id))),
            Err(error) if storage::is_unique_violation(&error) => {
                debug!(
                    job.parent_id = job.parent_id,
                    "Continuation already persisted elsewhere, backing off"
                );
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }
}
