use std::future::Future;
use std::time::Duration;

use sqlx::MySqlPool;
use tokio::sync::mpsc::Sender;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::job::{PolledJob, ScheduledJob, StuckJob};
use crate::sieve::{PollKind, Sieve};
use crate::storage;
use crate::util::Reporter;

/// Outcome of one poll-and-publish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Published {
    /// Number of jobs pushed into the pipeline this cycle.
    Jobs(usize),
    /// The pipeline input is closed and nothing could be published.
    Stopped,
}

/// A periodic polling loop with adaptive backoff.
///
/// After an empty cycle the loop sleeps `max(min_sleep, max_sleep -
/// elapsed)`; after a productive cycle it polls again immediately. This
/// drains a backlog fast and settles near `max_sleep` when idle. The loop
/// exits when the pipeline input closes or the worker shuts down mid-sleep.
pub(crate) struct Publisher {
    pub(crate) locus: &'static str,
    pub(crate) min_sleep: Duration,
    pub(crate) max_sleep: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) reporter: Reporter,
}

impl Publisher {
    pub(crate) async fn run<F, Fut>(self, mut source: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Published>>,
    {
        loop {
            let started = Instant::now();
            let published = match source().await {
                Ok(Published::Stopped) => {
                    debug!("{}: pipeline closed, shutting down", self.locus);
                    break;
                }
                Ok(Published::Jobs(count)) => count,
                Err(error) => {
                    error!("{}: poll cycle failed: {error:#}", self.locus);
                    self.reporter.report(&error);
                    0
                }
            };

            if published > 0 {
                trace!("{}: published {published} jobs", self.locus);
                continue;
            }

            let pause = self.max_sleep.saturating_sub(started.elapsed()).max(self.min_sleep);
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("{}: shutdown requested, exiting", self.locus);
                    break;
                }
                () = sleep(pause) => {}
            }
        }
    }
}

/// Push values one at a time onto the pipeline input, stopping at the first
/// refusal. Reports `Stopped` only when nothing was published and the input
/// is closed.
pub(crate) async fn batch_publish(input: &Sender<PolledJob>, jobs: Vec<PolledJob>) -> Published {
    let mut published = 0;
    for job in jobs {
        if input.send(job).await.is_err() {
            break;
        }
        published += 1;
    }
    if published == 0 && input.is_closed() {
        Published::Stopped
    } else {
        Published::Jobs(published)
    }
}

/// One scheduler cycle: fetch due scheduled jobs not already in flight and
/// publish them.
pub(crate) async fn poll_scheduled_jobs(
    pool: &MySqlPool,
    names: &[String],
    sieve: &Sieve,
    input: &Sender<PolledJob>,
    prefetch: i64,
    reporter: &Reporter,
) -> anyhow::Result<Published> {
    let exclude_ids = exclusion_list(sieve, PollKind::Scheduled);
    let rows = storage::select_n_ready_scheduled_jobs(pool, names, &exclude_ids, prefetch).await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id;
        match ScheduledJob::try_from(row) {
            Ok(job) => jobs.push(PolledJob::Scheduled(job)),
            // A row with an unreadable payload must not block the poll head
            // forever; skip it and keep the rest of the batch.
            Err(error) => {
                warn!(scheduled_job.id = id, "Skipping scheduled job with malformed parameters: {error}");
                reporter.report(&anyhow::Error::new(error));
            }
        }
    }
    Ok(batch_publish(input, jobs).await)
}

/// One recovery cycle: fetch abandoned job rows not already in flight and
/// publish them.
pub(crate) async fn poll_stuck_jobs(
    pool: &MySqlPool,
    names: &[String],
    sieve: &Sieve,
    input: &Sender<PolledJob>,
    stuck_threshold_mins: u32,
    prefetch: i64,
    reporter: &Reporter,
) -> anyhow::Result<Published> {
    let exclude_ids = exclusion_list(sieve, PollKind::Stuck);
    let rows =
        storage::select_n_stuck_jobs(pool, names, &exclude_ids, stuck_threshold_mins, prefetch)
            .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id;
        match StuckJob::try_from(row) {
            Ok(job) => jobs.push(PolledJob::Stuck(job)),
            Err(error) => {
                warn!(job.id = id, "Skipping stuck job with malformed parameters: {error}");
                reporter.report(&anyhow::Error::new(error));
            }
        }
    }
    Ok(batch_publish(input, jobs).await)
}

/// The sieve snapshot with the sentinel id prepended so the SQL `NOT IN`
/// list is never empty.
fn exclusion_list(sieve: &Sieve, kind: PollKind) -> Vec<u64> {
    let mut exclude_ids = vec![0];
    exclude_ids.extend(sieve.ids(kind));
    exclude_ids
}
