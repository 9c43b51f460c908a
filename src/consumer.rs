use std::sync::Arc;

use tracing::{debug, error};

use crate::executor::Executor;
use crate::fanout::OutputStream;
use crate::job::PolledJob;
use crate::util::Reporter;

/// Serially drain one output stream, executing each job's continuation
/// chain to completion before returning to the stream.
///
/// Keeping a chain on one consumer persists its continuations in order and
/// avoids churning them back through the dedup stage. Errors never escape:
/// a failed chain is logged and reported, and the consumer moves on.
pub(crate) async fn run(mut stream: OutputStream, executor: Arc<Executor>, reporter: Reporter) {
    while let Some(polled) = stream.recv().await {
        debug!(job.id = polled.id(), job.name = %polled.name(), "Received job");
        if let Err(error) = drive_chain(&executor, polled).await {
            error!("Job chain aborted: {error:#}");
            reporter.report(&error);
        }
    }
    debug!("Stream closed, consumer shutting down");
}

/// Run one chain: the polled value begets a persisted job, then each step is
/// advanced until the executor reports the chain complete. The terminal
/// continuation passes through `advance` once more for its cleanup.
async fn drive_chain(executor: &Executor, polled: PolledJob) -> anyhow::Result<()> {
    let mut next = executor.execute(polled).await?;
    while let Some(job) = next {
        next = executor.advance(job).await?;
    }
    Ok(())
}
