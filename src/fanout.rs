use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::job::PolledJob;
use crate::sieve::{Sieve, SieveKey};

/// The dedup forwarder: drains the pipeline input, drops values whose key is
/// already in flight, and pushes the rest onto the bounded intermediate
/// stream shared by all consumers.
///
/// Cancelling `shutdown` closes the input; buffered values are still drained
/// through the gate, then the intermediate sender is dropped, which closes
/// every consumer's output stream in turn.
pub(crate) async fn forward(
    mut input: Receiver<PolledJob>,
    intermediate: Sender<PolledJob>,
    sieve: Arc<Sieve>,
    shutdown: CancellationToken,
) {
    let mut draining = false;
    loop {
        let next = if draining {
            input.recv().await
        } else {
            tokio::select! {
                () = shutdown.cancelled() => {
                    input.close();
                    draining = true;
                    continue;
                }
                next = input.recv() => next,
            }
        };

        let Some(job) = next else { break };

        if !sieve.insert(job.key()) {
            trace!(job.id = job.id(), job.name = %job.name(), "Dropping duplicate already in flight");
            continue;
        }
        if intermediate.send(job).await.is_err() {
            break;
        }
    }
    trace!("Dedup forwarder exiting");
}

/// One consumer's view of the shared intermediate stream.
///
/// Removal of the previously accepted key is deferred until the next value
/// is accepted (or the stream closes), so a duplicate cannot slip through
/// the window between executor start and executor completion.
pub(crate) struct OutputStream {
    intermediate: Arc<tokio::sync::Mutex<Receiver<PolledJob>>>,
    sieve: Arc<Sieve>,
    previous: Option<SieveKey>,
}

impl OutputStream {
    pub(crate) fn new(
        intermediate: Arc<tokio::sync::Mutex<Receiver<PolledJob>>>,
        sieve: Arc<Sieve>,
    ) -> Self {
        Self {
            intermediate,
            sieve,
            previous: None,
        }
    }

    /// Next value, or `None` once the pipeline has shut down.
    pub(crate) async fn recv(&mut self) -> Option<PolledJob> {
        let next = self.intermediate.lock().await.recv().await;
        if let Some(previous) = self.previous.take() {
            self.sieve.remove(&previous);
        }
        self.previous = next.as_ref().map(PolledJob::key);
        next
    }
}
