use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sqlx::MySqlPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::consumer;
use crate::executor::Executor;
use crate::fanout::{self, OutputStream};
use crate::handler::HandlerMap;
use crate::publisher::{Publisher, poll_scheduled_jobs, poll_stuck_jobs};
use crate::sieve::Sieve;
use crate::util::Reporter;

const DEFAULT_BUFFER_SIZE: usize = 10;
const DEFAULT_PREFETCH: i64 = 10;
const DEFAULT_NUM_CONSUMERS: usize = 2;
const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(10);
const DEFAULT_RECOVERY_THRESHOLD_MINS: u32 = 20;

/// Handle to a running worker: two publishers, the dedup forwarder, and a
/// fixed pool of consumers, all feeding off the caller's connection pool.
///
/// Construct with [`Worker::builder`]; shut down with [`Worker::stop`].
#[derive(Debug)]
pub struct Worker {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    running: bool,
}

impl Worker {
    /// Start configuring a worker over `pool` that dispatches to `handlers`.
    pub fn builder(pool: MySqlPool, handlers: HandlerMap) -> WorkerBuilder {
        WorkerBuilder {
            pool,
            handlers,
            buffer_size: DEFAULT_BUFFER_SIZE,
            prefetch: DEFAULT_PREFETCH,
            num_consumers: DEFAULT_NUM_CONSUMERS,
            min_scheduler_sleep: Duration::ZERO,
            max_scheduler_sleep: DEFAULT_MAX_SLEEP,
            min_recovery_sleep: Duration::ZERO,
            max_recovery_sleep: DEFAULT_MAX_SLEEP,
            recovery_threshold_mins: DEFAULT_RECOVERY_THRESHOLD_MINS,
            reporter: Reporter::default(),
        }
    }

    /// Whether [`Worker::stop`] has been called yet.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Shut down cooperatively: close the pipeline input and wait up to
    /// `timeout` for every loop to drain.
    ///
    /// In-flight handler invocations are not interrupted; a handler that
    /// outlives the deadline makes this return false, and its job falls to
    /// the stuck-job recovery path on the next start. Subsequent calls are
    /// no-ops returning true.
    pub async fn stop(&mut self, deadline: Duration) -> bool {
        if !self.running {
            return true;
        }
        self.running = false;

        info!("Stopping worker");
        self.shutdown.cancel();

        match timeout(deadline, join_all(self.handles.drain(..))).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        warn!(%error, "Worker task panicked");
                    }
                }
                info!("Worker stopped");
                true
            }
            Err(_) => {
                warn!("Worker did not drain within {deadline:?}");
                false
            }
        }
    }
}

/// Configuration for a [`Worker`]. All options have working defaults.
#[derive(Debug)]
pub struct WorkerBuilder {
    pool: MySqlPool,
    handlers: HandlerMap,
    buffer_size: usize,
    prefetch: i64,
    num_consumers: usize,
    min_scheduler_sleep: Duration,
    max_scheduler_sleep: Duration,
    min_recovery_sleep: Duration,
    max_recovery_sleep: Duration,
    recovery_threshold_mins: u32,
    reporter: Reporter,
}

impl WorkerBuilder {
    /// Capacity of the pipeline's intermediate stream.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// How many rows each publisher fetches per poll cycle.
    pub fn prefetch(mut self, prefetch: i64) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Number of consumers draining the pipeline concurrently.
    pub fn num_consumers(mut self, num_consumers: usize) -> Self {
        self.num_consumers = num_consumers;
        self
    }

    /// Lower bound on the scheduler publisher's backoff sleep.
    pub fn min_scheduler_sleep(mut self, interval: Duration) -> Self {
        self.min_scheduler_sleep = interval;
        self
    }

    /// Upper bound on the scheduler publisher's backoff sleep.
    pub fn max_scheduler_sleep(mut self, interval: Duration) -> Self {
        self.max_scheduler_sleep = interval;
        self
    }

    /// Lower bound on the recovery publisher's backoff sleep.
    pub fn min_recovery_sleep(mut self, interval: Duration) -> Self {
        self.min_recovery_sleep = interval;
        self
    }

    /// Upper bound on the recovery publisher's backoff sleep.
    pub fn max_recovery_sleep(mut self, interval: Duration) -> Self {
        self.max_recovery_sleep = interval;
        self
    }

    /// How old a non-terminal job row must be before the recovery publisher
    /// considers it stuck.
    pub fn recovery_threshold_mins(mut self, minutes: u32) -> Self {
        self.recovery_threshold_mins = minutes;
        self
    }

    /// Error sink invoked for handler errors, poll failures, and chain
    /// aborts. A panicking sink is swallowed.
    pub fn on_error<F>(mut self, err_fn: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.reporter = Reporter::new(Arc::new(err_fn));
        self
    }

    /// Wire the pipeline and start all loops.
    pub fn start(self) -> Worker {
        let shutdown = CancellationToken::new();
        let sieve = Arc::new(Sieve::default());
        let handlers = Arc::new(self.handlers);
        let names = Arc::new(handlers.names());
        let reporter = self.reporter;
        let executor = Arc::new(Executor::new(
            self.pool.clone(),
            handlers.clone(),
            reporter.clone(),
        ));

        let (input_tx, input_rx) = mpsc::channel(self.buffer_size);
        let (intermediate_tx, intermediate_rx) = mpsc::channel(self.buffer_size);

        let mut handles = Vec::with_capacity(self.num_consumers + 3);

        handles.push(tokio::spawn(
            fanout::forward(input_rx, intermediate_tx, sieve.clone(), shutdown.clone())
                .instrument(info_span!("dedup")),
        ));

        let intermediate_rx = Arc::new(tokio::sync::Mutex::new(intermediate_rx));
        for id in 1..=self.num_consumers {
            let stream = OutputStream::new(intermediate_rx.clone(), sieve.clone());
            let span = info_span!("consumer", consumer.id = id);
            handles.push(tokio::spawn(
                consumer::run(stream, executor.clone(), reporter.clone()).instrument(span),
            ));
        }

        {
            let pool = self.pool.clone();
            let sieve = sieve.clone();
            let input = input_tx.clone();
            let names = names.clone();
            let reporter = reporter.clone();
            let prefetch = self.prefetch;
            let publisher = Publisher {
                locus: "scheduler thread",
                min_sleep: self.min_scheduler_sleep,
                max_sleep: self.max_scheduler_sleep,
                shutdown: shutdown.clone(),
                reporter: reporter.clone(),
            };
            handles.push(tokio::spawn(
                async move {
                    publisher
                        .run(move || {
                            let pool = pool.clone();
                            let sieve = sieve.clone();
                            let input = input.clone();
                            let names = names.clone();
                            let reporter = reporter.clone();
                            async move {
                                poll_scheduled_jobs(&pool, &names, &sieve, &input, prefetch, &reporter)
                                    .await
                            }
                        })
                        .await;
                }
                .instrument(info_span!("scheduler")),
            ));
        }

        {
            let pool = self.pool;
            let sieve = sieve.clone();
            let input = input_tx;
            let names = names.clone();
            let reporter = reporter.clone();
            let prefetch = self.prefetch;
            let threshold = self.recovery_threshold_mins;
            let publisher = Publisher {
                locus: "recovery thread",
                min_sleep: self.min_recovery_sleep,
                max_sleep: self.max_recovery_sleep,
                shutdown: shutdown.clone(),
                reporter: reporter.clone(),
            };
            handles.push(tokio::spawn(
                async move {
                    publisher
                        .run(move || {
                            let pool = pool.clone();
                            let sieve = sieve.clone();
                            let input = input.clone();
                            let names = names.clone();
                            let reporter = reporter.clone();
                            async move {
                                poll_stuck_jobs(
                                    &pool, &names, &sieve, &input, threshold, prefetch, &reporter,
                                )
                                .await
                            }
                        })
                        .await;
                }
                .instrument(info_span!("recovery")),
            ));
        }

        info!(
            consumers = self.num_consumers,
            handlers = names.len(),
            "Worker started"
        );

        Worker {
            shutdown,
            handles,
            running: true,
        }
    }
}
