use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

/// What a handler wants to happen to its job chain next.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Persist a continuation with the given status and parameters and keep
    /// the chain going. Yielding the current status again counts as a retry
    /// and increments the attempt counter; yielding a new status resets it.
    To {
        /// Status of the next continuation.
        status: String,
        /// Parameter payload handed to the next handler invocation.
        parameters: Value,
    },
    /// The chain is complete. Equivalent to `To { status: "done",
    /// parameters: Value::Null }`.
    Done,
}

impl Transition {
    /// Shorthand for [`Transition::To`].
    pub fn to(status: impl Into<String>, parameters: Value) -> Self {
        Self::To {
            status: status.into(),
            parameters,
        }
    }
}

type HandlerFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, anyhow::Result<Transition>> + Send + Sync>;

/// Registry of named job handlers.
///
/// A handler is invoked with the job's current status and parameters and
/// returns the [`Transition`] to persist. Handlers must be re-entrant across
/// retries and idempotent at the granularity of `(status, parameters)`:
/// delivery is at-least-once.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerMap {
    /// Create an empty handler map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// Only jobs whose `name` column matches a registered handler are polled
    /// by the worker; rows with unknown names are left for other workers.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Transition>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |status, parameters| handler(status, parameters).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<&HandlerFn> {
        self.handlers.get(name)
    }

    /// The registered handler names, used to scope database polls.
    pub(crate) fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
