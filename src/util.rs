use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;

/// Tries to get a meaningful error message from a panic payload.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("handler panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("handler panicked: {message}")
    } else {
        anyhow!("handler panicked")
    }
}

pub(crate) type ErrFn = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// User-supplied error sink. A panicking callback is swallowed; the error it
/// was handed is printed to stderr as a last resort.
#[derive(Clone, Default)]
pub(crate) struct Reporter {
    err_fn: Option<ErrFn>,
}

impl Reporter {
    pub(crate) fn new(err_fn: ErrFn) -> Self {
        Self {
            err_fn: Some(err_fn),
        }
    }

    pub(crate) fn report(&self, error: &anyhow::Error) {
        let Some(err_fn) = &self.err_fn else { return };
        if std::panic::catch_unwind(AssertUnwindSafe(|| err_fn(error))).is_err() {
            eprintln!("error callback panicked while reporting: {error:#}");
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("err_fn", &self.err_fn.as_ref().map(|_| "<function>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn panicking_callback_is_swallowed() {
        let reporter = Reporter::new(Arc::new(|_| panic!("sink blew up")));
        reporter.report(&anyhow!("original error"));
    }

    #[test]
    fn callback_receives_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let reporter = Reporter::new(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        reporter.report(&anyhow!("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
