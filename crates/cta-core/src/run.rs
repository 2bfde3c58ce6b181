//! Explicit per-run state handed to every component.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::provenance::Provenance;

/// Cooperative stop request, checked between events.
///
/// Cloning shares the flag, so a signal handler can hold one clone while the
/// run loop polls another.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// New handle with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop after the current event.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State of one run: its id, provenance log, verbosity, and stop flag.
///
/// Created at run start and passed by reference to stages and writers, so
/// independent runs in one process never share state.
#[derive(Debug)]
pub struct RunContext {
    /// Unique run id.
    pub run_id: Uuid,
    /// Activity log.
    pub provenance: Provenance,
    /// Report every per-event failure at `warn` instead of `debug`.
    pub verbose: bool,
    /// Stop flag.
    pub stop: StopHandle,
}

impl RunContext {
    /// New context with a fresh run id.
    pub fn new(verbose: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            provenance: Provenance::new(),
            verbose,
            stop: StopHandle::new(),
        }
    }

    /// Use an existing stop handle (for example one wired to Ctrl-C).
    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_is_shared() {
        let ctx = RunContext::new(false);
        let handle = ctx.stop.clone();
        assert!(!ctx.stop.is_stop_requested());
        handle.request_stop();
        assert!(ctx.stop.is_stop_requested());
    }

    #[test]
    fn test_runs_are_independent() {
        let a = RunContext::new(false);
        let b = RunContext::new(true);
        assert_ne!(a.run_id, b.run_id);
        a.stop.request_stop();
        assert!(!b.stop.is_stop_requested());
    }
}
