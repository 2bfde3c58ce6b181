//! Per-event pipeline driver.
//!
//! ```text
//!   source ──▶ event ──▶ stage 1 ──▶ stage 2 ──▶ ... ──▶ writer
//!                │           │ error                       ▲
//!                │           └─▶ clear writes of failed ───┤
//!                │               and later stages          │
//!                └─ decode error: stages skipped ──────────┘
//! ```
//!
//! One event is fully processed and written before the next one is read.
//! Per-event failures (decode errors from the source, stage computation
//! errors) are counted per `(stage, kind)` and never stop the run on their
//! own; the [`FailurePolicy`] decides when they become fatal. Source and
//! write errors are fatal immediately.
//!
//! The stop flag of the [`RunContext`] is checked between events, so an
//! interrupted run still hands every event it read to the writer.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use cta_core::provenance::ActivityStatus;
use cta_core::{
    ArrayEvent, ConfigurationError, CtaError, DataField, EventIndex, FailureKind, RunContext,
    StageComputationError,
};
use cta_io::{DataWriter, EventSource};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::progress::ProgressReporter;
use crate::stage::{check_chain, Stage};

/// Stage name under which source decode failures are counted.
pub const SOURCE_STAGE: &str = "source";

/// When per-event failures make the run fatal.
///
/// Both limits are optional; without either the run never aborts because
/// of per-event failures.
#[derive(Debug, Clone, PartialEq)]
pub struct FailurePolicy {
    /// Abort once more events than this have failed.
    pub max_failures: Option<u64>,
    /// Abort once the failed fraction exceeds this.
    pub max_failure_fraction: Option<f64>,
    /// Events to process before the fraction is checked.
    pub min_events_for_fraction: u64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failures: None,
            max_failure_fraction: None,
            min_events_for_fraction: 100,
        }
    }
}

impl FailurePolicy {
    /// Check the counts after an event.
    pub fn check(&self, failures: u64, processed: u64) -> Result<(), CtaError> {
        if let Some(max) = self.max_failures {
            if failures > max {
                return Err(CtaError::TooManyFailures {
                    failures,
                    processed,
                    limit: format!("max_failures = {max}"),
                });
            }
        }
        if let Some(fraction) = self.max_failure_fraction {
            if processed > 0
                && processed >= self.min_events_for_fraction
                && failures as f64 / processed as f64 > fraction
            {
                return Err(CtaError::TooManyFailures {
                    failures,
                    processed,
                    limit: format!("max_failure_fraction = {fraction}"),
                });
            }
        }
        Ok(())
    }
}

/// How a run that did not hit a fatal error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    /// Every event went through every stage.
    #[default]
    Success,
    /// All events were processed, some of them failed.
    CompletedWithWarnings,
    /// A stop was requested; the output holds the events read so far.
    Interrupted,
}

impl RunStatus {
    /// Provenance status of the run's activity.
    pub fn activity_status(self) -> ActivityStatus {
        match self {
            RunStatus::Success => ActivityStatus::Completed,
            RunStatus::CompletedWithWarnings => ActivityStatus::CompletedWithWarnings,
            RunStatus::Interrupted => ActivityStatus::Interrupted,
        }
    }
}

/// End-of-run accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Events read from the source.
    pub processed: u64,
    /// Events that went through every stage.
    pub succeeded: u64,
    /// Events with a decode or stage failure.
    pub failed: u64,
    /// Failed events per stage and kind.
    pub failures: BTreeMap<(String, FailureKind), u64>,
    /// Outcome.
    pub status: RunStatus,
    /// Wall time of the event loop.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Failures keyed `"<stage>/<kind>"`.
    pub fn failures_json(&self) -> Value {
        self.failures
            .iter()
            .map(|((stage, kind), n)| (format!("{stage}/{kind}"), json!(n)))
            .collect::<serde_json::Map<_, _>>()
            .into()
    }

    /// Record the run counters in the current provenance activity.
    pub fn record(&self, ctx: &mut RunContext) {
        ctx.provenance.set_counter("n_events", self.processed);
        ctx.provenance.set_counter("n_succeeded", self.succeeded);
        ctx.provenance.set_counter("n_failed", self.failed);
        ctx.provenance.set_counter("failures", self.failures_json());
        ctx.provenance
            .set_counter("elapsed_s", self.elapsed.as_secs_f64());
    }

    fn log(&self) {
        let rate = if self.elapsed.as_secs_f64() > 0.0 {
            self.processed as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        };
        if self.failed == 0 {
            info!(
                processed = self.processed,
                status = ?self.status,
                rate = %format!("{rate:.1}/s"),
                "Run finished"
            );
        } else {
            warn!(
                processed = self.processed,
                failed = self.failed,
                failures = %self.failures_json(),
                status = ?self.status,
                "Run finished with failed events"
            );
        }
    }
}

fn report_failure(
    verbose: bool,
    index: EventIndex,
    stage: &str,
    kind: FailureKind,
    message: &str,
) {
    if verbose {
        warn!(
            obs_id = index.obs_id,
            event_id = index.event_id,
            stage,
            kind = %kind,
            "Event failed: {message}"
        );
    } else {
        debug!(
            obs_id = index.obs_id,
            event_id = index.event_id,
            stage,
            kind = %kind,
            "Event failed: {message}"
        );
    }
}

/// Ordered stages plus the failure policy of one run.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    policy: FailurePolicy,
    progress_interval: Duration,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("policy", &self.policy)
            .field("progress_interval", &self.progress_interval)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline running `stages` in order.
    pub fn new(stages: Vec<Box<dyn Stage>>, policy: FailurePolicy) -> Self {
        Self {
            stages,
            policy,
            progress_interval: Duration::from_secs(10),
        }
    }

    /// Log progress at most once per `interval`.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Stage names in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Field groups present after the last stage, given what the source
    /// provides. Fails if a stage's inputs are never produced.
    pub fn available_after(
        &self,
        datalevels: &[DataField],
    ) -> Result<BTreeSet<DataField>, ConfigurationError> {
        check_chain(&self.stages, datalevels)
    }

    /// Run every stage on one event. On failure the fields written by the
    /// failed stage and all later stages are cleared and the error returned.
    pub fn process_event(
        &mut self,
        event: &mut ArrayEvent,
        ctx: &RunContext,
    ) -> Result<(), StageComputationError> {
        for i in 0..self.stages.len() {
            if let Err(err) = self.stages[i].process(event, ctx) {
                for stage in &self.stages[i..] {
                    for &field in stage.writes() {
                        event.clear(field);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drive `source` through the stages into `writer` until the source is
    /// exhausted or a stop is requested.
    ///
    /// Each stage's `finish` runs once the loop ends, inside the caller's
    /// provenance activity.
    pub fn run(
        &mut self,
        source: &mut dyn EventSource,
        mut writer: Option<&mut DataWriter>,
        ctx: &mut RunContext,
    ) -> Result<RunSummary, CtaError> {
        let start = Instant::now();
        let mut progress = ProgressReporter::new(source.n_events_hint(), self.progress_interval);
        let mut summary = RunSummary::default();
        let mut interrupted = false;

        info!(
            source = source.name(),
            input = %source.input_path().display(),
            stages = ?self.stage_names(),
            "Starting event loop"
        );
        loop {
            if ctx.stop.is_stop_requested() {
                warn!(processed = summary.processed, "Stop requested, closing the run");
                interrupted = true;
                break;
            }
            let Some(mut event) = source.next_event()? else {
                break;
            };
            summary.processed += 1;

            let failure = if let Some(err) = &event.decode_error {
                let message = err.to_string();
                report_failure(
                    ctx.verbose,
                    event.index,
                    SOURCE_STAGE,
                    FailureKind::Decode,
                    &message,
                );
                Some((SOURCE_STAGE.to_string(), FailureKind::Decode))
            } else {
                match self.process_event(&mut event, ctx) {
                    Ok(()) => None,
                    Err(err) => {
                        report_failure(
                            ctx.verbose,
                            event.index,
                            &err.stage,
                            FailureKind::Computation,
                            &err.message,
                        );
                        Some((err.stage, FailureKind::Computation))
                    }
                }
            };
            match failure {
                Some(key) => {
                    summary.failed += 1;
                    *summary.failures.entry(key).or_default() += 1;
                }
                None => summary.succeeded += 1,
            }

            if let Some(writer) = writer.as_deref_mut() {
                writer.write_event(&event)?;
            }
            progress.update(summary.processed);
            self.policy.check(summary.failed, summary.processed)?;
        }

        for stage in &mut self.stages {
            stage.finish(ctx);
        }
        summary.elapsed = start.elapsed();
        summary.status = if interrupted {
            RunStatus::Interrupted
        } else if summary.failed > 0 {
            RunStatus::CompletedWithWarnings
        } else {
            RunStatus::Success
        };
        summary.log();
        Ok(summary)
    }
}
