//! `process`: read a file, run the configured stages, write a dataset.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cta_core::config::{
    resolve, Component, ComponentConfig, ComponentSchema, ConfigSources, ParamSpec, ParamType,
};
use cta_core::provenance::ActivityStatus;
use cta_core::{ConfigurationError, CtaError, RunContext};
use cta_io::{DataWriter, DataWriterConfig, SourceConfig, SourceRegistry};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::orchestrator::{FailurePolicy, Pipeline, RunSummary};
use crate::stage::StageRegistry;

#[derive(Debug, Clone, Deserialize)]
struct ProcessParams {
    input: PathBuf,
    output: Option<PathBuf>,
    stages: Vec<String>,
    max_failures: Option<u64>,
    max_failure_fraction: Option<f64>,
    min_events_for_fraction: u64,
    progress_interval_s: f64,
}

/// Result of a `process` run that reached the end of its event loop.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Event counts and status.
    pub summary: RunSummary,
    /// Written dataset, if an output was configured.
    pub output: Option<PathBuf>,
}

/// The processing tool.
#[derive(Debug, Clone)]
pub struct ProcessTool {
    config: ComponentConfig,
    params: ProcessParams,
    source: SourceConfig,
    writer: DataWriterConfig,
}

impl Component for ProcessTool {
    const NAME: &'static str = "process";

    fn schema() -> ComponentSchema {
        let registry = StageRegistry::builtin();
        let default_stages: Vec<&str> = registry.names();
        let about = "Process events through the configured stages";
        let mut schema = ComponentSchema::new(Self::NAME, about)
            .param(
                ParamSpec::new("input", ParamType::Path)
                    .help("Input file (block stream or dataset)"),
            )
            .param(
                ParamSpec::new("output", ParamType::Path)
                    .optional()
                    .help("Output dataset; unset runs without writing"),
            )
            .param(
                ParamSpec::new("stages", ParamType::StrList)
                    .default(json!(default_stages))
                    .help("Stages to run, in order"),
            )
            .param(
                ParamSpec::new("max_failures", ParamType::Int)
                    .optional()
                    .range(Some(0.0), None)
                    .help("Abort once more events than this have failed"),
            )
            .param(
                ParamSpec::new("max_failure_fraction", ParamType::Float)
                    .optional()
                    .range(Some(0.0), Some(1.0))
                    .help("Abort once the failed fraction exceeds this"),
            )
            .param(
                ParamSpec::new("min_events_for_fraction", ParamType::Int)
                    .default(100)
                    .range(Some(1.0), None)
                    .help("Events processed before max_failure_fraction applies"),
            )
            .param(
                ParamSpec::new("progress_interval_s", ParamType::Float)
                    .default(10.0)
                    .range(Some(0.0), Some(86400.0))
                    .help("Seconds between progress log lines"),
            )
            .child(SourceConfig::schema())
            .child(DataWriterConfig::schema());
        for stage in registry.schemas() {
            schema = schema.child(stage);
        }
        schema
    }

    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            params: config.extract()?,
            source: SourceConfig::from_config(config.child(SourceConfig::NAME)?)?,
            writer: DataWriterConfig::from_config(config.child(DataWriterConfig::NAME)?)?,
            config: config.clone(),
        })
    }
}

impl ProcessTool {
    /// Resolve the tool schema from `sources` and build the tool.
    pub fn from_sources(sources: &ConfigSources) -> Result<Self, ConfigurationError> {
        Self::from_config(&resolve(&Self::schema(), sources)?)
    }

    /// Resolved configuration.
    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy {
            max_failures: self.params.max_failures,
            max_failure_fraction: self.params.max_failure_fraction,
            min_events_for_fraction: self.params.min_events_for_fraction,
        }
    }

    /// Run the tool inside a `process` provenance activity.
    ///
    /// Configuration and source errors surface before any event is read.
    /// The output is only finalised when the event loop ends normally or is
    /// interrupted; on a fatal error the partial dataset stays behind.
    pub fn run(&self, ctx: &mut RunContext) -> Result<ProcessOutcome, CtaError> {
        let id = ctx.provenance.start_activity(Self::NAME);
        let result = self.run_inner(ctx);
        let still_running = ctx
            .provenance
            .current()
            .is_some_and(|a| a.activity_uuid == id);
        if still_running {
            ctx.provenance.finish_activity(ActivityStatus::Failed);
        }
        result
    }

    fn run_inner(&self, ctx: &mut RunContext) -> Result<ProcessOutcome, CtaError> {
        let params = &self.params;
        ctx.provenance.add_config(self.config.to_json());
        ctx.provenance.add_input_file(&params.input);

        let mut source = SourceRegistry::builtin().open(&params.input, &self.source)?;
        let subarray = Arc::clone(source.subarray());
        let stages = StageRegistry::builtin().build(
            &params.stages,
            &self.config,
            &self.config.key("stages"),
            &subarray,
        )?;
        let interval = Duration::try_from_secs_f64(params.progress_interval_s).map_err(|_| {
            ConfigurationError::invalid(
                self.config.key("progress_interval_s"),
                params.progress_interval_s,
                "a duration in seconds",
            )
        })?;
        let mut pipeline = Pipeline::new(stages, self.policy()).with_progress_interval(interval);
        let available = pipeline.available_after(source.datalevels())?;

        let mut writer = match &params.output {
            Some(output) => {
                ctx.provenance.add_output_file(output);
                Some(DataWriter::create(
                    output,
                    &self.writer,
                    Arc::clone(&subarray),
                    source.is_simulation(),
                    &available,
                )?)
            }
            None => None,
        };
        info!(
            input = %params.input.display(),
            output = ?params.output,
            stages = ?pipeline.stage_names(),
            telescopes = subarray.tels.len(),
            "Process tool set up"
        );

        let summary = pipeline.run(source.as_mut(), writer.as_mut(), ctx)?;
        summary.record(ctx);

        let activity = ctx
            .provenance
            .finish_activity(summary.status.activity_status())
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null));
        let mut chain: Vec<Value> = activity.into_iter().collect();
        chain.extend(source.provenance_chain());

        let output = writer
            .map(|w| w.finish(Some(self.config.to_json()), chain))
            .transpose()?;
        if let Some(path) = &output {
            info!(output = %path.display(), events = summary.processed, "Output written");
        }
        Ok(ProcessOutcome { summary, output })
    }
}
