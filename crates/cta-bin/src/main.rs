//! `cta`: command-line interface of cta-pipe.
//!
//! ```bash
//! cta simulate -o run1.simtel --events 100
//! cta process -i run1.simtel -o run1.dl2 --max-events 50 image_processor.tailcuts.picture_threshold_pe=8
//! cta merge -i run1.dl2 -i run2.dl2 -o all.dl2
//! cta config process -i run1.simtel --format toml > process.toml
//! cta process -c process.toml
//! ```
//!
//! Exit codes: `0` success, `1` fatal error, `2` configuration error,
//! `3` completed with failed events, `130` interrupted.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cta_core::config::{render_toml, resolve, Component, ConfigSources};
use cta_core::{ConfigurationError, CtaError, RunContext, StopHandle};
use cta_io::{SourceRegistry, ToySimulation, ToySimulationConfig};
use cta_pipeline::{MergeTool, ProcessTool, RunStatus, StageRegistry};
use tracing::{info, warn};

use crate::logging::{LogConfig, LogFormat};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CONFIGURATION: u8 = 2;
const EXIT_WARNINGS: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "cta", version)]
#[command(
    about = "Event processing pipeline for Cherenkov telescope array data",
    long_about = None
)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info", value_parser = logging::parse_level)]
    log_level: tracing::Level,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

/// Configuration file plus `KEY=VALUE` overrides, shared by the tools.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// Configuration file (.toml, .json, .yaml)
    #[arg(short = 'c', long = "config")]
    file: Option<PathBuf>,

    /// Parameter overrides, dotted keys relative to the tool section
    #[arg(value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Args, Debug, Default)]
struct ProcessArgs {
    /// Input file (alias of input=...)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output dataset (alias of output=...)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum events to read (alias of source.max_events=...)
    #[arg(long)]
    max_events: Option<u64>,

    /// Replace an existing output (alias of writer.overwrite=true)
    #[arg(long)]
    overwrite: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args, Debug, Default)]
struct MergeArgs {
    /// Input dataset, repeat for each input (alias of inputs=[...])
    #[arg(short = 'i', long = "input")]
    inputs: Vec<PathBuf>,

    /// Merged dataset (alias of output=...)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Replace an existing output (alias of options.overwrite=true)
    #[arg(long)]
    overwrite: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the processing stages on an input file
    Process {
        #[command(flatten)]
        args: ProcessArgs,

        /// Report every failed event at warn level
        #[arg(short, long)]
        verbose: bool,
    },

    /// Merge datasets of independent runs
    Merge(MergeArgs),

    /// List event source backends and processing stages
    Sources,

    /// Print the resolved configuration of a tool
    Config {
        #[command(subcommand)]
        tool: ConfigTool,
    },

    /// Write a toy simulation run
    Simulate {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Observation id
        #[arg(long, default_value_t = 1)]
        obs_id: u32,

        /// Number of events
        #[arg(long, default_value_t = 10)]
        events: u32,

        /// Number of telescopes
        #[arg(long, default_value_t = 4)]
        tels: u16,

        /// Pixels per camera side
        #[arg(long, default_value_t = 15)]
        camera_side: usize,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Event positions (0-based) to corrupt, comma separated
        #[arg(long, value_delimiter = ',')]
        corrupt: Vec<u32>,
    },
}

#[derive(Subcommand)]
enum ConfigTool {
    /// Configuration of `process`
    Process {
        #[command(flatten)]
        args: ProcessArgs,

        /// Output format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
    /// Configuration of `merge`
    Merge {
        #[command(flatten)]
        args: MergeArgs,

        /// Output format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfigFormat {
    Toml,
    Json,
}

fn base_sources(config: &ConfigArgs) -> ConfigSources {
    ConfigSources {
        file: config.file.clone(),
        overrides: Vec::new(),
    }
}

/// Aliases first so explicit `KEY=VALUE` overrides win.
impl ProcessArgs {
    fn sources(&self) -> ConfigSources {
        let mut sources = base_sources(&self.config);
        if let Some(input) = &self.input {
            sources = sources.set("input", input.display());
        }
        if let Some(output) = &self.output {
            sources = sources.set("output", output.display());
        }
        if let Some(max_events) = self.max_events {
            sources = sources.set("source.max_events", max_events);
        }
        if self.overwrite {
            sources = sources.set("writer.overwrite", true);
        }
        sources.overrides.extend(self.config.overrides.iter().cloned());
        sources
    }
}

impl MergeArgs {
    fn sources(&self) -> ConfigSources {
        let mut sources = base_sources(&self.config);
        if !self.inputs.is_empty() {
            let inputs: Vec<String> = self.inputs.iter().map(|p| p.display().to_string()).collect();
            sources = sources.set("inputs", serde_json::Value::from(inputs));
        }
        if let Some(output) = &self.output {
            sources = sources.set("output", output.display());
        }
        if self.overwrite {
            sources = sources.set("options.overwrite", true);
        }
        sources.overrides.extend(self.config.overrides.iter().cloned());
        sources
    }
}

/// Stop handle wired to Ctrl-C. A second Ctrl-C exits immediately.
fn install_stop_handler() -> StopHandle {
    let stop = StopHandle::new();
    let handle = stop.clone();
    let installed = ctrlc::set_handler(move || {
        if handle.is_stop_requested() {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
        warn!("Interrupt received, stopping after the current event (Ctrl-C again to abort)");
        handle.request_stop();
    });
    if let Err(e) = installed {
        warn!(error = %e, "Cannot install the Ctrl-C handler");
    }
    stop
}

fn status_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Success => EXIT_SUCCESS,
        RunStatus::CompletedWithWarnings => EXIT_WARNINGS,
        RunStatus::Interrupted => EXIT_INTERRUPTED,
    }
}

fn error_code(err: &anyhow::Error) -> u8 {
    let configuration = err.chain().any(|cause| {
        cause.is::<ConfigurationError>()
            || cause
                .downcast_ref::<CtaError>()
                .is_some_and(|e| matches!(e, CtaError::Configuration(_)))
    });
    if configuration {
        EXIT_CONFIGURATION
    } else {
        EXIT_FATAL
    }
}

fn process(args: &ProcessArgs, verbose: bool) -> Result<u8> {
    let tool = ProcessTool::from_sources(&args.sources())?;
    let mut ctx = RunContext::new(verbose).with_stop(install_stop_handler());
    info!(run_id = %ctx.run_id, "Starting process");
    let outcome = tool.run(&mut ctx)?;
    Ok(status_code(outcome.summary.status))
}

fn merge(args: &MergeArgs) -> Result<u8> {
    let tool = MergeTool::from_sources(&args.sources())?;
    let mut ctx = RunContext::new(false);
    let summary = tool.run(&mut ctx)?;
    info!(
        output = %summary.output.display(),
        inputs = summary.n_inputs,
        events = summary.n_events,
        "Merge finished"
    );
    Ok(EXIT_SUCCESS)
}

fn sources() {
    println!("Event sources:");
    for (name, description) in SourceRegistry::builtin().describe() {
        println!("  {name:<18} {description}");
    }
    println!("Stages:");
    for (name, description) in StageRegistry::builtin().describe() {
        println!("  {name:<18} {description}");
    }
}

fn print_config<T: Component>(sources: &ConfigSources, format: ConfigFormat) -> Result<()> {
    let schema = T::schema();
    let config = resolve(&schema, sources)?;
    // building the tool checks what resolution alone does not
    T::from_config(&config)?;
    match format {
        ConfigFormat::Toml => print!("{}", render_toml(&schema, &config)),
        ConfigFormat::Json => {
            let mut document = serde_json::Map::new();
            document.insert(T::NAME.to_string(), config.to_json());
            println!(
                "{}",
                serde_json::to_string_pretty(&document).context("cannot render configuration")?
            );
        }
    }
    Ok(())
}

fn simulate(output: &Path, config: ToySimulationConfig) -> Result<()> {
    let n = ToySimulation::new(config)
        .write_file(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    info!(output = %output.display(), events = n, "Simulation written");
    Ok(())
}

fn run(command: Command) -> Result<u8> {
    match command {
        Command::Process { args, verbose } => process(&args, verbose),
        Command::Merge(args) => merge(&args),
        Command::Sources => {
            sources();
            Ok(EXIT_SUCCESS)
        }
        Command::Config { tool } => {
            match tool {
                ConfigTool::Process { args, format } => {
                    print_config::<ProcessTool>(&args.sources(), format)?
                }
                ConfigTool::Merge { args, format } => {
                    print_config::<MergeTool>(&args.sources(), format)?
                }
            }
            Ok(EXIT_SUCCESS)
        }
        Command::Simulate {
            output,
            obs_id,
            events,
            tels,
            camera_side,
            seed,
            corrupt,
        } => {
            simulate(
                &output,
                ToySimulationConfig {
                    obs_id,
                    n_events: events,
                    n_tels: tels,
                    seed,
                    camera_side,
                    corrupt_events: corrupt,
                    ..Default::default()
                },
            )?;
            Ok(EXIT_SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(LogConfig {
        level: cli.log_level,
        format: cli.log_format,
    }) {
        eprintln!("{e}");
    }

    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("Error: {err:#}");
            error_code(&err)
        }
    };
    ExitCode::from(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_aliases_expand_before_overrides() {
        let args = ProcessArgs {
            input: Some(PathBuf::from("run.simtel")),
            max_events: Some(5),
            overwrite: true,
            config: ConfigArgs {
                file: None,
                overrides: vec!["source.max_events=7".into()],
            },
            ..Default::default()
        };
        let sources = args.sources();
        assert_eq!(
            sources.overrides,
            vec![
                "input=run.simtel",
                "source.max_events=5",
                "writer.overwrite=true",
                "source.max_events=7",
            ]
        );
    }

    #[test]
    fn test_merge_inputs_as_json_list() {
        let args = MergeArgs {
            inputs: vec![PathBuf::from("a.dl2"), PathBuf::from("b,c.dl2")],
            ..Default::default()
        };
        assert_eq!(args.sources().overrides, vec![r#"inputs=["a.dl2","b,c.dl2"]"#]);
    }

    #[test]
    fn test_configuration_errors_map_to_exit_code() {
        let err = anyhow::Error::from(CtaError::from(ConfigurationError::Setup("x".into())));
        assert_eq!(error_code(&err), EXIT_CONFIGURATION);
        let err = anyhow::Error::from(ConfigurationError::MalformedOverride("x".into()));
        assert_eq!(error_code(&err), EXIT_CONFIGURATION);
        let err = anyhow::anyhow!("disk full");
        assert_eq!(error_code(&err), EXIT_FATAL);
    }
}
