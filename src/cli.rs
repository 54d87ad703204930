use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mlprep::error::PrepError;
use mlprep::logging::{self, LogOptions};
use mlprep::pipeline::{self, RunOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mlprep",
    version,
    about = "Config-driven data preparation for machine learning"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level or filter directive, used unless the environment sets one
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write rotated log files to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline and write its outputs
    Run {
        /// Path to the pipeline YAML file
        pipeline: PathBuf,

        /// Stream the input in bounded chunks instead of loading it whole
        #[arg(long)]
        streaming: bool,

        /// Memory budget for streaming chunks, e.g. 512MB or 4GB
        #[arg(long, value_name = "SIZE")]
        memory_limit: Option<String>,
    },
    /// Check a pipeline and print its plan without reading any rows
    Check {
        /// Path to the pipeline YAML file
        pipeline: PathBuf,
    },
}

/// Set up logging, then run `cli.command`, returning the text to print.
///
/// # Errors
///
/// Fails if logging cannot be set up or the command fails. Engine failures
/// keep their [`PrepError`] so [`exit_code`] can classify them.
pub fn run_command(cli: Cli) -> Result<String> {
    logging::init(&LogOptions {
        level: cli.log_level,
        log_dir: cli.log_dir,
    })
    .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Run {
            pipeline,
            streaming,
            memory_limit,
        } => {
            let options = RunOptions {
                streaming,
                memory_limit,
            };
            let report = pipeline::run(&pipeline, &options)?;
            Ok(report.summary())
        }
        Commands::Check { pipeline } => {
            let plan = pipeline::check(&pipeline)?;
            Ok(describe_plan(&plan))
        }
    }
}

fn describe_plan(plan: &pipeline::ExecutionPlan) -> String {
    let mut lines = vec![format!(
        "Pipeline '{}' ({}): valid",
        plan.name, plan.runtime.strategy
    )];
    for input in &plan.inputs {
        lines.push(format!("  input   {input}"));
    }
    lines.push(format!("  schema  {}", plan.input_schema));
    for step in &plan.steps {
        lines.push(format!("  {}", step.label()));
    }
    for output in &plan.outputs {
        lines.push(format!("  output  {output}"));
    }
    for (position, target) in plan.quarantine_targets() {
        lines.push(format!("  quarantine (step {position})  {target}"));
    }
    lines.push(format!("  result  {}", plan.output_schema));
    lines.join("\n")
}

/// Process exit code for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PrepError>()
        .map_or(1, |e| e.kind().exit_code())
}
