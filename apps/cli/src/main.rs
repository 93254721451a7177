//! Ignite CLI - launcher for distributed fine-tuning jobs
//!
//! This CLI provides an `ignite` command that validates a training job,
//! prepares its master port and output directory, and runs it under the
//! DeepSpeed launcher.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use ignite_launch::JobError;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{check, launch, options, plan, JobArgs};
use config::LauncherSettings;

/// Ignite - distributed fine-tuning launcher
///
/// Options are resolved from documented defaults, the settings files, an
/// optional TOML job file and runtime flags, in that order.
#[derive(Parser, Debug)]
#[command(
    name = "ignite",
    author,
    version,
    about = "Ignite - distributed fine-tuning launcher",
    long_about = "Ignite validates a DeepSpeed fine-tuning job, picks a free master port, creates the output directory and starts the runtime.\nRuntime flags are accepted in the training scripts' own spelling (--train_data, --earystop, ...)."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a job and start the training runtime
    ///
    /// Supervises the runtime until it exits and returns its exit code.
    /// Ctrl-C terminates the runtime and exits with 130.
    Launch {
        #[command(flatten)]
        job: JobArgs,

        /// Runtime program to start (defaults to `deepspeed`)
        #[arg(long)]
        runtime: Option<String>,

        /// Print the command line instead of starting it
        #[arg(long)]
        dry_run: bool,

        /// Emit launch events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved job, command line and DeepSpeed config
    Plan {
        #[command(flatten)]
        job: JobArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a job without starting it
    Check {
        #[command(flatten)]
        job: JobArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recognized job options with defaults and aliases
    Options {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Process exit codes for failures before or while starting the runtime.
mod exit_codes {
    pub const FAILURE: u8 = 1;
    pub const VALIDATION: u8 = 2;
    pub const RESOURCE: u8 = 3;
    pub const IO: u8 = 4;
    pub const LAUNCH: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let settings = LauncherSettings::discover_and_load()?;

    // Initialize tracing
    let log_level = args.log_level.as_deref().or(settings.log_level.as_deref()).unwrap_or("info");
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Launch { job, runtime, dry_run, json } => {
            return launch::execute(job, runtime, dry_run, json, &settings).await;
        }
        Command::Plan { job, json } => {
            plan::execute(job, json, &settings).await?;
        }
        Command::Check { job, json } => {
            check::execute(job, json, &settings).await?;
        }
        Command::Options { json } => {
            options::execute(json).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn job_error(err: &anyhow::Error) -> Option<&JobError> {
    err.chain().find_map(|cause| cause.downcast_ref::<JobError>())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match job_error(err) {
        Some(JobError::Validation(_)) => exit_codes::VALIDATION,
        Some(JobError::Resource(_)) => exit_codes::RESOURCE,
        Some(JobError::Io { .. }) => exit_codes::IO,
        Some(JobError::Launch(_)) => exit_codes::LAUNCH,
        None => exit_codes::FAILURE,
    }
}

fn report_error(err: &anyhow::Error) {
    let Some(job_err) = job_error(err) else {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        return;
    };
    eprintln!("{} {}", "Error:".red().bold(), job_err);
    if let JobError::Validation(validation) = job_err {
        let fields = validation.fields();
        if !fields.is_empty() {
            eprintln!("  {} {}", "Check:".yellow(), fields.join(", "));
        }
        eprintln!("  {}", "Run `ignite options` to list recognized options.".dimmed());
    }
}
