//! Command implementations for the Ignite CLI.

pub mod check;
pub mod launch;
pub mod options;
pub mod plan;
pub mod types;

pub use types::JobArgs;

use crate::config::LauncherSettings;
use anyhow::Result;
use colored::Colorize;
use ignite_launch::port::DEFAULT_PORT_ATTEMPTS;
use ignite_launch::{DeviceProbe, JobBuilder, JobDraft, NvidiaSmiProbe, TrainingJobConfig};

/// Resolve and validate a job, pick its port and create its output directory.
pub fn build_config(args: &JobArgs, settings: &LauncherSettings) -> Result<TrainingJobConfig> {
    let overrides = args.overrides()?;

    let mut defaults = JobDraft::default();
    if let Some(devices) = &settings.devices {
        defaults.device_list.clone_from(devices);
    }
    let available = if args.no_device_check { None } else { NvidiaSmiProbe.device_count() };

    let builder = JobBuilder::new()
        .with_defaults(defaults)
        .with_available_devices(available)
        .with_port_attempts(settings.port_attempts.unwrap_or(DEFAULT_PORT_ATTEMPTS));
    Ok(builder.build(&overrides)?)
}

/// The few fields people look at before a long run.
pub fn print_summary(config: &TrainingJobConfig) {
    let identity = config.identity();
    let hardware = config.hardware();
    let batching = config.batching();
    let schedule = config.schedule();

    println!("  Mode:        {}", identity.mode.to_string().cyan());
    println!(
        "  Project:     {} {}",
        identity.project_name.cyan(),
        format!("({} {})", identity.model_use, identity.version).dimmed()
    );
    println!("  Model:       {}", config.paths().model_path.display());
    println!("  Entry point: {}", config.paths().entry_point.display());
    println!("  Devices:     {} {}", hardware.visible_devices().cyan(), format!("(port {})", hardware.master_port).dimmed());
    println!(
        "  Batch:       {} per device x {} devices x {} accumulation = {}",
        batching.per_device_train_batch_size,
        hardware.world_size(),
        batching.gradient_accumulation_steps,
        config.global_batch_size().to_string().bold()
    );
    println!(
        "  Schedule:    {} epoch(s), lr {}, {}, ZeRO stage {}",
        schedule.num_train_epochs, schedule.learning_rate, schedule.lr_scheduler_type, schedule.zero_stage
    );
    println!("  Output:      {}", config.paths().output_dir.path().display().to_string().dimmed());
}
