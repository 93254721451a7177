//! Plan command implementation.

use crate::commands::{build_config, print_summary, JobArgs};
use crate::config::LauncherSettings;
use anyhow::Result;
use colored::Colorize;
use ignite_launch::launcher::DEFAULT_RUNTIME;
use ignite_launch::{deepspeed, RuntimeInvocation};
use serde_json::json;

/// Print the resolved job, the runtime command line and the DeepSpeed config.
pub async fn execute(args: JobArgs, json_output: bool, settings: &LauncherSettings) -> Result<()> {
    let config = build_config(&args, settings)?;
    let invocation = RuntimeInvocation::from_config(&config);
    let runtime = settings.runtime.as_deref().unwrap_or(DEFAULT_RUNTIME);
    let ds_config = deepspeed::train_config(&config);

    if json_output {
        let plan = json!({
            "config": config,
            "invocation": invocation,
            "command": invocation.command_line(runtime),
            "deepspeed": ds_config,
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training Job".bold().cyan());
    println!();
    print_summary(&config);
    println!();
    println!("{}", "Command".bold());
    println!("  {}", invocation.command_line(runtime));
    println!();
    println!("{}", "DeepSpeed Config".bold());
    for line in serde_json::to_string_pretty(&ds_config)?.lines() {
        println!("  {}", line.dimmed());
    }
    println!();
    Ok(())
}
