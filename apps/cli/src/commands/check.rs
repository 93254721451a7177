//! Check command implementation.
//!
//! Builds the job exactly as `launch` would and stops before spawning.

use crate::commands::{build_config, JobArgs};
use crate::config::LauncherSettings;
use anyhow::Result;
use colored::Colorize;
use serde_json::json;

pub async fn execute(args: JobArgs, json_output: bool, settings: &LauncherSettings) -> Result<()> {
    let config = build_config(&args, settings)?;

    if json_output {
        let report = json!({
            "valid": true,
            "mode": config.mode(),
            "master_port": config.hardware().master_port,
            "world_size": config.hardware().world_size(),
            "output_dir": config.paths().output_dir,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} {}", "✓".green(), "Job configuration is valid".bold());
    println!(
        "  {}",
        format!(
            "{} mode on {} device(s), master port {}",
            config.mode(),
            config.hardware().world_size(),
            config.hardware().master_port
        )
        .dimmed()
    );
    Ok(())
}
