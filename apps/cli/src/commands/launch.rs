//! Launch command implementation.
//!
//! Builds the job, starts the runtime and supervises it until it exits or
//! the user presses Ctrl-C.

use crate::commands::{build_config, print_summary, JobArgs};
use crate::config::LauncherSettings;
use anyhow::{Context, Result};
use colored::Colorize;
use ignite_launch::launcher::DEFAULT_RUNTIME;
use ignite_launch::{
    launch, DeepSpeedLauncher, EventSink, JobEvent, JobExit, JobHandle, JsonEventSink, RuntimeInvocation,
    StdoutEventSink,
};
use std::process::ExitCode;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exit code reported when the job was stopped with Ctrl-C.
pub const INTERRUPTED: u8 = 130;

pub async fn execute(
    args: JobArgs,
    runtime: Option<String>,
    dry_run: bool,
    json_output: bool,
    settings: &LauncherSettings,
) -> Result<ExitCode> {
    let runtime = runtime.or_else(|| settings.runtime.clone()).unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
    let config = build_config(&args, settings)?;

    if dry_run {
        let command = RuntimeInvocation::from_config(&config).command_line(&runtime);
        if json_output {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "command": command }))?);
        } else {
            println!();
            println!("{}", "Dry run (nothing started)".bold().yellow());
            print_summary(&config);
            println!();
            println!("  {}", command);
            println!();
        }
        return Ok(ExitCode::SUCCESS);
    }

    let events: Box<dyn EventSink> = if json_output { Box::new(JsonEventSink) } else { Box::new(StdoutEventSink) };
    let launcher = DeepSpeedLauncher::new(runtime);
    let handle = launch(&launcher, &config, events.as_ref())?;

    supervise(handle, events.as_ref(), json_output).await
}

/// Poll the job until it exits, terminating it on Ctrl-C.
async fn supervise(mut handle: JobHandle, events: &dyn EventSink, json_output: bool) -> Result<ExitCode> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(exit) = handle.try_wait()? {
                    events.on_event(JobEvent::Exited { launch_id: handle.launch_id().clone(), code: exit.code });
                    if !json_output {
                        report_exit(&handle, &exit);
                    }
                    return Ok(ExitCode::from(exit_status(&exit)));
                }
            }
            signal = &mut ctrl_c => {
                signal.context("failed to listen for Ctrl-C")?;
                tracing::warn!(pid = handle.pid(), "interrupted, stopping training runtime");
                tokio::task::block_in_place(|| handle.terminate())?;
                events.on_event(JobEvent::Terminated { launch_id: handle.launch_id().clone() });
                return Ok(ExitCode::from(INTERRUPTED));
            }
        }
    }
}

fn report_exit(handle: &JobHandle, exit: &JobExit) {
    let elapsed = format_elapsed(handle);
    if exit.success() {
        println!();
        println!("{} {}", "✓".green(), format!("Training finished in {elapsed}").bold());
        return;
    }

    println!();
    println!("{} {}", "✗".red(), format!("Training failed after {elapsed}").bold());
    if !exit.diagnostics.is_empty() {
        println!("  {}", "Last runtime output:".yellow());
        for line in &exit.diagnostics {
            println!("    {}", line.dimmed());
        }
    }
}

fn format_elapsed(handle: &JobHandle) -> String {
    let secs = handle.elapsed().num_seconds().max(0);
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// The runtime's own exit code, or 1 when it was killed by a signal.
fn exit_status(exit: &JobExit) -> u8 {
    exit.code.and_then(|code| u8::try_from(code).ok()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let exit = |code| JobExit { code, diagnostics: Vec::new() };
        assert_eq!(exit_status(&exit(Some(0))), 0);
        assert_eq!(exit_status(&exit(Some(7))), 7);
        assert_eq!(exit_status(&exit(Some(-1))), 1);
        assert_eq!(exit_status(&exit(None)), 1);
    }
}
