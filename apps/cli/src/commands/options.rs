//! Options command implementation.

use anyhow::Result;
use colored::Colorize;
use ignite_launch::{JobDraft, OptionName};
use serde_json::json;

/// List every recognized job option with its default and aliases.
pub async fn execute(json_output: bool) -> Result<()> {
    let defaults = JobDraft::default();

    if json_output {
        let out: Vec<_> = OptionName::ALL
            .into_iter()
            .map(|name| {
                json!({
                    "name": name.as_str(),
                    "aliases": name.aliases(),
                    "default": defaults.describe(name),
                    "help": name.help(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Job Options ({})", OptionName::ALL.len()).bold().cyan());
    println!();
    println!("{:<30} {:<28} {}", "Option", "Default", "Description");
    println!("{}", "─".repeat(100));
    for name in OptionName::ALL {
        println!("{:<30} {:<28} {}", name.as_str().cyan(), defaults.describe(name), name.help().dimmed());
        if !name.aliases().is_empty() {
            println!("{:<30} {}", "", format!("also: {}", name.aliases().join(", ")).dimmed());
        }
    }
    println!();
    Ok(())
}
