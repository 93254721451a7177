//! Argument types shared by the job commands.

use anyhow::{Context, Result};
use clap::Args;
use ignite_launch::{JobError, Overrides};
use std::path::PathBuf;

/// Where a job's options come from. Later sources win: job file, then
/// runtime flags, then `--devices` / `--port`.
#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    /// TOML job file of `option = value` pairs
    #[arg(long, value_name = "FILE")]
    pub job: Option<PathBuf>,

    /// Comma-separated accelerator indices (e.g. 0,1,2,3)
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub devices: Option<Vec<u32>>,

    /// Master port; a free one is drawn from 10000-65535 when omitted
    #[arg(long)]
    pub port: Option<u16>,

    /// Skip checking the device list against nvidia-smi
    #[arg(long)]
    pub no_device_check: bool,

    /// Job options in the training scripts' flag form (`--train_data FILE --zero_stage 2 ...`)
    #[arg(
        value_name = "RUNTIME FLAGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub flags: Vec<String>,
}

impl JobArgs {
    /// Collect overrides from every source, in precedence order.
    pub fn overrides(&self) -> Result<Overrides> {
        let mut overrides = Overrides::new();

        if let Some(path) = &self.job {
            let content = std::fs::read_to_string(path)
                .map_err(|source| JobError::Io { path: path.clone(), source })?;
            let table: toml::Table =
                toml::from_str(&content).with_context(|| format!("failed to parse job file {}", path.display()))?;
            overrides.extend(Overrides::from_toml_table(&table).map_err(JobError::from)?);
        }

        overrides.extend(Overrides::from_flag_args(&self.flags).map_err(JobError::from)?);

        if let Some(devices) = &self.devices {
            overrides.set("device_list", devices.clone());
        }
        if let Some(port) = self.port {
            overrides.set("master_port", port);
        }
        Ok(overrides)
    }
}
