use crate::error::{JobError, JobResult, ResourceError, ValidationError};
use crate::job::{
    Batching, CheckpointPolicy, Flags, Hardware, Identity, JobPaths, LoraSettings, LrSchedulerType, SequenceLimits,
    Schedule, Tensorboard, TrainingJobConfig, TrainingMode, ZeroStage,
};
use crate::options::{OptionName, OverrideValue, Overrides};
use crate::output::{default_output_dir, OutputDir};
use crate::port::{select_port, verify_port, PortProbe, TcpPortProbe, DEFAULT_PORT_ATTEMPTS};
use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Every option with its current value, before validation.
///
/// `JobDraft::default()` holds the documented defaults. Callers that want
/// different defaults (for example a device list from their settings file)
/// adjust a draft and hand it to [`JobBuilder::with_defaults`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobDraft {
    pub mode: TrainingMode,
    pub project_name: String,
    pub model_use: String,
    pub version: String,
    pub model_name: String,
    pub data_dir: PathBuf,
    pub train_file: Option<PathBuf>,
    pub dev_file: Option<PathBuf>,
    pub doc_file: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub lora_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub entry_point: Option<PathBuf>,
    pub device_list: Vec<u32>,
    pub master_port: Option<u16>,
    pub batching: Batching,
    pub limits: SequenceLimits,
    pub schedule: Schedule,
    pub checkpointing: CheckpointPolicy,
    pub flags: Flags,
    pub lora: LoraSettings,
    pub tensorboard: Tensorboard,
    pub seed: u64,
}

impl Default for JobDraft {
    fn default() -> Self {
        Self {
            mode: TrainingMode::Retrieval,
            project_name: "Coati".to_string(),
            model_use: "finetune".to_string(),
            version: "v1".to_string(),
            model_name: "llama".to_string(),
            data_dir: PathBuf::from("./data"),
            train_file: None,
            dev_file: None,
            doc_file: None,
            model_path: None,
            lora_path: None,
            output_dir: None,
            entry_point: None,
            device_list: vec![0],
            master_port: None,
            batching: Batching {
                per_device_train_batch_size: 16,
                per_device_eval_batch_size: 16,
                gradient_accumulation_steps: 1,
                train_group_size: 8,
            },
            limits: SequenceLimits { query_max_len: 500, passage_max_len: 500 },
            schedule: Schedule {
                num_train_epochs: 1,
                learning_rate: 1e-3,
                num_warmup_steps: 0,
                weight_decay: 0.0,
                lr_scheduler_type: LrSchedulerType::Cosine,
                zero_stage: ZeroStage::Disabled,
            },
            checkpointing: CheckpointPolicy {
                save_batch_steps: 1000,
                save_per_epoch: false,
                early_stop: false,
                early_stop_epoch: 2,
            },
            flags: Flags::default(),
            lora: LoraSettings {
                lora_dim: 0,
                lora_module_name: "decoder.layers.".to_string(),
                only_optimize_lora: false,
                lora_learning_rate: 5e-4,
            },
            tensorboard: Tensorboard { enabled: false, path: PathBuf::from("step1_tensorboard") },
            seed: 1234,
        }
    }
}

fn positive_u32(name: OptionName, value: &OverrideValue) -> Result<u32, ValidationError> {
    let field = name.as_str();
    let raw = value.as_i64(field)?;
    if raw <= 0 {
        return Err(ValidationError::OutOfRange { field, reason: format!("must be >= 1 (got {raw})") });
    }
    u32::try_from(raw).map_err(|_| ValidationError::OutOfRange { field, reason: format!("is too large ({raw})") })
}

fn non_negative_u64(name: OptionName, value: &OverrideValue) -> Result<u64, ValidationError> {
    let field = name.as_str();
    let raw = value.as_i64(field)?;
    u64::try_from(raw).map_err(|_| ValidationError::OutOfRange { field, reason: format!("must be >= 0 (got {raw})") })
}

/// The training scripts take `save_per_epoch` as an integer and save when it is positive.
fn save_switch(name: OptionName, value: &OverrideValue) -> Result<bool, ValidationError> {
    let field = name.as_str();
    match value.as_i64(field) {
        Ok(raw) => Ok(raw > 0),
        Err(_) => value.as_bool(field),
    }
}

fn parsed<T>(name: OptionName, value: &OverrideValue) -> Result<T, ValidationError>
where
    T: std::str::FromStr<Err = String>,
{
    let field = name.as_str();
    let text = value.as_text(field)?;
    text.parse().map_err(|reason| ValidationError::InvalidValue { field, value: text, reason })
}

fn path(name: OptionName, value: &OverrideValue) -> Result<PathBuf, ValidationError> {
    let field = name.as_str();
    let text = value.as_text(field)?;
    if text.trim().is_empty() {
        return Err(ValidationError::Missing { field });
    }
    Ok(PathBuf::from(text))
}

/// `none` is how the training scripts spell "no adapter".
fn optional_path(name: OptionName, value: &OverrideValue) -> Result<Option<PathBuf>, ValidationError> {
    let text = value.as_text(name.as_str())?;
    if text.trim().is_empty() || text.trim().eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        Ok(Some(PathBuf::from(text)))
    }
}

impl JobDraft {
    /// Apply a single override. Values are type-checked here; cross-field rules wait for [`JobDraft::validate`].
    pub fn apply(&mut self, name: OptionName, value: &OverrideValue) -> Result<(), ValidationError> {
        let field = name.as_str();
        debug!(option = field, value = %value, "applying override");

        match name {
            OptionName::Mode => self.mode = parsed(name, value)?,
            OptionName::ProjectName => self.project_name = value.as_text(field)?,
            OptionName::ModelUse => self.model_use = value.as_text(field)?,
            OptionName::Version => self.version = value.as_text(field)?,
            OptionName::ModelName => self.model_name = value.as_text(field)?,
            OptionName::DataDir => self.data_dir = path(name, value)?,
            OptionName::TrainFile => self.train_file = Some(path(name, value)?),
            OptionName::DevFile => self.dev_file = optional_path(name, value)?,
            OptionName::DocFile => self.doc_file = optional_path(name, value)?,
            OptionName::ModelPath => self.model_path = Some(path(name, value)?),
            OptionName::LoraPath => self.lora_path = optional_path(name, value)?,
            OptionName::OutputDir => self.output_dir = Some(path(name, value)?),
            OptionName::EntryPoint => self.entry_point = Some(path(name, value)?),
            OptionName::DeviceList => {
                self.device_list = value
                    .as_list(field)?
                    .into_iter()
                    .map(|d| {
                        u32::try_from(d).map_err(|_| ValidationError::InvalidValue {
                            field,
                            value: d.to_string(),
                            reason: "device indices are non-negative".to_string(),
                        })
                    })
                    .collect::<Result<_, _>>()?;
            }
            OptionName::MasterPort => {
                let raw = value.as_i64(field)?;
                let port = u16::try_from(raw).ok().filter(|p| *p != 0).ok_or_else(|| {
                    ValidationError::OutOfRange { field, reason: format!("must be between 1 and 65535 (got {raw})") }
                })?;
                self.master_port = Some(port);
            }
            OptionName::PerDeviceTrainBatchSize => {
                self.batching.per_device_train_batch_size = positive_u32(name, value)?;
            }
            OptionName::PerDeviceEvalBatchSize => {
                self.batching.per_device_eval_batch_size = positive_u32(name, value)?;
            }
            OptionName::GradientAccumulationSteps => {
                self.batching.gradient_accumulation_steps = positive_u32(name, value)?;
            }
            OptionName::TrainGroupSize => self.batching.train_group_size = positive_u32(name, value)?,
            OptionName::QueryMaxLen => self.limits.query_max_len = positive_u32(name, value)?,
            OptionName::PassageMaxLen => self.limits.passage_max_len = positive_u32(name, value)?,
            OptionName::NumTrainEpochs => self.schedule.num_train_epochs = positive_u32(name, value)?,
            OptionName::LearningRate => self.schedule.learning_rate = value.as_f64(field)?,
            OptionName::NumWarmupSteps => self.schedule.num_warmup_steps = non_negative_u64(name, value)?,
            OptionName::WeightDecay => self.schedule.weight_decay = value.as_f64(field)?,
            OptionName::LrSchedulerType => self.schedule.lr_scheduler_type = parsed(name, value)?,
            OptionName::ZeroStage => {
                let raw = value.as_i64(field)?;
                self.schedule.zero_stage = u8::try_from(raw)
                    .map_err(|_| "ZeRO stage must be 0, 1, 2 or 3".to_string())
                    .and_then(ZeroStage::try_from)
                    .map_err(|reason| ValidationError::InvalidValue { field, value: raw.to_string(), reason })?;
            }
            OptionName::SaveBatchSteps => self.checkpointing.save_batch_steps = non_negative_u64(name, value)?,
            OptionName::SavePerEpoch => self.checkpointing.save_per_epoch = save_switch(name, value)?,
            OptionName::EarlyStop => self.checkpointing.early_stop = value.as_bool(field)?,
            OptionName::EarlyStopEpoch => self.checkpointing.early_stop_epoch = positive_u32(name, value)?,
            OptionName::Seed => self.seed = non_negative_u64(name, value)?,
            OptionName::GradientCheckpointing => self.flags.gradient_checkpointing = value.as_bool(field)?,
            OptionName::Use4bit => self.flags.use_4bit = value.as_bool(field)?,
            OptionName::DebugCode => self.flags.debug_code = value.as_bool(field)?,
            OptionName::Offload => self.flags.offload = value.as_bool(field)?,
            OptionName::DisableDropout => self.flags.disable_dropout = value.as_bool(field)?,
            OptionName::EnableTensorboard => self.tensorboard.enabled = value.as_bool(field)?,
            OptionName::TensorboardPath => self.tensorboard.path = path(name, value)?,
            OptionName::LoraDim => self.lora.lora_dim = u32::try_from(non_negative_u64(name, value)?)
                .map_err(|_| ValidationError::OutOfRange { field, reason: "is too large".to_string() })?,
            OptionName::LoraModuleName => self.lora.lora_module_name = value.as_text(field)?,
            OptionName::OnlyOptimizeLora => self.lora.only_optimize_lora = value.as_bool(field)?,
            OptionName::LoraLearningRate => self.lora.lora_learning_rate = value.as_f64(field)?,
        }
        Ok(())
    }

    /// Check required fields, ranges and option combinations.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.train_file.is_none() {
            return Err(ValidationError::Missing { field: OptionName::TrainFile.as_str() });
        }
        if self.model_path.is_none() {
            return Err(ValidationError::Missing { field: OptionName::ModelPath.as_str() });
        }
        if self.entry_point.is_none() {
            return Err(ValidationError::Missing { field: OptionName::EntryPoint.as_str() });
        }
        match self.mode {
            TrainingMode::Retrieval if self.doc_file.is_none() => {
                return Err(ValidationError::Missing { field: OptionName::DocFile.as_str() });
            }
            TrainingMode::Ranking if self.dev_file.is_none() => {
                return Err(ValidationError::Missing { field: OptionName::DevFile.as_str() });
            }
            _ => {}
        }

        for (name, text) in [
            (OptionName::ProjectName, &self.project_name),
            (OptionName::ModelUse, &self.model_use),
            (OptionName::Version, &self.version),
        ] {
            if text.trim().is_empty() {
                return Err(ValidationError::Missing { field: name.as_str() });
            }
        }

        self.validate_rates()?;
        self.validate_devices()?;
        self.validate_combinations()
    }

    fn validate_rates(&self) -> Result<(), ValidationError> {
        for (name, rate) in [
            (OptionName::LearningRate, self.schedule.learning_rate),
            (OptionName::LoraLearningRate, self.lora.lora_learning_rate),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ValidationError::OutOfRange {
                    field: name.as_str(),
                    reason: format!("must be a finite number > 0 (got {rate})"),
                });
            }
        }
        let decay = self.schedule.weight_decay;
        if !decay.is_finite() || decay < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: OptionName::WeightDecay.as_str(),
                reason: format!("must be a finite number >= 0 (got {decay})"),
            });
        }
        Ok(())
    }

    fn validate_devices(&self) -> Result<(), ValidationError> {
        let field = OptionName::DeviceList.as_str();
        if self.device_list.is_empty() {
            return Err(ValidationError::OutOfRange { field, reason: "must name at least one device".to_string() });
        }
        let mut seen = HashSet::new();
        for device in &self.device_list {
            if !seen.insert(device) {
                return Err(ValidationError::InvalidValue {
                    field,
                    value: device.to_string(),
                    reason: "device listed more than once".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_combinations(&self) -> Result<(), ValidationError> {
        if self.flags.use_4bit && self.schedule.zero_stage == ZeroStage::Parameters {
            return Err(ValidationError::Conflict {
                fields: vec![OptionName::Use4bit.as_str(), OptionName::ZeroStage.as_str()],
                reason: "4-bit quantized weights cannot be partitioned by ZeRO stage 3".to_string(),
            });
        }
        if self.flags.use_4bit && self.mode == TrainingMode::Retrieval {
            return Err(ValidationError::Conflict {
                fields: vec![OptionName::Use4bit.as_str(), OptionName::Mode.as_str()],
                reason: "the retrieval script has no 4-bit loading option".to_string(),
            });
        }
        if self.flags.gradient_checkpointing && self.lora.lora_dim > 0 && self.lora.only_optimize_lora {
            return Err(ValidationError::Conflict {
                fields: vec![
                    OptionName::GradientCheckpointing.as_str(),
                    OptionName::LoraDim.as_str(),
                    OptionName::OnlyOptimizeLora.as_str(),
                ],
                reason: "gradient checkpointing needs gradients outside the LoRA weights".to_string(),
            });
        }
        if self.flags.offload && self.schedule.zero_stage == ZeroStage::Disabled {
            return Err(ValidationError::Conflict {
                fields: vec![OptionName::Offload.as_str(), OptionName::ZeroStage.as_str()],
                reason: "CPU offload requires ZeRO stage 1 or higher".to_string(),
            });
        }
        if let Some(name) = self.options_unused_by_mode().first() {
            return Err(ValidationError::Conflict {
                fields: vec![name.as_str(), OptionName::Mode.as_str()],
                reason: format!("the {} script has no such option", self.mode),
            });
        }
        Ok(())
    }

    /// Options moved off their default that the selected mode's script never receives.
    fn options_unused_by_mode(&self) -> Vec<OptionName> {
        let defaults = Self::default();
        let changed = match self.mode {
            TrainingMode::Retrieval => [
                (OptionName::ModelName, self.model_name != defaults.model_name),
                (OptionName::DebugCode, self.flags.debug_code != defaults.flags.debug_code),
                (OptionName::Offload, self.flags.offload != defaults.flags.offload),
                (OptionName::DisableDropout, self.flags.disable_dropout != defaults.flags.disable_dropout),
                (OptionName::EnableTensorboard, self.tensorboard.enabled != defaults.tensorboard.enabled),
                (OptionName::TensorboardPath, self.tensorboard.path != defaults.tensorboard.path),
                (OptionName::LoraDim, self.lora.lora_dim != defaults.lora.lora_dim),
                (OptionName::LoraModuleName, self.lora.lora_module_name != defaults.lora.lora_module_name),
                (OptionName::OnlyOptimizeLora, self.lora.only_optimize_lora != defaults.lora.only_optimize_lora),
                (
                    OptionName::LoraLearningRate,
                    self.lora.lora_learning_rate.to_bits() != defaults.lora.lora_learning_rate.to_bits(),
                ),
            ]
            .to_vec(),
            TrainingMode::Ranking => {
                vec![(OptionName::TrainGroupSize, self.batching.train_group_size != defaults.batching.train_group_size)]
            }
        };
        changed.into_iter().filter_map(|(name, moved)| moved.then_some(name)).collect()
    }

    /// Current value of one option, written the way it would be passed on the command line.
    #[must_use]
    pub fn describe(&self, name: OptionName) -> String {
        fn unset_or(path: Option<&PathBuf>, unset: &str) -> String {
            path.map_or_else(|| unset.to_string(), |p| p.display().to_string())
        }

        match name {
            OptionName::Mode => self.mode.to_string(),
            OptionName::ProjectName => self.project_name.clone(),
            OptionName::ModelUse => self.model_use.clone(),
            OptionName::Version => self.version.clone(),
            OptionName::ModelName => self.model_name.clone(),
            OptionName::DataDir => self.data_dir.display().to_string(),
            OptionName::TrainFile => unset_or(self.train_file.as_ref(), "(required)"),
            OptionName::DevFile => unset_or(self.dev_file.as_ref(), "(required for ranking)"),
            OptionName::DocFile => unset_or(self.doc_file.as_ref(), "(required for retrieval)"),
            OptionName::ModelPath => unset_or(self.model_path.as_ref(), "(required)"),
            OptionName::LoraPath => unset_or(self.lora_path.as_ref(), "none"),
            OptionName::OutputDir => unset_or(self.output_dir.as_ref(), "<data_dir>/output/<project>_<use>_<version>"),
            OptionName::EntryPoint => unset_or(self.entry_point.as_ref(), "(required)"),
            OptionName::DeviceList => self.device_list.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
            OptionName::MasterPort => self.master_port.map_or_else(|| "random".to_string(), |p| p.to_string()),
            OptionName::PerDeviceTrainBatchSize => self.batching.per_device_train_batch_size.to_string(),
            OptionName::PerDeviceEvalBatchSize => self.batching.per_device_eval_batch_size.to_string(),
            OptionName::GradientAccumulationSteps => self.batching.gradient_accumulation_steps.to_string(),
            OptionName::TrainGroupSize => self.batching.train_group_size.to_string(),
            OptionName::QueryMaxLen => self.limits.query_max_len.to_string(),
            OptionName::PassageMaxLen => self.limits.passage_max_len.to_string(),
            OptionName::NumTrainEpochs => self.schedule.num_train_epochs.to_string(),
            OptionName::LearningRate => self.schedule.learning_rate.to_string(),
            OptionName::NumWarmupSteps => self.schedule.num_warmup_steps.to_string(),
            OptionName::WeightDecay => self.schedule.weight_decay.to_string(),
            OptionName::LrSchedulerType => self.schedule.lr_scheduler_type.to_string(),
            OptionName::ZeroStage => self.schedule.zero_stage.to_string(),
            OptionName::SaveBatchSteps => self.checkpointing.save_batch_steps.to_string(),
            OptionName::SavePerEpoch => self.checkpointing.save_per_epoch.to_string(),
            OptionName::EarlyStop => self.checkpointing.early_stop.to_string(),
            OptionName::EarlyStopEpoch => self.checkpointing.early_stop_epoch.to_string(),
            OptionName::Seed => self.seed.to_string(),
            OptionName::GradientCheckpointing => self.flags.gradient_checkpointing.to_string(),
            OptionName::Use4bit => self.flags.use_4bit.to_string(),
            OptionName::DebugCode => self.flags.debug_code.to_string(),
            OptionName::Offload => self.flags.offload.to_string(),
            OptionName::DisableDropout => self.flags.disable_dropout.to_string(),
            OptionName::EnableTensorboard => self.tensorboard.enabled.to_string(),
            OptionName::TensorboardPath => self.tensorboard.path.display().to_string(),
            OptionName::LoraDim => self.lora.lora_dim.to_string(),
            OptionName::LoraModuleName => self.lora.lora_module_name.clone(),
            OptionName::OnlyOptimizeLora => self.lora.only_optimize_lora.to_string(),
            OptionName::LoraLearningRate => self.lora.lora_learning_rate.to_string(),
        }
    }

    fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| {
            default_output_dir(&self.data_dir, &self.project_name, &self.model_use, &self.version)
        })
    }
}

/// Turns overrides into a [`TrainingJobConfig`].
///
/// Everything the builder depends on is held here explicitly: defaults, the
/// port probe, how many accelerators the host has and how often to retry
/// port selection. Nothing is read from the environment.
pub struct JobBuilder<'a> {
    defaults: JobDraft,
    port_probe: &'a dyn PortProbe,
    available_devices: Option<usize>,
    port_attempts: u32,
}

impl Default for JobBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> JobBuilder<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            defaults: JobDraft::default(),
            port_probe: &TcpPortProbe,
            available_devices: None,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: JobDraft) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn with_port_probe(mut self, probe: &'a dyn PortProbe) -> Self {
        self.port_probe = probe;
        self
    }

    /// Number of accelerators on this host. `None` skips the availability check.
    #[must_use]
    pub fn with_available_devices(mut self, count: Option<usize>) -> Self {
        self.available_devices = count;
        self
    }

    #[must_use]
    pub fn with_port_attempts(mut self, attempts: u32) -> Self {
        self.port_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn defaults(&self) -> &JobDraft {
        &self.defaults
    }

    /// Apply `overrides` to the defaults and validate, without touching the host.
    pub fn draft(&self, overrides: &Overrides) -> Result<JobDraft, ValidationError> {
        // Resolve every name first so an unknown option fails before any value is applied.
        let resolved = overrides
            .iter()
            .map(|(key, value)| {
                OptionName::lookup(key)
                    .map(|name| (name, value))
                    .ok_or_else(|| ValidationError::UnknownOption { name: key.to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut draft = self.defaults.clone();
        for (name, value) in resolved {
            draft.apply(name, value)?;
        }
        draft.validate()?;
        Ok(draft)
    }

    /// Build a launch-ready config, drawing the master port from `rng` when none is pinned.
    ///
    /// Side effects are limited to creating the output directory.
    pub fn build_with_rng<R: Rng + ?Sized>(&self, overrides: &Overrides, rng: &mut R) -> JobResult<TrainingJobConfig> {
        let draft = self.draft(overrides)?;
        self.check_devices(&draft.device_list)?;

        let master_port = match draft.master_port {
            Some(port) => verify_port(self.port_probe, port)?,
            None => select_port(self.port_probe, rng, self.port_attempts)?,
        };
        let output_dir = OutputDir::acquire(draft.resolved_output_dir())?;

        Ok(into_config(draft, master_port, output_dir))
    }

    pub fn build(&self, overrides: &Overrides) -> JobResult<TrainingJobConfig> {
        self.build_with_rng(overrides, &mut rand::thread_rng())
    }

    fn check_devices(&self, devices: &[u32]) -> JobResult<()> {
        let Some(available) = self.available_devices else {
            warn!("accelerator count unknown, skipping device availability check");
            return Ok(());
        };
        if let Some(&device) = devices.iter().find(|&&d| d as usize >= available) {
            return Err(JobError::Resource(ResourceError::DeviceUnavailable { device, available }));
        }
        Ok(())
    }
}

/// Consumes a validated draft. Required paths were checked by `validate`.
fn into_config(draft: JobDraft, master_port: u16, output_dir: OutputDir) -> TrainingJobConfig {
    TrainingJobConfig {
        identity: Identity {
            project_name: draft.project_name,
            model_use: draft.model_use,
            version: draft.version,
            mode: draft.mode,
            model_name: draft.model_name,
        },
        paths: JobPaths {
            data_dir: draft.data_dir,
            train_file: draft.train_file.unwrap_or_default(),
            dev_file: draft.dev_file,
            doc_file: draft.doc_file,
            model_path: draft.model_path.unwrap_or_default(),
            lora_path: draft.lora_path,
            output_dir,
            entry_point: draft.entry_point.unwrap_or_default(),
        },
        hardware: Hardware { device_list: draft.device_list, master_port },
        batching: draft.batching,
        limits: draft.limits,
        schedule: draft.schedule,
        checkpointing: draft.checkpointing,
        flags: draft.flags,
        lora: draft.lora,
        tensorboard: draft.tensorboard,
        seed: draft.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::Path;
    use tempfile::TempDir;

    struct AlwaysFree;

    impl PortProbe for AlwaysFree {
        fn is_free(&self, _port: u16) -> bool {
            true
        }
    }

    struct NeverFree;

    impl PortProbe for NeverFree {
        fn is_free(&self, _port: u16) -> bool {
            false
        }
    }

    fn required(out: &Path) -> Overrides {
        Overrides::new()
            .with("train_file", "train.jsonl")
            .with("doc_file", "docs.jsonl")
            .with("model_path", "/models/bge-m3")
            .with("entry_point", "finetune.py")
            .with("output_dir", out.to_string_lossy().to_string())
    }

    #[test]
    fn test_defaults_fill_everything_not_overridden() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let builder = JobBuilder::new().with_port_probe(&AlwaysFree);
        let config = builder.build_with_rng(&required(&out), &mut StdRng::seed_from_u64(1)).unwrap();

        let defaults = JobDraft::default();
        assert_eq!(config.identity().project_name, defaults.project_name);
        assert_eq!(config.mode(), TrainingMode::Retrieval);
        assert_eq!(*config.batching(), defaults.batching);
        assert_eq!(*config.limits(), defaults.limits);
        assert_eq!(*config.schedule(), defaults.schedule);
        assert_eq!(*config.checkpointing(), defaults.checkpointing);
        assert_eq!(*config.lora(), defaults.lora);
        assert_eq!(config.hardware().device_list, vec![0]);
        assert_eq!(config.seed(), 1234);
        assert_eq!(config.paths().train_file, PathBuf::from("train.jsonl"));
        assert_eq!(config.paths().lora_path, None);
    }

    #[test]
    fn test_overrides_take_effect() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let overrides = required(&out)
            .with("mode", "ranking")
            .with("dev_dataset_path", "dev.parquet")
            .with("per_device_train_batch_size", 2)
            .with("gradient_accumulation_steps", "8")
            .with("learning_rate", 5e-5)
            .with("lr_scheduler_type", "linear")
            .with("zero_stage", 2)
            .with("earystop", true)
            .with("eary_stop_epoch", 3)
            .with("max_prompt_len", 256)
            .with("use_4bit", 1)
            .with("lora_path", "none")
            .with("seed", 42)
            .with("port", 23456);

        let builder = JobBuilder::new().with_port_probe(&AlwaysFree);
        let config = builder.build_with_rng(&overrides, &mut StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(config.mode(), TrainingMode::Ranking);
        assert_eq!(config.paths().dev_file, Some(PathBuf::from("dev.parquet")));
        assert_eq!(config.batching().per_device_train_batch_size, 2);
        assert_eq!(config.batching().gradient_accumulation_steps, 8);
        assert!((config.schedule().learning_rate - 5e-5).abs() < f64::EPSILON);
        assert_eq!(config.schedule().lr_scheduler_type, LrSchedulerType::Linear);
        assert_eq!(config.schedule().zero_stage, ZeroStage::Gradients);
        assert!(config.checkpointing().early_stop);
        assert_eq!(config.checkpointing().early_stop_epoch, 3);
        assert_eq!(config.limits().query_max_len, 256);
        assert!(config.flags().use_4bit);
        assert_eq!(config.seed(), 42);
        assert_eq!(config.hardware().master_port, 23456);
    }

    #[test]
    fn test_later_override_wins() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path()).with("seed", 1).with("seed", 2);
        let draft = JobBuilder::new().draft(&overrides).unwrap();
        assert_eq!(draft.seed, 2);
    }

    #[test]
    fn test_unknown_option_is_rejected_before_anything_applies() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("never-created");
        let overrides = required(&out).with("warmup_ratio", 0.1);
        let builder = JobBuilder::new().with_port_probe(&AlwaysFree);

        let err = builder.build_with_rng(&overrides, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(
            err,
            JobError::Validation(ValidationError::UnknownOption { ref name }) if name == "warmup_ratio"
        ));
        assert!(!out.exists());
        assert_eq!(*builder.defaults(), JobDraft::default());
    }

    #[test]
    fn test_zero_batch_size_names_the_field() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path()).with("per_device_train_batch_size", 0);

        let err = JobBuilder::new().draft(&overrides).unwrap_err();
        assert!(err.to_string().contains("per_device_train_batch_size"));
        assert_eq!(err.fields(), vec!["per_device_train_batch_size"]);
    }

    #[test]
    fn test_4bit_with_stage_3_names_both_fields() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path())
            .with("mode", "ranking")
            .with("dev_file", "dev.parquet")
            .with("use_4bit", true)
            .with("zero_stage", 3);

        let err = JobBuilder::new().draft(&overrides).unwrap_err();
        assert!(matches!(err, ValidationError::Conflict { .. }));
        let message = err.to_string();
        assert!(message.contains("use_4bit"));
        assert!(message.contains("zero_stage"));
    }

    #[test]
    fn test_lora_only_with_gradient_checkpointing_conflicts() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path())
            .with("gradient_checkpointing", true)
            .with("lora_dim", 8)
            .with("only_optimize_lora", true);

        let err = JobBuilder::new().draft(&overrides).unwrap_err();
        assert_eq!(err.fields(), vec!["gradient_checkpointing", "lora_dim", "only_optimize_lora"]);
    }

    #[test]
    fn test_offload_requires_a_zero_stage() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path()).with("offload", true);
        let err = JobBuilder::new().draft(&overrides).unwrap_err();
        assert_eq!(err.fields(), vec!["offload", "zero_stage"]);

        let overrides = required(temp.path())
            .with("mode", "ranking")
            .with("dev_file", "dev.parquet")
            .with("offload", true)
            .with("zero_stage", 1);
        assert!(JobBuilder::new().draft(&overrides).is_ok());
    }

    #[test]
    fn test_ranking_only_options_conflict_with_retrieval_mode() {
        let temp = TempDir::new().unwrap();
        for (key, value) in [
            ("model_name", OverrideValue::from("qwen2")),
            ("debug_code", OverrideValue::Bool(true)),
            ("disable_dropout", OverrideValue::Bool(true)),
            ("enable_tensorboard", OverrideValue::Bool(true)),
            ("tensorboard_path", OverrideValue::from("tb")),
            ("lora_dim", OverrideValue::Integer(8)),
            ("lora_module_name", OverrideValue::from("layers.")),
            ("only_optimize_lora", OverrideValue::Bool(true)),
            ("lora_learning_rate", OverrideValue::Float(1e-4)),
        ] {
            let overrides = required(temp.path()).with(key, value);
            let err = JobBuilder::new().draft(&overrides).unwrap_err();
            assert!(matches!(err, ValidationError::Conflict { .. }), "{key}");
            assert_eq!(err.fields(), vec![key, "mode"], "{key}");
        }

        let offload = required(temp.path()).with("offload", true).with("zero_stage", 2);
        let err = JobBuilder::new().draft(&offload).unwrap_err();
        assert_eq!(err.fields(), vec!["offload", "mode"]);

        let unchanged = required(temp.path()).with("lora_dim", 0).with("model_name", "llama");
        assert!(JobBuilder::new().draft(&unchanged).is_ok());
    }

    #[test]
    fn test_train_group_size_conflicts_with_ranking_mode() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path())
            .with("mode", "ranking")
            .with("dev_file", "dev.parquet")
            .with("train_group_size", 4);
        let err = JobBuilder::new().draft(&overrides).unwrap_err();
        assert_eq!(err.fields(), vec!["train_group_size", "mode"]);
    }

    #[test]
    fn test_save_per_epoch_accepts_the_runtime_encoding() {
        let temp = TempDir::new().unwrap();
        for (value, expected) in [("-1", false), ("0", false), ("1", true), ("3", true), ("true", true), ("off", false)] {
            let overrides = required(temp.path()).with("save_per_epoch", value);
            let draft = JobBuilder::new().draft(&overrides).unwrap();
            assert_eq!(draft.checkpointing.save_per_epoch, expected, "{value}");
        }

        let mut overrides = required(temp.path()).with("save_per_epoch", true);
        overrides.extend(Overrides::from_flag_args(&["--save_per_epoch", "-1"]).unwrap());
        assert!(!JobBuilder::new().draft(&overrides).unwrap().checkpointing.save_per_epoch);

        let err = JobBuilder::new().draft(&required(temp.path()).with("save_per_epoch", "maybe")).unwrap_err();
        assert_eq!(err.fields(), vec!["save_per_epoch"]);
    }

    #[test]
    fn test_missing_required_paths() {
        let err = JobBuilder::new().draft(&Overrides::new()).unwrap_err();
        assert_eq!(err, ValidationError::Missing { field: "train_file" });

        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path()).with("mode", "ranking");
        let err = JobBuilder::new().draft(&overrides).unwrap_err();
        assert_eq!(err, ValidationError::Missing { field: "dev_file" });
    }

    #[test]
    fn test_bad_values_are_reported_with_the_field() {
        let temp = TempDir::new().unwrap();
        for (key, value, field) in [
            ("zero_stage", OverrideValue::Integer(4), "zero_stage"),
            ("lr_scheduler_type", OverrideValue::from("step"), "lr_scheduler_type"),
            ("learning_rate", OverrideValue::Float(0.0), "learning_rate"),
            ("weight_decay", OverrideValue::Float(-0.1), "weight_decay"),
            ("device_list", OverrideValue::List(vec![]), "device_list"),
            ("device_list", OverrideValue::List(vec![0, 0]), "device_list"),
            ("device_list", OverrideValue::List(vec![-1]), "device_list"),
            ("master_port", OverrideValue::Integer(70000), "master_port"),
            ("num_train_epochs", OverrideValue::from("two"), "num_train_epochs"),
        ] {
            let overrides = required(temp.path()).with(key, value);
            let err = JobBuilder::new().draft(&overrides).unwrap_err();
            assert_eq!(err.fields(), vec![field], "{key}");
        }
    }

    #[test]
    fn test_full_override_set_on_eight_devices() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("runs").join("rank_v11");
        let overrides = required(&out).with("device_list", vec![0_u32, 1, 2, 3, 4, 5, 6, 7]);
        let builder = JobBuilder::new().with_available_devices(Some(8));

        let config = builder.build_with_rng(&overrides, &mut StdRng::seed_from_u64(9)).unwrap();
        assert!((10000..=65535).contains(&config.hardware().master_port));
        assert_eq!(config.hardware().world_size(), 8);
        assert!(config.paths().output_dir.path().is_dir());
    }

    #[test]
    fn test_device_beyond_host_count_is_a_resource_error() {
        let temp = TempDir::new().unwrap();
        let overrides = required(temp.path()).with("devices", "0,1,4");
        let builder = JobBuilder::new().with_port_probe(&AlwaysFree).with_available_devices(Some(4));

        let err = builder.build_with_rng(&overrides, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(
            err,
            JobError::Resource(ResourceError::DeviceUnavailable { device: 4, available: 4 })
        ));
    }

    #[test]
    fn test_pinned_busy_port_and_exhausted_probe() {
        let temp = TempDir::new().unwrap();
        let builder = JobBuilder::new().with_port_probe(&NeverFree).with_port_attempts(3);

        let pinned = required(temp.path()).with("master_port", 29500);
        let err = builder.build_with_rng(&pinned, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, JobError::Resource(ResourceError::PortInUse { port: 29500 })));

        let err = builder.build_with_rng(&required(temp.path()), &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, JobError::Resource(ResourceError::PortExhausted { attempts: 3 })));
    }

    #[test]
    fn test_describe_defaults() {
        let draft = JobDraft::default();
        assert_eq!(draft.describe(OptionName::LearningRate), "0.001");
        assert_eq!(draft.describe(OptionName::LoraPath), "none");
        assert_eq!(draft.describe(OptionName::TrainFile), "(required)");
        assert_eq!(draft.describe(OptionName::MasterPort), "random");
        assert_eq!(draft.describe(OptionName::DeviceList), "0");
        assert_eq!(draft.describe(OptionName::LrSchedulerType), "cosine");
    }

    #[test]
    fn test_default_output_dir_is_derived_from_identity() {
        let temp = TempDir::new().unwrap();
        let overrides = Overrides::new()
            .with("data_dir", temp.path().to_string_lossy().to_string())
            .with("train_file", "train.jsonl")
            .with("doc_file", "docs.jsonl")
            .with("model_path", "/models/bge")
            .with("entry_point", "finetune.py")
            .with("project_name", "kaggle")
            .with("model_use", "emb")
            .with("version", "v2");

        let config = JobBuilder::new()
            .with_port_probe(&AlwaysFree)
            .build_with_rng(&overrides, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let expected = temp.path().join("output").join("kaggle_emb_v2");
        assert_eq!(config.paths().output_dir.path(), expected.as_path());
        assert!(expected.is_dir());
    }
}
