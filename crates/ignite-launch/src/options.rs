//! Recognized job options and the override list fed to the builder.
//!
//! Option names are matched after normalization (leading `--` stripped,
//! `-` turned into `_`, lowercased), so `--train-data`, `train_data` and
//! `TRAIN_DATA` all name the same option. Each option also answers to the
//! spelling the training scripts use on their own command line.

use crate::error::ValidationError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionName {
    Mode,
    ProjectName,
    ModelUse,
    Version,
    ModelName,
    DataDir,
    TrainFile,
    DevFile,
    DocFile,
    ModelPath,
    LoraPath,
    OutputDir,
    EntryPoint,
    DeviceList,
    MasterPort,
    PerDeviceTrainBatchSize,
    PerDeviceEvalBatchSize,
    GradientAccumulationSteps,
    TrainGroupSize,
    QueryMaxLen,
    PassageMaxLen,
    NumTrainEpochs,
    LearningRate,
    NumWarmupSteps,
    WeightDecay,
    LrSchedulerType,
    ZeroStage,
    SaveBatchSteps,
    SavePerEpoch,
    EarlyStop,
    EarlyStopEpoch,
    Seed,
    GradientCheckpointing,
    Use4bit,
    DebugCode,
    Offload,
    DisableDropout,
    EnableTensorboard,
    TensorboardPath,
    LoraDim,
    LoraModuleName,
    OnlyOptimizeLora,
    LoraLearningRate,
}

impl OptionName {
    pub const ALL: [Self; 43] = [
        Self::Mode,
        Self::ProjectName,
        Self::ModelUse,
        Self::Version,
        Self::ModelName,
        Self::DataDir,
        Self::TrainFile,
        Self::DevFile,
        Self::DocFile,
        Self::ModelPath,
        Self::LoraPath,
        Self::OutputDir,
        Self::EntryPoint,
        Self::DeviceList,
        Self::MasterPort,
        Self::PerDeviceTrainBatchSize,
        Self::PerDeviceEvalBatchSize,
        Self::GradientAccumulationSteps,
        Self::TrainGroupSize,
        Self::QueryMaxLen,
        Self::PassageMaxLen,
        Self::NumTrainEpochs,
        Self::LearningRate,
        Self::NumWarmupSteps,
        Self::WeightDecay,
        Self::LrSchedulerType,
        Self::ZeroStage,
        Self::SaveBatchSteps,
        Self::SavePerEpoch,
        Self::EarlyStop,
        Self::EarlyStopEpoch,
        Self::Seed,
        Self::GradientCheckpointing,
        Self::Use4bit,
        Self::DebugCode,
        Self::Offload,
        Self::DisableDropout,
        Self::EnableTensorboard,
        Self::TensorboardPath,
        Self::LoraDim,
        Self::LoraModuleName,
        Self::OnlyOptimizeLora,
        Self::LoraLearningRate,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mode => "mode",
            Self::ProjectName => "project_name",
            Self::ModelUse => "model_use",
            Self::Version => "version",
            Self::ModelName => "model_name",
            Self::DataDir => "data_dir",
            Self::TrainFile => "train_file",
            Self::DevFile => "dev_file",
            Self::DocFile => "doc_file",
            Self::ModelPath => "model_path",
            Self::LoraPath => "lora_path",
            Self::OutputDir => "output_dir",
            Self::EntryPoint => "entry_point",
            Self::DeviceList => "device_list",
            Self::MasterPort => "master_port",
            Self::PerDeviceTrainBatchSize => "per_device_train_batch_size",
            Self::PerDeviceEvalBatchSize => "per_device_eval_batch_size",
            Self::GradientAccumulationSteps => "gradient_accumulation_steps",
            Self::TrainGroupSize => "train_group_size",
            Self::QueryMaxLen => "query_max_len",
            Self::PassageMaxLen => "passage_max_len",
            Self::NumTrainEpochs => "num_train_epochs",
            Self::LearningRate => "learning_rate",
            Self::NumWarmupSteps => "num_warmup_steps",
            Self::WeightDecay => "weight_decay",
            Self::LrSchedulerType => "lr_scheduler_type",
            Self::ZeroStage => "zero_stage",
            Self::SaveBatchSteps => "save_batch_steps",
            Self::SavePerEpoch => "save_per_epoch",
            Self::EarlyStop => "early_stop",
            Self::EarlyStopEpoch => "early_stop_epoch",
            Self::Seed => "seed",
            Self::GradientCheckpointing => "gradient_checkpointing",
            Self::Use4bit => "use_4bit",
            Self::DebugCode => "debug_code",
            Self::Offload => "offload",
            Self::DisableDropout => "disable_dropout",
            Self::EnableTensorboard => "enable_tensorboard",
            Self::TensorboardPath => "tensorboard_path",
            Self::LoraDim => "lora_dim",
            Self::LoraModuleName => "lora_module_name",
            Self::OnlyOptimizeLora => "only_optimize_lora",
            Self::LoraLearningRate => "lora_learning_rate",
        }
    }

    /// Other names accepted for this option, mostly the training scripts' own flag names.
    #[must_use]
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::TrainFile => &["train_data", "train_dataset_path"],
            Self::DevFile => &["dev_data", "dev_dataset_path"],
            Self::DocFile => &["doc_data"],
            Self::ModelPath => &["model_name_or_path"],
            Self::DeviceList => &["devices", "cuda_visible_devices"],
            Self::MasterPort => &["port"],
            Self::QueryMaxLen => &["max_prompt_len"],
            Self::PassageMaxLen => &["max_completion_len"],
            Self::EarlyStop => &["earystop"],
            Self::EarlyStopEpoch => &["eary_stop_epoch"],
            _ => &[],
        }
    }

    #[must_use]
    pub const fn help(self) -> &'static str {
        match self {
            Self::Mode => "training script dialect: retrieval or ranking",
            Self::ProjectName => "experiment tracking project name",
            Self::ModelUse => "what the model is trained for, used in the default output path",
            Self::Version => "run version, used in the default output path",
            Self::ModelName => "model family passed to the ranking script",
            Self::DataDir => "directory relative dataset paths are resolved against",
            Self::TrainFile => "training dataset",
            Self::DevFile => "evaluation dataset (required for ranking)",
            Self::DocFile => "document corpus (required for retrieval)",
            Self::ModelPath => "pretrained model path or hub identifier",
            Self::LoraPath => "existing LoRA adapter weights to start from",
            Self::OutputDir => "where the runtime writes checkpoints and logs",
            Self::EntryPoint => "training script executed by the runtime",
            Self::DeviceList => "accelerator indices, e.g. 0,1,2,3",
            Self::MasterPort => "rendezvous port; drawn from 10000-65535 when unset",
            Self::PerDeviceTrainBatchSize => "training batch size per device",
            Self::PerDeviceEvalBatchSize => "evaluation batch size per device",
            Self::GradientAccumulationSteps => "micro-batches accumulated per optimizer step",
            Self::TrainGroupSize => "passages per query in a retrieval training group",
            Self::QueryMaxLen => "max query / prompt tokens",
            Self::PassageMaxLen => "max passage / completion tokens",
            Self::NumTrainEpochs => "training epochs",
            Self::LearningRate => "peak learning rate",
            Self::NumWarmupSteps => "learning rate warmup steps",
            Self::WeightDecay => "AdamW weight decay",
            Self::LrSchedulerType => "learning rate schedule",
            Self::ZeroStage => "ZeRO partitioning stage (0-3)",
            Self::SaveBatchSteps => "checkpoint every N steps (0 disables)",
            Self::SavePerEpoch => "checkpoint at the end of every epoch",
            Self::EarlyStop => "stop when evaluation stops improving",
            Self::EarlyStopEpoch => "epochs without improvement before stopping",
            Self::Seed => "random seed",
            Self::GradientCheckpointing => "trade compute for activation memory",
            Self::Use4bit => "load the base model quantized to 4 bits",
            Self::DebugCode => "train on a small data sample",
            Self::Offload => "offload optimizer and parameters to CPU",
            Self::DisableDropout => "disable model dropout",
            Self::EnableTensorboard => "write tensorboard logs",
            Self::TensorboardPath => "tensorboard log directory",
            Self::LoraDim => "LoRA rank; 0 trains all parameters",
            Self::LoraModuleName => "module scope LoRA is applied to",
            Self::OnlyOptimizeLora => "freeze everything except LoRA weights",
            Self::LoraLearningRate => "learning rate for LoRA parameters",
        }
    }

    /// Resolve a user-supplied option name, canonical or alias.
    #[must_use]
    pub fn lookup(key: &str) -> Option<Self> {
        let key = normalize(key);
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == key || name.aliases().contains(&key.as_str()))
    }
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(key: &str) -> String {
    key.trim().trim_start_matches("--").replace('-', "_").to_ascii_lowercase()
}

/// A raw override value, before it is checked against the option's type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OverrideValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<i64>),
}

impl OverrideValue {
    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidValue { field, value: self.to_string(), reason: reason.into() }
    }

    pub(crate) fn as_text(&self, field: &'static str) -> Result<String, ValidationError> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            Self::Integer(i) => Ok(i.to_string()),
            Self::Float(f) => Ok(f.to_string()),
            Self::Bool(b) => Ok(b.to_string()),
            Self::List(_) => Err(self.invalid(field, "expected a single value")),
        }
    }

    pub(crate) fn as_bool(&self, field: &'static str) -> Result<bool, ValidationError> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Integer(0) => Ok(false),
            Self::Integer(1) => Ok(true),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(self.invalid(field, "expected true or false")),
            },
            _ => Err(self.invalid(field, "expected true or false")),
        }
    }

    pub(crate) fn as_i64(&self, field: &'static str) -> Result<i64, ValidationError> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Text(s) => s.trim().parse().map_err(|_| self.invalid(field, "expected an integer")),
            _ => Err(self.invalid(field, "expected an integer")),
        }
    }

    pub(crate) fn as_f64(&self, field: &'static str) -> Result<f64, ValidationError> {
        match self {
            Self::Float(f) => Ok(*f),
            Self::Integer(i) => Ok(*i as f64),
            Self::Text(s) => s.trim().parse().map_err(|_| self.invalid(field, "expected a number")),
            _ => Err(self.invalid(field, "expected a number")),
        }
    }

    pub(crate) fn as_list(&self, field: &'static str) -> Result<Vec<i64>, ValidationError> {
        match self {
            Self::List(items) => Ok(items.clone()),
            Self::Integer(i) => Ok(vec![*i]),
            Self::Text(s) => s
                .split(',')
                .map(|part| {
                    part.trim()
                        .parse::<i64>()
                        .map_err(|_| self.invalid(field, "expected comma-separated integers"))
                })
                .collect(),
            _ => Err(self.invalid(field, "expected a list of integers")),
        }
    }
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => b.fmt(f),
            Self::Integer(i) => i.fmt(f),
            Self::Float(x) => x.fmt(f),
            Self::Text(s) => s.fmt(f),
            Self::List(items) => {
                let parts: Vec<_> = items.iter().map(i64::to_string).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

impl From<bool> for OverrideValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OverrideValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for OverrideValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for OverrideValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u16> for OverrideValue {
    fn from(value: u16) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for OverrideValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for OverrideValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OverrideValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<i64>> for OverrideValue {
    fn from(value: Vec<i64>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<u32>> for OverrideValue {
    fn from(value: Vec<u32>) -> Self {
        Self::List(value.into_iter().map(i64::from).collect())
    }
}

/// Ordered `(option, value)` pairs. A later entry for the same option wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    entries: Vec<(String, OverrideValue)>,
}

impl Overrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Overrides::set`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<OverrideValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<OverrideValue>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Append `other`, so its entries take precedence over ours.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OverrideValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read overrides from a flat TOML table (a job file).
    pub fn from_toml_table(table: &toml::Table) -> Result<Self, ValidationError> {
        let mut overrides = Self::new();
        for (key, value) in table {
            let name = OptionName::lookup(key)
                .ok_or_else(|| ValidationError::UnknownOption { name: key.clone() })?;
            overrides.set(key.clone(), toml_to_value(name, value)?);
        }
        Ok(overrides)
    }

    /// Read overrides written as command-line flags: `--name value`, `--name=value`,
    /// or a bare `--name` meaning `true`.
    pub fn from_flag_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ValidationError> {
        let mut overrides = Self::new();
        let mut iter = args.iter().map(AsRef::as_ref).peekable();

        while let Some(arg) = iter.next() {
            let Some(flag) = arg.strip_prefix("--").filter(|f| !f.is_empty()) else {
                return Err(ValidationError::UnexpectedArgument { arg: arg.to_string() });
            };

            if let Some((name, value)) = flag.split_once('=') {
                overrides.set(name, value);
                continue;
            }

            let value = match iter.peek() {
                Some(next) if !next.starts_with("--") => Some(*next),
                _ => None,
            };
            match value {
                Some(value) => {
                    overrides.set(flag, value);
                    iter.next();
                }
                None => overrides.set(flag, true),
            }
        }

        Ok(overrides)
    }
}

fn toml_to_value(name: OptionName, value: &toml::Value) -> Result<OverrideValue, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidValue {
        field: name.as_str(),
        value: value.to_string(),
        reason: reason.to_string(),
    };

    match value {
        toml::Value::String(s) => Ok(OverrideValue::Text(s.clone())),
        toml::Value::Integer(i) => Ok(OverrideValue::Integer(*i)),
        toml::Value::Float(f) => Ok(OverrideValue::Float(*f)),
        toml::Value::Boolean(b) => Ok(OverrideValue::Bool(*b)),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| item.as_integer().ok_or_else(|| invalid("arrays may only hold integers")))
            .collect::<Result<Vec<_>, _>>()
            .map(OverrideValue::List),
        toml::Value::Datetime(_) | toml::Value::Table(_) => Err(invalid("expected a plain value")),
    }
}
