use crate::output::OutputDir;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchId(pub String);

impl LaunchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which training script dialect the job speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Embedding/retrieval fine-tuning (query/passage pairs, document corpus).
    #[default]
    Retrieval,
    /// Ranking/choice fine-tuning (prompt/completion pairs, dev set).
    Ranking,
}

impl TrainingMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Ranking => "ranking",
        }
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retrieval" | "embedding" | "emb" => Ok(Self::Retrieval),
            "ranking" | "rank" | "choice" => Ok(Self::Ranking),
            _ => Err("expected `retrieval` or `ranking`".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    Linear,
    #[default]
    Cosine,
    CosineWithRestarts,
    Polynomial,
    Constant,
    ConstantWithWarmup,
}

impl LrSchedulerType {
    pub const ALL: [Self; 6] = [
        Self::Linear,
        Self::Cosine,
        Self::CosineWithRestarts,
        Self::Polynomial,
        Self::Constant,
        Self::ConstantWithWarmup,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Cosine => "cosine",
            Self::CosineWithRestarts => "cosine_with_restarts",
            Self::Polynomial => "polynomial",
            Self::Constant => "constant",
            Self::ConstantWithWarmup => "constant_with_warmup",
        }
    }
}

impl fmt::Display for LrSchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LrSchedulerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == wanted).ok_or_else(|| {
            let names: Vec<_> = Self::ALL.iter().map(|t| t.as_str()).collect();
            format!("expected one of {}", names.join(", "))
        })
    }
}

/// ZeRO optimizer state partitioning stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ZeroStage {
    #[default]
    Disabled,
    OptimizerStates,
    Gradients,
    Parameters,
}

impl ZeroStage {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::OptimizerStates => 1,
            Self::Gradients => 2,
            Self::Parameters => 3,
        }
    }
}

impl From<ZeroStage> for u8 {
    fn from(stage: ZeroStage) -> Self {
        stage.as_u8()
    }
}

impl TryFrom<u8> for ZeroStage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::OptimizerStates),
            2 => Ok(Self::Gradients),
            3 => Ok(Self::Parameters),
            _ => Err("ZeRO stage must be 0, 1, 2 or 3".to_string()),
        }
    }
}

impl fmt::Display for ZeroStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_u8().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub project_name: String,
    pub model_use: String,
    pub version: String,
    pub mode: TrainingMode,
    /// Model family passed to the ranking script (`llama`, `qwen2`, ...).
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPaths {
    pub data_dir: PathBuf,
    pub train_file: PathBuf,
    pub dev_file: Option<PathBuf>,
    pub doc_file: Option<PathBuf>,
    pub model_path: PathBuf,
    pub lora_path: Option<PathBuf>,
    pub output_dir: OutputDir,
    pub entry_point: PathBuf,
}

impl JobPaths {
    /// Resolve a dataset path against `data_dir` unless it is already absolute.
    #[must_use]
    pub fn in_data_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hardware {
    pub device_list: Vec<u32>,
    pub master_port: u16,
}

impl Hardware {
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.device_list.len()
    }

    /// Device list in the comma-separated form accelerator runtimes expect.
    #[must_use]
    pub fn visible_devices(&self) -> String {
        self.device_list.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Batching {
    pub per_device_train_batch_size: u32,
    pub per_device_eval_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub train_group_size: u32,
}

/// Token limits. Retrieval calls them query/passage, ranking calls them prompt/completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceLimits {
    pub query_max_len: u32,
    pub passage_max_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Schedule {
    pub num_train_epochs: u32,
    pub learning_rate: f64,
    pub num_warmup_steps: u64,
    pub weight_decay: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub zero_stage: ZeroStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointPolicy {
    /// Save every N optimizer steps; 0 disables step checkpoints.
    pub save_batch_steps: u64,
    pub save_per_epoch: bool,
    pub early_stop: bool,
    pub early_stop_epoch: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Flags {
    pub gradient_checkpointing: bool,
    pub use_4bit: bool,
    pub debug_code: bool,
    pub offload: bool,
    pub disable_dropout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraSettings {
    /// Adapter rank; 0 trains the full model.
    pub lora_dim: u32,
    pub lora_module_name: String,
    pub only_optimize_lora: bool,
    pub lora_learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tensorboard {
    pub enabled: bool,
    pub path: PathBuf,
}

/// A validated, ready-to-launch training job.
///
/// Only [`crate::JobBuilder`] can produce one, so holding a value means every
/// invariant was checked: paths present, numbers in range, port free when it
/// was probed, output directory on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingJobConfig {
    pub(crate) identity: Identity,
    pub(crate) paths: JobPaths,
    pub(crate) hardware: Hardware,
    pub(crate) batching: Batching,
    pub(crate) limits: SequenceLimits,
    pub(crate) schedule: Schedule,
    pub(crate) checkpointing: CheckpointPolicy,
    pub(crate) flags: Flags,
    pub(crate) lora: LoraSettings,
    pub(crate) tensorboard: Tensorboard,
    pub(crate) seed: u64,
}

impl TrainingJobConfig {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn mode(&self) -> TrainingMode {
        self.identity.mode
    }

    #[must_use]
    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    #[must_use]
    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    #[must_use]
    pub fn batching(&self) -> &Batching {
        &self.batching
    }

    #[must_use]
    pub fn limits(&self) -> &SequenceLimits {
        &self.limits
    }

    #[must_use]
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    #[must_use]
    pub fn checkpointing(&self) -> &CheckpointPolicy {
        &self.checkpointing
    }

    #[must_use]
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    #[must_use]
    pub fn lora(&self) -> &LoraSettings {
        &self.lora
    }

    #[must_use]
    pub fn tensorboard(&self) -> &Tensorboard {
        &self.tensorboard
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Samples consumed per optimizer step across all devices.
    #[must_use]
    pub fn global_batch_size(&self) -> u64 {
        u64::from(self.batching.per_device_train_batch_size)
            * self.hardware.world_size() as u64
            * u64::from(self.batching.gradient_accumulation_steps)
    }
}
