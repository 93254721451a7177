//! Translation of a job config into the runtime's command line and environment.

use crate::job::{TrainingJobConfig, TrainingMode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";

/// Everything needed to start the runtime except the runtime program itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInvocation {
    /// Arguments for the runtime launcher, placed before the entry point.
    pub launcher_args: Vec<String>,
    pub entry_point: PathBuf,
    /// Arguments for the training script, placed after the entry point.
    pub script_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Default)]
struct ArgList(Vec<String>);

impl ArgList {
    fn value(&mut self, flag: &str, value: impl Display) -> &mut Self {
        self.0.push(format!("--{flag}"));
        self.0.push(value.to_string());
        self
    }

    fn path(&mut self, flag: &str, path: &Path) -> &mut Self {
        self.value(flag, path.display())
    }

    /// Store-true switches only appear when set.
    fn switch(&mut self, flag: &str, on: bool) -> &mut Self {
        if on {
            self.0.push(format!("--{flag}"));
        }
        self
    }
}

impl RuntimeInvocation {
    #[must_use]
    pub fn from_config(config: &TrainingJobConfig) -> Self {
        let hardware = config.hardware();
        // The DeepSpeed runner drops CUDA_VISIBLE_DEVICES once any device
        // flag is given, so the device list is passed as an include filter.
        let launcher_args = vec![
            "--include".to_string(),
            format!("localhost:{}", hardware.visible_devices()),
            "--master_port".to_string(),
            hardware.master_port.to_string(),
        ];

        let script_args = match config.mode() {
            TrainingMode::Retrieval => retrieval_args(config),
            TrainingMode::Ranking => ranking_args(config),
        };

        let env = BTreeMap::from([
            (VISIBLE_DEVICES_VAR.to_string(), hardware.visible_devices()),
            (MASTER_PORT_VAR.to_string(), hardware.master_port.to_string()),
        ]);

        Self { launcher_args, entry_point: config.paths().entry_point.clone(), script_args, env }
    }

    /// The full argument vector after the runtime program.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = self.launcher_args.clone();
        args.push(self.entry_point.display().to_string());
        args.extend(self.script_args.iter().cloned());
        args
    }

    /// A copy-pasteable shell rendering, environment first.
    #[must_use]
    pub fn command_line(&self, program: &str) -> String {
        let env = self.env.iter().map(|(k, v)| format!("{k}={}", quote(v)));
        let args = self.args();
        let args = args.iter().map(|a| quote(a));
        env.chain(std::iter::once(quote(program))).chain(args).collect::<Vec<_>>().join(" ")
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ',' | '=' | ':' | '+'));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// The runtime reads `--lora_path none` as "no adapter".
fn lora_arg(config: &TrainingJobConfig) -> String {
    config.paths().lora_path.as_ref().map_or_else(|| "none".to_string(), |p| p.display().to_string())
}

fn retrieval_args(config: &TrainingJobConfig) -> Vec<String> {
    let paths = config.paths();
    let batching = config.batching();
    let mut args = ArgList::default();

    args.value("project_name", &config.identity().project_name)
        .path("train_data", &paths.in_data_dir(&paths.train_file));
    if let Some(doc) = &paths.doc_file {
        args.path("doc_data", &paths.in_data_dir(doc));
    }
    if paths.dev_file.is_some() {
        warn!("dev_file is not used by the retrieval script and will not be passed");
    }
    args.value("lora_path", lora_arg(config))
        .path("model_name_or_path", &paths.model_path)
        .value("per_device_train_batch_size", batching.per_device_train_batch_size)
        .value("per_device_eval_batch_size", batching.per_device_eval_batch_size)
        .value("train_group_size", batching.train_group_size)
        .value("gradient_accumulation_steps", batching.gradient_accumulation_steps)
        .value("query_max_len", config.limits().query_max_len)
        .value("passage_max_len", config.limits().passage_max_len);
    common_tail(&mut args, config);
    args.0
}

fn ranking_args(config: &TrainingJobConfig) -> Vec<String> {
    let paths = config.paths();
    let batching = config.batching();
    let flags = config.flags();
    let lora = config.lora();
    let mut args = ArgList::default();

    args.value("project_name", &config.identity().project_name)
        .path("train_dataset_path", &paths.in_data_dir(&paths.train_file));
    if let Some(dev) = &paths.dev_file {
        args.path("dev_dataset_path", &paths.in_data_dir(dev));
    }
    if paths.doc_file.is_some() {
        warn!("doc_file is not used by the ranking script and will not be passed");
    }
    args.path("model_name_or_path", &paths.model_path)
        .value("model_name", &config.identity().model_name)
        .value("lora_path", lora_arg(config))
        .value("per_device_train_batch_size", batching.per_device_train_batch_size)
        .value("per_device_eval_batch_size", batching.per_device_eval_batch_size)
        .value("gradient_accumulation_steps", batching.gradient_accumulation_steps)
        .value("max_prompt_len", config.limits().query_max_len)
        .value("max_completion_len", config.limits().passage_max_len)
        .value("use_4bit", u8::from(flags.use_4bit))
        .value("debug_code", u8::from(flags.debug_code));
    common_tail(&mut args, config);
    args.switch("offload", flags.offload)
        .switch("disable_dropout", flags.disable_dropout)
        .switch("enable_tensorboard", config.tensorboard().enabled)
        .path("tensorboard_path", &config.tensorboard().path)
        .value("lora_dim", lora.lora_dim)
        .value("lora_module_name", &lora.lora_module_name)
        .switch("only_optimize_lora", lora.only_optimize_lora)
        .value("lora_learning_rate", lora.lora_learning_rate);
    args.0
}

/// Flags both scripts share, in the order the launch scripts list them.
fn common_tail(args: &mut ArgList, config: &TrainingJobConfig) {
    let checkpointing = config.checkpointing();
    let schedule = config.schedule();

    // `--earystop` is parsed with Python's bool(), so any value reads as true.
    if checkpointing.early_stop {
        args.value("earystop", "True");
    }
    args.value("save_batch_steps", checkpointing.save_batch_steps)
        .value("eary_stop_epoch", checkpointing.early_stop_epoch)
        .value("save_per_epoch", if checkpointing.save_per_epoch { 1 } else { -1 })
        .value("num_train_epochs", schedule.num_train_epochs)
        .value("learning_rate", schedule.learning_rate)
        .value("num_warmup_steps", schedule.num_warmup_steps)
        .value("weight_decay", schedule.weight_decay)
        .value("lr_scheduler_type", schedule.lr_scheduler_type)
        .value("seed", config.seed())
        .value("zero_stage", schedule.zero_stage)
        .path("output_dir", config.paths().output_dir.path())
        .switch("gradient_checkpointing", config.flags().gradient_checkpointing);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::JobBuilder;
    use crate::options::Overrides;
    use crate::port::PortProbe;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    struct AlwaysFree;

    impl PortProbe for AlwaysFree {
        fn is_free(&self, _port: u16) -> bool {
            true
        }
    }

    fn build(overrides: Overrides) -> TrainingJobConfig {
        JobBuilder::new()
            .with_port_probe(&AlwaysFree)
            .build_with_rng(&overrides, &mut StdRng::seed_from_u64(3))
            .unwrap()
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).map(String::as_str)
    }

    fn flags(args: &[String]) -> Vec<&str> {
        args.iter().filter(|a| a.starts_with("--")).map(String::as_str).collect()
    }

    #[test]
    fn test_retrieval_invocation() {
        let temp = TempDir::new().unwrap();
        let config = build(
            Overrides::new()
                .with("data_dir", "/data/emb")
                .with("train_data", "train.jsonl")
                .with("doc_data", "/corpus/docs.jsonl")
                .with("model_name_or_path", "/models/bge-m3")
                .with("entry_point", "run_embedding.py")
                .with("output_dir", temp.path().join("out").to_string_lossy().to_string())
                .with("device_list", "0,1,2,3")
                .with("master_port", 29500)
                .with("gradient_checkpointing", true),
        );

        let inv = RuntimeInvocation::from_config(&config);
        assert_eq!(inv.launcher_args, vec!["--include", "localhost:0,1,2,3", "--master_port", "29500"]);
        assert_eq!(inv.env.get(VISIBLE_DEVICES_VAR).map(String::as_str), Some("0,1,2,3"));
        assert_eq!(inv.env.get(MASTER_PORT_VAR).map(String::as_str), Some("29500"));

        let args = &inv.script_args;
        assert_eq!(flag_value(args, "--train_data"), Some("/data/emb/train.jsonl"));
        assert_eq!(flag_value(args, "--doc_data"), Some("/corpus/docs.jsonl"));
        assert_eq!(flag_value(args, "--lora_path"), Some("none"));
        assert_eq!(flag_value(args, "--save_per_epoch"), Some("-1"));
        assert_eq!(flag_value(args, "--lr_scheduler_type"), Some("cosine"));
        assert_eq!(args.last().map(String::as_str), Some("--gradient_checkpointing"));
        assert!(!args.iter().any(|a| a == "--earystop"));
        assert!(!args.iter().any(|a| a == "--use_4bit"));

        let expected = [
            "--project_name",
            "--train_data",
            "--doc_data",
            "--lora_path",
            "--model_name_or_path",
            "--per_device_train_batch_size",
            "--per_device_eval_batch_size",
            "--train_group_size",
            "--gradient_accumulation_steps",
            "--query_max_len",
            "--passage_max_len",
            "--save_batch_steps",
            "--eary_stop_epoch",
            "--save_per_epoch",
            "--num_train_epochs",
            "--learning_rate",
            "--num_warmup_steps",
            "--weight_decay",
            "--lr_scheduler_type",
            "--seed",
            "--zero_stage",
            "--output_dir",
            "--gradient_checkpointing",
        ];
        assert_eq!(flags(args), expected);
    }

    #[test]
    fn test_ranking_invocation() {
        let temp = TempDir::new().unwrap();
        let config = build(
            Overrides::new()
                .with("mode", "ranking")
                .with("data_dir", "/data/rank")
                .with("train_dataset_path", "train.parquet")
                .with("dev_dataset_path", "dev.parquet")
                .with("model_name_or_path", "/models/qwen2-7b")
                .with("model_name", "qwen2")
                .with("lora_path", "/adapters/prev.bin")
                .with("entry_point", "deepspeed_rank_choice.py")
                .with("output_dir", temp.path().join("out").to_string_lossy().to_string())
                .with("use_4bit", true)
                .with("debug_code", "1")
                .with("earystop", true)
                .with("save_per_epoch", true)
                .with("zero_stage", 2)
                .with("offload", true)
                .with("lora_dim", 16),
        );

        let inv = RuntimeInvocation::from_config(&config);
        let args = &inv.script_args;
        assert_eq!(flag_value(args, "--train_dataset_path"), Some("/data/rank/train.parquet"));
        assert_eq!(flag_value(args, "--dev_dataset_path"), Some("/data/rank/dev.parquet"));
        assert_eq!(flag_value(args, "--model_name"), Some("qwen2"));
        assert_eq!(flag_value(args, "--lora_path"), Some("/adapters/prev.bin"));
        assert_eq!(flag_value(args, "--use_4bit"), Some("1"));
        assert_eq!(flag_value(args, "--debug_code"), Some("1"));
        assert_eq!(flag_value(args, "--earystop"), Some("True"));
        assert_eq!(flag_value(args, "--save_per_epoch"), Some("1"));
        assert_eq!(flag_value(args, "--zero_stage"), Some("2"));
        assert_eq!(flag_value(args, "--max_prompt_len"), Some("500"));
        assert_eq!(flag_value(args, "--lora_dim"), Some("16"));
        assert!(args.iter().any(|a| a == "--offload"));
        assert!(!args.iter().any(|a| a == "--only_optimize_lora"));
        assert!(!args.iter().any(|a| a == "--train_group_size"));
        assert!(!args.iter().any(|a| a == "--query_max_len"));
        assert_eq!(inv.launcher_args[1], "localhost:0");
    }

    #[test]
    fn test_launcher_args_pin_the_selected_devices() {
        let temp = TempDir::new().unwrap();
        let config = build(
            Overrides::new()
                .with("train_file", "train.jsonl")
                .with("doc_file", "docs.jsonl")
                .with("model_path", "/models/bge-m3")
                .with("entry_point", "finetune.py")
                .with("output_dir", temp.path().to_string_lossy().to_string())
                .with("device_list", "2,3"),
        );

        let inv = RuntimeInvocation::from_config(&config);
        assert_eq!(flag_value(&inv.launcher_args, "--include"), Some("localhost:2,3"));
        for count_flag in ["--num_gpus", "--num_nodes", "--exclude"] {
            assert!(!inv.launcher_args.iter().any(|a| a == count_flag), "{count_flag}");
        }
        assert_eq!(inv.env.get(VISIBLE_DEVICES_VAR).map(String::as_str), Some("2,3"));
    }

    #[test]
    fn test_every_config_flag_appears_once() {
        let temp = TempDir::new().unwrap();
        let config = build(
            Overrides::new()
                .with("mode", "ranking")
                .with("train_file", "t.parquet")
                .with("dev_file", "d.parquet")
                .with("model_path", "/m")
                .with("entry_point", "train.py")
                .with("output_dir", temp.path().to_string_lossy().to_string()),
        );
        let inv = RuntimeInvocation::from_config(&config);
        let mut seen = std::collections::HashSet::new();
        for flag in flags(&inv.script_args) {
            assert!(seen.insert(flag), "{flag} emitted twice");
        }
    }

    #[test]
    fn test_command_line_quotes_only_when_needed() {
        let inv = RuntimeInvocation {
            launcher_args: vec!["--include".to_string(), "localhost:0,1".to_string()],
            entry_point: PathBuf::from("train.py"),
            script_args: vec!["--project_name".to_string(), "my run".to_string()],
            env: BTreeMap::from([("MASTER_PORT".to_string(), "12345".to_string())]),
        };
        assert_eq!(
            inv.command_line("deepspeed"),
            "MASTER_PORT=12345 deepspeed --include localhost:0,1 train.py --project_name 'my run'"
        );
    }
}
