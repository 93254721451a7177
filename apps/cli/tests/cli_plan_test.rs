//! Integration tests for `ignite plan`, `ignite check` and `ignite options`.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ignite(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ignite").unwrap();
    cmd.current_dir(temp.path()).env("HOME", temp.path());
    cmd
}

fn write_ranking_job(temp: &TempDir) -> std::path::PathBuf {
    let path = temp.path().join("job.toml");
    let out = temp.path().join("out");
    std::fs::write(
        &path,
        format!(
            r#"
mode = "ranking"
data_dir = "/data/rank"
train_dataset_path = "train.parquet"
dev_dataset_path = "dev.parquet"
model_name_or_path = "/models/qwen2-7b"
model_name = "qwen2"
entry_point = "deepspeed_rank_choice.py"
output_dir = "{}"
device_list = [0, 1]
per_device_train_batch_size = 4
gradient_accumulation_steps = 2
zero_stage = 2
"#,
            out.display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_plan_json_from_job_file() {
    let temp = TempDir::new().unwrap();
    let job = write_ranking_job(&temp);

    let output = ignite(&temp)
        .args(["plan", "--json", "--no-device-check", "--job"])
        .arg(&job)
        .args(["--per_device_train_batch_size", "8"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["deepspeed"]["train_batch_size"], 8 * 2 * 2);
    assert_eq!(plan["deepspeed"]["zero_optimization"]["stage"], 2);
    assert_eq!(plan["config"]["identity"]["mode"], "ranking");
    assert_eq!(plan["invocation"]["env"]["CUDA_VISIBLE_DEVICES"], "0,1");

    let command = plan["command"].as_str().unwrap();
    assert!(command.contains("--train_dataset_path /data/rank/train.parquet"));
    assert!(command.contains("--model_name qwen2"));
    assert!(command.contains("--use_4bit 0"));
}

#[test]
fn test_plan_human_output() {
    let temp = TempDir::new().unwrap();
    let job = write_ranking_job(&temp);

    ignite(&temp)
        .args(["plan", "--no-device-check", "--job"])
        .arg(&job)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training Job"))
        .stdout(predicate::str::contains("DeepSpeed Config"))
        .stdout(predicate::str::contains("deepspeed_rank_choice.py"));
}

#[test]
fn test_job_file_with_unknown_key() {
    let temp = TempDir::new().unwrap();
    let job = temp.path().join("job.toml");
    std::fs::write(&job, "warmup_ratio = 0.1\n").unwrap();

    ignite(&temp)
        .args(["check", "--job"])
        .arg(&job)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("warmup_ratio"));
}

#[test]
fn test_missing_job_file_is_an_io_error() {
    let temp = TempDir::new().unwrap();
    ignite(&temp).args(["check", "--job", "absent.toml"]).assert().code(4);
}

#[test]
fn test_check_valid_job() {
    let temp = TempDir::new().unwrap();
    let job = write_ranking_job(&temp);

    ignite(&temp)
        .args(["check", "--no-device-check", "--job"])
        .arg(&job)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
    assert!(temp.path().join("out").is_dir());
}

#[test]
fn test_check_reports_batch_size_field() {
    let temp = TempDir::new().unwrap();
    let job = write_ranking_job(&temp);

    ignite(&temp)
        .args(["check", "--no-device-check", "--job"])
        .arg(&job)
        .args(["--per_device_train_batch_size", "0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("per_device_train_batch_size"));
}

#[test]
fn test_options_lists_aliases() {
    let temp = TempDir::new().unwrap();
    ignite(&temp)
        .arg("options")
        .assert()
        .success()
        .stdout(predicate::str::contains("train_file"))
        .stdout(predicate::str::contains("train_dataset_path"))
        .stdout(predicate::str::contains("earystop"));
}

#[test]
fn test_options_json() {
    let temp = TempDir::new().unwrap();
    let output = ignite(&temp).args(["options", "--json"]).output().unwrap();
    assert!(output.status.success());

    let options: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(options.len(), 43);
    let seed = options.iter().find(|o| o["name"] == "seed").unwrap();
    assert_eq!(seed["default"], "1234");
}
