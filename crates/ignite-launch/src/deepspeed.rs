//! DeepSpeed engine config for a job.
//!
//! The training scripts build this dictionary themselves at startup. Rendering
//! it here lets `plan` show exactly what the engine will be initialised with.

use crate::job::TrainingJobConfig;
use serde_json::{json, Value};

const STEPS_PER_PRINT: u32 = 10;
const GRADIENT_CLIPPING: f64 = 1.0;
/// The ranking script hard-codes its tensorboard run name.
const TENSORBOARD_RUN: &str = "step1_model";

#[must_use]
pub fn train_config(config: &TrainingJobConfig) -> Value {
    let offload_device = if config.flags().offload { "cpu" } else { "none" };
    let tensorboard = config.tensorboard();

    json!({
        "train_batch_size": config.global_batch_size(),
        "train_micro_batch_size_per_gpu": config.batching().per_device_train_batch_size,
        "steps_per_print": STEPS_PER_PRINT,
        "zero_optimization": {
            "stage": config.schedule().zero_stage.as_u8(),
            "offload_param": { "device": offload_device },
            "offload_optimizer": { "device": offload_device },
            "stage3_param_persistence_threshold": 1e4,
            "stage3_max_live_parameters": 3e7,
            "stage3_prefetch_bucket_size": 3e7,
            "memory_efficient_linear": false,
        },
        "fp16": { "enabled": true, "loss_scale_window": 100 },
        "bfloat16": { "enabled": false, "loss_scale_window": 100 },
        "gradient_clipping": GRADIENT_CLIPPING,
        "prescale_gradients": false,
        "wall_clock_breakdown": false,
        "hybrid_engine": {
            "enabled": false,
            "max_out_tokens": 512,
            "inference_tp_size": 1,
            "release_inference_cache": false,
            "pin_parameters": true,
            "tp_gather_partition_size": 8,
        },
        "tensorboard": {
            "enabled": tensorboard.enabled,
            "output_path": format!("{}/ds_tensorboard_logs/", tensorboard.path.display()),
            "job_name": format!("{TENSORBOARD_RUN}_tensorboard"),
        },
    })
}
