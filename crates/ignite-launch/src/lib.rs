//! Ignite Launch
//!
//! Building and starting distributed fine-tuning jobs:
//! - Resolving overrides against documented defaults (`JobBuilder`)
//! - Validating option values and combinations before anything runs
//! - Picking a free master port and preparing the output directory
//! - Rendering the runtime command line and DeepSpeed config
//! - Spawning the runtime and watching it (`ProcessLauncher`, `JobHandle`)

pub mod builder;
pub mod deepspeed;
pub mod device;
pub mod error;
pub mod events;
pub mod invocation;
pub mod job;
pub mod launcher;
pub mod options;
pub mod output;
pub mod port;

pub use builder::{JobBuilder, JobDraft};
pub use device::{DeviceProbe, FixedDevices, NvidiaSmiProbe};
pub use error::{JobError, JobResult, LaunchError, ResourceError, ValidationError};
pub use events::{EventSink, JobEvent, JsonEventSink, NullEventSink, StdoutEventSink};
pub use invocation::RuntimeInvocation;
pub use job::{LaunchId, LrSchedulerType, TrainingJobConfig, TrainingMode, ZeroStage};
pub use launcher::{launch, DeepSpeedLauncher, JobExit, JobHandle, ProcessLauncher, RecordingLauncher, RunningProcess};
pub use options::{OptionName, OverrideValue, Overrides};
pub use output::OutputDir;
pub use port::{PortProbe, TcpPortProbe};
