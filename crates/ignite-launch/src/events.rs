use crate::job::LaunchId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Milestones of one launch, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    PortSelected { launch_id: LaunchId, port: u16 },
    OutputReady { launch_id: LaunchId, path: PathBuf },
    Spawned { launch_id: LaunchId, pid: u32, command: String },
    Exited { launch_id: LaunchId, code: Option<i32> },
    Terminated { launch_id: LaunchId },
}

impl JobEvent {
    #[must_use]
    pub fn launch_id(&self) -> &LaunchId {
        match self {
            Self::PortSelected { launch_id, .. }
            | Self::OutputReady { launch_id, .. }
            | Self::Spawned { launch_id, .. }
            | Self::Exited { launch_id, .. }
            | Self::Terminated { launch_id } => launch_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: JobEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn on_event(&self, _event: JobEvent) {}
}

/// Human-readable lines on stdout.
#[derive(Debug, Default)]
pub struct StdoutEventSink;

impl EventSink for StdoutEventSink {
    fn on_event(&self, event: JobEvent) {
        let id = short_id(event.launch_id()).to_string();
        match event {
            JobEvent::PortSelected { port, .. } => println!("[ignite:{id}] master port {port}"),
            JobEvent::OutputReady { path, .. } => println!("[ignite:{id}] output dir {}", path.display()),
            JobEvent::Spawned { pid, command, .. } => println!("[ignite:{id}] started pid {pid}: {command}"),
            JobEvent::Exited { code: Some(code), .. } => println!("[ignite:{id}] exited with code {code}"),
            JobEvent::Exited { code: None, .. } => println!("[ignite:{id}] killed by signal"),
            JobEvent::Terminated { .. } => println!("[ignite:{id}] terminated"),
        }
    }
}

/// One JSON object per line on stdout, for scripts and log shippers.
#[derive(Debug, Default)]
pub struct JsonEventSink;

impl EventSink for JsonEventSink {
    fn on_event(&self, event: JobEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize job event"),
        }
    }
}

fn short_id(id: &LaunchId) -> &str {
    id.0.get(..8).unwrap_or(&id.0)
}
