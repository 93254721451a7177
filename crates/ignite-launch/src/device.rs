//! Accelerator discovery for the device availability check.

use std::process::Command;
use tracing::debug;

pub trait DeviceProbe {
    /// Number of accelerators on this host, or `None` when it cannot be determined.
    fn device_count(&self) -> Option<usize>;
}

/// Counts GPUs reported by `nvidia-smi -L`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvidiaSmiProbe;

impl DeviceProbe for NvidiaSmiProbe {
    fn device_count(&self) -> Option<usize> {
        let output = match Command::new("nvidia-smi").arg("-L").output() {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(status = %output.status, "nvidia-smi exited unsuccessfully");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                return None;
            }
        };
        Some(count_gpu_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// A fixed device count, for hosts configured by hand and for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedDevices(pub usize);

impl DeviceProbe for FixedDevices {
    fn device_count(&self) -> Option<usize> {
        Some(self.0)
    }
}

fn count_gpu_lines(listing: &str) -> usize {
    listing.lines().filter(|line| line.trim_start().starts_with("GPU ")).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_gpu_lines() {
        let listing = "GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-1)\n\
                       GPU 1: NVIDIA A100-SXM4-80GB (UUID: GPU-2)\n  MIG 1g.10gb Device 0: (UUID: MIG-3)\n";
        assert_eq!(count_gpu_lines(listing), 2);
        assert_eq!(count_gpu_lines(""), 0);
    }

    #[test]
    fn test_fixed_devices() {
        assert_eq!(FixedDevices(8).device_count(), Some(8));
    }
}
