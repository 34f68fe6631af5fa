// Accelerator detection
//
// Decides the world size when settings do not pin it: CUDA_VISIBLE_DEVICES
// first, then `nvidia-smi -L`, then a single CPU worker.

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Settings};

/// Number of workers to spawn for this job
pub async fn resolve_world_size(settings: &Settings) -> Result<usize, ConfigError> {
    if let Some(nproc) = settings.nproc_per_node {
        if nproc == 0 {
            return Err(ConfigError::NoWorkers);
        }
        info!(nproc, "Using configured worker count");
        return Ok(nproc);
    }

    let detected = detect_accelerators().await;
    if detected == 0 {
        warn!("No accelerator devices detected, starting a single worker");
        return Ok(1);
    }

    info!(devices = detected, "One worker per detected accelerator");
    Ok(detected)
}

/// Count accelerator devices visible to this process
pub async fn detect_accelerators() -> usize {
    if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
        let count = count_visible_devices(&visible);
        debug!(visible = %visible, count, "Devices from CUDA_VISIBLE_DEVICES");
        return count;
    }

    match Command::new("nvidia-smi").arg("-L").output().await {
        Ok(output) if output.status.success() => {
            count_nvidia_smi_devices(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            debug!(status = %output.status, "nvidia-smi reported an error");
            0
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi not available");
            0
        }
    }
}

/// Parse a CUDA_VISIBLE_DEVICES value
///
/// An empty value, `-1` or `NoDevFiles` hides every device. Entries after
/// the first invalid one are ignored, matching the CUDA runtime.
pub fn count_visible_devices(value: &str) -> usize {
    let value = value.trim();
    if value.is_empty() || value == "NoDevFiles" {
        return 0;
    }

    value
        .split(',')
        .map(str::trim)
        .take_while(|entry| !entry.is_empty() && !entry.starts_with('-'))
        .count()
}

/// Count `GPU n: ...` lines in `nvidia-smi -L` output
pub fn count_nvidia_smi_devices(output: &str) -> usize {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_devices_parsing() {
        assert_eq!(count_visible_devices("0,1,2,3"), 4);
        assert_eq!(count_visible_devices("2"), 1);
        assert_eq!(count_visible_devices("GPU-8a1b,GPU-99cd"), 2);
        assert_eq!(count_visible_devices(""), 0);
        assert_eq!(count_visible_devices("-1"), 0);
        assert_eq!(count_visible_devices("NoDevFiles"), 0);
        assert_eq!(count_visible_devices("0,1,-1,3"), 2);
    }

    #[test]
    fn test_nvidia_smi_parsing() {
        let output = "GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-1)\n\
                      GPU 1: NVIDIA A100-SXM4-80GB (UUID: GPU-2)\n";
        assert_eq!(count_nvidia_smi_devices(output), 2);
        assert_eq!(count_nvidia_smi_devices("No devices were found\n"), 0);
    }

    #[tokio::test]
    async fn test_configured_worker_count_wins() {
        let settings = Settings {
            nproc_per_node: Some(3),
            ..Settings::default()
        };
        assert_eq!(resolve_world_size(&settings).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let settings = Settings {
            nproc_per_node: Some(0),
            ..Settings::default()
        };
        assert_eq!(
            resolve_world_size(&settings).await,
            Err(ConfigError::NoWorkers)
        );
    }
}
