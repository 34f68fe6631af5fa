// Run artifacts
//
// `<runs_dir>/<exp_name>/launch.json` records what was launched and how it
// ended; per-rank logs live next to it under `logs/`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{LaunchConfig, Settings};

use super::group::WorkerExit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub config: LaunchConfig,
    pub digest: String,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub trainer_program: String,
    pub trainer_args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub exits: Vec<WorkerExit>,
}

/// Run directory of one launch
pub struct RunArtifacts {
    dir: PathBuf,
    manifest: RunManifest,
}

impl RunArtifacts {
    /// Create the run directory and write the initial manifest
    pub fn prepare(
        settings: &Settings,
        config: &LaunchConfig,
        world_size: usize,
        digest: &str,
    ) -> Result<Self> {
        let dir = settings.run_dir(config.experiment_name());
        if dir.join("launch.json").exists() {
            warn!(
                dir = %dir.display(),
                "Run directory already holds a launch; artifacts of experiment '{}' will be overwritten",
                config.experiment_name()
            );
        }

        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;

        if settings.log_to_files {
            let log_dir = dir.join("logs");
            fs::create_dir_all(&log_dir)
                .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
        }

        let manifest = RunManifest {
            run_id: Uuid::new_v4(),
            config: config.clone(),
            digest: digest.to_string(),
            world_size,
            master_addr: settings.master_addr.clone(),
            master_port: config.master_port(),
            trainer_program: settings.trainer_program.clone(),
            trainer_args: settings.trainer_args.clone(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Running,
            error: None,
            exits: Vec::new(),
        };

        let artifacts = Self { dir, manifest };
        artifacts.write()?;
        info!(run_id = %artifacts.manifest.run_id, dir = %artifacts.dir.display(), "Run directory ready");
        Ok(artifacts)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("launch.json")
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// Record the final outcome
    pub fn finish(
        &mut self,
        outcome: RunOutcome,
        error: Option<String>,
        mut exits: Vec<WorkerExit>,
    ) -> Result<()> {
        exits.sort_by_key(|exit| exit.rank);
        self.manifest.finished_at = Some(Utc::now());
        self.manifest.outcome = outcome;
        self.manifest.error = error;
        self.manifest.exits = exits;
        self.write()
    }

    fn write(&self) -> Result<()> {
        let path = self.manifest_path();
        let json = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use tempfile::TempDir;

    fn config() -> LaunchConfig {
        LaunchConfig::builder()
            .model_version("org/model-v1")
            .dataset_dir("./dataset")
            .precision(Precision::Bf16)
            .batch_size(1)
            .experiment_name("run-a")
            .master_port(24999)
            .build()
            .unwrap()
    }

    #[test]
    fn test_manifest_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            runs_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        };

        let mut artifacts = RunArtifacts::prepare(&settings, &config(), 2, "digest").unwrap();
        assert_eq!(artifacts.dir(), tmp.path().join("run-a"));
        assert!(tmp.path().join("run-a/logs").is_dir());

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(artifacts.manifest_path()).unwrap()).unwrap();
        assert_eq!(written["outcome"], "running");
        assert_eq!(written["world_size"], 2);
        assert_eq!(written["config"]["precision"], "bf16");

        artifacts
            .finish(
                RunOutcome::Failed,
                Some("worker rank 1 failed".to_string()),
                vec![
                    WorkerExit { rank: 1, code: Some(1), success: false },
                    WorkerExit { rank: 0, code: Some(0), success: true },
                ],
            )
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(artifacts.manifest_path()).unwrap()).unwrap();
        assert_eq!(written["outcome"], "failed");
        assert_eq!(written["exits"][0]["rank"], 0);
        assert_eq!(written["exits"][1]["code"], 1);
        assert!(written["finished_at"].is_string());
    }

    #[test]
    fn test_logs_disabled_skips_log_dir() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            runs_dir: tmp.path().to_path_buf(),
            log_to_files: false,
            ..Settings::default()
        };

        RunArtifacts::prepare(&settings, &config(), 1, "digest").unwrap();
        assert!(tmp.path().join("run-a/launch.json").is_file());
        assert!(!tmp.path().join("run-a/logs").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_dataset_dir_recorded() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            runs_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        };
        let config = LaunchConfig::builder()
            .model_version("org/model-v1")
            .dataset_dir(Path::new(OsStr::from_bytes(b"/data/lisa-\xff")))
            .precision(Precision::Bf16)
            .batch_size(1)
            .experiment_name("run-a")
            .master_port(24999)
            .build()
            .unwrap();

        let artifacts = RunArtifacts::prepare(&settings, &config, 1, "digest").unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(artifacts.manifest_path()).unwrap()).unwrap();
        assert_eq!(written["config"]["dataset_dir"], "/data/lisa-\u{fffd}");
    }
}
