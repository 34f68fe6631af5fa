// Launcher settings
//
// Everything the job needs that is not part of the per-run flag set:
// worker count, rendezvous timeout, artifact location, trainer entry point.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Workers to spawn; when unset accelerator detection decides
    pub nproc_per_node: Option<usize>,

    /// Address the rendezvous listener binds and workers connect to
    pub master_addr: String,

    /// How long the startup barrier waits for every rank (default: 300)
    pub rendezvous_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL during teardown (default: 10)
    pub shutdown_grace_secs: u64,

    /// Root for per-experiment run directories
    pub runs_dir: PathBuf,

    /// Redirect each worker's output to `<run_dir>/logs/rank-N.log`
    pub log_to_files: bool,

    /// Resolve the checkpoint before starting the trainer
    pub verify_checkpoint: bool,

    /// HuggingFace cache override (default: the hub's own default)
    pub hub_cache_dir: Option<PathBuf>,

    /// Resolve checkpoints from the local hub cache only
    pub hub_offline: bool,

    /// Training entry point, e.g. `python3`
    pub trainer_program: String,

    /// Arguments placed before the forwarded flags, e.g. `train_ds.py`
    pub trainer_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nproc_per_node: None,
            master_addr: "127.0.0.1".to_string(),
            rendezvous_timeout_secs: 300,
            shutdown_grace_secs: 10,
            runs_dir: PathBuf::from("runs"),
            log_to_files: true,
            verify_checkpoint: true,
            hub_cache_dir: None,
            hub_offline: false,
            trainer_program: "python3".to_string(),
            trainer_args: vec!["train_ds.py".to_string()],
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nproc_per_node == Some(0) {
            return Err(ConfigError::NoWorkers);
        }
        if self.master_addr.trim().is_empty() {
            return Err(ConfigError::Empty("master address"));
        }
        if self.rendezvous_timeout_secs == 0 {
            return Err(ConfigError::Zero("rendezvous timeout"));
        }
        if self.trainer_program.trim().is_empty() {
            return Err(ConfigError::Empty("trainer program"));
        }
        Ok(())
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Directory holding the artifacts of one experiment
    pub fn run_dir(&self, experiment_name: &str) -> PathBuf {
        self.runs_dir.join(experiment_name)
    }

    pub fn hub_cache_dir(&self) -> Option<&Path> {
        self.hub_cache_dir.as_deref()
    }
}
