// Launcher module
//
// Turns a validated LaunchConfig into a running multi-process job: world
// size resolution, rendezvous, worker spawning, supervision and teardown.

pub mod devices;
pub mod group;
pub mod job;
pub mod manifest;
pub mod spawn;

pub use group::{WorkerExit, WorkerGroup};
pub use job::{JobReport, LaunchPlan, Launcher};
pub use manifest::{RunArtifacts, RunManifest, RunOutcome};
pub use spawn::{spawn_worker, WorkerSpec};

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::errors;
use crate::rendezvous::RendezvousError;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    #[error("failed to prepare run artifacts: {0:#}")]
    Artifacts(anyhow::Error),

    #[error("failed to spawn worker rank {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker rank {rank} exited before the rendezvous completed (exit code {code:?})")]
    EarlyExit {
        rank: usize,
        code: Option<i32>,
        log: Option<PathBuf>,
    },

    #[error("worker rank {rank} failed (exit code {code:?})")]
    WorkerFailed {
        rank: usize,
        code: Option<i32>,
        log: Option<PathBuf>,
    },

    #[error("launch interrupted by {0}")]
    Interrupted(&'static str),
}

impl LaunchError {
    /// Exit status the launcher process reports for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            LaunchError::Config(_) => errors::EXIT_CONFIG,
            LaunchError::Rendezvous(RendezvousError::PortConflict { .. }) => {
                errors::EXIT_PORT_CONFLICT
            }
            LaunchError::Rendezvous(_) | LaunchError::EarlyExit { .. } => errors::EXIT_RENDEZVOUS,
            LaunchError::WorkerFailed { code, .. } => errors::failure_code(*code),
            LaunchError::Interrupted(_) => errors::EXIT_INTERRUPTED,
            LaunchError::Artifacts(_) | LaunchError::Spawn { .. } => 1,
        }
    }
}
