// Worker role
//
// join rendezvous -> load checkpoint -> open dataset -> step until done.

pub mod checkpoint;
pub mod engine;
pub mod env;

pub use engine::{CommandEngine, DatasetSummary, StepOutcome, TrainingEngine};
pub use env::{is_worker_process, WorkerEnv};

use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::config::LaunchConfig;
use crate::errors;
use crate::rendezvous::{self, RendezvousError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid worker environment: {0}")]
    Environment(String),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    #[error("checkpoint '{version}' could not be resolved: {reason}")]
    Checkpoint { version: String, reason: String },

    #[error("dataset directory not found: {}", path.display())]
    DatasetMissing { path: PathBuf },

    #[error("dataset directory unreadable: {}: {source}", path.display())]
    DatasetUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset directory contains no files: {}", path.display())]
    DatasetEmpty { path: PathBuf },

    #[error("failed to run trainer '{program}': {source}")]
    TrainerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("trainer exited with code {code:?}")]
    TrainerFailed { code: Option<i32> },
}

impl WorkerError {
    /// Trainer failures propagate the trainer's code, everything else is 1
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkerError::TrainerFailed { code } => errors::failure_code(*code),
            _ => 1,
        }
    }
}

/// Drive one rank from rendezvous to the end of training
pub async fn run<E: TrainingEngine>(
    env: &WorkerEnv,
    config: &LaunchConfig,
    engine: &mut E,
) -> Result<(), WorkerError> {
    let world_size = rendezvous::join(
        &env.master_addr,
        env.master_port,
        env.rank,
        env.world_size,
        &config.digest(),
        env.settings.rendezvous_timeout(),
    )
    .await?;
    info!(world_size, "Released by rendezvous");

    engine.load(config.model_version()).await?;
    let dataset = engine.iterate(config.dataset_dir()).await?;
    info!(files = dataset.files, "Dataset opened");

    let mut steps = 0usize;
    loop {
        match engine.step(config.batch_size(), config.precision()).await? {
            StepOutcome::Continue => steps += 1,
            StepOutcome::Done => break,
        }
    }

    info!(steps = steps + 1, "Training complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Precision, Settings};
    use crate::rendezvous::RendezvousServer;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedEngine {
        calls: Vec<String>,
        steps_before_done: usize,
        fail_iterate: bool,
    }

    #[async_trait]
    impl TrainingEngine for ScriptedEngine {
        async fn load(&mut self, model_version: &str) -> Result<(), WorkerError> {
            self.calls.push(format!("load {}", model_version));
            Ok(())
        }

        async fn iterate(&mut self, dataset_dir: &Path) -> Result<DatasetSummary, WorkerError> {
            self.calls.push("iterate".to_string());
            if self.fail_iterate {
                return Err(WorkerError::DatasetMissing {
                    path: dataset_dir.to_path_buf(),
                });
            }
            Ok(DatasetSummary {
                root: dataset_dir.to_path_buf(),
                files: 1,
            })
        }

        async fn step(
            &mut self,
            batch_size: usize,
            precision: Precision,
        ) -> Result<StepOutcome, WorkerError> {
            self.calls.push(format!("step {} {}", batch_size, precision));
            if self.steps_before_done == 0 {
                return Ok(StepOutcome::Done);
            }
            self.steps_before_done -= 1;
            Ok(StepOutcome::Continue)
        }
    }

    fn config(port: u16) -> LaunchConfig {
        LaunchConfig::builder()
            .model_version("org/model-v1")
            .dataset_dir("./dataset")
            .precision(Precision::Bf16)
            .batch_size(2)
            .experiment_name("run-a")
            .master_port(port as i64)
            .build()
            .unwrap()
    }

    fn env(port: u16) -> WorkerEnv {
        WorkerEnv {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            master_addr: "127.0.0.1".to_string(),
            master_port: port,
            settings: Settings {
                rendezvous_timeout_secs: 5,
                ..Settings::default()
            },
        }
    }

    #[tokio::test]
    async fn test_worker_runs_engine_in_order() {
        let server = RendezvousServer::bind("127.0.0.1", 0).await.unwrap();
        let port = server.port();
        let config = config(port);
        let digest = config.digest();

        let barrier = server.barrier(1, &digest, Duration::from_secs(5));
        let mut engine = ScriptedEngine {
            steps_before_done: 2,
            ..ScriptedEngine::default()
        };
        let env = env(port);
        let (barrier, worker) = tokio::join!(barrier, run(&env, &config, &mut engine));
        barrier.unwrap();
        worker.unwrap();

        assert_eq!(
            engine.calls,
            vec![
                "load org/model-v1",
                "iterate",
                "step 2 bf16",
                "step 2 bf16",
                "step 2 bf16"
            ]
        );
    }

    #[tokio::test]
    async fn test_dataset_failure_stops_before_training() {
        let server = RendezvousServer::bind("127.0.0.1", 0).await.unwrap();
        let port = server.port();
        let config = config(port);
        let digest = config.digest();

        let barrier = server.barrier(1, &digest, Duration::from_secs(5));
        let mut engine = ScriptedEngine {
            fail_iterate: true,
            ..ScriptedEngine::default()
        };
        let env = env(port);
        let (_, worker) = tokio::join!(barrier, run(&env, &config, &mut engine));

        let err = worker.unwrap_err();
        assert!(matches!(err, WorkerError::DatasetMissing { .. }));
        assert_eq!(err.exit_code(), 1);
        assert!(!engine.calls.iter().any(|c| c.starts_with("step")));
    }

    #[test]
    fn test_trainer_exit_code_propagates() {
        assert_eq!(WorkerError::TrainerFailed { code: Some(9) }.exit_code(), 9);
        assert_eq!(WorkerError::TrainerFailed { code: None }.exit_code(), 1);
    }
}
