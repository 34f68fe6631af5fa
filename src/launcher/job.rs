// Job orchestration
//
// bind rendezvous -> prepare run dir -> spawn N workers -> barrier ->
// release port to the trainers -> wait for all. Any failure or signal tears
// down the group.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{LaunchConfig, Settings};
use crate::rendezvous::RendezvousServer;
use crate::worker::engine::TrainerInvocation;

use super::devices::resolve_world_size;
use super::group::{WorkerExit, WorkerGroup};
use super::manifest::{RunArtifacts, RunOutcome};
use super::spawn::{spawn_worker, WorkerSpec};
use super::LaunchError;

/// Resolved shape of a launch, before anything is bound or spawned
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub run_dir: PathBuf,
    pub workers: Vec<WorkerSpec>,
}

impl LaunchPlan {
    fn log_path(&self, rank: usize) -> Option<PathBuf> {
        self.workers.get(rank).and_then(|spec| spec.log_path.clone())
    }

    /// Human-readable plan for `--dry_run`
    pub fn render(&self, exe: &Path, config: &LaunchConfig, settings: &Settings) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "World size:    {}", self.world_size);
        let _ = writeln!(out, "Rendezvous:    {}:{}", self.master_addr, self.master_port);
        let _ = writeln!(out, "Run directory: {}", self.run_dir.display());
        let _ = writeln!(out, "Config digest: {}", config.digest());
        for spec in &self.workers {
            let _ = writeln!(out, "\n[rank {}]", spec.rank());
            let _ = writeln!(out, "  worker:  {}", spec.command_line(exe));
            let trainer: Vec<String> = TrainerInvocation::for_config(config, spec.env.local_rank)
                .arguments(settings)
                .into_iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            let _ = writeln!(
                out,
                "  trainer: {} {}",
                settings.trainer_program,
                trainer.join(" ")
            );
            if let Some(log) = &spec.log_path {
                let _ = writeln!(out, "  log:     {}", log.display());
            }
        }
        out
    }
}

/// Outcome of a job in which every worker exited cleanly
#[derive(Debug, Clone)]
pub struct JobReport {
    pub run_id: Uuid,
    pub world_size: usize,
    pub run_dir: PathBuf,
    pub exits: Vec<WorkerExit>,
}

pub struct Launcher {
    config: LaunchConfig,
    settings: Settings,
    worker_exe: PathBuf,
}

impl Launcher {
    /// `worker_exe` is the binary re-executed for each rank, normally
    /// `std::env::current_exe()`
    pub fn new(
        config: LaunchConfig,
        settings: Settings,
        worker_exe: PathBuf,
    ) -> Result<Self, LaunchError> {
        settings.validate()?;
        Ok(Self {
            config,
            settings,
            worker_exe,
        })
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn worker_exe(&self) -> &Path {
        &self.worker_exe
    }

    pub async fn plan(&self) -> Result<LaunchPlan, LaunchError> {
        let world_size = resolve_world_size(&self.settings).await?;
        let run_dir = self.settings.run_dir(self.config.experiment_name());
        let log_dir = self.settings.log_to_files.then(|| run_dir.join("logs"));

        let workers = (0..world_size)
            .map(|rank| {
                WorkerSpec::new(
                    &self.config,
                    &self.settings,
                    rank,
                    world_size,
                    log_dir.as_deref(),
                )
            })
            .collect();

        Ok(LaunchPlan {
            world_size,
            master_addr: self.settings.master_addr.clone(),
            master_port: self.config.master_port(),
            run_dir,
            workers,
        })
    }

    /// Launch the job and block until it ends
    ///
    /// The rendezvous port is bound before any worker is spawned and is
    /// released once the barrier completes or the launch fails.
    pub async fn run(self) -> Result<JobReport, LaunchError> {
        let plan = self.plan().await?;
        let digest = self.config.digest();

        let server =
            RendezvousServer::bind(&self.settings.master_addr, self.config.master_port()).await?;

        let mut artifacts =
            RunArtifacts::prepare(&self.settings, &self.config, plan.world_size, &digest)
                .map_err(LaunchError::Artifacts)?;

        info!(
            version = self.config.model_version(),
            dataset = %self.config.dataset_dir().display(),
            precision = %self.config.precision(),
            batch_size = self.config.batch_size(),
            experiment = self.config.experiment_name(),
            world_size = plan.world_size,
            "Launching training job"
        );

        let mut group = WorkerGroup::new(self.settings.shutdown_grace());
        let mut exits = Vec::new();

        let result = match self.spawn_all(&plan, &mut group) {
            Ok(()) => {
                self.supervise(server, &mut group, &plan, &digest, &mut exits)
                    .await
            }
            Err(e) => {
                drop(server);
                Err(e)
            }
        };

        // Also waits for every worker's process group to be swept
        exits.extend(group.terminate().await);

        let (outcome, error) = match &result {
            Ok(()) => (RunOutcome::Succeeded, None),
            Err(e @ LaunchError::Interrupted(_)) => (RunOutcome::Interrupted, Some(e.to_string())),
            Err(e) => (RunOutcome::Failed, Some(e.to_string())),
        };
        if let Err(e) = artifacts.finish(outcome, error, exits.clone()) {
            warn!(error = %e, "Failed to finalize run manifest");
        }

        result.map(|()| JobReport {
            run_id: artifacts.manifest().run_id,
            world_size: plan.world_size,
            run_dir: artifacts.dir().to_path_buf(),
            exits,
        })
    }

    fn spawn_all(&self, plan: &LaunchPlan, group: &mut WorkerGroup) -> Result<(), LaunchError> {
        for spec in &plan.workers {
            let child = spawn_worker(&self.worker_exe, spec)?;
            group.adopt(spec.rank(), child);
        }
        Ok(())
    }

    /// Barrier, then wait for every worker
    ///
    /// The barrier consumes the rendezvous server, so the master port is
    /// free for the trainers once it releases.
    async fn supervise(
        &self,
        server: RendezvousServer,
        group: &mut WorkerGroup,
        plan: &LaunchPlan,
        digest: &str,
        exits: &mut Vec<WorkerExit>,
    ) -> Result<(), LaunchError> {
        let interrupted = shutdown_signal();
        tokio::pin!(interrupted);

        let (addr, port) = (server.addr().to_string(), server.port());
        let barrier = server.barrier(plan.world_size, digest, self.settings.rendezvous_timeout());
        tokio::pin!(barrier);

        loop {
            tokio::select! {
                biased;
                signal = &mut interrupted => return Err(LaunchError::Interrupted(signal)),
                result = &mut barrier => {
                    result?;
                    break;
                }
                Some(exit) = group.next_exit() => {
                    if exit.success {
                        exits.push(exit);
                        continue;
                    }
                    error!(rank = exit.rank, code = ?exit.code, "Worker exited before rendezvous completed");
                    exits.push(exit.clone());
                    return Err(LaunchError::EarlyExit {
                        rank: exit.rank,
                        code: exit.code,
                        log: plan.log_path(exit.rank),
                    });
                }
            }
        }
        info!(addr = %addr, port, "Rendezvous endpoint released to the trainers");

        info!(world_size = plan.world_size, "Training started on all ranks");

        loop {
            tokio::select! {
                biased;
                signal = &mut interrupted => return Err(LaunchError::Interrupted(signal)),
                exit = group.next_exit() => match exit {
                    None => return Ok(()),
                    Some(exit) if exit.success => {
                        info!(rank = exit.rank, "Worker finished");
                        exits.push(exit);
                    }
                    Some(exit) => {
                        error!(rank = exit.rank, code = ?exit.code, "Worker failed, stopping job");
                        exits.push(exit.clone());
                        return Err(LaunchError::WorkerFailed {
                            rank: exit.rank,
                            code: exit.code,
                            log: plan.log_path(exit.rank),
                        });
                    }
                }
            }
        }
    }
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        "Ctrl+C"
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
