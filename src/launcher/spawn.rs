// Worker spawning
//
// Each worker is a re-execution of the launcher binary with the launch flags
// and the distributed environment for its rank. On unix every worker leads
// its own process group so teardown reaches the trainer it starts.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::{LaunchConfig, Settings};
use crate::worker::WorkerEnv;

use super::LaunchError;

/// Everything needed to start one rank
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub env: WorkerEnv,
    pub args: Vec<OsString>,
    pub log_path: Option<PathBuf>,
}

impl WorkerSpec {
    pub fn new(
        config: &LaunchConfig,
        settings: &Settings,
        rank: usize,
        world_size: usize,
        log_dir: Option<&Path>,
    ) -> Self {
        Self {
            env: WorkerEnv {
                rank,
                // Single node: the local rank doubles as the device ordinal
                local_rank: rank,
                world_size,
                master_addr: settings.master_addr.clone(),
                master_port: config.master_port(),
                settings: settings.clone(),
            },
            args: config.to_args(),
            log_path: log_dir.map(|dir| dir.join(format!("rank-{}.log", rank))),
        }
    }

    pub fn rank(&self) -> usize {
        self.env.rank
    }

    /// Shell-like rendering for `--dry_run` output
    pub fn command_line(&self, exe: &Path) -> String {
        let vars = [
            format!("RANK={}", self.env.rank),
            format!("LOCAL_RANK={}", self.env.local_rank),
            format!("WORLD_SIZE={}", self.env.world_size),
            format!("MASTER_ADDR={}", self.env.master_addr),
            format!("MASTER_PORT={}", self.env.master_port),
        ];
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| shell_quote(&a.to_string_lossy()))
            .collect();
        format!(
            "{} {} {}",
            vars.join(" "),
            shell_quote(&exe.display().to_string()),
            args.join(" ")
        )
    }
}

/// Start one worker process
pub fn spawn_worker(exe: &Path, spec: &WorkerSpec) -> Result<Child, LaunchError> {
    let rank = spec.rank();
    let spawn_error = |source: std::io::Error| LaunchError::Spawn { rank, source };

    let mut cmd = Command::new(exe);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    for (key, value) in spec.env.to_vars().map_err(|e| spawn_error(e.into()))? {
        cmd.env(key, value);
    }

    if let Some(log_path) = &spec.log_path {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(spawn_error)?;
        cmd.stdout(Stdio::from(log_file.try_clone().map_err(spawn_error)?))
            .stderr(Stdio::from(log_file));
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(spawn_error)?;

    info!(
        rank,
        pid = ?child.id(),
        log = ?spec.log_path.as_ref().map(|p| p.display().to_string()),
        "Spawned worker"
    );
    debug!(rank, args = ?spec.args, "Worker arguments");

    Ok(child)
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
