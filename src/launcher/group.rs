// Worker group supervision
//
// One monitor task per worker owns its Child and reports the exit on a
// channel. Cancelling the shared token tears the whole group down:
// SIGTERM to each process group, SIGKILL once the grace period runs out.
// Processes a worker leaves in its group are swept the same way.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[cfg(unix)]
const SWEEP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkerExit {
    pub rank: usize,
    /// Exit code; `None` when killed by a signal or never reaped
    pub code: Option<i32>,
    pub success: bool,
}

impl WorkerExit {
    fn from_wait(rank: usize, status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                rank,
                code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                error!(rank, error = %e, "Failed to wait for worker");
                Self {
                    rank,
                    code: None,
                    success: false,
                }
            }
        }
    }
}

pub struct WorkerGroup {
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
    shutdown: CancellationToken,
    grace: Duration,
    running: BTreeSet<usize>,
    monitors: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn new(grace: Duration) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            exits_tx,
            exits_rx,
            shutdown: CancellationToken::new(),
            grace,
            running: BTreeSet::new(),
            monitors: Vec::new(),
        }
    }

    /// Take ownership of a spawned worker
    pub fn adopt(&mut self, rank: usize, child: Child) {
        self.running.insert(rank);
        let monitor = monitor(
            rank,
            child,
            self.shutdown.child_token(),
            self.grace,
            self.exits_tx.clone(),
        );
        self.monitors.push(tokio::spawn(monitor));
    }

    /// Ranks that have not been reported as exited yet
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Wait for the next worker to exit; `None` once every worker has
    pub async fn next_exit(&mut self) -> Option<WorkerExit> {
        if self.running.is_empty() {
            return None;
        }
        let exit = self.exits_rx.recv().await?;
        self.running.remove(&exit.rank);
        Some(exit)
    }

    /// Stop every remaining worker and collect their exits
    pub async fn terminate(&mut self) -> Vec<WorkerExit> {
        if !self.running.is_empty() {
            warn!(remaining = self.running.len(), "Tearing down worker group");
        }
        self.shutdown.cancel();

        let mut exits = Vec::new();
        while let Some(exit) = self.next_exit().await {
            debug!(rank = exit.rank, code = ?exit.code, "Worker stopped");
            exits.push(exit);
        }

        join_all(self.monitors.drain(..)).await;
        exits
    }
}

async fn monitor(
    rank: usize,
    mut child: Child,
    shutdown: CancellationToken,
    grace: Duration,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    // pgid == pid, see `spawn_worker`; read before the child is reaped
    let pgid = child.id();

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown.cancelled() => {
            terminate_child(&mut child, rank);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(rank, grace_secs = grace.as_secs(), "Worker ignored SIGTERM, killing");
                    kill_child(&mut child, rank);
                    child.wait().await
                }
            }
        }
    };

    let _ = exits.send(WorkerExit::from_wait(rank, status));

    if let Some(pgid) = pgid {
        sweep_group(pgid, rank, grace).await;
    }
}

/// A worker's process group does not outlive the worker: whatever is left
/// in it gets SIGTERM, then SIGKILL once `grace` runs out
#[cfg(unix)]
async fn sweep_group(pgid: u32, rank: usize, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(pgid as i32);
    let populated = || killpg(group, None).is_ok();

    if !populated() {
        return;
    }
    debug!(rank, pgid, "Worker left processes behind, terminating them");
    let _ = killpg(group, Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(SWEEP_POLL_INTERVAL).await;
        if !populated() {
            return;
        }
    }

    warn!(rank, pgid, grace_secs = grace.as_secs(), "Worker processes ignored SIGTERM, killing");
    let _ = killpg(group, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn sweep_group(_pgid: u32, _rank: usize, _grace: Duration) {}

#[cfg(unix)]
fn terminate_child(child: &mut Child, rank: usize) {
    signal_group(child, rank, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn kill_child(child: &mut Child, rank: usize) {
    signal_group(child, rank, nix::sys::signal::Signal::SIGKILL);
}

/// Signal the worker's process group (pgid == pid, see `spawn_worker`)
#[cfg(unix)]
fn signal_group(child: &Child, rank: usize, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!(rank, pid, ?signal, error = %e, "Failed to signal worker group");
        }
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child, rank: usize) {
    kill_child(child, rank);
}

#[cfg(not(unix))]
fn kill_child(child: &mut Child, rank: usize) {
    if let Err(e) = child.start_kill() {
        debug!(rank, error = %e, "Failed to kill worker");
    }
}
