// User-friendly error messages
//
// Turns launch failures into actionable messages and maps them onto the
// process exit codes the launcher reports.

use std::fmt;
use std::path::Path;

use crate::launcher::LaunchError;
use crate::rendezvous::RendezvousError;
use crate::worker::WorkerError;

/// Flags or settings failed validation; nothing was spawned
pub const EXIT_CONFIG: u8 = 2;
/// Master port already bound on this host
pub const EXIT_PORT_CONFLICT: u8 = 3;
/// Barrier did not complete (timeout, mismatched peers, early exit)
pub const EXIT_RENDEZVOUS: u8 = 4;
/// Launcher received SIGINT/SIGTERM
pub const EXIT_INTERRUPTED: u8 = 130;

/// Clamp a child's exit code into a non-zero `u8`
pub fn failure_code(code: Option<i32>) -> u8 {
    code.and_then(|c| u8::try_from(c).ok())
        .filter(|c| *c != 0)
        .unwrap_or(1)
}

/// Format a port conflict with helpful suggestions
pub fn port_conflict_error(addr: &str, port: u16) -> String {
    format!(
        "Master port {port} is already in use on {addr}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Another training job is using the same --master_port\n\
        • A previous job is still shutting down\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Find the process holding the port:\n\
           \x1b[36mlsof -i :{port}\x1b[0m\n\n\
        2. Launch with a different port:\n\
           \x1b[36m--master_port {next}\x1b[0m",
        next = port.wrapping_add(1).max(1024),
    )
}

/// Format a missing dataset directory error
pub fn dataset_missing_error(path: &Path) -> String {
    format!(
        "Dataset directory not found: {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check the path passed to --dataset_dir\n\
        2. Relative paths resolve against the launcher's working directory:\n\
           \x1b[36mls -la {}\x1b[0m",
        path.display(),
        path.display()
    )
}

/// Format a checkpoint resolution failure
pub fn checkpoint_not_found_error(version: &str, reason: &str) -> String {
    format!(
        "Checkpoint '{version}' could not be resolved\n\n\
        \x1b[1;33mError:\x1b[0m {reason}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Verify the repository id passed to --version (org/name)\n\
        2. Check network access to the HuggingFace Hub, or pre-download it:\n\
           \x1b[36mhuggingface-cli download {version}\x1b[0m\n\
        3. Pass a local checkpoint directory instead"
    )
}

/// Format a settings file parse error
pub fn config_parse_error(path: &Path, error: &str) -> String {
    format!(
        "Failed to parse settings file {}\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        • Check for missing quotes around strings\n\
        • Check for unclosed brackets []",
        path.display(),
        error
    )
}

/// Format a file not found error
pub fn file_not_found_error(path: &str, description: &str) -> String {
    format!(
        "{} not found: {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        \x1b[36mls -la {}\x1b[0m",
        description, path, path
    )
}

/// Wrap a generic error with a suggestion
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!("{}\n\n\x1b[1;33mSuggestion:\x1b[0m {}", error, suggestion)
}

/// Render a launcher failure for the terminal
pub fn describe_launch_error(error: &LaunchError) -> String {
    match error {
        LaunchError::Rendezvous(RendezvousError::PortConflict { addr, port }) => {
            port_conflict_error(addr, *port)
        }
        LaunchError::Rendezvous(RendezvousError::Timeout { .. }) => wrap_error_with_suggestion(
            error,
            "Workers did not all reach the rendezvous. Check the per-rank logs, \
             or raise rendezvous_timeout_secs (--rdzv_timeout) for slow hosts.",
        ),
        LaunchError::WorkerFailed { log: Some(log), .. }
        | LaunchError::EarlyExit { log: Some(log), .. } => wrap_error_with_suggestion(
            error,
            &format!("Check the worker log:\n   \x1b[36mtail -n 50 {}\x1b[0m", log.display()),
        ),
        _ => error.to_string(),
    }
}

/// Render a worker failure for its log
pub fn describe_worker_error(error: &WorkerError) -> String {
    match error {
        WorkerError::DatasetMissing { path } => dataset_missing_error(path),
        WorkerError::Checkpoint { version, reason } => checkpoint_not_found_error(version, reason),
        WorkerError::TrainerFailed { .. } => wrap_error_with_suggestion(
            error,
            "Out-of-memory failures usually mean --batch_size is too large for the \
             chosen --precision; try a smaller batch or bf16.",
        ),
        _ => error.to_string(),
    }
}
