// Worker environment
//
// A worker is the launcher binary re-executed with the same flags plus the
// standard distributed variables below.

use crate::config::Settings;

use super::WorkerError;

/// Set to `1` on every spawned worker
pub const WORKER_ROLE_VAR: &str = "LISA_LAUNCH_WORKER";
/// Launcher settings, JSON-encoded
pub const SETTINGS_VAR: &str = "LISA_LAUNCH_SETTINGS";
pub const RANK_VAR: &str = "RANK";
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
pub const MASTER_ADDR_VAR: &str = "MASTER_ADDR";
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";

/// True when this process was spawned by the launcher as a worker
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ROLE_VAR)
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Identity and coordinates of one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEnv {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub settings: Settings,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let number = |key: &str| -> Result<usize, WorkerError> {
            let raw = lookup(key)
                .ok_or_else(|| WorkerError::Environment(format!("{} is not set", key)))?;
            raw.trim()
                .parse()
                .map_err(|_| WorkerError::Environment(format!("{} is not a number: {}", key, raw)))
        };

        let rank = number(RANK_VAR)?;
        let local_rank = number(LOCAL_RANK_VAR)?;
        let world_size = number(WORLD_SIZE_VAR)?;
        let master_port = u16::try_from(number(MASTER_PORT_VAR)?)
            .map_err(|_| WorkerError::Environment(format!("{} is out of range", MASTER_PORT_VAR)))?;

        if rank >= world_size {
            return Err(WorkerError::Environment(format!(
                "rank {} is outside a world of {}",
                rank, world_size
            )));
        }

        let master_addr = lookup(MASTER_ADDR_VAR)
            .ok_or_else(|| WorkerError::Environment(format!("{} is not set", MASTER_ADDR_VAR)))?;

        let settings = match lookup(SETTINGS_VAR) {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                WorkerError::Environment(format!("{} is malformed: {}", SETTINGS_VAR, e))
            })?,
            None => Settings::default(),
        };

        Ok(Self {
            rank,
            local_rank,
            world_size,
            master_addr,
            master_port,
            settings,
        })
    }

    /// Environment handed to a worker process, in spawn order
    pub fn to_vars(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        Ok(vec![
            (WORKER_ROLE_VAR, "1".to_string()),
            (RANK_VAR, self.rank.to_string()),
            (LOCAL_RANK_VAR, self.local_rank.to_string()),
            (WORLD_SIZE_VAR, self.world_size.to_string()),
            (MASTER_ADDR_VAR, self.master_addr.clone()),
            (MASTER_PORT_VAR, self.master_port.to_string()),
            (SETTINGS_VAR, serde_json::to_string(&self.settings)?),
        ])
    }
}
