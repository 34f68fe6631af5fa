// Checkpoint resolution
//
// `--version` names either a local checkpoint directory or a HuggingFace Hub
// repository (`org/name`). Hub checkpoints are checked against the local
// cache when offline, against the Hub API otherwise.

use hf_hub::api::tokio::ApiBuilder;
use hf_hub::Cache;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::WorkerError;

/// Where a checkpoint will be loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    Local(PathBuf),
    Hub { repo_id: String, revision: String },
}

/// How to reach the Hub
#[derive(Debug, Clone, Default)]
pub struct HubAccess {
    pub cache_dir: Option<PathBuf>,
    pub offline: bool,
}

impl HubAccess {
    /// Honours `HF_HUB_OFFLINE=1` in addition to the configured flag
    pub fn from_settings(cache_dir: Option<&Path>, offline: bool) -> Self {
        let env_offline = std::env::var("HF_HUB_OFFLINE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            cache_dir: cache_dir.map(Path::to_path_buf),
            offline: offline || env_offline,
        }
    }

    fn cache(&self) -> Cache {
        match &self.cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::default(),
        }
    }
}

/// A Hub repository id: `name` or `org/name`, no empty segments or spaces
pub fn is_valid_repo_id(id: &str) -> bool {
    let segments: Vec<&str> = id.split('/').collect();
    segments.len() <= 2
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && !segment.starts_with('.')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        })
}

/// Resolve `version` to a loadable checkpoint
pub async fn resolve_checkpoint(
    version: &str,
    hub: &HubAccess,
) -> Result<CheckpointSource, WorkerError> {
    let not_found = |reason: String| WorkerError::Checkpoint {
        version: version.to_string(),
        reason,
    };

    let local = Path::new(version);
    if local.is_dir() {
        info!(path = %local.display(), "Using local checkpoint");
        return Ok(CheckpointSource::Local(local.to_path_buf()));
    }

    if !is_valid_repo_id(version) {
        return Err(not_found(
            "not a local directory and not a valid Hub repository id".to_string(),
        ));
    }

    if hub.offline {
        let cached = hub.cache().model(version.to_string()).get("config.json");
        return match cached {
            Some(path) => {
                debug!(path = %path.display(), "Checkpoint found in hub cache");
                Ok(CheckpointSource::Hub {
                    repo_id: version.to_string(),
                    revision: "main".to_string(),
                })
            }
            None => Err(not_found(
                "offline mode and the checkpoint is not in the local hub cache".to_string(),
            )),
        };
    }

    let mut builder = ApiBuilder::new();
    if let Some(dir) = &hub.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    let api = builder
        .build()
        .map_err(|e| not_found(format!("hub client unavailable: {}", e)))?;

    let info = api
        .model(version.to_string())
        .info()
        .await
        .map_err(|e| not_found(e.to_string()))?;

    info!(repo = version, sha = %info.sha, "Checkpoint resolved on the Hub");
    Ok(CheckpointSource::Hub {
        repo_id: version.to_string(),
        revision: info.sha,
    })
}
