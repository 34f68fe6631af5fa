// Training engine
//
// The worker drives training through `TrainingEngine`. `CommandEngine` is
// the production implementation: it checks inputs, then hands the actual
// training to an external entry point with the launch flags forwarded.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{LaunchConfig, Precision, Quantization, Settings, TrainerOptions};

use super::checkpoint::{resolve_checkpoint, CheckpointSource, HubAccess};
use super::env::WorkerEnv;
use super::WorkerError;

/// What `iterate` found in the dataset directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSummary {
    pub root: PathBuf,
    pub files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Done,
}

/// Narrow interface between the worker loop and whatever trains the model
#[async_trait]
pub trait TrainingEngine: Send {
    /// Make the checkpoint named by `model_version` available
    async fn load(&mut self, model_version: &str) -> Result<(), WorkerError>;

    /// Open the dataset; fails when it is missing, unreadable or empty
    async fn iterate(&mut self, dataset_dir: &Path) -> Result<DatasetSummary, WorkerError>;

    /// Advance training by one unit of work
    async fn step(
        &mut self,
        batch_size: usize,
        precision: Precision,
    ) -> Result<StepOutcome, WorkerError>;
}

/// Argument vector for one trainer run
#[derive(Debug, Clone)]
pub struct TrainerInvocation<'a> {
    pub model_version: &'a str,
    pub dataset_dir: &'a Path,
    pub batch_size: usize,
    pub precision: Precision,
    pub experiment_name: &'a str,
    pub options: &'a TrainerOptions,
    pub local_rank: usize,
}

impl<'a> TrainerInvocation<'a> {
    pub fn for_config(config: &'a LaunchConfig, local_rank: usize) -> Self {
        Self {
            model_version: config.model_version(),
            dataset_dir: config.dataset_dir(),
            batch_size: config.batch_size(),
            precision: config.precision(),
            experiment_name: config.experiment_name(),
            options: config.trainer(),
            local_rank,
        }
    }

    /// `settings.trainer_args` followed by the forwarded flags
    pub fn arguments(&self, settings: &Settings) -> Vec<OsString> {
        let mut args: Vec<OsString> = settings.trainer_args.iter().map(OsString::from).collect();

        let mut flag = |name: &str, value: OsString| {
            args.push(OsString::from(name));
            args.push(value);
        };
        flag("--version", self.model_version.into());
        flag("--dataset_dir", self.dataset_dir.as_os_str().to_owned());
        flag("--precision", self.precision.as_str().into());
        flag("--batch_size", self.batch_size.to_string().into());
        flag("--exp_name", self.experiment_name.into());
        flag("--local_rank", self.local_rank.to_string().into());
        flag("--vision_tower", self.options.vision_tower.as_str().into());
        flag("--lora_r", self.options.lora_r.to_string().into());
        flag("--model_max_length", self.options.model_max_length.to_string().into());
        flag("--image_size", self.options.image_size.to_string().into());
        flag("--conv_type", self.options.conv_type.as_str().into());

        match self.options.quantization {
            Quantization::None => {}
            Quantization::Int8 => args.push("--load_in_8bit".into()),
            Quantization::Int4 => args.push("--load_in_4bit".into()),
        }

        args.extend(self.options.extra_args.iter().map(OsString::from));
        args
    }
}

/// Runs the configured trainer program once per job
pub struct CommandEngine {
    program: String,
    arguments: Vec<OsString>,
    verify_checkpoint: bool,
    hub: HubAccess,
    checkpoint: Option<CheckpointSource>,
    finished: bool,
}

impl CommandEngine {
    pub fn new(env: &WorkerEnv, config: &LaunchConfig) -> Self {
        let settings = &env.settings;
        Self {
            program: settings.trainer_program.clone(),
            arguments: TrainerInvocation::for_config(config, env.local_rank).arguments(settings),
            verify_checkpoint: settings.verify_checkpoint,
            hub: HubAccess::from_settings(settings.hub_cache_dir(), settings.hub_offline),
            checkpoint: None,
            finished: false,
        }
    }

    pub fn checkpoint(&self) -> Option<&CheckpointSource> {
        self.checkpoint.as_ref()
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.arguments
    }
}

#[async_trait]
impl TrainingEngine for CommandEngine {
    async fn load(&mut self, model_version: &str) -> Result<(), WorkerError> {
        if !self.verify_checkpoint {
            debug!(version = model_version, "Checkpoint verification disabled");
            return Ok(());
        }
        self.checkpoint = Some(resolve_checkpoint(model_version, &self.hub).await?);
        Ok(())
    }

    async fn iterate(&mut self, dataset_dir: &Path) -> Result<DatasetSummary, WorkerError> {
        scan_dataset(dataset_dir).await
    }

    async fn step(
        &mut self,
        batch_size: usize,
        precision: Precision,
    ) -> Result<StepOutcome, WorkerError> {
        if self.finished {
            return Ok(StepOutcome::Done);
        }

        info!(
            program = %self.program,
            batch_size,
            precision = %precision,
            "Starting trainer"
        );
        debug!(args = ?self.arguments, "Trainer arguments");

        let mut child = Command::new(&self.program)
            .args(&self.arguments)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::TrainerSpawn {
                program: self.program.clone(),
                source,
            })?;

        let status = child.wait().await.map_err(|source| WorkerError::TrainerSpawn {
            program: self.program.clone(),
            source,
        })?;
        self.finished = true;

        if status.success() {
            info!("Trainer finished");
            Ok(StepOutcome::Done)
        } else {
            warn!(code = ?status.code(), "Trainer exited with failure");
            Err(WorkerError::TrainerFailed {
                code: status.code(),
            })
        }
    }
}

/// Check the dataset directory and count the files below it
pub async fn scan_dataset(dataset_dir: &Path) -> Result<DatasetSummary, WorkerError> {
    let root = dataset_dir.to_path_buf();

    let metadata = match tokio::fs::metadata(&root).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkerError::DatasetMissing { path: root });
        }
        Err(source) => return Err(WorkerError::DatasetUnreadable { path: root, source }),
    };
    if !metadata.is_dir() {
        return Err(WorkerError::DatasetMissing { path: root });
    }

    let scan_root = root.clone();
    let files = tokio::task::spawn_blocking(move || -> Result<usize, std::io::Error> {
        let mut files = 0;
        for entry in WalkDir::new(&scan_root).follow_links(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                files += 1;
            }
        }
        Ok(files)
    })
    .await
    .map_err(|e| WorkerError::DatasetUnreadable {
        path: root.clone(),
        source: std::io::Error::other(e),
    })?
    .map_err(|source| WorkerError::DatasetUnreadable {
        path: root.clone(),
        source,
    })?;

    if files == 0 {
        return Err(WorkerError::DatasetEmpty { path: root });
    }

    info!(dataset = %root.display(), files, "Dataset ready");
    Ok(DatasetSummary { root, files })
}
