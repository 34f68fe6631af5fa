// Launch configuration
//
// The flag set every worker receives. Built once from literal CLI values,
// validated at construction, immutable afterwards.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Default CLIP vision tower used by LISA checkpoints
pub const DEFAULT_VISION_TOWER: &str = "openai/clip-vit-large-patch14";

/// Errors raised while validating launch flags or launcher settings
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch size must be a positive integer, got {0}")]
    InvalidBatchSize(i64),

    #[error("master port must be within 1..=65535, got {0}")]
    InvalidPort(i64),

    #[error("experiment name must be a single directory name, got {0:?}")]
    InvalidExperimentName(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Numeric precision used by the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Bf16,
    Fp16,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Bf16 => "bf16",
            Precision::Fp16 => "fp16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation template the trainer formats prompts with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ConvType {
    #[value(name = "llava_v1")]
    #[serde(rename = "llava_v1")]
    LlavaV1,
    #[value(name = "llava_llama_2")]
    #[serde(rename = "llava_llama_2")]
    LlavaLlama2,
}

impl ConvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvType::LlavaV1 => "llava_v1",
            ConvType::LlavaLlama2 => "llava_llama_2",
        }
    }
}

/// Weight quantization applied when the checkpoint is loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    None,
    #[serde(rename = "8bit")]
    Int8,
    #[serde(rename = "4bit")]
    Int4,
}

/// Model-side options forwarded untouched to the training entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerOptions {
    pub vision_tower: String,
    pub lora_r: usize,
    pub model_max_length: usize,
    pub image_size: usize,
    pub conv_type: ConvType,
    pub quantization: Quantization,
    /// Arguments after `--` on the command line, passed verbatim
    pub extra_args: Vec<String>,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            vision_tower: DEFAULT_VISION_TOWER.to_string(),
            lora_r: 8,
            model_max_length: 512,
            image_size: 1024,
            conv_type: ConvType::LlavaV1,
            quantization: Quantization::None,
            extra_args: Vec::new(),
        }
    }
}

impl TrainerOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.vision_tower.trim().is_empty() {
            return Err(ConfigError::Empty("vision tower"));
        }
        if self.lora_r == 0 {
            return Err(ConfigError::Zero("lora_r"));
        }
        if self.model_max_length == 0 {
            return Err(ConfigError::Zero("model_max_length"));
        }
        if self.image_size == 0 {
            return Err(ConfigError::Zero("image_size"));
        }
        Ok(())
    }
}

/// Validated launch configuration
///
/// Only obtainable through [`LaunchConfigBuilder::build`], so every instance
/// satisfies `batch_size > 0`, `master_port` in `1..=65535` and non-empty
/// identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    model_version: String,
    #[serde(serialize_with = "serialize_path_lossy")]
    dataset_dir: PathBuf,
    precision: Precision,
    batch_size: usize,
    experiment_name: String,
    master_port: u16,
    trainer: TrainerOptions,
}

impl LaunchConfig {
    pub fn builder() -> LaunchConfigBuilder {
        LaunchConfigBuilder::default()
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    pub fn master_port(&self) -> u16 {
        self.master_port
    }

    pub fn trainer(&self) -> &TrainerOptions {
        &self.trainer
    }

    /// Hex SHA-256 over every field, used by the rendezvous to check that all
    /// workers parsed the same configuration.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |name: &str, value: &[u8]| {
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value);
        };

        field("version", self.model_version.as_bytes());
        field("dataset_dir", self.dataset_dir.as_os_str().as_encoded_bytes());
        field("precision", self.precision.as_str().as_bytes());
        field("batch_size", &(self.batch_size as u64).to_le_bytes());
        field("exp_name", self.experiment_name.as_bytes());
        field("master_port", &self.master_port.to_le_bytes());
        field("vision_tower", self.trainer.vision_tower.as_bytes());
        field("lora_r", &(self.trainer.lora_r as u64).to_le_bytes());
        field("model_max_length", &(self.trainer.model_max_length as u64).to_le_bytes());
        field("image_size", &(self.trainer.image_size as u64).to_le_bytes());
        field("conv_type", self.trainer.conv_type.as_str().as_bytes());
        let quantization: &[u8] = match self.trainer.quantization {
            Quantization::None => b"none",
            Quantization::Int8 => b"8bit",
            Quantization::Int4 => b"4bit",
        };
        field("quantization", quantization);
        for arg in &self.trainer.extra_args {
            field("extra", arg.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    /// Command-line flags that reproduce this configuration
    ///
    /// Workers are re-executions of the launcher binary; they receive their
    /// configuration through exactly these arguments.
    pub fn to_args(&self) -> Vec<OsString> {
        let flags: [(&str, OsString); 11] = [
            ("--master_port", self.master_port.to_string().into()),
            ("--version", self.model_version.as_str().into()),
            ("--dataset_dir", self.dataset_dir.clone().into_os_string()),
            ("--precision", self.precision.as_str().into()),
            ("--batch_size", self.batch_size.to_string().into()),
            ("--exp_name", self.experiment_name.as_str().into()),
            ("--vision_tower", self.trainer.vision_tower.as_str().into()),
            ("--lora_r", self.trainer.lora_r.to_string().into()),
            ("--model_max_length", self.trainer.model_max_length.to_string().into()),
            ("--image_size", self.trainer.image_size.to_string().into()),
            ("--conv_type", self.trainer.conv_type.as_str().into()),
        ];
        let mut args: Vec<OsString> = flags
            .into_iter()
            .flat_map(|(name, value)| [OsString::from(name), value])
            .collect();

        match self.trainer.quantization {
            Quantization::None => {}
            Quantization::Int8 => args.push("--load_in_8bit".into()),
            Quantization::Int4 => args.push("--load_in_4bit".into()),
        }

        if !self.trainer.extra_args.is_empty() {
            args.push("--".into());
            args.extend(self.trainer.extra_args.iter().map(OsString::from));
        }

        args
    }
}

/// Manifests are JSON, so a non-UTF-8 path is recorded lossily
fn serialize_path_lossy<S: serde::Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.to_string_lossy())
}

/// A run directory name: exactly one normal path component
fn is_plain_directory_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Collects raw flag values; `build` enforces the invariants
#[derive(Debug, Clone)]
pub struct LaunchConfigBuilder {
    model_version: String,
    dataset_dir: PathBuf,
    precision: Precision,
    batch_size: i64,
    experiment_name: String,
    master_port: i64,
    trainer: TrainerOptions,
}

impl Default for LaunchConfigBuilder {
    fn default() -> Self {
        Self {
            model_version: String::new(),
            dataset_dir: PathBuf::new(),
            precision: Precision::Bf16,
            batch_size: 0,
            experiment_name: String::new(),
            master_port: 0,
            trainer: TrainerOptions::default(),
        }
    }
}

impl LaunchConfigBuilder {
    pub fn model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn dataset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dataset_dir = dir.into();
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn experiment_name(mut self, name: impl Into<String>) -> Self {
        self.experiment_name = name.into();
        self
    }

    pub fn master_port(mut self, port: i64) -> Self {
        self.master_port = port;
        self
    }

    pub fn trainer(mut self, trainer: TrainerOptions) -> Self {
        self.trainer = trainer;
        self
    }

    pub fn build(self) -> Result<LaunchConfig, ConfigError> {
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::Empty("model version"));
        }
        if self.dataset_dir.as_os_str().is_empty() {
            return Err(ConfigError::Empty("dataset directory"));
        }
        if self.experiment_name.trim().is_empty() {
            return Err(ConfigError::Empty("experiment name"));
        }
        if !is_plain_directory_name(&self.experiment_name) {
            return Err(ConfigError::InvalidExperimentName(self.experiment_name));
        }

        let batch_size = usize::try_from(self.batch_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::InvalidBatchSize(self.batch_size))?;

        let master_port = u16::try_from(self.master_port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or(ConfigError::InvalidPort(self.master_port))?;

        self.trainer.validate()?;

        if master_port < 1024 {
            tracing::warn!(
                port = master_port,
                "Master port is privileged; binding it usually requires elevated permissions"
            );
        }

        Ok(LaunchConfig {
            model_version: self.model_version,
            dataset_dir: self.dataset_dir,
            precision: self.precision,
            batch_size,
            experiment_name: self.experiment_name,
            master_port,
            trainer: self.trainer,
        })
    }
}
