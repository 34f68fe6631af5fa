// Command-line flags
//
// Flag names follow the training script (`--master_port`, `--exp_name`, ...).
// `--version` is the checkpoint identifier, so clap's version flag is off.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{
    ConfigError, ConvType, LaunchConfig, Precision, Quantization, Settings, TrainerOptions,
    DEFAULT_VISION_TOWER,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "lisa-launch")]
#[command(about = "Distributed fine-tuning launcher for LISA segmentation models")]
#[command(disable_version_flag = true)]
pub struct Args {
    /// Rendezvous port on the master host
    #[arg(long = "master_port", allow_negative_numbers = true)]
    pub master_port: i64,

    /// Checkpoint: HuggingFace repository id or local directory
    #[arg(long = "version")]
    pub version: String,

    /// Root directory of the training datasets
    #[arg(long = "dataset_dir")]
    pub dataset_dir: PathBuf,

    #[arg(long = "precision", value_enum)]
    pub precision: Precision,

    /// Per-device batch size
    #[arg(long = "batch_size", allow_negative_numbers = true)]
    pub batch_size: i64,

    /// Experiment tag; artifacts go to <runs_dir>/<exp_name>
    #[arg(long = "exp_name")]
    pub exp_name: String,

    /// Workers to spawn (default: one per visible accelerator)
    #[arg(long = "nproc_per_node")]
    pub nproc_per_node: Option<usize>,

    #[arg(long = "master_addr")]
    pub master_addr: Option<String>,

    /// Seconds the startup barrier waits for every rank
    #[arg(long = "rdzv_timeout")]
    pub rdzv_timeout: Option<u64>,

    #[arg(long = "runs_dir")]
    pub runs_dir: Option<PathBuf>,

    /// Launcher settings file (default: ~/.lisa-launch/config.toml)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Print the launch plan without binding or spawning anything
    #[arg(long = "dry_run")]
    pub dry_run: bool,

    #[arg(long = "vision_tower", default_value = DEFAULT_VISION_TOWER)]
    pub vision_tower: String,

    /// LoRA rank
    #[arg(long = "lora_r", default_value_t = 8)]
    pub lora_r: usize,

    #[arg(long = "model_max_length", default_value_t = 512)]
    pub model_max_length: usize,

    #[arg(long = "image_size", default_value_t = 1024)]
    pub image_size: usize,

    #[arg(long = "conv_type", value_enum, default_value = "llava_v1")]
    pub conv_type: ConvType,

    #[arg(long = "load_in_8bit", conflicts_with = "load_in_4bit")]
    pub load_in_8bit: bool,

    #[arg(long = "load_in_4bit")]
    pub load_in_4bit: bool,

    /// Passed verbatim to the trainer (after `--`)
    #[arg(last = true)]
    pub trainer_args: Vec<String>,
}

impl Args {
    /// Validate the flags into a launch configuration
    pub fn launch_config(&self) -> Result<LaunchConfig, ConfigError> {
        let quantization = if self.load_in_8bit {
            Quantization::Int8
        } else if self.load_in_4bit {
            Quantization::Int4
        } else {
            Quantization::None
        };

        LaunchConfig::builder()
            .model_version(&self.version)
            .dataset_dir(&self.dataset_dir)
            .precision(self.precision)
            .batch_size(self.batch_size)
            .experiment_name(&self.exp_name)
            .master_port(self.master_port)
            .trainer(TrainerOptions {
                vision_tower: self.vision_tower.clone(),
                lora_r: self.lora_r,
                model_max_length: self.model_max_length,
                image_size: self.image_size,
                conv_type: self.conv_type,
                quantization,
                extra_args: self.trainer_args.clone(),
            })
            .build()
    }

    /// Flags take precedence over the settings file
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(n) = self.nproc_per_node {
            settings.nproc_per_node = Some(n);
        }
        if let Some(addr) = &self.master_addr {
            settings.master_addr = addr.clone();
        }
        if let Some(secs) = self.rdzv_timeout {
            settings.rendezvous_timeout_secs = secs;
        }
        if let Some(dir) = &self.runs_dir {
            settings.runs_dir = dir.clone();
        }
    }
}
