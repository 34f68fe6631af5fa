// Configuration module
// Launch flags (validated once per run) and launcher settings

mod launch;
mod loader;
mod settings;

pub use launch::{
    ConfigError, ConvType, LaunchConfig, LaunchConfigBuilder, Precision, Quantization,
    TrainerOptions, DEFAULT_VISION_TOWER,
};
pub use loader::{load_settings, load_settings_from};
pub use settings::Settings;
