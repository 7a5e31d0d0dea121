use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::EXTERNAL_FIFO_LENGTH;
use super::error::ConfigError;

/// Structure representing the acquisition configuration: crate geometry for
/// the hardware gateway plus the console's run options.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Physical slot of each module, in module order.
    pub slots: Vec<u8>,
    pub output_directory: PathBuf,
    pub filename_prefix: String,
    pub output_title: String,
    pub next_run_number: u32,
    /// Output format id: 0 = ldf, 1 = pld, 2 = root.
    pub output_format: u32,
    /// Drain threshold as a percentage of the FIFO depth.
    pub fifo_threshold_percent: u32,
    pub broadcast_address: String,
    pub boot_fast: bool,
    pub is_quiet: bool,
    pub debug_mode: bool,
    pub shm_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: vec![2],
            output_directory: PathBuf::from("./"),
            filename_prefix: String::from("run"),
            output_title: String::from("PIXIE data file"),
            next_run_number: 1,
            output_format: 0,
            fifo_threshold_percent: 50,
            broadcast_address: String::from("127.0.0.1:5555"),
            boot_fast: false,
            is_quiet: false,
            debug_mode: false,
            shm_mode: false,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// The drain threshold in words, derived from the configured percentage
    /// of the per-module FIFO depth.
    pub fn thresh_words(&self) -> u32 {
        (EXTERNAL_FIFO_LENGTH as u64 * self.fifo_threshold_percent as u64 / 100) as u32
    }
}
