use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{FfpilotError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub transcode: TranscodeConfig,
    pub probe: ProbeConfig,
}

/// Settings for one transcoding run. A fresh copy is produced per controller
/// instance; nothing here is shared mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Path to the encoder binary
    pub binary_path: String,
    /// Working directory for the spawned process (inherited when unset)
    pub cwd: Option<PathBuf>,
    /// Options applied to the whole invocation, emitted first
    pub global_options: Vec<String>,
    /// Options emitted once, before the first input clause
    pub input_options: Vec<String>,
    /// Options emitted once, before the first output clause
    pub output_options: Vec<String>,
    /// Pass `-y` so existing output files are replaced
    pub overwrite_existing: bool,
    /// Suppress the startup banner on the status channel
    pub hide_banner: bool,
    /// Multiplex several compatible outputs through one encoding pass
    pub tee: bool,
    /// Kill the run after this many milliseconds without a progress sample
    /// (0 disables the watchdog)
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Path to the media inspection binary
    pub binary_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transcode: TranscodeConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            cwd: None,
            global_options: Vec::new(),
            input_options: Vec::new(),
            output_options: Vec::new(),
            overwrite_existing: true,
            hide_banner: true,
            tee: false,
            timeout_ms: 0,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffprobe".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FfpilotError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| FfpilotError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FfpilotError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| FfpilotError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}
