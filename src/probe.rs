use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::error::{FfpilotError, Result};

/// Container-level facts reported by the inspection tool. Numeric values
/// arrive as strings on the wire; the accessors below parse them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeFormat {
    pub filename: Option<String>,
    pub format_name: Option<String>,
    pub format_long_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
    pub nb_streams: Option<u32>,
}

impl ProbeFormat {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.as_deref().and_then(|value| value.parse().ok())
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|value| value.parse().ok())
    }

    pub fn bit_rate_bps(&self) -> Option<u64> {
        self.bit_rate.as_deref().and_then(|value| value.parse().ok())
    }
}

/// One elementary stream inside the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub codec_long_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pix_fmt: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
}

impl ProbeStream {
    pub fn is_video(&self) -> bool {
        self.codec_type.as_deref() == Some("video")
    }

    pub fn is_audio(&self) -> bool {
        self.codec_type.as_deref() == Some("audio")
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.as_deref().and_then(|value| value.parse().ok())
    }

    /// Frame rate from the `num/den` rational the tool reports. `0/0` (the
    /// tool's "unknown") yields `None`.
    pub fn frame_rate(&self) -> Option<f64> {
        let raw = self.avg_frame_rate.as_deref()?;
        let (num, den) = match raw.split_once('/') {
            Some((num, den)) => (num.parse::<f64>().ok()?, den.parse::<f64>().ok()?),
            None => (raw.parse::<f64>().ok()?, 1.0),
        };
        if den == 0.0 || num == 0.0 {
            return None;
        }
        Some(num / den)
    }
}

/// Full inspection report for one media file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

impl ProbeReport {
    pub fn first_video(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|stream| stream.is_video())
    }

    pub fn first_audio(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|stream| stream.is_audio())
    }

    /// Container duration, falling back to the longest stream when the
    /// container itself does not report one.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.format.duration_seconds().or_else(|| {
            self.streams
                .iter()
                .filter_map(ProbeStream::duration_seconds)
                .fold(None, |longest, duration| match longest {
                    Some(current) if current >= duration => Some(current),
                    _ => Some(duration),
                })
        })
    }
}

/// Main trait for media inspection operations
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Inspect one media file and return its parsed report
    async fn probe(&self, path: &Path) -> Result<ProbeReport>;

    /// Get inspection tool version information
    async fn version(&self) -> Result<String>;
}

/// Concrete implementation backed by the ffprobe-compatible binary named in
/// the configuration.
pub struct Ffprobe {
    config: ProbeConfig,
}

impl Ffprobe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaProber for Ffprobe {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        info!("Probing {}", path.display());
        let output = Command::new(&self.config.binary_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                debug!("Failed to execute {}: {}", self.config.binary_path, e);
                FfpilotError::Probe(path.to_string_lossy().into_owned())
            })?;

        // Every inspection failure collapses to the one generic error; the
        // tool's own diagnostic only reaches the debug log.
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                "{} exited with {:?}: {}",
                self.config.binary_path,
                output.status.code(),
                stderr.trim()
            );
            return Err(FfpilotError::Probe(path.to_string_lossy().into_owned()));
        }

        let report: ProbeReport = serde_json::from_slice(&output.stdout).map_err(|e| {
            debug!("unparsable inspection output: {}", e);
            FfpilotError::Probe(path.to_string_lossy().into_owned())
        })?;
        debug!(
            "Probe found {} stream(s), duration {:?}",
            report.streams.len(),
            report.duration_seconds()
        );
        Ok(report)
    }

    async fn version(&self) -> Result<String> {
        let output = Command::new(&self.config.binary_path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| {
                FfpilotError::Probe(format!(
                    "Failed to execute {}: {}",
                    self.config.binary_path, e
                ))
            })?;

        if !output.status.success() {
            return Err(FfpilotError::Probe(format!(
                "{} version check failed",
                self.config.binary_path
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("unknown version").to_string())
    }
}

/// Factory for creating prober instances
pub struct ProberFactory;

impl ProberFactory {
    /// Create the default prober implementation (ffprobe-based)
    pub fn create_prober(config: ProbeConfig) -> Box<dyn MediaProber> {
        Box::new(Ffprobe::new(config))
    }
}

/// Inspect a file with the default tool configuration.
pub async fn probe<P: AsRef<Path>>(path: P) -> Result<ProbeReport> {
    Ffprobe::new(ProbeConfig::default())
        .probe(path.as_ref())
        .await
}
