use thiserror::Error;

#[derive(Error, Debug)]
pub enum FfpilotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input does not exist: {0}")]
    InputNotFound(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Transcoding error: {0}")]
    Process(String),

    #[error("Transcoding timed out: no progress within {0} ms")]
    Timeout(u64),

    #[error("Failed to probe media: {0}")]
    Probe(String),
}

impl FfpilotError {
    /// Clone-able rendition for event payloads; the enum itself holds
    /// non-Clone sources (io errors), so events carry the message.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, FfpilotError>;
