use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Device {addr} error: {message}")]
    Device { addr: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn device(addr: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AppError::Device {
            addr: addr.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
