use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BotError>;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid repository URL: {0}")]
    InvalidRepoUrl(String),
    #[error("no release binary found for {os}/{arch}")]
    NoCompatibleBinary { os: String, arch: String },
    #[error("download failed: {0}")]
    Download(String),
    #[error("plugin metadata probe failed: {0}")]
    ProbeFailed(String),
    #[error("plugin {0} not found, install it first")]
    PluginNotFound(String),
    #[error("plugin binary not found: {}", .0.display())]
    BinaryMissing(std::path::PathBuf),
    #[error("plugin {0} is already running")]
    AlreadyRunning(String),
    #[error("plugin {0} is not running")]
    NotRunning(String),
    #[error("port pool exhausted (min: {min}, max: {max})")]
    PortExhausted { min: u16, max: u16 },
    #[error("plugin {name} failed to become ready after {attempts} attempts")]
    StartupTimeout { name: String, attempts: u32 },
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BotError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tonic::Status> for BotError {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc(status.message().to_string())
    }
}

impl From<tonic::transport::Error> for BotError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Rpc(err.to_string())
    }
}
