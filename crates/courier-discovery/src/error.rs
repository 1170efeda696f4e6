use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("message encoding failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
