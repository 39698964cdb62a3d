use thiserror::Error;

/// Errors raised by the shared building blocks.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("short packet offset")]
    ShortPacketOffset,

    #[error("invalid target {0:?}: {1}")]
    InvalidTarget(String, String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
