use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaloError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

pub type Result<T> = std::result::Result<T, HaloError>;
