use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    /// A turn or append arrived for a call id that was never started.
    #[error("no conversation session for call {0}")]
    UnknownSession(String),
    #[error("language model error: {0}")]
    Model(String),
    #[error("speech synthesis error: {0}")]
    Speech(String),
    #[error("telephony error: {0}")]
    Telephony(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

pub fn handle_error(e: &impl std::error::Error) {
    error!("ERROR: {e}")
}
