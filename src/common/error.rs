use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised while loading configuration and wiring up the application.
#[derive(Error, Debug)]
pub enum PunchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PunchError>;
