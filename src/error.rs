//! Error types for the tskv storage core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Time column {ts_idx} is not a member of index {idx}")]
    TsColumnNotFound { idx: u32, ts_idx: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<snap::Error> for StorageError {
    fn from(err: snap::Error) -> Self {
        StorageError::Corruption(format!("snappy: {}", err))
    }
}
