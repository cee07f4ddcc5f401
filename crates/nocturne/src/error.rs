// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the nocturne server.
#[derive(Debug, Error)]
pub enum NocturneError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Appending to a connection's response buffer would exceed its capacity.
    #[error("Response does not fit in the write buffer")]
    ResponseTooLarge,

    /// The connection table has no room for another descriptor.
    #[error("Connection table is full")]
    TableFull,

    /// Startup configuration was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic or miscellaneous error.
    #[error("Error: {0}")]
    Other(String),
}

impl NocturneError {
    /// True for errors that end a connection but not the server.
    pub fn is_transport(&self) -> bool {
        matches!(self, NocturneError::Io(_) | NocturneError::ResponseTooLarge)
    }
}

pub type NocturneResult<T> = Result<T, NocturneError>;
