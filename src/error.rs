use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrainpipeError {
    #[error("stream is closed")]
    AlreadyClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("interrupted: {0}")]
    Interrupted(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("write of {len} bytes exceeds buffer capacity {capacity}")]
    OversizedWrite { len: usize, capacity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DrainpipeError {
    pub fn compression<T: fmt::Display>(msg: T) -> Self {
        DrainpipeError::Compression(msg.to_string())
    }

    pub fn worker<T: fmt::Display>(msg: T) -> Self {
        DrainpipeError::Worker(msg.to_string())
    }

    pub fn invalid_argument<T: fmt::Display>(msg: T) -> Self {
        DrainpipeError::InvalidArgument(msg.to_string())
    }
}

impl From<DrainpipeError> for io::Error {
    fn from(err: DrainpipeError) -> Self {
        match err {
            DrainpipeError::Io(e) => e,
            DrainpipeError::Interrupted(msg) => io::Error::new(io::ErrorKind::Interrupted, msg),
            other => io::Error::other(other.to_string()),
        }
    }
}

pub type DrainpipeResult<T> = Result<T, DrainpipeError>;
