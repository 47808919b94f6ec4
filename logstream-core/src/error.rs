use thiserror::Error;

use crate::log::memory::LogError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Log Error - {0}")]
    Log(String),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("Computation Error - {0}")]
    Computation(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Processor Error - {0}")]
    Processor(String),

    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Failures caused by a shutdown must never be retried or reported as processing failures.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

impl From<LogError> for Error {
    fn from(err: LogError) -> Self {
        Error::Log(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
