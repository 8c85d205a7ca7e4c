#![forbid(unsafe_code)]

use std::io;

use thiserror::Error;

/// Failure of a single listing or download request. None of these are retried.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Malformed URL, unsupported host, or missing/invalid parameters.
    #[error("{0}")]
    InvalidInput(String),

    /// The extractor could not read metadata or fetch the media.
    #[error("{0}")]
    Extraction(String),

    /// Scratch storage could not be created, written, or read back.
    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }

    pub fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    /// Short machine-readable tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Extraction(_) => "extraction_failure",
            Self::Storage { .. } => "storage_failure",
        }
    }
}
