//! Error types for the vmm-export core library.

use crate::client::Envelope;

/// The main error type for vmm-export operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DSM answered with `success: false`.
    #[error("DSM error from {api}.{method}{}", code_suffix(.code))]
    Remote {
        api: String,
        method: String,
        code: Option<i64>,
        envelope: Box<Envelope>,
    },

    /// The request did not complete within its timeout.
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    /// Transport-level failure (connection refused, bad status, ...).
    #[error("HTTP error: {message}")]
    Http { message: String },

    /// The response body was not the JSON shape we expected.
    #[error("Malformed DSM response: {message}")]
    Decode { message: String },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A worker thread panicked.
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// The run is shutting down; the waiting operation was abandoned.
    #[error("Operation cancelled")]
    Cancelled,
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" (code {c})")).unwrap_or_default()
}

/// A specialized Result type for vmm-export operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a remote protocol error from a failed envelope.
    pub fn remote(api: impl Into<String>, method: impl Into<String>, envelope: Envelope) -> Self {
        Self::Remote {
            api: api.into(),
            method: method.into(),
            code: envelope.error_code(),
            envelope: Box::new(envelope),
        }
    }

    /// Create a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Create an HTTP error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a worker error.
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// DSM error code, if this is a remote protocol error that carried one.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        if source.is_timeout() {
            let url = source
                .url()
                .map(|u| u.path().to_string())
                .unwrap_or_default();
            Self::timeout(url)
        } else {
            Self::http(source.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::decode(source.to_string())
    }
}
