//! Error types for the fallible boundaries of the crate.
//!
//! Channel `connect*` calls deliberately return `bool` rather than one of
//! these: admission rejections and transport failures are expected outcomes
//! that surface through [`crate::status::ConnectionStatus`] and logs.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to derive a streaming endpoint from an HTTP base URL.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid base URL {url:?}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("base URL {0:?} has no host")]
    MissingHost(String),
}

/// Errors returned by [`crate::client::ApiClient`] and other
/// [`crate::client::Backend`] implementations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The API returned a non-2xx HTTP status.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    /// The response body was not the expected JSON shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
