// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use crate::api::JobId;
use std::time::Duration;
use tokio::sync::AcquireError;

/// Comprehensive error type for Curate Client operations.
///
/// Variants fall into four groups which callers usually want to tell apart:
///
/// - **Transient transport failures** ([`Error::HttpError`] on connect or
///   timeout, [`Error::Api`] / [`Error::FileTransfer`] with a 5xx or 429
///   status). These are retried by the [`RetryPolicy`][crate::RetryPolicy]
///   and only surface once attempts are exhausted.
/// - **Terminal request failures** (any other 4xx, invalid parameters,
///   missing credentials). Surfaced on the first attempt.
/// - **Local asset failures** ([`Error::LocalAsset`]), scoped to a single
///   item of a bulk upload and reported as data in its
///   [`UploadResult`][crate::UploadResult].
/// - **Wait timeouts** ([`Error::Timeout`]). The remote job keeps running
///   and can be waited on again later.
///
/// A partially failed batch is never an error: it is carried as data in the
/// per-item upload results and in the job's result payload.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// HTTP request error from the reqwest client.
    HttpError(reqwest::Error),
    /// URL parsing error.
    UrlParseError(url::ParseError),
    /// The Curate API answered with a non-success status.
    Api {
        /// HTTP status code.
        status: u16,
        /// Machine readable error code or type, when the body carried one.
        code: Option<String>,
        /// Human readable message, or the raw body for unrecognized shapes.
        message: String,
    },
    /// A presigned file-storage request answered with a non-success status.
    FileTransfer {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        message: String,
    },
    /// A local asset is missing, unreadable or too large.
    LocalAsset {
        /// Key of the asset descriptor.
        key: String,
        /// What went wrong with the asset.
        message: String,
    },
    /// A downloaded body exceeded the byte limit of the download.
    PayloadTooLarge {
        /// The limit in bytes.
        limit: u64,
        /// Announced or observed size, when known.
        size: Option<u64>,
    },
    /// The same asset key appears more than once in a batch.
    DuplicateKey(String),
    /// No access key or team name was configured.
    MissingCredentials(String),
    /// Waiting for a job exceeded its deadline. The job is not cancelled.
    Timeout {
        /// The job that was being waited on.
        job_id: JobId,
        /// How long the caller waited.
        elapsed: Duration,
    },
    /// The operation was cancelled by the caller.
    Cancelled,
    /// Semaphore acquisition error for concurrent operations.
    SemaphoreError(AcquireError),
    /// Async task join error.
    JoinError(tokio::task::JoinError),
    /// Server returned an invalid or unexpected response.
    InvalidResponse(String),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// Invalid asset URL.
    InvalidUrl(String),
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } | Error::FileTransfer { status, .. } => Some(*status),
            Error::HttpError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Returns true when the [`RetryPolicy`][crate::RetryPolicy] would
    /// attempt the failed operation again.
    pub fn is_retryable(&self) -> bool {
        crate::retry::classify(self) == crate::retry::Classification::Retryable
    }

    /// Returns true for a job wait that gave up before the job finished.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpError(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParseError(err)
    }
}

impl From<AcquireError> for Error {
    fn from(err: AcquireError) -> Self {
        Error::SemaphoreError(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::JoinError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::HttpError(e) => write!(f, "HTTP error: {}", e),
            Error::UrlParseError(e) => write!(f, "URL parse error: {}", e),
            Error::Api {
                status,
                code: Some(code),
                message,
            } => write!(f, "API error {} ({}): {}", status, code, message),
            Error::Api {
                status, message, ..
            } => write!(f, "API error {}: {}", status, message),
            Error::FileTransfer { status, message } => {
                write!(f, "File transfer error {}: {}", status, message)
            }
            Error::LocalAsset { key, message } => {
                write!(f, "Local asset error for '{}': {}", key, message)
            }
            Error::PayloadTooLarge {
                limit,
                size: Some(size),
            } => write!(f, "Payload of {} bytes exceeds the {} byte limit", size, limit),
            Error::PayloadTooLarge { limit, .. } => {
                write!(f, "Payload exceeds the {} byte limit", limit)
            }
            Error::DuplicateKey(key) => write!(f, "Duplicate asset key in batch: {}", key),
            Error::MissingCredentials(s) => write!(f, "Missing credentials: {}", s),
            Error::Timeout { job_id, elapsed } => write!(
                f,
                "Timed out after {:.1}s waiting for job {}",
                elapsed.as_secs_f64(),
                job_id
            ),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::SemaphoreError(e) => write!(f, "Semaphore error: {}", e),
            Error::JoinError(e) => write!(f, "Task join error: {}", e),
            Error::InvalidResponse(s) => write!(f, "Invalid server response: {}", s),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::InvalidUrl(s) => write!(f, "Invalid URL: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::HttpError(e) => Some(e),
            Error::UrlParseError(e) => Some(e),
            Error::SemaphoreError(e) => Some(e),
            Error::JoinError(e) => Some(e),
            _ => None,
        }
    }
}
