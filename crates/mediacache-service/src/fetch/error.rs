use std::error::Error;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why a resource could not be turned into a local file.
///
/// The error is `Clone` so that a single failed fetch can be reported to every waiter, and
/// it is kept by the fetcher as the final outcome: a failed fetch is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source does not exist or cannot be accessed.
    ///
    /// This covers unparseable locators, missing files, revoked content access and HTTP
    /// `404`/`401`/`403` responses.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Bytes could not be transferred, e.g. on connection loss or an unexpected server response.
    #[error("transfer failed: {0}")]
    TransferFailure(String),
    /// The download did not finish within the configured bound.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch was cancelled before it finished.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Builds a [`TransferFailure`](Self::TransferFailure) from the root cause of `error`.
    fn transfer_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }
        Self::TransferFailure(error.to_string())
    }

    /// The tag value used when reporting this error to metrics.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            FetchError::SourceUnavailable(_) => "unavailable",
            FetchError::TransferFailure(_) => "transfer",
            FetchError::Timeout(_) => "timeout",
            FetchError::Cancelled => "cancelled",
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                Self::SourceUnavailable(error.to_string())
            }
            _ => Self::transfer_error(&error),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_builder() {
            return Self::SourceUnavailable(error.to_string());
        }
        Self::transfer_error(&error)
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_cancelled() {
            Self::Cancelled
        } else {
            Self::TransferFailure(error.to_string())
        }
    }
}
