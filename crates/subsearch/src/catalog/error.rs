//! Catalog API error types.

use std::time::Duration;

use thiserror::Error;

/// Errors from the external catalog API.
///
/// The discovery engine treats every variant as "abandon this strategy".
/// The distinction between transient and permanent failures matters to the
/// HTTP client's own retry loop and to logging.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The API kept answering 429 after the client's own backoff.
    #[error("Rate limited by catalog API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout, or 5xx.
    #[error("Transient catalog failure: {0}")]
    Transient(String),

    /// The item or listing does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Private, quarantined, or banned community.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Token request failed or the credentials were rejected.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Any other non-success HTTP status.
    #[error("Unexpected status {status} from {path}")]
    Status { status: u16, path: String },

    /// The response body did not have the expected shape.
    #[error("Failed to decode catalog response: {0}")]
    Decode(String),

    /// The client could not be constructed.
    #[error("Catalog client setup failed: {0}")]
    Setup(String),
}

impl CatalogError {
    /// Whether repeating the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CatalogError::RateLimited { .. } | CatalogError::Transient(_)
        )
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CatalogError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            CatalogError::Status {
                status: status.as_u16(),
                path: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
            }
        } else {
            CatalogError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Decode(err.to_string())
    }
}
