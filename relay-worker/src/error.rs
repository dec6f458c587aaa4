use std::collections::BTreeSet;

use relay_common::intake::IntakeError;
use reqwest::StatusCode;
use thiserror::Error;

/// Enumeration of configuration problems detected after reading the environment.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not a supported connector")]
    UnknownConnector(String),
    #[error("{0} is not a supported intake mode")]
    UnknownIntakeMode(String),
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Enumeration of errors returned by vendor HTTP APIs.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("error parsing api url: {0}")]
    ParseUrlError(#[from] url::ParseError),
    #[error("request to {url} failed: {error}")]
    RequestError { url: String, error: reqwest::Error },
    #[error("{url} answered with status {status}")]
    StatusError { url: String, status: StatusCode },
    #[error("not authorized to call {url}: status {status}")]
    UnauthorizedError { url: String, status: StatusCode },
    #[error("failed to authenticate against {authority}: {reason}")]
    AuthenticationError { authority: String, reason: String },
    #[error("failed to decode response from {url}: {error}")]
    DecodeError { url: String, error: reqwest::Error },
}

impl ApiError {
    /// Systemic errors will fail every subsequent call until an operator intervenes.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            ApiError::UnauthorizedError { .. } | ApiError::AuthenticationError { .. }
        )
    }
}

/// Enumeration of errors ending a pull cycle or a streaming consumer.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("vendor api error: {0}")]
    ApiError(#[from] ApiError),
    #[error("connection to {url} failed: {reason}")]
    ConnectionError { url: String, reason: String },
    #[error("connection to {url} was closed by the server")]
    ConnectionClosed { url: String },
    #[error("event queue is closed")]
    QueueClosed,
}

/// Raised when the required vendor subscriptions could not all be activated.
#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("failed to activate subscriptions for {}", .content_types.iter().cloned().collect::<Vec<_>>().join(", "))]
    SubscriptionsError { content_types: BTreeSet<String> },
    #[error("failed to list active subscriptions: {0}")]
    ListError(#[from] ApiError),
}

/// Enumeration of errors preventing a relay from running.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("subscription activation failed: {0}")]
    ActivationError(#[from] ActivationError),
    #[error("failed to set up the intake: {0}")]
    IntakeError(#[from] IntakeError),
    #[error("failed to set up the source: {0}")]
    SourceError(#[from] SourceError),
}
