// src/error.rs
//! Error taxonomy for the ingestion path.
//!
//! Everything here is contained at the component boundary that produced it:
//! a failed source skips that source, a failed job drops that job, a failed
//! push counts as skipped. `NotModified` and duplicate suppression are
//! outcomes, not errors, and live next to the code that produces them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::ingest::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Network failure, timeout or non-2xx from an upstream feed or page.
    #[error("fetch {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    /// Webhook signature missing or mismatched.
    #[error("auth: {0}")]
    Auth(String),

    /// Malformed source URL, disallowed host, unknown subscription input.
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Job outlived its time-to-live before a worker picked it up.
    #[error("job {0} expired before processing")]
    QueueExpired(JobId),

    /// Push send to a single token failed.
    #[error("delivery to {token} failed: {reason}")]
    Delivery { token: String, reason: String },

    /// Upstream document could not be parsed.
    #[error("parse: {0}")]
    Parse(String),

    /// Backing store failure (lock, connection, serialization).
    #[error("store: {0}")]
    Store(String),
}

impl IngestError {
    pub fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn store(reason: impl ToString) -> Self {
        Self::Store(reason.to_string())
    }

    /// Stable short label for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Auth(_) => "auth",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::QueueExpired(_) => "queue_expired",
            Self::Delivery { .. } => "delivery",
            Self::Parse(_) => "parse",
            Self::Store(_) => "store",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Auth(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Fetch { .. } | Self::Delivery { .. } => StatusCode::BAD_GATEWAY,
            Self::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::QueueExpired(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Auth failures carry no detail back to the caller.
        let body = match &self {
            Self::Auth(_) => "forbidden".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}
