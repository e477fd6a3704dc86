// error.rs
use std::{future::Future, time::Duration};

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    response::{IntoResponse, Response},
    Json,
};
use http::{header::RETRY_AFTER, HeaderValue, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Infrastructure failures from the ledger, the counter store or the cache.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome taxonomy of the voting core.
#[derive(Error, Debug)]
pub enum VoteError {
    #[error("poll is not found, not active or has expired")]
    PollUnavailable,

    #[error("option does not belong to this poll")]
    OptionNotFound,

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("voter has already voted in this poll")]
    DuplicateVote,

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl VoteError {
    /// Only infrastructure failures may be retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoteError::StoreUnavailable(_))
    }
}

/// Bounds a store round trip; an elapsed deadline drops the future, which
/// rolls back any open transaction it owned.
pub async fn bounded<T, E, F>(limit: Duration, operation: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| E::from(StoreError::Timeout(limit)))?
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error("poll not found")]
    PollNotFound,

    #[error("only the creator of a poll may do this")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, retry_after) = match &self {
            AppError::Vote(VoteError::PollUnavailable) => {
                (StatusCode::BAD_REQUEST, "POLL_INACTIVE", None)
            }
            AppError::Vote(VoteError::OptionNotFound) => {
                (StatusCode::BAD_REQUEST, "INVALID_OPTION", None)
            }
            AppError::Vote(VoteError::DuplicateVote) => {
                (StatusCode::CONFLICT, "DUPLICATE_VOTE", None)
            }
            AppError::Vote(VoteError::RateLimited { retry_after }) => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                Some(retry_after_secs(*retry_after)),
            ),
            AppError::Vote(VoteError::StoreUnavailable(e)) => {
                tracing::error!("Store unavailable: {e}");
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", Some(1))
            }
            AppError::PollNotFound => (StatusCode::NOT_FOUND, "POLL_NOT_FOUND", None),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", None),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
        };

        let error = match &self {
            AppError::Vote(VoteError::StoreUnavailable(_)) => {
                "Storage is temporarily unavailable".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(ErrorResponse { error, code })).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Vote(VoteError::StoreUnavailable(err))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Whole seconds, rounded up, never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    let secs = if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.max(1)
}
