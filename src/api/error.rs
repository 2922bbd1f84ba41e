use crate::admission::limiter::RateLimitError;
use crate::guard::GuardError;
use crate::snowflake::IdError;
use crate::store::StoreError;
use crate::token::TokenError;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::error;

/// JSON error body: `{code, message, timestamp}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub timestamp: u64,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// No usable credentials were presented.
    Unauthorized(String),
    /// A bearer token was presented and rejected.
    InvalidToken(String),
    NotFound(String),
    Locked { retry_after: Duration },
    RateLimited { retry_after: Duration },
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Locked { .. } => StatusCode::LOCKED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(message)
            | Self::Unauthorized(message)
            | Self::InvalidToken(message)
            | Self::NotFound(message) => message.clone(),
            Self::Locked { retry_after } => format!(
                "too many failed login attempts, retry in {}s",
                retry_seconds(*retry_after)
            ),
            Self::RateLimited { retry_after } => format!(
                "too many requests, retry in {}s",
                retry_seconds(*retry_after)
            ),
            // Internal detail stays in the logs.
            Self::Unavailable(_) => "service temporarily unavailable".to_string(),
            Self::Internal(_) => "internal server error".to_string(),
        }
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_seconds(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();

        match &self {
            // RFC 6750: no error code when the request carried no credentials.
            Self::Unauthorized(_) => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Self::InvalidToken(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            Self::Locked { retry_after } | Self::RateLimited { retry_after } => {
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_seconds(*retry_after)),
                );
            }
            Self::Unavailable(detail) => error!("service unavailable: {detail}"),
            Self::Internal(detail) => error!("internal error: {detail}"),
            Self::BadRequest(_) | Self::NotFound(_) => {}
        }

        let body = ErrorBody {
            code: status.as_u16(),
            message: self.message(),
            timestamp: now_millis(),
        };

        (status, headers, Json(body)).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::StoreUnavailable(store) => Self::Unavailable(store.to_string()),
            TokenError::Signing(_) | TokenError::WeakSecret => Self::Internal(err.to_string()),
            TokenError::Malformed
            | TokenError::Expired
            | TokenError::BadSignature
            | TokenError::Revoked
            | TokenError::Invalid
            | TokenError::WrongTokenType => Self::InvalidToken(err.to_string()),
        }
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::LockedAccount { remaining } => Self::Locked {
                retry_after: remaining,
            },
            GuardError::StoreUnavailable(store) => Self::Unavailable(store.to_string()),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { retry_after } => Self::RateLimited { retry_after },
            RateLimitError::StoreUnavailable(store) => Self::Unavailable(store.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

// Extractor rejections would otherwise answer in plain text.
impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        match err {
            IdError::ClockRegression { .. } | IdError::ClockStalled { .. } => {
                Self::Unavailable(err.to_string())
            }
            IdError::Config(_) | IdError::BeforeEpoch | IdError::TimestampOverflow => {
                Self::Internal(err.to_string())
            }
        }
    }
}
