use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use serde_json::json;

use crate::store::StoreError;

/// Why a token or handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureKind {
    MissingToken,
    MalformedToken,
    InvalidToken,
    ExpiredToken,
    UnknownSession,
}

impl fmt::Display for AuthFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingToken => "missing token",
            Self::MalformedToken => "malformed token",
            Self::InvalidToken => "invalid token",
            Self::ExpiredToken => "expired token",
            Self::UnknownSession => "unknown session",
        })
    }
}

/// Typed error taxonomy for every operation the service exposes.
///
/// Kinds, not prose: callers dispatch on the variant, the message is only
/// for logs and client display.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("auth failure: {0}")]
    AuthFailure(AuthFailureKind),
    #[error("not authorized for this room")]
    NotAuthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("transient upstream failure: {0}")]
    Transient(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Store(_) | Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            log::error!("request failed: {self}");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
