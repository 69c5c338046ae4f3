use std::time::Duration;

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Failures coming out of the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Outcomes surfaced by the auth core. Credential and session variants are
/// deliberately coarse: callers cannot tell which check failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("too many attempts, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("unauthenticated")]
    SessionInvalid,

    #[error("password change required")]
    MustChangePassword,

    #[error("registration is closed")]
    RegistrationClosed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store unavailable")]
    StoreUnavailable(#[source] StoreError),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::StoreUnavailable(err)
    }
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials | AuthError::SessionInvalid => StatusCode::UNAUTHORIZED,
            AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::MustChangePassword | AuthError::RegistrationClosed => StatusCode::FORBIDDEN,
            AuthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AuthError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            AuthError::StoreUnavailable(_) | AuthError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            AuthError::StoreUnavailable(e) => error!(error = %e, "store unavailable"),
            AuthError::Internal(e) => error!(error = ?e, "internal error"),
            _ => {}
        }

        let status = self.status();
        let mut response = (status, Json(json!({ "error": self.public_message() }))).into_response();
        if let AuthError::RateLimited { retry_after } = &self {
            // Round up so clients never retry inside the window.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, v);
            }
        }
        response
    }
}
