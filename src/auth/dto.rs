use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::UserId;

/// Request body for self-service registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Request body for a password change by the logged-in user.
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Request body for starting account recovery.
#[derive(Debug, Deserialize)]
pub struct RecoveryRequest {
    pub identifier: String,
}

/// Request body for finishing recovery with the delivered token.
#[derive(Debug, Deserialize)]
pub struct CompleteRecoveryRequest {
    pub token: String,
    pub new_password: String,
}

/// Returned after login and rotation. `token` is the full bearer value.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub session_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub must_change_password: bool,
}

#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub message: &'static str,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: UserId,
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
