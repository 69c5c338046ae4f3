//! Delivery of password-reset artifacts.

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::info;

use crate::auth::repo_types::User;
use crate::auth::tokens::RawToken;

/// The one response every recovery request gets.
pub const NEUTRAL_RECOVERY_MESSAGE: &str =
    "If the details match an account, recovery instructions will be sent shortly.";

/// Hands a freshly issued reset token to whatever channel reaches the user.
#[async_trait]
pub trait RecoveryNotifier: Send + Sync {
    async fn deliver(
        &self,
        user: &User,
        token: &RawToken,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;
}

/// Records that an artifact was issued. The token itself is never logged.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl RecoveryNotifier for TracingNotifier {
    async fn deliver(
        &self,
        user: &User,
        _token: &RawToken,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        info!(user_id = user.id, %expires_at, "password reset token issued");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn tracing_notifier_accepts_delivery() {
        let user = User {
            id: 3,
            username: "ana".into(),
            password_hash: String::new(),
            must_change_password: false,
            created_at: datetime!(2026-01-01 0:00 UTC),
        };
        TracingNotifier
            .deliver(&user, &RawToken::generate().unwrap(), datetime!(2026-01-01 0:30 UTC))
            .await
            .unwrap();
    }
}
