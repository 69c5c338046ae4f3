use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

pub type UserId = i64;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // self-describing, see auth::password
    pub must_change_password: bool,
    pub created_at: OffsetDateTime,
}

/// Fields needed to provision an account.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
    pub must_change_password: bool,
}

/// One login session. Only the SHA-256 of the bearer token is kept.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub token_hash: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
    pub last_seen_at: Option<OffsetDateTime>,
    pub rotated_at: Option<OffsetDateTime>,
    pub user_agent: Option<String>,
}

impl SessionRecord {
    /// Valid iff not revoked and not past its absolute deadline.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}

/// Attempt counter for one (key, action) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct RateLimitCounter {
    pub attempts: i32,
    pub window_started_at: OffsetDateTime,
}

/// Single-use password reset artifact.
#[derive(Debug, Clone, FromRow)]
pub struct ResetTokenRecord {
    pub token_hash: Vec<u8>,
    pub user_id: UserId,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub consumed_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn session(revoked: bool) -> SessionRecord {
        let created = datetime!(2026-01-01 10:00 UTC);
        SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: 1,
            token_hash: vec![0; 32],
            created_at: created,
            expires_at: created + time::Duration::minutes(30),
            revoked_at: revoked.then_some(created),
            last_seen_at: None,
            rotated_at: None,
            user_agent: None,
        }
    }

    #[test]
    fn active_until_deadline_exclusive() {
        let s = session(false);
        assert!(s.is_active_at(s.created_at));
        assert!(s.is_active_at(s.expires_at - time::Duration::seconds(1)));
        assert!(!s.is_active_at(s.expires_at));
    }

    #[test]
    fn revoked_is_never_active() {
        let s = session(true);
        assert!(!s.is_active_at(s.created_at));
    }

    #[test]
    fn user_hash_not_serialized() {
        let user = User {
            id: 7,
            username: "ana".into(),
            password_hash: "$argon2id$secret".into(),
            must_change_password: false,
            created_at: datetime!(2026-01-01 10:00 UTC),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(json.contains("ana"));
        assert!(!json.contains("argon2id"));
    }
}
