use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::auth::repo_types::{
    NewUser, RateLimitCounter, ResetTokenRecord, SessionRecord, User, UserId,
};
use crate::error::StoreError;

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError>;
    /// Whether any account exists besides `username` (case-insensitive).
    async fn exists_other_than(&self, username: &str) -> Result<bool, StoreError>;
    async fn create(&self, new: NewUser<'_>) -> Result<User, StoreError>;
    /// Replaces the hash and the forced-change flag unconditionally.
    async fn set_password(
        &self,
        id: UserId,
        password_hash: &str,
        must_change_password: bool,
    ) -> Result<(), StoreError>;
    /// Swaps `old_hash` for `new_hash` only if the stored value is still `old_hash`.
    async fn upgrade_hash(
        &self,
        id: UserId,
        old_hash: &str,
        new_hash: &str,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn insert(&self, session: &SessionRecord) -> Result<(), StoreError>;
    async fn find(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError>;
    /// Advisory; last writer wins.
    async fn touch(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError>;
    async fn revoke(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError>;
    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        except: Option<Uuid>,
        now: OffsetDateTime,
    ) -> Result<u64, StoreError>;
    /// Compare-and-set on the token hash of an active session.
    async fn rotate_token(
        &self,
        session_id: Uuid,
        old_hash: &[u8],
        new_hash: &[u8],
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool, StoreError>;
    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RateLimitRepo: Send + Sync {
    /// Atomically: reset the window if it started strictly before `window_cutoff`,
    /// then count one attempt. Returns the counter after the increment.
    async fn hit(
        &self,
        key: &str,
        action: &str,
        now: OffsetDateTime,
        window_cutoff: OffsetDateTime,
    ) -> Result<RateLimitCounter, StoreError>;
    async fn clear(&self, key: &str, action: &str) -> Result<(), StoreError>;
    async fn delete_windows_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ResetTokenRepo: Send + Sync {
    async fn insert(&self, record: &ResetTokenRecord) -> Result<(), StoreError>;
    /// Marks the token consumed and returns its owner, if it was usable.
    async fn consume(
        &self,
        token_hash: &[u8],
        now: OffsetDateTime,
    ) -> Result<Option<UserId>, StoreError>;
    async fn delete_unusable(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}

/// PostgreSQL implementation of every auth repository.
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn db_span(operation: &'static str) -> tracing::Span {
    tracing::info_span!("db.query", db.system = "postgresql", db.operation = operation)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl UserRepo for PgStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, must_change_password, created_at
            FROM users
            WHERE lower(username) = lower($1)
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .instrument(db_span("SELECT"))
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, must_change_password, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .instrument(db_span("SELECT"))
        .await?;
        Ok(user)
    }

    async fn exists_other_than(&self, username: &str) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM users WHERE lower(username) <> lower($1))",
        )
        .bind(username)
        .fetch_one(&self.db)
        .instrument(db_span("SELECT"))
        .await?;
        Ok(exists)
    }

    async fn create(&self, new: NewUser<'_>) -> Result<User, StoreError> {
        let result = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password_hash, must_change_password)
            VALUES ($1, $2, $3)
            RETURNING id, username, password_hash, must_change_password, created_at
            "#,
        )
        .bind(new.username)
        .bind(new.password_hash)
        .bind(new.must_change_password)
        .fetch_one(&self.db)
        .instrument(db_span("INSERT"))
        .await;

        match result {
            Ok(user) => Ok(user),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Conflict(format!("username {} already exists", new.username)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_password(
        &self,
        id: UserId,
        password_hash: &str,
        must_change_password: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $2, must_change_password = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(password_hash)
        .bind(must_change_password)
        .execute(&self.db)
        .instrument(db_span("UPDATE"))
        .await?;
        Ok(())
    }

    async fn upgrade_hash(
        &self,
        id: UserId,
        old_hash: &str,
        new_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $3
             WHERE id = $1 AND password_hash = $2
            "#,
        )
        .bind(id)
        .bind(old_hash)
        .bind(new_hash)
        .execute(&self.db)
        .instrument(db_span("UPDATE"))
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SessionRepo for PgStore {
    async fn insert(&self, s: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO auth_sessions
                (session_id, user_id, token_hash, created_at, expires_at,
                 revoked_at, last_seen_at, rotated_at, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(s.session_id)
        .bind(s.user_id)
        .bind(&s.token_hash)
        .bind(s.created_at)
        .bind(s.expires_at)
        .bind(s.revoked_at)
        .bind(s.last_seen_at)
        .bind(s.rotated_at)
        .bind(s.user_agent.as_deref())
        .execute(&self.db)
        .instrument(db_span("INSERT"))
        .await?;
        Ok(())
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, user_id, token_hash, created_at, expires_at,
                   revoked_at, last_seen_at, rotated_at, user_agent
            FROM auth_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.db)
        .instrument(db_span("SELECT"))
        .await?;
        Ok(row)
    }

    async fn touch(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError> {
        // Activity only; expires_at is never moved here.
        sqlx::query("UPDATE auth_sessions SET last_seen_at = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(now)
            .execute(&self.db)
            .instrument(db_span("UPDATE"))
            .await?;
        Ok(())
    }

    async fn revoke(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE auth_sessions
               SET revoked_at = $2
             WHERE session_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.db)
        .instrument(db_span("UPDATE"))
        .await?;
        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        except: Option<Uuid>,
        now: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
               SET revoked_at = $2
             WHERE user_id = $1
               AND revoked_at IS NULL
               AND ($3::uuid IS NULL OR session_id <> $3)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(except)
        .execute(&self.db)
        .instrument(db_span("UPDATE"))
        .await?;
        Ok(result.rows_affected())
    }

    async fn rotate_token(
        &self,
        session_id: Uuid,
        old_hash: &[u8],
        new_hash: &[u8],
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
               SET token_hash = $3, rotated_at = $4, expires_at = $5
             WHERE session_id = $1
               AND token_hash = $2
               AND revoked_at IS NULL
               AND expires_at > $4
            "#,
        )
        .bind(session_id)
        .bind(old_hash)
        .bind(new_hash)
        .bind(now)
        .bind(expires_at)
        .execute(&self.db)
        .instrument(db_span("UPDATE"))
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.db)
            .instrument(db_span("DELETE"))
            .await?;
        debug!(deleted = result.rows_affected(), "expired sessions purged");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLimitRepo for PgStore {
    async fn hit(
        &self,
        key: &str,
        action: &str,
        now: OffsetDateTime,
        window_cutoff: OffsetDateTime,
    ) -> Result<RateLimitCounter, StoreError> {
        // The conflicting row is locked for the duration of the upsert, so
        // concurrent attempts on one key serialize here.
        let counter = sqlx::query_as::<_, RateLimitCounter>(
            r#"
            INSERT INTO auth_rate_limits (key, action, attempts, window_started_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (key, action) DO UPDATE SET
                attempts = CASE
                    WHEN auth_rate_limits.window_started_at < $4 THEN 1
                    ELSE auth_rate_limits.attempts + 1
                END,
                window_started_at = CASE
                    WHEN auth_rate_limits.window_started_at < $4 THEN $3
                    ELSE auth_rate_limits.window_started_at
                END
            RETURNING attempts, window_started_at
            "#,
        )
        .bind(key)
        .bind(action)
        .bind(now)
        .bind(window_cutoff)
        .fetch_one(&self.db)
        .instrument(db_span("UPSERT"))
        .await?;
        Ok(counter)
    }

    async fn clear(&self, key: &str, action: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM auth_rate_limits WHERE key = $1 AND action = $2")
            .bind(key)
            .bind(action)
            .execute(&self.db)
            .instrument(db_span("DELETE"))
            .await?;
        Ok(())
    }

    async fn delete_windows_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM auth_rate_limits WHERE window_started_at < $1")
            .bind(cutoff)
            .execute(&self.db)
            .instrument(db_span("DELETE"))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ResetTokenRepo for PgStore {
    async fn insert(&self, r: &ResetTokenRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens
                (token_hash, user_id, created_at, expires_at, consumed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&r.token_hash)
        .bind(r.user_id)
        .bind(r.created_at)
        .bind(r.expires_at)
        .bind(r.consumed_at)
        .execute(&self.db)
        .instrument(db_span("INSERT"))
        .await?;
        Ok(())
    }

    async fn consume(
        &self,
        token_hash: &[u8],
        now: OffsetDateTime,
    ) -> Result<Option<UserId>, StoreError> {
        let user_id = sqlx::query_scalar::<_, UserId>(
            r#"
            UPDATE password_reset_tokens
               SET consumed_at = $2
             WHERE token_hash = $1
               AND consumed_at IS NULL
               AND expires_at > $2
            RETURNING user_id
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .instrument(db_span("UPDATE"))
        .await?;
        Ok(user_id)
    }

    async fn delete_unusable(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM password_reset_tokens WHERE consumed_at IS NOT NULL OR expires_at <= $1",
        )
        .bind(now)
        .execute(&self.db)
        .instrument(db_span("DELETE"))
        .await?;
        Ok(result.rows_affected())
    }
}
