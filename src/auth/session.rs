//! Server-held sessions keyed by an opaque id, proven by a bearer token.
//!
//! Only SHA-256(token) is stored. Validation fails closed on an absent,
//! revoked or expired row and compares digests in constant time. The absolute
//! deadline (`expires_at`) moves only on rotation; touching a session records
//! activity without extending it.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::auth::repo::SessionRepo;
use crate::auth::repo_types::{SessionRecord, UserId};
use crate::auth::tokens::{digests_match, BearerValue, RawToken};
use crate::clock::Clock;
use crate::error::AuthError;

/// Longest client descriptor kept per session.
const MAX_USER_AGENT_LEN: usize = 256;

pub struct SessionStore {
    repo: Arc<dyn SessionRepo>,
    clock: Arc<dyn Clock>,
    ttl: time::Duration,
    rotation_interval: time::Duration,
}

/// A session that passed validation.
#[derive(Debug, Clone)]
pub struct ValidSession {
    pub record: SessionRecord,
    /// The token has been in use longer than the rotation interval.
    pub rotation_due: bool,
}

impl SessionStore {
    pub fn new(
        repo: Arc<dyn SessionRepo>,
        clock: Arc<dyn Clock>,
        ttl: time::Duration,
        rotation_interval: time::Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            ttl,
            rotation_interval,
        }
    }

    #[instrument(skip(self, user_agent))]
    pub async fn create(
        &self,
        user_id: UserId,
        user_agent: Option<&str>,
    ) -> Result<(BearerValue, SessionRecord), AuthError> {
        let now = self.clock.now();
        let token = RawToken::generate()?;
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            user_id,
            token_hash: token.digest(),
            created_at: now,
            expires_at: now + self.ttl,
            revoked_at: None,
            last_seen_at: None,
            rotated_at: None,
            user_agent: user_agent.map(truncate_user_agent),
        };
        self.repo.insert(&record).await?;
        info!(session_id = %record.session_id, user_id, "session created");
        Ok((
            BearerValue {
                session_id: record.session_id,
                token,
            },
            record,
        ))
    }

    /// Resolve a presented bearer value. Every failure is the same `SessionInvalid`.
    pub async fn validate(&self, bearer: &BearerValue) -> Result<ValidSession, AuthError> {
        let now = self.clock.now();
        let record = self.active_record(bearer, now).await?;

        // Advisory; a lost update here is harmless.
        self.repo.touch(record.session_id, now).await?;

        let token_issued_at = record.rotated_at.unwrap_or(record.created_at);
        let rotation_due = now - token_issued_at >= self.rotation_interval;
        Ok(ValidSession {
            record: SessionRecord {
                last_seen_at: Some(now),
                ..record
            },
            rotation_due,
        })
    }

    /// Issue a fresh token under the same session id. The presented token
    /// stops working as soon as the swap commits.
    #[instrument(skip(self, bearer), fields(session_id = %bearer.session_id))]
    pub async fn rotate(&self, bearer: &BearerValue) -> Result<(BearerValue, SessionRecord), AuthError> {
        let now = self.clock.now();
        let record = self.active_record(bearer, now).await?;
        let token = RawToken::generate()?;
        let new_hash = token.digest();
        let expires_at = now + self.ttl;
        let swapped = self
            .repo
            .rotate_token(record.session_id, &record.token_hash, &new_hash, now, expires_at)
            .await?;
        if !swapped {
            // Revoked or rotated by a concurrent request.
            return Err(AuthError::SessionInvalid);
        }
        info!("session token rotated");
        Ok((
            BearerValue {
                session_id: record.session_id,
                token,
            },
            SessionRecord {
                token_hash: new_hash,
                rotated_at: Some(now),
                expires_at,
                ..record
            },
        ))
    }

    /// Idempotent.
    pub async fn revoke(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.repo.revoke(session_id, self.clock.now()).await?;
        info!(%session_id, "session revoked");
        Ok(())
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        except: Option<Uuid>,
    ) -> Result<u64, AuthError> {
        let revoked = self
            .repo
            .revoke_all_for_user(user_id, except, self.clock.now())
            .await?;
        info!(user_id, revoked, kept = ?except, "user sessions revoked");
        Ok(revoked)
    }

    /// Delete rows whose deadline passed more than `grace` ago. Rows inside
    /// their validity window are never touched.
    pub async fn sweep(&self, now: OffsetDateTime, grace: time::Duration) -> Result<u64, AuthError> {
        let grace = if grace.is_negative() { time::Duration::ZERO } else { grace };
        let deleted = self.repo.delete_expired_before(now - grace).await?;
        debug!(deleted, "session sweep finished");
        Ok(deleted)
    }

    async fn active_record(
        &self,
        bearer: &BearerValue,
        now: OffsetDateTime,
    ) -> Result<SessionRecord, AuthError> {
        let Some(record) = self.repo.find(bearer.session_id).await? else {
            debug!(session_id = %bearer.session_id, "session not found");
            return Err(AuthError::SessionInvalid);
        };
        if !record.is_active_at(now) {
            debug!(session_id = %record.session_id, "session revoked or expired");
            return Err(AuthError::SessionInvalid);
        }
        if !digests_match(&bearer.token.digest(), &record.token_hash) {
            debug!(session_id = %record.session_id, "session token mismatch");
            return Err(AuthError::SessionInvalid);
        }
        Ok(record)
    }
}

fn truncate_user_agent(ua: &str) -> String {
    ua.chars().take(MAX_USER_AGENT_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryStore;
    use crate::auth::repo::UserRepo;
    use crate::auth::repo_types::NewUser;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        sessions: SessionStore,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-05-10 08:00 UTC)));
        let sessions = SessionStore::new(
            store.clone(),
            clock.clone(),
            time::Duration::minutes(30),
            time::Duration::minutes(10),
        );
        Fixture {
            store,
            clock,
            sessions,
        }
    }

    async fn user(f: &Fixture, name: &str) -> UserId {
        f.store
            .create(NewUser {
                username: name,
                password_hash: "h",
                must_change_password: false,
            })
            .await
            .unwrap()
            .id
    }

    fn assert_invalid(res: Result<ValidSession, AuthError>) {
        assert!(matches!(res, Err(AuthError::SessionInvalid)), "{res:?}");
    }

    #[tokio::test]
    async fn created_session_validates_and_stores_only_digest() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (bearer, record) = f.sessions.create(uid, Some("firefox")).await.unwrap();
        assert_ne!(record.token_hash, bearer.token.expose().as_bytes());
        assert_eq!(record.token_hash.len(), 32);

        let valid = f.sessions.validate(&bearer).await.unwrap();
        assert_eq!(valid.record.user_id, uid);
        assert_eq!(valid.record.user_agent.as_deref(), Some("firefox"));
        assert!(!valid.rotation_due);
    }

    #[tokio::test]
    async fn expires_after_ttl_and_touch_does_not_extend() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (bearer, record) = f.sessions.create(uid, None).await.unwrap();

        f.clock.advance(time::Duration::minutes(29));
        let valid = f.sessions.validate(&bearer).await.unwrap();
        assert_eq!(valid.record.expires_at, record.expires_at);
        assert!(valid.rotation_due);

        f.clock.advance(time::Duration::minutes(2));
        assert_invalid(f.sessions.validate(&bearer).await);
    }

    #[tokio::test]
    async fn wrong_token_or_unknown_id_is_invalid() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (bearer, _) = f.sessions.create(uid, None).await.unwrap();

        let forged = BearerValue {
            session_id: bearer.session_id,
            token: RawToken::from_client("guess"),
        };
        assert_invalid(f.sessions.validate(&forged).await);

        let unknown = BearerValue {
            session_id: Uuid::new_v4(),
            token: bearer.token.clone(),
        };
        assert_invalid(f.sessions.validate(&unknown).await);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_scoped() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (s1, _) = f.sessions.create(uid, Some("phone")).await.unwrap();
        let (s2, _) = f.sessions.create(uid, Some("laptop")).await.unwrap();

        f.sessions.revoke(s1.session_id).await.unwrap();
        f.sessions.revoke(s1.session_id).await.unwrap();
        f.sessions.revoke(Uuid::new_v4()).await.unwrap();

        assert_invalid(f.sessions.validate(&s1).await);
        assert!(f.sessions.validate(&s2).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_all_only_hits_that_user() {
        let f = fixture();
        let ana = user(&f, "ana").await;
        let bia = user(&f, "bia").await;
        let (a1, _) = f.sessions.create(ana, None).await.unwrap();
        let (a2, _) = f.sessions.create(ana, None).await.unwrap();
        let (a3, _) = f.sessions.create(ana, None).await.unwrap();
        let (b1, _) = f.sessions.create(bia, None).await.unwrap();

        let revoked = f
            .sessions
            .revoke_all_for_user(ana, Some(a3.session_id))
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert_invalid(f.sessions.validate(&a1).await);
        assert_invalid(f.sessions.validate(&a2).await);
        assert!(f.sessions.validate(&a3).await.is_ok());
        assert!(f.sessions.validate(&b1).await.is_ok());

        // Stays invalid forever after.
        f.clock.advance(time::Duration::minutes(5));
        assert_invalid(f.sessions.validate(&a1).await);
    }

    #[tokio::test]
    async fn rotation_invalidates_previous_token_and_extends_deadline() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (old, record) = f.sessions.create(uid, None).await.unwrap();

        f.clock.advance(time::Duration::minutes(20));
        let (new, rotated) = f.sessions.rotate(&old).await.unwrap();
        assert_eq!(new.session_id, old.session_id);
        assert!(rotated.expires_at > record.expires_at);

        assert_invalid(f.sessions.validate(&old).await);
        assert!(matches!(f.sessions.rotate(&old).await, Err(AuthError::SessionInvalid)));

        f.clock.advance(time::Duration::minutes(5));
        assert!(!f.sessions.validate(&new).await.unwrap().rotation_due);

        // Past the initial deadline, still inside the extended one.
        f.clock.advance(time::Duration::minutes(10));
        assert!(f.sessions.validate(&new).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_keeps_live_sessions() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (stale, _) = f.sessions.create(uid, None).await.unwrap();
        f.clock.advance(time::Duration::minutes(40));
        let (live, _) = f.sessions.create(uid, None).await.unwrap();

        let now = f.clock.now();
        assert_eq!(f.sessions.sweep(now, time::Duration::minutes(5)).await.unwrap(), 1);
        assert!(f.store.find(stale.session_id).await.unwrap().is_none());
        assert!(f.sessions.validate(&live).await.is_ok());
    }

    #[tokio::test]
    async fn expired_but_unswept_session_is_rejected() {
        let f = fixture();
        let uid = user(&f, "ana").await;
        let (bearer, _) = f.sessions.create(uid, None).await.unwrap();
        f.clock.advance(time::Duration::minutes(31));
        let now = f.clock.now();
        assert_eq!(f.sessions.sweep(now, time::Duration::minutes(5)).await.unwrap(), 0);
        assert_invalid(f.sessions.validate(&bearer).await);
    }

    #[test]
    fn long_user_agents_are_truncated() {
        let ua = "x".repeat(1000);
        assert_eq!(truncate_user_agent(&ua).len(), MAX_USER_AGENT_LEN);
    }
}
