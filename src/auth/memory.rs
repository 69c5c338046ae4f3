//! Process-local store for development without a database and for tests.
//!
//! Every map sits behind one mutex, held across each read-modify-write, so the
//! same linearizability the Postgres statements give holds here too. It is
//! per-process state: running several nodes against it makes sessions and
//! rate limits inconsistent between them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo::{RateLimitRepo, ResetTokenRepo, SessionRepo, UserRepo};
use crate::auth::repo_types::{
    NewUser, RateLimitCounter, ResetTokenRecord, SessionRecord, User, UserId,
};
use crate::error::StoreError;

#[derive(Default)]
struct Tables {
    next_user_id: UserId,
    users: HashMap<UserId, User>,
    sessions: HashMap<Uuid, SessionRecord>,
    rate_limits: HashMap<(String, String), RateLimitCounter>,
    reset_tokens: HashMap<Vec<u8>, ResetTokenRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves plain data behind; keep serving.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes a user and, like the foreign keys, everything it owns.
    pub fn delete_user(&self, id: UserId) {
        let mut t = self.tables();
        t.users.remove(&id);
        t.sessions.retain(|_, s| s.user_id != id);
        t.reset_tokens.retain(|_, r| r.user_id != id);
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let wanted = username.to_lowercase();
        let t = self.tables();
        Ok(t
            .users
            .values()
            .find(|u| u.username.to_lowercase() == wanted)
            .cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.tables().users.get(&id).cloned())
    }

    async fn exists_other_than(&self, username: &str) -> Result<bool, StoreError> {
        let excluded = username.to_lowercase();
        Ok(self
            .tables()
            .users
            .values()
            .any(|u| u.username.to_lowercase() != excluded))
    }

    async fn create(&self, new: NewUser<'_>) -> Result<User, StoreError> {
        let mut t = self.tables();
        let wanted = new.username.to_lowercase();
        if t.users.values().any(|u| u.username.to_lowercase() == wanted) {
            return Err(StoreError::Conflict(format!(
                "username {} already exists",
                new.username
            )));
        }
        t.next_user_id += 1;
        let user = User {
            id: t.next_user_id,
            username: new.username.to_string(),
            password_hash: new.password_hash.to_string(),
            must_change_password: new.must_change_password,
            created_at: OffsetDateTime::now_utc(),
        };
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_password(
        &self,
        id: UserId,
        password_hash: &str,
        must_change_password: bool,
    ) -> Result<(), StoreError> {
        if let Some(user) = self.tables().users.get_mut(&id) {
            user.password_hash = password_hash.to_string();
            user.must_change_password = must_change_password;
        }
        Ok(())
    }

    async fn upgrade_hash(
        &self,
        id: UserId,
        old_hash: &str,
        new_hash: &str,
    ) -> Result<bool, StoreError> {
        match self.tables().users.get_mut(&id) {
            Some(user) if user.password_hash == old_hash => {
                user.password_hash = new_hash.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn insert(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut t = self.tables();
        if !t.users.contains_key(&session.user_id) {
            return Err(StoreError::Conflict(format!("no user {}", session.user_id)));
        }
        if t.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict("duplicate session id".into()));
        }
        t.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.tables().sessions.get(&session_id).cloned())
    }

    async fn touch(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError> {
        if let Some(s) = self.tables().sessions.get_mut(&session_id) {
            s.last_seen_at = Some(now);
        }
        Ok(())
    }

    async fn revoke(&self, session_id: Uuid, now: OffsetDateTime) -> Result<(), StoreError> {
        if let Some(s) = self.tables().sessions.get_mut(&session_id) {
            s.revoked_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        except: Option<Uuid>,
        now: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let mut revoked = 0;
        for s in self.tables().sessions.values_mut() {
            if s.user_id == user_id && s.revoked_at.is_none() && Some(s.session_id) != except {
                s.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn rotate_token(
        &self,
        session_id: Uuid,
        old_hash: &[u8],
        new_hash: &[u8],
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        match self.tables().sessions.get_mut(&session_id) {
            Some(s) if s.token_hash == old_hash && s.is_active_at(now) => {
                s.token_hash = new_hash.to_vec();
                s.rotated_at = Some(now);
                s.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let mut t = self.tables();
        let before = t.sessions.len();
        t.sessions.retain(|_, s| s.expires_at >= cutoff);
        Ok((before - t.sessions.len()) as u64)
    }
}

#[async_trait]
impl RateLimitRepo for MemoryStore {
    async fn hit(
        &self,
        key: &str,
        action: &str,
        now: OffsetDateTime,
        window_cutoff: OffsetDateTime,
    ) -> Result<RateLimitCounter, StoreError> {
        let mut t = self.tables();
        let counter = t
            .rate_limits
            .entry((key.to_string(), action.to_string()))
            .and_modify(|c| {
                if c.window_started_at < window_cutoff {
                    c.attempts = 1;
                    c.window_started_at = now;
                } else {
                    c.attempts += 1;
                }
            })
            .or_insert(RateLimitCounter {
                attempts: 1,
                window_started_at: now,
            });
        Ok(*counter)
    }

    async fn clear(&self, key: &str, action: &str) -> Result<(), StoreError> {
        self.tables()
            .rate_limits
            .remove(&(key.to_string(), action.to_string()));
        Ok(())
    }

    async fn delete_windows_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let mut t = self.tables();
        let before = t.rate_limits.len();
        t.rate_limits.retain(|_, c| c.window_started_at >= cutoff);
        Ok((before - t.rate_limits.len()) as u64)
    }
}

#[async_trait]
impl ResetTokenRepo for MemoryStore {
    async fn insert(&self, record: &ResetTokenRecord) -> Result<(), StoreError> {
        self.tables()
            .reset_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn consume(
        &self,
        token_hash: &[u8],
        now: OffsetDateTime,
    ) -> Result<Option<UserId>, StoreError> {
        match self.tables().reset_tokens.get_mut(token_hash) {
            Some(r) if r.consumed_at.is_none() && now < r.expires_at => {
                r.consumed_at = Some(now);
                Ok(Some(r.user_id))
            }
            _ => Ok(None),
        }
    }

    async fn delete_unusable(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut t = self.tables();
        let before = t.reset_tokens.len();
        t.reset_tokens
            .retain(|_, r| r.consumed_at.is_none() && now < r.expires_at);
        Ok((before - t.reset_tokens.len()) as u64)
    }
}
