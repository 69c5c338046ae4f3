//! Orchestration of login, logout, session checks, password change and
//! recovery on top of the hasher, rate limiter and session store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::auth::{
    memory::MemoryStore,
    password::{CredentialHasher, Verification},
    rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter},
    recovery::{RecoveryNotifier, NEUTRAL_RECOVERY_MESSAGE},
    repo::{PgStore, RateLimitRepo, ResetTokenRepo, SessionRepo, UserRepo},
    repo_types::{NewUser, ResetTokenRecord, SessionRecord, User, UserId},
    session::SessionStore,
    tokens::{BearerValue, RawToken},
};
use crate::clock::Clock;
use crate::config::{AppConfig, AppEnv, BootstrapConfig, RegistrationConfig};
use crate::error::{AuthError, StoreError};

/// The repositories the core needs, usually all backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserRepo>,
    pub sessions: Arc<dyn SessionRepo>,
    pub rate_limits: Arc<dyn RateLimitRepo>,
    pub reset_tokens: Arc<dyn ResetTokenRepo>,
}

impl Stores {
    pub fn postgres(db: PgPool) -> Self {
        let store = Arc::new(PgStore::new(db));
        Self {
            users: store.clone(),
            sessions: store.clone(),
            rate_limits: store.clone(),
            reset_tokens: store,
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            users: store.clone(),
            sessions: store.clone(),
            rate_limits: store.clone(),
            reset_tokens: store,
        }
    }
}

/// Trim and lower-case; used for lookups and rate-limit keys.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

pub(crate) fn is_valid_username(username: &str) -> bool {
    lazy_static! {
        static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9._@+-]{1,64}$").unwrap();
    }
    USERNAME_RE.is_match(username)
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub bearer: BearerValue,
    pub session: SessionRecord,
    pub username: String,
    pub must_change_password: bool,
}

/// Identity resolved from a valid session.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedSession {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub must_change_password: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub rotation_due: bool,
}

impl AuthenticatedSession {
    /// Gated accounts may only change their password.
    pub fn require_unrestricted(&self) -> Result<UserId, AuthError> {
        if self.must_change_password {
            return Err(AuthError::MustChangePassword);
        }
        Ok(self.user_id)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub rate_limits: u64,
    pub reset_tokens: u64,
}

pub struct AuthService {
    users: Arc<dyn UserRepo>,
    reset_tokens: Arc<dyn ResetTokenRepo>,
    sessions: SessionStore,
    limiter: RateLimiter,
    hasher: Arc<CredentialHasher>,
    hash_permits: Semaphore,
    notifier: Arc<dyn RecoveryNotifier>,
    clock: Arc<dyn Clock>,
    recovery_token_ttl: time::Duration,
    recovery_floor: Duration,
    sweep_grace: time::Duration,
    registration: RegistrationConfig,
    admin_username: String,
}

impl AuthService {
    pub fn new(
        stores: Stores,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn RecoveryNotifier>,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let hasher = CredentialHasher::new(&config.password).context("build password hasher")?;
        Ok(Self {
            sessions: SessionStore::new(
                stores.sessions,
                clock.clone(),
                config.session_ttl(),
                config.rotation_interval(),
            ),
            limiter: RateLimiter::new(stores.rate_limits, clock.clone(), &config.rate_limit),
            users: stores.users,
            reset_tokens: stores.reset_tokens,
            hasher: Arc::new(hasher),
            hash_permits: Semaphore::new(config.password.max_concurrent_hashes),
            notifier,
            clock,
            recovery_token_ttl: config.recovery_token_ttl(),
            recovery_floor: config.recovery_response_floor(),
            sweep_grace: config.sweep_grace(),
            registration: config.registration.clone(),
            admin_username: config.bootstrap.username.clone(),
        })
    }

    /// Rate-limit gate, then credential check, then a new session.
    #[instrument(skip(self, identifier, password, user_agent))]
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        user_agent: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        let key = normalize_identifier(identifier);
        if let RateLimitDecision::Denied { retry_after } = self
            .limiter
            .check_and_record(&key, RateLimitAction::Login)
            .await?
        {
            return Err(AuthError::RateLimited { retry_after });
        }

        let Some(user) = self.users.find_by_username(&key).await? else {
            self.verify_dummy(password).await?;
            warn!("login for unknown identifier");
            return Err(AuthError::InvalidCredentials);
        };

        let verification = self.verify(password, &user.password_hash).await?;
        if !verification.matched {
            warn!(user_id = user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }
        if verification.needs_rehash {
            self.upgrade_hash(&user, password).await?;
        }
        self.limiter.reset(&key, RateLimitAction::Login).await?;

        let (bearer, session) = self.sessions.create(user.id, user_agent).await?;
        info!(
            user_id = user.id,
            session_id = %session.session_id,
            must_change_password = user.must_change_password,
            "user logged in"
        );
        Ok(LoginOutcome {
            bearer,
            session,
            username: user.username,
            must_change_password: user.must_change_password,
        })
    }

    /// Always succeeds for ids that never existed.
    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.sessions.revoke(session_id).await
    }

    /// Resolve a bearer value into the session's identity, gate flag included.
    pub async fn require_valid_session(
        &self,
        bearer: &BearerValue,
    ) -> Result<AuthenticatedSession, AuthError> {
        let valid = self.sessions.validate(bearer).await?;
        let Some(user) = self.users.find_by_id(valid.record.user_id).await? else {
            return Err(AuthError::SessionInvalid);
        };
        Ok(AuthenticatedSession {
            session_id: valid.record.session_id,
            user_id: user.id,
            must_change_password: user.must_change_password,
            expires_at: valid.record.expires_at,
            rotation_due: valid.rotation_due,
        })
    }

    /// The id every downstream read and write must be filtered by. A missing
    /// or invalid session, or a gated account, never yields an id.
    pub async fn resolve_current_user(
        &self,
        bearer: Option<&BearerValue>,
    ) -> Result<UserId, AuthError> {
        let bearer = bearer.ok_or(AuthError::SessionInvalid)?;
        self.require_valid_session(bearer).await?.require_unrestricted()
    }

    pub async fn user(&self, id: UserId) -> Result<User, AuthError> {
        self.users
            .find_by_id(id)
            .await?
            .ok_or(AuthError::SessionInvalid)
    }

    /// Refresh the token of an unrestricted session. Gated accounts must
    /// change their password first.
    pub async fn rotate(&self, bearer: &BearerValue) -> Result<(BearerValue, SessionRecord), AuthError> {
        self.require_valid_session(bearer).await?.require_unrestricted()?;
        self.sessions.rotate(bearer).await
    }

    /// Keeps the session performing the change; every other session of the
    /// user is revoked.
    #[instrument(skip(self, session, current_password, new_password), fields(user_id = session.user_id))]
    pub async fn change_password(
        &self,
        session: &AuthenticatedSession,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        if new_password.is_empty() {
            return Err(AuthError::InvalidInput("new password must not be empty".into()));
        }
        let Some(user) = self.users.find_by_id(session.user_id).await? else {
            return Err(AuthError::SessionInvalid);
        };
        let key = user.id.to_string();
        if let RateLimitDecision::Denied { retry_after } = self
            .limiter
            .check_and_record(&key, RateLimitAction::PasswordChange)
            .await?
        {
            return Err(AuthError::RateLimited { retry_after });
        }
        if !self.verify(current_password, &user.password_hash).await?.matched {
            warn!("password change with wrong current password");
            return Err(AuthError::InvalidCredentials);
        }
        if current_password == new_password {
            return Err(AuthError::InvalidInput(
                "new password must differ from the current one".into(),
            ));
        }

        let hash = self.hash(new_password).await?;
        self.users.set_password(user.id, &hash, false).await?;
        self.sessions
            .revoke_all_for_user(user.id, Some(session.session_id))
            .await?;
        self.limiter
            .reset(&key, RateLimitAction::PasswordChange)
            .await?;
        info!("password changed");
        Ok(())
    }

    /// Same message, same floor latency, whatever happened inside.
    #[instrument(skip(self, identifier))]
    pub async fn initiate_recovery(&self, identifier: &str) -> Result<&'static str, AuthError> {
        let started = tokio::time::Instant::now();
        let result = self.issue_recovery(identifier).await;
        tokio::time::sleep_until(started + self.recovery_floor).await;
        result.map(|()| NEUTRAL_RECOVERY_MESSAGE)
    }

    async fn issue_recovery(&self, identifier: &str) -> Result<(), AuthError> {
        let key = normalize_identifier(identifier);
        if let RateLimitDecision::Denied { .. } = self
            .limiter
            .check_and_record(&key, RateLimitAction::Recovery)
            .await?
        {
            debug!("recovery rate limited");
            return Ok(());
        }

        let user = self.users.find_by_username(&key).await?;
        // Generated either way so both paths do the same work.
        let token = RawToken::generate()?;
        let token_hash = token.digest();
        let Some(user) = user else {
            debug!("recovery for unknown identifier");
            return Ok(());
        };

        let now = self.clock.now();
        let expires_at = now + self.recovery_token_ttl;
        self.reset_tokens
            .insert(&ResetTokenRecord {
                token_hash,
                user_id: user.id,
                created_at: now,
                expires_at,
                consumed_at: None,
            })
            .await?;
        // Delivery runs off the response path; its latency and failures must
        // not reveal that the account exists.
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(
            async move {
                if let Err(e) = notifier.deliver(&user, &token, expires_at).await {
                    error!(error = ?e, user_id = user.id, "recovery delivery failed");
                }
            }
            .instrument(tracing::Span::current()),
        );
        Ok(())
    }

    /// Consume a reset token and set a new password. All sessions of the
    /// user are revoked.
    #[instrument(skip(self, token, new_password))]
    pub async fn complete_recovery(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        if new_password.is_empty() {
            return Err(AuthError::InvalidInput("new password must not be empty".into()));
        }
        let token = RawToken::from_client(token.trim());
        let Some(user_id) = self
            .reset_tokens
            .consume(&token.digest(), self.clock.now())
            .await?
        else {
            warn!("unusable recovery token presented");
            return Err(AuthError::InvalidCredentials);
        };

        let hash = self.hash(new_password).await?;
        self.users.set_password(user_id, &hash, false).await?;
        self.sessions.revoke_all_for_user(user_id, None).await?;
        info!(user_id, "password reset through recovery");
        Ok(())
    }

    /// Self-service sign-up. Under the single-account lock it closes as soon
    /// as any account other than the bootstrap admin exists.
    #[instrument(skip(self, username, password))]
    pub async fn register(&self, username: &str, password: &str) -> Result<User, AuthError> {
        if !self.registration.enabled {
            return Err(AuthError::RegistrationClosed);
        }
        if self.registration.single_account
            && self.users.exists_other_than(&self.admin_username).await?
        {
            warn!("registration attempted while locked");
            return Err(AuthError::RegistrationClosed);
        }
        self.provision_user(username, password, false).await
    }

    /// Create an account with a freshly hashed password.
    pub async fn provision_user(
        &self,
        username: &str,
        password: &str,
        must_change_password: bool,
    ) -> Result<User, AuthError> {
        self.create_user(username, password, must_change_password)
            .await?
            .ok_or_else(|| AuthError::InvalidInput("username already taken".into()))
    }

    /// Seed the default administrative account. Only ever acts outside
    /// production and when explicitly enabled; the account is always gated.
    pub async fn bootstrap_default_admin(
        &self,
        env: AppEnv,
        bootstrap: &BootstrapConfig,
    ) -> Result<Option<UserId>, AuthError> {
        if !bootstrap.enabled {
            return Ok(None);
        }
        if env == AppEnv::Production {
            warn!("default admin bootstrap ignored in production");
            return Ok(None);
        }
        if self.users.find_by_username(&bootstrap.username).await?.is_some() {
            debug!("default admin already present");
            return Ok(None);
        }
        // None: another process created it first.
        let created = self
            .create_user(&bootstrap.username, &bootstrap.password, true)
            .await?;
        if let Some(user) = &created {
            warn!(user_id = user.id, "default admin created; password change required");
        }
        Ok(created.map(|u| u.id))
    }

    async fn create_user(
        &self,
        username: &str,
        password: &str,
        must_change_password: bool,
    ) -> Result<Option<User>, AuthError> {
        let username = username.trim();
        if !is_valid_username(username) {
            return Err(AuthError::InvalidInput("invalid username".into()));
        }
        if password.is_empty() {
            return Err(AuthError::InvalidInput("password must not be empty".into()));
        }
        let hash = self.hash(password).await?;
        let created = self
            .users
            .create(NewUser {
                username,
                password_hash: &hash,
                must_change_password,
            })
            .await;
        match created {
            Ok(user) => {
                info!(user_id = user.id, "user provisioned");
                Ok(Some(user))
            }
            Err(StoreError::Conflict(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, AuthError> {
        let now = self.clock.now();
        Ok(SweepReport {
            sessions: self.sessions.sweep(now, self.sweep_grace).await?,
            rate_limits: self.limiter.sweep().await?,
            reset_tokens: self.reset_tokens.delete_unusable(now).await?,
        })
    }

    async fn upgrade_hash(&self, user: &User, password: &str) -> Result<(), AuthError> {
        let new_hash = self.hash(password).await?;
        let upgraded = self
            .users
            .upgrade_hash(user.id, &user.password_hash, &new_hash)
            .await?;
        if upgraded {
            info!(user_id = user.id, "password hash upgraded");
        } else {
            debug!(user_id = user.id, "hash changed concurrently; upgrade skipped");
        }
        Ok(())
    }

    async fn verify(&self, plain: &str, stored: &str) -> Result<Verification, AuthError> {
        let _permit = self.hash_permits.acquire().await.context("hash permits closed")?;
        let hasher = Arc::clone(&self.hasher);
        let (plain, stored) = (plain.to_owned(), stored.to_owned());
        let verification = tokio::task::spawn_blocking(move || hasher.verify(&plain, &stored))
            .await
            .context("password verification task failed")?;
        Ok(verification)
    }

    async fn verify_dummy(&self, plain: &str) -> Result<(), AuthError> {
        let _permit = self.hash_permits.acquire().await.context("hash permits closed")?;
        let hasher = Arc::clone(&self.hasher);
        let plain = plain.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify_dummy(&plain))
            .await
            .context("password verification task failed")?;
        Ok(())
    }

    async fn hash(&self, plain: &str) -> Result<String, AuthError> {
        let _permit = self.hash_permits.acquire().await.context("hash permits closed")?;
        let hasher = Arc::clone(&self.hasher);
        let plain = plain.to_owned();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .context("password hashing task failed")??;
        Ok(hash)
    }
}

/// Periodic maintenance, off the request path.
pub fn spawn_sweeper(service: Arc<AuthService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.sweep().await {
                Ok(report) => debug!(?report, "auth sweep finished"),
                Err(e) => error!(error = %e, "auth sweep failed"),
            }
        }
    })
}
