//! Fixed-window attempt counting per (key, action).
//!
//! The counter for a key starts its window on the first attempt. Every call to
//! `check_and_record` counts, admitted or not. The next attempt starts a fresh
//! window only once `now` is strictly past `window_started_at + window`; an
//! attempt landing exactly on that instant still belongs to the old window.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::auth::repo::RateLimitRepo;
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    /// Current-password checks on an existing session, keyed by user id.
    PasswordChange,
    Recovery,
}

impl RateLimitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::Login => "login",
            RateLimitAction::PasswordChange => "password_change",
            RateLimitAction::Recovery => "recovery",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied { retry_after: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

pub struct RateLimiter {
    repo: Arc<dyn RateLimitRepo>,
    clock: Arc<dyn Clock>,
    login: RateLimitPolicy,
    recovery: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn RateLimitRepo>, clock: Arc<dyn Clock>, config: &RateLimitConfig) -> Self {
        Self {
            repo,
            clock,
            login: RateLimitPolicy {
                max_attempts: config.login_max_attempts,
                window: Duration::from_secs(config.login_window_secs),
            },
            recovery: RateLimitPolicy {
                max_attempts: config.recovery_max_attempts,
                window: Duration::from_secs(config.recovery_window_secs),
            },
        }
    }

    pub fn policy(&self, action: RateLimitAction) -> RateLimitPolicy {
        match action {
            RateLimitAction::Login | RateLimitAction::PasswordChange => self.login,
            RateLimitAction::Recovery => self.recovery,
        }
    }

    /// Count one attempt and decide whether it may proceed.
    pub async fn check_and_record(
        &self,
        key: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, StoreError> {
        let policy = self.policy(action);
        let window = time::Duration::try_from(policy.window).unwrap_or(time::Duration::MAX);
        let now = self.clock.now();
        let counter = self
            .repo
            .hit(key, action.as_str(), now, now - window)
            .await?;

        let max_attempts = i32::try_from(policy.max_attempts).unwrap_or(i32::MAX);
        if counter.attempts <= max_attempts {
            debug!(action = action.as_str(), attempts = counter.attempts, "attempt admitted");
            return Ok(RateLimitDecision::Allowed);
        }

        let remaining = (counter.window_started_at + window) - now;
        let retry_after = Duration::try_from(remaining).unwrap_or(Duration::ZERO);
        warn!(
            action = action.as_str(),
            attempts = counter.attempts,
            retry_after_secs = retry_after.as_secs(),
            "attempt rate limited"
        );
        Ok(RateLimitDecision::Denied { retry_after })
    }

    /// Forget the counter, e.g. after a successful login.
    pub async fn reset(&self, key: &str, action: RateLimitAction) -> Result<(), StoreError> {
        self.repo.clear(key, action.as_str()).await
    }

    /// Drop counters whose window ended, for storage hygiene only.
    pub async fn sweep(&self) -> Result<u64, StoreError> {
        let longest = self.login.window.max(self.recovery.window);
        let longest = time::Duration::try_from(longest).unwrap_or(time::Duration::MAX);
        self.repo.delete_windows_before(self.clock.now() - longest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryStore;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn limiter(clock: Arc<ManualClock>, max: u32, window_secs: u64) -> RateLimiter {
        let config = RateLimitConfig {
            login_max_attempts: max,
            login_window_secs: window_secs,
            recovery_max_attempts: 1,
            recovery_window_secs: 60,
        };
        RateLimiter::new(Arc::new(MemoryStore::new()), clock, &config)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(datetime!(2026-03-01 12:00 UTC)))
    }

    #[tokio::test]
    async fn denies_attempt_past_threshold_with_retry_hint() {
        let clock = clock();
        let rl = limiter(clock.clone(), 5, 900);
        for _ in 0..5 {
            assert_eq!(
                rl.check_and_record("ana", RateLimitAction::Login).await.unwrap(),
                RateLimitDecision::Allowed
            );
        }
        clock.advance(time::Duration::seconds(100));
        assert_eq!(
            rl.check_and_record("ana", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Denied {
                retry_after: Duration::from_secs(800)
            }
        );
    }

    #[tokio::test]
    async fn window_elapsed_resets_counter() {
        let clock = clock();
        let rl = limiter(clock.clone(), 2, 60);
        for _ in 0..3 {
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap();
        }
        clock.advance(time::Duration::seconds(61));
        assert_eq!(
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Allowed
        );
        assert!(matches!(
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn attempt_on_window_boundary_stays_in_old_window() {
        let clock = clock();
        let rl = limiter(clock.clone(), 1, 60);
        rl.check_and_record("k", RateLimitAction::Login).await.unwrap();
        clock.advance(time::Duration::seconds(60));
        assert_eq!(
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Denied {
                retry_after: Duration::ZERO
            }
        );
        clock.advance(time::Duration::nanoseconds(1));
        assert_eq!(
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn huge_threshold_does_not_wrap() {
        let rl = limiter(clock(), u32::MAX, 60);
        assert_eq!(
            rl.check_and_record("k", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn keys_and_actions_are_independent() {
        let rl = limiter(clock(), 1, 60);
        rl.check_and_record("a", RateLimitAction::Login).await.unwrap();
        assert_eq!(
            rl.check_and_record("b", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            rl.check_and_record("a", RateLimitAction::Recovery).await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn reset_clears_counter() {
        let rl = limiter(clock(), 1, 60);
        rl.check_and_record("a", RateLimitAction::Login).await.unwrap();
        rl.reset("a", RateLimitAction::Login).await.unwrap();
        assert_eq!(
            rl.check_and_record("a", RateLimitAction::Login).await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn concurrent_attempts_are_not_undercounted() {
        let rl = Arc::new(limiter(clock(), 10, 600));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move {
                rl.check_and_record("shared", RateLimitAction::Login).await.unwrap()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() == RateLimitDecision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn sweep_drops_finished_windows() {
        let clock = clock();
        let rl = limiter(clock.clone(), 5, 60);
        rl.check_and_record("old", RateLimitAction::Login).await.unwrap();
        clock.advance(time::Duration::seconds(61));
        rl.check_and_record("fresh", RateLimitAction::Login).await.unwrap();
        assert_eq!(rl.sweep().await.unwrap(), 1);
    }
}
