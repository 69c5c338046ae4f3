use std::{str::FromStr, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Production,
}

impl FromStr for AppEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" | "test" | "local" => Ok(AppEnv::Development),
            "prod" | "production" => Ok(AppEnv::Production),
            other => anyhow::bail!("unknown APP_ENV {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub ttl_minutes: i64,
    pub rotation_minutes: i64,
    pub sweep_interval_secs: u64,
    pub sweep_grace_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_max_attempts: u32,
    pub login_window_secs: u64,
    pub recovery_max_attempts: u32,
    pub recovery_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub max_concurrent_hashes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    pub token_ttl_minutes: i64,
    pub response_floor_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

/// Self-service sign-up. With `single_account`, registration closes once any
/// account other than the bootstrap admin exists.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    pub enabled: bool,
    pub single_account: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub env: AppEnv,
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub password: PasswordConfig,
    pub recovery: RecoveryConfig,
    pub bootstrap: BootstrapConfig,
    pub registration: RegistrationConfig,
}

/// Upper bound for minute-based settings (ten years).
const MAX_MINUTES: i64 = 60 * 24 * 365 * 10;
const MAX_WINDOW_SECS: u64 = 60 * 60 * 24 * 365;
const MAX_RESPONSE_FLOOR_MS: u64 = 60_000;

/// Unset or blank falls back to `default`; anything unparsable is an error.
fn parse_setting<T>(key: &str, raw: Option<&str>, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value {v:?} for {key}: {e}")),
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_setting(key, std::env::var(key).ok().as_deref(), default)
}

fn ensure_minutes(key: &str, value: i64, min: i64) -> anyhow::Result<()> {
    anyhow::ensure!(
        (min..=MAX_MINUTES).contains(&value),
        "{key} must be between {min} and {MAX_MINUTES}"
    );
    Ok(())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let env = match std::env::var("APP_ENV") {
            Ok(v) => v.parse()?,
            Err(_) => AppEnv::Production,
        };
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let config = Self {
            env,
            database_url,
            session: SessionConfig {
                ttl_minutes: env_or("SESSION_TTL_MINUTES", 60 * 24 * 7)?,
                rotation_minutes: env_or("SESSION_ROTATION_MINUTES", 60 * 24)?,
                sweep_interval_secs: env_or("SESSION_SWEEP_INTERVAL_SECS", 300)?,
                sweep_grace_minutes: env_or("SESSION_SWEEP_GRACE_MINUTES", 60)?,
            },
            rate_limit: RateLimitConfig {
                login_max_attempts: env_or("LOGIN_MAX_ATTEMPTS", 5)?,
                login_window_secs: env_or("LOGIN_WINDOW_SECS", 15 * 60)?,
                recovery_max_attempts: env_or("RECOVERY_MAX_ATTEMPTS", 3)?,
                recovery_window_secs: env_or("RECOVERY_WINDOW_SECS", 60 * 60)?,
            },
            password: PasswordConfig {
                memory_kib: env_or("ARGON2_MEMORY_KIB", argon2::Params::DEFAULT_M_COST)?,
                iterations: env_or("ARGON2_ITERATIONS", argon2::Params::DEFAULT_T_COST)?,
                parallelism: env_or("ARGON2_PARALLELISM", argon2::Params::DEFAULT_P_COST)?,
                max_concurrent_hashes: env_or("MAX_CONCURRENT_HASHES", 4)?,
            },
            recovery: RecoveryConfig {
                token_ttl_minutes: env_or("RECOVERY_TOKEN_TTL_MINUTES", 30)?,
                response_floor_ms: env_or("RECOVERY_RESPONSE_FLOOR_MS", 400)?,
            },
            bootstrap: BootstrapConfig {
                enabled: env_or("BOOTSTRAP_ADMIN", false)?,
                username: std::env::var("BOOTSTRAP_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into()),
                password: std::env::var("BOOTSTRAP_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".into()),
            },
            registration: RegistrationConfig {
                enabled: env_or("REGISTRATION_ENABLED", true)?,
                single_account: env_or("REGISTRATION_SINGLE_ACCOUNT", true)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.env == AppEnv::Production {
            anyhow::ensure!(
                !self.bootstrap.enabled,
                "BOOTSTRAP_ADMIN must not be enabled in production"
            );
            anyhow::ensure!(
                self.database_url.is_some(),
                "DATABASE_URL is required in production"
            );
        }
        ensure_minutes("SESSION_TTL_MINUTES", self.session.ttl_minutes, 1)?;
        ensure_minutes("SESSION_ROTATION_MINUTES", self.session.rotation_minutes, 1)?;
        ensure_minutes("SESSION_SWEEP_GRACE_MINUTES", self.session.sweep_grace_minutes, 0)?;
        ensure_minutes("RECOVERY_TOKEN_TTL_MINUTES", self.recovery.token_ttl_minutes, 1)?;
        anyhow::ensure!(
            (1..=MAX_WINDOW_SECS).contains(&self.rate_limit.login_window_secs)
                && (1..=MAX_WINDOW_SECS).contains(&self.rate_limit.recovery_window_secs),
            "rate limit windows must be between 1 and {MAX_WINDOW_SECS} seconds"
        );
        anyhow::ensure!(
            self.recovery.response_floor_ms <= MAX_RESPONSE_FLOOR_MS,
            "RECOVERY_RESPONSE_FLOOR_MS must be at most {MAX_RESPONSE_FLOOR_MS}"
        );
        anyhow::ensure!(
            self.rate_limit.login_max_attempts > 0 && self.rate_limit.recovery_max_attempts > 0,
            "rate limit thresholds must be positive"
        );
        anyhow::ensure!(
            self.password.max_concurrent_hashes > 0,
            "MAX_CONCURRENT_HASHES must be positive"
        );
        Ok(())
    }

    pub fn session_ttl(&self) -> time::Duration {
        time::Duration::minutes(self.session.ttl_minutes)
    }

    pub fn rotation_interval(&self) -> time::Duration {
        time::Duration::minutes(self.session.rotation_minutes)
    }

    pub fn sweep_grace(&self) -> time::Duration {
        time::Duration::minutes(self.session.sweep_grace_minutes)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs.max(1))
    }

    pub fn recovery_token_ttl(&self) -> time::Duration {
        time::Duration::minutes(self.recovery.token_ttl_minutes)
    }

    pub fn recovery_response_floor(&self) -> Duration {
        Duration::from_millis(self.recovery.response_floor_ms)
    }

    /// Small, fast settings for tests and local experiments.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            env: AppEnv::Development,
            database_url: None,
            session: SessionConfig {
                ttl_minutes: 30,
                rotation_minutes: 10,
                sweep_interval_secs: 60,
                sweep_grace_minutes: 5,
            },
            rate_limit: RateLimitConfig {
                login_max_attempts: 5,
                login_window_secs: 15 * 60,
                recovery_max_attempts: 3,
                recovery_window_secs: 60 * 60,
            },
            password: PasswordConfig {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
                max_concurrent_hashes: 2,
            },
            recovery: RecoveryConfig {
                token_ttl_minutes: 30,
                response_floor_ms: 20,
            },
            bootstrap: BootstrapConfig {
                enabled: false,
                username: "admin".into(),
                password: "admin".into(),
            },
            registration: RegistrationConfig {
                enabled: true,
                single_account: true,
            },
        }
    }
}
