use std::sync::Arc;

use tracing::warn;

use crate::auth::memory::MemoryStore;
use crate::auth::recovery::{RecoveryNotifier, TracingNotifier};
use crate::auth::service::{AuthService, Stores};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let stores = match &config.database_url {
            Some(url) => {
                let pool = db::connect(url).await?;
                db::migrate(&pool).await;
                Stores::postgres(pool)
            }
            None => {
                // Only reachable outside production; see AppConfig::validate.
                warn!("DATABASE_URL not set; using the in-memory store");
                Stores::memory(Arc::new(MemoryStore::new()))
            }
        };

        Self::from_parts(config, stores, Arc::new(SystemClock), Arc::new(TracingNotifier))
    }

    pub fn from_parts(
        config: AppConfig,
        stores: Stores,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn RecoveryNotifier>,
    ) -> anyhow::Result<Self> {
        let auth = AuthService::new(stores, clock, notifier, &config)?;
        Ok(Self {
            config: Arc::new(config),
            auth: Arc::new(auth),
        })
    }

    /// In-memory state with cheap hashing, for router tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::from_parts(
            AppConfig::for_tests(),
            Stores::memory(Arc::new(MemoryStore::new())),
            Arc::new(SystemClock),
            Arc::new(TracingNotifier),
        )
        .expect("test state")
    }
}
