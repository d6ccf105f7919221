//! Service wiring: picks the repository backend, builds the engine and starts
//! the expiry sweeper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use stockhold_core::{Clock, SystemClock};
use stockhold_infra::{
    EngineConfig, InMemoryReservationRepository, PostgresReservationRepository,
    ReservationEngine, ReservationRepository, RetryPolicy, ServiceConfig, StoreError,
    SweeperHandle, SweeperStats, spawn_sweeper,
};

pub type SharedRepository = Arc<dyn ReservationRepository>;
pub type Engine = ReservationEngine<SharedRepository>;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("USE_PERSISTENT_STORES=true requires DATABASE_URL")]
    MissingDatabaseUrl,

    #[error("failed to connect to Postgres: {0}")]
    Connect(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything the handlers need, shared behind an `Arc`.
pub struct AppServices {
    pub engine: Arc<Engine>,
    /// Bounded retry applied to allocate and finalize.
    pub retry: RetryPolicy,
    pub backend: &'static str,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("backend", &self.backend)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AppServices {
    fn new(repo: SharedRepository, clock: Arc<dyn Clock>, config: EngineConfig, backend: &'static str) -> Self {
        let sweep_interval = config.sweep_interval;
        let engine = Arc::new(ReservationEngine::new(repo, clock, config));
        let sweeper = spawn_sweeper(engine.clone(), sweep_interval);
        Self {
            engine,
            retry: RetryPolicy::default(),
            backend,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// In-memory wiring (dev/test). Must be called inside a tokio runtime.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let repo: SharedRepository = Arc::new(InMemoryReservationRepository::new());
        Self::new(repo, clock, config, "in_memory")
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sweeper_stats(&self) -> Option<SweeperStats> {
        let guard = match self.sweeper.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().map(|h| h.stats())
    }

    /// Stop the background sweeper and wait for an in-flight sweep.
    pub async fn shutdown(&self) {
        let handle = match self.sweeper.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

pub async fn build_services(config: &ServiceConfig) -> Result<Arc<AppServices>, StartupError> {
    if config.use_persistent_stores {
        return build_persistent_services(config).await.map(Arc::new);
    }

    info!(
        ttl_minutes = config.engine.reservation_ttl.num_minutes(),
        "using in-memory reservation store"
    );
    Ok(Arc::new(AppServices::in_memory(config.engine.clone())))
}

async fn build_persistent_services(config: &ServiceConfig) -> Result<AppServices, StartupError> {
    let url = config
        .database_url
        .as_deref()
        .ok_or(StartupError::MissingDatabaseUrl)?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await?;

    let store = PostgresReservationRepository::new(pool);
    store.migrate().await?;
    info!(
        ttl_minutes = config.engine.reservation_ttl.num_minutes(),
        "using postgres reservation store"
    );

    let repo: SharedRepository = Arc::new(store);
    Ok(AppServices::new(
        repo,
        Arc::new(SystemClock),
        config.engine.clone(),
        "postgres",
    ))
}
