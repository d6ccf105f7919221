//! Background expiry sweeper.
//!
//! Periodically flips live reservations past their expiry to `EXPIRED`.
//! Foreground reads never wait for it: availability already ignores lapsed
//! holds, the sweep only makes that durable.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::engine::ReservationEngine;
use crate::store::ReservationRepository;

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub sweeps_run: u64,
    pub reservations_expired: u64,
    pub failures: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the current sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> SweeperStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn the sweeper on the current tokio runtime.
pub fn spawn_sweeper<R>(engine: Arc<ReservationEngine<R>>, interval: Duration) -> SweeperHandle
where
    R: ReservationRepository + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let stats = Arc::new(Mutex::new(SweeperStats::default()));
    let task_stats = stats.clone();

    let join = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "expiry sweeper started");
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {}
            }

            let result = engine.sweep_expired().await;

            let mut s = match task_stats.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            s.sweeps_run += 1;
            s.uptime_secs = started.elapsed().as_secs();
            match result {
                Ok(report) => {
                    s.reservations_expired += report.expired as u64;
                    s.failures += report.failed as u64;
                }
                Err(err) => {
                    s.failures += 1;
                    error!(error = %err, "expiry sweep failed");
                }
            }
        }

        info!("expiry sweeper stopped");
    });

    SweeperHandle {
        shutdown: Some(shutdown_tx),
        join: Some(join),
        stats,
    }
}
