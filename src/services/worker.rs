//! Refresh workers
//!
//! Each [`UpdateWorker`] runs an independent poll loop:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────┐
//!   │ worker 0: drain pending removals                     │
//!   │ claim stalest free signal ──▶ refresh (spawned task) │
//!   │ release claim                                        │
//!   │ sleep(update_interval) or cancelled ──▶ stop         │
//!   └──────────────────────────────────────────────────────┘
//! ```
//!
//! A refresh runs as its own task so a panic inside a reader or tier ends
//! that round only; the worker logs it and keeps going. Removals touch the
//! tiers directly and run on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::RefreshOutcome;
use crate::services::WorkerScheduler;

/// Default sleep between two rounds of a worker
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(5000);

/// Rounds between two progress log lines
const LOG_EVERY_ROUNDS: u64 = 30;

/// One refresh worker
pub struct UpdateWorker {
    id: usize,
    scheduler: Arc<WorkerScheduler>,
    interval: Duration,
}

impl UpdateWorker {
    /// Create worker `id` sleeping `interval` between rounds
    pub fn new(id: usize, scheduler: Arc<WorkerScheduler>, interval: Duration) -> Self {
        Self {
            id,
            scheduler,
            interval,
        }
    }

    /// Run rounds until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(worker_id = self.id, "Refresh worker started");
        let mut rounds: u64 = 0;

        while !shutdown.is_cancelled() {
            self.run_round().await;
            rounds += 1;
            if rounds % LOG_EVERY_ROUNDS == 0 {
                tracing::debug!(worker_id = self.id, rounds, "Refresh worker alive");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.scheduler.release(self.id);
        tracing::info!(worker_id = self.id, rounds, "Refresh worker stopped");
    }

    /// One round: removals (worker 0), then one refresh
    pub async fn run_round(&self) {
        self.drain_removals().await;

        let Some(signal) = self.scheduler.claim_next(self.id) else {
            return;
        };

        let manager = Arc::clone(self.scheduler.manager());
        let task_signal = signal.clone();
        let started = Instant::now();
        let result = tokio::spawn(async move { manager.update_cached_signal(&task_signal).await }).await;

        match result {
            Ok(Ok(outcome)) => {
                let samples = match outcome {
                    RefreshOutcome::Updated { samples } => samples,
                    _ => 0,
                };
                tracing::debug!(
                    worker_id = self.id,
                    signal = %signal,
                    outcome = outcome.as_str(),
                    samples,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Refresh finished"
                );
            }
            Ok(Err(e)) => {
                tracing::error!(worker_id = self.id, signal = %signal, error = %e, "Refresh failed");
            }
            Err(e) => {
                tracing::error!(worker_id = self.id, signal = %signal, error = %e, "Refresh task aborted");
            }
        }
        self.scheduler.release(self.id);
    }

    async fn drain_removals(&self) {
        while let Some(signal) = self.scheduler.next_pending_removal(self.id) {
            let manager = Arc::clone(self.scheduler.manager());
            let task_signal = signal.clone();
            let complete =
                match tokio::task::spawn_blocking(move || manager.perform_signal_removal(&task_signal))
                    .await
                {
                    Ok(complete) => complete,
                    Err(e) => {
                        tracing::error!(worker_id = self.id, signal = %signal, error = %e, "Removal task aborted");
                        false
                    }
                };
            self.scheduler.release(self.id);
            if !complete {
                tracing::warn!(worker_id = self.id, signal = %signal, "Removal incomplete, retrying next round");
                break;
            }
        }
    }
}

/// Fixed pool of refresh workers sharing one scheduler
pub struct WorkerPool {
    scheduler: Arc<WorkerScheduler>,
    interval: Duration,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a stopped pool
    pub fn new(scheduler: Arc<WorkerScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one worker per scheduler slot on the current runtime
    ///
    /// Does nothing if the pool is already running or was shut down.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        let workers = self.scheduler.worker_count();
        for id in 0..workers {
            let worker = UpdateWorker::new(id, Arc::clone(&self.scheduler), self.interval);
            handles.push(tokio::spawn(worker.run(self.shutdown.clone())));
        }
        tracing::info!(
            workers,
            interval_ms = self.interval.as_millis() as u64,
            "Refresh workers started"
        );
    }

    /// Whether workers are running
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty() && !self.shutdown.is_cancelled()
    }

    /// Cancel all workers and wait for them to finish their round
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Refresh worker terminated abnormally");
            }
        }
    }

    /// The scheduler shared by the workers
    pub fn scheduler(&self) -> &Arc<WorkerScheduler> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfiguration, CacheManager, MemoryTier};
    use crate::error::ReaderError;
    use crate::estimation::DetailLevelLookup;
    use crate::reader::{DataReader, ReaderRegistry};
    use crate::types::{DataSource, Signal, TimedLocationValue};
    use async_trait::async_trait;

    struct Steady;

    #[async_trait]
    impl DataReader for Steady {
        fn validate(&self, _signal: &Signal) -> std::result::Result<(), ReaderError> {
            Ok(())
        }

        async fn fetch(
            &self,
            signal: &Signal,
            _start: Option<i64>,
            _end: Option<i64>,
            _row_limit: usize,
        ) -> std::result::Result<Vec<TimedLocationValue>, ReaderError> {
            if signal.data_field == "panic" {
                panic!("reader bug");
            }
            if signal.data_field == "down" {
                return Err(ReaderError::SourceUnavailable("offline".to_string()));
            }
            Ok((0..120).map(|i| TimedLocationValue::new(i * 1000, 1.0)).collect())
        }
    }

    fn scheduler(workers: usize) -> Arc<WorkerScheduler> {
        let mut readers = ReaderRegistry::new();
        readers.register("gsn", Arc::new(Steady));
        let configs = vec![CacheConfiguration::new(Arc::new(MemoryTier::default()), 60)];
        let manager =
            CacheManager::new(configs, readers, Arc::new(DetailLevelLookup::new())).unwrap();
        Arc::new(WorkerScheduler::new(Arc::new(manager), workers))
    }

    fn signal(source: &str, field: &str) -> Signal {
        Signal::new(DataSource::new("gsn", source), field, "timed")
    }

    #[tokio::test]
    async fn test_round_refreshes_and_releases() {
        let scheduler = scheduler(1);
        let s = signal("a", "temp");
        assert!(!scheduler.manager().is_in_cache(&s).unwrap());

        UpdateWorker::new(0, Arc::clone(&scheduler), DEFAULT_UPDATE_INTERVAL)
            .run_round()
            .await;
        assert!(scheduler.manager().is_in_cache(&s).unwrap());
        assert_eq!(scheduler.worker_signals(), vec![None]);
    }

    #[tokio::test]
    async fn test_round_survives_failures_and_panics() {
        let scheduler = scheduler(1);
        let worker = UpdateWorker::new(0, Arc::clone(&scheduler), DEFAULT_UPDATE_INTERVAL);
        for field in ["panic", "down"] {
            scheduler.manager().is_in_cache(&signal("a", field)).unwrap();
        }
        worker.run_round().await;
        worker.run_round().await;
        assert_eq!(scheduler.worker_signals(), vec![None]);
        // both signals were attempted
        assert!(scheduler
            .manager()
            .signals_with_staleness()
            .iter()
            .all(|s| s.last_attempt > 0));
    }

    #[tokio::test]
    async fn test_worker_zero_drains_removals() {
        let scheduler = scheduler(2);
        let s = signal("a", "temp");
        scheduler.manager().is_in_cache(&s).unwrap();
        scheduler.manager().schedule_signal_for_removal(&s);

        UpdateWorker::new(1, Arc::clone(&scheduler), DEFAULT_UPDATE_INTERVAL)
            .run_round()
            .await;
        assert_eq!(scheduler.manager().signals_to_remove(), vec![s.clone()]);

        UpdateWorker::new(0, Arc::clone(&scheduler), DEFAULT_UPDATE_INTERVAL)
            .run_round()
            .await;
        assert!(scheduler.manager().signals_to_remove().is_empty());
        assert!(!scheduler.manager().is_in_cache(&s).unwrap());
    }

    #[tokio::test]
    async fn test_pool_start_and_shutdown() {
        let scheduler = scheduler(2);
        let s = signal("a", "temp");
        scheduler.manager().is_in_cache(&s).unwrap();

        let pool = WorkerPool::new(Arc::clone(&scheduler), Duration::from_millis(10));
        pool.start();
        pool.start();
        assert!(pool.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !scheduler.manager().is_in_cache(&s).unwrap() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scheduler.manager().is_in_cache(&s).unwrap());

        pool.shutdown().await;
        assert!(!pool.is_running());
        pool.start();
        assert!(!pool.is_running());
    }
}
