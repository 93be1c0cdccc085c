//! Calc Manager: admission control over the query and result queues and
//! ownership of the Calc Worker pool.
//!
//! Query ids come from a monotonic counter, so the workers' lowest-id-first
//! pop is arrival order. Expired results are evicted lazily, only when a
//! new query arrives while the result queue is full.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::queue::{ConcurrentMapQueue, Rejected};
use super::worker::CalcWorker;
use crate::adapters::dataset::DatasetStore;
use crate::adapters::keystore::KeyRegistry;
use crate::config::ServerConfig;
use crate::domain::{Query, QueryId, QueryResult};
use crate::ports::FheEngine;
use crate::{Result, SsesError};

/// Scheduler limits, taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_concurrent_queries: usize,
    pub max_results: usize,
    pub max_result_lifetime: Duration,
    pub workers: usize,
    pub threads_per_query: usize,
    pub retry_interval: Duration,
    pub chunk_size: usize,
}

impl From<&ServerConfig> for ManagerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_concurrent_queries: config.max_concurrent_queries,
            max_results: config.max_results,
            max_result_lifetime: config.max_result_lifetime(),
            workers: config.workers,
            threads_per_query: config.threads_per_query,
            retry_interval: config.retry_interval(),
            chunk_size: config.chunk_size,
        }
    }
}

/// State shared between the manager and its workers.
pub(crate) struct Shared<E: FheEngine> {
    pub(crate) queries: ConcurrentMapQueue<QueryId, Query>,
    pub(crate) results: ConcurrentMapQueue<QueryId, QueryResult>,
    pub(crate) keys: Arc<KeyRegistry<E>>,
    pub(crate) datasets: Arc<DatasetStore>,
    pub(crate) settings: ManagerSettings,
    pub(crate) running: AtomicBool,
}

pub struct CalcManager<E: FheEngine + 'static> {
    shared: Arc<Shared<E>>,
    next_query_id: AtomicI64,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl<E: FheEngine + 'static> CalcManager<E> {
    #[must_use]
    pub fn new(
        keys: Arc<KeyRegistry<E>>,
        datasets: Arc<DatasetStore>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queries: ConcurrentMapQueue::new(),
                results: ConcurrentMapQueue::new(),
                keys,
                datasets,
                settings,
                running: AtomicBool::new(false),
            }),
            next_query_id: AtomicI64::new(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    #[must_use]
    pub fn keys(&self) -> &Arc<KeyRegistry<E>> {
        &self.shared.keys
    }

    #[must_use]
    pub fn datasets(&self) -> &Arc<DatasetStore> {
        &self.shared.datasets
    }

    /// Spawn the configured number of Calc Workers. No-op if already running.
    ///
    /// # Errors
    /// Returns an error if a worker thread or its chunk pool cannot be created.
    pub fn start_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for id in 0..self.shared.settings.workers {
            workers.push(CalcWorker::spawn(id, Arc::clone(&self.shared))?);
        }
        info!(
            workers = self.shared.settings.workers,
            threads_per_query = self.shared.settings.threads_per_query,
            "Calc workers started"
        );
        Ok(())
    }

    /// Stop and join every worker.
    ///
    /// Queries still queued stay queued. A worker that failed or panicked is
    /// reported here.
    ///
    /// # Errors
    /// Returns the first `SsesError::WorkerFailure` among the joined workers.
    pub fn stop_workers(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut first_failure = None;
        for (id, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(SsesError::WorkerFailure(format!("calc worker {id} panicked"))),
            };
            if let Err(e) = outcome {
                error!(worker = id, error = %e, "Calc worker failed");
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Admit a query and hand back its id.
    ///
    /// # Errors
    /// Returns `SsesError::CapacityExceeded` if either queue is full; nothing
    /// is enqueued in that case.
    pub fn push_query(&self, query: Query) -> Result<QueryId> {
        let settings = &self.shared.settings;
        if self.shared.results.len() >= settings.max_results {
            self.cleanup_results();
        }

        let held = self.shared.results.len();
        let key_id = query.key_id;
        if held >= settings.max_results {
            warn!(held, key_id, "Rejected query, result queue at capacity");
            return Err(SsesError::CapacityExceeded(format!("{held} held results")));
        }

        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        match self
            .shared
            .queries
            .push_bounded(query_id, query, settings.max_concurrent_queries)
        {
            Ok(()) => {
                debug!(query_id, key_id, "Query admitted");
                Ok(query_id)
            }
            Err(Rejected::Full(_)) => {
                let queued = self.shared.queries.len();
                warn!(queued, key_id, "Rejected query, query queue at capacity");
                Err(SsesError::CapacityExceeded(format!(
                    "{queued} queued queries"
                )))
            }
            Err(Rejected::Duplicate(_)) => Err(SsesError::WorkerFailure(format!(
                "query id {query_id} issued twice"
            ))),
        }
    }

    /// Wait for the result of `query_id` and take it.
    ///
    /// Blocks until the result arrives. Each result is handed out once.
    ///
    /// # Errors
    /// Returns `SsesError::WorkerFailure` if the workers stop while waiting.
    pub fn pop_result(&self, query_id: QueryId) -> Result<QueryResult> {
        loop {
            if let Some(result) = self
                .shared
                .results
                .pop_wait(query_id, self.shared.settings.retry_interval)
            {
                return Ok(result);
            }
            if !self.is_running() {
                return Err(SsesError::WorkerFailure(format!(
                    "calc workers stopped before query {query_id} finished"
                )));
            }
        }
    }

    /// Take the result of `query_id` if it is ready.
    #[must_use]
    pub fn try_pop_result(&self, query_id: QueryId) -> Option<QueryResult> {
        self.shared.results.pop(query_id)
    }

    /// Drop a queued query that no worker has claimed yet.
    ///
    /// Returns false if it was already claimed; a running computation is
    /// not interrupted and its result stays until taken or evicted.
    pub fn withdraw_query(&self, query_id: QueryId) -> bool {
        self.shared.queries.pop(query_id).is_some()
    }

    /// Evict results older than the configured lifetime; returns how many.
    ///
    /// Ages are whole seconds, and a result exactly `max_result_lifetime` old
    /// is kept.
    pub fn cleanup_results(&self) -> usize {
        let now = Utc::now();
        let lifetime = i64::try_from(self.shared.settings.max_result_lifetime.as_secs())
            .unwrap_or(i64::MAX);
        let evicted = self
            .shared
            .results
            .evict_where(|_, result| result.age_secs(now) > lifetime);
        if evicted > 0 {
            info!(evicted, remaining = self.shared.results.len(), "Evicted expired results");
        }
        evicted
    }

    #[must_use]
    pub fn query_count(&self) -> usize {
        self.shared.queries.len()
    }

    #[must_use]
    pub fn result_count(&self) -> usize {
        self.shared.results.len()
    }
}

impl<E: FheEngine + 'static> Drop for CalcManager<E> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_workers() {
            warn!(error = %e, "Calc workers did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bfv::BfvEngine;
    use crate::domain::{
        CiphertextBuffer, ComputationParam, ContextSettings, KeyKind, ResultStatus,
    };
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::path::Path;

    fn settings(workers: usize) -> ManagerSettings {
        ManagerSettings {
            max_concurrent_queries: 4,
            max_results: 4,
            max_result_lifetime: Duration::from_secs(60),
            workers,
            threads_per_query: 2,
            retry_interval: Duration::from_millis(10),
            chunk_size: 100,
        }
    }

    fn manager(dir: &Path, settings: ManagerSettings) -> CalcManager<BfvEngine> {
        let keys = KeyRegistry::new(Arc::new(BfvEngine::new()), dir.join("keys")).unwrap();
        let datasets = DatasetStore::open(dir).unwrap();
        CalcManager::new(Arc::new(keys), Arc::new(datasets), settings)
    }

    fn dummy_query(key_id: u64) -> Query {
        Query {
            key_id,
            param: ComputationParam::for_server(&[1], &[5]),
            enc_mask: CiphertextBuffer::single(vec![0; 8]),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));
        let a = manager.push_query(dummy_query(1)).unwrap();
        let b = manager.push_query(dummy_query(1)).unwrap();
        assert!(b > a);
        assert_eq!(manager.query_count(), 2);
        assert!(manager.withdraw_query(a));
        assert!(!manager.withdraw_query(a));
    }

    #[test]
    fn test_push_rejected_when_query_queue_full() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));
        for _ in 0..4 {
            manager.push_query(dummy_query(1)).unwrap();
        }
        assert!(matches!(
            manager.push_query(dummy_query(1)),
            Err(SsesError::CapacityExceeded(_))
        ));
        assert_eq!(manager.query_count(), 4);
    }

    #[test]
    fn test_full_result_queue_evicts_expired_before_rejecting() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));

        for id in 100..104 {
            let mut stale = QueryResult::failed(1, id);
            stale.created_at = Utc::now() - chrono::Duration::seconds(3600);
            manager.shared.results.push(id, stale).unwrap();
        }
        assert!(manager.push_query(dummy_query(1)).is_ok());
        assert_eq!(manager.result_count(), 0);
    }

    #[test]
    fn test_full_result_queue_rejects_when_nothing_expired() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));

        for id in 100..104 {
            manager.shared.results.push(id, QueryResult::failed(1, id)).unwrap();
        }
        assert!(matches!(
            manager.push_query(dummy_query(1)),
            Err(SsesError::CapacityExceeded(_))
        ));
        assert_eq!(manager.query_count(), 0);
        assert_eq!(manager.result_count(), 4);
    }

    #[test]
    fn test_result_at_exact_lifetime_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));

        let mut boundary = QueryResult::failed(1, 100);
        boundary.created_at = Utc::now() - chrono::Duration::seconds(60);
        manager.shared.results.push(100, boundary).unwrap();
        assert_eq!(manager.cleanup_results(), 0);

        let mut expired = QueryResult::failed(1, 101);
        expired.created_at = Utc::now() - chrono::Duration::seconds(61);
        manager.shared.results.push(101, expired).unwrap();
        assert_eq!(manager.cleanup_results(), 1);
        assert!(manager.try_pop_result(100).is_some());
    }

    #[test]
    fn test_concurrent_pushes_respect_query_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path(), settings(1)));

        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| manager.push_query(dummy_query(1)).is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = submitters.into_iter().map(|s| s.join().unwrap()).sum();
        assert_eq!(admitted, 4);
        assert_eq!(manager.query_count(), 4);
    }

    #[test]
    fn test_try_pop_result_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));
        assert!(manager.try_pop_result(1).is_none());

        manager.start_workers().unwrap();
        let query_id = manager.push_query(dummy_query(77)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let result = loop {
            if let Some(result) = manager.try_pop_result(query_id) {
                break result;
            }
            assert!(std::time::Instant::now() < deadline, "worker never finished");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(result.status(), ResultStatus::Failed);
        assert!(manager.try_pop_result(query_id).is_none());
        manager.stop_workers().unwrap();
    }

    #[test]
    fn test_unknown_dataset_yields_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));
        manager.start_workers().unwrap();

        let query_id = manager.push_query(dummy_query(77)).unwrap();
        let result = manager.pop_result(query_id).unwrap();
        assert_eq!(result.status(), ResultStatus::Failed);
        assert_eq!(result.query_id, query_id);
        manager.stop_workers().unwrap();
    }

    #[test]
    fn test_pop_result_fails_once_workers_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), settings(1));
        assert!(matches!(
            manager.pop_result(42),
            Err(SsesError::WorkerFailure(_))
        ));
    }

    fn write_source(path: &Path) {
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "id,med,side,c3,c4,c5,c6,c7,age,gender").unwrap();
        writeln!(file, "1,1,5,,,,,,30,1").unwrap();
        writeln!(file, "1,2,5,,,,,,30,1").unwrap();
        writeln!(file, "2,2,6,,,,,,40,2").unwrap();
        writeln!(file, "3,1,5,,,,,,30,1").unwrap();
        writeln!(file, "3,1,6,,,,,,30,1").unwrap();
    }

    #[test]
    fn test_concurrent_queries_each_get_one_result() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.csv");
        write_source(&source);

        let mut config = settings(3);
        config.max_concurrent_queries = 16;
        config.max_results = 16;
        let manager = Arc::new(manager(dir.path(), config));

        let keys = manager.keys();
        let key_id = keys
            .create(&ContextSettings {
                degree: 2048,
                plaintext_modulus: 65537,
                moduli_sizes: vec![62; 5],
            })
            .unwrap();
        let material = keys.public_material(key_id).unwrap();
        manager
            .datasets()
            .setup(keys.engine().as_ref(), key_id, &source, &material.ctx, &material.pk)
            .unwrap();
        let enc_mask = keys
            .engine()
            .serialize_ciphertext(&keys.engine().encrypt(&material.ctx, &material.pk, -35).unwrap())
            .unwrap();
        assert!(keys.file_path(key_id, KeyKind::SecretKey).exists());

        manager.start_workers().unwrap();
        let clients: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let enc_mask = enc_mask.clone();
                std::thread::spawn(move || {
                    let query = Query {
                        key_id,
                        param: ComputationParam::for_server(&[1], &[5]),
                        enc_mask: CiphertextBuffer::single(enc_mask),
                    };
                    let query_id = manager.push_query(query).unwrap();
                    let result = manager.pop_result(query_id).unwrap();
                    assert_eq!(result.query_id, query_id);
                    assert_eq!(result.status(), ResultStatus::Success);
                    assert_eq!(result.chunks, vec![vec![1, 3]]);
                    query_id
                })
            })
            .collect();

        let ids: BTreeSet<_> = clients.into_iter().map(|c| c.join().unwrap()).collect();
        assert_eq!(ids.len(), 6);
        assert_eq!(manager.result_count(), 0);
        manager.stop_workers().unwrap();
    }
}
