//! Service context: configuration, owned registries and the background rebalance thread.

use crate::blob::{BlobStore, LocalBlobStore};
use crate::error::MetaError;
use crate::metrics_segments::MetricsSegmentRegistry;
use crate::micro_index::{LoadContext, ReservedColumns};
use crate::pool::WorkerPool;
use crate::prune::IndexPruner;
use crate::rebalance::{rebalance_micro_indices, rebalance_search_metadata, RebalanceReport};
use crate::registry::MetadataRegistry;
use crate::snapshot::{self, METRICS_META_FILE, SEGMETA_FILE};
use crate::telemetry::{noop_event_listener, MetaEvent, MetaEventListener};
use crate::tracker::{NoPersistentColumns, PersistentColumns};

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Commands sent to the background rebalance thread.
enum RebalanceCommand {
    Rebalance { ack: mpsc::Sender<RebalanceSummary> },
    Shutdown,
}

/// Configuration options for the [`MetaService`].
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Local directory holding segment files and the segment-list snapshots.
    pub data_dir: PathBuf,
    /// Worker threads used for parallel loads and pruning.
    pub parallelism: usize,
    /// Bytes the background loop treats as available to metadata on each pass.
    pub total_memory_bytes: u64,
    /// Share of available memory for micro-indices.
    pub micro_index_mem_percent: u8,
    /// Share of available memory for block summaries and column offsets.
    pub search_metadata_mem_percent: u8,
    /// Part of the search-metadata share given to log segments.
    pub metadata_logs_mem_percent: u8,
    /// Part of the search-metadata share given to metrics segments.
    pub metadata_metrics_mem_percent: u8,
    pub timestamp_key: String,
    /// Internal columns that never carry micro-indices.
    pub reserved_columns: Vec<String>,
    /// Also probe blooms with the original spelling of each search term.
    pub dual_case_search: bool,
    pub rebalance_interval: Duration,
    /// Where segment files are fetched from. Defaults to files already under `data_dir`.
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub persistent_columns: Arc<dyn PersistentColumns>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn MetaEventListener>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        MetaConfig {
            data_dir: PathBuf::from("./data"),
            parallelism: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            total_memory_bytes: 512 * 1024 * 1024,
            micro_index_mem_percent: 35,
            search_metadata_mem_percent: 20,
            metadata_logs_mem_percent: 30,
            metadata_metrics_mem_percent: 70,
            timestamp_key: "timestamp".to_string(),
            reserved_columns: vec!["_type".to_string(), "_index".to_string()],
            dual_case_search: false,
            rebalance_interval: crate::DEFAULT_REBALANCE_INTERVAL,
            blob_store: None,
            persistent_columns: Arc::new(NoPersistentColumns),
            event_listener: noop_event_listener(),
        }
    }
}

impl MetaConfig {
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.parallelism == 0 {
            return Err(MetaError::ConfigError("parallelism must be at least 1".into()));
        }
        for (name, pct) in [
            ("micro_index_mem_percent", self.micro_index_mem_percent),
            ("search_metadata_mem_percent", self.search_metadata_mem_percent),
            ("metadata_logs_mem_percent", self.metadata_logs_mem_percent),
            ("metadata_metrics_mem_percent", self.metadata_metrics_mem_percent),
        ] {
            if pct > 100 {
                return Err(MetaError::ConfigError(format!("{} must be at most 100, got {}", name, pct)));
            }
        }
        if self.micro_index_mem_percent as u16 + self.search_metadata_mem_percent as u16 > 100 {
            return Err(MetaError::ConfigError(
                "micro_index_mem_percent + search_metadata_mem_percent exceeds 100".into(),
            ));
        }
        if self.metadata_logs_mem_percent as u16 + self.metadata_metrics_mem_percent as u16 > 100 {
            return Err(MetaError::ConfigError(
                "metadata_logs_mem_percent + metadata_metrics_mem_percent exceeds 100".into(),
            ));
        }
        if self.rebalance_interval.is_zero() {
            return Err(MetaError::ConfigError("rebalance_interval must be non-zero".into()));
        }
        if self.timestamp_key.is_empty() {
            return Err(MetaError::ConfigError("timestamp_key must not be empty".into()));
        }
        Ok(())
    }

    fn load_context(&self) -> LoadContext {
        let blob = self
            .blob_store
            .clone()
            .unwrap_or_else(|| Arc::new(LocalBlobStore::new(self.data_dir.clone())));
        LoadContext::new(
            blob,
            ReservedColumns::new(self.timestamp_key.clone(), self.reserved_columns.iter().cloned()),
            Arc::clone(&self.event_listener),
        )
    }
}

/// Byte budgets for one rebalance round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudgets {
    pub micro_index: u64,
    pub search_metadata_logs: u64,
    pub search_metadata_metrics: u64,
}

impl MemoryBudgets {
    pub fn split(available_bytes: u64, config: &MetaConfig) -> Self {
        let search = percent_of(available_bytes, config.search_metadata_mem_percent);
        MemoryBudgets {
            micro_index: percent_of(available_bytes, config.micro_index_mem_percent),
            search_metadata_logs: percent_of(search, config.metadata_logs_mem_percent),
            search_metadata_metrics: percent_of(search, config.metadata_metrics_mem_percent),
        }
    }
}

fn percent_of(bytes: u64, pct: u8) -> u64 {
    (bytes as u128 * pct as u128 / 100) as u64
}

/// Reports of every tier touched by one rebalance round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceSummary {
    pub budgets: MemoryBudgets,
    pub search_metadata: RebalanceReport,
    pub metrics_search_metadata: RebalanceReport,
    pub micro_index: RebalanceReport,
}

#[derive(Debug)]
struct ServiceInner {
    config: MetaConfig,
    registry: Arc<MetadataRegistry>,
    metrics: Arc<MetricsSegmentRegistry>,
    pool: Arc<WorkerPool>,
    // Serializes rounds so one pass never clears what another is loading.
    rebalance_lock: Mutex<()>,
}

impl ServiceInner {
    fn rebalance(&self, available_bytes: u64) -> RebalanceSummary {
        let _round = self.rebalance_lock.lock().unwrap_or_else(|p| p.into_inner());
        let budgets = MemoryBudgets::split(available_bytes, &self.config);
        let search_metadata = rebalance_search_metadata(&self.registry, budgets.search_metadata_logs, &self.pool);
        let metrics_search_metadata = self.metrics.rebalance(budgets.search_metadata_metrics, &self.pool);
        let micro_index = rebalance_micro_indices(
            &self.registry,
            budgets.micro_index,
            &self.pool,
            self.config.persistent_columns.as_ref(),
        );
        RebalanceSummary {
            budgets,
            search_metadata,
            metrics_search_metadata,
            micro_index,
        }
    }
}

/// Owns the metadata registries, the worker pool and the optional rebalance thread.
#[derive(Debug)]
pub struct MetaService {
    inner: Arc<ServiceInner>,
    rebalance_cmd_tx: Option<mpsc::Sender<RebalanceCommand>>,
    rebalance_handle: Option<JoinHandle<()>>,
}

impl MetaService {
    /// Builds the registries and worker pool described by `config`.
    ///
    /// No thread is started; call [`MetaService::start_background_rebalance`] for periodic passes.
    pub fn with_config(config: MetaConfig) -> Result<Self, MetaError> {
        config.validate()?;
        let ctx = config.load_context();
        let pool = Arc::new(WorkerPool::new(config.parallelism)?);
        let registry = Arc::new(MetadataRegistry::new(ctx.clone()));
        let metrics = Arc::new(MetricsSegmentRegistry::new(ctx));
        Ok(MetaService {
            inner: Arc::new(ServiceInner {
                config,
                registry,
                metrics,
                pool,
                rebalance_lock: Mutex::new(()),
            }),
            rebalance_cmd_tx: None,
            rebalance_handle: None,
        })
    }

    pub fn config(&self) -> &MetaConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.inner.registry
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsSegmentRegistry> {
        &self.inner.metrics
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    pub fn pruner(&self) -> IndexPruner {
        IndexPruner::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.pool),
            self.inner.config.dual_case_search,
        )
    }

    /// Registers the segment lists stored under `data_dir`. Returns `(log, metrics)` counts read.
    pub fn load_snapshots(&self) -> Result<(usize, usize), MetaError> {
        let events = self.inner.config.event_listener.as_ref();
        let dir = &self.inner.config.data_dir;
        let segmetas = snapshot::read_segmeta_file(&dir.join(SEGMETA_FILE), events)?;
        let metrics = snapshot::read_metrics_meta_file(&dir.join(METRICS_META_FILE), events)?;
        let counts = (segmetas.len(), metrics.len());
        self.inner.registry.register_segmetas(segmetas)?;
        self.inner.metrics.register(metrics)?;
        Ok(counts)
    }

    /// Writes the currently registered segments back to the snapshot files under `data_dir`.
    pub fn persist_snapshots(&self) -> Result<(), MetaError> {
        let dir = &self.inner.config.data_dir;
        let segmetas: Vec<_> = self
            .inner
            .registry
            .recency_snapshot()
            .iter()
            .map(|s| s.seg_meta())
            .collect();
        snapshot::write_segmeta_file(&dir.join(SEGMETA_FILE), &segmetas)?;
        let metrics: Vec<_> = self
            .inner
            .metrics
            .recency_snapshot()
            .iter()
            .map(|m| m.meta().clone())
            .collect();
        snapshot::write_metrics_meta_file(&dir.join(METRICS_META_FILE), &metrics)
    }

    /// Runs one rebalance round on the calling thread.
    ///
    /// Search metadata for logs and metrics is balanced first, then micro-indices.
    pub fn rebalance_now(&self, available_bytes: u64) -> RebalanceSummary {
        self.inner.rebalance(available_bytes)
    }

    /// Spawns the thread that rebalances with `total_memory_bytes` every `rebalance_interval`.
    /// Calling it again while the thread runs does nothing.
    pub fn start_background_rebalance(&mut self) -> Result<(), MetaError> {
        if self.rebalance_handle.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<RebalanceCommand>();
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("segmeta-rebalance".into())
            .spawn(move || {
                let events = Arc::clone(&inner.config.event_listener);
                events.on_event(MetaEvent::RebalanceThreadStarted);
                loop {
                    match rx.recv_timeout(inner.config.rebalance_interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            inner.rebalance(inner.config.total_memory_bytes);
                        }
                        Ok(RebalanceCommand::Rebalance { ack }) => {
                            let summary = inner.rebalance(inner.config.total_memory_bytes);
                            let _ = ack.send(summary);
                        }
                        Ok(RebalanceCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            events.on_event(MetaEvent::RebalanceThreadStopping);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| MetaError::BackgroundTaskError(format!("Failed to spawn rebalance thread: {}", e)))?;
        self.rebalance_cmd_tx = Some(tx);
        self.rebalance_handle = Some(handle);
        Ok(())
    }

    /// Asks the background thread for an immediate round and waits for its summary.
    pub fn trigger_rebalance(&self) -> Result<RebalanceSummary, MetaError> {
        let cmd_tx = self
            .rebalance_cmd_tx
            .as_ref()
            .ok_or_else(|| MetaError::BackgroundTaskError("rebalance thread not started".into()))?;
        let (tx, rx) = mpsc::channel();
        cmd_tx
            .send(RebalanceCommand::Rebalance { ack: tx })
            .map_err(|e| MetaError::BackgroundTaskError(format!("Failed to send rebalance command: {}", e)))?;
        rx.recv()
            .map_err(|e| MetaError::BackgroundTaskError(format!("Failed to receive rebalance summary: {}", e)))
    }

    pub fn is_background_rebalance_running(&self) -> bool {
        self.rebalance_handle.is_some()
    }
}

impl Drop for MetaService {
    fn drop(&mut self) {
        if let Some(tx) = self.rebalance_cmd_tx.take() {
            let _ = tx.send(RebalanceCommand::Shutdown);
        }
        if let Some(handle) = self.rebalance_handle.take() {
            if handle.join().is_err() {
                self.inner.config.event_listener.on_event(MetaEvent::RebalanceThreadPanicked);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingEventListener;
    use tempfile::tempdir;

    #[test]
    fn budgets_split_by_percentages() {
        let config = MetaConfig::default();
        let b = MemoryBudgets::split(1000, &config);
        assert_eq!(b.micro_index, 350);
        assert_eq!(b.search_metadata_logs, 60);
        assert_eq!(b.search_metadata_metrics, 140);

        let huge = MemoryBudgets::split(u64::MAX, &config);
        assert!(huge.micro_index < u64::MAX);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = MetaConfig::default();
        assert!(config.validate().is_ok());
        config.parallelism = 0;
        assert!(matches!(config.validate(), Err(MetaError::ConfigError(_))));

        let mut config = MetaConfig::default();
        config.metadata_logs_mem_percent = 50;
        config.metadata_metrics_mem_percent = 60;
        assert!(config.validate().is_err());

        let mut config = MetaConfig::default();
        config.micro_index_mem_percent = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn background_thread_answers_and_stops_on_drop() {
        let dir = tempdir().unwrap();
        let events = Arc::new(RecordingEventListener::new());
        let config = MetaConfig {
            data_dir: dir.path().to_path_buf(),
            parallelism: 2,
            rebalance_interval: Duration::from_secs(3600),
            event_listener: events.clone(),
            ..MetaConfig::default()
        };
        let mut service = MetaService::with_config(config).unwrap();
        assert!(service.trigger_rebalance().is_err());
        service.start_background_rebalance().unwrap();
        let summary = service.trigger_rebalance().unwrap();
        assert_eq!(summary.micro_index.resident_count, 0);
        drop(service);

        let seen = events.events();
        assert!(matches!(seen.first(), Some(MetaEvent::RebalanceThreadStarted)));
        assert!(seen.iter().any(|e| matches!(e, MetaEvent::RebalanceThreadStopping)));
    }
}
