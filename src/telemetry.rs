use std::path::PathBuf;
use std::sync::Arc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::rebalance::Tier;

/// Structured, in-process event hook for observability.
///
/// This crate is a library and never prints. Callers provide an implementation that
/// forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait MetaEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: MetaEvent);
}

/// Structured events emitted by the registry, rebalancer and pruner.
#[derive(Debug, Clone)]
pub enum MetaEvent {
    RebalanceThreadStarted,
    RebalanceThreadStopping,
    RebalanceThreadPanicked,

    /// A lazy section failed to load; the segment stays unloaded for that tier.
    SegmentLoadFailed { segment: String, tier: Tier, error: String },
    /// One column's micro-index file could not be read or decoded.
    MicroIndexFileSkipped { segment: String, column: String, error: String },
    /// Persistent-column lookup failed, so the segment was skipped this round.
    PersistentColumnsFailed { table: String, error: String },

    MergeConflict { segment: String, error: String },
    /// Delete for a key that was not registered.
    StaleDelete { segment: String },
    /// A pruning request referenced a segment the registry does not know.
    UnknownSegment { segment: String, table: String },

    RebalanceCompleted {
        tier: Tier,
        budget_bytes: u64,
        resident_bytes: u64,
        resident_count: usize,
        evicted: usize,
        loaded: usize,
        duration: Duration,
    },

    SegmetaLineSkipped { path: PathBuf, line: usize, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl MetaEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: MetaEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn MetaEventListener> {
    Arc::new(NoopEventListener)
}

/// Listener that keeps every event in memory. Useful in tests and debugging tools.
#[derive(Debug, Default)]
pub struct RecordingEventListener {
    events: Mutex<Vec<MetaEvent>>,
}

impl RecordingEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of events received so far.
    pub fn events(&self) -> Vec<MetaEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetaEventListener for RecordingEventListener {
    fn on_event(&self, event: MetaEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is a no-op until a recorder is installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
/// - Per-tier series carry a `tier` label (`micro_index`, `search_metadata`, `metrics_search_metadata`).
pub mod meta_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const SEGMENTS: &str = "segmeta_segments";
    pub const TABLES: &str = "segmeta_tables";
    pub const METRICS_SEGMENTS: &str = "segmeta_metrics_segments";

    pub const RESIDENT_BYTES: &str = "segmeta_resident_bytes";
    pub const RESIDENT_ITEMS: &str = "segmeta_resident_items";
    pub const EVICTIONS: &str = "segmeta_evictions";
    pub const LOADS: &str = "segmeta_loads";
    pub const LOAD_FAILURES: &str = "segmeta_load_failures";
    pub const REBALANCE_DURATION_SECONDS: &str = "segmeta_rebalance_duration_seconds";

    pub const PRUNE_BLOCKS_CHECKED: &str = "segmeta_prune_blocks_checked";
    pub const PRUNE_BLOCKS_PASSED: &str = "segmeta_prune_blocks_passed";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl std::fmt::Debug for InProcessPrometheus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InProcessPrometheus")
                .field("stop", &self.stop)
                .finish_non_exhaustive()
        }
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("segmeta-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_registry_size(segments: usize, tables: usize) {
        ::metrics::gauge!(SEGMENTS).set(segments as f64);
        ::metrics::gauge!(TABLES).set(tables as f64);
    }

    #[inline]
    pub fn record_metrics_segments(segments: usize) {
        ::metrics::gauge!(METRICS_SEGMENTS).set(segments as f64);
    }

    pub fn record_rebalance(
        tier: Tier,
        duration: Duration,
        resident_bytes: u64,
        resident_count: usize,
        evicted: usize,
        loaded: usize,
        failed: usize,
    ) {
        let label = tier.as_str();
        ::metrics::histogram!(REBALANCE_DURATION_SECONDS, "tier" => label).record(duration.as_secs_f64());
        ::metrics::gauge!(RESIDENT_BYTES, "tier" => label).set(resident_bytes as f64);
        ::metrics::gauge!(RESIDENT_ITEMS, "tier" => label).set(resident_count as f64);
        if evicted > 0 {
            ::metrics::counter!(EVICTIONS, "tier" => label).increment(evicted as u64);
        }
        if loaded > 0 {
            ::metrics::counter!(LOADS, "tier" => label).increment(loaded as u64);
        }
        if failed > 0 {
            ::metrics::counter!(LOAD_FAILURES, "tier" => label).increment(failed as u64);
        }
    }

    #[inline]
    pub fn record_prune(checked: u64, passed: u64) {
        if checked > 0 {
            ::metrics::counter!(PRUNE_BLOCKS_CHECKED).increment(checked);
        }
        if passed > 0 {
            ::metrics::counter!(PRUNE_BLOCKS_PASSED).increment(passed);
        }
    }

    fn describe_all() {
        // Counters
        describe_counter!(EVICTIONS, Unit::Count, "Lazy sections cleared by rebalance.");
        describe_counter!(LOADS, Unit::Count, "Lazy sections loaded by rebalance.");
        describe_counter!(
            LOAD_FAILURES,
            Unit::Count,
            "Lazy section loads that failed during rebalance."
        );
        describe_counter!(
            PRUNE_BLOCKS_CHECKED,
            Unit::Count,
            "Blocks considered by the index pruner."
        );
        describe_counter!(
            PRUNE_BLOCKS_PASSED,
            Unit::Count,
            "Blocks the index pruner admitted for raw search."
        );

        // Histograms
        describe_histogram!(
            REBALANCE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of one tier rebalance."
        );

        // Gauges
        describe_gauge!(SEGMENTS, Unit::Count, "Segments in the metadata registry.");
        describe_gauge!(TABLES, Unit::Count, "Tables with at least one registered segment.");
        describe_gauge!(
            METRICS_SEGMENTS,
            Unit::Count,
            "Metrics segments in the metrics metadata registry."
        );
        describe_gauge!(
            RESIDENT_BYTES,
            Unit::Bytes,
            "Accounted bytes of resident metadata per tier after the last rebalance."
        );
        describe_gauge!(
            RESIDENT_ITEMS,
            Unit::Count,
            "Segments with the tier resident after the last rebalance."
        );
    }
}
