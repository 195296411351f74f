//! Budget-driven residency for the lazy metadata tiers.
//!
//! Each pass walks segments newest first, keeps the longest prefix whose charged bytes fit the
//! budget, clears the tier on everything past the prefix, then loads what the prefix is missing.

use crate::error::MetaError;
use crate::micro_index::{BlockSelection, ColumnSelection, LoadContext, SegmentMicroIndex};
use crate::pool::WorkerPool;
use crate::registry::MetadataRegistry;
use crate::telemetry::{meta_metrics, MetaEvent, MetaEventListener};
use crate::tracker::PersistentColumns;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A lazily-resident metadata section with its own byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Per-block column bloom and range containers of log segments.
    MicroIndex,
    /// Block summaries and column offsets of log segments.
    SearchMetadata,
    /// Block summaries of metrics segments.
    MetricsSearchMetadata,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::MicroIndex => "micro_index",
            Tier::SearchMetadata => "search_metadata",
            Tier::MetricsSearchMetadata => "metrics_search_metadata",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rebalance pass over one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub tier: Tier,
    pub budget_bytes: u64,
    /// Number of newest segments that should hold the tier.
    pub resident_prefix: usize,
    pub evicted: usize,
    pub loaded: usize,
    pub failed: usize,
    /// Tier bytes of the segments resident after the pass.
    pub resident_bytes: u64,
    pub resident_count: usize,
    pub duration: Duration,
}

/// Length of the longest prefix of `charges` whose running sum stays within `budget`.
pub fn resident_prefix_len(charges: impl IntoIterator<Item = u64>, budget: u64) -> usize {
    let mut total = 0u64;
    let mut k = 0usize;
    for charge in charges {
        match total.checked_add(charge) {
            Some(next) if next <= budget => {
                total = next;
                k += 1;
            }
            _ => break,
        }
    }
    k
}

/// How one tier is measured, tested, loaded and cleared on an entry type.
pub(crate) trait TierOps<T>: Sync {
    fn tier(&self) -> Tier;
    fn key(&self, item: &T) -> String;
    /// Bytes charged against the budget when deciding the resident prefix.
    fn charge(&self, item: &T) -> u64;
    /// Bytes reported as resident once the tier is loaded.
    fn resident_size(&self, item: &T) -> u64;
    fn is_loaded(&self, item: &T) -> bool;
    fn clear(&self, item: &T);
    fn load(&self, item: &T) -> Result<(), MetaError>;
}

/// Runs one greedy pass of `ops` over `items`, which must be ordered newest first.
pub(crate) fn rebalance_tier<T, O>(
    items: &[Arc<T>],
    budget: u64,
    ops: &O,
    pool: &WorkerPool,
    events: &dyn MetaEventListener,
) -> RebalanceReport
where
    T: Send + Sync,
    O: TierOps<T>,
{
    let started = Instant::now();
    let k = resident_prefix_len(items.iter().map(|i| ops.charge(i)), budget);

    let mut evicted = 0usize;
    for item in &items[k..] {
        if ops.is_loaded(item) {
            ops.clear(item);
            evicted += 1;
        }
    }

    let mut resident_bytes = 0u64;
    let mut resident_count = 0usize;
    let mut to_load: Vec<Arc<T>> = Vec::new();
    for item in &items[..k] {
        if ops.is_loaded(item) {
            resident_bytes += ops.resident_size(item);
            resident_count += 1;
        } else {
            to_load.push(Arc::clone(item));
        }
    }

    let results = pool.map(&to_load, |item| ops.load(item));
    let mut loaded = 0usize;
    let mut failed = 0usize;
    for (item, result) in to_load.iter().zip(results) {
        match result {
            Ok(()) if ops.is_loaded(item) => {
                loaded += 1;
                resident_bytes += ops.resident_size(item);
                resident_count += 1;
            }
            Ok(()) => {}
            Err(e) => {
                failed += 1;
                events.on_event(MetaEvent::SegmentLoadFailed {
                    segment: ops.key(item),
                    tier: ops.tier(),
                    error: e.to_string(),
                });
            }
        }
    }

    let duration = started.elapsed();
    meta_metrics::record_rebalance(
        ops.tier(),
        duration,
        resident_bytes,
        resident_count,
        evicted,
        loaded,
        failed,
    );
    events.on_event(MetaEvent::RebalanceCompleted {
        tier: ops.tier(),
        budget_bytes: budget,
        resident_bytes,
        resident_count,
        evicted,
        loaded,
        duration,
    });

    RebalanceReport {
        tier: ops.tier(),
        budget_bytes: budget,
        resident_prefix: k,
        evicted,
        loaded,
        failed,
        resident_bytes,
        resident_count,
        duration,
    }
}

struct MicroIndexOps<'a> {
    ctx: &'a LoadContext,
    persistent: &'a dyn PersistentColumns,
}

impl TierOps<SegmentMicroIndex> for MicroIndexOps<'_> {
    fn tier(&self) -> Tier {
        Tier::MicroIndex
    }

    fn key(&self, item: &SegmentMicroIndex) -> String {
        item.segment_key().to_string()
    }

    // A segment with micro-indices resident also needs its search metadata to be pruned,
    // so both are charged here.
    fn charge(&self, item: &SegmentMicroIndex) -> u64 {
        item.micro_index_size() + item.search_metadata_size()
    }

    fn resident_size(&self, item: &SegmentMicroIndex) -> u64 {
        item.micro_index_size()
    }

    fn is_loaded(&self, item: &SegmentMicroIndex) -> bool {
        item.is_micro_indices_loaded()
    }

    fn clear(&self, item: &SegmentMicroIndex) {
        item.clear_micro_indices()
    }

    fn load(&self, item: &SegmentMicroIndex) -> Result<(), MetaError> {
        let table = item.table();
        let mut columns = self
            .persistent
            .persistent_columns(&table, item.org_id())
            .map_err(|e| {
                self.ctx.events.on_event(MetaEvent::PersistentColumnsFailed {
                    table: table.clone(),
                    error: e.to_string(),
                });
                e
            })?;
        columns.extend(item.columns());
        item.load_micro_indices(&BlockSelection::All, &ColumnSelection::Only(columns), self.ctx)
    }
}

struct SearchMetadataOps<'a> {
    ctx: &'a LoadContext,
}

impl TierOps<SegmentMicroIndex> for SearchMetadataOps<'_> {
    fn tier(&self) -> Tier {
        Tier::SearchMetadata
    }

    fn key(&self, item: &SegmentMicroIndex) -> String {
        item.segment_key().to_string()
    }

    fn charge(&self, item: &SegmentMicroIndex) -> u64 {
        item.search_metadata_size()
    }

    fn resident_size(&self, item: &SegmentMicroIndex) -> u64 {
        item.search_metadata_size()
    }

    fn is_loaded(&self, item: &SegmentMicroIndex) -> bool {
        item.is_search_metadata_loaded()
    }

    fn clear(&self, item: &SegmentMicroIndex) {
        item.clear_search_metadata()
    }

    fn load(&self, item: &SegmentMicroIndex) -> Result<(), MetaError> {
        item.load_search_metadata(self.ctx)
    }
}

/// Keeps micro-indices resident for the newest segments that fit `budget`.
///
/// Each segment is charged its micro-index plus search-metadata size. Loads read the
/// segment's known columns together with the table's persistent-query columns.
pub fn rebalance_micro_indices(
    registry: &MetadataRegistry,
    budget: u64,
    pool: &WorkerPool,
    persistent: &dyn PersistentColumns,
) -> RebalanceReport {
    let ctx = registry.load_context();
    let ops = MicroIndexOps { ctx, persistent };
    rebalance_tier(&registry.recency_snapshot(), budget, &ops, pool, ctx.events.as_ref())
}

/// Keeps search metadata resident for the newest segments that fit `budget`.
pub fn rebalance_search_metadata(registry: &MetadataRegistry, budget: u64, pool: &WorkerPool) -> RebalanceReport {
    let ctx = registry.load_context();
    let ops = SearchMetadataOps { ctx };
    rebalance_tier(&registry.recency_snapshot(), budget, &ops, pool, ctx.events.as_ref())
}
