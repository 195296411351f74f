//! Metadata registry for metrics segments.
//!
//! Metrics segments carry a single lazy tier, their block summaries, and are keyed by their
//! segment directory. Time is tracked in epoch seconds.

use crate::encoding::{decode_metrics_block_summaries, MetricsBlockSummary};
use crate::error::MetaError;
use crate::micro_index::LoadContext;
use crate::pool::WorkerPool;
use crate::rebalance::{rebalance_tier, RebalanceReport, Tier, TierOps};
use crate::telemetry::{meta_metrics, MetaEvent};
use crate::types::{metrics_block_summary_path, resolve, BlockNum, SIZE_OF_METRICS_BLOCK_SUMMARY};

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Inclusive window in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricsTimeRange {
    pub start_sec: u32,
    pub end_sec: u32,
}

impl MetricsTimeRange {
    pub fn new(start_sec: u32, end_sec: u32) -> Result<Self, MetaError> {
        if start_sec > end_sec {
            return Err(MetaError::InvalidTimeRange {
                start: start_sec as u64,
                end: end_sec as u64,
            });
        }
        Ok(Self { start_sec, end_sec })
    }

    #[inline]
    pub fn overlaps(&self, low: u32, high: u32) -> bool {
        self.start_sec <= high && self.end_sec >= low
    }
}

/// Static description of a sealed metrics segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsMeta {
    #[serde(rename = "mSegmentDir")]
    pub segment_dir: String,
    #[serde(rename = "numBlocks", default)]
    pub num_blocks: u16,
    #[serde(rename = "bytesReceivedCount", default)]
    pub bytes_received: u64,
    #[serde(rename = "onDiskBytes", default)]
    pub on_disk_bytes: u64,
    #[serde(rename = "tagKeys", default)]
    pub tag_keys: HashSet<String>,
    #[serde(rename = "earliestEpochSec", default)]
    pub earliest_sec: u32,
    #[serde(rename = "latestEpochSec", default)]
    pub latest_sec: u32,
    /// Directory of the time-series tree this segment belongs to.
    #[serde(rename = "TTreeDir", default)]
    pub ttree_dir: String,
    #[serde(rename = "approximateDatapointCount", default)]
    pub datapoint_count: u64,
    #[serde(rename = "orgid", default)]
    pub org_id: u64,
}

/// One metrics segment with its lazily-resident block summaries.
#[derive(Debug)]
pub struct MetricsSegmentMeta {
    meta: MetricsMeta,
    block_summary_size: u64,
    summaries: RwLock<Option<Arc<Vec<MetricsBlockSummary>>>>,
}

impl MetricsSegmentMeta {
    pub fn new(meta: MetricsMeta) -> Self {
        Self {
            block_summary_size: meta.num_blocks as u64 * SIZE_OF_METRICS_BLOCK_SUMMARY,
            meta,
            summaries: RwLock::new(None),
        }
    }

    pub fn meta(&self) -> &MetricsMeta {
        &self.meta
    }

    pub fn segment_dir(&self) -> &str {
        &self.meta.segment_dir
    }

    pub fn block_summary_size(&self) -> u64 {
        self.block_summary_size
    }

    fn slot(&self) -> RwLockReadGuard<'_, Option<Arc<Vec<MetricsBlockSummary>>>> {
        self.summaries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_slot(&self, value: Option<Arc<Vec<MetricsBlockSummary>>>) {
        *self.summaries.write().unwrap_or_else(|p| p.into_inner()) = value;
    }

    pub fn is_search_metadata_loaded(&self) -> bool {
        self.slot().is_some()
    }

    pub fn block_summaries(&self) -> Option<Arc<Vec<MetricsBlockSummary>>> {
        self.slot().clone()
    }

    fn read_block_summaries(&self, ctx: &LoadContext) -> Result<Vec<MetricsBlockSummary>, MetaError> {
        let file = metrics_block_summary_path(&self.meta.segment_dir);
        ctx.blob.download_if_absent(&file)?;
        let path = resolve(ctx.blob.local_root(), &file);
        let buf = fs::read(&path)?;
        decode_metrics_block_summaries(&buf, Some(&path))
    }

    /// Reads and installs the block summaries; on failure the tier stays cleared.
    pub fn load_search_metadata(&self, ctx: &LoadContext) -> Result<(), MetaError> {
        match self.read_block_summaries(ctx) {
            Ok(summaries) => {
                self.set_slot(Some(Arc::new(summaries)));
                Ok(())
            }
            Err(e) => {
                self.set_slot(None);
                Err(e)
            }
        }
    }

    pub fn clear_search_metadata(&self) {
        self.set_slot(None);
    }
}

/// Blocks of one metrics segment that overlap a query window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSearchRequest {
    pub segment_dir: String,
    pub ttree_dir: String,
    pub blocks_to_search: BTreeSet<BlockNum>,
    pub block_summary_file: PathBuf,
    pub tag_keys: HashSet<String>,
    pub latest_sec: u32,
}

#[derive(Debug, Default)]
struct MetricsDirectory {
    by_recency: Arc<Vec<Arc<MetricsSegmentMeta>>>,
    by_dir: HashMap<String, Arc<MetricsSegmentMeta>>,
}

/// Directory of every metrics segment on this node.
#[derive(Debug)]
pub struct MetricsSegmentRegistry {
    dir: RwLock<MetricsDirectory>,
    ctx: LoadContext,
}

impl MetricsSegmentRegistry {
    pub fn new(ctx: LoadContext) -> Self {
        Self {
            dir: RwLock::new(MetricsDirectory::default()),
            ctx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MetricsDirectory> {
        self.dir.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Adds every segment whose directory is not yet registered. Duplicates are ignored.
    pub fn register(&self, batch: impl IntoIterator<Item = MetricsMeta>) -> Result<(), MetaError> {
        let mut dir = self.dir.write()?;
        let mut added = Vec::new();
        for meta in batch {
            if dir.by_dir.contains_key(&meta.segment_dir) {
                continue;
            }
            let entry = Arc::new(MetricsSegmentMeta::new(meta));
            dir.by_dir.insert(entry.segment_dir().to_string(), Arc::clone(&entry));
            added.push(entry);
        }
        let list = Arc::make_mut(&mut dir.by_recency);
        list.extend(added);
        list.sort_by_key(|m| Reverse(m.meta().latest_sec));
        meta_metrics::record_metrics_segments(dir.by_dir.len());
        Ok(())
    }

    pub fn delete(&self, segment_dir: &str) -> Result<(), MetaError> {
        let mut dir = self.dir.write()?;
        let entry = dir
            .by_dir
            .remove(segment_dir)
            .ok_or_else(|| MetaError::SegmentNotFound(segment_dir.to_string()))?;
        Arc::make_mut(&mut dir.by_recency).retain(|m| !Arc::ptr_eq(m, &entry));
        meta_metrics::record_metrics_segments(dir.by_dir.len());
        Ok(())
    }

    pub fn lookup(&self, segment_dir: &str) -> Option<Arc<MetricsSegmentMeta>> {
        self.read().by_dir.get(segment_dir).cloned()
    }

    pub fn segment_count(&self) -> usize {
        self.read().by_dir.len()
    }

    /// Every metrics segment, newest first.
    pub fn recency_snapshot(&self) -> Arc<Vec<Arc<MetricsSegmentMeta>>> {
        Arc::clone(&self.read().by_recency)
    }

    /// Keeps block summaries resident for the newest segments that fit `budget`.
    pub fn rebalance(&self, budget: u64, pool: &WorkerPool) -> RebalanceReport {
        let ops = MetricsSearchMetadataOps { ctx: &self.ctx };
        rebalance_tier(&self.recency_snapshot(), budget, &ops, pool, self.ctx.events.as_ref())
    }

    /// Search requests for every segment overlapping `range`, grouped by time-series tree.
    ///
    /// `org_id` of `None` matches every tenant. Summaries that are not resident are read for
    /// this call only; a segment whose summaries cannot be read is reported and skipped.
    pub fn search_requests(
        &self,
        range: &MetricsTimeRange,
        org_id: Option<u64>,
    ) -> HashMap<String, Vec<MetricsSearchRequest>> {
        let mut out: HashMap<String, Vec<MetricsSearchRequest>> = HashMap::new();
        for entry in self.overlapping(range, org_id) {
            let summaries = match entry.block_summaries() {
                Some(s) => s,
                None => match entry.read_block_summaries(&self.ctx) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        self.ctx.events.on_event(MetaEvent::SegmentLoadFailed {
                            segment: entry.segment_dir().to_string(),
                            tier: Tier::MetricsSearchMetadata,
                            error: e.to_string(),
                        });
                        continue;
                    }
                },
            };
            let blocks: BTreeSet<BlockNum> = summaries
                .iter()
                .filter(|s| range.overlaps(s.low_ts, s.high_ts))
                .map(|s| s.block_num)
                .collect();
            if blocks.is_empty() {
                continue;
            }
            let meta = entry.meta();
            out.entry(meta.ttree_dir.clone())
                .or_default()
                .push(MetricsSearchRequest {
                    segment_dir: meta.segment_dir.clone(),
                    ttree_dir: meta.ttree_dir.clone(),
                    blocks_to_search: blocks,
                    block_summary_file: metrics_block_summary_path(&meta.segment_dir),
                    tag_keys: meta.tag_keys.clone(),
                    latest_sec: meta.latest_sec,
                });
        }
        out
    }

    /// Union of tag keys over segments of `org_id` overlapping `range`.
    pub fn unique_tag_keys(&self, range: &MetricsTimeRange, org_id: u64) -> HashSet<String> {
        self.overlapping(range, Some(org_id))
            .into_iter()
            .flat_map(|m| m.meta().tag_keys.clone())
            .collect()
    }

    fn overlapping(&self, range: &MetricsTimeRange, org_id: Option<u64>) -> Vec<Arc<MetricsSegmentMeta>> {
        self.recency_snapshot()
            .iter()
            .filter(|m| {
                let meta = m.meta();
                org_id.map_or(true, |o| o == meta.org_id) && range.overlaps(meta.earliest_sec, meta.latest_sec)
            })
            .cloned()
            .collect()
    }
}

struct MetricsSearchMetadataOps<'a> {
    ctx: &'a LoadContext,
}

impl TierOps<MetricsSegmentMeta> for MetricsSearchMetadataOps<'_> {
    fn tier(&self) -> Tier {
        Tier::MetricsSearchMetadata
    }

    fn key(&self, item: &MetricsSegmentMeta) -> String {
        item.segment_dir().to_string()
    }

    fn charge(&self, item: &MetricsSegmentMeta) -> u64 {
        item.block_summary_size()
    }

    fn resident_size(&self, item: &MetricsSegmentMeta) -> u64 {
        item.block_summary_size()
    }

    fn is_loaded(&self, item: &MetricsSegmentMeta) -> bool {
        item.is_search_metadata_loaded()
    }

    fn clear(&self, item: &MetricsSegmentMeta) {
        item.clear_search_metadata()
    }

    fn load(&self, item: &MetricsSegmentMeta) -> Result<(), MetaError> {
        item.load_search_metadata(self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_metrics_block_summaries;
    use tempfile::tempdir;

    fn mmeta(dir: &str, tree: &str, org: u64, earliest: u32, latest: u32, blocks: u16) -> MetricsMeta {
        MetricsMeta {
            segment_dir: dir.to_string(),
            ttree_dir: tree.to_string(),
            org_id: org,
            earliest_sec: earliest,
            latest_sec: latest,
            num_blocks: blocks,
            tag_keys: [format!("{}-host", dir)].into_iter().collect(),
            ..MetricsMeta::default()
        }
    }

    fn write_summaries(root: &std::path::Path, dir: &str, ranges: &[(u32, u32)]) {
        let summaries: Vec<MetricsBlockSummary> = ranges
            .iter()
            .enumerate()
            .map(|(i, (low, high))| MetricsBlockSummary {
                block_num: i as BlockNum,
                low_ts: *low,
                high_ts: *high,
            })
            .collect();
        fs::write(root.join(metrics_block_summary_path(dir)), encode_metrics_block_summaries(&summaries)).unwrap();
    }

    #[test]
    fn duplicates_are_ignored_and_unknown_delete_fails() {
        let reg = MetricsSegmentRegistry::new(LoadContext::local(std::env::temp_dir()));
        reg.register([mmeta("m1", "t", 0, 0, 10, 1), mmeta("m2", "t", 0, 0, 20, 1)]).unwrap();
        reg.register([mmeta("m1", "t", 0, 0, 99, 1)]).unwrap();
        assert_eq!(reg.segment_count(), 2);
        assert_eq!(reg.recency_snapshot()[0].segment_dir(), "m2");
        assert_eq!(reg.lookup("m1").unwrap().meta().latest_sec, 10);

        assert!(matches!(reg.delete("nope"), Err(MetaError::SegmentNotFound(_))));
        reg.delete("m1").unwrap();
        assert_eq!(reg.segment_count(), 1);
    }

    #[test]
    fn search_requests_group_by_tree_without_promoting() {
        let root = tempdir().unwrap();
        write_summaries(root.path(), "m1", &[(0, 10), (11, 20)]);
        write_summaries(root.path(), "m2", &[(30, 40)]);
        let reg = MetricsSegmentRegistry::new(LoadContext::local(root.path()));
        reg.register([
            mmeta("m1", "treeA", 1, 0, 20, 2),
            mmeta("m2", "treeB", 1, 30, 40, 1),
            mmeta("m3", "treeA", 2, 0, 20, 1),
        ])
        .unwrap();

        let range = MetricsTimeRange::new(15, 35).unwrap();
        let reqs = reg.search_requests(&range, Some(1));
        assert_eq!(reqs["treeA"].len(), 1);
        assert_eq!(reqs["treeA"][0].blocks_to_search, BTreeSet::from([1]));
        assert_eq!(reqs["treeB"][0].segment_dir, "m2");
        assert!(!reg.lookup("m1").unwrap().is_search_metadata_loaded());

        let tags = reg.unique_tag_keys(&range, 1);
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn rebalance_loads_newest_within_budget() {
        let root = tempdir().unwrap();
        write_summaries(root.path(), "old", &[(0, 5)]);
        write_summaries(root.path(), "new", &[(6, 9)]);
        let reg = MetricsSegmentRegistry::new(LoadContext::local(root.path()));
        reg.register([mmeta("old", "t", 0, 0, 5, 1), mmeta("new", "t", 0, 6, 9, 1)]).unwrap();

        let pool = WorkerPool::new(2).unwrap();
        let report = reg.rebalance(SIZE_OF_METRICS_BLOCK_SUMMARY, &pool);
        assert_eq!(report.tier, Tier::MetricsSearchMetadata);
        assert_eq!(report.loaded, 1);
        assert!(reg.lookup("new").unwrap().is_search_metadata_loaded());
        assert!(!reg.lookup("old").unwrap().is_search_metadata_loaded());
    }
}
