//! Process-wide directory of sealed segments.
//!
//! Three views are kept in lockstep under one registry lock: a recency list (newest
//! `latest_ms` first), a key index, and per-table recency lists. Lists are shared as
//! `Arc<Vec<_>>` snapshots so readers can walk them after the lock is released; the lock
//! never guards file I/O.

use crate::error::MetaError;
use crate::micro_index::{LoadContext, SegmentMicroIndex};
use crate::telemetry::{meta_metrics, MetaEvent};
use crate::types::{BlockMetadataHolder, BlockNum, BlockSummary, EpochMs, SegMeta, TimeRange};

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

pub type SegmentList = Arc<Vec<Arc<SegmentMicroIndex>>>;

#[derive(Debug, Default)]
struct Directory {
    by_recency: SegmentList,
    by_key: HashMap<String, Arc<SegmentMicroIndex>>,
    by_table: HashMap<String, SegmentList>,
}

impl Directory {
    fn remove_key(&mut self, key: &str) -> bool {
        let Some(smi) = self.by_key.remove(key) else {
            return false;
        };
        Arc::make_mut(&mut self.by_recency).retain(|s| !Arc::ptr_eq(s, &smi));
        let table = smi.table();
        if let Some(bucket) = self.by_table.get_mut(&table) {
            Arc::make_mut(bucket).retain(|s| !Arc::ptr_eq(s, &smi));
            if bucket.is_empty() {
                self.by_table.remove(&table);
            }
        }
        true
    }

    fn publish_counts(&self) {
        meta_metrics::record_registry_size(self.by_key.len(), self.by_table.len());
    }
}

fn sort_by_recency(list: &mut Vec<Arc<SegmentMicroIndex>>) {
    list.sort_by_cached_key(|s| Reverse(s.latest_ms()));
}

/// Segments of a query that survived the segment-level time filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeFilteredSegments {
    /// table -> segment key -> the segment's own time bounds.
    pub by_table: HashMap<String, HashMap<String, TimeRange>>,
    pub passed: u64,
    pub checked: u64,
}

/// Directory of every known segment on this node.
#[derive(Debug)]
pub struct MetadataRegistry {
    dir: RwLock<Directory>,
    ctx: LoadContext,
}

impl MetadataRegistry {
    pub fn new(ctx: LoadContext) -> Self {
        Self {
            dir: RwLock::new(Directory::default()),
            ctx,
        }
    }

    /// Collaborators used for loads issued on behalf of the registry.
    pub fn load_context(&self) -> &LoadContext {
        &self.ctx
    }

    fn read(&self) -> RwLockReadGuard<'_, Directory> {
        self.dir.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a batch of segments. Keys already present are merged field by field;
    /// a failed merge is reported and skipped.
    ///
    /// The whole batch, including the re-sort, is applied under one exclusive lock.
    pub fn register(&self, batch: Vec<SegmentMicroIndex>) -> Result<(), MetaError> {
        let mut dir = self.dir.write()?;
        let mut touched: HashSet<String> = HashSet::new();
        let mut added: Vec<Arc<SegmentMicroIndex>> = Vec::new();

        for incoming in batch {
            if let Some(existing) = dir.by_key.get(incoming.segment_key()) {
                if let Err(e) = existing.merge_from(&incoming.seg_meta()) {
                    self.ctx.events.on_event(MetaEvent::MergeConflict {
                        segment: incoming.segment_key().to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
                touched.insert(existing.table());
                continue;
            }
            let smi = Arc::new(incoming);
            dir.by_key.insert(smi.segment_key().to_string(), Arc::clone(&smi));
            added.push(smi);
        }

        let by_recency = Arc::make_mut(&mut dir.by_recency);
        by_recency.extend(added.iter().cloned());
        sort_by_recency(by_recency);

        for smi in added {
            let table = smi.table();
            let bucket = dir.by_table.entry(table.clone()).or_default();
            Arc::make_mut(bucket).push(smi);
            touched.insert(table);
        }
        for table in touched {
            if let Some(bucket) = dir.by_table.get_mut(&table) {
                sort_by_recency(Arc::make_mut(bucket));
            }
        }
        dir.publish_counts();
        Ok(())
    }

    /// Builds entities from raw segment metadata and registers them.
    pub fn register_segmetas(&self, metas: impl IntoIterator<Item = SegMeta>) -> Result<(), MetaError> {
        self.register(metas.into_iter().map(SegmentMicroIndex::new).collect())
    }

    /// Removes `key` from every view. Unknown keys are a no-op.
    pub fn delete(&self, key: &str) -> Result<(), MetaError> {
        let mut dir = self.dir.write()?;
        if !dir.remove_key(key) {
            self.ctx.events.on_event(MetaEvent::StaleDelete {
                segment: key.to_string(),
            });
        }
        dir.publish_counts();
        Ok(())
    }

    pub fn delete_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<(), MetaError> {
        let mut dir = self.dir.write()?;
        for key in keys {
            if !dir.remove_key(key) {
                self.ctx.events.on_event(MetaEvent::StaleDelete {
                    segment: key.to_string(),
                });
            }
        }
        dir.publish_counts();
        Ok(())
    }

    /// Removes every segment of `table` owned by `org_id`.
    pub fn delete_table(&self, table: &str, org_id: u64) -> Result<(), MetaError> {
        let mut dir = self.dir.write()?;
        let keys: Vec<String> = match dir.by_table.get(table) {
            Some(bucket) => bucket
                .iter()
                .filter(|s| s.org_id() == org_id)
                .map(|s| s.segment_key().to_string())
                .collect(),
            None => return Ok(()),
        };
        for key in &keys {
            dir.remove_key(key);
        }
        dir.publish_counts();
        Ok(())
    }

    /// Drops every segment whose key is not in `owned`. Returns how many were removed.
    pub fn discard_unowned_segments(&self, owned: &HashSet<String>) -> Result<usize, MetaError> {
        let mut dir = self.dir.write()?;
        let unowned: Vec<String> = dir
            .by_key
            .keys()
            .filter(|k| !owned.contains(*k))
            .cloned()
            .collect();
        for key in &unowned {
            dir.remove_key(key);
        }
        dir.publish_counts();
        Ok(unowned.len())
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<SegmentMicroIndex>> {
        self.read().by_key.get(key).cloned()
    }

    /// Segments of `table`, newest first.
    pub fn table_candidates(&self, table: &str) -> Option<SegmentList> {
        self.read().by_table.get(table).cloned()
    }

    /// Every segment, newest first.
    pub fn recency_snapshot(&self) -> SegmentList {
        Arc::clone(&self.read().by_recency)
    }

    pub fn segment_count(&self) -> usize {
        self.read().by_key.len()
    }

    pub fn table_count(&self) -> usize {
        self.read().by_table.len()
    }

    /// `false` when the table has no sealed segment or the query ends after its newest one,
    /// i.e. not-yet-sealed data must also be searched.
    pub fn is_time_range_fully_resident(&self, table: &str, query_end: EpochMs) -> bool {
        let dir = self.read();
        match dir.by_table.get(table).and_then(|b| b.first()) {
            Some(newest) => query_end <= newest.latest_ms(),
            None => false,
        }
    }

    pub fn num_blocks(&self, key: &str) -> Option<u16> {
        self.lookup(key).map(|s| s.num_blocks())
    }

    /// Sum of block counts over `keys`; unknown keys count zero.
    pub fn total_blocks<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> u64 {
        let dir = self.read();
        keys.into_iter()
            .filter_map(|k| dir.by_key.get(k))
            .map(|s| s.num_blocks() as u64)
            .sum()
    }

    pub fn record_count(&self, key: &str) -> Option<u64> {
        self.lookup(key).map(|s| s.record_count())
    }

    /// Segments of `tables` owned by `org_id` whose bounds overlap `range`.
    pub fn filter_segments_by_time(&self, range: &TimeRange, tables: &[String], org_id: u64) -> TimeFilteredSegments {
        let dir = self.read();
        let mut out = TimeFilteredSegments::default();
        for table in tables {
            let Some(bucket) = dir.by_table.get(table) else {
                continue;
            };
            for smi in bucket.iter() {
                let (earliest, latest) = (smi.earliest_ms(), smi.latest_ms());
                if smi.org_id() == org_id && range.overlaps(earliest, latest) {
                    out.by_table.entry(table.clone()).or_default().insert(
                        smi.segment_key().to_string(),
                        TimeRange {
                            start_ms: earliest,
                            end_ms: latest,
                        },
                    );
                    out.passed += 1;
                }
            }
            out.checked += bucket.len() as u64;
        }
        out
    }

    /// Union of columns of the segments `filter_segments_by_time` would return.
    pub fn columns_for_tables_by_time_range(&self, range: &TimeRange, tables: &[String], org_id: u64) -> HashSet<String> {
        let dir = self.read();
        let mut cols = HashSet::new();
        for bucket in tables.iter().filter_map(|t| dir.by_table.get(t)) {
            for smi in bucket.iter() {
                if smi.org_id() == org_id && range.overlaps(smi.earliest_ms(), smi.latest_ms()) {
                    cols.extend(smi.columns());
                }
            }
        }
        cols
    }

    pub fn does_column_exist_for_table(&self, column: &str, tables: &[String]) -> bool {
        let dir = self.read();
        tables
            .iter()
            .filter_map(|t| dir.by_table.get(t))
            .any(|bucket| bucket.iter().any(|s| s.has_column(column)))
    }

    pub fn all_column_names(&self, tables: &[String]) -> HashSet<String> {
        let dir = self.read();
        let mut cols = HashSet::new();
        for bucket in tables.iter().filter_map(|t| dir.by_table.get(t)) {
            for smi in bucket.iter() {
                cols.extend(smi.columns());
            }
        }
        cols
    }

    /// Column names of one segment, or `None` if the key is unknown.
    pub fn columns_for_segment(&self, key: &str) -> Option<HashSet<String>> {
        self.lookup(key).map(|s| s.columns())
    }

    pub fn all_segment_keys(&self) -> Vec<String> {
        self.read().by_key.keys().cloned().collect()
    }

    pub fn all_segment_keys_for_org(&self, org_id: u64) -> Vec<String> {
        self.read()
            .by_key
            .values()
            .filter(|s| s.org_id() == org_id)
            .map(|s| s.segment_key().to_string())
            .collect()
    }

    /// Time span covered by blocks of `key` that overlap `range` but are absent from
    /// `present_blocks`. `None` when every overlapping block is present.
    ///
    /// Search metadata loaded here is cleared again before returning.
    pub fn ts_range_for_missing_blocks(
        &self,
        key: &str,
        range: &TimeRange,
        present_blocks: &HashSet<BlockNum>,
    ) -> Result<Option<TimeRange>, MetaError> {
        let smi = self
            .lookup(key)
            .ok_or_else(|| MetaError::SegmentNotFound(key.to_string()))?;
        let summaries = self.summaries_without_promotion(&smi)?;

        let mut span: Option<TimeRange> = None;
        for (i, summary) in summaries.iter().enumerate() {
            if !range.overlaps(summary.low_ts, summary.high_ts) || present_blocks.contains(&(i as BlockNum)) {
                continue;
            }
            span = Some(match span {
                None => TimeRange {
                    start_ms: summary.low_ts,
                    end_ms: summary.high_ts,
                },
                Some(r) => TimeRange {
                    start_ms: r.start_ms.min(summary.low_ts),
                    end_ms: r.end_ms.max(summary.high_ts),
                },
            });
        }
        Ok(span)
    }

    /// Block summaries of `key`, read from disk when not resident. Residency is unchanged.
    pub fn block_summaries_for_key(&self, key: &str) -> Result<Arc<Vec<BlockSummary>>, MetaError> {
        let smi = self
            .lookup(key)
            .ok_or_else(|| MetaError::SegmentNotFound(key.to_string()))?;
        self.summaries_without_promotion(&smi)
    }

    /// Block-to-column offsets of `key`, read from disk when not resident. Residency is unchanged.
    pub fn block_search_info_for_key(
        &self,
        key: &str,
    ) -> Result<Arc<HashMap<BlockNum, BlockMetadataHolder>>, MetaError> {
        let smi = self
            .lookup(key)
            .ok_or_else(|| MetaError::SegmentNotFound(key.to_string()))?;
        if let Some(offsets) = smi.block_offsets() {
            return Ok(offsets);
        }
        let (_, offsets) = smi.read_search_metadata(&self.ctx)?;
        Ok(Arc::new(offsets))
    }

    fn summaries_without_promotion(&self, smi: &SegmentMicroIndex) -> Result<Arc<Vec<BlockSummary>>, MetaError> {
        if let Some(summaries) = smi.block_summaries() {
            return Ok(summaries);
        }
        let (summaries, _) = smi.read_search_metadata(&self.ctx)?;
        Ok(Arc::new(summaries))
    }
}
