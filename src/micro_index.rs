//! Per-segment metadata entity with two independently lazy sections:
//! per-block column micro-indices and block search metadata.

use crate::blob::BlobStore;
use crate::encoding::{decode_block_summaries, IndexContainer, MicroIndexRecords};
use crate::error::MetaError;
use crate::telemetry::{MetaEvent, MetaEventListener};
use crate::types::{
    block_summary_path, micro_index_path, resolve, BlockMetadataHolder, BlockNum, BlockSummary, EpochMs,
    SegMeta, AVG_COLUMN_NAME_LEN, SIZE_OF_BLOCK_INFO, SIZE_OF_BLOCK_SUMMARY,
};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Which blocks a micro-index load should decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelection {
    All,
    Only(HashSet<BlockNum>),
}

impl BlockSelection {
    #[inline]
    pub fn contains(&self, block: BlockNum) -> bool {
        match self {
            BlockSelection::All => true,
            BlockSelection::Only(set) => set.contains(&block),
        }
    }
}

/// Which columns a micro-index load should read. `Wildcard` means every known column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelection {
    Wildcard,
    Only(HashSet<String>),
}

/// Columns that never carry a micro-index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedColumns {
    pub timestamp_key: String,
    pub internal: HashSet<String>,
}

impl ReservedColumns {
    pub fn new(timestamp_key: impl Into<String>, internal: impl IntoIterator<Item = String>) -> Self {
        Self {
            timestamp_key: timestamp_key.into(),
            internal: internal.into_iter().collect(),
        }
    }

    #[inline]
    pub fn is_reserved(&self, column: &str) -> bool {
        column == self.timestamp_key || self.internal.contains(column)
    }
}

impl Default for ReservedColumns {
    fn default() -> Self {
        Self::new("timestamp", ["_type".to_string(), "_index".to_string()])
    }
}

/// Collaborators every load needs: where files live, which columns to skip, where to report.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub blob: Arc<dyn BlobStore>,
    pub reserved: ReservedColumns,
    pub events: Arc<dyn MetaEventListener>,
}

impl LoadContext {
    pub fn new(blob: Arc<dyn BlobStore>, reserved: ReservedColumns, events: Arc<dyn MetaEventListener>) -> Self {
        Self { blob, reserved, events }
    }

    /// Context for segment files already on local disk under `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(crate::blob::LocalBlobStore::new(root)),
            ReservedColumns::default(),
            crate::telemetry::noop_event_listener(),
        )
    }
}

/// Micro-index bytes charged to the cache budget: the sum of the per-column file sizes.
pub fn micro_index_size(meta: &SegMeta) -> u64 {
    meta.column_sizes.values().map(|c| c.cmi_size).sum()
}

/// Search-metadata bytes charged to the cache budget, estimated from block and column counts.
pub fn search_metadata_size(meta: &SegMeta) -> u64 {
    let blocks = meta.num_blocks as u64;
    let cols = meta.column_sizes.len() as u64;
    blocks * SIZE_OF_BLOCK_SUMMARY + blocks * cols * SIZE_OF_BLOCK_INFO + blocks * 2 * AVG_COLUMN_NAME_LEN * cols
}

/// Containers of one block, keyed by column name.
pub type BlockContainers = HashMap<String, Arc<IndexContainer>>;

#[derive(Debug, Default)]
struct MicroIndices {
    /// Index `b` holds the containers of block `b`.
    blocks: Vec<BlockContainers>,
    loaded: bool,
}

#[derive(Debug, Default)]
struct SearchMetadata {
    summaries: Option<Arc<Vec<BlockSummary>>>,
    offsets: Option<Arc<HashMap<BlockNum, BlockMetadataHolder>>>,
}

#[derive(Debug, Default)]
struct LazySections {
    micro: MicroIndices,
    search: SearchMetadata,
}

/// One sealed segment: its static summary plus lazily-resident index sections.
#[derive(Debug)]
pub struct SegmentMicroIndex {
    segment_key: String,
    meta: RwLock<SegMeta>,
    micro_index_size: AtomicU64,
    search_metadata_size: AtomicU64,
    sections: RwLock<LazySections>,
}

impl SegmentMicroIndex {
    pub fn new(meta: SegMeta) -> Self {
        Self {
            segment_key: meta.segment_key.clone(),
            micro_index_size: AtomicU64::new(micro_index_size(&meta)),
            search_metadata_size: AtomicU64::new(search_metadata_size(&meta)),
            meta: RwLock::new(meta),
            sections: RwLock::new(LazySections::default()),
        }
    }

    pub fn segment_key(&self) -> &str {
        &self.segment_key
    }

    fn meta_read(&self) -> RwLockReadGuard<'_, SegMeta> {
        self.meta.read().unwrap_or_else(|p| p.into_inner())
    }

    fn sections_read(&self) -> RwLockReadGuard<'_, LazySections> {
        self.sections.read().unwrap_or_else(|p| p.into_inner())
    }

    fn with_sections_mut<R>(&self, f: impl FnOnce(&mut LazySections) -> R) -> R {
        let mut guard = self.sections.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Copy of the static summary.
    pub fn seg_meta(&self) -> SegMeta {
        self.meta_read().clone()
    }

    pub fn table(&self) -> String {
        self.meta_read().table.clone()
    }

    pub fn org_id(&self) -> u64 {
        self.meta_read().org_id
    }

    pub fn earliest_ms(&self) -> EpochMs {
        self.meta_read().earliest_ms
    }

    pub fn latest_ms(&self) -> EpochMs {
        self.meta_read().latest_ms
    }

    pub fn num_blocks(&self) -> u16 {
        self.meta_read().num_blocks
    }

    pub fn record_count(&self) -> u64 {
        self.meta_read().record_count
    }

    /// Names of every column recorded for the segment.
    pub fn columns(&self) -> HashSet<String> {
        self.meta_read().column_sizes.keys().cloned().collect()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.meta_read().column_sizes.contains_key(column)
    }

    #[inline]
    pub fn micro_index_size(&self) -> u64 {
        self.micro_index_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn search_metadata_size(&self) -> u64 {
        self.search_metadata_size.load(Ordering::Relaxed)
    }

    /// Fills every field of `self` that is still zero or empty from `other`.
    ///
    /// Fields that already hold a value are never overwritten.
    pub fn merge_from(&self, other: &SegMeta) -> Result<(), MetaError> {
        if other.segment_key != self.segment_key {
            return Err(MetaError::MergeKeyMismatch {
                left: self.segment_key.clone(),
                right: other.segment_key.clone(),
            });
        }
        let mut meta = self.meta.write()?;
        if meta.earliest_ms == 0 && other.earliest_ms != 0 {
            meta.earliest_ms = other.earliest_ms;
        }
        if meta.latest_ms == 0 && other.latest_ms != 0 {
            meta.latest_ms = other.latest_ms;
        }
        if meta.segbase_dir.is_empty() && !other.segbase_dir.is_empty() {
            meta.segbase_dir = other.segbase_dir.clone();
        }
        if meta.column_sizes.is_empty() && !other.column_sizes.is_empty() {
            meta.column_sizes = other.column_sizes.clone();
        }
        if meta.num_blocks == 0 && other.num_blocks != 0 {
            meta.num_blocks = other.num_blocks;
        }
        if meta.record_count == 0 && other.record_count != 0 {
            meta.record_count = other.record_count;
        }
        let _ = self.micro_index_size.compare_exchange(
            0,
            micro_index_size(other),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        let _ = self.search_metadata_size.compare_exchange(
            0,
            search_metadata_size(other),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        Ok(())
    }

    // --- micro-index section ---

    pub fn is_micro_indices_loaded(&self) -> bool {
        self.sections_read().micro.loaded
    }

    /// Reads the per-column micro-index files and installs the decoded containers.
    ///
    /// A column whose file is missing contributes no containers. A file that fails to decode
    /// keeps the containers read before the bad record and is otherwise skipped. If the
    /// download itself fails the section is left cleared and the error returned.
    pub fn load_micro_indices(
        &self,
        blocks: &BlockSelection,
        columns: &ColumnSelection,
        ctx: &LoadContext,
    ) -> Result<(), MetaError> {
        match self.read_micro_indices(blocks, columns, ctx) {
            Ok(loaded) => {
                self.with_sections_mut(|s| {
                    s.micro = MicroIndices {
                        blocks: loaded,
                        loaded: true,
                    }
                });
                Ok(())
            }
            Err(e) => {
                self.clear_micro_indices();
                Err(e)
            }
        }
    }

    /// Reads micro-index files into a private copy without touching the resident section.
    pub(crate) fn read_micro_indices(
        &self,
        blocks: &BlockSelection,
        columns: &ColumnSelection,
        ctx: &LoadContext,
    ) -> Result<Vec<BlockContainers>, MetaError> {
        let (table, num_blocks, known) = {
            let meta = self.meta_read();
            (
                meta.table.clone(),
                meta.num_blocks as usize,
                meta.column_sizes.keys().cloned().collect::<Vec<_>>(),
            )
        };
        if table.contains(".kibana") {
            return Ok(Vec::new());
        }

        let requested: Vec<String> = match columns {
            ColumnSelection::Wildcard => known,
            ColumnSelection::Only(set) => set.iter().cloned().collect(),
        };
        let mut files: HashMap<PathBuf, String> = HashMap::with_capacity(requested.len());
        for column in requested {
            if column.is_empty() {
                return Err(MetaError::MissingColumnName {
                    segment: self.segment_key.clone(),
                });
            }
            if ctx.reserved.is_reserved(&column) {
                continue;
            }
            files.insert(micro_index_path(&self.segment_key, &column), column);
        }
        for failure in ctx.blob.bulk_download_if_absent(&files)? {
            ctx.events.on_event(MetaEvent::MicroIndexFileSkipped {
                segment: self.segment_key.clone(),
                column: failure.tag,
                error: format!("{}: {}", failure.file.display(), failure.error),
            });
        }

        let mut out: Vec<BlockContainers> = Vec::new();
        out.resize_with(num_blocks, HashMap::new);
        for (file, column) in &files {
            let path = resolve(ctx.blob.local_root(), file);
            let buf = match fs::read(&path) {
                Ok(buf) => buf,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    ctx.events.on_event(MetaEvent::MicroIndexFileSkipped {
                        segment: self.segment_key.clone(),
                        column: column.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            for record in MicroIndexRecords::new(&buf) {
                let decoded = record.and_then(|(block, payload)| {
                    if !blocks.contains(block) {
                        return Ok(None);
                    }
                    IndexContainer::decode(payload).map(|c| Some((block, c)))
                });
                match decoded {
                    Ok(Some((block, container))) => {
                        let idx = block as usize;
                        if out.len() <= idx {
                            out.resize_with(idx + 1, HashMap::new);
                        }
                        out[idx].insert(column.clone(), Arc::new(container));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        ctx.events.on_event(MetaEvent::MicroIndexFileSkipped {
                            segment: self.segment_key.clone(),
                            column: column.clone(),
                            error: format!("{}: {}", path.display(), e),
                        });
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn clear_micro_indices(&self) {
        self.with_sections_mut(|s| s.micro = MicroIndices::default());
    }

    /// Containers of every indexed column for `block`.
    pub fn cmis_for_block(&self, block: BlockNum) -> Result<HashMap<String, Arc<IndexContainer>>, MetaError> {
        self.read_sections().cmis_for_block(block).cloned()
    }

    pub fn cmi_for_block_and_column(&self, block: BlockNum, column: &str) -> Result<Arc<IndexContainer>, MetaError> {
        self.read_sections().cmi_for_block_and_column(block, column).cloned()
    }

    // --- search-metadata section ---

    pub fn is_search_metadata_loaded(&self) -> bool {
        self.sections_read().search.summaries.is_some()
    }

    /// Reads and installs the block-summary file. Any malformed record fails the whole load
    /// and leaves the section cleared.
    pub fn load_search_metadata(&self, ctx: &LoadContext) -> Result<(), MetaError> {
        match self.read_search_metadata(ctx) {
            Ok((summaries, offsets)) => {
                self.with_sections_mut(|s| {
                    s.search = SearchMetadata {
                        summaries: Some(Arc::new(summaries)),
                        offsets: Some(Arc::new(offsets)),
                    }
                });
                Ok(())
            }
            Err(e) => {
                self.clear_search_metadata();
                Err(e)
            }
        }
    }

    /// Parses the block-summary file without touching the resident section.
    pub(crate) fn read_search_metadata(
        &self,
        ctx: &LoadContext,
    ) -> Result<(Vec<BlockSummary>, HashMap<BlockNum, BlockMetadataHolder>), MetaError> {
        let file = block_summary_path(&self.segment_key);
        ctx.blob.download_if_absent(&file)?;
        let path = resolve(ctx.blob.local_root(), &file);
        let buf = fs::read(&path)?;
        let decoded = decode_block_summaries(&buf, Some(&path))?;
        Ok((decoded.summaries, decoded.offsets))
    }

    pub fn clear_search_metadata(&self) {
        self.with_sections_mut(|s| s.search = SearchMetadata::default());
    }

    /// Resident block summaries, if loaded.
    pub fn block_summaries(&self) -> Option<Arc<Vec<BlockSummary>>> {
        self.sections_read().search.summaries.clone()
    }

    /// Resident block-to-column offsets, if loaded.
    pub fn block_offsets(&self) -> Option<Arc<HashMap<BlockNum, BlockMetadataHolder>>> {
        self.sections_read().search.offsets.clone()
    }

    /// Shared view of both lazy sections, held until the returned guard drops.
    pub fn read_sections(&self) -> SectionsView<'_> {
        SectionsView {
            guard: self.sections_read(),
        }
    }
}

/// Read-locked view of a segment's lazy sections.
pub struct SectionsView<'a> {
    guard: RwLockReadGuard<'a, LazySections>,
}

impl<'a> SectionsView<'a> {
    pub fn micro_indices_loaded(&self) -> bool {
        self.guard.micro.loaded
    }

    pub fn cmis_for_block(&self, block: BlockNum) -> Result<&HashMap<String, Arc<IndexContainer>>, MetaError> {
        let micro = &self.guard.micro;
        if !micro.loaded || micro.blocks.is_empty() {
            return Err(MetaError::BlockNotFound { block });
        }
        micro
            .blocks
            .get(block as usize)
            .ok_or(MetaError::BlockNotFound { block })
    }

    pub fn cmi_for_block_and_column(&self, block: BlockNum, column: &str) -> Result<&Arc<IndexContainer>, MetaError> {
        self.cmis_for_block(block)?
            .get(column)
            .ok_or_else(|| MetaError::ColumnNotFound {
                block,
                column: column.to_string(),
            })
    }

    pub fn block_summaries(&self) -> Option<&Arc<Vec<BlockSummary>>> {
        self.guard.search.summaries.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encode_block_summary_record, encode_container_record, BlockBloom};
    use crate::telemetry::RecordingEventListener;
    use crate::types::{ColSizeInfo, ColumnOffset, RangeBounds};
    use tempfile::tempdir;

    fn meta(key: &str, cols: &[(&str, u64)], num_blocks: u16) -> SegMeta {
        SegMeta {
            segment_key: key.to_string(),
            table: "evts".to_string(),
            latest_ms: 10,
            num_blocks,
            column_sizes: cols
                .iter()
                .map(|(c, s)| (c.to_string(), ColSizeInfo { cmi_size: *s, csg_size: 0 }))
                .collect(),
            ..SegMeta::default()
        }
    }

    fn range_container(col: &str, min: u64, max: u64) -> IndexContainer {
        let mut ranges = HashMap::new();
        ranges.insert(col.to_string(), RangeBounds::Unsigned { min, max });
        IndexContainer::Range(ranges)
    }

    #[test]
    fn sizes_follow_column_and_block_counts() {
        let smi = SegmentMicroIndex::new(meta("s", &[("a", 45), ("b", 55)], 3));
        assert_eq!(smi.micro_index_size(), 100);
        assert_eq!(smi.search_metadata_size(), 3 * 18 + 3 * 2 * 14 + 3 * 2 * 10 * 2);
    }

    #[test]
    fn merge_only_fills_empty_fields() {
        let smi = SegmentMicroIndex::new(SegMeta {
            segment_key: "s".into(),
            latest_ms: 7,
            ..SegMeta::default()
        });
        smi.merge_from(&meta("s", &[("a", 45)], 4)).unwrap();
        let merged = smi.seg_meta();
        assert_eq!(merged.latest_ms, 7);
        assert_eq!(merged.num_blocks, 4);
        assert_eq!(smi.micro_index_size(), 45);

        let err = smi.merge_from(&meta("other", &[], 1)).unwrap_err();
        assert!(matches!(err, MetaError::MergeKeyMismatch { .. }));
    }

    #[test]
    fn loads_selected_blocks_and_skips_reserved_columns() {
        let dir = tempdir().unwrap();
        let mut file = Vec::new();
        for block in 0..3u16 {
            file.extend(encode_container_record(block, &range_container("latency", 10 * block as u64, 10 * block as u64 + 5)));
        }
        fs::write(dir.path().join(micro_index_path("s", "latency")), &file).unwrap();
        fs::write(dir.path().join(micro_index_path("s", "timestamp")), &file).unwrap();

        let smi = SegmentMicroIndex::new(meta("s", &[("latency", 1), ("timestamp", 1)], 3));
        let ctx = LoadContext::local(dir.path());
        let only: HashSet<BlockNum> = [0, 2].into_iter().collect();
        smi.load_micro_indices(&BlockSelection::Only(only), &ColumnSelection::Wildcard, &ctx)
            .unwrap();

        assert!(smi.is_micro_indices_loaded());
        assert!(smi.cmi_for_block_and_column(0, "latency").is_ok());
        assert!(smi.cmis_for_block(1).unwrap().is_empty());
        assert!(matches!(
            smi.cmi_for_block_and_column(2, "timestamp"),
            Err(MetaError::ColumnNotFound { .. })
        ));
        assert!(matches!(smi.cmis_for_block(9), Err(MetaError::BlockNotFound { block: 9 })));

        smi.clear_micro_indices();
        assert!(!smi.is_micro_indices_loaded());
        assert!(smi.cmis_for_block(0).is_err());
    }

    #[test]
    fn corrupt_file_keeps_earlier_containers_and_reports() {
        let dir = tempdir().unwrap();
        let mut file = encode_container_record(0, &range_container("bytes", 1, 2));
        let mut bloom = BlockBloom::new(4, 0.01);
        bloom.insert("x");
        file.extend(encode_container_record(1, &IndexContainer::Bloom(bloom)));
        // Unknown container tag for block 2.
        file.extend_from_slice(&3u32.to_le_bytes());
        file.extend_from_slice(&2u16.to_le_bytes());
        file.push(0x09);
        fs::write(dir.path().join(micro_index_path("s", "bytes")), &file).unwrap();

        let events = Arc::new(RecordingEventListener::new());
        let ctx = LoadContext::new(
            Arc::new(crate::blob::LocalBlobStore::new(dir.path())),
            ReservedColumns::default(),
            events.clone(),
        );
        let smi = SegmentMicroIndex::new(meta("s", &[("bytes", 1)], 3));
        smi.load_micro_indices(&BlockSelection::All, &ColumnSelection::Wildcard, &ctx)
            .unwrap();

        assert!(smi.cmi_for_block_and_column(0, "bytes").is_ok());
        assert!(smi.cmi_for_block_and_column(1, "bytes").is_ok());
        assert!(smi.cmi_for_block_and_column(2, "bytes").is_err());
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, MetaEvent::MicroIndexFileSkipped { column, .. } if column == "bytes")));
    }

    #[test]
    fn empty_column_name_fails_and_leaves_section_cleared() {
        let dir = tempdir().unwrap();
        let smi = SegmentMicroIndex::new(meta("s", &[("a", 1)], 1));
        let cols = ColumnSelection::Only(["".to_string()].into_iter().collect());
        let err = smi
            .load_micro_indices(&BlockSelection::All, &cols, &LoadContext::local(dir.path()))
            .unwrap_err();
        assert!(matches!(err, MetaError::MissingColumnName { .. }));
        assert!(!smi.is_micro_indices_loaded());
    }

    #[test]
    fn kibana_tables_load_empty() {
        let dir = tempdir().unwrap();
        let mut m = meta("s", &[("a", 1)], 1);
        m.table = ".kibana_1".to_string();
        let smi = SegmentMicroIndex::new(m);
        smi.load_micro_indices(&BlockSelection::All, &ColumnSelection::Wildcard, &LoadContext::local(dir.path()))
            .unwrap();
        assert!(smi.is_micro_indices_loaded());
        assert!(smi.cmis_for_block(0).is_err());
    }

    #[test]
    fn search_metadata_load_and_failure() {
        let dir = tempdir().unwrap();
        let ctx = LoadContext::local(dir.path());
        let smi = SegmentMicroIndex::new(meta("s", &[("a", 1)], 2));

        // Missing file is a hard error.
        assert!(smi.load_search_metadata(&ctx).is_err());
        assert!(!smi.is_search_metadata_loaded());

        let mut cols = HashMap::new();
        cols.insert("a".to_string(), ColumnOffset { offset: 0, len: 10 });
        let mut buf = encode_block_summary_record(0, &BlockSummary { low_ts: 0, high_ts: 10, record_count: 4 }, &cols);
        buf.extend(encode_block_summary_record(1, &BlockSummary { low_ts: 20, high_ts: 30, record_count: 4 }, &cols));
        fs::write(dir.path().join(block_summary_path("s")), &buf).unwrap();
        smi.load_search_metadata(&ctx).unwrap();
        assert_eq!(smi.block_summaries().unwrap().len(), 2);
        assert_eq!(smi.block_offsets().unwrap()[&1].column_offsets["a"].len, 10);

        fs::write(dir.path().join(block_summary_path("s")), &buf[..buf.len() - 2]).unwrap();
        assert!(matches!(smi.load_search_metadata(&ctx), Err(MetaError::Corruption { .. })));
        assert!(!smi.is_search_metadata_loaded());
        assert!(smi.block_summaries().is_none());
    }
}
