use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MetaError;

/// Timestamp type (milliseconds since epoch) for log segments.
pub type EpochMs = u64;

/// Block number within a segment.
pub type BlockNum = u16;

/// Serialized size of one block summary (blkNum + highTs + lowTs + recCount).
pub const SIZE_OF_BLOCK_SUMMARY: u64 = 18;
/// Serialized size of one column offset entry (blkNum + len + offset).
pub const SIZE_OF_BLOCK_INFO: u64 = 14;
/// Assumed average column name length when estimating offset-map key bytes.
pub const AVG_COLUMN_NAME_LEN: u64 = 10;
/// In-memory size of one metrics block summary (blkNum + highTs + lowTs).
pub const SIZE_OF_METRICS_BLOCK_SUMMARY: u64 = 10;

/// Inclusive time window `[start_ms, end_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: EpochMs,
    pub end_ms: EpochMs,
}

impl TimeRange {
    /// Builds a range, rejecting `start > end`.
    pub fn new(start_ms: EpochMs, end_ms: EpochMs) -> Result<Self, MetaError> {
        if start_ms > end_ms {
            return Err(MetaError::InvalidTimeRange {
                start: start_ms,
                end: end_ms,
            });
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Range covering every representable timestamp.
    pub fn all() -> Self {
        Self {
            start_ms: 0,
            end_ms: EpochMs::MAX,
        }
    }

    /// True when `[low, high]` shares at least one instant with this range.
    #[inline]
    pub fn overlaps(&self, low: EpochMs, high: EpochMs) -> bool {
        self.start_ms <= high && self.end_ms >= low
    }
}

/// Per-column on-disk sizes recorded at segment seal time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColSizeInfo {
    /// Bytes of the column's micro-index file.
    #[serde(rename = "cmiSize", default)]
    pub cmi_size: u64,
    /// Bytes of the column's consistent-value (raw column) file.
    #[serde(rename = "csgSize", default)]
    pub csg_size: u64,
}

/// Static description of a sealed segment, as produced by ingestion or read from the
/// segment-list snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegMeta {
    #[serde(rename = "segmentKey")]
    pub segment_key: String,
    #[serde(rename = "virtualTableName", default)]
    pub table: String,
    #[serde(rename = "orgid", default)]
    pub org_id: u64,
    #[serde(rename = "earliestEpochMs", default)]
    pub earliest_ms: EpochMs,
    #[serde(rename = "latestEpochMs", default)]
    pub latest_ms: EpochMs,
    #[serde(rename = "segbaseDir", default)]
    pub segbase_dir: String,
    #[serde(rename = "recordCount", default)]
    pub record_count: u64,
    #[serde(rename = "bytesReceivedCount", default)]
    pub bytes_received: u64,
    #[serde(rename = "onDiskBytes", default)]
    pub on_disk_bytes: u64,
    #[serde(rename = "columnNames", default)]
    pub column_sizes: HashMap<String, ColSizeInfo>,
    #[serde(rename = "numBlocks", default)]
    pub num_blocks: u16,
}

/// Time bounds and record count of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSummary {
    pub low_ts: EpochMs,
    pub high_ts: EpochMs,
    pub record_count: u16,
}

/// Byte location of one column's data inside a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnOffset {
    pub offset: i64,
    pub len: u32,
}

/// Column byte offsets for a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMetadataHolder {
    pub block_num: BlockNum,
    pub column_offsets: HashMap<String, ColumnOffset>,
}

/// Numeric interpretation of a range-index entry. Discriminants are the on-disk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NumericKind {
    Unsigned = 0,
    Signed = 1,
    Float64 = 2,
}

impl TryFrom<u8> for NumericKind {
    type Error = MetaError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(NumericKind::Unsigned),
            1 => Ok(NumericKind::Signed),
            2 => Ok(NumericKind::Float64),
            other => Err(MetaError::corrupt(
                format!("unknown numeric kind {}", other),
                None,
            )),
        }
    }
}

/// Inclusive `[min, max]` bounds of a numeric column within one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeBounds {
    Unsigned { min: u64, max: u64 },
    Signed { min: i64, max: i64 },
    Float64 { min: f64, max: f64 },
}

impl RangeBounds {
    pub fn kind(&self) -> NumericKind {
        match self {
            RangeBounds::Unsigned { .. } => NumericKind::Unsigned,
            RangeBounds::Signed { .. } => NumericKind::Signed,
            RangeBounds::Float64 { .. } => NumericKind::Float64,
        }
    }
}

/// Name of the block-summary file for a segment.
pub fn block_summary_path(segment_key: &str) -> PathBuf {
    PathBuf::from(format!("{}.bsu", segment_key))
}

/// Name of the micro-index file for one column of a segment.
///
/// The column name is hashed so arbitrary names map onto safe, fixed-length file names.
pub fn micro_index_path(segment_key: &str, column: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}.cmi",
        segment_key,
        crate::encoding::crc32(column.as_bytes())
    ))
}

/// Name of the metrics block-summary file for a metrics segment directory.
pub fn metrics_block_summary_path(segment_dir: &str) -> PathBuf {
    PathBuf::from(format!("{}.mbsu", segment_dir))
}

/// Resolves `file` relative to `root` unless it is already absolute.
pub(crate) fn resolve(root: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        root.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_inclusive_on_both_ends() {
        let r = TimeRange::new(5, 25).unwrap();
        assert!(r.overlaps(0, 10));
        assert!(r.overlaps(20, 30));
        assert!(r.overlaps(25, 40));
        assert!(r.overlaps(0, 5));
        assert!(!r.overlaps(26, 40));
        assert!(!r.overlaps(0, 4));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(matches!(
            TimeRange::new(10, 1),
            Err(MetaError::InvalidTimeRange { start: 10, end: 1 })
        ));
    }

    #[test]
    fn micro_index_path_is_stable_per_column() {
        let a = micro_index_path("seg/0", "status");
        let b = micro_index_path("seg/0", "status");
        let c = micro_index_path("seg/0", "latency");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string_lossy().starts_with("seg/0_"));
        assert!(a.to_string_lossy().ends_with(".cmi"));
    }

    #[test]
    fn segmeta_reads_camel_case_json_names() {
        let json = r#"{"segmentKey":"s1","virtualTableName":"evts","latestEpochMs":9,
            "columnNames":{"a":{"cmiSize":45,"csgSize":9067}},"numBlocks":12,"orgid":3}"#;
        let meta: SegMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.segment_key, "s1");
        assert_eq!(meta.table, "evts");
        assert_eq!(meta.latest_ms, 9);
        assert_eq!(meta.earliest_ms, 0);
        assert_eq!(meta.num_blocks, 12);
        assert_eq!(meta.org_id, 3);
        assert_eq!(meta.column_sizes["a"].cmi_size, 45);
    }
}
