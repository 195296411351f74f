//! On-disk segment fixtures shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use segmeta::encoding::{encode_block_summary_record, encode_container_record, BlockBloom, IndexContainer};
use segmeta::types::{
    block_summary_path, micro_index_path, BlockNum, BlockSummary, ColSizeInfo, ColumnOffset, RangeBounds, SegMeta,
};

/// Writes `<key>.bsu` with one block per `(low, high)` pair. Every block lists `columns`.
pub fn write_block_summaries(root: &Path, key: &str, bounds: &[(u64, u64)], columns: &[&str]) {
    let mut buf = Vec::new();
    for (i, (low, high)) in bounds.iter().enumerate() {
        let offsets: HashMap<String, ColumnOffset> = columns
            .iter()
            .enumerate()
            .map(|(c, name)| {
                (
                    name.to_string(),
                    ColumnOffset {
                        offset: (i * 1000 + c * 100) as i64,
                        len: 100,
                    },
                )
            })
            .collect();
        let summary = BlockSummary {
            low_ts: *low,
            high_ts: *high,
            record_count: 10,
        };
        buf.extend(encode_block_summary_record(i as BlockNum, &summary, &offsets));
    }
    fs::write(root.join(block_summary_path(key)), buf).unwrap();
}

/// Writes a range micro-index file for `column`. Returns its size in bytes.
pub fn write_range_cmi(root: &Path, key: &str, column: &str, blocks: &[(BlockNum, RangeBounds)]) -> u64 {
    let mut buf = Vec::new();
    for (block, bounds) in blocks {
        let mut ranges = HashMap::new();
        ranges.insert(column.to_string(), *bounds);
        buf.extend(encode_container_record(*block, &IndexContainer::Range(ranges)));
    }
    let len = buf.len() as u64;
    fs::write(root.join(micro_index_path(key, column)), buf).unwrap();
    len
}

/// Writes a bloom micro-index file for `column`. Returns its size in bytes.
pub fn write_bloom_cmi(root: &Path, key: &str, column: &str, blocks: &[(BlockNum, &[&str])]) -> u64 {
    let mut buf = Vec::new();
    for (block, words) in blocks {
        let mut bloom = BlockBloom::new(words.len().max(16), 0.0001);
        for w in *words {
            bloom.insert(w);
        }
        buf.extend(encode_container_record(*block, &IndexContainer::Bloom(bloom)));
    }
    let len = buf.len() as u64;
    fs::write(root.join(micro_index_path(key, column)), buf).unwrap();
    len
}

pub fn segmeta(key: &str, table: &str, earliest: u64, latest: u64, num_blocks: u16, columns: &[(&str, u64)]) -> SegMeta {
    SegMeta {
        segment_key: key.to_string(),
        table: table.to_string(),
        earliest_ms: earliest,
        latest_ms: latest,
        num_blocks,
        record_count: num_blocks as u64 * 10,
        column_sizes: columns
            .iter()
            .map(|(name, cmi)| {
                (
                    name.to_string(),
                    ColSizeInfo {
                        cmi_size: *cmi,
                        csg_size: 0,
                    },
                )
            })
            .collect(),
        ..SegMeta::default()
    }
}
