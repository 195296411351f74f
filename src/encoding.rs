//! On-disk formats: block-summary files (`.bsu`), per-column micro-index files (`.cmi`),
//! metrics block-summary files (`.mbsu`), and the self-describing bloom filter payload.
//!
//! All integers are little-endian.

use crate::error::MetaError;
use crate::types::{BlockMetadataHolder, BlockNum, BlockSummary, ColumnOffset, RangeBounds};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

/// Container type tag for a bloom filter payload.
pub const CMI_BLOOM_INDEX: u8 = 0x01;
/// Container type tag for a range index payload.
pub const CMI_RANGE_INDEX: u8 = 0x02;

/// Bytes of the `[u32 totalLength]` prefix of a micro-index container record.
pub const LEN_BLOCK_CMI_SIZE: usize = 4;
/// Bytes of the `[u16 blockNum]` that follows the length prefix.
pub const LEN_BLKNUM_CMI_SIZE: usize = 2;

/// Version byte at the start of every metrics block-summary file.
pub const VERSION_MBLOCKSUMMARY: u8 = 0x01;

const BLOOM_HEADER_LEN: usize = 8 + 4 + 4 + 32;

// --- primitives ---

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8, MetaError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}
pub fn read_u16<R: Read>(r: &mut R) -> Result<u16, MetaError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}
pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, MetaError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, MetaError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}
pub fn read_i64<R: Read>(r: &mut R) -> Result<i64, MetaError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}
pub fn read_f64<R: Read>(r: &mut R) -> Result<f64, MetaError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(f64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_short_string(buf: &mut Vec<u8>, s: &str) {
    write_u16(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn read_short_string<R: Read>(r: &mut R) -> Result<String, MetaError> {
    let len = read_u16(r)? as usize;
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)?;
    String::from_utf8(b).map_err(|e| MetaError::corrupt(format!("invalid UTF-8 name: {}", e), None))
}

/// Turns short reads into corruption tagged with `path`; other errors pass through.
fn truncation_to_corruption(err: MetaError, what: &str, path: Option<&Path>) -> MetaError {
    match err {
        MetaError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => MetaError::Corruption {
            details: format!("truncated {}", what),
            file: path.map(Path::to_path_buf),
        },
        MetaError::Corruption { details, file: None } => MetaError::Corruption {
            details,
            file: path.map(Path::to_path_buf),
        },
        other => other,
    }
}

// --- bloom filter ---

/// Per-block bloom filter over the string values of one column.
pub struct BlockBloom {
    filter: Bloom<[u8]>,
}

impl BlockBloom {
    /// Creates an empty filter sized for `expected_items` at the given false-positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        Self {
            filter: Bloom::new_for_fp_rate(expected_items.max(1), false_positive_rate),
        }
    }

    #[inline]
    pub fn insert(&mut self, needle: &str) {
        self.filter.set(needle.as_bytes());
    }

    /// `false` means the needle is definitely absent from the block.
    #[inline]
    pub fn contains(&self, needle: &str) -> bool {
        self.filter.check(needle.as_bytes())
    }

    /// Serializes as `[u64 numBits][u32 numHashes][u32 bitmapLen][4 x u64 sipKeys][bitmap]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.filter.bitmap();
        let sip_keys = self.filter.sip_keys();
        let mut buf = Vec::with_capacity(BLOOM_HEADER_LEN + bitmap.len());
        write_u64(&mut buf, self.filter.number_of_bits());
        write_u32(&mut buf, self.filter.number_of_hash_functions());
        write_u32(&mut buf, bitmap.len() as u32);
        write_u64(&mut buf, sip_keys[0].0);
        write_u64(&mut buf, sip_keys[0].1);
        write_u64(&mut buf, sip_keys[1].0);
        write_u64(&mut buf, sip_keys[1].1);
        buf.extend_from_slice(&bitmap);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MetaError> {
        if data.len() < BLOOM_HEADER_LEN {
            return Err(MetaError::corrupt("bloom filter header too short", None));
        }
        let mut cur = Cursor::new(data);
        let num_bits = read_u64(&mut cur)?;
        let num_hashes = read_u32(&mut cur)?;
        let bitmap_len = read_u32(&mut cur)? as usize;
        let sip_keys = [
            (read_u64(&mut cur)?, read_u64(&mut cur)?),
            (read_u64(&mut cur)?, read_u64(&mut cur)?),
        ];
        let bitmap = data
            .get(BLOOM_HEADER_LEN..BLOOM_HEADER_LEN + bitmap_len)
            .ok_or_else(|| MetaError::corrupt("bloom filter bitmap truncated", None))?;
        if num_hashes == 0 || num_bits == 0 || num_bits > (bitmap_len as u64) * 8 {
            return Err(MetaError::corrupt(
                format!(
                    "bloom filter header inconsistent: bits={}, hashes={}, bitmap_len={}",
                    num_bits, num_hashes, bitmap_len
                ),
                None,
            ));
        }
        Ok(Self {
            filter: Bloom::from_existing(bitmap, num_bits, num_hashes, sip_keys),
        })
    }
}

impl std::fmt::Debug for BlockBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBloom")
            .field("bits", &self.filter.number_of_bits())
            .field("hashes", &self.filter.number_of_hash_functions())
            .finish()
    }
}

// --- micro-index containers ---

/// One block's index for one column.
#[derive(Debug)]
pub enum IndexContainer {
    Bloom(BlockBloom),
    /// Numeric bounds keyed by column name.
    Range(HashMap<String, RangeBounds>),
}

impl IndexContainer {
    pub fn type_tag(&self) -> u8 {
        match self {
            IndexContainer::Bloom(_) => CMI_BLOOM_INDEX,
            IndexContainer::Range(_) => CMI_RANGE_INDEX,
        }
    }

    /// Decodes a container payload (`payload[0]` is the type tag).
    pub fn decode(payload: &[u8]) -> Result<Self, MetaError> {
        let (&tag, body) = payload
            .split_first()
            .ok_or_else(|| MetaError::corrupt("empty index container", None))?;
        match tag {
            CMI_BLOOM_INDEX => Ok(IndexContainer::Bloom(BlockBloom::from_bytes(body)?)),
            CMI_RANGE_INDEX => Ok(IndexContainer::Range(decode_range_entries(body)?)),
            other => Err(MetaError::UnknownContainerType(other)),
        }
    }

    /// Encodes the payload (type tag + body) without the record header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.type_tag()];
        match self {
            IndexContainer::Bloom(bloom) => buf.extend_from_slice(&bloom.to_bytes()),
            IndexContainer::Range(ranges) => encode_range_entries(&mut buf, ranges),
        }
        buf
    }
}

fn encode_range_entries(buf: &mut Vec<u8>, ranges: &HashMap<String, RangeBounds>) {
    let mut keys: Vec<&String> = ranges.keys().collect();
    keys.sort();
    for key in keys {
        let bounds = &ranges[key];
        write_short_string(buf, key);
        buf.push(bounds.kind() as u8);
        match *bounds {
            RangeBounds::Unsigned { min, max } => {
                write_u64(buf, min);
                write_u64(buf, max);
            }
            RangeBounds::Signed { min, max } => {
                write_i64(buf, min);
                write_i64(buf, max);
            }
            RangeBounds::Float64 { min, max } => {
                write_f64(buf, min);
                write_f64(buf, max);
            }
        }
    }
}

fn decode_range_entries(body: &[u8]) -> Result<HashMap<String, RangeBounds>, MetaError> {
    let mut cur = Cursor::new(body);
    let mut out = HashMap::new();
    while (cur.position() as usize) < body.len() {
        let (key, bounds) = read_range_entry(&mut cur)
            .map_err(|e| truncation_to_corruption(e, "range index entry", None))?;
        out.insert(key, bounds);
    }
    Ok(out)
}

fn read_range_entry<R: Read>(r: &mut R) -> Result<(String, RangeBounds), MetaError> {
    let key = read_short_string(r)?;
    let bounds = match read_u8(r)? {
        0 => RangeBounds::Unsigned {
            min: read_u64(r)?,
            max: read_u64(r)?,
        },
        1 => RangeBounds::Signed {
            min: read_i64(r)?,
            max: read_i64(r)?,
        },
        2 => RangeBounds::Float64 {
            min: read_f64(r)?,
            max: read_f64(r)?,
        },
        other => {
            return Err(MetaError::corrupt(
                format!("unknown numeric kind {} in range index", other),
                None,
            ))
        }
    };
    Ok((key, bounds))
}

/// Encodes one `[u32 totalLength][u16 blockNum][payload]` record.
///
/// `totalLength` counts the block number and the payload.
pub fn encode_container_record(block: BlockNum, container: &IndexContainer) -> Vec<u8> {
    let payload = container.encode();
    let mut buf = Vec::with_capacity(LEN_BLOCK_CMI_SIZE + LEN_BLKNUM_CMI_SIZE + payload.len());
    write_u32(&mut buf, (LEN_BLKNUM_CMI_SIZE + payload.len()) as u32);
    write_u16(&mut buf, block);
    buf.extend_from_slice(&payload);
    buf
}

/// Streams `(blockNum, payload)` records out of a micro-index file buffer.
///
/// Payloads are handed out undecoded so callers only pay for the blocks they want.
/// After the first malformed header the reader yields the error once and then stops.
pub struct MicroIndexRecords<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MicroIndexRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for MicroIndexRecords<'a> {
    type Item = Result<(BlockNum, &'a [u8]), MetaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let header_end = self.pos + LEN_BLOCK_CMI_SIZE + LEN_BLKNUM_CMI_SIZE;
        let Some(header) = self.buf.get(self.pos..header_end) else {
            self.pos = self.buf.len();
            return Some(Err(MetaError::corrupt("truncated container header", None)));
        };
        let total_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let block = u16::from_le_bytes([header[4], header[5]]);
        let Some(payload_len) = total_len.checked_sub(LEN_BLKNUM_CMI_SIZE) else {
            self.pos = self.buf.len();
            return Some(Err(MetaError::corrupt(
                format!("container length {} shorter than its header", total_len),
                None,
            )));
        };
        let Some(payload) = self.buf.get(header_end..header_end + payload_len) else {
            self.pos = self.buf.len();
            return Some(Err(MetaError::corrupt(
                format!("container for block {} runs past end of file", block),
                None,
            )));
        };
        self.pos = header_end + payload_len;
        Some(Ok((block, payload)))
    }
}

// --- block summaries ---

/// Decoded contents of a block-summary file.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BlockSummaryFile {
    /// Summaries in file order; index `i` describes block `i`.
    pub summaries: Vec<BlockSummary>,
    pub offsets: HashMap<BlockNum, BlockMetadataHolder>,
}

/// Encodes one block-summary record. Columns are written in name order.
pub fn encode_block_summary_record(
    block: BlockNum,
    summary: &BlockSummary,
    columns: &HashMap<String, ColumnOffset>,
) -> Vec<u8> {
    let mut body = Vec::new();
    write_u16(&mut body, block);
    write_u64(&mut body, summary.high_ts);
    write_u64(&mut body, summary.low_ts);
    write_u16(&mut body, summary.record_count);
    write_u16(&mut body, columns.len() as u16);
    let mut names: Vec<&String> = columns.keys().collect();
    names.sort();
    for name in names {
        let col = &columns[name];
        write_short_string(&mut body, name);
        write_i64(&mut body, col.offset);
        write_u32(&mut body, col.len);
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    write_u32(&mut buf, body.len() as u32);
    buf.extend_from_slice(&body);
    buf
}

/// Parses a whole block-summary file. Any truncated or inconsistent record fails the
/// entire decode.
pub fn decode_block_summaries(buf: &[u8], path: Option<&Path>) -> Result<BlockSummaryFile, MetaError> {
    let mut out = BlockSummaryFile::default();
    let mut pos = 0usize;
    while pos < buf.len() {
        let header = buf
            .get(pos..pos + 4)
            .ok_or_else(|| MetaError::corrupt("truncated block summary length", path.map(Path::to_path_buf)))?;
        let rec_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let body = buf.get(pos + 4..pos + 4 + rec_len).ok_or_else(|| {
            MetaError::corrupt(
                format!("block summary record at offset {} runs past end of buffer", pos),
                path.map(Path::to_path_buf),
            )
        })?;
        let (block, summary, holder) =
            decode_block_summary_body(body).map_err(|e| truncation_to_corruption(e, "block summary record", path))?;
        out.summaries.push(summary);
        out.offsets.insert(block, holder);
        pos += 4 + rec_len;
    }
    Ok(out)
}

fn decode_block_summary_body(
    body: &[u8],
) -> Result<(BlockNum, BlockSummary, BlockMetadataHolder), MetaError> {
    let mut cur = Cursor::new(body);
    let block = read_u16(&mut cur)?;
    let high_ts = read_u64(&mut cur)?;
    let low_ts = read_u64(&mut cur)?;
    let record_count = read_u16(&mut cur)?;
    let num_cols = read_u16(&mut cur)?;
    let mut column_offsets = HashMap::with_capacity(num_cols as usize);
    for _ in 0..num_cols {
        let name = read_short_string(&mut cur)?;
        let offset = read_i64(&mut cur)?;
        let len = read_u32(&mut cur)?;
        column_offsets.insert(name, ColumnOffset { offset, len });
    }
    if cur.position() as usize != body.len() {
        return Err(MetaError::corrupt(
            format!(
                "block {} summary has {} trailing bytes",
                block,
                body.len() - cur.position() as usize
            ),
            None,
        ));
    }
    Ok((
        block,
        BlockSummary {
            low_ts,
            high_ts,
            record_count,
        },
        BlockMetadataHolder {
            block_num: block,
            column_offsets,
        },
    ))
}

// --- metrics block summaries ---

/// Time bounds of one metrics block (epoch seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsBlockSummary {
    pub block_num: BlockNum,
    pub high_ts: u32,
    pub low_ts: u32,
}

pub fn encode_metrics_block_summaries(summaries: &[MetricsBlockSummary]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + summaries.len() * 18);
    buf.push(VERSION_MBLOCKSUMMARY);
    for s in summaries {
        write_u16(&mut buf, s.block_num);
        write_u64(&mut buf, s.high_ts as u64);
        write_u64(&mut buf, s.low_ts as u64);
    }
    buf
}

pub fn decode_metrics_block_summaries(
    buf: &[u8],
    path: Option<&Path>,
) -> Result<Vec<MetricsBlockSummary>, MetaError> {
    let Some((&version, body)) = buf.split_first() else {
        return Err(MetaError::corrupt("empty metrics block summary file", path.map(Path::to_path_buf)));
    };
    if version != VERSION_MBLOCKSUMMARY {
        return Err(MetaError::corrupt(
            format!("unsupported metrics block summary version {}", version),
            path.map(Path::to_path_buf),
        ));
    }
    let mut cur = Cursor::new(body);
    let mut out = Vec::with_capacity(body.len() / 18);
    while (cur.position() as usize) < body.len() {
        let summary = read_metrics_block_summary(&mut cur)
            .map_err(|e| truncation_to_corruption(e, "metrics block summary", path))?;
        out.push(summary);
    }
    Ok(out)
}

/// Timestamps are stored as u64 but must fit the u32 epoch-seconds range.
fn read_epoch_sec<R: Read>(r: &mut R) -> Result<u32, MetaError> {
    let raw = read_u64(r)?;
    u32::try_from(raw).map_err(|_| MetaError::corrupt(format!("metrics block timestamp {} out of range", raw), None))
}

fn read_metrics_block_summary<R: Read>(r: &mut R) -> Result<MetricsBlockSummary, MetaError> {
    let block_num = read_u16(r)?;
    let high_ts = read_epoch_sec(r)?;
    let low_ts = read_epoch_sec(r)?;
    Ok(MetricsBlockSummary {
        block_num,
        high_ts,
        low_ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(cols: &[(&str, i64, u32)]) -> HashMap<String, ColumnOffset> {
        cols.iter()
            .map(|(n, o, l)| (n.to_string(), ColumnOffset { offset: *o, len: *l }))
            .collect()
    }

    #[test]
    fn block_summary_record_decodes_back() {
        let cols = offsets(&[("status", 0, 120), ("latency", 120, 64)]);
        let summary = BlockSummary {
            low_ts: 100,
            high_ts: 200,
            record_count: 17,
        };
        let mut buf = encode_block_summary_record(0, &summary, &cols);
        buf.extend(encode_block_summary_record(1, &summary, &HashMap::new()));

        let decoded = decode_block_summaries(&buf, None).unwrap();
        assert_eq!(decoded.summaries, vec![summary, summary]);
        assert_eq!(decoded.offsets[&0].column_offsets, cols);
        assert!(decoded.offsets[&1].column_offsets.is_empty());
    }

    #[test]
    fn truncated_block_summary_is_corruption() {
        let cols = offsets(&[("status", 0, 120)]);
        let buf = encode_block_summary_record(3, &BlockSummary::default(), &cols);
        for cut in [2, 10, buf.len() - 1] {
            let err = decode_block_summaries(&buf[..cut], None).unwrap_err();
            assert!(matches!(err, MetaError::Corruption { .. }), "cut={} err={:?}", cut, err);
        }
    }

    #[test]
    fn record_length_shorter_than_columns_is_corruption() {
        let cols = offsets(&[("status", 0, 120)]);
        let mut buf = encode_block_summary_record(3, &BlockSummary::default(), &cols);
        // Claim a shorter body than was written; the column entry then overruns it.
        let shorter = (buf.len() - 4 - 5) as u32;
        buf[..4].copy_from_slice(&shorter.to_le_bytes());
        assert!(decode_block_summaries(&buf, None).is_err());
    }

    #[test]
    fn range_container_keeps_kind_and_bounds() {
        let mut ranges = HashMap::new();
        ranges.insert("bytes".to_string(), RangeBounds::Unsigned { min: 3, max: 900 });
        ranges.insert("delta".to_string(), RangeBounds::Signed { min: -5, max: 5 });
        ranges.insert("ratio".to_string(), RangeBounds::Float64 { min: 0.5, max: 1.5 });
        let record = encode_container_record(7, &IndexContainer::Range(ranges.clone()));

        let mut records = MicroIndexRecords::new(&record);
        let (block, payload) = records.next().unwrap().unwrap();
        assert_eq!(block, 7);
        assert!(records.next().is_none());
        match IndexContainer::decode(payload).unwrap() {
            IndexContainer::Range(decoded) => assert_eq!(decoded, ranges),
            other => panic!("expected range container, got {:?}", other),
        }
    }

    #[test]
    fn bloom_container_answers_membership_after_decode() {
        let mut bloom = BlockBloom::new(16, 0.01);
        bloom.insert("error");
        bloom.insert("timeout");
        let record = encode_container_record(0, &IndexContainer::Bloom(bloom));
        let (_, payload) = MicroIndexRecords::new(&record).next().unwrap().unwrap();
        match IndexContainer::decode(payload).unwrap() {
            IndexContainer::Bloom(b) => {
                assert!(b.contains("error"));
                assert!(b.contains("timeout"));
            }
            other => panic!("expected bloom container, got {:?}", other),
        }
    }

    #[test]
    fn unknown_container_tag_is_rejected() {
        let err = IndexContainer::decode(&[0x07, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, MetaError::UnknownContainerType(0x07)));
    }

    #[test]
    fn container_overrunning_buffer_stops_iteration() {
        let mut record = encode_container_record(2, &IndexContainer::Range(HashMap::new()));
        record[..4].copy_from_slice(&1000u32.to_le_bytes());
        let mut records = MicroIndexRecords::new(&record);
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
    }

    #[test]
    fn metrics_block_summaries_decode_back() {
        let summaries = vec![
            MetricsBlockSummary { block_num: 0, high_ts: 50, low_ts: 10 },
            MetricsBlockSummary { block_num: 1, high_ts: 90, low_ts: 51 },
        ];
        let buf = encode_metrics_block_summaries(&summaries);
        assert_eq!(decode_metrics_block_summaries(&buf, None).unwrap(), summaries);
        assert!(decode_metrics_block_summaries(&buf[..buf.len() - 3], None).is_err());
        assert!(decode_metrics_block_summaries(&[0x09], None).is_err());
    }

    #[test]
    fn metrics_timestamp_beyond_u32_is_corruption() {
        let path = Path::new("m.mbsu");
        let mut buf = vec![VERSION_MBLOCKSUMMARY];
        write_u16(&mut buf, 0);
        write_u64(&mut buf, u32::MAX as u64 + 1);
        write_u64(&mut buf, 10);
        match decode_metrics_block_summaries(&buf, Some(path)).unwrap_err() {
            MetaError::Corruption { details, file } => {
                assert!(details.contains("out of range"), "{}", details);
                assert_eq!(file.as_deref(), Some(path));
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }
}
