//! Durable segment lists: one JSON record per line.

use crate::error::MetaError;
use crate::metrics_segments::MetricsMeta;
use crate::telemetry::{MetaEvent, MetaEventListener};
use crate::types::SegMeta;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

/// File name of the log-segment list inside a data directory.
pub const SEGMETA_FILE: &str = "segmeta.json";
/// File name of the metrics-segment list inside a data directory.
pub const METRICS_META_FILE: &str = "metricsmeta.json";

/// Reads every well-formed record from a JSON-lines file.
///
/// A missing file is an empty list. Blank lines are ignored and malformed lines are reported
/// through `events` and skipped.
pub fn read_json_lines<T: DeserializeOwned>(
    path: &Path,
    events: &dyn MetaEventListener,
) -> Result<Vec<T>, MetaError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => out.push(record),
            Err(e) => events.on_event(MetaEvent::SegmetaLineSkipped {
                path: path.to_path_buf(),
                line: idx + 1,
                error: e.to_string(),
            }),
        }
    }
    Ok(out)
}

/// Replaces `path` with `records`, one JSON object per line.
///
/// The new contents are written to a temporary file in the same directory and renamed over the
/// target, so readers see either the old list or the new one.
pub fn write_json_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<(), MetaError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file());
        for record in records {
            serde_json::to_writer(&mut w, record).map_err(|e| MetaError::Serialization(e.to_string()))?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
    }
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| MetaError::Io(e.error))?;
    Ok(())
}

pub fn read_segmeta_file(path: &Path, events: &dyn MetaEventListener) -> Result<Vec<SegMeta>, MetaError> {
    read_json_lines(path, events)
}

pub fn write_segmeta_file(path: &Path, metas: &[SegMeta]) -> Result<(), MetaError> {
    write_json_lines(path, metas)
}

pub fn read_metrics_meta_file(path: &Path, events: &dyn MetaEventListener) -> Result<Vec<MetricsMeta>, MetaError> {
    read_json_lines(path, events)
}

pub fn write_metrics_meta_file(path: &Path, metas: &[MetricsMeta]) -> Result<(), MetaError> {
    write_json_lines(path, metas)
}
