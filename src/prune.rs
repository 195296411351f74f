//! Block-level pruning: time filter, then bloom/range evaluation against micro-indices.
//!
//! The pruner never rejects a block it cannot disprove. A missing or inapplicable container
//! keeps the block; so does a micro-index load failure. A segment whose block summaries
//! cannot be read is admitted whole.

use crate::encoding::IndexContainer;
use crate::error::MetaError;
use crate::micro_index::{BlockContainers, BlockSelection, ColumnSelection, SectionsView, SegmentMicroIndex};
use crate::pool::WorkerPool;
use crate::rebalance::Tier;
use crate::registry::MetadataRegistry;
use crate::telemetry::{meta_metrics, MetaEvent};
use crate::types::{block_summary_path, BlockMetadataHolder, BlockNum, BlockSummary, EpochMs, RangeBounds, TimeRange};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Comparison applied between a literal and a block's `[min, max]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
}

/// How results of several bloom needles combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOperator {
    And,
    Or,
}

/// True when a block with inclusive bounds `[min, max]` may hold a value matching `lookup <op>`.
///
/// The ordering operators are deliberately wide: they admit whenever either bound allows it.
pub fn passes_range_filter<T: PartialOrd>(op: FilterOperator, lookup: T, min: T, max: T) -> bool {
    match op {
        FilterOperator::Equals => lookup >= min && lookup <= max,
        FilterOperator::NotEquals => !(min == max && lookup == min),
        FilterOperator::LessThan => lookup > min || lookup > max,
        FilterOperator::LessThanOrEqualTo => lookup >= min || lookup >= max,
        FilterOperator::GreaterThan => lookup < min || lookup < max,
        FilterOperator::GreaterThanOrEqualTo => lookup <= min || lookup <= max,
    }
}

/// Evaluates `literal` against one range entry, converting it to the entry's numeric kind.
///
/// An integer entry compared with a literal that only parses as a float (`5.5`, `-1` against
/// unsigned) is compared exactly in mixed precision. `None` when the literal is not a number
/// of any kind, in which case the entry cannot disprove the block.
pub fn check_bounds(bounds: &RangeBounds, literal: &str, op: FilterOperator) -> Option<bool> {
    let literal = literal.trim();
    match *bounds {
        RangeBounds::Unsigned { min, max } => match literal.parse::<u64>() {
            Ok(v) => Some(passes_range_filter(op, v, min, max)),
            Err(_) => {
                let v = parse_comparable_float(literal)?;
                Some(passes_by_ordering(op, cmp_f64_u64(v, min), cmp_f64_u64(v, max), min == max))
            }
        },
        RangeBounds::Signed { min, max } => match literal.parse::<i64>() {
            Ok(v) => Some(passes_range_filter(op, v, min, max)),
            Err(_) => {
                let v = parse_comparable_float(literal)?;
                Some(passes_by_ordering(op, cmp_f64_i64(v, min), cmp_f64_i64(v, max), min == max))
            }
        },
        RangeBounds::Float64 { min, max } => {
            let v = parse_comparable_float(literal)?;
            Some(passes_range_filter(op, v, min, max))
        }
    }
}

fn parse_comparable_float(literal: &str) -> Option<f64> {
    literal.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// `passes_range_filter` expressed over `lookup.cmp(min)` and `lookup.cmp(max)`.
fn passes_by_ordering(op: FilterOperator, vs_min: Ordering, vs_max: Ordering, single_valued: bool) -> bool {
    use Ordering::*;
    match op {
        FilterOperator::Equals => vs_min != Less && vs_max != Greater,
        FilterOperator::NotEquals => !(single_valued && vs_min == Equal),
        FilterOperator::LessThan => vs_min == Greater || vs_max == Greater,
        FilterOperator::LessThanOrEqualTo => vs_min != Less || vs_max != Less,
        FilterOperator::GreaterThan => vs_min == Less || vs_max == Less,
        FilterOperator::GreaterThanOrEqualTo => vs_min != Greater || vs_max != Greater,
    }
}

// 2^64 and 2^63 are exact in f64.
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Exact comparison of a non-NaN float with an unsigned integer.
fn cmp_f64_u64(v: f64, x: u64) -> Ordering {
    if v < 0.0 {
        return Ordering::Less;
    }
    if v >= TWO_POW_64 {
        return Ordering::Greater;
    }
    let whole = v.trunc();
    (whole as u64).cmp(&x).then(if v > whole { Ordering::Greater } else { Ordering::Equal })
}

/// Exact comparison of a non-NaN float with a signed integer.
fn cmp_f64_i64(v: f64, x: i64) -> Ordering {
    if v < -TWO_POW_63 {
        return Ordering::Less;
    }
    if v >= TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = v.trunc();
    let frac = if v > whole {
        Ordering::Greater
    } else if v < whole {
        Ordering::Less
    } else {
        Ordering::Equal
    };
    (whole as i64).cmp(&x).then(frac)
}

/// Verdict of a range filter (`column -> literal`, `*` for any column) against one range
/// container. `None` when no entry of the container applies to the filter. An entry the
/// literal cannot be compared with counts as a pass.
pub fn range_index_verdict(
    filter: &HashMap<String, String>,
    ranges: &HashMap<String, RangeBounds>,
    op: FilterOperator,
) -> Option<bool> {
    let mut verdict = None;
    for (column, literal) in filter {
        if column == "*" {
            for bounds in ranges.values() {
                if check_bounds(bounds, literal, op).unwrap_or(true) {
                    return Some(true);
                }
                verdict = Some(false);
            }
        } else if let Some(bounds) = ranges.get(column) {
            if check_bounds(bounds, literal, op).unwrap_or(true) {
                return Some(true);
            }
            verdict = Some(false);
        }
    }
    verdict
}

/// One bloom search term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomNeedle {
    pub term: String,
    /// Pre-normalization spelling, tested as well when dual-case search is on.
    pub original_case: Option<String>,
}

impl BloomNeedle {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            original_case: None,
        }
    }

    pub fn with_original_case(mut self, original: impl Into<String>) -> Self {
        self.original_case = Some(original.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// Matches every record; no index can prune it.
    MatchAll,
    Range {
        /// column (or `*`) -> literal
        filter: HashMap<String, String>,
        op: FilterOperator,
    },
    Bloom {
        needles: Vec<BloomNeedle>,
        op: LogicalOperator,
        /// The searched value is itself a wildcard.
        wildcard_value: bool,
        negated: bool,
    },
}

/// Index-evaluable part of a query plus the columns it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub columns: ColumnSelection,
    pub kind: FilterKind,
}

impl QueryFilter {
    pub fn match_all(columns: ColumnSelection) -> Self {
        Self {
            columns,
            kind: FilterKind::MatchAll,
        }
    }

    /// Range predicate `column <op> literal` over `column` only.
    pub fn range(column: &str, op: FilterOperator, literal: impl Into<String>) -> Self {
        let mut filter = HashMap::new();
        filter.insert(column.to_string(), literal.into());
        Self {
            columns: ColumnSelection::Only([column.to_string()].into_iter().collect()),
            kind: FilterKind::Range { filter, op },
        }
    }

    /// Range predicate applied to every column.
    pub fn range_any_column(op: FilterOperator, literal: impl Into<String>) -> Self {
        let mut filter = HashMap::new();
        filter.insert("*".to_string(), literal.into());
        Self {
            columns: ColumnSelection::Wildcard,
            kind: FilterKind::Range { filter, op },
        }
    }

    pub fn bloom(columns: ColumnSelection, needles: Vec<BloomNeedle>, op: LogicalOperator) -> Self {
        Self {
            columns,
            kind: FilterKind::Bloom {
                needles,
                op,
                wildcard_value: false,
                negated: false,
            },
        }
    }

    pub fn negated(mut self) -> Self {
        if let FilterKind::Bloom { negated, .. } = &mut self.kind {
            *negated = true;
        }
        self
    }

    pub fn with_wildcard_value(mut self) -> Self {
        if let FilterKind::Bloom { wildcard_value, .. } = &mut self.kind {
            *wildcard_value = true;
        }
        self
    }

    /// False when the predicate matches everything the time filter lets through.
    pub fn needs_index(&self) -> bool {
        match &self.kind {
            FilterKind::MatchAll => false,
            FilterKind::Range { filter, .. } => !filter.is_empty(),
            FilterKind::Bloom {
                needles,
                wildcard_value,
                negated,
                ..
            } => !needles.is_empty() && !*wildcard_value && !*negated,
        }
    }
}

/// Blocks and columns of one segment that must be read.
#[derive(Debug, Clone)]
pub struct SegmentSearchRequest {
    pub segment_key: String,
    pub table: String,
    /// block -> columns the index singled out (or every requested column when none were).
    pub blocks_to_search: BTreeMap<BlockNum, BTreeSet<String>>,
    pub block_summaries: Arc<Vec<BlockSummary>>,
    /// Column byte offsets of the blocks in `blocks_to_search`.
    pub block_offsets: HashMap<BlockNum, BlockMetadataHolder>,
    pub block_summary_file: PathBuf,
    pub search_metadata_size: u64,
    pub all_possible_columns: HashSet<String>,
    pub latest_ms: EpochMs,
}

/// Result of pruning one segment.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    /// `None` when no block survived.
    pub request: Option<SegmentSearchRequest>,
    pub total_blocks: u64,
    pub passed_blocks: u64,
}

/// Aggregate of pruning every candidate segment of a table.
#[derive(Debug, Default)]
pub struct PruneResults {
    pub requests: Vec<SegmentSearchRequest>,
    /// Segments that vanished from the registry between candidate selection and pruning.
    pub errors: Vec<(String, MetaError)>,
    pub segments_checked: u64,
    pub blocks_checked: u64,
    pub blocks_passed: u64,
}

enum ContainerSource<'a> {
    Resident(SectionsView<'a>),
    Transient(Vec<BlockContainers>),
    Unavailable,
}

impl ContainerSource<'_> {
    fn block(&self, block: BlockNum) -> Option<&BlockContainers> {
        match self {
            ContainerSource::Resident(view) => view.cmis_for_block(block).ok(),
            ContainerSource::Transient(blocks) => blocks.get(block as usize),
            ContainerSource::Unavailable => None,
        }
    }
}

/// Candidate `(column, container)` pairs for one block under a column selection.
fn candidate_containers<'a>(
    columns: &'a ColumnSelection,
    containers: Option<&'a BlockContainers>,
) -> Vec<(&'a str, Option<&'a IndexContainer>)> {
    match columns {
        ColumnSelection::Wildcard => containers
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), Some(v.as_ref()))).collect())
            .unwrap_or_default(),
        ColumnSelection::Only(set) => set
            .iter()
            .map(|c| (c.as_str(), containers.and_then(|m| m.get(c)).map(|v| v.as_ref())))
            .collect(),
    }
}

fn range_check_block(
    filter: &HashMap<String, String>,
    op: FilterOperator,
    columns: &ColumnSelection,
    containers: Option<&BlockContainers>,
    passed_cols: &mut BTreeSet<String>,
) -> bool {
    let mut evaluated = false;
    let mut passed = false;
    for (column, container) in candidate_containers(columns, containers) {
        let verdict = match container {
            Some(IndexContainer::Range(ranges)) => range_index_verdict(filter, ranges, op),
            _ => None,
        };
        match verdict {
            Some(true) => {
                evaluated = true;
                passed = true;
                passed_cols.insert(column.to_string());
            }
            Some(false) => evaluated = true,
            None if op == FilterOperator::NotEquals && matches!(columns, ColumnSelection::Only(_)) => {
                passed = true;
                passed_cols.insert(column.to_string());
            }
            None => {}
        }
    }
    passed || !evaluated
}

fn bloom_check_block(
    needles: &[BloomNeedle],
    op: LogicalOperator,
    dual_case: bool,
    columns: &ColumnSelection,
    containers: Option<&BlockContainers>,
    passed_cols: &mut BTreeSet<String>,
) -> bool {
    let candidates = candidate_containers(columns, containers);
    for needle in needles {
        let mut any_bloom = false;
        let mut found = false;
        for (column, container) in &candidates {
            let Some(IndexContainer::Bloom(bloom)) = container else {
                continue;
            };
            any_bloom = true;
            let hit = bloom.contains(&needle.term)
                || (dual_case
                    && needle
                        .original_case
                        .as_deref()
                        .map_or(false, |orig| bloom.contains(orig)));
            if hit {
                found = true;
                passed_cols.insert(column.to_string());
            }
        }
        // Nothing to test against: the block cannot be ruled out.
        let found = found || !any_bloom;
        match op {
            LogicalOperator::And if !found => return false,
            LogicalOperator::Or if found => return true,
            _ => {}
        }
    }
    match op {
        LogicalOperator::And => true,
        LogicalOperator::Or => needles.is_empty(),
    }
}

/// Packs the surviving blocks of one segment into a search request.
fn assemble(
    smi: &SegmentMicroIndex,
    table: &str,
    filter: &QueryFilter,
    mut blocks: BTreeMap<BlockNum, BTreeSet<String>>,
    summaries: Arc<Vec<BlockSummary>>,
    offsets: &HashMap<BlockNum, BlockMetadataHolder>,
    total_blocks: u64,
) -> PruneOutcome {
    let segment_key = smi.segment_key();
    let passed_blocks = blocks.len() as u64;
    meta_metrics::record_prune(total_blocks, passed_blocks);
    if blocks.is_empty() {
        return PruneOutcome {
            request: None,
            total_blocks,
            passed_blocks,
        };
    }

    let all_possible_columns = smi.columns();
    let requested: BTreeSet<String> = match &filter.columns {
        ColumnSelection::Wildcard => all_possible_columns.iter().cloned().collect(),
        ColumnSelection::Only(set) => set.iter().cloned().collect(),
    };
    for cols in blocks.values_mut() {
        if cols.is_empty() {
            cols.clone_from(&requested);
        }
    }
    let block_offsets = blocks
        .keys()
        .filter_map(|b| offsets.get(b).map(|h| (*b, h.clone())))
        .collect();

    PruneOutcome {
        request: Some(SegmentSearchRequest {
            segment_key: segment_key.to_string(),
            table: table.to_string(),
            blocks_to_search: blocks,
            block_summaries: summaries,
            block_offsets,
            block_summary_file: block_summary_path(segment_key),
            search_metadata_size: smi.search_metadata_size(),
            all_possible_columns,
            latest_ms: smi.latest_ms(),
        }),
        total_blocks,
        passed_blocks,
    }
}

/// Per-query pruning front end over a shared registry.
#[derive(Debug, Clone)]
pub struct IndexPruner {
    registry: Arc<MetadataRegistry>,
    pool: Arc<WorkerPool>,
    dual_case: bool,
}

impl IndexPruner {
    pub fn new(registry: Arc<MetadataRegistry>, pool: Arc<WorkerPool>, dual_case: bool) -> Self {
        Self {
            registry,
            pool,
            dual_case,
        }
    }

    /// Prunes one segment down to the blocks and columns `filter` may match within `range`.
    ///
    /// Sections that are not resident are read into private copies for this call only, so
    /// residency stays under the rebalancer's control.
    pub fn prune_segment(
        &self,
        segment_key: &str,
        table: &str,
        range: &TimeRange,
        filter: &QueryFilter,
    ) -> Result<PruneOutcome, MetaError> {
        let ctx = self.registry.load_context();
        let Some(smi) = self.registry.lookup(segment_key) else {
            ctx.events.on_event(MetaEvent::UnknownSegment {
                segment: segment_key.to_string(),
                table: table.to_string(),
            });
            return Err(MetaError::SegmentNotFound(segment_key.to_string()));
        };

        let (summaries, offsets) = match (smi.block_summaries(), smi.block_offsets()) {
            (Some(s), Some(o)) => (s, o),
            _ => match smi.read_search_metadata(ctx) {
                Ok((s, o)) => (Arc::new(s), Arc::new(o)),
                Err(e) => {
                    // Without block summaries nothing can be ruled out: every block is read.
                    ctx.events.on_event(MetaEvent::SegmentLoadFailed {
                        segment: segment_key.to_string(),
                        tier: Tier::SearchMetadata,
                        error: e.to_string(),
                    });
                    let blocks = (0..smi.num_blocks()).map(|b| (b, BTreeSet::new())).collect();
                    let total_blocks = smi.num_blocks() as u64;
                    return Ok(assemble(&smi, table, filter, blocks, Arc::default(), &HashMap::new(), total_blocks));
                }
            },
        };

        let total_blocks = summaries.len() as u64;
        let mut blocks: BTreeMap<BlockNum, BTreeSet<String>> = summaries
            .iter()
            .enumerate()
            .filter(|(_, s)| range.overlaps(s.low_ts, s.high_ts))
            .map(|(i, _)| (i as BlockNum, BTreeSet::new()))
            .collect();

        if !blocks.is_empty() && filter.needs_index() {
            let source = self.container_source(&smi, &blocks, filter);
            blocks.retain(|&block, cols| self.check_block(filter, source.block(block), cols));
        }

        Ok(assemble(&smi, table, filter, blocks, summaries, &offsets, total_blocks))
    }

    fn container_source<'a>(
        &self,
        smi: &'a SegmentMicroIndex,
        blocks: &BTreeMap<BlockNum, BTreeSet<String>>,
        filter: &QueryFilter,
    ) -> ContainerSource<'a> {
        let view = smi.read_sections();
        if view.micro_indices_loaded() {
            return ContainerSource::Resident(view);
        }
        drop(view);

        let ctx = self.registry.load_context();
        let selection = BlockSelection::Only(blocks.keys().copied().collect());
        match smi.read_micro_indices(&selection, &filter.columns, ctx) {
            Ok(loaded) => ContainerSource::Transient(loaded),
            Err(e) => {
                ctx.events.on_event(MetaEvent::SegmentLoadFailed {
                    segment: smi.segment_key().to_string(),
                    tier: Tier::MicroIndex,
                    error: e.to_string(),
                });
                ContainerSource::Unavailable
            }
        }
    }

    fn check_block(&self, filter: &QueryFilter, containers: Option<&BlockContainers>, cols: &mut BTreeSet<String>) -> bool {
        match &filter.kind {
            FilterKind::MatchAll => true,
            FilterKind::Range { filter: rf, op } => range_check_block(rf, *op, &filter.columns, containers, cols),
            FilterKind::Bloom { needles, op, .. } => {
                bloom_check_block(needles, *op, self.dual_case, &filter.columns, containers, cols)
            }
        }
    }

    /// Prunes every segment of `table` in `org_id` whose bounds overlap `range`, in parallel.
    pub fn prune_segments(&self, table: &str, range: &TimeRange, org_id: u64, filter: &QueryFilter) -> PruneResults {
        let keys: Vec<String> = self
            .registry
            .table_candidates(table)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|s| s.org_id() == org_id && range.overlaps(s.earliest_ms(), s.latest_ms()))
                    .map(|s| s.segment_key().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let outcomes = self
            .pool
            .map(&keys, |key| self.prune_segment(key, table, range, filter));

        let mut results = PruneResults {
            segments_checked: keys.len() as u64,
            ..PruneResults::default()
        };
        for (key, outcome) in keys.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    results.blocks_checked += outcome.total_blocks;
                    results.blocks_passed += outcome.passed_blocks;
                    results.requests.extend(outcome.request);
                }
                Err(e) => results.errors.push((key, e)),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::BlockBloom;

    fn ranges(col: &str, bounds: RangeBounds) -> HashMap<String, RangeBounds> {
        let mut m = HashMap::new();
        m.insert(col.to_string(), bounds);
        m
    }

    #[test]
    fn operator_table() {
        use FilterOperator::*;
        assert!(passes_range_filter(Equals, 5u64, 1, 10));
        assert!(!passes_range_filter(Equals, 11u64, 1, 10));
        assert!(!passes_range_filter(NotEquals, 4u64, 4, 4));
        assert!(passes_range_filter(NotEquals, 4u64, 4, 5));
        assert!(passes_range_filter(LessThan, 5i64, 1, 10));
        assert!(!passes_range_filter(LessThan, 1i64, 1, 10));
        assert!(passes_range_filter(GreaterThan, 9.5f64, 1.0, 10.0));
        assert!(!passes_range_filter(GreaterThan, 10.0f64, 1.0, 10.0));
        assert!(passes_range_filter(GreaterThanOrEqualTo, 10u64, 1, 10));
        assert!(passes_range_filter(LessThanOrEqualTo, 1u64, 1, 10));
    }

    #[test]
    fn literal_is_converted_to_entry_kind() {
        let signed = RangeBounds::Signed { min: -10, max: -1 };
        assert_eq!(check_bounds(&signed, " -5 ", FilterOperator::Equals), Some(true));
        assert_eq!(check_bounds(&signed, "3", FilterOperator::Equals), Some(false));
        assert_eq!(check_bounds(&signed, "abc", FilterOperator::Equals), None);
        let unsigned = RangeBounds::Unsigned { min: 0, max: 9 };
        assert_eq!(check_bounds(&unsigned, "-1", FilterOperator::NotEquals), Some(true));
    }

    #[test]
    fn float_literals_compare_exactly_against_integer_entries() {
        use FilterOperator::*;
        let unsigned = RangeBounds::Unsigned { min: 0, max: 9 };
        assert_eq!(check_bounds(&unsigned, "5.5", LessThan), Some(true));
        assert_eq!(check_bounds(&unsigned, "5.5", Equals), Some(true));
        assert_eq!(check_bounds(&unsigned, "9.5", Equals), Some(false));
        assert_eq!(check_bounds(&unsigned, "-1", Equals), Some(false));
        assert_eq!(check_bounds(&unsigned, "-0.5", GreaterThan), Some(true));
        assert_eq!(check_bounds(&unsigned, "1e30", LessThan), Some(true));

        let single = RangeBounds::Unsigned { min: 4, max: 4 };
        assert_eq!(check_bounds(&single, "4.0", NotEquals), Some(false));
        assert_eq!(check_bounds(&single, "4.25", NotEquals), Some(true));

        let signed = RangeBounds::Signed { min: 0, max: 9 };
        assert_eq!(check_bounds(&signed, "5.0", Equals), Some(true));
        assert_eq!(check_bounds(&signed, "-0.5", Equals), Some(false));
        assert_eq!(check_bounds(&signed, "-0.5", GreaterThan), Some(true));
        assert_eq!(check_bounds(&signed, "NaN", Equals), None);

        assert_eq!(cmp_f64_i64(-1.5, -1), Ordering::Less);
        assert_eq!(cmp_f64_i64(-1.5, -2), Ordering::Greater);
        assert_eq!(cmp_f64_u64(18_446_744_073_709_551_615.0, u64::MAX), Ordering::Greater);
    }

    #[test]
    fn unparseable_literal_keeps_the_block() {
        let r = ranges("a", RangeBounds::Unsigned { min: 0, max: 9 });
        let mut f = HashMap::new();
        f.insert("a".to_string(), "not-a-number".to_string());
        assert_eq!(range_index_verdict(&f, &r, FilterOperator::Equals), Some(true));
    }

    #[test]
    fn wildcard_filter_checks_every_entry() {
        let mut r = ranges("a", RangeBounds::Unsigned { min: 0, max: 5 });
        r.insert("b".into(), RangeBounds::Unsigned { min: 100, max: 200 });
        let mut f = HashMap::new();
        f.insert("*".to_string(), "150".to_string());
        assert_eq!(range_index_verdict(&f, &r, FilterOperator::Equals), Some(true));
        f.insert("*".to_string(), "50".to_string());
        assert_eq!(range_index_verdict(&f, &r, FilterOperator::Equals), Some(false));

        let mut named = HashMap::new();
        named.insert("zzz".to_string(), "1".to_string());
        assert_eq!(range_index_verdict(&named, &r, FilterOperator::Equals), None);
    }

    #[test]
    fn bloom_and_requires_every_needle() {
        let mut bloom = BlockBloom::new(8, 0.001);
        bloom.insert("error");
        let mut containers: BlockContainers = HashMap::new();
        containers.insert("msg".into(), Arc::new(IndexContainer::Bloom(bloom)));
        let cols = ColumnSelection::Only(["msg".to_string()].into_iter().collect());

        let needles = vec![BloomNeedle::new("error"), BloomNeedle::new("definitely-not-present-xyz")];
        let mut passed = BTreeSet::new();
        assert!(!bloom_check_block(&needles, LogicalOperator::And, false, &cols, Some(&containers), &mut passed));
        let mut passed = BTreeSet::new();
        assert!(bloom_check_block(&needles, LogicalOperator::Or, false, &cols, Some(&containers), &mut passed));
        assert!(passed.contains("msg"));

        let missing = vec![BloomNeedle::new("nope-1-qwerty"), BloomNeedle::new("nope-2-asdfgh")];
        assert!(!bloom_check_block(&missing, LogicalOperator::Or, false, &cols, Some(&containers), &mut BTreeSet::new()));
    }

    #[test]
    fn dual_case_tests_original_spelling() {
        let mut bloom = BlockBloom::new(8, 0.001);
        bloom.insert("Error");
        let mut containers: BlockContainers = HashMap::new();
        containers.insert("msg".into(), Arc::new(IndexContainer::Bloom(bloom)));
        let needle = vec![BloomNeedle::new("error-lowercase-only").with_original_case("Error")];
        let cols = ColumnSelection::Wildcard;
        assert!(!bloom_check_block(&needle, LogicalOperator::And, false, &cols, Some(&containers), &mut BTreeSet::new()));
        assert!(bloom_check_block(&needle, LogicalOperator::And, true, &cols, Some(&containers), &mut BTreeSet::new()));
    }

    #[test]
    fn missing_containers_never_reject() {
        let cols = ColumnSelection::Only(["latency".to_string()].into_iter().collect());
        let mut f = HashMap::new();
        f.insert("latency".to_string(), "5".to_string());
        let mut passed = BTreeSet::new();
        assert!(range_check_block(&f, FilterOperator::Equals, &cols, None, &mut passed));
        assert!(passed.is_empty());
        assert!(range_check_block(&f, FilterOperator::NotEquals, &cols, None, &mut passed));
        assert!(passed.contains("latency"));
        assert!(bloom_check_block(&[BloomNeedle::new("x")], LogicalOperator::And, false, &cols, None, &mut BTreeSet::new()));
    }

    #[test]
    fn short_circuit_filters_skip_the_index() {
        assert!(!QueryFilter::match_all(ColumnSelection::Wildcard).needs_index());
        let bloom = QueryFilter::bloom(ColumnSelection::Wildcard, vec![BloomNeedle::new("x")], LogicalOperator::And);
        assert!(bloom.needs_index());
        assert!(!bloom.clone().negated().needs_index());
        assert!(!bloom.with_wildcard_value().needs_index());
    }
}
