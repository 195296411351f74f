#![doc = include_str!("../README.md")]
// Declare modules
pub mod blob;
pub mod core;
pub mod encoding;
pub mod error;
pub mod metrics_segments;
pub mod micro_index;
pub mod pool;
pub mod prune;
pub mod rebalance;
pub mod registry;
pub mod snapshot;
pub mod telemetry;
pub mod tracker;
pub mod types;

/// Configuration options for the metadata service.
pub use crate::core::MetaConfig;
/// Owner of the registries, worker pool and background rebalance thread.
pub use crate::core::MetaService;
/// Per-tier reports of one rebalance round.
pub use crate::core::RebalanceSummary;
/// Error type for registry, cache and pruning operations.
pub use crate::error::MetaError;
/// Directory of metrics segments.
pub use crate::metrics_segments::MetricsSegmentRegistry;
/// One segment's metadata with its lazily-resident sections.
pub use crate::micro_index::SegmentMicroIndex;
/// Block pruning front end.
pub use crate::prune::IndexPruner;
/// Directory of log segments.
pub use crate::registry::MetadataRegistry;
/// Structured event hook for observability.
pub use crate::telemetry::{MetaEvent, MetaEventListener};
/// Static description of a sealed segment.
pub use crate::types::SegMeta;
/// Inclusive query window in epoch milliseconds.
pub use crate::types::TimeRange;

use std::time::Duration;
/// The default interval between background rebalance rounds (60 seconds).
pub const DEFAULT_REBALANCE_INTERVAL: Duration = Duration::from_secs(60);
