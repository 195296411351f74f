//! Persistent-query column provider.
//!
//! Frequently repeated queries are tracked elsewhere; this layer only asks which columns
//! they touch so micro-index loads for a table always include them.

use crate::error::MetaError;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

pub trait PersistentColumns: std::fmt::Debug + Send + Sync + 'static {
    /// Columns used by the persistent queries of `table` in `org_id`.
    fn persistent_columns(&self, table: &str, org_id: u64) -> Result<HashSet<String>, MetaError>;
}

/// Provider for deployments without query tracking.
#[derive(Debug, Default)]
pub struct NoPersistentColumns;

impl PersistentColumns for NoPersistentColumns {
    fn persistent_columns(&self, _table: &str, _org_id: u64) -> Result<HashSet<String>, MetaError> {
        Ok(HashSet::new())
    }
}

/// In-memory provider fed by whoever tracks persistent queries.
#[derive(Debug, Default)]
pub struct StaticPersistentColumns {
    by_table: RwLock<HashMap<(String, u64), HashSet<String>>>,
}

impl StaticPersistentColumns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the tracked columns for `(table, org_id)`.
    pub fn set(&self, table: &str, org_id: u64, columns: impl IntoIterator<Item = String>) -> Result<(), MetaError> {
        let mut guard = self.by_table.write()?;
        guard.insert((table.to_string(), org_id), columns.into_iter().collect());
        Ok(())
    }
}

impl PersistentColumns for StaticPersistentColumns {
    fn persistent_columns(&self, table: &str, org_id: u64) -> Result<HashSet<String>, MetaError> {
        let guard = self.by_table.read()?;
        Ok(guard
            .get(&(table.to_string(), org_id))
            .cloned()
            .unwrap_or_default())
    }
}
