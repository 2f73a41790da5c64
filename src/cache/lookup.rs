//! Lookup index for bulk invalidation.
//!
//! Every cached page can be registered under a parent identifier (a host, a site id, a
//! tenant) and an optional supplementary identifier (a section, a category). Bulk
//! invalidation asks the index for every fingerprint under an identifier instead of
//! recomputing exact keys.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::keys::{Fingerprint, KeyNamespace};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::lookup";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("record not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("lookup index timeout")]
    Timeout,
}

impl IndexError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// One row of the lookup index.
///
/// The triple `(base_cache_key, parent_identifier, supplementary_identifier)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LookupRecord {
    pub base_cache_key: Fingerprint,
    pub parent_identifier: String,
    pub supplementary_identifier: Option<String>,
}

impl LookupRecord {
    pub fn new(
        base_cache_key: Fingerprint,
        parent_identifier: impl Into<String>,
        supplementary_identifier: Option<String>,
    ) -> Self {
        Self {
            base_cache_key,
            parent_identifier: parent_identifier.into(),
            supplementary_identifier,
        }
    }

    /// Composite key an external reader of the store uses for this page.
    pub fn store_key(&self, namespace: &KeyNamespace) -> String {
        namespace.store_key(&self.base_cache_key)
    }
}

impl std::fmt::Display for LookupRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.base_cache_key,
            self.parent_identifier,
            self.supplementary_identifier.as_deref().unwrap_or("-")
        )
    }
}

/// Treat blank identifiers as absent.
pub fn normalize_identifier(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Persistent secondary index over cached pages.
///
/// A blank supplementary identifier is stored and matched as absent. `insert` is idempotent: a duplicate triple is success, never an error. `query` has no
/// ordering guarantee. `remove` is a no-op for absent records; invalidation never calls it.
#[async_trait]
pub trait LookupIndex: Send + Sync {
    async fn insert(
        &self,
        key: &Fingerprint,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<(), IndexError>;

    async fn query(
        &self,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<Vec<LookupRecord>, IndexError>;

    async fn remove(
        &self,
        key: &Fingerprint,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<(), IndexError>;
}

pub(crate) fn ensure_parent(parent_identifier: &str) -> Result<(), IndexError> {
    if parent_identifier.is_empty() {
        return Err(IndexError::invalid_input(
            "parent identifier must not be empty",
        ));
    }
    Ok(())
}

/// In-process lookup index.
///
/// Records are grouped by parent identifier so queries only touch one bucket.
pub struct MemoryLookupIndex {
    by_parent: RwLock<HashMap<String, HashSet<LookupRecord>>>,
}

impl MemoryLookupIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self {
            by_parent: RwLock::new(HashMap::new()),
        }
    }

    /// Get the total number of records.
    pub fn len(&self) -> usize {
        rw_read(&self.by_parent, SOURCE, "len")
            .values()
            .map(HashSet::len)
            .sum()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get every record, in no particular order.
    pub fn records(&self) -> Vec<LookupRecord> {
        rw_read(&self.by_parent, SOURCE, "records")
            .values()
            .flat_map(|records| records.iter().cloned())
            .collect()
    }
}

impl Default for MemoryLookupIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LookupIndex for MemoryLookupIndex {
    async fn insert(
        &self,
        key: &Fingerprint,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<(), IndexError> {
        ensure_parent(parent_identifier)?;
        let record = LookupRecord::new(
            key.clone(),
            parent_identifier,
            normalize_identifier(supplementary_identifier).map(str::to_string),
        );

        rw_write(&self.by_parent, SOURCE, "insert")
            .entry(parent_identifier.to_string())
            .or_default()
            .insert(record);
        Ok(())
    }

    async fn query(
        &self,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<Vec<LookupRecord>, IndexError> {
        let by_parent = rw_read(&self.by_parent, SOURCE, "query");
        let Some(records) = by_parent.get(parent_identifier) else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .filter(|record| match normalize_identifier(supplementary_identifier) {
                Some(wanted) => record.supplementary_identifier.as_deref() == Some(wanted),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn remove(
        &self,
        key: &Fingerprint,
        parent_identifier: &str,
        supplementary_identifier: Option<&str>,
    ) -> Result<(), IndexError> {
        let record = LookupRecord::new(
            key.clone(),
            parent_identifier,
            normalize_identifier(supplementary_identifier).map(str::to_string),
        );

        let mut by_parent = rw_write(&self.by_parent, SOURCE, "remove");
        if let Some(records) = by_parent.get_mut(parent_identifier) {
            records.remove(&record);
            if records.is_empty() {
                by_parent.remove(parent_identifier);
            }
        }
        Ok(())
    }
}
