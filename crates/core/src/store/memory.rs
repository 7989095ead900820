//! In-process substrate over ordered maps.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::SubstrateError;

use super::substrate::{Collection, Document, DocumentUpdate, Substrate};

type Tables = BTreeMap<Collection, BTreeMap<String, Document>>;

/// A [`Substrate`] kept entirely in memory. Batches are applied under one
/// write lock, so readers never observe half of a batch.
#[derive(Default)]
pub struct MemorySubstrate {
    tables: RwLock<Tables>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: Collection) -> usize {
        self.read().get(&collection).map_or(0, BTreeMap::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| {
            tracing::warn!("memory substrate lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| {
            tracing::warn!("memory substrate lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Substrate for MemorySubstrate {
    fn find(&self, collection: Collection, id: &str) -> Result<Option<Document>, SubstrateError> {
        Ok(self
            .read()
            .get(&collection)
            .and_then(|table| table.get(id))
            .cloned())
    }

    fn query(
        &self,
        collection: Collection,
        from_key: &str,
        to_key: &str,
        limit: usize,
    ) -> Result<Vec<Document>, SubstrateError> {
        if from_key >= to_key || limit == 0 {
            return Ok(Vec::new());
        }
        let tables = self.read();
        let Some(table) = tables.get(&collection) else {
            return Ok(Vec::new());
        };
        Ok(table
            .range::<str, _>((Bound::Excluded(from_key), Bound::Excluded(to_key)))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn apply(&self, updates: &[DocumentUpdate]) -> Result<(), SubstrateError> {
        let mut tables = self.write();
        for update in updates {
            tables
                .entry(update.collection)
                .or_default()
                .entry(update.id.clone())
                .or_insert_with(|| Document::new(update.id.clone()))
                .entries
                .insert(update.revision, update.record.clone());
        }
        Ok(())
    }
}
