//! The ordered key-value substrate contract and the document model stored
//! in it.
//!
//! Every node is one [`Document`] whose id encodes its depth and path
//! (`"{depth}:{path}"`). Sorting ids therefore groups siblings together in
//! name order, and the children of a node occupy one contiguous key range
//! that [`child_range`] computes. Each document keeps one [`NodeRecord`] per
//! revision that touched the node, so any committed revision can be read
//! back without rewriting untouched nodes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SubstrateError;
use crate::models::Revision;
use crate::tree::path;
use crate::tree::PropertyValue;

/// Logical table inside the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    /// One document per node path.
    Nodes,
    /// Store-wide bookkeeping such as the persisted head.
    Settings,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Settings => "settings",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state of one node as written by one revision.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    #[serde(default)]
    pub has_children: bool,
}

impl NodeRecord {
    pub fn live(properties: BTreeMap<String, PropertyValue>, has_children: bool) -> Self {
        Self {
            deleted: false,
            properties,
            has_children,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            deleted: true,
            ..Default::default()
        }
    }
}

/// All revisions of one node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub id: String,
    pub entries: BTreeMap<Revision, NodeRecord>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: BTreeMap::new(),
        }
    }

    /// The record visible at `revision` together with the revision that
    /// wrote it, or `None` if the node does not exist at that revision.
    pub fn state_at(&self, revision: Revision) -> Option<(Revision, &NodeRecord)> {
        self.entries
            .range(..=revision)
            .next_back()
            .filter(|(_, record)| !record.deleted)
            .map(|(rev, record)| (*rev, record))
    }

    /// The node path encoded in the id.
    pub fn path(&self) -> Option<&str> {
        path_from_id(&self.id)
    }
}

/// One entry to insert into a document, creating the document if needed.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpdate {
    pub collection: Collection,
    pub id: String,
    pub revision: Revision,
    pub record: NodeRecord,
}

/// The ordered key-value store underneath the node store.
///
/// Implementations must be safe to share between writers. `query` bounds are
/// both exclusive and results are ascending by id; `apply` is atomic: either
/// every update in the batch becomes visible or none does.
pub trait Substrate: Send + Sync {
    fn find(&self, collection: Collection, id: &str) -> Result<Option<Document>, SubstrateError>;

    fn query(
        &self,
        collection: Collection,
        from_key: &str,
        to_key: &str,
        limit: usize,
    ) -> Result<Vec<Document>, SubstrateError>;

    fn apply(&self, updates: &[DocumentUpdate]) -> Result<(), SubstrateError>;
}

/// Document id of the node at `path`.
pub fn id_from_path(node_path: &str) -> String {
    format!("{}:{}", path::depth(node_path), node_path)
}

/// Node path encoded in a document id.
pub fn path_from_id(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, p)| p)
}

/// Exclusive key range holding the documents of all children of `parent`.
///
/// `'0'` sorts directly after `'/'`, so `"{d}:{parent}0"` bounds every id
/// that starts with `"{d}:{parent}/"`.
pub fn child_range(parent: &str) -> (String, String) {
    let depth = path::depth(parent) + 1;
    let prefix = if parent == path::ROOT { "" } else { parent };
    (format!("{depth}:{prefix}/"), format!("{depth}:{prefix}0"))
}
