//! Materializes snapshot nodes from substrate documents.

use std::sync::Arc;

use crate::errors::SubstrateError;
use crate::models::Revision;
use crate::tree::snapshot::StoredNode;
use crate::tree::SnapshotTree;

use super::substrate::{id_from_path, Collection, Document, NodeRecord, Substrate};

/// Shared read handle used by every stored node and child cursor.
pub struct NodeReader {
    substrate: Arc<dyn Substrate>,
    page_limit: usize,
}

impl NodeReader {
    pub fn new(substrate: Arc<dyn Substrate>, page_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            page_limit: page_limit.max(1),
        })
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Maximum number of children a cursor consumes per substrate call.
    pub fn page_limit(&self) -> usize {
        self.page_limit
    }

    /// The node at `path` as of `revision`, or `None` if it does not exist.
    pub fn read(
        self: &Arc<Self>,
        path: &str,
        revision: Revision,
    ) -> Result<Option<SnapshotTree>, SubstrateError> {
        let doc = self.substrate.find(Collection::Nodes, &id_from_path(path))?;
        Ok(doc.and_then(|doc| self.materialize(&doc, path, revision)))
    }

    /// Build the snapshot node for `doc` as of `revision`.
    pub(crate) fn materialize(
        self: &Arc<Self>,
        doc: &Document,
        path: &str,
        revision: Revision,
    ) -> Option<SnapshotTree> {
        let (last_modified, record) = doc.state_at(revision)?;
        Some(self.node(path, revision, last_modified, record))
    }

    /// The node a batch wrote for `path` at `revision`, built without
    /// reading it back.
    pub(crate) fn written(
        self: &Arc<Self>,
        path: &str,
        revision: Revision,
        record: &NodeRecord,
    ) -> SnapshotTree {
        self.node(path, revision, revision, record)
    }

    fn node(
        self: &Arc<Self>,
        path: &str,
        revision: Revision,
        last_modified: Revision,
        record: &NodeRecord,
    ) -> SnapshotTree {
        let stored = StoredNode {
            reader: Arc::clone(self),
            path: path.to_string(),
            revision,
            last_modified,
            has_children: record.has_children,
        };
        SnapshotTree::stored(stored, record.properties.clone())
    }
}
