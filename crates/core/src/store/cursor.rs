//! Paginated, lazily fetched children of a stored node.
//!
//! A [`ChildCursor`] walks the contiguous id range holding one parent's
//! children. Each page asks the substrate for `page_limit + 1` documents and
//! consumes at most `page_limit` of them; the presence of the extra one is the
//! only signal that another page exists. The next page starts strictly after
//! the last consumed id, so an extra document is fetched again (never skipped)
//! on the following call.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::errors::SubstrateError;
use crate::models::Revision;
use crate::tree::{path, SnapshotTree};

use super::reader::NodeReader;
use super::substrate::{child_range, id_from_path, Collection, Document};

/// Name-ordered iterator over the stored children of one node.
///
/// Holds no lock between pages. Two cursors over the same parent are fully
/// independent.
pub struct ChildCursor {
    reader: Arc<NodeReader>,
    parent: String,
    revision: Revision,
    /// Exclusive lower bound of the next page.
    from_key: String,
    to_key: String,
    page: VecDeque<Document>,
    more: bool,
    done: bool,
}

impl ChildCursor {
    /// A cursor over the children of `parent` as of `revision`.
    ///
    /// When `has_children` is false no page is ever requested.
    pub fn new(reader: Arc<NodeReader>, parent: &str, revision: Revision, has_children: bool) -> Self {
        let (from_key, to_key) = child_range(parent);
        Self {
            reader,
            parent: parent.to_string(),
            revision,
            from_key,
            to_key,
            page: VecDeque::new(),
            more: has_children,
            done: false,
        }
    }

    /// Resume iteration strictly after child `name`.
    pub fn starting_after(mut self, name: &str) -> Self {
        let key = id_from_path(&path::join(&self.parent, name));
        if key > self.from_key {
            self.from_key = key;
        }
        self.page.clear();
        self
    }

    fn fetch_page(&mut self) -> Result<(), SubstrateError> {
        let page_limit = self.reader.page_limit();
        let mut docs = self.reader.substrate().query(
            Collection::Nodes,
            &self.from_key,
            &self.to_key,
            page_limit + 1,
        )?;
        self.more = docs.len() > page_limit;
        docs.truncate(page_limit);
        if let Some(last) = docs.last() {
            self.from_key = last.id.clone();
        }
        debug!(
            parent = %self.parent,
            revision = %self.revision,
            fetched = docs.len(),
            more = self.more,
            "fetched child page"
        );
        self.page = docs.into();
        Ok(())
    }

    fn materialize(&self, doc: &Document) -> Result<Option<(String, SnapshotTree)>, SubstrateError> {
        let child_path = doc.path().ok_or_else(|| SubstrateError::Corrupt {
            id: doc.id.clone(),
            detail: "document id carries no path".into(),
        })?;
        let name = path::name(child_path).to_string();
        Ok(self
            .reader
            .materialize(doc, child_path, self.revision)
            .map(|tree| (name, tree)))
    }
}

impl Iterator for ChildCursor {
    type Item = Result<(String, SnapshotTree), SubstrateError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(doc) = self.page.pop_front() {
                match self.materialize(&doc) {
                    Ok(Some(entry)) => return Some(Ok(entry)),
                    // Not alive at this revision.
                    Ok(None) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            if !self.more {
                self.done = true;
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
