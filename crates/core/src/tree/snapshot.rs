//! Immutable, structurally shared snapshot trees.
//!
//! A [`SnapshotTree`] is a cheap `Arc` handle. Its properties are always in
//! memory; its children come from one of three backings:
//!
//! - **inline**: an in-memory map, used for trees built from scratch;
//! - **stored**: read lazily from the substrate through the paginated child
//!   cursor, pinned to the revision the node was read at;
//! - **overlay**: another tree's children plus per-name replacements and
//!   removals, so touching one child of a huge collection never copies its
//!   siblings.

use std::cmp::Ordering;
use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::iter::Peekable;
use std::sync::Arc;

use crate::errors::SubstrateError;
use crate::models::Revision;
use crate::store::{ChildCursor, NodeReader};

use super::builder::MutationBuilder;
use super::path;
use super::value::PropertyValue;
use super::JCR_MIXIN_TYPES;

/// An immutable point-in-time view of one node and everything below it.
#[derive(Clone)]
pub struct SnapshotTree(Arc<Node>);

struct Node {
    properties: BTreeMap<String, PropertyValue>,
    children: Children,
}

pub(crate) enum Children {
    Inline(BTreeMap<String, SnapshotTree>),
    Stored(StoredNode),
    Overlay {
        base: SnapshotTree,
        changes: BTreeMap<String, Option<SnapshotTree>>,
    },
}

/// Location of a node read from the substrate.
pub(crate) struct StoredNode {
    pub(crate) reader: Arc<NodeReader>,
    pub(crate) path: String,
    /// Revision the node was read at; children are read at the same one.
    pub(crate) revision: Revision,
    /// Revision that last wrote this node or anything below it.
    pub(crate) last_modified: Revision,
    pub(crate) has_children: bool,
}

impl SnapshotTree {
    /// A node with no properties and no children.
    pub fn empty() -> Self {
        Self::inline(BTreeMap::new(), BTreeMap::new())
    }

    /// An in-memory node.
    pub fn inline(
        properties: BTreeMap<String, PropertyValue>,
        children: BTreeMap<String, SnapshotTree>,
    ) -> Self {
        Self::from_parts(properties, Children::Inline(children))
    }

    pub(crate) fn stored(stored: StoredNode, properties: BTreeMap<String, PropertyValue>) -> Self {
        Self::from_parts(properties, Children::Stored(stored))
    }

    pub(crate) fn from_parts(
        properties: BTreeMap<String, PropertyValue>,
        children: Children,
    ) -> Self {
        Self(Arc::new(Node {
            properties,
            children,
        }))
    }

    pub(crate) fn backing(&self) -> &Children {
        &self.0.children
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.0.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.0.properties.get(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.0.properties.contains_key(name)
    }

    /// The mixin type names listed in `jcr:mixinTypes`.
    pub fn mixin_types(&self) -> Vec<&str> {
        self.property(JCR_MIXIN_TYPES)
            .map(|p| p.values().iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn child(&self, name: &str) -> Result<Option<SnapshotTree>, SubstrateError> {
        match &self.0.children {
            Children::Inline(map) => Ok(map.get(name).cloned()),
            Children::Stored(stored) => {
                if !stored.has_children || path::validate_name(name).is_err() {
                    return Ok(None);
                }
                stored
                    .reader
                    .read(&path::join(&stored.path, name), stored.revision)
            }
            Children::Overlay { base, changes } => match changes.get(name) {
                Some(change) => Ok(change.clone()),
                None => base.child(name),
            },
        }
    }

    pub fn has_child(&self, name: &str) -> Result<bool, SubstrateError> {
        Ok(self.child(name)?.is_some())
    }

    /// Children in name order. Stored children are fetched page by page as
    /// the iterator advances; every call starts an independent sequence.
    pub fn children(&self) -> ChildEntries<'_> {
        let inner = match &self.0.children {
            Children::Inline(map) => EntriesInner::Inline(map.iter()),
            Children::Stored(stored) => EntriesInner::Stored(ChildCursor::new(
                Arc::clone(&stored.reader),
                &stored.path,
                stored.revision,
                stored.has_children,
            )),
            Children::Overlay { base, changes } => EntriesInner::Overlay {
                base: Box::new(base.children()),
                pending: None,
                changes: changes.iter().peekable(),
            },
        };
        ChildEntries { inner, done: false }
    }

    pub fn has_children(&self) -> Result<bool, SubstrateError> {
        match &self.0.children {
            Children::Inline(map) => Ok(!map.is_empty()),
            Children::Stored(stored) => Ok(stored.has_children),
            Children::Overlay { .. } => Ok(self.children().next().transpose()?.is_some()),
        }
    }

    /// Number of children; walks every page of stored children.
    pub fn child_count(&self) -> Result<usize, SubstrateError> {
        let mut count = 0;
        for entry in self.children() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Structural identity: the same allocation, or the same stored node
    /// last modified by the same revision. Identical trees are always equal;
    /// equal trees need not be identical.
    pub fn same_as(&self, other: &SnapshotTree) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (&self.0.children, &other.0.children) {
            (Children::Stored(a), Children::Stored(b)) => {
                a.path == b.path && a.last_modified == b.last_modified
            }
            _ => false,
        }
    }

    /// Path and last-modified revision, for nodes read from the substrate.
    pub fn stored_location(&self) -> Option<(&str, Revision)> {
        match &self.0.children {
            Children::Stored(stored) => Some((&stored.path, stored.last_modified)),
            _ => None,
        }
    }

    pub fn builder(&self) -> MutationBuilder {
        MutationBuilder::new(self.clone())
    }
}

impl fmt::Debug for SnapshotTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SnapshotTree");
        s.field("properties", &self.0.properties);
        match &self.0.children {
            Children::Inline(map) => s.field("children", map),
            Children::Stored(stored) => s
                .field("path", &stored.path)
                .field("revision", &stored.revision)
                .field("last_modified", &stored.last_modified),
            Children::Overlay { changes, .. } => s.field("overrides", changes),
        };
        s.finish()
    }
}

// ---------------------------------------------------------------------------
// Child iteration
// ---------------------------------------------------------------------------

/// Name-ordered iterator over `(name, child)` pairs.
///
/// Reading a stored page can fail; the error is yielded once and the
/// iterator then ends.
pub struct ChildEntries<'a> {
    inner: EntriesInner<'a>,
    done: bool,
}

enum EntriesInner<'a> {
    Inline(btree_map::Iter<'a, String, SnapshotTree>),
    Stored(ChildCursor),
    Overlay {
        base: Box<ChildEntries<'a>>,
        pending: Option<(String, SnapshotTree)>,
        changes: Peekable<btree_map::Iter<'a, String, Option<SnapshotTree>>>,
    },
}

type Entry = Result<(String, SnapshotTree), SubstrateError>;

impl Iterator for ChildEntries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.done {
            return None;
        }
        let item = match &mut self.inner {
            EntriesInner::Inline(iter) => iter.next().map(|(n, t)| Ok((n.clone(), t.clone()))),
            EntriesInner::Stored(cursor) => cursor.next(),
            EntriesInner::Overlay {
                base,
                pending,
                changes,
            } => next_overlay(base, pending, changes),
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// Merge-walk the base children with the override map.
fn next_overlay(
    base: &mut ChildEntries<'_>,
    pending: &mut Option<(String, SnapshotTree)>,
    changes: &mut Peekable<btree_map::Iter<'_, String, Option<SnapshotTree>>>,
) -> Option<Entry> {
    loop {
        if pending.is_none() {
            match base.next() {
                Some(Ok(entry)) => *pending = Some(entry),
                Some(Err(e)) => return Some(Err(e)),
                None => {}
            }
        }

        let step = match (pending.as_ref(), changes.peek()) {
            (None, None) => return None,
            (Some(_), None) => Step::Base,
            (None, Some(_)) => Step::Change,
            (Some((base_name, _)), Some((change_name, _))) => match (*change_name).cmp(base_name) {
                Ordering::Less => Step::Change,
                Ordering::Equal => Step::Shadow,
                Ordering::Greater => Step::Base,
            },
        };

        match step {
            Step::Base => {
                if let Some(entry) = pending.take() {
                    return Some(Ok(entry));
                }
            }
            Step::Change | Step::Shadow => {
                if step == Step::Shadow {
                    // The override replaces or removes the base entry.
                    *pending = None;
                }
                if let Some((name, Some(tree))) = changes.next() {
                    return Some(Ok((name.clone(), tree.clone())));
                }
            }
        }
    }
}

#[derive(PartialEq)]
enum Step {
    Base,
    Change,
    Shadow,
}
