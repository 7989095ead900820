//! The head revision and the compare-and-publish primitive.
//!
//! [`NodeStore::compare_and_publish`] is the only place that writes nodes.
//! It runs under the commit lock, compares the expected head with the
//! current one and, if they match, writes one entry at the next revision for
//! every node that differs from the current head root. Readers never take
//! the commit lock: they clone the current [`Head`] and read immutable
//! revisions from the substrate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::errors::SubstrateError;
use crate::models::Revision;
use crate::tree::{diff, path, Change, ChangeRecord, PropertyValue, SnapshotTree, Value};

use super::reader::NodeReader;
use super::substrate::{id_from_path, Collection, DocumentUpdate, NodeRecord, Substrate};

const HEAD_ID: &str = "head";
const HEAD_REVISION: &str = "revision";
const HEAD_COMMITTED_AT: &str = "committedAt";

/// A committed snapshot and its position in the head chain.
#[derive(Debug, Clone)]
pub struct Head {
    pub revision: Revision,
    pub root: SnapshotTree,
    pub committed_at: DateTime<Utc>,
}

/// Access to a linearizable head pointer.
pub trait HeadRef: Send + Sync {
    /// The current head.
    fn head(&self) -> Result<Head, SubstrateError>;

    /// Publish `candidate` as the next head if the head is still `expected`.
    ///
    /// Returns the new head, or `None` when the head has moved (nothing is
    /// written in that case).
    fn compare_and_publish(
        &self,
        expected: &Head,
        candidate: &SnapshotTree,
    ) -> Result<Option<Head>, SubstrateError>;
}

/// Versioned node store over a [`Substrate`].
pub struct NodeStore {
    reader: Arc<NodeReader>,
    head: RwLock<Head>,
    commit_lock: Mutex<()>,
}

impl NodeStore {
    /// Open the store, resuming the persisted head or initialising an empty
    /// root at revision 0.
    pub fn open(substrate: Arc<dyn Substrate>, config: &StoreConfig) -> Result<Self, SubstrateError> {
        let reader = NodeReader::new(substrate, config.page_limit);
        let head = match reader.substrate().find(Collection::Settings, HEAD_ID)? {
            Some(doc) => {
                let (_, record) = doc
                    .entries
                    .last_key_value()
                    .ok_or_else(|| corrupt("no head entry"))?;
                let (revision, committed_at) = parse_head(record)?;
                let root = reader
                    .read(path::ROOT, revision)?
                    .ok_or_else(|| corrupt("head root missing"))?;
                Head {
                    revision,
                    root,
                    committed_at,
                }
            }
            None => {
                let committed_at = Utc::now();
                let revision = Revision::INITIAL;
                let record = NodeRecord::live(BTreeMap::new(), false);
                let root = reader.written(path::ROOT, revision, &record);
                reader.substrate().apply(&[
                    DocumentUpdate {
                        collection: Collection::Nodes,
                        id: id_from_path(path::ROOT),
                        revision,
                        record,
                    },
                    head_update(revision, committed_at)?,
                ])?;
                Head {
                    revision,
                    root,
                    committed_at,
                }
            }
        };
        info!(revision = %head.revision, "opened node store");
        Ok(Self {
            reader,
            head: RwLock::new(head),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn reader(&self) -> &Arc<NodeReader> {
        &self.reader
    }

    fn current(&self) -> Head {
        self.head
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("commit lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl HeadRef for NodeStore {
    fn head(&self) -> Result<Head, SubstrateError> {
        Ok(self.current())
    }

    fn compare_and_publish(
        &self,
        expected: &Head,
        candidate: &SnapshotTree,
    ) -> Result<Option<Head>, SubstrateError> {
        let _guard = self.lock_commits();
        let current = self.current();
        if current.revision != expected.revision {
            debug!(
                expected = %expected.revision,
                current = %current.revision,
                "head moved, publish refused"
            );
            return Ok(None);
        }

        let revision = current.revision.next();
        let committed_at = Utc::now();
        let mut updates = Vec::new();
        collect_writes(path::ROOT, Some(&current.root), candidate, revision, &mut updates)?;
        let nodes = updates.len();
        let root_id = id_from_path(path::ROOT);
        // Once the batch is applied the revision is taken, so nothing after
        // `apply` may fail.
        let root = match updates
            .iter()
            .find(|u| u.collection == Collection::Nodes && u.id == root_id)
        {
            Some(update) => self.reader.written(path::ROOT, revision, &update.record),
            None => current.root.clone(),
        };
        updates.push(head_update(revision, committed_at)?);
        self.reader.substrate().apply(&updates)?;

        let head = Head {
            revision,
            root,
            committed_at,
        };
        *self.head.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = head.clone();
        info!(revision = %revision, nodes, "published head");
        Ok(Some(head))
    }
}

/// Queue an entry for every node under `node_path` that differs between
/// `before` and `after`. Returns whether anything was queued.
fn collect_writes(
    node_path: &str,
    before: Option<&SnapshotTree>,
    after: &SnapshotTree,
    revision: Revision,
    out: &mut Vec<DocumentUpdate>,
) -> Result<bool, SubstrateError> {
    let changed = match before {
        Some(before) if before.same_as(after) => return Ok(false),
        Some(before) => {
            let mut changed = false;
            for record in diff(before, after)? {
                changed = true;
                if let ChangeRecord::Child { name, change } = record {
                    let child_path = path::join(node_path, &name);
                    match change {
                        Change::Added(tree) => {
                            collect_writes(&child_path, None, &tree, revision, out)?;
                        }
                        Change::Changed { before, after } => {
                            collect_writes(&child_path, Some(&before), &after, revision, out)?;
                        }
                        Change::Removed(tree) => {
                            collect_tombstones(&child_path, &tree, revision, out)?;
                        }
                    }
                }
            }
            changed
        }
        None => {
            for entry in after.children() {
                let (name, child) = entry?;
                collect_writes(&path::join(node_path, &name), None, &child, revision, out)?;
            }
            true
        }
    };
    if changed {
        out.push(DocumentUpdate {
            collection: Collection::Nodes,
            id: id_from_path(node_path),
            revision,
            record: NodeRecord::live(after.properties().clone(), after.has_children()?),
        });
    }
    Ok(changed)
}

/// Queue a deletion for `tree` and every descendant it still has.
fn collect_tombstones(
    node_path: &str,
    tree: &SnapshotTree,
    revision: Revision,
    out: &mut Vec<DocumentUpdate>,
) -> Result<(), SubstrateError> {
    for entry in tree.children() {
        let (name, child) = entry?;
        collect_tombstones(&path::join(node_path, &name), &child, revision, out)?;
    }
    out.push(DocumentUpdate {
        collection: Collection::Nodes,
        id: id_from_path(node_path),
        revision,
        record: NodeRecord::tombstone(),
    });
    Ok(())
}

fn head_update(revision: Revision, committed_at: DateTime<Utc>) -> Result<DocumentUpdate, SubstrateError> {
    let number = i64::try_from(revision.0)
        .map_err(|_| SubstrateError::Backend(format!("revision {revision} out of range")))?;
    let mut properties = BTreeMap::new();
    properties.insert(HEAD_REVISION.to_string(), PropertyValue::long(number));
    properties.insert(
        HEAD_COMMITTED_AT.to_string(),
        PropertyValue::Single(Value::Date(committed_at.to_rfc3339())),
    );
    Ok(DocumentUpdate {
        collection: Collection::Settings,
        id: HEAD_ID.to_string(),
        revision,
        record: NodeRecord::live(properties, false),
    })
}

fn parse_head(record: &NodeRecord) -> Result<(Revision, DateTime<Utc>), SubstrateError> {
    let single = |name: &str| record.properties.get(name).and_then(PropertyValue::as_single);
    let revision = match single(HEAD_REVISION) {
        Some(Value::Long(n)) => u64::try_from(*n)
            .map(Revision)
            .map_err(|_| corrupt("negative revision"))?,
        _ => return Err(corrupt("missing head revision")),
    };
    let committed_at = match single(HEAD_COMMITTED_AT) {
        Some(Value::Date(raw)) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| corrupt(&format!("bad commit time: {e}")))?
            .with_timezone(&Utc),
        _ => return Err(corrupt("missing commit time")),
    };
    Ok((revision, committed_at))
}

fn corrupt(detail: &str) -> SubstrateError {
    SubstrateError::Corrupt {
        id: HEAD_ID.to_string(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::store::memory::MemorySubstrate;
    use crate::store::substrate::Document;
    use crate::tree::MutationBuilder;

    fn store() -> (Arc<MemorySubstrate>, NodeStore) {
        let substrate = Arc::new(MemorySubstrate::new());
        let store = NodeStore::open(substrate.clone(), &StoreConfig::default()).unwrap();
        (substrate, store)
    }

    /// Fails the first `find` after each successful `apply`.
    struct FlakyReads {
        inner: MemorySubstrate,
        fail_next_find: AtomicBool,
    }

    impl Substrate for FlakyReads {
        fn find(&self, collection: Collection, id: &str) -> Result<Option<Document>, SubstrateError> {
            if self.fail_next_find.swap(false, Ordering::SeqCst) {
                return Err(SubstrateError::Unavailable("read timeout".into()));
            }
            self.inner.find(collection, id)
        }

        fn query(
            &self,
            collection: Collection,
            from_key: &str,
            to_key: &str,
            limit: usize,
        ) -> Result<Vec<Document>, SubstrateError> {
            self.inner.query(collection, from_key, to_key, limit)
        }

        fn apply(&self, updates: &[DocumentUpdate]) -> Result<(), SubstrateError> {
            self.inner.apply(updates)?;
            self.fail_next_find.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample() -> SnapshotTree {
        let mut b = MutationBuilder::new(SnapshotTree::empty());
        b.set_property("title", PropertyValue::string("root")).unwrap();
        b.child("a").unwrap().child("deep").unwrap();
        b.child("b").unwrap().set_property("n", PropertyValue::long(1)).unwrap();
        b.snapshot()
    }

    #[test]
    fn test_open_initialises_empty_root() {
        let (_substrate, store) = store();
        let head = store.head().unwrap();
        assert_eq!(head.revision, Revision::INITIAL);
        assert!(head.root.properties().is_empty());
        assert!(!head.root.has_children().unwrap());
    }

    #[test]
    fn test_publish_and_read_back() {
        let (_substrate, store) = store();
        let head = store.head().unwrap();
        let published = store.compare_and_publish(&head, &sample()).unwrap().unwrap();
        assert_eq!(published.revision, Revision(1));

        let root = store.head().unwrap().root;
        assert_eq!(root.property("title"), Some(&PropertyValue::string("root")));
        let a = root.child("a").unwrap().unwrap();
        assert!(a.has_child("deep").unwrap());
        assert_eq!(a.stored_location(), Some(("/a", Revision(1))));
    }

    #[test]
    fn test_stale_expected_head_writes_nothing() {
        let (substrate, store) = store();
        let stale = store.head().unwrap();
        store.compare_and_publish(&stale, &sample()).unwrap().unwrap();
        let docs_before = substrate.len(Collection::Nodes);

        let result = store.compare_and_publish(&stale, &SnapshotTree::empty()).unwrap();
        assert!(result.is_none());
        assert_eq!(substrate.len(Collection::Nodes), docs_before);
        assert_eq!(store.head().unwrap().revision, Revision(1));
    }

    #[test]
    fn test_untouched_subtrees_keep_their_revision() {
        let (_substrate, store) = store();
        let h1 = store.compare_and_publish(&store.head().unwrap(), &sample()).unwrap().unwrap();

        let mut b = h1.root.builder();
        b.child("b").unwrap().set_property("n", PropertyValue::long(2)).unwrap();
        let h2 = store.compare_and_publish(&h1, &b.snapshot()).unwrap().unwrap();

        let a1 = h1.root.child("a").unwrap().unwrap();
        let a2 = h2.root.child("a").unwrap().unwrap();
        assert!(a1.same_as(&a2));
        let b2 = h2.root.child("b").unwrap().unwrap();
        assert_eq!(b2.stored_location(), Some(("/b", Revision(2))));
        assert_eq!(h2.root.stored_location(), Some(("/", Revision(2))));
    }

    #[test]
    fn test_removed_subtree_is_not_resurrected() {
        let (_substrate, store) = store();
        let h1 = store.compare_and_publish(&store.head().unwrap(), &sample()).unwrap().unwrap();

        let mut b = h1.root.builder();
        b.remove_child("a").unwrap();
        let h2 = store.compare_and_publish(&h1, &b.snapshot()).unwrap().unwrap();
        assert!(!h2.root.has_child("a").unwrap());

        let mut b = h2.root.builder();
        b.child("a").unwrap();
        let h3 = store.compare_and_publish(&h2, &b.snapshot()).unwrap().unwrap();
        let a = h3.root.child("a").unwrap().unwrap();
        assert!(!a.has_child("deep").unwrap());
        assert_eq!(a.child_count().unwrap(), 0);

        // Older revisions stay readable.
        assert!(h1.root.child("a").unwrap().unwrap().has_child("deep").unwrap());
    }

    #[test]
    fn test_reopen_resumes_head() {
        let (substrate, store) = store();
        store.compare_and_publish(&store.head().unwrap(), &sample()).unwrap().unwrap();
        drop(store);

        let reopened = NodeStore::open(substrate, &StoreConfig::default()).unwrap();
        let head = reopened.head().unwrap();
        assert_eq!(head.revision, Revision(1));
        assert!(head.root.has_child("b").unwrap());
    }

    #[test]
    fn test_applied_batch_is_the_new_head_without_reading_back() {
        let substrate = Arc::new(FlakyReads {
            inner: MemorySubstrate::new(),
            fail_next_find: AtomicBool::new(false),
        });
        let store = NodeStore::open(substrate.clone(), &StoreConfig::default()).unwrap();
        substrate.fail_next_find.store(false, Ordering::SeqCst);
        let initial = store.head().unwrap();

        let mut a = initial.root.builder();
        a.child("ghost").unwrap();
        let published = store.compare_and_publish(&initial, &a.snapshot()).unwrap().unwrap();
        assert_eq!(published.revision, Revision(1));
        assert!(substrate.fail_next_find.load(Ordering::SeqCst));

        // A second writer on the same expected head loses.
        let mut b = initial.root.builder();
        b.child("real").unwrap();
        assert!(store.compare_and_publish(&initial, &b.snapshot()).unwrap().is_none());

        substrate.fail_next_find.store(false, Ordering::SeqCst);
        let head = store.head().unwrap();
        assert_eq!(head.revision, Revision(1));
        assert!(head.root.has_child("ghost").unwrap());
        assert!(!head.root.has_child("real").unwrap());

        let reopened = NodeStore::open(substrate, &StoreConfig::default()).unwrap();
        let head = reopened.head().unwrap();
        assert_eq!(head.revision, Revision(1));
        assert!(head.root.has_child("ghost").unwrap());
    }

    #[test]
    fn test_unchanged_candidate_advances_revision_only() {
        let (_substrate, store) = store();
        let h1 = store.compare_and_publish(&store.head().unwrap(), &sample()).unwrap().unwrap();
        let h2 = store.compare_and_publish(&h1, &h1.root).unwrap().unwrap();
        assert_eq!(h2.revision, Revision(2));
        assert!(h2.root.same_as(&h1.root));
        assert_eq!(h2.root.stored_location(), Some(("/", Revision(1))));
    }
}
