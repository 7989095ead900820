//! End-to-end tests for concurrent merging through the node store.
//!
//! These tests exercise the real `MergeEngine` with:
//! - The in-memory substrate
//! - Real SQLite databases in temporary directories
//! - The conflict gate in the validation pipeline
//!
//! Every scenario that does not depend on backend behaviour runs against both
//! substrates.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use treemerge_core::commit::{ConflictValidator, ConflictValidatorProvider, ValidatorPipeline};
use treemerge_core::config::StoreConfig;
use treemerge_core::conflict::{
    clear_conflicts, read_conflicts, ConflictType, Entry, PolicyChain, PreferSide,
    MIX_MERGE_CONFLICT, REP_OURS,
};
use treemerge_core::errors::{CommitError, MergeError, SubstrateError, TreeError};
use treemerge_core::store::{
    Collection, Document, DocumentUpdate, Head, HeadRef, MemorySubstrate, NodeStore, Substrate,
};
use treemerge_core::{MergeEngine, MutationBuilder, PropertyValue, SnapshotTree, SqliteSubstrate};

// ===========================================================================
// Helpers
// ===========================================================================

/// A store on each backend. The temp dir keeps the SQLite file alive.
fn stores(config: &StoreConfig) -> Vec<(&'static str, Arc<NodeStore>, Option<TempDir>)> {
    let memory = NodeStore::open(Arc::new(MemorySubstrate::new()), config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteSubstrate::new(dir.path().join("store.db")).unwrap();
    let sqlite = NodeStore::open(Arc::new(sqlite), config).unwrap();

    vec![
        ("memory", Arc::new(memory), None),
        ("sqlite", Arc::new(sqlite), Some(dir)),
    ]
}

fn ungated(store: &Arc<NodeStore>) -> MergeEngine {
    MergeEngine::new(store.clone(), PolicyChain::new(), ValidatorPipeline::new(), 5)
}

fn gated(store: &Arc<NodeStore>, policies: PolicyChain) -> MergeEngine {
    MergeEngine::new(
        store.clone(),
        policies,
        ValidatorPipeline::new().with(ConflictValidatorProvider),
        5,
    )
}

fn head_root(store: &NodeStore) -> SnapshotTree {
    store.head().unwrap().root
}

/// Commit `edit` applied to the current head.
fn commit(engine: &MergeEngine, store: &NodeStore, edit: impl FnOnce(&mut MutationBuilder)) {
    let mut b = head_root(store).builder();
    edit(&mut b);
    engine.merge(&b).unwrap();
}

fn node(props: &[(&str, i64)]) -> SnapshotTree {
    let mut b = MutationBuilder::new(SnapshotTree::empty());
    for (name, value) in props {
        b.set_property(name, PropertyValue::long(*value)).unwrap();
    }
    b.snapshot()
}

/// Substrate wrapper recording the limit of every node query.
struct Recording {
    inner: Arc<dyn Substrate>,
    limits: Mutex<Vec<usize>>,
}

impl Recording {
    fn take(&self) -> Vec<usize> {
        std::mem::take(&mut *self.limits.lock().unwrap())
    }
}

impl Substrate for Recording {
    fn find(&self, collection: Collection, id: &str) -> Result<Option<Document>, SubstrateError> {
        self.inner.find(collection, id)
    }

    fn query(
        &self,
        collection: Collection,
        from_key: &str,
        to_key: &str,
        limit: usize,
    ) -> Result<Vec<Document>, SubstrateError> {
        if collection == Collection::Nodes {
            self.limits.lock().unwrap().push(limit);
        }
        self.inner.query(collection, from_key, to_key, limit)
    }

    fn apply(&self, updates: &[DocumentUpdate]) -> Result<(), SubstrateError> {
        self.inner.apply(updates)
    }
}

/// Substrate wrapper whose node reads fail while `broken` is set.
struct BrokenReads {
    inner: MemorySubstrate,
    broken: AtomicBool,
}

impl BrokenReads {
    fn check(&self, collection: Collection) -> Result<(), SubstrateError> {
        if collection == Collection::Nodes && self.broken.load(Ordering::SeqCst) {
            return Err(SubstrateError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

impl Substrate for BrokenReads {
    fn find(&self, collection: Collection, id: &str) -> Result<Option<Document>, SubstrateError> {
        self.check(collection)?;
        self.inner.find(collection, id)
    }

    fn query(
        &self,
        collection: Collection,
        from_key: &str,
        to_key: &str,
        limit: usize,
    ) -> Result<Vec<Document>, SubstrateError> {
        self.check(collection)?;
        self.inner.query(collection, from_key, to_key, limit)
    }

    fn apply(&self, updates: &[DocumentUpdate]) -> Result<(), SubstrateError> {
        self.inner.apply(updates)
    }
}

/// Head that commits an unrelated change just before each of the first
/// `interfere` publishes it forwards.
struct Interfering {
    inner: Arc<NodeStore>,
    interfere: AtomicU32,
    bumps: AtomicU32,
}

impl Interfering {
    fn new(inner: Arc<NodeStore>, interfere: u32) -> Self {
        Self {
            inner,
            interfere: AtomicU32::new(interfere),
            bumps: AtomicU32::new(0),
        }
    }
}

impl HeadRef for Interfering {
    fn head(&self) -> Result<Head, SubstrateError> {
        self.inner.head()
    }

    fn compare_and_publish(
        &self,
        expected: &Head,
        candidate: &SnapshotTree,
    ) -> Result<Option<Head>, SubstrateError> {
        if self.interfere.load(Ordering::SeqCst) > 0 {
            self.interfere.fetch_sub(1, Ordering::SeqCst);
            let n = self.bumps.fetch_add(1, Ordering::SeqCst);
            let current = self.inner.head()?;
            let mut b = current.root.builder();
            b.child("other")
                .unwrap()
                .set_property(&format!("bump{n}"), PropertyValue::long(i64::from(n)))
                .unwrap();
            self.inner.compare_and_publish(&current, &b.snapshot())?;
        }
        self.inner.compare_and_publish(expected, candidate)
    }
}

// ===========================================================================
// Merge semantics
// ===========================================================================

#[test]
fn test_disjoint_changes_merge_to_union() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let engine = gated(&store, PolicyChain::new());
        commit(&engine, &store, |b| {
            b.child("content").unwrap().set_property("title", PropertyValue::string("home")).unwrap();
            b.child("content").unwrap().child("old").unwrap();
        });
        let base = head_root(&store);

        let mut theirs = base.builder();
        let content = theirs.child("content").unwrap();
        content.set_property("theirs", PropertyValue::long(1)).unwrap();
        content.child("t").unwrap();
        let mut ours = base.builder();
        let content = ours.child("content").unwrap();
        content.set_property("ours", PropertyValue::long(2)).unwrap();
        content.child("o").unwrap();
        content.remove_child("old").unwrap();

        engine.merge(&theirs).unwrap();
        let outcome = engine.merge(&ours).unwrap();
        assert!(outcome.conflicts.is_empty(), "{backend}");

        let content = head_root(&store).child("content").unwrap().unwrap();
        assert_eq!(content.property("title"), Some(&PropertyValue::string("home")), "{backend}");
        assert_eq!(content.property("theirs"), Some(&PropertyValue::long(1)), "{backend}");
        assert_eq!(content.property("ours"), Some(&PropertyValue::long(2)), "{backend}");
        assert!(content.has_child("t").unwrap(), "{backend}");
        assert!(content.has_child("o").unwrap(), "{backend}");
        assert!(!content.has_child("old").unwrap(), "{backend}");
        assert!(ConflictValidator::check_tree(&head_root(&store)).is_ok(), "{backend}");
    }
}

#[test]
fn test_identical_changes_do_not_conflict() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let engine = gated(&store, PolicyChain::new());
        commit(&engine, &store, |b| {
            b.set_property("shared", PropertyValue::long(0)).unwrap();
            b.child("gone").unwrap();
        });
        let base = head_root(&store);

        let edit = |b: &mut MutationBuilder| {
            b.set_property("shared", PropertyValue::long(9)).unwrap();
            b.set_child("n", node(&[("x", 1)])).unwrap();
            b.remove_child("gone").unwrap();
        };
        let mut theirs = base.builder();
        edit(&mut theirs);
        let mut ours = base.builder();
        edit(&mut ours);

        engine.merge(&theirs).unwrap();
        let outcome = engine.merge(&ours).unwrap();
        assert!(outcome.conflicts.is_empty(), "{backend}");

        let root = head_root(&store);
        assert_eq!(root.property("shared"), Some(&PropertyValue::long(9)), "{backend}");
        assert!(!root.has_child("gone").unwrap(), "{backend}");
        assert!(root.mixin_types().is_empty(), "{backend}");
    }
}

#[test]
fn test_concurrent_add_of_same_child_is_marked() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let engine = ungated(&store);
        commit(&engine, &store, |b| {
            b.child("parent").unwrap();
        });
        let base = head_root(&store);

        let mut theirs = base.builder();
        theirs.child("parent").unwrap().set_child("n", node(&[("v", 1)])).unwrap();
        let mut ours = base.builder();
        ours.child("parent").unwrap().set_child("n", node(&[("v", 2)])).unwrap();

        engine.merge(&theirs).unwrap();
        let outcome = engine.merge(&ours).unwrap();
        assert_eq!(outcome.conflicts.len(), 1, "{backend}");
        assert_eq!(outcome.conflicts[0].conflict_type, ConflictType::AddExistingNode);
        assert_eq!(outcome.conflicts[0].path, "/parent");

        let parent = head_root(&store).child("parent").unwrap().unwrap();
        assert!(parent.mixin_types().contains(&MIX_MERGE_CONFLICT), "{backend}");
        // The committed side stays visible.
        let visible = parent.child("n").unwrap().unwrap();
        assert_eq!(visible.property("v"), Some(&PropertyValue::long(1)), "{backend}");

        let entries = read_conflicts(&parent).unwrap();
        assert_eq!(entries.len(), 1, "{backend}");
        assert_eq!(entries[0].conflict_type, ConflictType::AddExistingNode);
        assert_eq!(entries[0].name, "n");
        match (&entries[0].ours, &entries[0].theirs) {
            (Some(Entry::Node(ours)), Some(Entry::Node(theirs))) => {
                assert_eq!(ours.property("v"), Some(&PropertyValue::long(2)), "{backend}");
                assert_eq!(theirs.property("v"), Some(&PropertyValue::long(1)), "{backend}");
            }
            other => panic!("{backend}: unexpected marker sides {other:?}"),
        }
        let bucket = parent
            .child(REP_OURS)
            .unwrap()
            .unwrap()
            .child("addExistingNode")
            .unwrap();
        assert!(bucket.is_some(), "{backend}");
    }
}

#[test]
fn test_prefer_theirs_policy_never_leaves_markers() {
    let mut rng = StdRng::seed_from_u64(0x7265_6d65);
    let policies = || PolicyChain::new().with(PreferSide::theirs().only([ConflictType::ChangeChangedProperty]));

    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let engine = gated(&store, policies());
        for round in 0..20 {
            let names: Vec<String> = (0..8).map(|i| format!("p{i}")).collect();
            commit(&engine, &store, |b| {
                for name in &names {
                    b.set_property(name, PropertyValue::long(0)).unwrap();
                }
            });
            let base = head_root(&store);

            let mut theirs = base.builder();
            let mut ours = base.builder();
            let mut expected = Vec::new();
            for name in &names {
                let their_value = rng.gen_bool(0.5).then(|| rng.gen_range(1..1000));
                let our_value = rng.gen_bool(0.5).then(|| rng.gen_range(1..1000));
                if let Some(v) = their_value {
                    theirs.set_property(name, PropertyValue::long(v)).unwrap();
                }
                if let Some(v) = our_value {
                    ours.set_property(name, PropertyValue::long(v)).unwrap();
                }
                expected.push(their_value.or(our_value).unwrap_or(0));
            }

            engine.merge(&theirs).unwrap();
            let outcome = engine
                .merge(&ours)
                .unwrap_or_else(|e| panic!("{backend} round {round}: {e}"));
            assert!(
                outcome
                    .conflicts
                    .iter()
                    .all(|c| c.conflict_type == ConflictType::ChangeChangedProperty),
                "{backend} round {round}"
            );

            let root = head_root(&store);
            assert!(root.mixin_types().is_empty(), "{backend} round {round}");
            for (name, value) in names.iter().zip(expected) {
                assert_eq!(
                    root.property(name),
                    Some(&PropertyValue::long(value)),
                    "{backend} round {round} {name}"
                );
            }
        }
    }
}

// ===========================================================================
// Commit gate
// ===========================================================================

#[test]
fn test_gate_rejects_marked_tree_by_path() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let engine = gated(&store, PolicyChain::new());
        commit(&engine, &store, |b| {
            b.child("a").unwrap().child("b").unwrap().set_property("p", PropertyValue::long(0)).unwrap();
        });
        let base = head_root(&store);

        let mut theirs = base.builder();
        theirs.child("a").unwrap().child("b").unwrap().set_property("p", PropertyValue::long(1)).unwrap();
        let mut ours = base.builder();
        ours.child("a").unwrap().child("b").unwrap().set_property("p", PropertyValue::long(2)).unwrap();

        engine.merge(&theirs).unwrap();
        let revision = store.head().unwrap().revision;
        match engine.merge(&ours) {
            Err(MergeError::Commit(CommitError::UnresolvedConflict { path })) => {
                assert_eq!(path, "/a/b", "{backend}")
            }
            other => panic!("{backend}: unexpected result {other:?}"),
        }
        assert_eq!(store.head().unwrap().revision, revision, "{backend}");
    }
}

#[test]
fn test_cleared_markers_pass_the_gate() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let plain = ungated(&store);
        commit(&plain, &store, |b| {
            b.child("doc").unwrap().set_property("title", PropertyValue::string("a")).unwrap();
        });
        let base = head_root(&store);

        let mut theirs = base.builder();
        theirs.child("doc").unwrap().set_property("title", PropertyValue::string("b")).unwrap();
        let mut ours = base.builder();
        ours.child("doc").unwrap().set_property("title", PropertyValue::string("c")).unwrap();
        plain.merge(&theirs).unwrap();
        plain.merge(&ours).unwrap();

        let marked = head_root(&store);
        match ConflictValidator::check_tree(&marked) {
            Err(CommitError::UnresolvedConflict { path }) => assert_eq!(path, "/doc", "{backend}"),
            other => panic!("{backend}: unexpected result {other:?}"),
        }

        let mut fix = marked.builder();
        let doc = fix.child("doc").unwrap();
        doc.set_property("title", PropertyValue::string("c")).unwrap();
        assert!(clear_conflicts(doc).unwrap());
        gated(&store, PolicyChain::new()).merge(&fix).unwrap();

        let doc = head_root(&store).child("doc").unwrap().unwrap();
        assert_eq!(doc.property("title"), Some(&PropertyValue::string("c")), "{backend}");
        assert!(!doc.has_child(REP_OURS).unwrap(), "{backend}");
        assert!(ConflictValidator::check_tree(&head_root(&store)).is_ok(), "{backend}");
    }
}

// ===========================================================================
// Paginated child listing
// ===========================================================================

#[test]
fn test_child_listing_page_count() {
    const L: usize = 4;
    let config = StoreConfig {
        page_limit: L,
        ..StoreConfig::default()
    };

    for k in [0, 1, L - 1, L, L + 1, 2 * L, 2 * L + 1, 5 * L + 3] {
        let substrate = Arc::new(Recording {
            inner: Arc::new(MemorySubstrate::new()),
            limits: Mutex::new(Vec::new()),
        });
        let store = Arc::new(NodeStore::open(substrate.clone(), &config).unwrap());
        let expected: Vec<String> = (0..k).map(|i| format!("child-{i:03}")).collect();
        if k > 0 {
            commit(&ungated(&store), &store, |b| {
                for name in &expected {
                    b.child(name).unwrap().set_property("i", PropertyValue::long(1)).unwrap();
                }
            });
        }

        // Reopen so the root is read back from the substrate.
        let store = NodeStore::open(substrate.clone(), &config).unwrap();
        let root = head_root(&store);
        substrate.take();

        let names: Vec<String> = root.children().map(|c| c.unwrap().0).collect();
        let limits = substrate.take();

        assert_eq!(names, expected, "k={k}");
        assert_eq!(limits.len(), k.div_ceil(L), "k={k}");
        assert!(limits.iter().all(|&limit| limit == L + 1), "k={k}: {limits:?}");
    }
}

#[test]
fn test_child_listing_on_sqlite() {
    let config = StoreConfig {
        page_limit: 3,
        ..StoreConfig::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.db");

    {
        let store = Arc::new(NodeStore::open(Arc::new(SqliteSubstrate::new(&db_path).unwrap()), &config).unwrap());
        commit(&ungated(&store), &store, |b| {
            for i in 0..10 {
                b.child(&format!("c{i}")).unwrap();
            }
        });
        commit(&ungated(&store), &store, |b| {
            b.remove_child("c4").unwrap();
        });
    }

    let store = NodeStore::open(Arc::new(SqliteSubstrate::new(&db_path).unwrap()), &config).unwrap();
    let names: BTreeSet<String> = head_root(&store).children().map(|c| c.unwrap().0).collect();
    let expected: BTreeSet<String> = (0..10).filter(|i| *i != 4).map(|i| format!("c{i}")).collect();
    assert_eq!(names, expected);
}

// ===========================================================================
// Retry
// ===========================================================================

#[test]
fn test_retry_after_single_interference_keeps_local_changes() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let head = Arc::new(Interfering::new(store.clone(), 1));
        let engine = MergeEngine::new(
            head,
            PolicyChain::new(),
            ValidatorPipeline::new().with(ConflictValidatorProvider),
            3,
        );

        let mut b = head_root(&store).builder();
        b.child("mine").unwrap().set_property("v", PropertyValue::long(1)).unwrap();
        let outcome = engine.merge(&b).unwrap();

        assert_eq!(outcome.attempts, 2, "{backend}");
        assert_eq!(outcome.head.revision.0, 2, "{backend}");
        let root = head_root(&store);
        assert!(root.has_child("mine").unwrap(), "{backend}");
        assert!(root.has_child("other").unwrap(), "{backend}");
    }
}

#[test]
fn test_head_moving_every_attempt_does_not_converge() {
    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let head = Arc::new(Interfering::new(store.clone(), u32::MAX));
        let engine = MergeEngine::new(head, PolicyChain::new(), ValidatorPipeline::new(), 3);

        let mut b = head_root(&store).builder();
        b.child("mine").unwrap();
        match engine.merge(&b) {
            Err(MergeError::NotConverged { attempts }) => assert_eq!(attempts, 3, "{backend}"),
            other => panic!("{backend}: unexpected result {other:?}"),
        }
        assert!(!head_root(&store).has_child("mine").unwrap(), "{backend}");
    }
}

#[test]
fn test_read_failure_while_merging_fails_the_merge() {
    let substrate = Arc::new(BrokenReads {
        inner: MemorySubstrate::new(),
        broken: AtomicBool::new(false),
    });
    let store = Arc::new(NodeStore::open(substrate.clone(), &StoreConfig::default()).unwrap());
    let engine = ungated(&store);
    commit(&engine, &store, |b| {
        b.child("a").unwrap().child("x").unwrap();
        b.child("b").unwrap();
    });

    let mut ours = head_root(&store).builder();
    ours.child("a")
        .unwrap()
        .child("x")
        .unwrap()
        .set_property("v", PropertyValue::long(1))
        .unwrap();
    commit(&engine, &store, |b| {
        b.child("b").unwrap().set_property("n", PropertyValue::long(2)).unwrap();
    });

    substrate.broken.store(true, Ordering::SeqCst);
    let result = engine.merge(&ours);
    substrate.broken.store(false, Ordering::SeqCst);

    match result {
        Err(MergeError::Tree(TreeError::Substrate(SubstrateError::Unavailable(_))))
        | Err(MergeError::Substrate(SubstrateError::Unavailable(_))) => {}
        other => panic!("unexpected result {other:?}"),
    }
    let head = store.head().unwrap();
    assert_eq!(head.revision.0, 2);
    let x = head.root.child("a").unwrap().unwrap().child("x").unwrap().unwrap();
    assert!(!x.has_property("v"));
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[test]
fn test_concurrent_writers_each_land_once() {
    const WRITERS: usize = 6;
    const MERGES: usize = 5;

    for (backend, store, _dir) in stores(&StoreConfig::default()) {
        let engine = Arc::new(MergeEngine::new(
            store.clone(),
            PolicyChain::new(),
            ValidatorPipeline::new().with(ConflictValidatorProvider),
            1_000,
        ));

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let engine = engine.clone();
                let store = store.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(w as u64);
                    let mut revisions = Vec::new();
                    for m in 0..MERGES {
                        let mut b = store.head().unwrap().root.builder();
                        b.child(&format!("w{w}"))
                            .unwrap()
                            .child(&format!("m{m}"))
                            .unwrap()
                            .set_property("n", PropertyValue::long(rng.gen_range(0..100)))
                            .unwrap();
                        let outcome = engine.merge(&b).unwrap();
                        assert!(outcome.conflicts.is_empty());
                        revisions.push(outcome.head.revision.0);
                    }
                    revisions
                })
            })
            .collect();

        let mut revisions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        revisions.sort_unstable();
        let expected: Vec<u64> = (1..=(WRITERS * MERGES) as u64).collect();
        assert_eq!(revisions, expected, "{backend}");

        let root = head_root(&store);
        assert_eq!(store.head().unwrap().revision.0, (WRITERS * MERGES) as u64, "{backend}");
        for w in 0..WRITERS {
            let writer = root.child(&format!("w{w}")).unwrap().unwrap();
            assert_eq!(writer.child_count().unwrap(), MERGES, "{backend} w{w}");
        }
    }
}
