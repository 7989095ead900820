//! Rejects commits that still carry unresolved conflict markers.
//!
//! The caller-visible error names the offending path only. The conflicting
//! values, redacted, go to the debug log.

use tracing::{debug, Level};

use crate::conflict::marker::{read_conflicts, MarkerEntry, MIX_MERGE_CONFLICT, REP_OURS};
use crate::conflict::Entry;
use crate::errors::CommitError;
use crate::tree::{path, PropertyValue, SnapshotTree, JCR_MIXIN_TYPES};

use super::validator::{Validator, ValidatorPipeline, ValidatorProvider};

const NOT_APPLICABLE: &str = "<N/A>";

/// Validator for one node of the commit.
pub struct ConflictValidator {
    path: String,
    node: SnapshotTree,
}

impl ConflictValidator {
    pub fn new(path: impl Into<String>, node: SnapshotTree) -> Self {
        Self {
            path: path.into(),
            node,
        }
    }

    /// Check a whole tree, as if every node in it were new.
    pub fn check_tree(tree: &SnapshotTree) -> Result<(), CommitError> {
        ValidatorPipeline::new()
            .with(ConflictValidatorProvider)
            .validate(&SnapshotTree::empty(), tree)
    }

    fn child(&self, name: &str, after: &SnapshotTree) -> Box<dyn Validator> {
        Box::new(Self::new(path::join(&self.path, name), after.clone()))
    }

    fn carries_marker(&self) -> bool {
        self.node.mixin_types().contains(&MIX_MERGE_CONFLICT)
    }

    fn check_mixins(&self, name: &str, after: &PropertyValue) -> Result<(), CommitError> {
        let marked = name == JCR_MIXIN_TYPES
            && after
                .values()
                .iter()
                .any(|v| v.as_str() == Some(MIX_MERGE_CONFLICT));
        if marked {
            return self.reject();
        }
        Ok(())
    }

    fn reject(&self) -> Result<(), CommitError> {
        if tracing::enabled!(Level::DEBUG) {
            match read_conflicts(&self.node) {
                Ok(entries) => debug!(
                    path = %self.path,
                    conflicts = %describe(&self.path, &entries),
                    "unresolved conflicts"
                ),
                Err(e) => debug!(path = %self.path, error = %e, "unresolved conflicts, marker unreadable"),
            }
        }
        Err(CommitError::UnresolvedConflict {
            path: self.path.clone(),
        })
    }
}

impl Validator for ConflictValidator {
    fn property_added(&self, name: &str, after: &PropertyValue) -> Result<(), CommitError> {
        self.check_mixins(name, after)
    }

    fn property_changed(
        &self,
        name: &str,
        _before: &PropertyValue,
        after: &PropertyValue,
    ) -> Result<(), CommitError> {
        self.check_mixins(name, after)
    }

    fn child_added(&self, name: &str, after: &SnapshotTree) -> Result<Option<Box<dyn Validator>>, CommitError> {
        if name == REP_OURS && self.carries_marker() {
            self.reject()?;
        }
        Ok(Some(self.child(name, after)))
    }

    fn child_changed(
        &self,
        name: &str,
        _before: &SnapshotTree,
        after: &SnapshotTree,
    ) -> Result<Option<Box<dyn Validator>>, CommitError> {
        if name == REP_OURS && self.carries_marker() {
            self.reject()?;
        }
        Ok(Some(self.child(name, after)))
    }
}

/// Installs a [`ConflictValidator`] at the root of every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictValidatorProvider;

impl ValidatorProvider for ConflictValidatorProvider {
    fn name(&self) -> &str {
        "conflict"
    }

    fn root_validator(&self, _before: &SnapshotTree, after: &SnapshotTree) -> Option<Box<dyn Validator>> {
        Some(Box::new(ConflictValidator::new(path::ROOT, after.clone())))
    }
}

/// Redacted, human-readable summary of the conflicts on one node.
fn describe(node_path: &str, entries: &[MarkerEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "{} {}: ours={}, theirs={}",
                e.conflict_type,
                path::join(node_path, &e.name),
                describe_entry(&e.ours),
                describe_entry(&e.theirs)
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_entry(entry: &Option<Entry>) -> String {
    match entry {
        None => NOT_APPLICABLE.to_string(),
        Some(Entry::Property(value)) => value.describe(),
        Some(Entry::Node(tree)) => {
            let names: Vec<String> = tree
                .children()
                .filter_map(|c| c.ok().map(|(name, _)| name))
                .collect();
            format!("[{}]", names.join(", "))
        }
    }
}
