//! Diff-driven validation of a commit.
//!
//! A [`ValidatorProvider`] hands out a root [`Validator`] for each commit.
//! The pipeline diffs `before` against `after` and reports every change to
//! the validator; a validator descends into a child only by returning a
//! validator for it.

use std::sync::Arc;

use crate::errors::CommitError;
use crate::tree::{diff, Change, ChangeRecord, PropertyValue, SnapshotTree};

type ChildValidator = Result<Option<Box<dyn Validator>>, CommitError>;

/// Callbacks for the changes of one node. Every callback defaults to
/// accepting the change and not descending.
#[allow(unused_variables)]
pub trait Validator {
    fn property_added(&self, name: &str, after: &PropertyValue) -> Result<(), CommitError> {
        Ok(())
    }

    fn property_changed(
        &self,
        name: &str,
        before: &PropertyValue,
        after: &PropertyValue,
    ) -> Result<(), CommitError> {
        Ok(())
    }

    fn property_deleted(&self, name: &str, before: &PropertyValue) -> Result<(), CommitError> {
        Ok(())
    }

    fn child_added(&self, name: &str, after: &SnapshotTree) -> ChildValidator {
        Ok(None)
    }

    fn child_changed(&self, name: &str, before: &SnapshotTree, after: &SnapshotTree) -> ChildValidator {
        Ok(None)
    }

    fn child_deleted(&self, name: &str, before: &SnapshotTree) -> ChildValidator {
        Ok(None)
    }
}

/// Source of root validators, one per commit.
pub trait ValidatorProvider: Send + Sync {
    fn name(&self) -> &str;

    fn root_validator(&self, before: &SnapshotTree, after: &SnapshotTree) -> Option<Box<dyn Validator>>;
}

/// Ordered set of providers run against every commit.
#[derive(Clone, Default)]
pub struct ValidatorPipeline {
    providers: Vec<Arc<dyn ValidatorProvider>>,
}

impl ValidatorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P: ValidatorProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Run every provider over the changes from `before` to `after`; the
    /// first rejection wins.
    pub fn validate(&self, before: &SnapshotTree, after: &SnapshotTree) -> Result<(), CommitError> {
        for provider in &self.providers {
            if let Some(validator) = provider.root_validator(before, after) {
                walk(validator.as_ref(), before, after)?;
            }
        }
        Ok(())
    }
}

fn walk(validator: &dyn Validator, before: &SnapshotTree, after: &SnapshotTree) -> Result<(), CommitError> {
    for record in diff(before, after)? {
        match record {
            ChangeRecord::Property { name, change } => match change {
                Change::Added(value) => validator.property_added(&name, &value)?,
                Change::Changed { before, after } => validator.property_changed(&name, &before, &after)?,
                Change::Removed(value) => validator.property_deleted(&name, &value)?,
            },
            ChangeRecord::Child { name, change } => match change {
                Change::Added(after) => {
                    if let Some(child) = validator.child_added(&name, &after)? {
                        walk(child.as_ref(), &SnapshotTree::empty(), &after)?;
                    }
                }
                Change::Changed { before, after } => {
                    if let Some(child) = validator.child_changed(&name, &before, &after)? {
                        walk(child.as_ref(), &before, &after)?;
                    }
                }
                Change::Removed(before) => {
                    if let Some(child) = validator.child_deleted(&name, &before)? {
                        walk(child.as_ref(), &before, &SnapshotTree::empty())?;
                    }
                }
            },
        }
    }
    Ok(())
}
