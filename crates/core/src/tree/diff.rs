//! Structural difference between two snapshot trees.
//!
//! [`diff`] is scoped to one node: it reports the direct properties and
//! children that differ and leaves recursion into changed children to the
//! caller. Children are compared by a sorted merge-walk over both
//! name-ordered child sequences, so stored children stream page by page and
//! are never collected in full.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::SubstrateError;

use super::snapshot::{ChildEntries, Children, SnapshotTree};
use super::value::PropertyValue;

/// How one property or child differs between two trees.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Added(T),
    Removed(T),
    Changed { before: T, after: T },
}

/// Tag of a [`Change`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "ADDED"),
            Self::Removed => write!(f, "REMOVED"),
            Self::Changed => write!(f, "CHANGED"),
        }
    }
}

impl<T> Change<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Added(_) => ChangeKind::Added,
            Self::Removed(_) => ChangeKind::Removed,
            Self::Changed { .. } => ChangeKind::Changed,
        }
    }

    /// The value before the change, if there was one.
    pub fn before(&self) -> Option<&T> {
        match self {
            Self::Added(_) => None,
            Self::Removed(before) | Self::Changed { before, .. } => Some(before),
        }
    }

    /// The value after the change, if there is one.
    pub fn after(&self) -> Option<&T> {
        match self {
            Self::Removed(_) => None,
            Self::Added(after) | Self::Changed { after, .. } => Some(after),
        }
    }
}

/// One difference found by [`diff`].
#[derive(Debug, Clone)]
pub enum ChangeRecord {
    Property {
        name: String,
        change: Change<PropertyValue>,
    },
    Child {
        name: String,
        change: Change<SnapshotTree>,
    },
}

impl ChangeRecord {
    pub fn name(&self) -> &str {
        match self {
            Self::Property { name, .. } | Self::Child { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Property { change, .. } => change.kind(),
            Self::Child { change, .. } => change.kind(),
        }
    }
}

/// Differences between the direct properties and children of two trees.
///
/// Properties come first in name order, then children in name order.
pub fn diff(from: &SnapshotTree, to: &SnapshotTree) -> Result<Vec<ChangeRecord>, SubstrateError> {
    let mut records = Vec::new();
    if from.same_as(to) {
        return Ok(records);
    }
    property_changes(from, to, |name, change| {
        records.push(ChangeRecord::Property {
            name: name.to_string(),
            change,
        });
        true
    });
    child_changes(from, to, |name, change| {
        records.push(ChangeRecord::Child { name, change });
        true
    })?;
    Ok(records)
}

/// Whether two trees hold the same properties and the same children,
/// recursively. Stops at the first difference.
pub fn trees_equal(a: &SnapshotTree, b: &SnapshotTree) -> Result<bool, SubstrateError> {
    if a.same_as(b) {
        return Ok(true);
    }
    if a.properties() != b.properties() {
        return Ok(false);
    }
    let mut equal = true;
    child_changes(a, b, |_, _| {
        equal = false;
        false
    })?;
    Ok(equal)
}

/// Feed each property difference to `emit` until it returns `false`.
fn property_changes<F>(from: &SnapshotTree, to: &SnapshotTree, mut emit: F)
where
    F: FnMut(&str, Change<PropertyValue>) -> bool,
{
    let before = from.properties();
    let after = to.properties();
    let mut names: Vec<&String> = before.keys().chain(after.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let change = match (before.get(name), after.get(name)) {
            (Some(b), Some(a)) if b == a => continue,
            (Some(b), Some(a)) => Change::Changed {
                before: b.clone(),
                after: a.clone(),
            },
            (Some(b), None) => Change::Removed(b.clone()),
            (None, Some(a)) => Change::Added(a.clone()),
            (None, None) => continue,
        };
        if !emit(name, change) {
            return;
        }
    }
}

/// Feed each child difference to `emit` until it returns `false`.
fn child_changes<F>(
    from: &SnapshotTree,
    to: &SnapshotTree,
    mut emit: F,
) -> Result<(), SubstrateError>
where
    F: FnMut(String, Change<SnapshotTree>) -> bool,
{
    // An overlay over the other side only differs where it has overrides.
    if let Children::Overlay { base, changes } = to.backing() {
        if base.same_as(from) {
            for (name, change) in changes {
                let before = from.child(name)?;
                if let Some(change) = classify(before, change.clone())? {
                    if !emit(name.clone(), change) {
                        break;
                    }
                }
            }
            return Ok(());
        }
    }
    if let Children::Overlay { base, changes } = from.backing() {
        if base.same_as(to) {
            for (name, change) in changes {
                let after = to.child(name)?;
                if let Some(change) = classify(change.clone(), after)? {
                    if !emit(name.clone(), change) {
                        break;
                    }
                }
            }
            return Ok(());
        }
    }

    let mut left = from.children();
    let mut right = to.children();
    let mut l = next_child(&mut left)?;
    let mut r = next_child(&mut right)?;

    loop {
        let (change, name) = match (l.take(), r.take()) {
            (None, None) => return Ok(()),
            (Some((name, before)), None) => {
                l = next_child(&mut left)?;
                (Some(Change::Removed(before)), name)
            }
            (None, Some((name, after))) => {
                r = next_child(&mut right)?;
                (Some(Change::Added(after)), name)
            }
            (Some((ln, before)), Some((rn, after))) => match ln.cmp(&rn) {
                Ordering::Less => {
                    r = Some((rn, after));
                    l = next_child(&mut left)?;
                    (Some(Change::Removed(before)), ln)
                }
                Ordering::Greater => {
                    l = Some((ln, before));
                    r = next_child(&mut right)?;
                    (Some(Change::Added(after)), rn)
                }
                Ordering::Equal => {
                    l = next_child(&mut left)?;
                    r = next_child(&mut right)?;
                    (classify(Some(before), Some(after))?, ln)
                }
            },
        };
        if let Some(change) = change {
            if !emit(name, change) {
                return Ok(());
            }
        }
    }
}

fn next_child(
    entries: &mut ChildEntries<'_>,
) -> Result<Option<(String, SnapshotTree)>, SubstrateError> {
    entries.next().transpose()
}

/// The change between two optional versions of the same child.
fn classify(
    before: Option<SnapshotTree>,
    after: Option<SnapshotTree>,
) -> Result<Option<Change<SnapshotTree>>, SubstrateError> {
    Ok(match (before, after) {
        (None, None) => None,
        (None, Some(after)) => Some(Change::Added(after)),
        (Some(before), None) => Some(Change::Removed(before)),
        (Some(before), Some(after)) => {
            if trees_equal(&before, &after)? {
                None
            } else {
                Some(Change::Changed { before, after })
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Per-node grouping
// ---------------------------------------------------------------------------

/// The changes of one node keyed by name, as consumed by the classifier.
#[derive(Debug, Clone, Default)]
pub struct NodeChanges {
    pub properties: BTreeMap<String, Change<PropertyValue>>,
    pub children: BTreeMap<String, Change<SnapshotTree>>,
}

impl NodeChanges {
    pub fn between(from: &SnapshotTree, to: &SnapshotTree) -> Result<Self, SubstrateError> {
        let mut changes = Self::default();
        for record in diff(from, to)? {
            match record {
                ChangeRecord::Property { name, change } => {
                    changes.properties.insert(name, change);
                }
                ChangeRecord::Child { name, change } => {
                    changes.children.insert(name, change);
                }
            }
        }
        Ok(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.children.is_empty()
    }
}
