//! Three-way merge of snapshot trees.
//!
//! The merged tree is built over *theirs* (the committed side): every local
//! change that does not collide is replayed onto it, colliding changes go
//! through the policy chain, and whatever stays unresolved keeps theirs'
//! value and is recorded with a conflict marker on the parent.

use std::fmt;

use tracing::debug;

use crate::errors::TreeError;
use crate::tree::{path, Change, MutationBuilder, NodeChanges, PropertyValue, SnapshotTree};

use super::detector::{classify_child, classify_property, ChildOutcome, ConflictType};
use super::marker::{self, MarkerEntry};
use super::resolver::{ConflictContext, Decision, Entry, PolicyChain, Resolution};

/// How one conflict ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Resolved { policy: String, decision: String },
    Unresolved,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { policy, decision } => write!(f, "{decision} ({policy})"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// One conflict met while merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    /// Path of the node holding the conflicting name.
    pub path: String,
    pub name: String,
    pub conflict_type: ConflictType,
    pub outcome: Outcome,
}

/// The merged tree and every conflict encountered on the way.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub tree: SnapshotTree,
    pub conflicts: Vec<ConflictReport>,
}

impl MergeResult {
    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictReport> {
        self.conflicts
            .iter()
            .filter(|c| c.outcome == Outcome::Unresolved)
    }

    pub fn has_unresolved(&self) -> bool {
        self.unresolved().next().is_some()
    }
}

/// Merge `ours` and `theirs`, both derived from `base`.
pub fn merge_trees(
    base: &SnapshotTree,
    ours: &SnapshotTree,
    theirs: &SnapshotTree,
    policies: &PolicyChain,
) -> Result<MergeResult, TreeError> {
    let mut conflicts = Vec::new();
    let tree = merge_node(path::ROOT, base, ours, theirs, policies, &mut conflicts)?;
    Ok(MergeResult { tree, conflicts })
}

fn merge_node(
    node_path: &str,
    base: &SnapshotTree,
    ours: &SnapshotTree,
    theirs: &SnapshotTree,
    policies: &PolicyChain,
    reports: &mut Vec<ConflictReport>,
) -> Result<SnapshotTree, TreeError> {
    if ours.same_as(base) {
        return Ok(theirs.clone());
    }
    if theirs.same_as(base) || ours.same_as(theirs) {
        return Ok(ours.clone());
    }

    let local = NodeChanges::between(base, ours)?;
    if local.is_empty() {
        return Ok(theirs.clone());
    }
    let remote = NodeChanges::between(base, theirs)?;
    if remote.is_empty() {
        return Ok(ours.clone());
    }

    let mut builder = MutationBuilder::new(theirs.clone());
    let mut unresolved = Vec::new();

    for (name, change) in &local.properties {
        let Some(their_change) = remote.properties.get(name) else {
            apply_property(&mut builder, name, change.after())?;
            continue;
        };
        let Some(conflict_type) = classify_property(change, their_change) else {
            continue;
        };
        let context = ConflictContext {
            conflict_type,
            path: node_path.to_string(),
            name: name.clone(),
            ours: change.after().cloned().map(Entry::Property),
            theirs: their_change.after().cloned().map(Entry::Property),
            base: change.before().cloned().map(Entry::Property),
        };
        match resolve(policies, &context, reports) {
            Some(Decision::UseOurs) => apply_property(&mut builder, name, change.after())?,
            Some(Decision::Merged(Entry::Property(value))) => builder.set_property(name, value)?,
            Some(_) => {}
            None => unresolved.push(marker_entry(context)),
        }
    }

    for (name, change) in &local.children {
        let Some(their_change) = remote.children.get(name) else {
            apply_child(&mut builder, name, change.after())?;
            continue;
        };
        let conflict_type = match classify_child(change, their_change)? {
            ChildOutcome::Agree => continue,
            ChildOutcome::Recurse => {
                if let (Change::Changed { before, after }, Change::Changed { after: their_after, .. }) =
                    (change, their_change)
                {
                    let child_path = path::join(node_path, name);
                    let merged = merge_node(&child_path, before, after, their_after, policies, reports)?;
                    if !merged.same_as(their_after) {
                        builder.set_child(name, merged)?;
                    }
                }
                continue;
            }
            ChildOutcome::Conflict(conflict_type) => conflict_type,
        };
        let context = ConflictContext {
            conflict_type,
            path: node_path.to_string(),
            name: name.clone(),
            ours: change.after().cloned().map(Entry::Node),
            theirs: their_change.after().cloned().map(Entry::Node),
            base: change.before().cloned().map(Entry::Node),
        };
        match resolve(policies, &context, reports) {
            Some(Decision::UseOurs) => apply_child(&mut builder, name, change.after())?,
            Some(Decision::Merged(Entry::Node(tree))) => {
                builder.set_child(name, tree)?;
            }
            Some(_) => {}
            None => unresolved.push(marker_entry(context)),
        }
    }

    if !unresolved.is_empty() {
        debug!(
            path = node_path,
            count = unresolved.len(),
            "recording unresolved conflicts"
        );
        marker::annotate(&mut builder, &unresolved)?;
    }
    Ok(builder.snapshot())
}

/// Run the chain and record the outcome. `None` means unresolved.
fn resolve(
    policies: &PolicyChain,
    context: &ConflictContext,
    reports: &mut Vec<ConflictReport>,
) -> Option<Decision> {
    let (outcome, decision) = match policies.resolve(context) {
        Resolution::Resolved { policy, decision } => (
            Outcome::Resolved {
                policy,
                decision: decision.label().to_string(),
            },
            Some(decision),
        ),
        Resolution::Unresolved => (Outcome::Unresolved, None),
    };
    debug!(
        path = %context.path,
        name = %context.name,
        conflict_type = %context.conflict_type,
        outcome = %outcome,
        "conflict"
    );
    reports.push(ConflictReport {
        path: context.path.clone(),
        name: context.name.clone(),
        conflict_type: context.conflict_type,
        outcome,
    });
    decision
}

fn marker_entry(context: ConflictContext) -> MarkerEntry {
    MarkerEntry {
        conflict_type: context.conflict_type,
        name: context.name,
        ours: context.ours,
        theirs: context.theirs,
    }
}

fn apply_property(
    builder: &mut MutationBuilder,
    name: &str,
    value: Option<&PropertyValue>,
) -> Result<(), TreeError> {
    match value {
        Some(value) => builder.set_property(name, value.clone())?,
        None => {
            builder.remove_property(name);
        }
    }
    Ok(())
}

fn apply_child(
    builder: &mut MutationBuilder,
    name: &str,
    tree: Option<&SnapshotTree>,
) -> Result<(), TreeError> {
    match tree {
        Some(tree) => {
            builder.set_child(name, tree.clone())?;
        }
        None => {
            builder.remove_child(name)?;
        }
    }
    Ok(())
}
