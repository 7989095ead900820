//! Conflict taxonomy and classification.
//!
//! Given the change one side made to a name and the change the other side
//! made to the same name (both relative to the common base), the classifier
//! decides whether the two collide and how.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SubstrateError;
use crate::tree::{trees_equal, Change, PropertyValue, SnapshotTree};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a local change and a concurrently committed change collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    /// Both sides added the same property with different values.
    AddExistingProperty,
    /// Both sides removed the same property. Never produced by the
    /// classifier; kept so existing markers can be read.
    DeleteDeletedProperty,
    /// Ours changed a property theirs removed.
    ChangeDeletedProperty,
    /// Ours removed a property theirs changed.
    DeleteChangedProperty,
    /// Both sides changed the same property to different values.
    ChangeChangedProperty,
    /// Both sides removed the same child. Never produced by the classifier.
    DeleteDeletedNode,
    /// Both sides added a child with the same name and different content.
    AddExistingNode,
    /// Ours changed a subtree theirs removed.
    ChangeDeletedNode,
    /// Ours removed a subtree theirs changed.
    DeleteChangedNode,
}

impl ConflictType {
    pub const ALL: [ConflictType; 9] = [
        Self::AddExistingProperty,
        Self::DeleteDeletedProperty,
        Self::ChangeDeletedProperty,
        Self::DeleteChangedProperty,
        Self::ChangeChangedProperty,
        Self::DeleteDeletedNode,
        Self::AddExistingNode,
        Self::ChangeDeletedNode,
        Self::DeleteChangedNode,
    ];

    /// Persisted name, used for marker buckets.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddExistingProperty => "addExistingProperty",
            Self::DeleteDeletedProperty => "deleteDeletedProperty",
            Self::ChangeDeletedProperty => "changeDeletedProperty",
            Self::DeleteChangedProperty => "deleteChangedProperty",
            Self::ChangeChangedProperty => "changeChangedProperty",
            Self::DeleteDeletedNode => "deleteDeletedNode",
            Self::AddExistingNode => "addExistingNode",
            Self::ChangeDeletedNode => "changeDeletedNode",
            Self::DeleteChangedNode => "deleteChangedNode",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Whether the conflict is about a child node rather than a property.
    pub fn effects_node(&self) -> bool {
        matches!(
            self,
            Self::DeleteDeletedNode
                | Self::AddExistingNode
                | Self::ChangeDeletedNode
                | Self::DeleteChangedNode
        )
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with a child name both sides touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Both sides agree; take theirs.
    Agree,
    /// Both sides changed the subtree; merge it recursively.
    Recurse,
    Conflict(ConflictType),
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Classify two changes to the same property. `None` means both sides
/// arrived at the same state.
pub fn classify_property(
    ours: &Change<PropertyValue>,
    theirs: &Change<PropertyValue>,
) -> Option<ConflictType> {
    use Change::*;

    match (ours, theirs) {
        (Removed(_), Removed(_)) => None,
        (Added(x), Added(y)) => (x != y).then_some(ConflictType::AddExistingProperty),
        (Changed { after: x, .. }, Changed { after: y, .. }) => {
            (x != y).then_some(ConflictType::ChangeChangedProperty)
        }
        (Changed { .. }, Removed(_)) => Some(ConflictType::ChangeDeletedProperty),
        (Removed(_), Changed { .. }) => Some(ConflictType::DeleteChangedProperty),
        // An add on one side and a change or remove on the other cannot come
        // from one base; compare the resulting values.
        (ours, theirs) => {
            (ours.after() != theirs.after()).then_some(ConflictType::ChangeChangedProperty)
        }
    }
}

/// Classify two changes to the same child.
pub fn classify_child(
    ours: &Change<SnapshotTree>,
    theirs: &Change<SnapshotTree>,
) -> Result<ChildOutcome, SubstrateError> {
    use Change::*;

    Ok(match (ours, theirs) {
        (Removed(_), Removed(_)) => ChildOutcome::Agree,
        (Added(x), Added(y)) => {
            if trees_equal(x, y)? {
                ChildOutcome::Agree
            } else {
                ChildOutcome::Conflict(ConflictType::AddExistingNode)
            }
        }
        (Changed { .. }, Changed { .. }) => ChildOutcome::Recurse,
        (Changed { .. }, Removed(_)) => ChildOutcome::Conflict(ConflictType::ChangeDeletedNode),
        (Removed(_), Changed { .. }) => ChildOutcome::Conflict(ConflictType::DeleteChangedNode),
        (ours, theirs) => match (ours.after(), theirs.after()) {
            (Some(x), Some(y)) if trees_equal(x, y)? => ChildOutcome::Agree,
            (None, None) => ChildOutcome::Agree,
            _ => ChildOutcome::Conflict(ConflictType::AddExistingNode),
        },
    })
}
