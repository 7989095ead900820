//! Domain model types shared by the store, the merge engine and the CLI.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{SubstrateError, TreeError};
use crate::tree::{MutationBuilder, PropertyValue, SnapshotTree};

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// Position of a committed snapshot in the head chain.
///
/// Revisions are dense: every successful publish produces `previous + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const INITIAL: Revision = Revision(0);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tree model (JSON interchange)
// ---------------------------------------------------------------------------

/// Plain, fully materialized tree used for JSON import and export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeModel {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, TreeModel>,
}

impl TreeModel {
    /// Build an in-memory snapshot from this model.
    pub fn to_snapshot(&self) -> Result<SnapshotTree, TreeError> {
        let mut builder = MutationBuilder::new(SnapshotTree::empty());
        self.fill(&mut builder)?;
        Ok(builder.snapshot())
    }

    fn fill(&self, builder: &mut MutationBuilder) -> Result<(), TreeError> {
        for (name, value) in &self.properties {
            builder.set_property(name, value.clone())?;
        }
        for (name, child) in &self.children {
            child.fill(builder.child(name)?)?;
        }
        Ok(())
    }

    /// Materialize a snapshot, reading every stored child.
    pub fn from_snapshot(tree: &SnapshotTree) -> Result<Self, SubstrateError> {
        let mut children = BTreeMap::new();
        for entry in tree.children() {
            let (name, child) = entry?;
            children.insert(name, Self::from_snapshot(&child)?);
        }
        Ok(Self {
            properties: tree.properties().clone(),
            children,
        })
    }
}
