//! In-tree record of unresolved conflicts.
//!
//! A node with unresolved conflicts carries the `rep:MergeConflict` mixin
//! and a `rep:ours` child laid out as:
//!
//! ```text
//! <parent>                 jcr:mixinTypes += rep:MergeConflict
//!   rep:ours
//!     <conflictTypeName>   one bucket per conflict type
//!       <entryName>        rep:kind = "property" | "node"
//!                          "ours" / "theirs" as properties or child nodes
//!                          rep:absent = sides without a value
//! ```

use tracing::warn;

use crate::errors::{SubstrateError, TreeError};
use crate::tree::{MutationBuilder, PropertyValue, SnapshotTree, Value, JCR_MIXIN_TYPES};

use super::detector::ConflictType;
use super::resolver::Entry;

/// Mixin marking a node with unresolved conflicts.
pub const MIX_MERGE_CONFLICT: &str = "rep:MergeConflict";
/// Marker container child.
pub const REP_OURS: &str = "rep:ours";
pub const REP_KIND: &str = "rep:kind";
pub const REP_ABSENT: &str = "rep:absent";
pub const OURS: &str = "ours";
pub const THEIRS: &str = "theirs";

const KIND_PROPERTY: &str = "property";
const KIND_NODE: &str = "node";

/// One unresolved conflict on a property or child of a node.
#[derive(Debug, Clone)]
pub struct MarkerEntry {
    pub conflict_type: ConflictType,
    pub name: String,
    /// `None` when ours has no value (it deleted the item).
    pub ours: Option<Entry>,
    pub theirs: Option<Entry>,
}

/// Record `conflicts` on the node being built, merging into any marker it
/// already carries.
pub fn annotate(builder: &mut MutationBuilder, conflicts: &[MarkerEntry]) -> Result<(), TreeError> {
    if conflicts.is_empty() {
        return Ok(());
    }

    let mut mixins = mixin_names(builder.property(JCR_MIXIN_TYPES));
    if !mixins.iter().any(|m| m == MIX_MERGE_CONFLICT) {
        mixins.push(MIX_MERGE_CONFLICT.to_string());
        builder.set_property(JCR_MIXIN_TYPES, PropertyValue::names(mixins))?;
    }

    let container = builder.child(REP_OURS)?;
    for conflict in conflicts {
        let bucket = container.child(conflict.conflict_type.name())?;
        let entry = bucket.set_child(&conflict.name, SnapshotTree::empty())?;
        let kind = if conflict.conflict_type.effects_node() {
            KIND_NODE
        } else {
            KIND_PROPERTY
        };
        entry.set_property(REP_KIND, PropertyValue::string(kind))?;

        let mut absent = Vec::new();
        for (side, value) in [(OURS, &conflict.ours), (THEIRS, &conflict.theirs)] {
            match value {
                Some(Entry::Property(v)) => entry.set_property(side, v.clone())?,
                Some(Entry::Node(tree)) => {
                    entry.set_child(side, tree.clone())?;
                }
                None => absent.push(side),
            }
        }
        if !absent.is_empty() {
            entry.set_property(REP_ABSENT, PropertyValue::names(absent))?;
        }
    }
    Ok(())
}

/// Whether `tree` itself carries the conflict mixin.
pub fn has_conflict_marker(tree: &SnapshotTree) -> bool {
    tree.mixin_types().contains(&MIX_MERGE_CONFLICT)
}

/// The conflicts recorded on `tree`, in bucket then name order.
pub fn read_conflicts(tree: &SnapshotTree) -> Result<Vec<MarkerEntry>, SubstrateError> {
    let mut entries = Vec::new();
    let Some(container) = tree.child(REP_OURS)? else {
        return Ok(entries);
    };
    for bucket in container.children() {
        let (bucket_name, bucket) = bucket?;
        let Some(conflict_type) = ConflictType::from_name(&bucket_name) else {
            warn!(bucket = %bucket_name, "unknown conflict bucket, skipping");
            continue;
        };
        for entry in bucket.children() {
            let (name, node) = entry?;
            let absent = mixin_names(node.property(REP_ABSENT));
            let is_node = match node.property(REP_KIND).and_then(PropertyValue::as_single) {
                Some(Value::String(kind)) => kind == KIND_NODE,
                _ => conflict_type.effects_node(),
            };
            let side = |side: &str| -> Result<Option<Entry>, SubstrateError> {
                if absent.iter().any(|a| a == side) {
                    return Ok(None);
                }
                Ok(if is_node {
                    node.child(side)?.map(Entry::Node)
                } else {
                    node.property(side).cloned().map(Entry::Property)
                })
            };
            entries.push(MarkerEntry {
                conflict_type,
                ours: side(OURS)?,
                theirs: side(THEIRS)?,
                name,
            });
        }
    }
    Ok(entries)
}

/// Drop the marker container and the conflict mixin. Returns whether the
/// node carried either.
pub fn clear_conflicts(builder: &mut MutationBuilder) -> Result<bool, TreeError> {
    let removed = builder.remove_child(REP_OURS)?;
    let mixins = mixin_names(builder.property(JCR_MIXIN_TYPES));
    let had_mixin = mixins.iter().any(|m| m == MIX_MERGE_CONFLICT);
    if had_mixin {
        let remaining: Vec<String> = mixins
            .into_iter()
            .filter(|m| m != MIX_MERGE_CONFLICT)
            .collect();
        if remaining.is_empty() {
            builder.remove_property(JCR_MIXIN_TYPES);
        } else {
            builder.set_property(JCR_MIXIN_TYPES, PropertyValue::names(remaining))?;
        }
    }
    Ok(removed || had_mixin)
}

fn mixin_names(value: Option<&PropertyValue>) -> Vec<String> {
    value
        .map(|v| {
            v.values()
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
