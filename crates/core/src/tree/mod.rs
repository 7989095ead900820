//! Immutable snapshot trees, their builders and the diff between two trees.

pub mod builder;
pub mod diff;
pub mod path;
pub mod snapshot;
pub mod value;

pub use builder::MutationBuilder;
pub use diff::{diff, trees_equal, Change, ChangeKind, ChangeRecord, NodeChanges};
pub use snapshot::{ChildEntries, SnapshotTree};
pub use value::{PropertyValue, Value, ValueType};

/// Multi-valued `Name` property listing a node's mixin types.
pub const JCR_MIXIN_TYPES: &str = "jcr:mixinTypes";
