//! Conflict classification, resolution, tree merging and conflict markers.
//!
//! The conflict subsystem is responsible for:
//! 1. **Classification** -- deciding how two changes to the same name collide.
//! 2. **Resolution** -- offering each collision to an ordered policy chain.
//! 3. **Merging** -- building the merged tree over the committed side.
//! 4. **Markers** -- recording what stayed unresolved inside the tree.

pub mod detector;
pub mod marker;
pub mod merger;
pub mod resolver;
pub mod text;

pub use detector::{classify_child, classify_property, ChildOutcome, ConflictType};
pub use marker::{
    annotate, clear_conflicts, has_conflict_marker, read_conflicts, MarkerEntry,
    MIX_MERGE_CONFLICT, REP_OURS,
};
pub use merger::{merge_trees, ConflictReport, MergeResult, Outcome};
pub use resolver::{
    ConflictContext, Decision, Entry, NamePatternPolicy, PolicyChain, PreferSide, Resolution,
    ResolutionPolicy, Side, TextMergePolicy,
};
pub use text::merge_text;
