//! treemerge core library.
//!
//! This crate provides an optimistic multi-writer merge engine for a
//! hierarchical, versioned content store: immutable snapshot trees, mutation
//! builders, a tree diff, three-way conflict classification and resolution,
//! in-tree conflict markers, a commit-time conflict gate, and the node store
//! with its paginated child cursor and compare-and-publish head.

pub mod commit;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod merge_engine;
pub mod models;
pub mod store;
pub mod tree;

// Re-exports for convenience.
pub use config::MergeConfig;
pub use db::SqliteSubstrate;
pub use merge_engine::{MergeEngine, MergeOutcome, MergeState};
pub use models::{Revision, TreeModel};
pub use store::{MemorySubstrate, NodeStore};
pub use tree::{MutationBuilder, PropertyValue, SnapshotTree};
