//! Pluggable conflict resolution.
//!
//! A [`PolicyChain`] is an ordered list of [`ResolutionPolicy`] values. Each
//! conflict is offered to every policy in turn and the first answer other
//! than [`Decision::NotResolved`] wins. Policies are pure: they only look at
//! the [`ConflictContext`] they are given and may run on any writer's thread.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tree::{PropertyValue, SnapshotTree, Value};

use super::detector::ConflictType;
use super::text::merge_text;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One side's value for a conflicting name.
#[derive(Debug, Clone)]
pub enum Entry {
    Property(PropertyValue),
    Node(SnapshotTree),
}

impl Entry {
    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node(_))
    }

    pub fn as_property(&self) -> Option<&PropertyValue> {
        match self {
            Self::Property(v) => Some(v),
            Self::Node(_) => None,
        }
    }
}

/// Everything a policy may inspect about one conflict.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub conflict_type: ConflictType,
    /// Path of the node holding the conflicting property or child.
    pub path: String,
    pub name: String,
    pub ours: Option<Entry>,
    pub theirs: Option<Entry>,
    pub base: Option<Entry>,
}

/// A policy's answer for one conflict.
#[derive(Debug, Clone)]
pub enum Decision {
    UseOurs,
    UseTheirs,
    /// Replace both sides with this value.
    Merged(Entry),
    /// Defer to the next policy.
    NotResolved,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UseOurs => "ours",
            Self::UseTheirs => "theirs",
            Self::Merged(_) => "merged",
            Self::NotResolved => "unresolved",
        }
    }
}

/// Which side a side-picking policy keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Ours,
    Theirs,
}

impl Side {
    fn decision(self) -> Decision {
        match self {
            Self::Ours => Decision::UseOurs,
            Self::Theirs => Decision::UseTheirs,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

/// A conflict resolution strategy.
pub trait ResolutionPolicy: Send + Sync {
    /// Name recorded in conflict reports.
    fn name(&self) -> &str;

    fn resolve(&self, conflict: &ConflictContext) -> Decision;
}

impl<F> ResolutionPolicy for F
where
    F: Fn(&ConflictContext) -> Decision + Send + Sync,
{
    fn name(&self) -> &str {
        "custom"
    }

    fn resolve(&self, conflict: &ConflictContext) -> Decision {
        self(conflict)
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Result of running a conflict through a [`PolicyChain`].
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved { policy: String, decision: Decision },
    Unresolved,
}

/// Ordered list of policies; first non-`NotResolved` decision wins.
#[derive(Clone, Default)]
pub struct PolicyChain {
    policies: Vec<Arc<dyn ResolutionPolicy>>,
}

impl PolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a policy, builder style.
    pub fn with<P: ResolutionPolicy + 'static>(mut self, policy: P) -> Self {
        self.push(policy);
        self
    }

    pub fn push<P: ResolutionPolicy + 'static>(&mut self, policy: P) {
        self.policies.push(Arc::new(policy));
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    pub fn resolve(&self, conflict: &ConflictContext) -> Resolution {
        for policy in &self.policies {
            let decision = policy.resolve(conflict);
            match &decision {
                Decision::NotResolved => continue,
                Decision::Merged(entry) if entry.is_node() != conflict.conflict_type.effects_node() => {
                    warn!(
                        policy = policy.name(),
                        conflict_type = %conflict.conflict_type,
                        path = %conflict.path,
                        name = %conflict.name,
                        "merged value kind does not match the conflict, ignoring"
                    );
                    continue;
                }
                _ => {}
            }
            debug!(
                policy = policy.name(),
                decision = decision.label(),
                conflict_type = %conflict.conflict_type,
                name = %conflict.name,
                "conflict resolved"
            );
            return Resolution::Resolved {
                policy: policy.name().to_string(),
                decision,
            };
        }
        Resolution::Unresolved
    }
}

impl fmt::Debug for PolicyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in policies
// ---------------------------------------------------------------------------

/// Always keep one side, optionally only for some conflict types.
#[derive(Debug, Clone)]
pub struct PreferSide {
    side: Side,
    types: Option<Vec<ConflictType>>,
    name: String,
}

impl PreferSide {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            types: None,
            name: format!("prefer-{side}"),
        }
    }

    pub fn ours() -> Self {
        Self::new(Side::Ours)
    }

    pub fn theirs() -> Self {
        Self::new(Side::Theirs)
    }

    /// Restrict the policy to the given conflict types.
    pub fn only(mut self, types: impl IntoIterator<Item = ConflictType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }
}

impl ResolutionPolicy for PreferSide {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, conflict: &ConflictContext) -> Decision {
        match &self.types {
            Some(types) if !types.contains(&conflict.conflict_type) => Decision::NotResolved,
            _ => self.side.decision(),
        }
    }
}

/// Keep one side for conflicting names matching a glob pattern.
#[derive(Debug, Clone)]
pub struct NamePatternPolicy {
    name: String,
    pattern: String,
    inner: PreferSide,
}

impl NamePatternPolicy {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, side: Side) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            inner: PreferSide::new(side),
        }
    }

    pub fn only(mut self, types: impl IntoIterator<Item = ConflictType>) -> Self {
        self.inner = self.inner.only(types);
        self
    }
}

impl ResolutionPolicy for NamePatternPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, conflict: &ConflictContext) -> Decision {
        if glob_match::glob_match(&self.pattern, &conflict.name) {
            self.inner.resolve(conflict)
        } else {
            Decision::NotResolved
        }
    }
}

/// Three-way line merge of single string properties changed on both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMergePolicy;

impl ResolutionPolicy for TextMergePolicy {
    fn name(&self) -> &str {
        "text-merge"
    }

    fn resolve(&self, conflict: &ConflictContext) -> Decision {
        if conflict.conflict_type != ConflictType::ChangeChangedProperty {
            return Decision::NotResolved;
        }
        let text = |entry: &Option<Entry>| match entry.as_ref().and_then(Entry::as_property) {
            Some(PropertyValue::Single(Value::String(s))) => Some(s.clone()),
            _ => None,
        };
        let (Some(base), Some(ours), Some(theirs)) =
            (text(&conflict.base), text(&conflict.ours), text(&conflict.theirs))
        else {
            return Decision::NotResolved;
        };
        match merge_text(&base, &ours, &theirs) {
            Some(merged) => Decision::Merged(Entry::Property(PropertyValue::string(merged))),
            None => Decision::NotResolved,
        }
    }
}
