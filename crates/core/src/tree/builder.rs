//! Mutable overlay over a base snapshot.
//!
//! A [`MutationBuilder`] records property and child changes without touching
//! its base. Touched children get their own builders; everything untouched
//! is read straight from the base, and [`MutationBuilder::snapshot`] shares
//! it with the base instead of copying.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::errors::TreeError;

use super::diff::{diff, Change, ChangeRecord};
use super::path;
use super::snapshot::{Children, SnapshotTree};
use super::value::PropertyValue;

/// Pending changes to one node of a base snapshot.
#[derive(Debug, Clone)]
pub struct MutationBuilder {
    base: SnapshotTree,
    /// `None` marks a removed property.
    properties: BTreeMap<String, Option<PropertyValue>>,
    /// `None` marks a removed child.
    children: BTreeMap<String, Option<PendingChild>>,
}

#[derive(Debug, Clone)]
struct PendingChild {
    builder: MutationBuilder,
    /// The child did not exist in the base (or replaced it wholesale).
    added: bool,
}

impl PendingChild {
    fn existing(base: SnapshotTree) -> Self {
        Self {
            builder: MutationBuilder::new(base),
            added: false,
        }
    }

    fn added(base: SnapshotTree) -> Self {
        Self {
            builder: MutationBuilder::new(base),
            added: true,
        }
    }

    fn is_modified(&self) -> bool {
        self.added || self.builder.is_modified()
    }
}

impl MutationBuilder {
    pub fn new(base: SnapshotTree) -> Self {
        Self {
            base,
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// The snapshot this builder was derived from.
    pub fn base(&self) -> &SnapshotTree {
        &self.base
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        match self.properties.get(name) {
            Some(pending) => pending.as_ref(),
            None => self.base.property(name),
        }
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), TreeError> {
        path::validate_name(name)?;
        self.properties.insert(name.to_string(), Some(value));
        Ok(())
    }

    /// Remove a property; returns whether it was present.
    pub fn remove_property(&mut self, name: &str) -> bool {
        let present = self.property(name).is_some();
        if present {
            self.properties.insert(name.to_string(), None);
        }
        present
    }

    pub fn has_child(&self, name: &str) -> Result<bool, TreeError> {
        match self.children.get(name) {
            Some(pending) => Ok(pending.is_some()),
            None => Ok(self.base.has_child(name)?),
        }
    }

    /// Builder for child `name`, creating an empty child if there is none.
    pub fn child(&mut self, name: &str) -> Result<&mut MutationBuilder, TreeError> {
        path::validate_name(name)?;
        let base = &self.base;
        let slot = match self.children.entry(name.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let pending = match base.child(name)? {
                    Some(existing) => PendingChild::existing(existing),
                    None => PendingChild::added(SnapshotTree::empty()),
                };
                e.insert(Some(pending))
            }
        };
        let pending = slot.get_or_insert_with(|| PendingChild::added(SnapshotTree::empty()));
        Ok(&mut pending.builder)
    }

    /// Builder for child `name` if it exists.
    pub fn existing_child(&mut self, name: &str) -> Result<Option<&mut MutationBuilder>, TreeError> {
        if !self.children.contains_key(name) {
            if path::validate_name(name).is_err() {
                return Ok(None);
            }
            match self.base.child(name)? {
                Some(existing) => {
                    self.children
                        .insert(name.to_string(), Some(PendingChild::existing(existing)));
                }
                None => return Ok(None),
            }
        }
        Ok(self
            .children
            .get_mut(name)
            .and_then(Option::as_mut)
            .map(|pending| &mut pending.builder))
    }

    /// Replace child `name` with `tree`, discarding pending changes below it.
    pub fn set_child(&mut self, name: &str, tree: SnapshotTree) -> Result<&mut MutationBuilder, TreeError> {
        path::validate_name(name)?;
        let slot = self
            .children
            .entry(name.to_string())
            .or_insert(None);
        let pending = slot.insert(PendingChild::added(tree));
        Ok(&mut pending.builder)
    }

    /// Remove child `name`; returns whether it was present.
    pub fn remove_child(&mut self, name: &str) -> Result<bool, TreeError> {
        let present = self.has_child(name)?;
        if present {
            self.children.insert(name.to_string(), None);
        }
        Ok(present)
    }

    /// Record the changes that turn the base into `target`.
    pub fn apply_tree(&mut self, target: &SnapshotTree) -> Result<(), TreeError> {
        for record in diff(&self.base, target)? {
            match record {
                ChangeRecord::Property { name, change } => match change.after() {
                    Some(value) => self.set_property(&name, value.clone())?,
                    None => {
                        self.remove_property(&name);
                    }
                },
                ChangeRecord::Child { name, change } => match change {
                    Change::Added(tree) => {
                        self.set_child(&name, tree)?;
                    }
                    Change::Removed(_) => {
                        self.remove_child(&name)?;
                    }
                    Change::Changed { after, .. } => self.child(&name)?.apply_tree(&after)?,
                },
            }
        }
        Ok(())
    }

    /// Whether `snapshot()` would differ from the base.
    pub fn is_modified(&self) -> bool {
        !self.properties.is_empty()
            || self.children.values().any(|pending| match pending {
                Some(child) => child.is_modified(),
                None => true,
            })
    }

    /// An immutable tree with every pending change applied.
    ///
    /// An unmodified builder returns its base itself.
    pub fn snapshot(&self) -> SnapshotTree {
        if !self.is_modified() {
            return self.base.clone();
        }

        let mut properties = self.base.properties().clone();
        for (name, pending) in &self.properties {
            match pending {
                Some(value) => {
                    properties.insert(name.clone(), value.clone());
                }
                None => {
                    properties.remove(name);
                }
            }
        }

        let changes: BTreeMap<String, Option<SnapshotTree>> = self
            .children
            .iter()
            .filter(|(_, pending)| pending.as_ref().map_or(true, PendingChild::is_modified))
            .map(|(name, pending)| {
                (
                    name.clone(),
                    pending.as_ref().map(|child| child.builder.snapshot()),
                )
            })
            .collect();

        let children = match self.base.backing() {
            Children::Inline(existing) => {
                let mut map = existing.clone();
                for (name, change) in changes {
                    match change {
                        Some(tree) => {
                            map.insert(name, tree);
                        }
                        None => {
                            map.remove(&name);
                        }
                    }
                }
                Children::Inline(map)
            }
            _ => Children::Overlay {
                base: self.base.clone(),
                changes,
            },
        };

        SnapshotTree::from_parts(properties, children)
    }
}
