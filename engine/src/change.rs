//! Staged changes.
//!
//! A builder never applies writes to its base snapshot. Every write is
//! expressed as a [`Change`], applied to the builder's private working copy
//! and appended to its log. Replaying the log onto another base is how a
//! diff is re-targeted or composed.

use crate::{
    state::Touched, EntityRecord, FieldValue, Fields, Handle, Origin, RelationId, SymbolicId,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Field-level difference between two versions of a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    /// Fields given a new value
    pub set: Fields,
    /// Fields removed
    pub unset: BTreeSet<String>,
    /// New provenance tag
    pub origin: Option<Origin>,
}

impl FieldPatch {
    /// The patch turning `before` into `after`.
    pub fn between(before: &EntityRecord, after: &EntityRecord) -> Self {
        let set = after
            .fields()
            .iter()
            .filter(|(name, value)| before.get(name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let unset = before
            .fields()
            .keys()
            .filter(|name| after.get(name).is_none())
            .cloned()
            .collect();
        let origin = (before.origin() != after.origin()).then(|| after.origin().clone());
        Self { set, unset, origin }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.origin.is_none()
    }

    /// Build the patched version of `record`. Untouched values are shared.
    pub fn apply_to(&self, record: &EntityRecord) -> EntityRecord {
        let mut fields = record.fields().clone();
        for name in &self.unset {
            fields.remove(name);
        }
        for (name, value) in &self.set {
            fields.insert(name.clone(), value.clone());
        }
        let origin = self.origin.clone().unwrap_or_else(|| record.origin().clone());
        EntityRecord::new(record.type_id(), fields, origin)
    }

    /// Value this patch leaves in `field`: `Some(None)` when the field is
    /// unset, `None` when the patch does not touch it.
    pub fn outcome(&self, field: &str) -> Option<Option<&FieldValue>> {
        if let Some(value) = self.set.get(field) {
            Some(Some(value))
        } else if self.unset.contains(field) {
            Some(None)
        } else {
            None
        }
    }

    /// Names of the fields this patch touches.
    pub fn touched_fields(&self) -> impl Iterator<Item = &String> {
        self.set.keys().chain(self.unset.iter())
    }
}

/// A staged write.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Create {
        handle: Handle,
        record: Arc<EntityRecord>,
    },
    Modify {
        handle: Handle,
        patch: FieldPatch,
    },
    Remove {
        handle: Handle,
    },
    SetRelation {
        relation: RelationId,
        child: Handle,
        parent: Handle,
        strict: bool,
    },
    RemoveRelation {
        relation: RelationId,
        child: Handle,
    },
    Rename {
        from: SymbolicId,
        to: SymbolicId,
    },
}

impl Change {
    /// Short name of the change kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Create { .. } => "create",
            Change::Modify { .. } => "modify",
            Change::Remove { .. } => "remove",
            Change::SetRelation { .. } => "set_relation",
            Change::RemoveRelation { .. } => "remove_relation",
            Change::Rename { .. } => "rename",
        }
    }
}

/// Ordered log of the changes a builder staged, with the handles they
/// touched relative to the base snapshot.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeLog {
    pub changes: Vec<Change>,
    pub created: BTreeSet<Handle>,
    pub modified: BTreeSet<Handle>,
    pub linked: BTreeSet<Handle>,
    /// Base records removed; records created and removed again are dropped
    pub removed: BTreeSet<Handle>,
}

impl ChangeLog {
    pub fn record(&mut self, change: Change, touched: Touched) {
        self.created.extend(touched.created);
        self.modified.extend(touched.modified);
        self.linked.extend(touched.linked);
        for handle in touched.removed {
            self.modified.remove(&handle);
            self.linked.remove(&handle);
            if !self.created.remove(&handle) {
                self.removed.insert(handle);
            }
        }
        self.changes.push(change);
    }

    /// Whether the log has no net effect on its base. Records created and
    /// removed again do not count.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.modified.is_empty()
            && self.linked.is_empty()
            && self.removed.is_empty()
    }

    /// Records whose fields must be checked at seal.
    pub fn dirty(&self) -> BTreeSet<Handle> {
        self.created.union(&self.modified).copied().collect()
    }

    /// Records whose mandatory relations must be checked at seal.
    pub fn relation_checks(&self) -> BTreeSet<Handle> {
        let mut handles = self.dirty();
        handles.extend(self.linked.iter().copied());
        handles
    }
}

/// Net effect of a builder on one record, relative to its base snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Added {
        handle: Handle,
        record: Arc<EntityRecord>,
    },
    Removed {
        handle: Handle,
        record: Arc<EntityRecord>,
    },
    Replaced {
        handle: Handle,
        old: Arc<EntityRecord>,
        new: Arc<EntityRecord>,
    },
}

impl EntityChange {
    pub fn handle(&self) -> Handle {
        match self {
            EntityChange::Added { handle, .. }
            | EntityChange::Removed { handle, .. }
            | EntityChange::Replaced { handle, .. } => *handle,
        }
    }
}
