//! Relation index: parent/child edges per relation kind.
//!
//! One table per declared relation holds both directions, so "children of X"
//! and "parent of Y" are map lookups. Both maps are split into hashed
//! buckets; a write copies the bucket it lands in and leaves the rest shared
//! with earlier snapshots, like the chunks of a record table.

use crate::{
    error::Result,
    shard::ShardedMap,
    Error, Handle, RecordStore, RelationKind, SchemaRegistry,
};
use std::sync::Arc;

/// How a one-to-one edge is treated when one endpoint is already linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Detach the existing edge and attach the new one
    Replace,
    /// Reject with `CardinalityViolation`
    Strict,
}

/// Edges touched by a single attach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeUpdate {
    /// Parent the child was attached to before, if any
    pub previous_parent: Option<Handle>,
    /// Child detached from a one-to-one parent to make room
    pub displaced_child: Option<Handle>,
}

#[derive(Debug, Clone, Default)]
struct RelationTable {
    children: ShardedMap<Handle, Vec<Handle>>,
    parents: ShardedMap<Handle, Handle>,
}

impl RelationTable {
    fn detach_child(&mut self, child: Handle) -> Option<Handle> {
        let parent = self.parents.remove(&child)?;
        let emptied = match self.children.get_mut(&parent) {
            Some(children) => {
                children.retain(|c| *c != child);
                children.is_empty()
            }
            None => false,
        };
        if emptied {
            self.children.remove(&parent);
        }
        Some(parent)
    }

    fn shared_with(&self, other: &RelationTable) -> usize {
        self.children.shared_with(&other.children) + self.parents.shared_with(&other.parents)
    }

    fn bucket_count(&self) -> usize {
        self.children.bucket_count() + self.parents.bucket_count()
    }
}

/// Bidirectional parent/child index keyed by relation kind.
#[derive(Debug, Clone, Default)]
pub struct RelationIndex {
    tables: Vec<Arc<RelationTable>>,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `child` to `parent`.
    ///
    /// Both endpoints must be live in `records` and of the relation's types.
    /// A child always has at most one parent per relation; attaching it
    /// elsewhere moves it. On a one-to-one relation the parent's existing
    /// child is displaced in `Replace` mode and rejected in `Strict` mode.
    pub fn set_parent(
        &mut self,
        kind: &RelationKind,
        child: Handle,
        parent: Handle,
        mode: AttachMode,
        records: &RecordStore,
        registry: &SchemaRegistry,
    ) -> Result<EdgeUpdate> {
        check_endpoint(kind, child, kind.child_type, "child", records, registry)?;
        check_endpoint(kind, parent, kind.parent_type, "parent", records, registry)?;

        let current_parent = self.parent(kind, child);
        if current_parent == Some(parent) {
            return Ok(EdgeUpdate {
                previous_parent: current_parent,
                displaced_child: None,
            });
        }

        let occupant = if kind.is_one_to_one() {
            self.children(kind, parent).first().copied()
        } else {
            None
        };

        if mode == AttachMode::Strict && kind.is_one_to_one() {
            if let Some(existing) = current_parent {
                return Err(Error::CardinalityViolation {
                    relation: registry.relation_name(kind),
                    handle: child,
                    existing,
                });
            }
            if let Some(existing) = occupant {
                return Err(Error::CardinalityViolation {
                    relation: registry.relation_name(kind),
                    handle: parent,
                    existing,
                });
            }
        }

        let table = self.table_mut(kind);
        let previous_parent = table.detach_child(child);
        let displaced_child = occupant.and_then(|c| table.detach_child(c).map(|_| c));
        table.parents.insert(child, parent);
        table.children.get_or_default(parent).push(child);

        tracing::trace!(
            relation = %kind.id,
            %child,
            %parent,
            displaced = ?displaced_child,
            "relation edge set"
        );

        Ok(EdgeUpdate {
            previous_parent,
            displaced_child,
        })
    }

    /// Children of `parent`, in attach order.
    pub fn children(&self, kind: &RelationKind, parent: Handle) -> &[Handle] {
        self.tables
            .get(kind.id.index())
            .and_then(|table| table.children.get(&parent))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn parent(&self, kind: &RelationKind, child: Handle) -> Option<Handle> {
        self.tables
            .get(kind.id.index())
            .and_then(|table| table.parents.get(&child))
            .copied()
    }

    /// Detach `child` from its parent, returning the former parent.
    pub fn remove_child(&mut self, kind: &RelationKind, child: Handle) -> Option<Handle> {
        self.parent(kind, child)?;
        self.table_mut(kind).detach_child(child)
    }

    /// Detach every child of `parent`, returning them in attach order.
    pub fn remove_children(&mut self, kind: &RelationKind, parent: Handle) -> Vec<Handle> {
        if self.children(kind, parent).is_empty() {
            return Vec::new();
        }
        let table = self.table_mut(kind);
        let children = table.children.remove(&parent).unwrap_or_default();
        for child in &children {
            table.parents.remove(child);
        }
        children
    }

    /// Number of edges in a relation.
    pub fn edge_count(&self, kind: &RelationKind) -> usize {
        self.tables
            .get(kind.id.index())
            .map(|table| table.parents.len())
            .unwrap_or(0)
    }

    /// Edge buckets still shared with `other`, and the number allocated
    /// here, over every relation.
    pub fn shared_buckets(&self, other: &RelationIndex) -> (usize, usize) {
        let shared = self
            .tables
            .iter()
            .zip(&other.tables)
            .map(|(a, b)| a.shared_with(b))
            .sum();
        let total = self.tables.iter().map(|table| table.bucket_count()).sum();
        (shared, total)
    }

    /// Whether both indexes still share the table of `kind`.
    pub fn shares_table(&self, other: &RelationIndex, kind: &RelationKind) -> bool {
        match (
            self.tables.get(kind.id.index()),
            other.tables.get(kind.id.index()),
        ) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn table_mut(&mut self, kind: &RelationKind) -> &mut RelationTable {
        let index = kind.id.index();
        if self.tables.len() <= index {
            self.tables.resize_with(index + 1, Default::default);
        }
        Arc::make_mut(&mut self.tables[index])
    }
}

fn check_endpoint(
    kind: &RelationKind,
    handle: Handle,
    expected: crate::TypeId,
    role: &str,
    records: &RecordStore,
    registry: &SchemaRegistry,
) -> Result<()> {
    if handle.type_id != expected {
        return Err(Error::EndpointMismatch {
            relation: registry.relation_name(kind),
            expected: format!("{} {}", registry.type_name(expected), role),
            handle,
        });
    }
    records.get(handle).map(|_| ())
}
