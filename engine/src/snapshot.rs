//! Immutable, shareable views of the store.
//!
//! A [`Snapshot`] is an `Arc` around a frozen [`StoreState`]. Cloning it is a
//! reference count bump, nothing on it takes `&mut self`, and successive
//! snapshots share every table a seal did not touch.

use crate::{
    config::EngineConfig, error::Result, state::StoreState, Builder, EntityRecord, Handle,
    HandleAllocator, Origin, RelationKind, SchemaRegistry, SymbolicId, TypeId, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LINEAGE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct SnapshotInner {
    registry: Arc<SchemaRegistry>,
    config: EngineConfig,
    state: StoreState,
    version: Version,
    lineage: u64,
    allocator: Arc<HandleAllocator>,
}

/// A point-in-time view of the whole store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    /// An empty root snapshot, starting a new lineage.
    pub fn empty(registry: Arc<SchemaRegistry>, config: EngineConfig) -> Self {
        let lineage = NEXT_LINEAGE.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(lineage, types = registry.type_count(), "new snapshot lineage");
        Self {
            inner: Arc::new(SnapshotInner {
                allocator: Arc::new(HandleAllocator::new(registry.type_count())),
                registry,
                config,
                state: StoreState::default(),
                version: 0,
                lineage,
            }),
        }
    }

    /// The snapshot sealed from `self` with the given state.
    pub(crate) fn successor(&self, state: StoreState) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                registry: Arc::clone(&self.inner.registry),
                config: self.inner.config.clone(),
                state,
                version: self.inner.version + 1,
                lineage: self.inner.lineage,
                allocator: Arc::clone(&self.inner.allocator),
            }),
        }
    }

    /// Open a builder against this snapshot.
    pub fn builder(&self) -> Builder {
        Builder::new(self)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of seals since the root snapshot.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn lineage(&self) -> u64 {
        self.inner.lineage
    }

    pub(crate) fn state(&self) -> &StoreState {
        &self.inner.state
    }

    pub(crate) fn allocator(&self) -> &HandleAllocator {
        &self.inner.allocator
    }

    pub(crate) fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn get(&self, handle: Handle) -> Result<&EntityRecord> {
        self.state().records.get(handle).map(Arc::as_ref)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.state().records.contains(handle)
    }

    /// Live records of one type, lazily, in handle order.
    pub fn records(&self, type_id: TypeId) -> impl Iterator<Item = (Handle, &EntityRecord)> {
        self.state()
            .records
            .iter_type(type_id)
            .map(|(handle, record)| (handle, record.as_ref()))
    }

    /// Live records whose origin satisfies `filter`.
    pub fn records_by_origin<'a>(
        &'a self,
        filter: impl Fn(&Origin) -> bool + 'a,
    ) -> impl Iterator<Item = (Handle, &'a EntityRecord)> + 'a {
        self.state()
            .records
            .iter()
            .filter(move |(_, record)| filter(record.origin()))
            .map(|(handle, record)| (handle, record.as_ref()))
    }

    pub fn count(&self, type_id: TypeId) -> usize {
        self.state().records.count(type_id)
    }

    pub fn children(&self, kind: &RelationKind, parent: Handle) -> &[Handle] {
        self.state().relations.children(kind, parent)
    }

    pub fn parent(&self, kind: &RelationKind, child: Handle) -> Option<Handle> {
        self.state().relations.parent(kind, child)
    }

    /// Records holding a soft reference to `key`, in handle order.
    pub fn referrers(&self, key: &SymbolicId) -> impl Iterator<Item = Handle> + '_ {
        self.state().symbols.referrers(key)
    }

    /// The record owning `key`.
    pub fn resolve(&self, key: &SymbolicId) -> Option<Handle> {
        self.state().symbols.resolve(key)
    }

    /// Whether two snapshots still share the record table of `type_id`.
    pub fn shares_records_with(&self, other: &Snapshot, type_id: TypeId) -> bool {
        self.state()
            .records
            .shares_table(&other.state().records, type_id)
    }

    /// Whether two snapshots still share the edge table of `kind`.
    pub fn shares_relation_with(&self, other: &Snapshot, kind: &RelationKind) -> bool {
        self.state()
            .relations
            .shares_table(&other.state().relations, kind)
    }

    /// Relation and symbolic index buckets this snapshot still shares with
    /// `other`, and the number it holds in total.
    pub fn shared_index_buckets(&self, other: &Snapshot) -> (usize, usize) {
        let (ours, theirs) = (self.state(), other.state());
        let (relation_shared, relation_total) = ours.relations.shared_buckets(&theirs.relations);
        let (symbol_shared, symbol_total) = ours.symbols.shared_buckets(&theirs.symbols);
        (relation_shared + symbol_shared, relation_total + symbol_total)
    }

    pub(crate) fn same_lineage(&self, other: &Snapshot) -> bool {
        self.inner.lineage == other.inner.lineage
            && Arc::ptr_eq(&self.inner.registry, &other.inner.registry)
    }

    /// Summary of the snapshot without the data.
    pub fn metadata(&self) -> SnapshotMetadata {
        let registry = self.registry();
        let type_counts = registry
            .types()
            .map(|(id, ty)| (ty.name.clone(), self.count(id)))
            .filter(|(_, count)| *count > 0)
            .collect();
        SnapshotMetadata {
            version: self.version(),
            lineage: self.lineage(),
            record_count: self.state().records.len(),
            type_counts,
        }
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Seal count since the root snapshot
    pub version: Version,
    /// Lineage the snapshot belongs to
    pub lineage: u64,
    /// Total live records
    pub record_count: usize,
    /// Live records per type name, omitting empty types
    pub type_counts: BTreeMap<String, usize>,
}
