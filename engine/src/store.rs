//! Record store: per-type tables of immutable records addressed by handle.
//!
//! Each table is split into fixed-size chunks held behind `Arc`. Cloning a
//! store is cheap and a write copies only the table index and the one chunk
//! it lands in, so two snapshots that differ by a few records share almost
//! all of their storage.
//!
//! Removal leaves a tombstone; slots are never reused.

use crate::{error::Result, EntityRecord, Error, Fields, Handle, Origin, TypeId};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const CHUNK_SIZE: usize = 64;

type Slot = Option<Arc<EntityRecord>>;

#[derive(Debug, Clone, Default)]
struct RecordTable {
    chunks: Vec<Arc<Vec<Slot>>>,
    /// One past the highest slot ever written
    next: u32,
    live: usize,
}

impl RecordTable {
    fn slot(&self, local_id: u32) -> Option<&Slot> {
        let index = local_id as usize;
        self.chunks
            .get(index / CHUNK_SIZE)
            .and_then(|chunk| chunk.get(index % CHUNK_SIZE))
    }

    fn slot_mut(&mut self, local_id: u32) -> Option<&mut Slot> {
        let index = local_id as usize;
        let chunk = self.chunks.get_mut(index / CHUNK_SIZE)?;
        Arc::make_mut(chunk).get_mut(index % CHUNK_SIZE)
    }

    /// Write into an empty slot. Returns false if the slot is taken.
    fn insert_at(&mut self, local_id: u32, record: Arc<EntityRecord>) -> bool {
        let needed = local_id as usize / CHUNK_SIZE + 1;
        while self.chunks.len() < needed {
            self.chunks.push(Arc::new(vec![None; CHUNK_SIZE]));
        }
        match self.slot_mut(local_id) {
            Some(slot @ None) => *slot = Some(record),
            _ => return false,
        }
        self.next = self.next.max(local_id + 1);
        self.live += 1;
        true
    }

    fn iter(&self) -> impl Iterator<Item = (u32, &Arc<EntityRecord>)> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter())
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (i as u32, r)))
    }
}

/// Hands out handles for a whole snapshot lineage.
///
/// Every builder of the lineage draws from the same counters, so records
/// created on different branches never share a handle and a diff can be
/// replayed onto any snapshot of the lineage as is.
#[derive(Debug)]
pub struct HandleAllocator {
    next: Vec<AtomicU32>,
}

impl HandleAllocator {
    pub fn new(type_count: usize) -> Self {
        Self {
            next: (0..type_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn allocate(&self, type_id: TypeId) -> Result<Handle> {
        let counter = self
            .next
            .get(type_id.index())
            .ok_or(Error::UnknownType(type_id))?;
        Ok(Handle::new(type_id, counter.fetch_add(1, Ordering::Relaxed)))
    }
}

/// Append-only, tombstoning store of entity records.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    tables: Vec<Arc<RecordTable>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new record and return its handle.
    pub fn put(&mut self, type_id: TypeId, fields: Fields, origin: Origin) -> Handle {
        self.insert(EntityRecord::new(type_id, fields, origin))
    }

    /// Store an already built record in the next free slot of its type.
    pub fn insert(&mut self, record: EntityRecord) -> Handle {
        let type_id = record.type_id();
        let table = self.table_mut(type_id);
        let local_id = table.next;
        table.insert_at(local_id, Arc::new(record));
        Handle::new(type_id, local_id)
    }

    /// Store a record under a handle obtained from a [`HandleAllocator`].
    pub fn insert_at(&mut self, handle: Handle, record: EntityRecord) -> Result<()> {
        if record.type_id() != handle.type_id {
            return Err(Error::UnknownType(record.type_id()));
        }
        if !self
            .table_mut(handle.type_id)
            .insert_at(handle.local_id, Arc::new(record))
        {
            return Err(Error::Conflict {
                handle,
                detail: "slot is already occupied".into(),
            });
        }
        Ok(())
    }

    /// Get a live record.
    pub fn get(&self, handle: Handle) -> Result<&Arc<EntityRecord>> {
        self.tables
            .get(handle.type_id.index())
            .and_then(|table| table.slot(handle.local_id))
            .and_then(Option::as_ref)
            .ok_or(Error::NotFound(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Swap the record stored at `handle`, returning the previous one.
    pub fn replace(&mut self, handle: Handle, record: EntityRecord) -> Result<Arc<EntityRecord>> {
        if !self.contains(handle) {
            return Err(Error::NotFound(handle));
        }
        let slot = self
            .table_mut(handle.type_id)
            .slot_mut(handle.local_id)
            .ok_or(Error::NotFound(handle))?;
        slot.replace(Arc::new(record)).ok_or(Error::NotFound(handle))
    }

    /// Tombstone the record at `handle`.
    pub fn remove(&mut self, handle: Handle) -> Result<Arc<EntityRecord>> {
        if !self.contains(handle) {
            return Err(Error::NotFound(handle));
        }
        let table = self.table_mut(handle.type_id);
        let removed = table
            .slot_mut(handle.local_id)
            .and_then(Option::take)
            .ok_or(Error::NotFound(handle))?;
        table.live -= 1;
        Ok(removed)
    }

    /// Live records of one type, in handle order.
    pub fn iter_type(&self, type_id: TypeId) -> impl Iterator<Item = (Handle, &Arc<EntityRecord>)> {
        self.tables
            .get(type_id.index())
            .into_iter()
            .flat_map(move |table| {
                table
                    .iter()
                    .map(move |(local_id, record)| (Handle::new(type_id, local_id), record))
            })
    }

    /// Live records of every type.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Arc<EntityRecord>)> {
        (0..self.tables.len()).flat_map(move |i| self.iter_type(TypeId(i as u32)))
    }

    /// Number of live records of one type.
    pub fn count(&self, type_id: TypeId) -> usize {
        self.tables
            .get(type_id.index())
            .map(|table| table.live)
            .unwrap_or(0)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|table| table.live).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both stores still share the table of `type_id`.
    pub fn shares_table(&self, other: &RecordStore, type_id: TypeId) -> bool {
        match (
            self.tables.get(type_id.index()),
            other.tables.get(type_id.index()),
        ) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn table_mut(&mut self, type_id: TypeId) -> &mut RecordTable {
        let index = type_id.index();
        if self.tables.len() <= index {
            self.tables.resize_with(index + 1, Default::default);
        }
        Arc::make_mut(&mut self.tables[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    const MODULE: TypeId = TypeId(0);
    const LIBRARY: TypeId = TypeId(1);

    #[test]
    fn put_and_get() {
        let mut store = RecordStore::new();
        let handle = store.put(MODULE, fields! { "name" => "core" }, Origin::new("test"));

        let record = store.get(handle).unwrap();
        assert_eq!(record.get_str("name"), Some("core"));
        assert_eq!(store.count(MODULE), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn removed_handle_fails_cleanly() {
        let mut store = RecordStore::new();
        let first = store.put(MODULE, fields! { "name" => "a" }, Origin::default());
        store.remove(first).unwrap();
        let second = store.put(MODULE, fields! { "name" => "b" }, Origin::default());

        assert_ne!(first, second);
        assert_eq!(store.get(first).unwrap_err(), Error::NotFound(first));
        assert_eq!(store.remove(first).unwrap_err(), Error::NotFound(first));
        assert_eq!(store.count(MODULE), 1);
    }

    #[test]
    fn replace_swaps_record() {
        let mut store = RecordStore::new();
        let handle = store.put(MODULE, fields! { "name" => "a" }, Origin::default());

        let previous = store
            .replace(
                handle,
                EntityRecord::new(MODULE, fields! { "name" => "b" }, Origin::default()),
            )
            .unwrap();

        assert_eq!(previous.get_str("name"), Some("a"));
        assert_eq!(store.get(handle).unwrap().get_str("name"), Some("b"));
    }

    #[test]
    fn unknown_type_is_not_found() {
        let store = RecordStore::new();
        let handle = Handle::new(TypeId(7), 0);
        assert_eq!(store.get(handle).unwrap_err(), Error::NotFound(handle));
        assert_eq!(store.iter_type(TypeId(7)).count(), 0);
    }

    #[test]
    fn clones_share_untouched_tables_and_chunks() {
        let mut store = RecordStore::new();
        let handles: Vec<_> = (0..(CHUNK_SIZE as i64 * 2))
            .map(|i| store.put(MODULE, fields! { "n" => i }, Origin::default()))
            .collect();
        store.put(LIBRARY, fields! { "name" => "junit" }, Origin::default());

        let mut copy = store.clone();
        copy.replace(
            handles[0],
            EntityRecord::new(MODULE, fields! { "n" => -1i64 }, Origin::default()),
        )
        .unwrap();

        assert!(copy.shares_table(&store, LIBRARY));
        assert!(!copy.shares_table(&store, MODULE));
        assert!(Arc::ptr_eq(&copy.tables[0].chunks[1], &store.tables[0].chunks[1]));
        assert_eq!(store.get(handles[0]).unwrap().get("n"), Some(&(0i64).into()));
    }

    #[test]
    fn insert_at_allocated_handles() {
        let allocator = HandleAllocator::new(2);
        let mut left = RecordStore::new();
        let mut right = left.clone();

        let a = allocator.allocate(MODULE).unwrap();
        let b = allocator.allocate(MODULE).unwrap();
        left.insert_at(a, EntityRecord::new(MODULE, fields! {}, Origin::default()))
            .unwrap();
        right
            .insert_at(b, EntityRecord::new(MODULE, fields! {}, Origin::default()))
            .unwrap();

        assert_ne!(a, b);
        assert!(left.contains(a) && !left.contains(b));
        assert!(right.contains(b) && !right.contains(a));
        assert!(matches!(
            left.insert_at(a, EntityRecord::new(MODULE, fields! {}, Origin::default())),
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            allocator.allocate(TypeId(9)),
            Err(Error::UnknownType(TypeId(9)))
        ));
    }

    #[test]
    fn put_after_sparse_insert_does_not_collide() {
        let mut store = RecordStore::new();
        store
            .insert_at(
                Handle::new(MODULE, 100),
                EntityRecord::new(MODULE, fields! {}, Origin::default()),
            )
            .unwrap();
        let next = store.put(MODULE, fields! {}, Origin::default());

        assert_eq!(next, Handle::new(MODULE, 101));
        assert_eq!(store.count(MODULE), 2);
    }

    #[test]
    fn iter_type_skips_tombstones() {
        let mut store = RecordStore::new();
        let a = store.put(MODULE, fields! { "name" => "a" }, Origin::default());
        let b = store.put(MODULE, fields! { "name" => "b" }, Origin::default());
        let c = store.put(MODULE, fields! { "name" => "c" }, Origin::default());
        store.remove(b).unwrap();

        let handles: Vec<_> = store.iter_type(MODULE).map(|(h, _)| h).collect();
        assert_eq!(handles, vec![a, c]);
        assert_eq!(store.iter().count(), 2);
    }
}
