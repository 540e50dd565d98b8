//! Replace by origin.
//!
//! [`Builder::replace_by_source`](crate::Builder::replace_by_source) makes
//! the records of some origins look exactly as they do in another snapshot,
//! the way a project model is refreshed after its build files are loaded
//! again. Records of other origins are left alone.
//!
//! The two stores share no handles, so records are first paired up as
//! trees:
//!
//! 1. a record with a symbolic id pairs with the record of the same type
//!    owning that id
//! 2. a record without parents pairs with a parentless record of the same
//!    type and equal fields
//! 3. any other record pairs with a child of equal fields under its paired
//!    parent, in the same relation
//!
//! Then each pair is settled by which side the filter selects:
//!
//! | here | source | outcome                                         |
//! |------|--------|-------------------------------------------------|
//! | yes  | yes    | take the source's fields, origin and parents    |
//! | yes  | no     | remove                                          |
//! | no   | yes    | take the source's record if it has a symbolic id, otherwise add it as a new record |
//! | no   | no     | leave                                           |
//!
//! Selected records without a partner are removed here, and selected
//! source records without a partner are added together with their selected
//! subtrees. A source record whose parents could not be placed is dropped.

use crate::{
    change::{Change, FieldPatch},
    error::Result,
    state::StoreState,
    EntityRecord, Handle, HandleAllocator, Origin, RelationKind, SchemaRegistry, SymbolicId,
    TypeId,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a replace did, as handles of the builder it ran on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    /// Records copied in from the source
    pub added: Vec<Handle>,
    /// Records kept under their handle whose fields, origin or parents changed
    pub replaced: Vec<Handle>,
    /// Records removed, cascade included
    pub removed: Vec<Handle>,
}

impl ReplaceReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    /// Takes the data of this source record
    Relabel(Handle),
    /// Stays as it is, paired or not
    Keep(Option<Handle>),
    Remove,
}

impl TargetState {
    fn partner(self) -> Option<Handle> {
        match self {
            TargetState::Relabel(source) => Some(source),
            TargetState::Keep(source) => source,
            TargetState::Remove => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Added,
    Relabel(Handle),
    Keep(Handle),
    /// Not carried over
    Dropped,
}

/// Where a source record ends up in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Landing {
    Existing(Handle),
    /// Added; the handle is the source's
    Added(Handle),
}

fn parents_of<'r>(
    registry: &'r SchemaRegistry,
    state: &StoreState,
    child: Handle,
) -> Vec<(&'r RelationKind, Handle)> {
    registry
        .relations_as_child(child.type_id)
        .filter_map(|kind| state.relations.parent(kind, child).map(|parent| (kind, parent)))
        .collect()
}

fn owner_of(state: &StoreState, key: &SymbolicId, type_id: TypeId) -> Option<Handle> {
    state.symbols.owners(key).find(|owner| owner.type_id == type_id)
}

/// Pairs records of the target with records of the source and decides
/// what happens to each.
pub(crate) struct Matcher<'a, F> {
    registry: &'a SchemaRegistry,
    target: &'a StoreState,
    source: &'a StoreState,
    filter: F,
    target_states: FxHashMap<Handle, TargetState>,
    source_states: FxHashMap<Handle, SourceState>,
    /// Records whose pairing is being worked out; breaks relation cycles
    visiting: FxHashSet<Handle>,
    adds: Vec<Handle>,
    relabels: Vec<(Handle, Handle)>,
    removes: Vec<Handle>,
}

impl<'a, F: Fn(&Origin) -> bool> Matcher<'a, F> {
    pub fn new(
        registry: &'a SchemaRegistry,
        target: &'a StoreState,
        source: &'a StoreState,
        filter: F,
    ) -> Self {
        Self {
            registry,
            target,
            source,
            filter,
            target_states: FxHashMap::default(),
            source_states: FxHashMap::default(),
            visiting: FxHashSet::default(),
            adds: Vec::new(),
            relabels: Vec::new(),
            removes: Vec::new(),
        }
    }

    pub fn run(mut self) -> Result<ReplacePlan> {
        let selected_here: Vec<Handle> = self
            .target
            .records
            .iter()
            .filter(|(_, record)| (self.filter)(record.origin()))
            .map(|(handle, _)| handle)
            .collect();
        for handle in selected_here {
            self.pair_target(handle)?;
        }

        let selected_there: Vec<Handle> = self
            .source
            .records
            .iter()
            .filter(|(_, record)| (self.filter)(record.origin()))
            .map(|(handle, _)| handle)
            .collect();
        for handle in selected_there {
            self.pair_source(handle)?;
        }

        Ok(ReplacePlan {
            adds: self.adds,
            relabels: self.relabels,
            removes: self.removes,
            source_states: self.source_states,
        })
    }

    // -- target side ---------------------------------------------------

    /// Settle a target record and return its source partner, if any.
    fn pair_target(&mut self, handle: Handle) -> Result<Option<Handle>> {
        if let Some(state) = self.target_states.get(&handle) {
            return Ok(state.partner());
        }
        if !self.visiting.insert(handle) {
            return Ok(None);
        }
        let record = Arc::clone(self.target.records.get(handle)?);
        let partner = self.find_in_source(handle, &record);
        self.visiting.remove(&handle);
        self.settle_target(handle, &record, partner?)
    }

    fn find_in_source(&mut self, handle: Handle, record: &EntityRecord) -> Result<Option<Handle>> {
        let (registry, source) = (self.registry, self.source);
        if let Some(key) = registry.entity_type(handle.type_id)?.owned_id(record) {
            return Ok(owner_of(source, &key, handle.type_id)
                .filter(|partner| !self.source_states.contains_key(partner)));
        }

        let parents = parents_of(registry, self.target, handle);
        if parents.is_empty() {
            return Ok(source
                .records
                .iter_type(handle.type_id)
                .find(|(candidate, other)| {
                    !self.source_states.contains_key(candidate)
                        && other.fields() == record.fields()
                        && parents_of(registry, source, *candidate).is_empty()
                })
                .map(|(candidate, _)| candidate));
        }

        // A child present under several paired parents wins.
        let mut votes: BTreeMap<Handle, usize> = BTreeMap::new();
        for (kind, parent) in parents {
            let Some(source_parent) = self.pair_target(parent)? else {
                continue;
            };
            for &candidate in source.relations.children(kind, source_parent) {
                if self.source_states.contains_key(&candidate) {
                    continue;
                }
                if source.records.get(candidate)?.fields() == record.fields() {
                    *votes.entry(candidate).or_default() += 1;
                }
            }
        }
        Ok(votes
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(candidate, _)| candidate))
    }

    fn settle_target(
        &mut self,
        handle: Handle,
        record: &EntityRecord,
        partner: Option<Handle>,
    ) -> Result<Option<Handle>> {
        let here = (self.filter)(record.origin());
        let Some(partner) = partner else {
            if here {
                self.remove(handle, None);
            } else {
                self.keep(handle, None);
            }
            return Ok(None);
        };
        let there = (self.filter)(self.source.records.get(partner)?.origin());
        Ok(match (here, there) {
            (true, false) => {
                self.remove(handle, Some(partner));
                None
            }
            (false, false) => {
                self.keep(handle, Some(partner));
                Some(partner)
            }
            _ => {
                self.relabel(handle, partner);
                Some(partner)
            }
        })
    }

    // -- source side ---------------------------------------------------

    /// Settle a source record and return where it lands in the target.
    fn pair_source(&mut self, handle: Handle) -> Result<Option<Landing>> {
        match self.source_states.get(&handle) {
            Some(SourceState::Added) => return Ok(Some(Landing::Added(handle))),
            Some(SourceState::Relabel(target) | SourceState::Keep(target)) => {
                return Ok(Some(Landing::Existing(*target)))
            }
            Some(SourceState::Dropped) => return Ok(None),
            None => {}
        }
        if !self.visiting.insert(handle) {
            return Ok(None);
        }
        let record = Arc::clone(self.source.records.get(handle)?);
        let partner = self.find_in_target(handle, &record);
        self.visiting.remove(&handle);
        let Some(partner) = partner? else {
            if (self.filter)(record.origin()) && self.placeable(handle)? {
                self.add_subtree(handle)?;
                return Ok(Some(Landing::Added(handle)));
            }
            self.source_states.insert(handle, SourceState::Dropped);
            return Ok(None);
        };
        self.settle_source(handle, &record, partner)
    }

    fn find_in_target(&mut self, handle: Handle, record: &EntityRecord) -> Result<Option<Handle>> {
        let (registry, target) = (self.registry, self.target);
        let parents = parents_of(registry, self.source, handle);
        let mut landings = Vec::with_capacity(parents.len());
        for (kind, parent) in parents {
            landings.push((kind, self.pair_source(parent)?));
        }

        if let Some(key) = registry.entity_type(handle.type_id)?.owned_id(record) {
            return Ok(owner_of(target, &key, handle.type_id));
        }
        if landings.is_empty() {
            return Ok(target
                .records
                .iter_type(handle.type_id)
                .find(|(candidate, other)| {
                    !self.target_states.contains_key(candidate)
                        && other.fields() == record.fields()
                        && parents_of(registry, target, *candidate).is_empty()
                })
                .map(|(candidate, _)| candidate));
        }
        for (kind, landing) in landings {
            let Some(Landing::Existing(parent)) = landing else {
                continue;
            };
            for &candidate in target.relations.children(kind, parent) {
                if !self.target_states.contains_key(&candidate)
                    && target.records.get(candidate)?.fields() == record.fields()
                {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    /// Whether a record with parents has at least one that lands in the target.
    fn placeable(&mut self, handle: Handle) -> Result<bool> {
        let parents = parents_of(self.registry, self.source, handle);
        if parents.is_empty() {
            return Ok(true);
        }
        for (_, parent) in parents {
            if self.pair_source(parent)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn settle_source(
        &mut self,
        handle: Handle,
        record: &EntityRecord,
        partner: Handle,
    ) -> Result<Option<Landing>> {
        match self.target_states.get(&partner) {
            Some(TargetState::Remove) => return Ok(None),
            Some(_) => return Ok(Some(Landing::Existing(partner))),
            None => {}
        }
        let here = (self.filter)(self.target.records.get(partner)?.origin());
        let there = (self.filter)(record.origin());
        let keyed = self.registry.entity_type(partner.type_id)?.symbolic_key.is_some();
        Ok(match (here, there) {
            (true, false) => {
                self.remove(partner, Some(handle));
                None
            }
            (false, true) if !keyed => {
                self.add_subtree(handle)?;
                Some(Landing::Added(handle))
            }
            (false, false) => {
                self.keep(partner, Some(handle));
                Some(Landing::Existing(partner))
            }
            _ => {
                self.relabel(partner, handle);
                Some(Landing::Existing(partner))
            }
        })
    }

    /// Mark `handle` and its selected descendants for adding. Descendants
    /// that already exist here by symbolic id are settled on their own.
    fn add_subtree(&mut self, handle: Handle) -> Result<()> {
        if self.source_states.get(&handle) == Some(&SourceState::Added) {
            return Ok(());
        }
        self.source_states.insert(handle, SourceState::Added);
        self.adds.push(handle);

        let (registry, source, target) = (self.registry, self.source, self.target);
        for kind in registry.relations_as_parent(handle.type_id) {
            for &child in source.relations.children(kind, handle) {
                let record = source.records.get(child)?;
                if !(self.filter)(record.origin()) || self.source_states.contains_key(&child) {
                    continue;
                }
                let exists = registry
                    .entity_type(child.type_id)?
                    .owned_id(record)
                    .and_then(|key| owner_of(target, &key, child.type_id))
                    .is_some();
                if !exists {
                    self.add_subtree(child)?;
                }
            }
        }
        Ok(())
    }

    // -- decisions -----------------------------------------------------

    fn relabel(&mut self, target: Handle, source: Handle) {
        self.target_states.insert(target, TargetState::Relabel(source));
        self.source_states.insert(source, SourceState::Relabel(target));
        self.relabels.push((target, source));
    }

    fn keep(&mut self, target: Handle, source: Option<Handle>) {
        self.target_states.insert(target, TargetState::Keep(source));
        if let Some(source) = source {
            self.source_states.insert(source, SourceState::Keep(target));
        }
    }

    fn remove(&mut self, target: Handle, source: Option<Handle>) {
        self.target_states.insert(target, TargetState::Remove);
        self.removes.push(target);
        if let Some(source) = source {
            self.source_states.insert(source, SourceState::Dropped);
        }
    }
}

/// Decisions of a [`Matcher`], not yet turned into changes.
#[derive(Debug)]
pub(crate) struct ReplacePlan {
    /// Source records to copy in, parents first
    adds: Vec<Handle>,
    /// (target, source) pairs
    relabels: Vec<(Handle, Handle)>,
    removes: Vec<Handle>,
    source_states: FxHashMap<Handle, SourceState>,
}

impl ReplacePlan {
    /// The changes carrying out the plan against `target`: creates, then
    /// relabels, then removals. Added records get fresh handles from
    /// `allocator`.
    pub fn into_changes(
        self,
        registry: &SchemaRegistry,
        target: &StoreState,
        source: &StoreState,
        allocator: &HandleAllocator,
    ) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        let mut added: FxHashMap<Handle, Handle> = FxHashMap::default();
        for &handle in &self.adds {
            let fresh = allocator.allocate(handle.type_id)?;
            added.insert(handle, fresh);
            changes.push(Change::Create {
                handle: fresh,
                record: Arc::clone(source.records.get(handle)?),
            });
        }

        let landing = |parent: Handle| match self.source_states.get(&parent) {
            Some(SourceState::Relabel(landed) | SourceState::Keep(landed)) => Some(*landed),
            Some(SourceState::Added) => added.get(&parent).copied(),
            _ => None,
        };

        for &handle in &self.adds {
            let Some(&child) = added.get(&handle) else {
                continue;
            };
            for kind in registry.relations_as_child(handle.type_id) {
                if let Some(parent) = source.relations.parent(kind, handle).and_then(&landing) {
                    changes.push(Change::SetRelation {
                        relation: kind.id,
                        child,
                        parent,
                        strict: false,
                    });
                }
            }
        }

        for &(handle, partner) in &self.relabels {
            let patch = FieldPatch::between(target.records.get(handle)?, source.records.get(partner)?);
            if !patch.is_empty() {
                changes.push(Change::Modify { handle, patch });
            }
            for kind in registry.relations_as_child(handle.type_id) {
                let current = target.relations.parent(kind, handle);
                match source.relations.parent(kind, partner) {
                    Some(parent) => match landing(parent) {
                        Some(parent) if current != Some(parent) => changes.push(Change::SetRelation {
                            relation: kind.id,
                            child: handle,
                            parent,
                            strict: false,
                        }),
                        // Unplaced parents leave the current edge alone.
                        _ => {}
                    },
                    None if current.is_some() => changes.push(Change::RemoveRelation {
                        relation: kind.id,
                        child: handle,
                    }),
                    None => {}
                }
            }
        }

        changes.extend(self.removes.iter().map(|&handle| Change::Remove { handle }));
        Ok(changes)
    }
}
