//! The combined record, relation and symbolic structures, and the single
//! write path every change goes through.
//!
//! A `StoreState` is cheap to clone: all three parts share their tables
//! through `Arc` and copy them on first write. Snapshots hold one frozen
//! state; builders hold a private working clone of their base's state.

use crate::{
    change::{Change, FieldPatch},
    config::{EngineConfig, RemovalPolicy},
    error::Result,
    relation::AttachMode,
    EntityRecord, Error, Handle, RecordStore, RelationIndex, SchemaRegistry, SymbolicId,
    SymbolicIndex,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Handles affected by one applied change, for seal-time validation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Touched {
    /// Records created in this change
    pub created: Vec<Handle>,
    /// Records whose fields changed
    pub modified: Vec<Handle>,
    /// Records whose parent edges changed
    pub linked: Vec<Handle>,
    /// Records removed, cascade included
    pub removed: Vec<Handle>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    pub records: RecordStore,
    pub relations: RelationIndex,
    pub symbols: SymbolicIndex,
}

impl StoreState {
    /// Apply one change and report the handles it touched.
    ///
    /// Every check runs before the first write, so a failing change leaves
    /// the state as it was.
    pub fn apply(
        &mut self,
        change: &Change,
        registry: &SchemaRegistry,
        config: &EngineConfig,
    ) -> Result<Touched> {
        let mut touched = Touched::default();
        match change {
            Change::Create { handle, record } => {
                self.create(registry, *handle, record.as_ref().clone())?;
                touched.created.push(*handle);
            }
            Change::Modify { handle, patch } => {
                if self.modify(registry, *handle, patch)? {
                    touched.modified.push(*handle);
                }
            }
            Change::Remove { handle } => {
                touched.removed = self.remove(registry, config, *handle)?;
            }
            Change::SetRelation {
                relation,
                child,
                parent,
                strict,
            } => {
                let kind = registry.relation(*relation)?;
                let mode = if *strict {
                    AttachMode::Strict
                } else {
                    AttachMode::Replace
                };
                let update = self.relations.set_parent(
                    &kind,
                    *child,
                    *parent,
                    mode,
                    &self.records,
                    registry,
                )?;
                touched.linked.push(*child);
                touched.linked.extend(update.displaced_child);
            }
            Change::RemoveRelation { relation, child } => {
                let kind = registry.relation(*relation)?;
                self.records.get(*child)?;
                if self.relations.remove_child(&kind, *child).is_some() {
                    touched.linked.push(*child);
                }
            }
            Change::Rename { from, to } => {
                touched.modified = self.rename(registry, from, to)?;
            }
        }
        Ok(touched)
    }

    fn create(&mut self, registry: &SchemaRegistry, handle: Handle, record: EntityRecord) -> Result<()> {
        let entity_type = registry.entity_type(record.type_id())?;
        let owned = entity_type.owned_id(&record);
        let refs = record.symbolic_refs();

        self.records.insert_at(handle, record)?;
        self.symbols.reindex(handle, &refs);
        if let Some(key) = owned {
            self.symbols.set_owner(key, handle);
        }
        tracing::trace!(%handle, "record created");
        Ok(())
    }

    /// Returns whether the record actually changed.
    fn modify(&mut self, registry: &SchemaRegistry, handle: Handle, patch: &FieldPatch) -> Result<bool> {
        let current = self.records.get(handle)?.clone();
        if patch.is_empty() {
            return Ok(false);
        }
        self.replace(registry, handle, &current, patch.apply_to(&current))?;
        Ok(true)
    }

    fn replace(
        &mut self,
        registry: &SchemaRegistry,
        handle: Handle,
        current: &EntityRecord,
        updated: EntityRecord,
    ) -> Result<()> {
        let entity_type = registry.entity_type(handle.type_id)?;
        let old_owned = entity_type.owned_id(current);
        let new_owned = entity_type.owned_id(&updated);
        let refs = updated.symbolic_refs();

        self.records.replace(handle, updated)?;
        self.symbols.reindex(handle, &refs);
        if old_owned != new_owned {
            if let Some(key) = old_owned {
                self.symbols.remove_owner(&key, handle);
            }
            if let Some(key) = new_owned {
                self.symbols.set_owner(key, handle);
            }
        }
        tracing::trace!(%handle, "record replaced");
        Ok(())
    }

    /// Remove `handle` and, per the removal policy, the children bound to
    /// it through mandatory relations. Children in optional relations are
    /// detached. Returns every removed handle, children before parents.
    fn remove(
        &mut self,
        registry: &SchemaRegistry,
        config: &EngineConfig,
        handle: Handle,
    ) -> Result<Vec<Handle>> {
        self.records.get(handle)?;

        let mut doomed = Vec::new();
        let mut seen = BTreeSet::new();
        seen.insert(handle);
        self.collect_dependents(registry, handle, &mut seen, &mut doomed);

        if config.removal_policy == RemovalPolicy::Reject && !doomed.is_empty() {
            return Err(Error::RemovalRejected {
                handle,
                dependents: doomed.len(),
            });
        }
        doomed.push(handle);

        for target in &doomed {
            self.remove_single(registry, *target)?;
        }
        if doomed.len() > 1 {
            tracing::debug!(root = %handle, removed = doomed.len(), "cascading removal");
        }
        Ok(doomed)
    }

    /// Depth-first, children before their parents.
    fn collect_dependents(
        &self,
        registry: &SchemaRegistry,
        parent: Handle,
        seen: &mut BTreeSet<Handle>,
        out: &mut Vec<Handle>,
    ) {
        for kind in registry.relations_as_parent(parent.type_id) {
            if kind.child_optional {
                continue;
            }
            for child in self.relations.children(kind, parent) {
                if seen.insert(*child) {
                    self.collect_dependents(registry, *child, seen, out);
                    out.push(*child);
                }
            }
        }
    }

    fn remove_single(&mut self, registry: &SchemaRegistry, handle: Handle) -> Result<()> {
        let entity_type = registry.entity_type(handle.type_id)?;
        for kind in registry.relations_as_parent(handle.type_id) {
            self.relations.remove_children(kind, handle);
        }
        for kind in registry.relations_as_child(handle.type_id) {
            self.relations.remove_child(kind, handle);
        }

        let record = self.records.remove(handle)?;
        self.symbols.remove_referrer(handle);
        if let Some(key) = entity_type.owned_id(&record) {
            self.symbols.remove_owner(&key, handle);
        }
        tracing::trace!(%handle, "record removed");
        Ok(())
    }

    /// Point every reference to `from` at `to`, and rename the record owning
    /// `from`. Returns the rewritten handles.
    fn rename(&mut self, registry: &SchemaRegistry, from: &SymbolicId, to: &SymbolicId) -> Result<Vec<Handle>> {
        if from == to {
            return Ok(Vec::new());
        }

        let mut owners = Vec::new();
        for owner in self.symbols.owners(from) {
            let key_field = registry
                .entity_type(owner.type_id)?
                .symbolic_key
                .clone()
                .ok_or(Error::UnknownType(owner.type_id))?;
            owners.push((owner, key_field));
        }
        let referrers: Vec<Handle> = self.symbols.referrers(from).collect();

        let mut rewritten = Vec::new();
        for referrer in referrers {
            let current = Arc::clone(self.records.get(referrer)?);
            self.replace(registry, referrer, &current, current.with_renamed_ref(from, to))?;
            rewritten.push(referrer);
        }
        for (owner, key_field) in owners {
            let current = Arc::clone(self.records.get(owner)?);
            let mut draft = current.to_draft();
            draft.set(key_field, to.as_str());
            self.replace(registry, owner, &current, draft.into_record())?;
            if !rewritten.contains(&owner) {
                rewritten.push(owner);
            }
        }

        tracing::debug!(%from, %to, rewritten = rewritten.len(), "symbolic id renamed");
        Ok(rewritten)
    }
}
