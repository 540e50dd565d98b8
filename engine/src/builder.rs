//! Mutable drafts of a snapshot.
//!
//! A [`Builder`] stages writes against a base [`Snapshot`] without touching
//! it. Writes land in a private working copy of the base state and in an
//! ordered change log; [`Builder::seal`] validates the working copy and
//! freezes it into the successor snapshot.
//!
//! # Lifecycle
//!
//! ```text
//! Open --seal()--> Sealing --ok--> Sealed
//!                     |
//!                     +--error--> Open
//! ```
//!
//! The log is what makes a builder portable: [`Builder::rebind`] replays it
//! onto a newer snapshot of the same lineage, [`Builder::detach`] hands it
//! to another thread, and [`Builder::apply_changes_from`] composes another
//! builder's log on top of this one.

use crate::{
    change::{Change, ChangeLog, FieldPatch},
    compose::{self, DetachedDiff, Lease},
    error::Result,
    replace::{Matcher, ReplaceReport},
    state::{StoreState, Touched},
    EntityChange, EntityRecord, Error, Fields, Handle, Origin, RecordDraft, RelationKind,
    Snapshot, SymbolicId, TypeId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Where a builder is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuilderState {
    /// Accepting writes
    Open,
    /// Validating; writes are refused
    Sealing,
    /// Frozen into a snapshot; writes are refused for good
    Sealed,
}

impl fmt::Display for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuilderState::Open => "open",
            BuilderState::Sealing => "sealing",
            BuilderState::Sealed => "sealed",
        };
        f.write_str(name)
    }
}

/// Staged, unvalidated changes on top of a base snapshot.
#[derive(Debug)]
pub struct Builder {
    base: Snapshot,
    working: StoreState,
    log: ChangeLog,
    state: BuilderState,
    lease: Lease,
    owner: u64,
}

impl Builder {
    /// Open a builder on `base`.
    pub fn new(base: &Snapshot) -> Self {
        let (lease, owner) = Lease::held();
        Self::from_parts(base.clone(), base.state().clone(), ChangeLog::default(), lease, owner)
    }

    pub(crate) fn from_parts(
        base: Snapshot,
        working: StoreState,
        log: ChangeLog,
        lease: Lease,
        owner: u64,
    ) -> Self {
        Self {
            base,
            working,
            log,
            state: BuilderState::Open,
            lease,
            owner,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// The snapshot this builder's changes apply to.
    pub fn base(&self) -> &Snapshot {
        &self.base
    }

    pub fn has_changes(&self) -> bool {
        !self.log.is_empty()
    }

    /// Staged changes, in the order they were made.
    pub fn changes(&self) -> &[Change] {
        &self.log.changes
    }

    // -- writes --------------------------------------------------------

    /// Create a record and return its handle. Fields are validated at seal.
    pub fn create_record(&mut self, type_id: TypeId, fields: Fields, origin: Origin) -> Result<Handle> {
        self.ensure_open()?;
        let handle = self.base.allocator().allocate(type_id)?;
        let record = Arc::new(EntityRecord::new(type_id, fields, origin));
        self.stage(Change::Create { handle, record })?;
        Ok(handle)
    }

    /// Replace every field of a record. The handle is kept.
    pub fn replace_record(&mut self, handle: Handle, fields: Fields, origin: Origin) -> Result<()> {
        self.ensure_open()?;
        let current = Arc::clone(self.working.records.get(handle)?);
        let updated = EntityRecord::new(handle.type_id, fields, origin);
        self.stage_patch(handle, FieldPatch::between(&current, &updated))
    }

    /// Edit a record in place through a [`RecordDraft`].
    ///
    /// ```
    /// # use entity_store::{fields, EngineConfig, EntityType, FieldDef, FieldType, Origin, SchemaRegistry, Snapshot};
    /// # use std::sync::Arc;
    /// # let mut registry = SchemaRegistry::new();
    /// # let library = registry.register(EntityType::new("library")
    /// #     .field(FieldDef::required("name", FieldType::String))
    /// #     .field(FieldDef::optional("roots", FieldType::List)))?;
    /// # let root = Snapshot::empty(Arc::new(registry), EngineConfig::default());
    /// let mut builder = root.builder();
    /// let junit = builder.create_record(library, fields! { "name" => "junit" }, Origin::default())?;
    /// builder.modify_record(junit, |draft| {
    ///     draft.list_mut("roots").push("junit.jar".into());
    /// })?;
    /// assert_eq!(builder.get(junit)?.get_list("roots").map(|r| r.len()), Some(1));
    /// # Ok::<(), entity_store::Error>(())
    /// ```
    pub fn modify_record(&mut self, handle: Handle, edit: impl FnOnce(&mut RecordDraft)) -> Result<()> {
        self.ensure_open()?;
        let current = Arc::clone(self.working.records.get(handle)?);
        let mut draft = current.to_draft();
        edit(&mut draft);
        self.stage_patch(handle, FieldPatch::between(&current, &draft.into_record()))
    }

    /// Remove a record. Per the removal policy, children bound to it through
    /// mandatory relations go with it. Returns every removed handle,
    /// children first.
    pub fn remove_record(&mut self, handle: Handle) -> Result<Vec<Handle>> {
        Ok(self.stage(Change::Remove { handle })?.removed)
    }

    /// Attach `child` under `parent`, detaching whatever edge stood in the
    /// way on a one-to-one relation.
    pub fn set_relation(&mut self, kind: &RelationKind, child: Handle, parent: Handle) -> Result<()> {
        self.attach(kind, child, parent, false)
    }

    /// Like [`set_relation`](Self::set_relation), but a second edge on a
    /// one-to-one relation is a `CardinalityViolation`.
    pub fn set_relation_strict(&mut self, kind: &RelationKind, child: Handle, parent: Handle) -> Result<()> {
        self.attach(kind, child, parent, true)
    }

    /// Detach `child` from its parent in `kind`, returning the old parent.
    pub fn remove_relation(&mut self, kind: &RelationKind, child: Handle) -> Result<Option<Handle>> {
        self.ensure_open()?;
        self.check_kind(kind)?;
        self.working.records.get(child)?;
        let Some(previous) = self.working.relations.parent(kind, child) else {
            return Ok(None);
        };
        self.stage(Change::RemoveRelation {
            relation: kind.id,
            child,
        })?;
        Ok(Some(previous))
    }

    /// Point every soft reference to `from` at `to`, and rename the record
    /// owning `from`. Returns the rewritten records.
    pub fn rename_symbolic(&mut self, from: &SymbolicId, to: &SymbolicId) -> Result<Vec<Handle>> {
        self.ensure_open()?;
        let symbols = &self.working.symbols;
        if from == to || (symbols.referrers(from).next().is_none() && symbols.resolve(from).is_none()) {
            return Ok(Vec::new());
        }
        Ok(self
            .stage(Change::Rename {
                from: from.clone(),
                to: to.clone(),
            })?
            .modified)
    }

    /// Make every record whose origin passes `filter` look as it does in
    /// `source`, leaving records of other origins alone.
    ///
    /// Records are paired with their counterparts in `source` by symbolic
    /// id, or by equal fields under paired parents. Paired records keep
    /// their handle and take the source's fields, origin and parents.
    /// Unpaired selected records are removed, and unpaired selected source
    /// records are added with their subtrees. See [`crate::replace`].
    ///
    /// `source` must share this builder's schema. On error nothing is
    /// staged.
    pub fn replace_by_source<F>(&mut self, source: &Snapshot, filter: F) -> Result<ReplaceReport>
    where
        F: Fn(&Origin) -> bool,
    {
        self.ensure_open()?;
        if !Arc::ptr_eq(self.base.registry(), source.registry()) {
            return Err(Error::LineageMismatch);
        }
        let registry = self.base.registry();
        let changes = Matcher::new(registry, &self.working, source.state(), filter)
            .run()?
            .into_changes(registry, &self.working, source.state(), self.base.allocator())?;

        let mut working = self.working.clone();
        let mut log = self.log.clone();
        let mut added = BTreeSet::new();
        let mut rewritten = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for change in changes {
            if let Change::Remove { handle } = change {
                if !working.records.contains(handle) {
                    continue;
                }
            }
            let touched = working.apply(&change, registry, self.base.config())?;
            tracing::trace!(kind = change.kind(), "change staged");
            added.extend(touched.created.iter().copied());
            rewritten.extend(touched.modified.iter().chain(&touched.linked).copied());
            removed.extend(touched.removed.iter().copied());
            log.record(change, touched);
        }
        self.working = working;
        self.log = log;

        let report = ReplaceReport {
            replaced: rewritten
                .into_iter()
                .filter(|handle| !added.contains(handle) && !removed.contains(handle))
                .collect(),
            added: added.into_iter().collect(),
            removed: removed.into_iter().collect(),
        };
        tracing::debug!(
            added = report.added.len(),
            replaced = report.replaced.len(),
            removed = report.removed.len(),
            "replaced by source"
        );
        Ok(report)
    }

    // -- reads ---------------------------------------------------------

    pub fn get(&self, handle: Handle) -> Result<&EntityRecord> {
        self.working.records.get(handle).map(Arc::as_ref)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.working.records.contains(handle)
    }

    /// Live records of one type, staged changes included.
    pub fn records(&self, type_id: TypeId) -> impl Iterator<Item = (Handle, &EntityRecord)> {
        self.working
            .records
            .iter_type(type_id)
            .map(|(handle, record)| (handle, record.as_ref()))
    }

    /// Live records whose origin satisfies `filter`.
    pub fn records_by_origin<'a>(
        &'a self,
        filter: impl Fn(&Origin) -> bool + 'a,
    ) -> impl Iterator<Item = (Handle, &'a EntityRecord)> + 'a {
        self.working
            .records
            .iter()
            .filter(move |(_, record)| filter(record.origin()))
            .map(|(handle, record)| (handle, record.as_ref()))
    }

    pub fn count(&self, type_id: TypeId) -> usize {
        self.working.records.count(type_id)
    }

    pub fn children(&self, kind: &RelationKind, parent: Handle) -> &[Handle] {
        self.working.relations.children(kind, parent)
    }

    pub fn parent(&self, kind: &RelationKind, child: Handle) -> Option<Handle> {
        self.working.relations.parent(kind, child)
    }

    pub fn referrers(&self, key: &SymbolicId) -> impl Iterator<Item = Handle> + '_ {
        self.working.symbols.referrers(key)
    }

    pub fn resolve(&self, key: &SymbolicId) -> Option<Handle> {
        self.working.symbols.resolve(key)
    }

    /// Net effect of this builder relative to its base, per type: removed
    /// records first, then replaced, then added.
    pub fn collect_changes(&self) -> BTreeMap<TypeId, Vec<EntityChange>> {
        let base = &self.base.state().records;
        let working = &self.working.records;
        let mut changes: BTreeMap<TypeId, Vec<EntityChange>> = BTreeMap::new();

        for &handle in &self.log.removed {
            if let Ok(record) = base.get(handle) {
                changes
                    .entry(handle.type_id)
                    .or_default()
                    .push(EntityChange::Removed {
                        handle,
                        record: Arc::clone(record),
                    });
            }
        }
        for &handle in self.log.modified.difference(&self.log.created) {
            if let (Ok(old), Ok(new)) = (base.get(handle), working.get(handle)) {
                if old != new {
                    changes
                        .entry(handle.type_id)
                        .or_default()
                        .push(EntityChange::Replaced {
                            handle,
                            old: Arc::clone(old),
                            new: Arc::clone(new),
                        });
                }
            }
        }
        for &handle in &self.log.created {
            if let Ok(record) = working.get(handle) {
                changes
                    .entry(handle.type_id)
                    .or_default()
                    .push(EntityChange::Added {
                        handle,
                        record: Arc::clone(record),
                    });
            }
        }
        changes
    }

    // -- lifecycle -----------------------------------------------------

    /// Validate the staged state and freeze it into a new snapshot.
    ///
    /// On failure the builder is open again and nothing is lost.
    pub fn seal(&mut self) -> Result<Snapshot> {
        self.ensure_open()?;
        self.state = BuilderState::Sealing;

        let checked = self.validate().and_then(|()| {
            if self.lease.consume(self.owner) {
                Ok(())
            } else {
                Err(Error::AlreadyBound)
            }
        });
        if let Err(err) = checked {
            self.state = BuilderState::Open;
            tracing::warn!(error = %err, "seal rejected");
            return Err(err);
        }

        self.state = BuilderState::Sealed;
        if self.log.is_empty() {
            tracing::debug!(version = self.base.version(), "sealed without changes");
            return Ok(self.base.clone());
        }
        let snapshot = self.base.successor(self.working.clone());
        tracing::info!(
            version = snapshot.version(),
            changes = self.log.changes.len(),
            "builder sealed"
        );
        Ok(snapshot)
    }

    /// Replay the staged changes onto `new_base`, a snapshot of the same
    /// lineage. On error the builder is left as it was.
    pub fn rebind(&mut self, new_base: &Snapshot) -> Result<()> {
        self.ensure_open()?;
        if !self.base.same_lineage(new_base) {
            return Err(Error::LineageMismatch);
        }
        if self.base.ptr_eq(new_base) {
            return Ok(());
        }

        let (working, log) = compose::replay(
            new_base.state().clone(),
            ChangeLog::default(),
            &self.log.changes,
            new_base.registry(),
            new_base.config(),
        )?;
        tracing::debug!(
            from = self.base.version(),
            to = new_base.version(),
            changes = log.changes.len(),
            "builder rebound"
        );
        self.base = new_base.clone();
        self.working = working;
        self.log = log;
        Ok(())
    }

    /// Hand the staged changes off as a [`DetachedDiff`] that any thread can
    /// later [`bind`](DetachedDiff::bind).
    pub fn detach(mut self) -> Result<DetachedDiff> {
        self.ensure_open()?;
        let diff = DetachedDiff::new(
            self.base.clone(),
            std::mem::take(&mut self.working),
            std::mem::take(&mut self.log),
            self.lease.clone(),
        );
        self.lease.release(self.owner);
        Ok(diff)
    }

    /// Compose the changes of `diff` on top of this builder.
    ///
    /// Fails with `Conflict` when both sides changed the same field or the
    /// same child's parent to different values, or one side removed a
    /// record the other changed. Success consumes the diff's lease.
    pub fn apply_changes_from(&mut self, diff: &DetachedDiff) -> Result<()> {
        self.ensure_open()?;
        if !self.base.same_lineage(diff.base()) {
            return Err(Error::LineageMismatch);
        }
        let owner = diff.lease().acquire()?;

        let composed = compose::compose(
            self.base.registry(),
            self.base.config(),
            (self.base.state(), &self.working, &self.log),
            (diff.base().state(), diff.working(), diff.log()),
        );

        match composed {
            Ok((working, log)) => {
                diff.lease().consume(owner);
                tracing::info!(
                    applied = diff.log().changes.len(),
                    total = log.changes.len(),
                    "diff composed"
                );
                self.working = working;
                self.log = log;
                Ok(())
            }
            Err(err) => {
                diff.lease().release(owner);
                tracing::warn!(error = %err, "composition rejected");
                Err(err)
            }
        }
    }

    // -- internals -----------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            BuilderState::Open => Ok(()),
            state => Err(Error::NotOpen(state)),
        }
    }

    fn stage(&mut self, change: Change) -> Result<Touched> {
        self.ensure_open()?;
        let touched = self
            .working
            .apply(&change, self.base.registry(), self.base.config())?;
        tracing::trace!(kind = change.kind(), "change staged");
        self.log.record(change, touched.clone());
        Ok(touched)
    }

    fn stage_patch(&mut self, handle: Handle, patch: FieldPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.stage(Change::Modify { handle, patch })?;
        Ok(())
    }

    fn attach(&mut self, kind: &RelationKind, child: Handle, parent: Handle, strict: bool) -> Result<()> {
        self.ensure_open()?;
        self.check_kind(kind)?;
        self.stage(Change::SetRelation {
            relation: kind.id,
            child,
            parent,
            strict,
        })?;
        Ok(())
    }

    /// The kind must come from this builder's registry.
    fn check_kind(&self, kind: &RelationKind) -> Result<()> {
        if self.base.registry().relation(kind.id)? == *kind {
            Ok(())
        } else {
            Err(Error::UnknownRelation(kind.id))
        }
    }

    fn validate(&self) -> Result<()> {
        let registry = self.base.registry();
        let config = self.base.config();
        let state = &self.working;
        let dirty = self.log.dirty();

        for &handle in &dirty {
            let Ok(record) = state.records.get(handle) else {
                continue;
            };
            registry
                .entity_type(handle.type_id)?
                .validate(handle, record, config.check_field_types)?;
        }

        for handle in self.log.relation_checks() {
            if !state.records.contains(handle) {
                continue;
            }
            for kind in registry.relations_as_child(handle.type_id) {
                if !kind.child_optional && state.relations.parent(kind, handle).is_none() {
                    return Err(Error::MissingRelation {
                        relation: registry.relation_name(kind),
                        entity_type: registry.type_name(handle.type_id),
                        handle,
                    });
                }
            }
        }

        if config.unique_symbolic_ids {
            for &handle in &dirty {
                let Ok(record) = state.records.get(handle) else {
                    continue;
                };
                let Some(key) = registry.entity_type(handle.type_id)?.owned_id(record) else {
                    continue;
                };
                if let Some(existing) = state.symbols.owners(&key).find(|owner| *owner != handle) {
                    return Err(Error::DuplicateSymbolicId {
                        key,
                        existing,
                        duplicate: handle,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.lease.release(self.owner);
    }
}
