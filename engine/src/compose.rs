//! Detached diffs and diff composition.
//!
//! A [`DetachedDiff`] is the change log of a builder that left its owner.
//! Any thread may hold a clone, but a single atomic lease decides who gets
//! to turn it back into a [`Builder`]: the first [`DetachedDiff::bind`] wins
//! and every other bind fails with `AlreadyBound` until that builder is
//! dropped unsealed. Sealing the builder, or composing the diff into another
//! builder, consumes the lease for good.
//!
//! # Composition
//!
//! Composing diff B onto builder A replays B's log on top of A's working
//! state. Before replaying, the net effect of each side relative to its own
//! base is compared:
//!
//! 1. A field changed by both sides must end with the same value
//! 2. A record removed by one side must be untouched by the other, and
//!    must not gain a child there
//! 3. A child re-parented by both sides must end under the same parent
//! 4. A one-to-one parent whose child changed on both sides must end with
//!    the same child
//!
//! Anything else merges.

use crate::{
    change::{Change, ChangeLog, FieldPatch},
    config::EngineConfig,
    error::Result,
    state::StoreState,
    Builder, Error, Handle, RelationId, SchemaRegistry, Snapshot,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const FREE: u64 = 0;
const CONSUMED: u64 = u64::MAX;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn next_owner() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Single-owner claim on a change log, shared by every clone of a diff and
/// the builder currently bound to it.
#[derive(Debug, Clone)]
pub(crate) struct Lease {
    holder: Arc<AtomicU64>,
}

impl Lease {
    /// A new lease, already held by a fresh owner.
    pub fn held() -> (Self, u64) {
        let owner = next_owner();
        let lease = Self {
            holder: Arc::new(AtomicU64::new(owner)),
        };
        (lease, owner)
    }

    /// Take a free lease for a fresh owner.
    pub fn acquire(&self) -> Result<u64> {
        let owner = next_owner();
        self.holder
            .compare_exchange(FREE, owner, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| owner)
            .map_err(|_| Error::AlreadyBound)
    }

    /// Give the lease back. Does nothing unless `owner` holds it.
    pub fn release(&self, owner: u64) {
        let _ = self
            .holder
            .compare_exchange(owner, FREE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Retire the lease for good. Returns false unless `owner` held it.
    pub fn consume(&self, owner: u64) -> bool {
        self.holder
            .compare_exchange(owner, CONSUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_consumed(&self) -> bool {
        self.holder.load(Ordering::Acquire) == CONSUMED
    }

    pub fn is_free(&self) -> bool {
        self.holder.load(Ordering::Acquire) == FREE
    }
}

#[derive(Debug)]
struct DiffInner {
    base: Snapshot,
    working: StoreState,
    log: ChangeLog,
    lease: Lease,
}

/// A builder's staged changes, detached from any owner.
///
/// Cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct DetachedDiff {
    inner: Arc<DiffInner>,
}

impl DetachedDiff {
    pub(crate) fn new(base: Snapshot, working: StoreState, log: ChangeLog, lease: Lease) -> Self {
        Self {
            inner: Arc::new(DiffInner {
                base,
                working,
                log,
                lease,
            }),
        }
    }

    /// Claim the diff and reopen it as a builder on `target`.
    ///
    /// Fails with `AlreadyBound` while another builder holds the diff, or
    /// once it was sealed or composed. If replaying onto `target` fails the
    /// claim is released again.
    pub fn bind(&self, target: &Snapshot) -> Result<Builder> {
        if !self.inner.base.same_lineage(target) {
            return Err(Error::LineageMismatch);
        }
        let owner = self.inner.lease.acquire()?;
        let mut builder = Builder::from_parts(
            self.inner.base.clone(),
            self.inner.working.clone(),
            self.inner.log.clone(),
            self.inner.lease.clone(),
            owner,
        );
        builder.rebind(target)?;
        tracing::debug!(
            owner,
            version = target.version(),
            changes = self.inner.log.changes.len(),
            "diff bound"
        );
        Ok(builder)
    }

    /// The snapshot the changes were staged against.
    pub fn base(&self) -> &Snapshot {
        &self.inner.base
    }

    pub fn changes(&self) -> &[Change] {
        &self.inner.log.changes
    }

    pub fn has_changes(&self) -> bool {
        !self.inner.log.is_empty()
    }

    /// Whether a bind would currently succeed.
    pub fn is_available(&self) -> bool {
        self.inner.lease.is_free()
    }

    /// Whether the diff was sealed or composed and can never be bound again.
    pub fn is_consumed(&self) -> bool {
        self.inner.lease.is_consumed()
    }

    pub(crate) fn working(&self) -> &StoreState {
        &self.inner.working
    }

    pub(crate) fn log(&self) -> &ChangeLog {
        &self.inner.log
    }

    pub(crate) fn lease(&self) -> &Lease {
        &self.inner.lease
    }
}

/// One side of a composition: base state, working state and log.
pub(crate) type Side<'a> = (&'a StoreState, &'a StoreState, &'a ChangeLog);

/// Apply `changes` in order on top of `state`, extending `log`.
pub(crate) fn replay(
    mut state: StoreState,
    mut log: ChangeLog,
    changes: &[Change],
    registry: &SchemaRegistry,
    config: &EngineConfig,
) -> Result<(StoreState, ChangeLog)> {
    for change in changes {
        let touched = state.apply(change, registry, config)?;
        log.record(change.clone(), touched);
    }
    Ok((state, log))
}

/// Replay `theirs` on top of `ours` after checking the two for conflicts.
pub(crate) fn compose(
    registry: &SchemaRegistry,
    config: &EngineConfig,
    ours: Side<'_>,
    theirs: Side<'_>,
) -> Result<(StoreState, ChangeLog)> {
    check_conflicts(registry, ours, theirs)?;

    let (_, working, log) = ours;
    // Records both sides removed are already gone here.
    let pending: Vec<Change> = theirs
        .2
        .changes
        .iter()
        .filter(|change| match change {
            Change::Remove { handle } => {
                working.records.contains(*handle) || !log.removed.contains(handle)
            }
            _ => true,
        })
        .cloned()
        .collect();

    replay(working.clone(), log.clone(), &pending, registry, config)
}

/// Net effect of one side on records that existed in its base.
#[derive(Debug, Default)]
struct NetDelta {
    patches: BTreeMap<Handle, FieldPatch>,
    removed: BTreeSet<Handle>,
    /// New parent of each re-parented base record
    parents: BTreeMap<(RelationId, Handle), Option<Handle>>,
    /// Child a one-to-one parent ends with, where it changed
    sole_children: BTreeMap<(RelationId, Handle), Option<Handle>>,
    /// Parents that gained a child, created ones included
    adopted: BTreeSet<Handle>,
}

impl NetDelta {
    fn of(registry: &SchemaRegistry, (base, working, log): Side<'_>) -> Self {
        let mut delta = NetDelta::default();

        for &handle in log.modified.difference(&log.created) {
            if let (Ok(before), Ok(after)) = (base.records.get(handle), working.records.get(handle)) {
                let patch = FieldPatch::between(before, after);
                if !patch.is_empty() {
                    delta.patches.insert(handle, patch);
                }
            }
        }

        delta.removed = log
            .removed
            .iter()
            .copied()
            .filter(|handle| base.records.contains(*handle))
            .collect();

        for &handle in &log.linked {
            for kind in registry.relations_as_child(handle.type_id) {
                let before = base.relations.parent(kind, handle);
                let after = working.relations.parent(kind, handle);
                if before == after {
                    continue;
                }
                if !log.created.contains(&handle) {
                    delta.parents.insert((kind.id, handle), after);
                }
                delta.adopted.extend(after);
                if !kind.is_one_to_one() {
                    continue;
                }
                for parent in before.into_iter().chain(after) {
                    let child = working.relations.children(kind, parent).first().copied();
                    if base.relations.children(kind, parent).first().copied() != child {
                        delta.sole_children.insert((kind.id, parent), child);
                    }
                }
            }
        }
        delta
    }

    fn touches(&self, handle: Handle) -> bool {
        self.patches.contains_key(&handle)
            || self.adopted.contains(&handle)
            || self.parents.keys().any(|(_, child)| *child == handle)
    }
}

fn conflict(handle: Handle, detail: impl Into<String>) -> Error {
    Error::Conflict {
        handle,
        detail: detail.into(),
    }
}

pub(crate) fn check_conflicts(registry: &SchemaRegistry, ours: Side<'_>, theirs: Side<'_>) -> Result<()> {
    let ours = NetDelta::of(registry, ours);
    let theirs = NetDelta::of(registry, theirs);

    if let Some(handle) = ours.removed.iter().find(|h| theirs.touches(**h)) {
        return Err(conflict(*handle, "removed here, changed by the applied diff"));
    }
    if let Some(handle) = theirs.removed.iter().find(|h| ours.touches(**h)) {
        return Err(conflict(*handle, "changed here, removed by the applied diff"));
    }

    for (handle, our_patch) in &ours.patches {
        let Some(their_patch) = theirs.patches.get(handle) else {
            continue;
        };
        for field in our_patch.touched_fields() {
            if let Some(their_value) = their_patch.outcome(field) {
                if our_patch.outcome(field) != Some(their_value) {
                    return Err(conflict(*handle, format!("field '{field}' changed on both sides")));
                }
            }
        }
        if let (Some(a), Some(b)) = (&our_patch.origin, &their_patch.origin) {
            if a != b {
                return Err(conflict(*handle, "origin changed on both sides"));
            }
        }
    }

    for ((relation, parent), our_child) in &ours.sole_children {
        if let Some(their_child) = theirs.sole_children.get(&(*relation, *parent)) {
            if their_child != our_child {
                let kind = registry.relation(*relation)?;
                return Err(conflict(
                    *parent,
                    format!("child in {} changed on both sides", registry.relation_name(&kind)),
                ));
            }
        }
    }

    for ((relation, child), our_parent) in &ours.parents {
        if let Some(their_parent) = theirs.parents.get(&(*relation, *child)) {
            if their_parent != our_parent {
                let kind = registry.relation(*relation)?;
                return Err(conflict(
                    *child,
                    format!("parent in {} changed on both sides", registry.relation_name(&kind)),
                ));
            }
        }
    }
    Ok(())
}
