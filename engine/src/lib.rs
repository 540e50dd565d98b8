//! # Entity Store
//!
//! A typed, versioned, graph-shaped entity storage engine.
//!
//! The store holds records of registered entity types, parent/child edges
//! between them, and soft references by symbolic id. Readers work on
//! immutable [`Snapshot`]s that are safe to share across threads; writers
//! stage changes in a [`Builder`] and seal it into the next snapshot.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, network or clocks
//! - **Immutable reads**: a snapshot never changes once sealed
//! - **Structural sharing**: successive snapshots share untouched tables
//! - **Validated writes**: a seal either yields a consistent snapshot or an
//!   error, never a half-applied state
//!
//! ## Core Concepts
//!
//! ### Schema
//!
//! A [`SchemaRegistry`] declares entity types ([`EntityType`]) and the
//! relations between them ([`RelationKind`]): one-to-one or one-to-many,
//! with an optional or mandatory child side. The registry is frozen behind
//! an `Arc` once the root snapshot is created.
//!
//! ### Records and handles
//!
//! An [`EntityRecord`] is an immutable bag of [`FieldValue`]s tagged with
//! an [`Origin`]. Records are addressed by [`Handle`]: type plus slot.
//! Handles are never reused within a snapshot lineage.
//!
//! ### Relations and symbolic references
//!
//! Parent/child edges live in the [`RelationIndex`], one table per relation
//! kind. Soft references by [`SymbolicId`] are tracked in the
//! [`SymbolicIndex`], which makes renames and reverse lookups cheap.
//!
//! ### Builders
//!
//! A [`Builder`] stages creates, modifications, removals, relation changes
//! and renames. [`Builder::seal`] checks required fields, mandatory
//! relations and symbolic-id uniqueness, then produces the successor
//! snapshot. A builder can be rebound onto a newer snapshot, detached into
//! a [`DetachedDiff`] for another thread, or composed with another diff.
//! [`Builder::replace_by_source`] refreshes the records of chosen origins
//! from another snapshot.
//!
//! ## Quick Start
//!
//! ```rust
//! use entity_store::{
//!     fields, Cardinality, EngineConfig, EntityType, FieldDef, FieldType, Origin,
//!     SchemaRegistry, Snapshot,
//! };
//! use std::sync::Arc;
//!
//! // 1. Define a schema
//! let mut registry = SchemaRegistry::new();
//! let module = registry.register(EntityType::new("module").symbolic_key("name"))?;
//! let content_root = registry.register(
//!     EntityType::new("content_root").field(FieldDef::required("url", FieldType::String)),
//! )?;
//! let roots = registry.declare_relation(module, content_root, Cardinality::OneToMany, false)?;
//!
//! // 2. Start from an empty snapshot
//! let root = Snapshot::empty(Arc::new(registry), EngineConfig::default());
//!
//! // 3. Stage changes in a builder
//! let mut builder = root.builder();
//! let core = builder.create_record(module, fields! { "name" => "core" }, Origin::new("maven"))?;
//! let src = builder.create_record(
//!     content_root,
//!     fields! { "url" => "file://core/src" },
//!     Origin::new("maven"),
//! )?;
//! builder.set_relation(&roots, src, core)?;
//!
//! // 4. Seal and query
//! let snapshot = builder.seal()?;
//! assert_eq!(snapshot.children(&roots, core), &[src]);
//! assert_eq!(snapshot.parent(&roots, src), Some(core));
//! assert!(root.get(core).is_err());
//! # Ok::<(), entity_store::Error>(())
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig`] selects the removal policy and toggles seal-time checks.
//! It can be read from `ENTITY_STORE_*` environment variables or JSON.

pub mod builder;
pub mod change;
pub mod compose;
pub mod config;
pub mod error;
pub mod record;
pub mod relation;
pub mod replace;
pub mod schema;
mod shard;
pub mod snapshot;
mod state;
pub mod store;
pub mod symbolic;

// Re-export main types at crate root
pub use builder::{Builder, BuilderState};
pub use change::{Change, EntityChange, FieldPatch};
pub use compose::DetachedDiff;
pub use config::{ConfigError, EngineConfig, RemovalPolicy};
pub use error::{Error, Result};
pub use record::{EntityRecord, FieldValue, Fields, Handle, Origin, RecordDraft, SymbolicId, TypeId};
pub use relation::{AttachMode, EdgeUpdate, RelationIndex};
pub use replace::ReplaceReport;
pub use schema::{Cardinality, EntityType, FieldDef, FieldType, RelationId, RelationKind, SchemaRegistry};
pub use snapshot::{Snapshot, SnapshotMetadata};
pub use store::{HandleAllocator, RecordStore};
pub use symbolic::SymbolicIndex;

/// Number of seals since a lineage's root snapshot.
pub type Version = u64;
