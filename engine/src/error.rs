//! Error types for the entity store.

use crate::{BuilderState, Handle, RelationId, SymbolicId, TypeId};
use thiserror::Error;

/// All possible errors from the entity store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Schema errors
    #[error("relation {relation} already declared as {existing}, cannot redeclare as {requested}")]
    DuplicateRelation {
        relation: String,
        existing: String,
        requested: String,
    },

    #[error("entity type '{0}' redefined with a different declaration")]
    TypeRedefined(String),

    #[error("unknown entity type: {0}")]
    UnknownType(TypeId),

    #[error("unknown relation: {0}")]
    UnknownRelation(RelationId),

    // Seal-time validation errors
    #[error("field '{field}' of {entity_type} {handle} is not initialized")]
    UninitializedField {
        entity_type: String,
        field: String,
        handle: Handle,
    },

    #[error("type mismatch for field '{field}' of {entity_type} {handle}: expected {expected}, got {got}")]
    TypeMismatch {
        entity_type: String,
        field: String,
        handle: Handle,
        expected: String,
        got: String,
    },

    #[error("{entity_type} {handle} has no parent in mandatory relation {relation}")]
    MissingRelation {
        relation: String,
        entity_type: String,
        handle: Handle,
    },

    #[error("symbolic id '{key}' is owned by both {existing} and {duplicate}")]
    DuplicateSymbolicId {
        key: SymbolicId,
        existing: Handle,
        duplicate: Handle,
    },

    // Write-time errors
    #[error("record not found: {0}")]
    NotFound(Handle),

    #[error("relation {relation} expects a {expected} endpoint, got {handle}")]
    EndpointMismatch {
        relation: String,
        expected: String,
        handle: Handle,
    },

    #[error("relation {relation}: {handle} is already linked to {existing}")]
    CardinalityViolation {
        relation: String,
        handle: Handle,
        existing: Handle,
    },

    #[error("cannot remove {handle}: {dependents} dependent record(s) in mandatory relations")]
    RemovalRejected { handle: Handle, dependents: usize },

    // Ownership and composition errors
    #[error("diff is already bound to another owner")]
    AlreadyBound,

    #[error("builder is not open (state: {0})")]
    NotOpen(BuilderState),

    #[error("conflicting changes to {handle}: {detail}")]
    Conflict { handle: Handle, detail: String },

    #[error("snapshot belongs to a different store lineage")]
    LineageMismatch,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
