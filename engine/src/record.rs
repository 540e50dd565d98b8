//! Record types for storing entity data.
//!
//! An [`EntityRecord`] is an immutable bag of typed fields. Changing a field
//! never mutates a record in place: a new record is built (usually through a
//! [`RecordDraft`]) and swapped into the record's slot. List and JSON values
//! sit behind `Arc`, so a new record shares every value it did not touch with
//! the record it replaces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a registered entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Stable address of a record inside one snapshot lineage.
///
/// Slots are never reused, so a handle taken before a removal keeps failing
/// with `NotFound` instead of resolving to an unrelated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handle {
    pub type_id: TypeId,
    pub local_id: u32,
}

impl Handle {
    pub fn new(type_id: TypeId, local_id: u32) -> Self {
        Self { type_id, local_id }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.type_id.0, self.local_id)
    }
}

/// Name-like key used for soft references that must survive renames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolicId(String);

impl SymbolicId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SymbolicId {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Provenance tag of a record. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin(String);

impl Origin {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Soft reference to the record owning this key
    SymbolicRef(SymbolicId),
    /// Copy-on-write list; cloning a record shares the backing vector
    List(Arc<Vec<FieldValue>>),
    /// Opaque payload owned by a collaborator
    Json(Arc<serde_json::Value>),
}

impl FieldValue {
    pub fn list(items: Vec<FieldValue>) -> Self {
        FieldValue::List(Arc::new(items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&SymbolicId> {
        match self {
            FieldValue::SymbolicRef(id) => Some(id),
            _ => None,
        }
    }

    /// Name of the value's kind, used in type mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "Null",
            FieldValue::Bool(_) => "Bool",
            FieldValue::Int(_) => "Int",
            FieldValue::Float(_) => "Float",
            FieldValue::Str(_) => "String",
            FieldValue::SymbolicRef(_) => "SymbolicRef",
            FieldValue::List(_) => "List",
            FieldValue::Json(_) => "Json",
        }
    }

    fn collect_refs(&self, out: &mut Vec<SymbolicId>) {
        match self {
            FieldValue::SymbolicRef(id) => out.push(id.clone()),
            FieldValue::List(items) => items.iter().for_each(|item| item.collect_refs(out)),
            _ => {}
        }
    }

    fn mentions(&self, key: &SymbolicId) -> bool {
        match self {
            FieldValue::SymbolicRef(id) => id == key,
            FieldValue::List(items) => items.iter().any(|item| item.mentions(key)),
            _ => false,
        }
    }

    /// Returns a copy with every occurrence of `from` replaced by `to`.
    /// Lists that do not mention `from` keep sharing their storage.
    fn renamed(&self, from: &SymbolicId, to: &SymbolicId) -> FieldValue {
        match self {
            FieldValue::SymbolicRef(id) if id == from => FieldValue::SymbolicRef(to.clone()),
            FieldValue::List(items) if self.mentions(from) => FieldValue::List(Arc::new(
                items.iter().map(|item| item.renamed(from, to)).collect(),
            )),
            other => other.clone(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<SymbolicId> for FieldValue {
    fn from(value: SymbolicId) -> Self {
        FieldValue::SymbolicRef(value)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(value: Vec<FieldValue>) -> Self {
        FieldValue::list(value)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Json(Arc::new(value))
    }
}

/// Field bag of a record, ordered by field name.
pub type Fields = BTreeMap<String, FieldValue>;

/// Builds a [`Fields`] map from `name => value` pairs.
#[macro_export]
macro_rules! fields {
    () => { $crate::Fields::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::Fields::new();
        $( fields.insert(::std::string::String::from($name), $crate::FieldValue::from($value)); )+
        fields
    }};
}

/// An immutable entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    type_id: TypeId,
    fields: Fields,
    origin: Origin,
}

impl EntityRecord {
    pub fn new(type_id: TypeId, fields: Fields, origin: Origin) -> Self {
        Self {
            type_id,
            fields,
            origin,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn get_list(&self, name: &str) -> Option<&[FieldValue]> {
        self.get(name).and_then(FieldValue::as_list)
    }

    /// Every soft reference held by this record, including inside lists.
    pub fn symbolic_refs(&self) -> Vec<SymbolicId> {
        let mut refs = Vec::new();
        for value in self.fields.values() {
            value.collect_refs(&mut refs);
        }
        refs.sort();
        refs.dedup();
        refs
    }

    /// Copy of this record with every reference to `from` pointing at `to`.
    pub(crate) fn with_renamed_ref(&self, from: &SymbolicId, to: &SymbolicId) -> EntityRecord {
        let fields = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.renamed(from, to)))
            .collect();
        EntityRecord {
            type_id: self.type_id,
            fields,
            origin: self.origin.clone(),
        }
    }

    /// Start a mutable draft of this record.
    pub fn to_draft(&self) -> RecordDraft {
        RecordDraft {
            type_id: self.type_id,
            fields: self.fields.clone(),
            origin: self.origin.clone(),
        }
    }
}

/// Mutable working copy of a record, handed out by the builder.
///
/// Collection fields are copy-on-write: editing a list through
/// [`RecordDraft::list_mut`] clones the backing vector only if a snapshot
/// still shares it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    type_id: TypeId,
    fields: Fields,
    origin: Origin,
}

impl RecordDraft {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn unset(&mut self, name: &str) -> &mut Self {
        self.fields.remove(name);
        self
    }

    pub fn set_origin(&mut self, origin: Origin) -> &mut Self {
        self.origin = origin;
        self
    }

    /// Mutable access to a list field. A missing or non-list field is
    /// replaced by an empty list.
    pub fn list_mut(&mut self, name: &str) -> &mut Vec<FieldValue> {
        let slot = self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| FieldValue::list(Vec::new()));
        if !matches!(slot, FieldValue::List(_)) {
            *slot = FieldValue::list(Vec::new());
        }
        match slot {
            FieldValue::List(items) => Arc::make_mut(items),
            _ => unreachable!("slot was just made a list"),
        }
    }

    pub fn into_record(self) -> EntityRecord {
        EntityRecord {
            type_id: self.type_id,
            fields: self.fields,
            origin: self.origin,
        }
    }
}
