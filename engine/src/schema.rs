//! Schema registry: entity types, their fields and the relations between them.
//!
//! The registry is built once at startup, wrapped in an `Arc` and handed to
//! the root [`Snapshot`](crate::Snapshot). It is read-only from then on.

use crate::{error::Result, EntityRecord, Error, FieldValue, Handle, SymbolicId, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    SymbolicRef,
    List,
    /// Arbitrary nested JSON
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::SymbolicRef => write!(f, "SymbolicRef"),
            FieldType::List => write!(f, "List"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field must be set before a seal
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    fn accepts(&self, value: &FieldValue) -> bool {
        match self.field_type {
            FieldType::String => matches!(value, FieldValue::Str(_)),
            FieldType::Int => matches!(value, FieldValue::Int(_)),
            FieldType::Float => matches!(value, FieldValue::Float(_) | FieldValue::Int(_)),
            FieldType::Bool => matches!(value, FieldValue::Bool(_)),
            FieldType::SymbolicRef => matches!(value, FieldValue::SymbolicRef(_)),
            FieldType::List => matches!(value, FieldValue::List(_)),
            FieldType::Json => true,
        }
    }
}

/// Declaration of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityType {
    /// Type name, unique within a registry
    pub name: String,
    /// Declared fields
    pub fields: Vec<FieldDef>,
    /// Field whose string value is the record's own symbolic id
    pub symbolic_key: Option<String>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            symbolic_key: None,
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Make the string field `name` the symbolic id of records of this type.
    /// The field is added as a required string if not declared yet.
    pub fn symbolic_key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.fields.iter().any(|f| f.name == name) {
            self.fields.push(FieldDef::required(name.clone(), FieldType::String));
        }
        self.symbolic_key = Some(name);
        self
    }

    /// Check a record against the declared fields.
    ///
    /// Every required field must be present and non-null; when `check_types`
    /// is set, every present non-null declared field must match its type.
    pub fn validate(&self, handle: Handle, record: &EntityRecord, check_types: bool) -> Result<()> {
        for field in &self.fields {
            match record.get(&field.name) {
                None | Some(FieldValue::Null) if field.required => {
                    return Err(Error::UninitializedField {
                        entity_type: self.name.clone(),
                        field: field.name.clone(),
                        handle,
                    });
                }
                Some(value) if check_types && !value.is_null() && !field.accepts(value) => {
                    return Err(Error::TypeMismatch {
                        entity_type: self.name.clone(),
                        field: field.name.clone(),
                        handle,
                        expected: field.field_type.to_string(),
                        got: value.kind_name().to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The symbolic id owned by `record`, if this type declares a key and
    /// the record holds a string in it.
    pub fn owned_id(&self, record: &EntityRecord) -> Option<SymbolicId> {
        let key = self.symbolic_key.as_deref()?;
        record.get_str(key).map(SymbolicId::new)
    }
}

/// Cardinality of a relation, seen from the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cardinality::OneToOne => write!(f, "one-to-one"),
            Cardinality::OneToMany => write!(f, "one-to-many"),
        }
    }
}

/// Identifier of a declared relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(pub u32);

impl RelationId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relation#{}", self.0)
    }
}

/// A declared parent/child edge between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationKind {
    pub id: RelationId,
    pub parent_type: TypeId,
    pub child_type: TypeId,
    pub cardinality: Cardinality,
    pub child_optional: bool,
}

impl RelationKind {
    pub fn is_one_to_one(&self) -> bool {
        self.cardinality == Cardinality::OneToOne
    }
}

/// Registry of entity types and relations.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: Vec<EntityType>,
    by_name: HashMap<String, TypeId>,
    relations: Vec<RelationKind>,
    by_pair: HashMap<(TypeId, TypeId), RelationId>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type by name only. Returns the existing id when the name
    /// is already registered.
    pub fn register_type(&mut self, name: impl Into<String>) -> TypeId {
        let name = name.into();
        if let Some(id) = self.by_name.get(&name) {
            return *id;
        }
        self.insert_type(EntityType::new(name))
    }

    /// Register a fully declared type.
    ///
    /// Registering an identical definition twice returns the same id; a
    /// different definition under a known name is rejected.
    pub fn register(&mut self, entity_type: EntityType) -> Result<TypeId> {
        if let Some(id) = self.by_name.get(&entity_type.name) {
            if self.types[id.index()] != entity_type {
                return Err(Error::TypeRedefined(entity_type.name));
            }
            return Ok(*id);
        }
        Ok(self.insert_type(entity_type))
    }

    fn insert_type(&mut self, entity_type: EntityType) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(entity_type.name.clone(), id);
        self.types.push(entity_type);
        id
    }

    /// Builder-style method to register a type.
    pub fn with_type(mut self, entity_type: EntityType) -> Result<Self> {
        self.register(entity_type)?;
        Ok(self)
    }

    /// Declare a relation between two registered types.
    pub fn declare_relation(
        &mut self,
        parent_type: TypeId,
        child_type: TypeId,
        cardinality: Cardinality,
        child_optional: bool,
    ) -> Result<RelationKind> {
        self.entity_type(parent_type)?;
        self.entity_type(child_type)?;

        if let Some(id) = self.by_pair.get(&(parent_type, child_type)) {
            let existing = self.relations[id.index()];
            if existing.cardinality != cardinality || existing.child_optional != child_optional {
                return Err(Error::DuplicateRelation {
                    relation: self.relation_name(&existing),
                    existing: describe(existing.cardinality, existing.child_optional),
                    requested: describe(cardinality, child_optional),
                });
            }
            return Ok(existing);
        }

        let kind = RelationKind {
            id: RelationId(self.relations.len() as u32),
            parent_type,
            child_type,
            cardinality,
            child_optional,
        };
        self.by_pair.insert((parent_type, child_type), kind.id);
        self.relations.push(kind);
        Ok(kind)
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn entity_type(&self, id: TypeId) -> Result<&EntityType> {
        self.types.get(id.index()).ok_or(Error::UnknownType(id))
    }

    /// Type name for messages; falls back to the numeric id.
    pub fn type_name(&self, id: TypeId) -> String {
        self.types
            .get(id.index())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeId, &EntityType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (TypeId(i as u32), t))
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn relation(&self, id: RelationId) -> Result<RelationKind> {
        self.relations
            .get(id.index())
            .copied()
            .ok_or(Error::UnknownRelation(id))
    }

    pub fn relation_between(&self, parent_type: TypeId, child_type: TypeId) -> Option<RelationKind> {
        self.by_pair
            .get(&(parent_type, child_type))
            .map(|id| self.relations[id.index()])
    }

    pub fn relations(&self) -> &[RelationKind] {
        &self.relations
    }

    /// Relations in which records of `type_id` are the parent.
    pub fn relations_as_parent(&self, type_id: TypeId) -> impl Iterator<Item = &RelationKind> {
        self.relations.iter().filter(move |r| r.parent_type == type_id)
    }

    /// Relations in which records of `type_id` are the child.
    pub fn relations_as_child(&self, type_id: TypeId) -> impl Iterator<Item = &RelationKind> {
        self.relations.iter().filter(move |r| r.child_type == type_id)
    }

    /// Human-readable name of a relation, `parent->child`.
    pub fn relation_name(&self, kind: &RelationKind) -> String {
        format!(
            "{}->{}",
            self.type_name(kind.parent_type),
            self.type_name(kind.child_type)
        )
    }
}

fn describe(cardinality: Cardinality, child_optional: bool) -> String {
    if child_optional {
        format!("{} (optional child)", cardinality)
    } else {
        cardinality.to_string()
    }
}
