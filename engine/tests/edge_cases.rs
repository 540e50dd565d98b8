//! Edge case tests for entity-store
//!
//! These tests cover boundary conditions and unusual inputs.

use entity_store::{
    fields, BuilderState, Cardinality, EngineConfig, EntityType, Error, FieldDef, FieldType,
    FieldValue, Handle, Origin, RelationKind, RemovalPolicy, SchemaRegistry, Snapshot, SymbolicId,
    TypeId,
};
use std::sync::Arc;

struct Schema {
    root: Snapshot,
    module: TypeId,
    library: TypeId,
    content_root: TypeId,
    roots: RelationKind,
}

fn create_test_schema(config: EngineConfig) -> Schema {
    let mut registry = SchemaRegistry::new();
    let module = registry
        .register(
            EntityType::new("module")
                .symbolic_key("name")
                .field(FieldDef::optional("priority", FieldType::Int))
                .field(FieldDef::optional("dependencies", FieldType::List)),
        )
        .unwrap();
    let library = registry
        .register(EntityType::new("library").symbolic_key("name"))
        .unwrap();
    let content_root = registry
        .register(EntityType::new("content_root").field(FieldDef::required("url", FieldType::String)))
        .unwrap();
    let roots = registry
        .declare_relation(module, content_root, Cardinality::OneToMany, false)
        .unwrap();
    Schema {
        root: Snapshot::empty(Arc::new(registry), config),
        module,
        library,
        content_root,
        roots,
    }
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_symbolic_key() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let handle = builder
        .create_record(s.library, fields! { "name" => "" }, Origin::default())
        .unwrap();
    let snapshot = builder.seal().unwrap();

    assert_eq!(snapshot.resolve(&SymbolicId::new("")), Some(handle));
}

#[test]
fn unicode_symbolic_ids_rename() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let module = builder
        .create_record(
            s.module,
            fields! {
                "name" => "モジュール",
                "dependencies" => vec![FieldValue::from(SymbolicId::new("библиотека"))],
            },
            Origin::default(),
        )
        .unwrap();
    let base = builder.seal().unwrap();

    let mut builder = base.builder();
    builder
        .rename_symbolic(&SymbolicId::new("библиотека"), &SymbolicId::new("🎉 lib"))
        .unwrap();
    let snapshot = builder.seal().unwrap();

    assert_eq!(
        snapshot.get(module).unwrap().symbolic_refs(),
        vec![SymbolicId::new("🎉 lib")]
    );
}

// ============================================================================
// Builder Lifecycle
// ============================================================================

#[test]
fn sealing_an_untouched_builder_keeps_version() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();

    assert!(!builder.has_changes());
    let snapshot = builder.seal().unwrap();
    assert_eq!(snapshot.version(), 0);
    assert_eq!(builder.state(), BuilderState::Sealed);
}

#[test]
fn create_then_remove_leaves_nothing_to_seal() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let core = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::default())
        .unwrap();
    let src = builder
        .create_record(s.content_root, fields! { "url" => "file://src" }, Origin::default())
        .unwrap();
    builder.set_relation(&s.roots, src, core).unwrap();
    assert!(builder.has_changes());

    builder.remove_record(core).unwrap();

    assert!(!builder.has_changes());
    assert!(builder.collect_changes().is_empty());
    let snapshot = builder.seal().unwrap();
    assert_eq!(snapshot.version(), s.root.version());
    assert!(!snapshot.contains(src));
}

#[test]
fn writes_after_seal_are_refused() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let module = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::default())
        .unwrap();
    builder.seal().unwrap();

    let refused = Error::NotOpen(BuilderState::Sealed);
    assert_eq!(builder.remove_record(module).unwrap_err(), refused);
    assert_eq!(
        builder
            .rename_symbolic(&SymbolicId::new("core"), &SymbolicId::new("app"))
            .unwrap_err(),
        refused
    );
    assert_eq!(builder.rebind(&s.root).unwrap_err(), refused);
    assert!(matches!(builder.detach(), Err(Error::NotOpen(BuilderState::Sealed))));
}

#[test]
fn unknown_type_is_rejected_on_create() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();

    assert_eq!(
        builder
            .create_record(TypeId(99), fields! {}, Origin::default())
            .unwrap_err(),
        Error::UnknownType(TypeId(99))
    );
    assert!(!builder.has_changes());
}

// ============================================================================
// Handle Edge Cases
// ============================================================================

#[test]
fn removed_handles_stay_dead() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let first = builder
        .create_record(s.library, fields! { "name" => "a" }, Origin::default())
        .unwrap();
    builder.remove_record(first).unwrap();
    let second = builder
        .create_record(s.library, fields! { "name" => "b" }, Origin::default())
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(builder.remove_record(first).unwrap_err(), Error::NotFound(first));
    assert_eq!(builder.get(first).unwrap_err(), Error::NotFound(first));
}

#[test]
fn handles_from_parallel_builders_never_collide() {
    let s = create_test_schema(EngineConfig::default());
    let mut left = s.root.builder();
    let mut right = s.root.builder();

    let a = left
        .create_record(s.library, fields! { "name" => "a" }, Origin::default())
        .unwrap();
    let b = right
        .create_record(s.library, fields! { "name" => "b" }, Origin::default())
        .unwrap();

    assert_ne!(a, b);
    assert!(!left.contains(b));
    assert!(!right.contains(a));
}

#[test]
fn handle_of_wrong_type_is_not_found() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let lib = builder
        .create_record(s.library, fields! { "name" => "a" }, Origin::default())
        .unwrap();
    let snapshot = builder.seal().unwrap();

    let forged = Handle::new(s.module, lib.local_id);
    assert_eq!(snapshot.get(forged).unwrap_err(), Error::NotFound(forged));
}

// ============================================================================
// Relation Edge Cases
// ============================================================================

#[test]
fn endpoint_of_wrong_type_is_rejected() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let module = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::default())
        .unwrap();
    let lib = builder
        .create_record(s.library, fields! { "name" => "junit" }, Origin::default())
        .unwrap();

    assert!(matches!(
        builder.set_relation(&s.roots, lib, module).unwrap_err(),
        Error::EndpointMismatch { handle, .. } if handle == lib
    ));
}

#[test]
fn reattaching_moves_child_between_parents() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let core = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::default())
        .unwrap();
    let app = builder
        .create_record(s.module, fields! { "name" => "app" }, Origin::default())
        .unwrap();
    let root = builder
        .create_record(s.content_root, fields! { "url" => "file://x" }, Origin::default())
        .unwrap();

    builder.set_relation(&s.roots, root, core).unwrap();
    builder.set_relation(&s.roots, root, app).unwrap();
    builder.set_relation(&s.roots, root, app).unwrap();
    let snapshot = builder.seal().unwrap();

    assert!(snapshot.children(&s.roots, core).is_empty());
    assert_eq!(snapshot.children(&s.roots, app), &[root]);
}

#[test]
fn removing_a_child_keeps_parent() {
    let s = create_test_schema(EngineConfig::default().with_removal_policy(RemovalPolicy::Reject));
    let mut builder = s.root.builder();
    let core = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::default())
        .unwrap();
    let root = builder
        .create_record(s.content_root, fields! { "url" => "file://x" }, Origin::default())
        .unwrap();
    builder.set_relation(&s.roots, root, core).unwrap();
    let base = builder.seal().unwrap();

    let mut builder = base.builder();
    assert_eq!(builder.remove_record(root).unwrap(), vec![root]);
    let snapshot = builder.seal().unwrap();

    assert!(snapshot.contains(core));
    assert!(snapshot.children(&s.roots, core).is_empty());
}

// ============================================================================
// Symbolic Edge Cases
// ============================================================================

#[test]
fn rename_onto_itself_is_a_noop() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    builder
        .create_record(s.library, fields! { "name" => "junit" }, Origin::default())
        .unwrap();
    let base = builder.seal().unwrap();

    let mut builder = base.builder();
    let junit = SymbolicId::new("junit");
    assert!(builder.rename_symbolic(&junit, &junit).unwrap().is_empty());
    assert!(builder
        .rename_symbolic(&SymbolicId::new("nobody"), &SymbolicId::new("else"))
        .unwrap()
        .is_empty());
    assert!(!builder.has_changes());
}

#[test]
fn dangling_symbolic_refs_are_allowed() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let module = builder
        .create_record(
            s.module,
            fields! {
                "name" => "core",
                "dependencies" => vec![FieldValue::from(SymbolicId::new("missing"))],
            },
            Origin::default(),
        )
        .unwrap();
    let snapshot = builder.seal().unwrap();

    assert_eq!(snapshot.resolve(&SymbolicId::new("missing")), None);
    assert_eq!(
        snapshot.referrers(&SymbolicId::new("missing")).collect::<Vec<_>>(),
        vec![module]
    );
}

// ============================================================================
// Validation Edge Cases
// ============================================================================

#[test]
fn null_required_field_is_uninitialized() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let handle = builder
        .create_record(s.library, fields! { "name" => FieldValue::Null }, Origin::default())
        .unwrap();

    assert_eq!(
        builder.seal().unwrap_err(),
        Error::UninitializedField {
            entity_type: "library".into(),
            field: "name".into(),
            handle,
        }
    );
}

#[test]
fn type_checks_can_be_disabled() {
    let strict = create_test_schema(EngineConfig::default());
    let mut builder = strict.root.builder();
    let core = builder
        .create_record(
            strict.module,
            fields! { "name" => "core", "priority" => "high" },
            Origin::default(),
        )
        .unwrap();
    assert_eq!(
        builder.seal().unwrap_err(),
        Error::TypeMismatch {
            entity_type: "module".into(),
            field: "priority".into(),
            handle: core,
            expected: "Int".into(),
            got: "String".into(),
        }
    );

    let lax = create_test_schema(EngineConfig::from_json(r#"{"checkFieldTypes": false}"#).unwrap());
    let mut builder = lax.root.builder();
    builder
        .create_record(
            lax.module,
            fields! { "name" => "core", "priority" => "high" },
            Origin::default(),
        )
        .unwrap();
    assert!(builder.seal().is_ok());
}

#[test]
fn extreme_int_values() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let handles: Vec<_> = [i64::MIN, 0, i64::MAX]
        .into_iter()
        .enumerate()
        .map(|(i, priority)| {
            builder
                .create_record(
                    s.module,
                    fields! { "name" => format!("m{i}"), "priority" => priority },
                    Origin::default(),
                )
                .unwrap()
        })
        .collect();
    let snapshot = builder.seal().unwrap();

    let priorities: Vec<_> = handles
        .iter()
        .map(|h| snapshot.get(*h).unwrap().get("priority").and_then(FieldValue::as_int))
        .collect();
    assert_eq!(priorities, vec![Some(i64::MIN), Some(0), Some(i64::MAX)]);
}

// ============================================================================
// Detached Diff Edge Cases
// ============================================================================

#[test]
fn empty_diff_binds_and_seals() {
    let s = create_test_schema(EngineConfig::default());
    let diff = s.root.builder().detach().unwrap();

    assert!(!diff.has_changes());
    let mut builder = diff.bind(&s.root).unwrap();
    assert_eq!(builder.seal().unwrap().version(), 0);
    assert!(diff.is_consumed());
}

#[test]
fn diff_cannot_compose_into_another_lineage() {
    let a = create_test_schema(EngineConfig::default());
    let b = create_test_schema(EngineConfig::default());
    let diff = a.root.builder().detach().unwrap();

    assert_eq!(
        b.root.builder().apply_changes_from(&diff).unwrap_err(),
        Error::LineageMismatch
    );
    assert!(diff.is_available());
}

// ============================================================================
// Replace By Source Edge Cases
// ============================================================================

#[test]
fn replacing_from_own_base_changes_nothing() {
    let s = create_test_schema(EngineConfig::default());
    let mut builder = s.root.builder();
    let core = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::new("maven"))
        .unwrap();
    let src = builder
        .create_record(s.content_root, fields! { "url" => "file://core" }, Origin::new("maven"))
        .unwrap();
    builder.set_relation(&s.roots, src, core).unwrap();
    let base = builder.seal().unwrap();

    let mut builder = base.builder();
    let report = builder.replace_by_source(&base, |_| true).unwrap();

    assert!(report.is_empty());
    assert!(!builder.has_changes());
}

#[test]
fn refused_removal_leaves_builder_untouched() {
    let s = create_test_schema(EngineConfig::default().with_removal_policy(RemovalPolicy::Reject));
    let mut builder = s.root.builder();
    let core = builder
        .create_record(s.module, fields! { "name" => "core" }, Origin::new("maven"))
        .unwrap();
    let src = builder
        .create_record(s.content_root, fields! { "url" => "file://core" }, Origin::new("user"))
        .unwrap();
    builder.set_relation(&s.roots, src, core).unwrap();
    let base = builder.seal().unwrap();

    let mut builder = base.builder();
    let err = builder
        .replace_by_source(&s.root, |origin| origin.as_str() == "maven")
        .unwrap_err();

    assert_eq!(
        err,
        Error::RemovalRejected {
            handle: core,
            dependents: 1,
        }
    );
    assert!(builder.changes().is_empty());
    assert!(builder.get(core).is_ok());
}
