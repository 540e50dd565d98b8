//! Performance benchmarks for entity-store

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use entity_store::{
    fields, Cardinality, EngineConfig, EntityType, FieldDef, FieldType, FieldValue, Handle, Origin,
    RelationKind, SchemaRegistry, Snapshot, SymbolicId, TypeId,
};
use std::sync::Arc;

struct Model {
    root: Snapshot,
    module: TypeId,
    content_root: TypeId,
    library: TypeId,
    roots: RelationKind,
}

fn create_model() -> Model {
    let mut registry = SchemaRegistry::new();
    let module = registry
        .register(
            EntityType::new("module")
                .symbolic_key("name")
                .field(FieldDef::optional("dependencies", FieldType::List)),
        )
        .unwrap();
    let content_root = registry
        .register(EntityType::new("content_root").field(FieldDef::required("url", FieldType::String)))
        .unwrap();
    let library = registry
        .register(EntityType::new("library").symbolic_key("name"))
        .unwrap();
    let roots = registry
        .declare_relation(module, content_root, Cardinality::OneToMany, false)
        .unwrap();
    Model {
        root: Snapshot::empty(Arc::new(registry), EngineConfig::default()),
        module,
        content_root,
        library,
        roots,
    }
}

/// `count` modules, each with one content root and a dependency on `lib-0`.
fn populated(model: &Model, count: usize) -> (Snapshot, Vec<Handle>) {
    let mut builder = model.root.builder();
    builder
        .create_record(model.library, fields! { "name" => "lib-0" }, Origin::default())
        .unwrap();
    let modules = (0..count)
        .map(|i| {
            let module = builder
                .create_record(
                    model.module,
                    fields! {
                        "name" => format!("module-{i}"),
                        "dependencies" => vec![FieldValue::from(SymbolicId::new("lib-0"))],
                    },
                    Origin::default(),
                )
                .unwrap();
            let root = builder
                .create_record(
                    model.content_root,
                    fields! { "url" => format!("file://module-{i}") },
                    Origin::default(),
                )
                .unwrap();
            builder.set_relation(&model.roots, root, module).unwrap();
            module
        })
        .collect();
    (builder.seal().unwrap(), modules)
}

fn bench_builder_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("builder_operations");
    let model = create_model();

    group.bench_function("create_record", |b| {
        let mut builder = model.root.builder();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            builder.create_record(
                black_box(model.library),
                fields! { "name" => format!("lib-{id}") },
                Origin::default(),
            )
        })
    });

    for size in [100, 1000, 10000] {
        let (snapshot, modules) = populated(&model, size);
        group.bench_with_input(BenchmarkId::new("modify_and_seal", size), &size, |b, _| {
            b.iter(|| {
                let mut builder = snapshot.builder();
                builder
                    .modify_record(modules[0], |draft| {
                        draft.set("type", "JAVA_MODULE");
                    })
                    .unwrap();
                builder.seal().unwrap()
            })
        });
    }

    group.finish();
}

fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal");
    let model = create_model();

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("populate", size), &size, |b, &size| {
            b.iter(|| populated(&model, black_box(size)))
        });
    }

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    let model = create_model();
    let (snapshot, modules) = populated(&model, 10000);

    group.bench_function("get", |b| b.iter(|| snapshot.get(black_box(modules[5000]))));

    group.bench_function("children", |b| {
        b.iter(|| snapshot.children(&model.roots, black_box(modules[5000])).len())
    });

    group.bench_function("referrers", |b| {
        let key = SymbolicId::new("lib-0");
        b.iter(|| snapshot.referrers(black_box(&key)).count())
    });

    group.bench_function("records_of_type", |b| {
        b.iter(|| snapshot.records(black_box(model.module)).count())
    });

    group.finish();
}

fn bench_rename(c: &mut Criterion) {
    let mut group = c.benchmark_group("rename");
    let model = create_model();

    for size in [100, 1000] {
        let (snapshot, _) = populated(&model, size);
        group.bench_with_input(BenchmarkId::new("rename_shared_ref", size), &size, |b, _| {
            b.iter(|| {
                let mut builder = snapshot.builder();
                builder
                    .rename_symbolic(&SymbolicId::new("lib-0"), &SymbolicId::new("lib-renamed"))
                    .unwrap()
                    .len()
            })
        });
    }

    group.finish();
}

fn bench_composition(c: &mut Criterion) {
    let mut group = c.benchmark_group("composition");
    let model = create_model();
    let (snapshot, modules) = populated(&model, 1000);

    group.bench_function("apply_changes_from", |b| {
        b.iter(|| {
            let mut theirs = snapshot.builder();
            for module in &modules[..100] {
                theirs
                    .modify_record(*module, |draft| {
                        draft.set("group", "org.example");
                    })
                    .unwrap();
            }
            let diff = theirs.detach().unwrap();

            let mut ours = snapshot.builder();
            ours.modify_record(modules[500], |draft| {
                draft.set("type", "JAVA_MODULE");
            })
            .unwrap();
            ours.apply_changes_from(&diff).unwrap();
            ours.seal().unwrap()
        })
    });

    group.finish();
}

fn bench_replace(c: &mut Criterion) {
    let mut group = c.benchmark_group("replace_by_source");
    let model = create_model();

    for count in [100, 1000] {
        let (snapshot, _) = populated(&model, count);
        let (reloaded, _) = populated(&model, count);
        group.bench_with_input(BenchmarkId::new("reload", count), &reloaded, |b, reloaded| {
            b.iter(|| {
                let mut builder = snapshot.builder();
                black_box(builder.replace_by_source(reloaded, |_| true).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_builder_operations,
    bench_seal,
    bench_queries,
    bench_rename,
    bench_composition,
    bench_replace,
);
criterion_main!(benches);
