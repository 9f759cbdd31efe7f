use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use tablekit::prelude::*;

fn rename_field(mut old: TabularState) -> Result<TabularState, MigrationError> {
    let items = old
        .take("items")
        .into_iter()
        .map(|r| {
            r.map(|v| {
                json!({
                    "name": v["title"],
                    "category": v["category"],
                })
            })
        })
        .collect();
    Ok(TabularState::new().with_table("items", items))
}

fn identity(state: TabularState) -> Result<TabularState, MigrationError> {
    Ok(state)
}

fn models() -> (SchemaModel, SchemaModel) {
    let v1 = SchemaModel::create([(
        "items",
        TableDefinition::keyed([("title", Column::plain()), ("category", Column::indexed())]),
    )]);
    let v2 = v1.next(
        [(
            "items",
            TableDefinition::keyed([("name", Column::unique()), ("category", Column::indexed())]),
        )],
        rename_field,
    );
    (v1, v2)
}

fn state(records: u64) -> TabularState {
    let items = (1..=records)
        .map(|i| Record::new(i, json!({ "title": format!("item-{i}"), "category": i % 10 })))
        .collect();
    TabularState::new().with_table("items", items)
}

fn bench_evaluate(c: &mut Criterion) {
    let (_, v2) = models();
    let input = state(1000);

    c.bench_function("evaluate_from_old_version 1 step x1000 records", |b| {
        b.iter_batched(
            || input.clone(),
            |s| black_box(tablekit::evaluate_from_old_version(&v2, 1, s).map(|s| s.record_count())),
            BatchSize::SmallInput,
        )
    });

    let mut long = SchemaModel::create([("items", TableDefinition::auto_keyed())]);
    for _ in 0..20 {
        long = long.extend(Vec::<(String, TableDefinition)>::new(), identity);
    }
    let small = state(100);
    c.bench_function("evaluate_from_old_version 20 steps x100 records", |b| {
        b.iter_batched(
            || small.clone(),
            |s| black_box(tablekit::evaluate_from_old_version(&long, 1, s).map(|s| s.len())),
            BatchSize::SmallInput,
        )
    });
}

fn bench_upgrade(c: &mut Criterion) {
    let (v1, v2) = models();

    c.bench_function("Database::open upgrade x1000 records", |b| {
        b.iter_batched(
            || {
                let engine = MemoryEngine::new();
                let db = Database::open(&engine, "bench", v1.clone()).unwrap_or_else(|e| panic!("{e}"));
                for i in 0..1000u64 {
                    let item = json!({ "title": format!("item-{i}"), "category": i % 10 });
                    db.add("items", &item).unwrap_or_else(|e| panic!("{e}"));
                }
                engine
            },
            |engine| {
                let db = Database::open(&engine, "bench", v2.clone()).unwrap_or_else(|e| panic!("{e}"));
                black_box(db.outcome().clone())
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_table_ops(c: &mut Criterion) {
    let (_, v2) = models();
    let db = Database::open(&MemoryEngine::new(), "bench", v2).unwrap_or_else(|e| panic!("{e}"));
    for i in 0..1000u64 {
        let item = json!({ "name": format!("item-{i}"), "category": i % 10 });
        db.add("items", &item).unwrap_or_else(|e| panic!("{e}"));
    }

    c.bench_function("Database::get_by unique index", |b| {
        b.iter(|| {
            let found: Option<serde_json::Value> = db.get_by("items", "name", "item-500").unwrap_or(None);
            black_box(found)
        })
    });

    c.bench_function("Database::get_all_by 100 matches", |b| {
        b.iter(|| {
            let found: Vec<serde_json::Value> = db.get_all_by("items", "category", &3).unwrap_or_default();
            black_box(found.len())
        })
    });

    let _listener = db.subscribe(|table| {
        black_box(table);
    });
    c.bench_function("Database::put with one listener", |b| {
        let item = json!({ "name": "hot", "category": 1 });
        b.iter(|| black_box(db.put("items", Some(Key::Number(2)), &item).ok()))
    });
}

criterion_group!(benches, bench_evaluate, bench_upgrade, bench_table_ops);
criterion_main!(benches);
