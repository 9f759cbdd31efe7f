//! The same behavioural suite run against every storage engine.

use serde_json::{json, Value};
use tablekit_migrate::{Key, Record};
use tablekit_store::{
    EngineError, KeyPolicy, MemoryEngine, StorageEngine, StoreHandle, StoreInfo, TxMode,
};

fn open_v1<E: StorageEngine>(engine: &E) -> E::Handle {
    engine
        .open_store("app", Some(1), &mut |editor, old| {
            assert_eq!(old, 0);
            editor.create_table("items", KeyPolicy::AutoIncrement)?;
            editor.create_index("items", "name", true)?;
            editor.create_index("items", "category", false)?;
            editor.create_table("settings", KeyPolicy::CallerKey)
        })
        .unwrap()
}

fn write<H: StoreHandle, R>(
    handle: &H,
    table: &str,
    f: impl FnOnce(&mut dyn tablekit_store::Transaction) -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    handle.transaction(&[table], TxMode::ReadWrite, f)
}

fn all<H: StoreHandle>(handle: &H, table: &str) -> Vec<Record> {
    handle
        .transaction(&[table], TxMode::ReadOnly, |tx| tx.get_all(table))
        .unwrap()
}

fn item(name: &str, category: &str) -> Value {
    json!({ "name": name, "category": category })
}

fn conformance<E: StorageEngine>(engine: &E) {
    let handle = open_v1(engine);
    assert_eq!(handle.version(), 1);
    assert_eq!(handle.table_names().unwrap(), vec!["items", "settings"]);
    assert_eq!(
        engine.list_stores().unwrap(),
        vec![StoreInfo {
            name: "app".into(),
            version: 1
        }]
    );

    // auto-increment keys
    let keys = write(&handle, "items", |tx| {
        Ok(vec![
            tx.add("items", None, item("Ramen", "cooking"))?,
            tx.add("items", None, item("Soap", "cleaning"))?,
            tx.add("items", None, item("Udon", "cooking"))?,
        ])
    })
    .unwrap();
    assert_eq!(keys, vec![Key::Number(1), Key::Number(2), Key::Number(3)]);

    // unique index
    let err = write(&handle, "items", |tx| tx.add("items", None, item("Ramen", "x"))).unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation { .. }));
    assert_eq!(all(&handle, "items").len(), 3);

    // a failed transaction rolls back every write
    let err = write(&handle, "items", |tx| {
        tx.add("items", None, item("Tofu", "cooking"))?;
        tx.add("items", None, item("Soap", "x"))
    })
    .unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation { .. }));
    assert_eq!(all(&handle, "items").len(), 3);

    // put replaces in place and keeps the unique index consistent
    write(&handle, "items", |tx| {
        tx.put("items", Some(&Key::Number(1)), item("Shoyu Ramen", "cooking"))
    })
    .unwrap();
    write(&handle, "items", |tx| tx.add("items", None, item("Ramen", "cooking"))).unwrap();

    // index cursors
    let cooking: Vec<Key> = handle
        .transaction(&["items"], TxMode::ReadOnly, |tx| {
            tx.open_cursor("items", Some(("category", &json!("cooking"))))
        })
        .unwrap()
        .map(|r| r.key)
        .collect();
    assert_eq!(cooking, vec![Key::Number(1), Key::Number(3), Key::Number(4)]);

    let mut cursor = handle
        .transaction(&["items"], TxMode::ReadOnly, |tx| tx.open_cursor("items", None))
        .unwrap();
    assert_eq!(cursor.remaining(), 4);
    assert_eq!(cursor.next().map(|r| r.key), Some(Key::Number(1)));
    cursor.rewind();
    assert_eq!(cursor.count(), 4);

    let err = handle
        .transaction(&["items"], TxMode::ReadOnly, |tx| {
            tx.open_cursor("items", Some(("price", &json!(1))))
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::IndexNotFound { .. }));

    // delete and clear; the sequence survives clear
    write(&handle, "items", |tx| tx.delete("items", &Key::Number(2))).unwrap();
    write(&handle, "items", |tx| tx.delete("items", &Key::Number(99))).unwrap();
    let count = handle
        .transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("items"))
        .unwrap();
    assert_eq!(count, 3);
    write(&handle, "items", |tx| tx.clear("items")).unwrap();
    assert!(all(&handle, "items").is_empty());
    let next = write(&handle, "items", |tx| tx.add("items", None, item("Soba", "cooking"))).unwrap();
    assert_eq!(next, Key::Number(5));

    // caller keys
    let err = write(&handle, "settings", |tx| tx.put("settings", None, json!(1))).unwrap_err();
    assert!(matches!(err, EngineError::MissingKey { .. }));
    let err = write(&handle, "settings", |tx| {
        tx.put("settings", Some(&Key::Number(1)), json!(1))
    })
    .unwrap_err();
    assert!(matches!(err, EngineError::KeyKindMismatch { .. }));
    write(&handle, "settings", |tx| {
        tx.put("settings", Some(&Key::from("theme")), json!("dark"))
    })
    .unwrap();
    let theme = handle
        .transaction(&["settings"], TxMode::ReadOnly, |tx| {
            tx.get("settings", &Key::from("theme"))
        })
        .unwrap();
    assert_eq!(theme, Some(json!("dark")));

    // scope and mode checks
    let err = handle
        .transaction(&["items"], TxMode::ReadOnly, |tx| tx.clear("items"))
        .unwrap_err();
    assert!(matches!(err, EngineError::ReadOnly { .. }));
    let err = handle
        .transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("settings"))
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfScope { .. }));
    let err = handle
        .transaction(&["missing"], TxMode::ReadOnly, |tx| tx.count("missing"))
        .unwrap_err();
    assert!(matches!(err, EngineError::TableNotFound(_)));

    // reopen without a version keeps everything
    handle.close();
    assert!(matches!(
        handle.transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("items")),
        Err(EngineError::Closed)
    ));
    let reopened = engine
        .open_store("app", None, &mut |_, _| panic!("setup must not run"))
        .unwrap();
    assert_eq!(reopened.version(), 1);
    assert_eq!(all(&reopened, "items").len(), 1);

    // versions only move forward
    let err = engine
        .open_store("app", Some(0), &mut |_, _| Ok(()))
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::InvalidVersion(0)));
    reopened.close();

    let upgraded = engine
        .open_store("app", Some(2), &mut |editor, old| {
            assert_eq!(old, 1);
            assert_eq!(editor.table_names()?, vec!["items", "settings"]);
            editor.drop_table("settings")?;
            editor.create_table("tags", KeyPolicy::CallerKey)
        })
        .unwrap();
    assert_eq!(upgraded.table_names().unwrap(), vec!["items", "tags"]);
    upgraded.close();

    let err = engine
        .open_store("app", Some(1), &mut |_, _| Ok(()))
        .err()
        .unwrap();
    assert!(matches!(
        err,
        EngineError::VersionConflict {
            requested: 1,
            existing: 2
        }
    ));

    // a failing setup leaves the store untouched
    let err = engine
        .open_store("app", Some(3), &mut |editor, _| editor.create_table("items", KeyPolicy::AutoIncrement))
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::TableExists(_)));
    assert_eq!(engine.list_stores().unwrap()[0].version, 2);

    // dropping a store closes the handles still open on it
    let live = engine
        .open_store("app", None, &mut |_, _| panic!("setup must not run"))
        .unwrap();
    engine.drop_store("app").unwrap();
    engine.drop_store("app").unwrap();
    assert!(engine.list_stores().unwrap().is_empty());
    assert!(matches!(live.table_names(), Err(EngineError::Closed)));
    assert!(matches!(
        live.transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("items")),
        Err(EngineError::Closed)
    ));

    index_values_keep_json_types(engine);
}

/// `1`, `1.0`, `true` and `"1"` are four different index values.
fn index_values_keep_json_types<E: StorageEngine>(engine: &E) {
    let handle = engine
        .open_store("typed", Some(1), &mut |editor, _| {
            editor.create_table("flags", KeyPolicy::AutoIncrement)?;
            editor.create_index("flags", "flag", true)
        })
        .unwrap();
    write(&handle, "flags", |tx| {
        tx.add("flags", None, json!({ "flag": 1 }))?;
        tx.add("flags", None, json!({ "flag": true }))?;
        tx.add("flags", None, json!({ "flag": 1.0 }))?;
        tx.add("flags", None, json!({ "flag": "1" }))?;
        tx.add("flags", None, json!({ "flag": null }))?;
        tx.add("flags", None, json!({ "flag": null }))
    })
    .unwrap();

    let lookup = |wanted: Value| -> Vec<Key> {
        handle
            .transaction(&["flags"], TxMode::ReadOnly, |tx| {
                tx.open_cursor("flags", Some(("flag", &wanted)))
            })
            .unwrap()
            .map(|r| r.key)
            .collect()
    };
    assert_eq!(lookup(json!(true)), vec![Key::Number(2)]);
    assert_eq!(lookup(json!(1)), vec![Key::Number(1)]);
    assert_eq!(lookup(json!(1.0)), vec![Key::Number(3)]);
    assert_eq!(lookup(json!("1")), vec![Key::Number(4)]);
    assert!(lookup(json!(false)).is_empty());

    let err = write(&handle, "flags", |tx| tx.add("flags", None, json!({ "flag": true }))).unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation { .. }));
    handle.close();
    engine.drop_store("typed").unwrap();
}

#[test]
fn memory_engine() {
    conformance(&MemoryEngine::new());
}

#[cfg(feature = "redb")]
#[test]
fn redb_engine_in_memory() {
    conformance(&tablekit_store::RedbEngine::in_memory());
}

#[cfg(feature = "redb")]
#[test]
fn redb_engine_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    conformance(&tablekit_store::RedbEngine::open(dir.path()).unwrap());
}

#[cfg(feature = "sqlite")]
#[test]
fn sqlite_engine() {
    let dir = tempfile::tempdir().unwrap();
    conformance(&tablekit_store::SqliteEngine::open(dir.path()).unwrap());
}
