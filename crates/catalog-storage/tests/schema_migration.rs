use catalog_storage::schema::{ForeignKeyAction, ForeignKeyDef};
use catalog_storage::{
    add_columns, rebuild_table, ColumnDef, ColumnType, Cursor, DefaultValue, DriftPolicy,
    IndexDef, MigrationStep, RebuildOptions, StorageConfig, StoreDescriptor, StoreError,
    SynchronizedDb, TableDefinition, UpgradeStep, VersionedSchema,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

fn source_table() -> TableDefinition {
    TableDefinition::new("shelf")
        .with_column(ColumnDef::new("a", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("b", ColumnType::Text))
        .with_column(ColumnDef::new("c", ColumnType::Text).not_null())
}

fn target_table() -> TableDefinition {
    TableDefinition::new("shelf")
        .with_column(ColumnDef::new("a", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("c", ColumnType::Text).not_null())
        .with_column(
            ColumnDef::new("d", ColumnType::Integer)
                .not_null()
                .default_value(DefaultValue::Integer(0)),
        )
        .with_index(IndexDef::new("c", ["c"]))
}

fn open_shelf() -> SynchronizedDb {
    let descriptor = StoreDescriptor::new(
        "catalog",
        "catalog.db",
        1,
        VersionedSchema::new().table(source_table()),
    );
    let db = SynchronizedDb::open_in_memory(&descriptor).expect("open store");
    for (a, b, c) in [(1, "x", "one"), (2, "y", "two"), (3, "z", "three")] {
        db.execute(
            "INSERT INTO shelf (a, b, c) VALUES (?1, ?2, ?3)",
            params![a, b, c],
        )
        .expect("insert row");
    }
    db
}

fn rows(db: &SynchronizedDb, sql: &str) -> Vec<Vec<Value>> {
    let mut cursor = db.raw_query(sql, &[]).expect("query");
    let mut out = Vec::new();
    while cursor.move_to_next() {
        out.push(
            (0..cursor.column_names().len())
                .map(|i| cursor.value(i).cloned().unwrap_or(Value::Null))
                .collect(),
        );
    }
    out
}

fn column_names(db: &SynchronizedDb, table: &str) -> Vec<String> {
    db.invalidate_table_info(Some(table));
    db.table_info(table).expect("table info").column_names()
}

#[test]
fn rebuild_drops_removed_columns_and_defaults_new_ones() {
    let db = open_shelf();

    let report = rebuild_table(&db, &target_table(), &RebuildOptions::default().remove("b"))
        .expect("rebuild");
    assert_eq!(report.rows_copied, 3);
    assert_eq!(report.copied_columns, vec!["a", "c"]);
    assert_eq!(report.dropped_columns, vec!["b"]);

    assert_eq!(column_names(&db, "shelf"), vec!["a", "c", "d"]);
    assert_eq!(
        rows(&db, "SELECT a, c, d FROM shelf ORDER BY a"),
        vec![
            vec![Value::Integer(1), Value::Text("one".into()), Value::Integer(0)],
            vec![Value::Integer(2), Value::Text("two".into()), Value::Integer(0)],
            vec![Value::Integer(3), Value::Text("three".into()), Value::Integer(0)],
        ]
    );
    assert!(!db.table_exists("copy_of_shelf").expect("exists"));
    assert_eq!(
        rows(
            &db,
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'shelf'"
        ),
        vec![vec![Value::Text("shelf_c".into())]]
    );
    assert!(db.foreign_keys_enabled().expect("foreign keys"));
}

#[test]
fn columns_are_copied_by_name_not_position() {
    let db = open_shelf();
    // Same columns, reversed order.
    let reordered = TableDefinition::new("shelf")
        .with_column(ColumnDef::new("c", ColumnType::Text).not_null())
        .with_column(ColumnDef::new("b", ColumnType::Text))
        .with_column(ColumnDef::new("a", ColumnType::Integer).primary_key());

    rebuild_table(&db, &reordered, &RebuildOptions::default()).expect("rebuild");
    assert_eq!(column_names(&db, "shelf"), vec!["c", "b", "a"]);
    assert_eq!(
        rows(&db, "SELECT c, b, a FROM shelf WHERE a = 2"),
        vec![vec![
            Value::Text("two".into()),
            Value::Text("y".into()),
            Value::Integer(2)
        ]]
    );
}

#[test]
fn renamed_columns_keep_their_values() {
    let db = open_shelf();
    let renamed = TableDefinition::new("shelf")
        .with_column(ColumnDef::new("a", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("label", ColumnType::Text))
        .with_column(ColumnDef::new("c", ColumnType::Text).not_null());

    rebuild_table(&db, &renamed, &RebuildOptions::default().rename("b", "label"))
        .expect("rebuild");
    assert_eq!(
        rows(&db, "SELECT label FROM shelf ORDER BY a"),
        vec![
            vec![Value::Text("x".into())],
            vec![Value::Text("y".into())],
            vec![Value::Text("z".into())],
        ]
    );
}

#[test]
fn unlisted_source_columns_fail_the_rebuild() {
    let db = open_shelf();
    let err = rebuild_table(&db, &target_table(), &RebuildOptions::default())
        .expect_err("b is neither kept nor removed");
    match err {
        StoreError::MigrationFailed { table, step, source } => {
            assert_eq!(table, "shelf");
            assert_eq!(step, MigrationStep::PlanCopy);
            assert!(matches!(*source, StoreError::SchemaDrift { ref columns, .. } if columns == &["b"]));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(column_names(&db, "shelf"), vec!["a", "b", "c"]);

    let report = rebuild_table(
        &db,
        &target_table(),
        &RebuildOptions::default().drift(DriftPolicy::Drop),
    )
    .expect("legacy drop");
    assert_eq!(report.dropped_columns, vec!["b"]);
}

#[test]
fn failed_copy_leaves_the_original_table_intact() {
    let db = open_shelf();
    let impossible = TableDefinition::new("shelf")
        .with_column(ColumnDef::new("a", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("c", ColumnType::Text).not_null())
        .with_column(ColumnDef::new("e", ColumnType::Text).not_null());

    let err = rebuild_table(&db, &impossible, &RebuildOptions::default().remove("b"))
        .expect_err("e has no value to copy");
    assert!(matches!(
        err,
        StoreError::MigrationFailed {
            step: MigrationStep::CopyRows,
            ..
        }
    ));

    assert_eq!(column_names(&db, "shelf"), vec!["a", "b", "c"]);
    assert_eq!(rows(&db, "SELECT a FROM shelf").len(), 3);
    assert!(!db.table_exists("copy_of_shelf").expect("exists"));
    assert!(db.foreign_keys_enabled().expect("foreign keys restored"));
}

#[test]
fn missing_table_fails_at_read_source() {
    let db = open_shelf();
    let err = rebuild_table(
        &db,
        &TableDefinition::new("nowhere")
            .with_column(ColumnDef::new("a", ColumnType::Integer)),
        &RebuildOptions::default(),
    )
    .expect_err("no such table");
    assert!(matches!(
        err,
        StoreError::MigrationFailed {
            step: MigrationStep::ReadSource,
            ..
        }
    ));
}

#[test]
fn rebuild_inside_a_transaction_needs_foreign_keys_off() {
    let db = open_shelf();
    assert!(db.foreign_keys_enabled().expect("foreign keys"));

    let tx = db.begin_transaction(true).expect("begin");
    let err = rebuild_table(&db, &target_table(), &RebuildOptions::default().remove("b"))
        .expect_err("enforcement is on");
    assert!(matches!(
        err,
        StoreError::MigrationFailed {
            step: MigrationStep::DisableForeignKeys,
            ..
        }
    ));
    db.end_transaction(tx).expect("end");

    db.set_foreign_keys(false).expect("disable");
    db.with_transaction(true, |db| {
        rebuild_table(db, &target_table(), &RebuildOptions::default().remove("b"))
    })
    .expect("rebuild inside caller transaction");
    assert_eq!(column_names(&db, "shelf"), vec!["a", "c", "d"]);
    assert!(!db.foreign_keys_enabled().expect("caller keeps its setting"));
}

#[test]
fn foreign_key_violations_abort_the_rebuild() {
    let authors = TableDefinition::new("authors")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key());
    let books = TableDefinition::new("books")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("author", ColumnType::Integer));
    let descriptor = StoreDescriptor::new(
        "catalog",
        "catalog.db",
        1,
        VersionedSchema::new().table(authors).table(books),
    );
    let db = SynchronizedDb::open_in_memory(&descriptor).expect("open store");
    db.insert("authors", &[("_id", Value::Integer(1))]).expect("author");
    db.insert("books", &[("_id", Value::Integer(1)), ("author", Value::Integer(1))])
        .expect("book");
    db.insert("books", &[("_id", Value::Integer(2)), ("author", Value::Integer(99))])
        .expect("orphan book");

    let constrained = TableDefinition::new("books")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("author", ColumnType::Integer))
        .with_foreign_key(
            ForeignKeyDef::new("author", "authors", "_id").on_delete(ForeignKeyAction::Cascade),
        );
    let err = rebuild_table(&db, &constrained, &RebuildOptions::default())
        .expect_err("orphan row violates the new key");
    match err {
        StoreError::MigrationFailed { step, source, .. } => {
            assert_eq!(step, MigrationStep::VerifyForeignKeys);
            assert!(matches!(
                *source,
                StoreError::ForeignKeyViolations { count: 1, .. }
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(rows(&db, "SELECT _id FROM books").len(), 2);

    db.delete("books", Some("author = ?1"), &[Value::Integer(99)])
        .expect("remove orphan");
    rebuild_table(&db, &constrained, &RebuildOptions::default()).expect("rebuild");
    db.delete("authors", None, &[]).expect("delete authors");
    assert!(rows(&db, "SELECT _id FROM books").is_empty());
}

#[test]
fn rebuilding_a_referenced_table_checks_the_tables_that_reference_it() {
    let authors = TableDefinition::new("authors")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key());
    let books = TableDefinition::new("books")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("author", ColumnType::Integer))
        .with_foreign_key(ForeignKeyDef::new("author", "authors", "_id"));
    let descriptor = StoreDescriptor::new(
        "catalog",
        "catalog.db",
        1,
        VersionedSchema::new().table(authors).table(books),
    );
    let db = SynchronizedDb::open_in_memory(&descriptor).expect("open store");
    db.insert("authors", &[("_id", Value::Integer(1))]).expect("author");
    db.insert("books", &[("_id", Value::Integer(1)), ("author", Value::Integer(1))])
        .expect("book");

    // `books` still points at `authors(_id)` after the key column is renamed.
    let renamed_key = TableDefinition::new("authors")
        .with_column(ColumnDef::new("key", ColumnType::Integer).primary_key());
    let err = rebuild_table(&db, &renamed_key, &RebuildOptions::default().rename("_id", "key"))
        .expect_err("books would lose its parent key");
    assert!(matches!(
        err,
        StoreError::MigrationFailed {
            step: MigrationStep::VerifyForeignKeys,
            ..
        }
    ));

    assert_eq!(column_names(&db, "authors"), vec!["_id"]);
    assert!(db.foreign_keys_enabled().expect("foreign keys"));
    db.insert("books", &[("_id", Value::Integer(2)), ("author", Value::Integer(1))])
        .expect("book for an existing author");
    assert!(db
        .insert("books", &[("_id", Value::Integer(3)), ("author", Value::Integer(7))])
        .is_err());
}

#[test]
fn other_writers_never_see_enforcement_off_during_a_rebuild() {
    let parents = TableDefinition::new("parents")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key());
    let children = TableDefinition::new("children")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).autoincrement())
        .with_column(ColumnDef::new("parent", ColumnType::Integer))
        .with_foreign_key(ForeignKeyDef::new("parent", "parents", "_id"));
    let descriptor = StoreDescriptor::new(
        "catalog",
        "catalog.db",
        1,
        VersionedSchema::new()
            .table(source_table())
            .table(parents)
            .table(children),
    );
    let db = SynchronizedDb::open_in_memory(&descriptor).expect("open store");
    db.insert("parents", &[("_id", Value::Integer(1))]).expect("parent");

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = db.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut orphans = 0;
            let mut attempts = 0;
            loop {
                attempts += 1;
                if db.insert("children", &[("parent", Value::Integer(999))]).is_ok() {
                    orphans += 1;
                }
                if stop.load(Ordering::SeqCst) {
                    break (attempts, orphans);
                }
            }
        })
    };

    for _ in 0..200 {
        rebuild_table(&db, &source_table(), &RebuildOptions::default()).expect("rebuild");
    }
    stop.store(true, Ordering::SeqCst);
    let (attempts, orphans) = writer.join().expect("writer thread");

    assert!(attempts > 0);
    assert_eq!(orphans, 0);
    assert!(rows(&db, "SELECT _id FROM children").is_empty());
    assert!(db.foreign_keys_enabled().expect("foreign keys"));
}

#[test]
fn add_columns_skips_existing_ones() {
    let db = open_shelf();
    let added = add_columns(
        &db,
        "shelf",
        &[
            ColumnDef::new("b", ColumnType::Text),
            ColumnDef::new("rank", ColumnType::Integer)
                .not_null()
                .default_value(DefaultValue::Integer(5)),
        ],
    )
    .expect("add columns");
    assert_eq!(added, vec!["rank"]);
    assert_eq!(column_names(&db, "shelf"), vec!["a", "b", "c", "rank"]);
    assert_eq!(
        rows(&db, "SELECT DISTINCT rank FROM shelf"),
        vec![vec![Value::Integer(5)]]
    );
}

fn versioned_descriptor(version: u32) -> StoreDescriptor {
    let schema = VersionedSchema::new()
        .table(if version == 1 { source_table() } else { target_table() })
        .step(
            2,
            UpgradeStep::Rebuild {
                target: target_table(),
                options: RebuildOptions::default().remove("b"),
            },
        )
        .step(
            2,
            UpgradeStep::Execute("UPDATE shelf SET d = a * 10".to_string()),
        );
    StoreDescriptor::new("catalog", "catalog.db", version, schema)
}

#[test]
fn upgrade_runs_steps_when_a_store_is_reopened() {
    let tmp = NamedTempFile::new().expect("tmp file");
    let path = tmp.path();
    let config = StorageConfig::in_dir(path.parent().expect("tmp dir"));
    let descriptor = |version| StoreDescriptor {
        file_name: path
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .into_owned(),
        ..versioned_descriptor(version)
    };

    let db = SynchronizedDb::open(&descriptor(1), &config).expect("open v1");
    assert_eq!(db.user_version().expect("version"), 1);
    db.execute("INSERT INTO shelf (a, b, c) VALUES (7, 'q', 'seven')", [])
        .expect("insert");
    drop(db);

    let db = SynchronizedDb::open(&descriptor(2), &config).expect("open v2");
    assert_eq!(db.user_version().expect("version"), 2);
    assert_eq!(
        rows(&db, "SELECT a, c, d FROM shelf"),
        vec![vec![
            Value::Integer(7),
            Value::Text("seven".into()),
            Value::Integer(70)
        ]]
    );
    assert!(db.foreign_keys_enabled().expect("foreign keys"));
    drop(db);

    let err = SynchronizedDb::open(&descriptor(1), &config).expect_err("downgrade");
    assert!(matches!(
        err,
        StoreError::Downgrade {
            found: 2,
            expected: 1,
            ..
        }
    ));

    let conn = Connection::open(path).expect("open raw db");
    let copies: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'copy_of_%'",
            [],
            |r| r.get(0),
        )
        .expect("count temporary tables");
    assert_eq!(copies, 0);
}
