use catalog_storage::{
    ColumnDef, ColumnType, ColumnValue, Cursor, StoreDescriptor, StoreError, SynchronizedDb,
    TableDefinition, VersionedSchema,
};
use rusqlite::types::Value;
use serde_json::json;

fn open_authors() -> SynchronizedDb {
    let authors = TableDefinition::new("authors")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).autoincrement())
        .with_column(ColumnDef::new("name", ColumnType::Text))
        .with_column(ColumnDef::new("books", ColumnType::Integer))
        .with_column(ColumnDef::new("rating", ColumnType::Real))
        .with_column(ColumnDef::new("favourite", ColumnType::Boolean))
        .with_column(ColumnDef::new("portrait", ColumnType::Blob));
    let descriptor =
        StoreDescriptor::new("catalog", "catalog.db", 1, VersionedSchema::new().table(authors));
    SynchronizedDb::open_in_memory(&descriptor).expect("open store")
}

#[test]
fn nulls_read_as_documented_defaults() {
    let db = open_authors();
    db.insert("authors", &[]).expect("insert empty author");

    let mut cursor = db
        .raw_query_typed("SELECT * FROM authors", &[], "authors")
        .expect("query");
    assert!(cursor.move_to_first());
    let row = cursor.row();

    assert_eq!(row.get_string("name").expect("name"), "");
    assert_eq!(row.get_string_opt("name").expect("name"), None);
    assert_eq!(row.get_int("books").expect("books"), 0);
    assert_eq!(row.get_long("books").expect("books"), 0);
    assert_eq!(row.get_double("rating").expect("rating"), 0.0);
    assert!(!row.get_bool("favourite").expect("favourite"));
    assert_eq!(row.get_blob("portrait").expect("portrait"), None);
}

#[test]
fn missing_columns_fail_in_every_getter() {
    let db = open_authors();
    db.insert("authors", &[("name", Value::Text("Le Guin".into()))])
        .expect("insert author");

    let mut cursor = db
        .raw_query("SELECT name FROM authors", &[])
        .expect("query");
    assert!(cursor.move_to_first());
    let row = cursor.row();
    assert!(row.contains("name"));
    assert!(!row.contains("books"));

    let missing = "books";
    let results: Vec<Result<(), StoreError>> = vec![
        row.get_string(missing).map(|_| ()),
        row.get_string_opt(missing).map(|_| ()),
        row.get_bool(missing).map(|_| ()),
        row.get_int(missing).map(|_| ()),
        row.get_long(missing).map(|_| ()),
        row.get_double(missing).map(|_| ()),
        row.get_blob(missing).map(|_| ()),
    ];
    for result in results {
        match result {
            Err(StoreError::ColumnNotPresent(column)) => assert_eq!(column, "books"),
            other => panic!("expected ColumnNotPresent, got {other:?}"),
        }
    }
}

#[test]
fn values_are_coerced_between_types() {
    let db = open_authors();
    db.insert(
        "authors",
        &[
            ("name", Value::Text("42".into())),
            ("books", Value::Integer(21)),
            ("rating", Value::Real(4.5)),
            ("favourite", Value::Integer(1)),
            ("portrait", Value::Blob(vec![0x89, 0x50, 0x4e, 0x47])),
        ],
    )
    .expect("insert author");

    let mut cursor = db
        .raw_query("SELECT * FROM authors", &[])
        .expect("query");
    assert!(cursor.move_to_first());
    let row = cursor.row();

    assert_eq!(row.get_int("name").expect("name"), 42);
    assert_eq!(row.get_string("books").expect("books"), "21");
    assert_eq!(row.get_double("books").expect("books"), 21.0);
    assert_eq!(row.get_long("rating").expect("rating"), 4);
    assert!(row.get_bool("favourite").expect("favourite"));
    assert_eq!(
        row.get_blob("portrait").expect("portrait"),
        Some(vec![0x89, 0x50, 0x4e, 0x47])
    );
    // Column lookup is case-insensitive, like the engine's.
    assert_eq!(row.get_long("BOOKS").expect("books"), 21);
}

#[test]
fn export_omits_null_columns() {
    let db = open_authors();
    db.insert(
        "authors",
        &[
            ("name", Value::Text("Lem".into())),
            ("books", Value::Integer(17)),
            ("favourite", Value::Integer(0)),
        ],
    )
    .expect("insert author");

    let mut cursor = db
        .raw_query_typed("SELECT * FROM authors", &[], "authors")
        .expect("query");
    assert!(cursor.move_to_first());
    let row = cursor.row();

    let exported = row.to_map();
    assert_eq!(exported.len(), 4);
    assert_eq!(exported.get("name"), Some(&ColumnValue::Text("Lem".into())));
    assert_eq!(exported.get("books"), Some(&ColumnValue::Integer(17)));
    assert_eq!(exported.get("favourite"), Some(&ColumnValue::Bool(false)));
    assert!(!exported.contains_key("rating"));
    assert!(!exported.contains_key("portrait"));

    assert_eq!(
        row.to_json().expect("json"),
        json!({"_id": 1, "books": 17, "favourite": false, "name": "Lem"})
    );
}

#[test]
fn getters_before_the_first_row_read_defaults() {
    let db = open_authors();
    let cursor = db
        .raw_query("SELECT name FROM authors", &[])
        .expect("query");
    assert_eq!(cursor.row_count(), 0);
    let row = cursor.row();
    assert_eq!(row.get_string("name").expect("name"), "");
    assert!(row.to_map().is_empty());
}
