use catalog_storage::{
    ColumnDef, ColumnType, Cursor, StorageConfig, StorageContext, StoreDescriptor, StoreError,
    StoreKind, SynchronizedDb, TableDefinition, VersionedSchema,
};
use rusqlite::types::Value;
use std::fs;

fn catalog_descriptor() -> StoreDescriptor {
    let books = TableDefinition::new("books")
        .with_column(ColumnDef::new("_id", ColumnType::Integer).autoincrement())
        .with_column(ColumnDef::new("title", ColumnType::Text).not_null());
    StoreDescriptor::new("catalog", "ignored.db", 1, VersionedSchema::new().table(books))
}

fn book_count(db: &SynchronizedDb) -> i64 {
    let mut cursor = db
        .raw_query("SELECT COUNT(*) AS n FROM books", &[])
        .expect("count");
    assert!(cursor.move_to_first());
    cursor.row().get_long("n").expect("n")
}

#[test]
fn each_store_is_opened_once() {
    let ctx = StorageContext::new(StorageConfig::default(), catalog_descriptor());
    assert!(!ctx.is_open(StoreKind::Catalog));

    let first = ctx.catalog().expect("catalog");
    let second = ctx.catalog().expect("catalog again");
    assert!(first.same_store(&second));
    assert!(ctx.is_open(StoreKind::Catalog));

    let covers = ctx.covers().expect("covers");
    let thumbnails = ctx.thumbnails().expect("thumbnails");
    assert!(!covers.same_store(&thumbnails));
    assert!(!covers.same_store(&first));
    assert_eq!(covers.name(), "covers");
    assert_eq!(ctx.descriptor(StoreKind::Catalog).file_name, "catalog.db");
}

#[test]
fn concurrent_first_use_opens_one_handle() {
    let ctx = std::sync::Arc::new(StorageContext::new(
        StorageConfig::default(),
        catalog_descriptor(),
    ));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let ctx = std::sync::Arc::clone(&ctx);
            std::thread::spawn(move || ctx.thumbnails().expect("thumbnails"))
        })
        .collect();
    let stores: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();
    assert!(stores.iter().all(|db| db.same_store(&stores[0])));
}

#[test]
fn injected_handles_replace_opening() {
    let ctx = StorageContext::new(StorageConfig::default(), catalog_descriptor());
    let substitute =
        SynchronizedDb::open_in_memory(&catalog_descriptor()).expect("substitute store");
    substitute
        .insert("books", &[("title", Value::Text("Kindred".into()))])
        .expect("insert");

    ctx.inject(StoreKind::Catalog, substitute.clone())
        .expect("inject before use");
    let catalog = ctx.catalog().expect("catalog");
    assert!(catalog.same_store(&substitute));
    assert_eq!(book_count(&catalog), 1);

    let err = ctx
        .inject(StoreKind::Catalog, substitute)
        .expect_err("already in use");
    assert!(matches!(
        err,
        StoreError::AlreadyInitialized(StoreKind::Catalog)
    ));
}

#[test]
fn deleting_all_stores_removes_their_files() {
    let dir = tempfile::tempdir().expect("temp dir");
    let ctx = StorageContext::new(StorageConfig::in_dir(dir.path()), catalog_descriptor());

    ctx.catalog()
        .expect("catalog")
        .insert("books", &[("title", Value::Text("Beloved".into()))])
        .expect("insert");
    let covers = ctx.blob_cache(StoreKind::Covers).expect("covers cache");
    covers.put("cover:1", b"jpeg").expect("put");
    covers.close();
    drop(covers);
    ctx.thumbnails().expect("thumbnails");

    let mut removed = ctx.delete_all_stores().expect("delete");
    removed.sort();
    let mut expected = vec![
        dir.path().join("catalog.db"),
        dir.path().join("covers.db"),
        dir.path().join("thumbnails.db"),
    ];
    expected.sort();
    assert_eq!(removed, expected);
    for path in &expected {
        assert!(!path.exists());
    }
    for kind in StoreKind::ALL {
        assert!(!ctx.is_open(kind));
    }

    assert!(ctx.delete_all_stores().expect("delete again").is_empty());

    let catalog = ctx.catalog().expect("reopen catalog");
    assert_eq!(book_count(&catalog), 0);
    assert!(dir.path().join("catalog.db").exists());
}

#[test]
fn config_file_chooses_locations() {
    let dir = tempfile::tempdir().expect("temp dir");
    let stores = dir.path().join("stores");
    let config_path = dir.path().join("storage.json");
    fs::write(
        &config_path,
        serde_json::json!({
            "base_dir": stores,
            "catalog_file": "books.db",
            "lock_timeout_ms": 250,
        })
        .to_string(),
    )
    .expect("write config");

    let config = StorageConfig::from_path(&config_path).expect("load config");
    assert_eq!(config.covers_file, "covers.db");
    assert_eq!(config.busy_timeout_ms, 5_000);

    let ctx = StorageContext::new(config, catalog_descriptor());
    let catalog = ctx.catalog().expect("catalog");
    assert_eq!(catalog.path(), Some(stores.join("books.db").as_path()));
    assert!(stores.join("books.db").exists());
}

#[test]
fn malformed_config_is_rejected() {
    let err = StorageConfig::from_json_str("{\"busy_timeout_ms\": \"soon\"}")
        .expect_err("wrong type");
    assert!(matches!(err, StoreError::Json(_)));
}
