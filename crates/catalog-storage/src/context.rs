use crate::blob_cache::{blob_cache_descriptor, BlobCache};
use crate::config::StorageConfig;
use crate::db::SynchronizedDb;
use crate::error::{Result, StoreError};
use crate::store::StoreDescriptor;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Catalog,
    Covers,
    Thumbnails,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [StoreKind::Catalog, StoreKind::Covers, StoreKind::Thumbnails];

    fn slot(self) -> usize {
        match self {
            StoreKind::Catalog => 0,
            StoreKind::Covers => 1,
            StoreKind::Thumbnails => 2,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Catalog => f.write_str("catalog"),
            StoreKind::Covers => f.write_str("covers"),
            StoreKind::Thumbnails => f.write_str("thumbnails"),
        }
    }
}

const SIDE_FILE_SUFFIXES: [&str; 4] = ["", "-journal", "-wal", "-shm"];

/// Opens each store on first use and hands out the same handle afterwards.
///
/// Construct one per process and pass it to whatever needs storage; tests
/// build their own, optionally with [`StorageContext::inject`]ed handles.
pub struct StorageContext {
    config: StorageConfig,
    descriptors: [StoreDescriptor; 3],
    slots: [RwLock<Option<SynchronizedDb>>; 3],
}

impl StorageContext {
    /// `catalog` describes the primary store; the two blob caches use the
    /// built-in image layout.
    pub fn new(config: StorageConfig, catalog: StoreDescriptor) -> Self {
        let covers = blob_cache_descriptor("covers", &config.covers_file);
        let thumbnails = blob_cache_descriptor("thumbnails", &config.thumbnails_file);
        let catalog = StoreDescriptor {
            file_name: config.catalog_file.clone(),
            ..catalog
        };
        Self {
            config,
            descriptors: [catalog, covers, thumbnails],
            slots: Default::default(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn descriptor(&self, kind: StoreKind) -> &StoreDescriptor {
        &self.descriptors[kind.slot()]
    }

    pub fn store(&self, kind: StoreKind) -> Result<SynchronizedDb> {
        let slot = &self.slots[kind.slot()];
        if let Some(db) = slot.read().expect("store slot poisoned").as_ref() {
            return Ok(db.clone());
        }

        let mut guard = slot.write().expect("store slot poisoned");
        if let Some(db) = guard.as_ref() {
            return Ok(db.clone());
        }
        let db = SynchronizedDb::open(self.descriptor(kind), &self.config)?;
        *guard = Some(db.clone());
        Ok(db)
    }

    pub fn catalog(&self) -> Result<SynchronizedDb> {
        self.store(StoreKind::Catalog)
    }

    pub fn covers(&self) -> Result<SynchronizedDb> {
        self.store(StoreKind::Covers)
    }

    pub fn thumbnails(&self) -> Result<SynchronizedDb> {
        self.store(StoreKind::Thumbnails)
    }

    /// A new statement owner over the `kind` blob cache. Only meaningful for
    /// [`StoreKind::Covers`] and [`StoreKind::Thumbnails`].
    pub fn blob_cache(&self, kind: StoreKind) -> Result<BlobCache> {
        Ok(BlobCache::new(self.store(kind)?, kind.to_string()))
    }

    /// Use `db` for `kind` instead of opening it. Only valid before the store
    /// has been used.
    pub fn inject(&self, kind: StoreKind, db: SynchronizedDb) -> Result<()> {
        let mut guard = self.slots[kind.slot()]
            .write()
            .expect("store slot poisoned");
        if guard.is_some() {
            return Err(StoreError::AlreadyInitialized(kind));
        }
        *guard = Some(db);
        Ok(())
    }

    pub fn is_open(&self, kind: StoreKind) -> bool {
        self.slots[kind.slot()]
            .read()
            .expect("store slot poisoned")
            .is_some()
    }

    /// Forget every open handle and delete every store file, including
    /// journal and WAL side files. Files that do not exist are skipped.
    ///
    /// Returns the paths that were removed. Handles cloned out earlier stay
    /// usable but point at unlinked files.
    pub fn delete_all_stores(&self) -> Result<Vec<PathBuf>> {
        for slot in &self.slots {
            slot.write().expect("store slot poisoned").take();
        }

        let mut removed = Vec::new();
        for kind in StoreKind::ALL {
            let Some(path) = self.config.store_path(&self.descriptor(kind).file_name) else {
                continue;
            };
            for suffix in SIDE_FILE_SUFFIXES {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                let file = PathBuf::from(file);
                match std::fs::remove_file(&file) {
                    Ok(()) => removed.push(file),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        log::info!("deleted {} store file(s)", removed.len());
        Ok(removed)
    }
}

impl fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContext")
            .field("config", &self.config)
            .finish()
    }
}
