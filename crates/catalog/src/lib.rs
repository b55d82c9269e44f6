//! The database object hierarchy: catalogue → schema → entity → column,
//! with indexes attached to entities.
//!
//! # Architecture
//!
//! ```text
//! Catalogue (root directory, catalogue.db)
//!     └── Schema (directory, index.db)
//!             └── Entity (directory, index.db, one file per column,
//!                         one directory per index)
//! ```
//!
//! Every object carries a close lock that keeps teardown from racing
//! in-flight transactions, and exposes a transactional view (`new_tx`).
//! Structural mutations take an exclusive logical lock, apply their
//! forward effect immediately, and queue a durable post-commit action
//! plus a reversing post-rollback action on the transaction, so a failed
//! or abandoned mutation always resolves to the pre-transaction state on
//! disk. Dropped schemas and entities are renamed to a shadow directory:
//! commit deletes the shadow, rollback restores the name.


mod entity;
pub mod predicate;
mod schema;

pub use entity::{Entity, EntityColumn, EntityStatistics, EntityTx, IndexEntry};
pub use schema::{Schema, SchemaTx};

use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{Config, DbError, DbResult, EntityName, SchemaName};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use txn::{CloseGuard, CloseLock, LockMode, TransactionContext, TransactionManager};

const CATALOGUE_FILE: &str = "catalogue.db";
const CATALOGUE_LOCK_KEY: &str = "warren";

/// Little-endian, fixed-width bincode for every catalogue artifact.
pub(crate) fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

pub(crate) fn shadow_name(name: &str) -> String {
    format!("~{name}~dropped")
}

/// The root namespace, bound to one directory on disk.
pub struct Catalogue {
    root: PathBuf,
    config: Config,
    txns: Arc<TransactionManager>,
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
    close_lock: Arc<CloseLock>,
}

impl Catalogue {
    /// Open (or initialize) the catalogue rooted at `config.data_dir`.
    pub fn open(config: Config) -> DbResult<Arc<Catalogue>> {
        let root = config.data_dir.clone();
        std::fs::create_dir_all(&root)?;
        let txns = Arc::new(TransactionManager::new(config.lock_timeout));

        let mut schemas = HashMap::new();
        let file = root.join(CATALOGUE_FILE);
        if file.exists() {
            let bytes = std::fs::read(&file)?;
            let (entries, _): (Vec<(String, String)>, _) =
                decode_from_slice(&bytes, bincode_config()).map_err(|e| {
                    DbError::DataCorruption(format!("catalogue file unreadable: {e}"))
                })?;
            for (name, dir) in entries {
                let schema = Schema::open(SchemaName::new(&name), root.join(&dir), &config)?;
                schemas.insert(name, schema);
            }
        }

        let catalogue = Arc::new(Catalogue {
            root,
            config,
            txns,
            schemas: RwLock::new(schemas),
            close_lock: CloseLock::new(),
        });
        catalogue.persist()?;
        info!(root = %catalogue.root.display(), schemas = catalogue.schemas.read().len(), "catalogue opened");
        Ok(catalogue)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    /// Write `catalogue.db` from the live registry.
    pub(crate) fn persist(&self) -> DbResult<()> {
        let entries: Vec<(String, String)> = self
            .schemas
            .read()
            .keys()
            .map(|name| (name.clone(), name.clone()))
            .collect();
        let bytes = encode_to_vec(&entries, bincode_config())
            .map_err(|e| DbError::DataCorruption(format!("catalogue encode failed: {e}")))?;
        std::fs::write(self.root.join(CATALOGUE_FILE), bytes)?;
        Ok(())
    }

    /// Transactional view over the catalogue.
    pub fn new_tx(self: &Arc<Self>, ctx: Arc<TransactionContext>) -> DbResult<CatalogueTx> {
        ctx.check_open()?;
        let guard = self.close_lock.acquire(CATALOGUE_LOCK_KEY)?;
        Ok(CatalogueTx {
            catalogue: Arc::clone(self),
            ctx,
            _guard: guard,
        })
    }

    /// Resolve a schema outside any transaction (engine plumbing).
    pub fn schema(&self, name: &SchemaName) -> DbResult<Arc<Schema>> {
        self.schemas
            .read()
            .get(name.simple())
            .cloned()
            .ok_or_else(|| DbError::SchemaDoesNotExist(name.to_string()))
    }

    /// Resolve an entity by qualified name (engine plumbing).
    pub fn entity(&self, name: &EntityName) -> DbResult<Arc<Entity>> {
        self.schema(&name.schema)?.entity_by_name(name.simple())
    }

    /// Close every schema and release the root. Waits for in-flight
    /// transactions up to the configured lock timeout.
    pub fn close(&self) -> DbResult<()> {
        self.close_lock
            .close(CATALOGUE_LOCK_KEY, self.config.lock_timeout)?;
        for schema in self.schemas.read().values() {
            schema.close()?;
        }
        info!(root = %self.root.display(), "catalogue closed");
        Ok(())
    }
}

/// Transactional view of the catalogue: schema listing and DDL.
pub struct CatalogueTx {
    catalogue: Arc<Catalogue>,
    ctx: Arc<TransactionContext>,
    _guard: CloseGuard,
}

impl CatalogueTx {
    pub fn list_schemas(&self) -> Vec<SchemaName> {
        self.catalogue
            .schemas
            .read()
            .values()
            .map(|s| s.name().clone())
            .collect()
    }

    pub fn schema(&self, name: &SchemaName) -> DbResult<Arc<Schema>> {
        self.ctx.mark_read()?;
        self.catalogue.schema(name)
    }

    /// Create a schema. The directory appears immediately; `catalogue.db`
    /// is rewritten on commit, and rollback removes both the registry
    /// entry and the directory.
    pub fn create_schema(&self, name: &SchemaName) -> DbResult<Arc<Schema>> {
        self.ctx.mark_dirty()?;
        self.ctx
            .request_lock(CATALOGUE_LOCK_KEY, LockMode::Exclusive)?;

        if self.catalogue.schemas.read().contains_key(name.simple()) {
            return Err(DbError::SchemaAlreadyExists(name.to_string()));
        }
        let path = self.catalogue.root.join(name.simple());
        let schema = Schema::create(name.clone(), path.clone(), &self.catalogue.config)?;
        self.catalogue
            .schemas
            .write()
            .insert(name.simple().to_string(), Arc::clone(&schema));
        debug!(schema = %name, "schema created");

        let cat = Arc::clone(&self.catalogue);
        self.ctx.on_commit(Box::new(move || cat.persist()));

        let cat = Arc::clone(&self.catalogue);
        let simple = name.simple().to_string();
        self.ctx.on_rollback(Box::new(move || {
            cat.schemas.write().remove(&simple);
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            Ok(())
        }));
        Ok(schema)
    }

    /// Drop a schema: the directory is renamed to a shadow name, commit
    /// deletes the shadow, rollback restores it.
    pub fn drop_schema(&self, name: &SchemaName) -> DbResult<()> {
        self.ctx.mark_dirty()?;
        self.ctx
            .request_lock(CATALOGUE_LOCK_KEY, LockMode::Exclusive)?;
        self.ctx.request_lock(&name.to_string(), LockMode::Exclusive)?;

        let schema = self
            .catalogue
            .schemas
            .write()
            .remove(name.simple())
            .ok_or_else(|| DbError::SchemaDoesNotExist(name.to_string()))?;

        let live = self.catalogue.root.join(name.simple());
        let shadow = self.catalogue.root.join(shadow_name(name.simple()));
        std::fs::rename(&live, &shadow)?;
        debug!(schema = %name, "schema moved to shadow for drop");

        let cat = Arc::clone(&self.catalogue);
        let committed_schema = Arc::clone(&schema);
        let committed_shadow = shadow.clone();
        self.ctx.on_commit(Box::new(move || {
            committed_schema.close()?;
            std::fs::remove_dir_all(&committed_shadow)?;
            cat.persist()
        }));

        let cat = Arc::clone(&self.catalogue);
        let simple = name.simple().to_string();
        self.ctx.on_rollback(Box::new(move || {
            std::fs::rename(&shadow, &live)?;
            cat.schemas.write().insert(simple, schema);
            Ok(())
        }));
        Ok(())
    }
}
