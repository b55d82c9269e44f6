//! Schemas: named namespaces of entities, one directory each with an
//! `index.db` listing the member entities.

use crate::entity::Entity;
use crate::{bincode_config, shadow_name};
use bincode::serde::{decode_from_slice, encode_to_vec};
use column::ColumnDef;
use common::{Config, DbError, DbResult, EntityName, SchemaName};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use txn::{CloseGuard, CloseLock, LockMode, TransactionContext};

const SCHEMA_FILE: &str = "index.db";

pub struct Schema {
    name: SchemaName,
    path: PathBuf,
    config: Config,
    entities: RwLock<HashMap<String, Arc<Entity>>>,
    close_lock: Arc<CloseLock>,
}

impl Schema {
    pub(crate) fn create(name: SchemaName, path: PathBuf, config: &Config) -> DbResult<Arc<Schema>> {
        std::fs::create_dir_all(&path)?;
        let schema = Arc::new(Schema {
            name,
            path,
            config: config.clone(),
            entities: RwLock::new(HashMap::new()),
            close_lock: CloseLock::new(),
        });
        schema.persist()?;
        Ok(schema)
    }

    pub(crate) fn open(name: SchemaName, path: PathBuf, config: &Config) -> DbResult<Arc<Schema>> {
        let file = path.join(SCHEMA_FILE);
        let bytes = std::fs::read(&file)?;
        let (entries, _): (Vec<(String, String)>, _) = decode_from_slice(&bytes, bincode_config())
            .map_err(|e| {
                DbError::DataCorruption(format!("schema file '{}' unreadable: {e}", file.display()))
            })?;

        let mut entities = HashMap::new();
        for (entity_name, dir) in entries {
            let entity = Entity::open(name.entity(&entity_name), path.join(&dir), config)?;
            entities.insert(entity_name, entity);
        }
        Ok(Arc::new(Schema {
            name,
            path,
            config: config.clone(),
            entities: RwLock::new(entities),
            close_lock: CloseLock::new(),
        }))
    }

    pub fn name(&self) -> &SchemaName {
        &self.name
    }

    /// Write `index.db` from the live entity registry.
    pub(crate) fn persist(&self) -> DbResult<()> {
        let entries: Vec<(String, String)> = self
            .entities
            .read()
            .keys()
            .map(|name| (name.clone(), name.clone()))
            .collect();
        let bytes = encode_to_vec(&entries, bincode_config())
            .map_err(|e| DbError::DataCorruption(format!("schema encode failed: {e}")))?;
        std::fs::write(self.path.join(SCHEMA_FILE), bytes)?;
        Ok(())
    }

    pub(crate) fn entity_by_name(&self, simple: &str) -> DbResult<Arc<Entity>> {
        self.entities.read().get(simple).cloned().ok_or_else(|| {
            DbError::EntityDoesNotExist(self.name.entity(simple).to_string())
        })
    }

    /// Transactional view over this schema.
    pub fn new_tx(self: &Arc<Self>, ctx: Arc<TransactionContext>) -> DbResult<SchemaTx> {
        ctx.check_open()?;
        let guard = self.close_lock.acquire(&self.name.to_string())?;
        Ok(SchemaTx {
            schema: Arc::clone(self),
            ctx,
            _guard: guard,
        })
    }

    pub(crate) fn close(&self) -> DbResult<()> {
        self.close_lock
            .close(&self.name.to_string(), self.config.lock_timeout)?;
        for entity in self.entities.read().values() {
            entity.close()?;
        }
        Ok(())
    }
}

/// Transactional view of a schema: entity listing and DDL.
pub struct SchemaTx {
    schema: Arc<Schema>,
    ctx: Arc<TransactionContext>,
    _guard: CloseGuard,
}

impl SchemaTx {
    pub fn list_entities(&self) -> Vec<EntityName> {
        self.schema
            .entities
            .read()
            .values()
            .map(|e| e.name().clone())
            .collect()
    }

    pub fn entity(&self, simple: &str) -> DbResult<Arc<Entity>> {
        self.ctx.mark_read()?;
        self.schema.entity_by_name(simple)
    }

    /// Create an entity with the given columns. Column files appear
    /// immediately; the schema's `index.db` is rewritten on commit and the
    /// whole entity directory is removed on rollback, restoring the
    /// pre-transaction state bit for bit.
    pub fn create_entity(&self, simple: &str, columns: Vec<ColumnDef>) -> DbResult<Arc<Entity>> {
        self.ctx.mark_dirty()?;
        let name = self.schema.name.entity(simple);
        self.ctx
            .request_lock(&self.schema.name.to_string(), LockMode::Exclusive)?;

        if columns.is_empty() {
            return Err(DbError::QueryBind(format!(
                "entity '{name}' needs at least one column"
            )));
        }
        let mut seen = HashSet::new();
        for def in &columns {
            if !seen.insert(def.name.clone()) {
                return Err(DbError::DuplicateColumn(name.column(&def.name).to_string()));
            }
        }
        if self.schema.entities.read().contains_key(&name.name) {
            return Err(DbError::EntityAlreadyExists(name.to_string()));
        }

        let path = self.schema.path.join(&name.name);
        let entity = Entity::create(name.clone(), path.clone(), columns, self.config())?;
        self.schema
            .entities
            .write()
            .insert(name.name.clone(), Arc::clone(&entity));
        debug!(entity = %name, "entity created");

        let schema = Arc::clone(&self.schema);
        self.ctx.on_commit(Box::new(move || schema.persist()));

        let schema = Arc::clone(&self.schema);
        let simple_owned = name.name.clone();
        self.ctx.on_rollback(Box::new(move || {
            if let Some(entity) = schema.entities.write().remove(&simple_owned) {
                let _ = entity.close();
            }
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            Ok(())
        }));
        Ok(entity)
    }

    /// Drop an entity via the shadow-rename protocol.
    pub fn drop_entity(&self, simple: &str) -> DbResult<()> {
        self.ctx.mark_dirty()?;
        let name = self.schema.name.entity(simple);
        self.ctx
            .request_lock(&self.schema.name.to_string(), LockMode::Exclusive)?;
        self.ctx.request_lock(&name.to_string(), LockMode::Exclusive)?;

        let entity = self
            .schema
            .entities
            .write()
            .remove(simple)
            .ok_or_else(|| DbError::EntityDoesNotExist(name.to_string()))?;

        let live = self.schema.path.join(simple);
        let shadow = self.schema.path.join(shadow_name(simple));
        std::fs::rename(&live, &shadow)?;
        debug!(entity = %name, "entity moved to shadow for drop");

        let schema = Arc::clone(&self.schema);
        let committed_entity = Arc::clone(&entity);
        let committed_shadow = shadow.clone();
        self.ctx.on_commit(Box::new(move || {
            committed_entity.close()?;
            std::fs::remove_dir_all(&committed_shadow)?;
            schema.persist()
        }));

        let schema = Arc::clone(&self.schema);
        let simple_owned = simple.to_string();
        self.ctx.on_rollback(Box::new(move || {
            std::fs::rename(&shadow, &live)?;
            schema.entities.write().insert(simple_owned, entity);
            Ok(())
        }));
        Ok(())
    }

    fn config(&self) -> &Config {
        &self.schema.config
    }
}
