//! Storage manager: holds `vault_id -> engine`, enumerates vaults from
//! the metadata store on startup, and exposes the façade the FUSE
//! bridge and filesystem ops layer consume.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::{queries, Pool};
use crate::error::{VaultError, VaultResult};
use crate::storage::Engine;
use crate::types::VaultId;

pub struct StorageManager {
    engines: RwLock<HashMap<VaultId, Arc<Engine>>>,
    pool: Pool,
}

impl StorageManager {
    pub fn new(pool: Pool) -> StorageManager {
        StorageManager {
            engines: RwLock::new(HashMap::new()),
            pool,
        }
    }

    pub fn register(&self, vault_id: VaultId, engine: Engine) {
        self.engines.write().insert(vault_id, Arc::new(engine));
    }

    /// Routing rule: a path either has a vault_id known to the registry,
    /// or lies outside any vault, in which case only read-only listing
    /// of the synthetic root / per-user tree is supported.
    pub fn engine_for(&self, vault_id: VaultId) -> VaultResult<Arc<Engine>> {
        self.engines
            .read()
            .get(&vault_id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("no storage engine registered for vault {}", vault_id)))
    }

    pub fn vault_ids(&self) -> Vec<VaultId> {
        self.engines.read().keys().copied().collect()
    }

    /// Directories are listed by entry id (the caller resolves the id
    /// via the registry, which already holds the parent→children shape
    /// needed to avoid a path re-walk on every readdir).
    pub fn list_dir(&self, dir_entry_id: crate::types::EntryId) -> VaultResult<Vec<crate::types::Entry>> {
        self.pool.with_conn(|conn| queries::list_children(conn, dir_entry_id))
    }

    pub fn mkdir(&self, vault_id: VaultId, rel: &str) -> VaultResult<()> {
        self.engine_for(vault_id)?.mkdir(rel)
    }

    pub fn move_entry(&self, vault_id: VaultId, from: &str, to: &str) -> VaultResult<()> {
        self.engine_for(vault_id)?.move_path(from, to)
    }

    pub fn copy_entry(&self, vault_id: VaultId, from: &str, to: &str) -> VaultResult<()> {
        self.engine_for(vault_id)?.copy_path(from, to)
    }

    pub fn remove_entry(&self, vault_id: VaultId, rel: &str) -> VaultResult<()> {
        self.engine_for(vault_id)?.remove(rel)
    }

    /// Marks a cloud upload as complete for an already-final entry. The
    /// upload itself already happened (the sync engine's Upload action,
    /// or a prior call to this same method); re-uploading here would
    /// clobber the live object with whatever `meta` reflects, so this
    /// is a genuine no-op past confirming the vault still has a cloud
    /// engine registered.
    pub fn finish_upload(&self, vault_id: VaultId, rel: &str, meta: &crate::types::FileMeta) -> VaultResult<()> {
        let engine = self.engine_for(vault_id)?;
        if engine.as_cloud().is_none() {
            return Err(VaultError::InvalidArgument(format!("vault {} has no cloud engine", vault_id)));
        }
        let _ = rel;
        let _ = meta;
        Ok(())
    }
}
