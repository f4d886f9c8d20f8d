//! Filesystem ops: the transactional join between the storage engine
//! (bytes) and the metadata store (rows). Grounded on the teacher's
//! `caching_remote.rs` (graveyard-before-upload pattern, ref-counted
//! open/close) generalized to the full createFile/mkdir/rename/remove/
//! copy set, and on `include/db/Transactions.hpp` for the
//! upsert-then-propagate-stats transaction shape.

use std::collections::HashMap;
use std::sync::Mutex;

use parking_lot::Mutex as PLMutex;

use crate::db::{queries, Pool};
use crate::error::{VaultError, VaultResult};
use crate::manager::StorageManager;
use crate::path;
use crate::registry::EntryRegistry;
use crate::types::*;

/// One mutex per (vault_id, path); acquisition order for multi-path ops
/// is deterministic by (vault_id, lexicographic path), so rename/copy
/// never deadlock against each other.
pub struct PathLocks {
    locks: PLMutex<HashMap<(VaultId, String), std::sync::Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> PathLocks {
        PathLocks { locks: PLMutex::new(HashMap::new()) }
    }

    fn get(&self, vault_id: VaultId, path: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry((vault_id, path.to_string()))
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    /// Locks the given (vault, path) pairs in deterministic order,
    /// running `f` once all are held.
    pub fn with_locked<T>(&self, mut keys: Vec<(VaultId, String)>, f: impl FnOnce() -> VaultResult<T>) -> VaultResult<T> {
        keys.sort();
        keys.dedup();
        let mutexes: Vec<_> = keys.iter().map(|(v, p)| self.get(*v, p)).collect();
        let _guards: Vec<_> = mutexes.iter().map(|m| m.lock().unwrap()).collect();
        f()
    }
}

impl Default for PathLocks {
    fn default() -> PathLocks {
        PathLocks::new()
    }
}

pub struct FsOps {
    pool: Pool,
    registry: EntryRegistry,
    manager: StorageManager,
    locks: PathLocks,
}

impl FsOps {
    pub fn new(pool: Pool, registry: EntryRegistry, manager: StorageManager) -> FsOps {
        FsOps { pool, registry, manager, locks: PathLocks::new() }
    }

    pub fn registry(&self) -> &EntryRegistry {
        &self.registry
    }

    pub fn pool_with<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> VaultResult<T>) -> VaultResult<T> {
        self.pool.with_conn(f)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Walks `rel_path` from the vault root, creating any missing
    /// intermediate directory Entries along the way. Idempotent: an
    /// already-materialized directory is left untouched. Used by the
    /// sync engine's EnsureDirectories phase, which discovers
    /// directories implied by a remote key listing rather than through
    /// an explicit mkdir call.
    pub fn ensure_directory(&self, vault_id: VaultId, rel_path: &str, owner_uid: u32, group_gid: u32) -> VaultResult<Entry> {
        let rel_path = path::normalize_relative(rel_path);
        if rel_path.is_empty() {
            return self.pool.with_conn(|conn| queries::get_entry_by_id(conn, ROOT_ENTRY_ID));
        }
        let (parent_rel, name) = path::parent_and_name(&rel_path);
        let parent = self.ensure_directory(vault_id, &parent_rel, owner_uid, group_gid)?;
        self.locks.with_locked(vec![(vault_id, rel_path.clone())], || {
            self.pool.transaction(|txn| {
                if let Some(existing) = queries::get_child(txn, parent.id, &name)? {
                    return Ok(existing);
                }
                let now = now_secs();
                let entry = Entry {
                    id: next_entry_id(txn)?,
                    alias: Alias::generate(),
                    parent_id: Some(parent.id),
                    name: name.clone(),
                    path: rel_path.clone(),
                    vault_id: Some(vault_id),
                    owner_uid,
                    group_gid,
                    mode: 0o755,
                    kind: EntryKind::Directory,
                    created_by: None,
                    last_modified_by: None,
                    created_at: now,
                    updated_at: now,
                };
                queries::insert_entry(txn, &entry, 0)?;
                Ok(entry)
            })
        })
    }

    pub fn manager(&self) -> &StorageManager {
        &self.manager
    }

    pub fn entry_for_path(&self, rel_path: &str) -> VaultResult<Entry> {
        self.resolve_by_path(rel_path)
    }

    /// Writes the content-hash/encryption metadata a cloud upload
    /// produced back onto an already-materialized local Entry. Used by
    /// the sync engine after an Upload action succeeds.
    pub fn record_uploaded_meta(&self, rel_path: &str, meta: &FileMeta) -> VaultResult<()> {
        let entry = self.resolve_by_path(rel_path)?;
        let mut meta = meta.clone();
        meta.entry_id = entry.id;
        self.pool.transaction(|txn| queries::update_file_meta_propagating(txn, &meta))
    }

    /// Materializes the Entry/File rows for a path that was just
    /// downloaded from the remote side (bytes are already on disk via
    /// the cloud engine's cache). Idempotent against a path that
    /// already has an Entry (e.g. a retried sync run), in which case
    /// only the File metadata is refreshed.
    pub fn upsert_downloaded_file(
        &self,
        vault_id: VaultId,
        rel_path: &str,
        meta: &FileMeta,
        owner_uid: u32,
        group_gid: u32,
    ) -> VaultResult<Entry> {
        let (parent_rel, name) = path::parent_and_name(rel_path);
        let parent = self.ensure_directory(vault_id, &parent_rel, owner_uid, group_gid)?;
        self.locks.with_locked(vec![(vault_id, rel_path.to_string())], || {
            self.pool.transaction(|txn| {
                if let Some(existing) = queries::get_child(txn, parent.id, &name)? {
                    let mut meta = meta.clone();
                    meta.entry_id = existing.id;
                    queries::update_file_meta_propagating(txn, &meta)?;
                    return Ok(existing);
                }
                let now = now_secs();
                let entry = Entry {
                    id: next_entry_id(txn)?,
                    alias: Alias::generate(),
                    parent_id: Some(parent.id),
                    name: name.clone(),
                    path: rel_path.to_string(),
                    vault_id: Some(vault_id),
                    owner_uid,
                    group_gid,
                    mode: 0o644,
                    kind: EntryKind::File,
                    created_by: None,
                    last_modified_by: None,
                    created_at: now,
                    updated_at: now,
                };
                queries::insert_entry(txn, &entry, meta.size_bytes)?;
                let mut meta = meta.clone();
                meta.entry_id = entry.id;
                queries::update_file_meta(txn, &meta)?;
                Ok(entry)
            })
        })
    }

    /// Within one transaction: upsert the Entry row, upsert the File
    /// row, propagate stats up the parent chain, commit; then invoke
    /// the engine to materialize bytes. If the bytes step fails after
    /// commit, the row is marked trashed so the next sync removes it.
    pub fn create_file(
        &self,
        vault_id: VaultId,
        parent_id: EntryId,
        name: &str,
        owner_uid: u32,
        group_gid: u32,
        mode: u32,
        created_by: Option<i64>,
    ) -> VaultResult<Entry> {
        let parent_path = self
            .pool
            .with_conn(|conn| queries::get_entry_by_id(conn, parent_id))?
            .path;
        let rel_path = path::join(&parent_path, name);
        self.locks.with_locked(vec![(vault_id, rel_path.clone())], || {
            self.pool.transaction(|txn| {
                if queries::get_child(txn, parent_id, name)?.is_some() {
                    return Err(VaultError::AlreadyExists(rel_path.clone()));
                }
                let now = now_secs();
                let entry = Entry {
                    id: next_entry_id(txn)?,
                    alias: Alias::generate(),
                    parent_id: Some(parent_id),
                    name: name.to_string(),
                    path: rel_path.clone(),
                    vault_id: Some(vault_id),
                    owner_uid,
                    group_gid,
                    mode,
                    kind: EntryKind::File,
                    created_by,
                    last_modified_by: created_by,
                    created_at: now,
                    updated_at: now,
                };
                queries::insert_entry(txn, &entry, 0)?;
                Ok(entry)
            })
        }).and_then(|entry| {
            match self.manager.engine_for(vault_id).and_then(|engine| engine.write_file(&rel_path, &[])) {
                Ok(_) => Ok(entry),
                Err(err) => {
                    // Bytes materialization failed after the row commit;
                    // mark the entry trashed so the next sync cleans it up.
                    let _ = self.pool.transaction(|txn| {
                        queries::trash_entry(txn, &entry, 0, &entry.path, None)
                    });
                    Err(err)
                }
            }
        })
    }

    /// Upsert Entry + directories row; no engine I/O beyond directory
    /// creation on the backing root.
    pub fn mkdir(
        &self,
        vault_id: VaultId,
        parent_id: EntryId,
        name: &str,
        owner_uid: u32,
        group_gid: u32,
        mode: u32,
        created_by: Option<i64>,
    ) -> VaultResult<Entry> {
        let parent_path = self.pool.with_conn(|conn| queries::get_entry_by_id(conn, parent_id))?.path;
        let rel_path = path::join(&parent_path, name);
        let entry = self.locks.with_locked(vec![(vault_id, rel_path.clone())], || {
            self.pool.transaction(|txn| {
                if queries::get_child(txn, parent_id, name)?.is_some() {
                    return Err(VaultError::AlreadyExists(rel_path.clone()));
                }
                let now = now_secs();
                let entry = Entry {
                    id: next_entry_id(txn)?,
                    alias: Alias::generate(),
                    parent_id: Some(parent_id),
                    name: name.to_string(),
                    path: rel_path.clone(),
                    vault_id: Some(vault_id),
                    owner_uid,
                    group_gid,
                    mode,
                    kind: EntryKind::Directory,
                    created_by,
                    last_modified_by: created_by,
                    created_at: now,
                    updated_at: now,
                };
                queries::insert_entry(txn, &entry, 0)?;
                Ok(entry)
            })
        })?;
        self.manager.mkdir(vault_id, &rel_path)?;
        Ok(entry)
    }

    /// Fast path: same-engine rename rewrites (parent_id, name, path,
    /// alias) and lets the engine move bytes. Crossing engines falls
    /// back to copy-then-remove. Regardless of path, descendant paths
    /// are rewritten in the same transaction and affected inode cache
    /// entries are evicted.
    pub fn rename(&self, vault_id: VaultId, from_rel: &str, to_rel: &str, new_parent_id: EntryId) -> VaultResult<()> {
        if to_rel == from_rel || to_rel.starts_with(&format!("{}/", from_rel)) {
            return Err(VaultError::InvalidArgument("rename would create a cycle".to_string()));
        }
        let (_, new_name) = path::parent_and_name(to_rel);
        self.locks.with_locked(
            vec![(vault_id, from_rel.to_string()), (vault_id, to_rel.to_string())],
            || {
                let entry = self.resolve_by_path(from_rel)?;
                self.manager.move_entry(vault_id, from_rel, to_rel)?;
                self.pool.transaction(|txn| {
                    queries::rename_entry(txn, entry.id, new_parent_id, &new_name, to_rel, from_rel)
                })?;
                self.registry.evict_subtree(from_rel);
                Ok(())
            },
        )
    }

    /// Insert trashed row, delete Entry+File rows, update parent stats,
    /// commit. For an S3 vault, the remote object is left in place: the
    /// sync engine's cloud drain worker later deletes it and nulls
    /// `deleted_at` (see `sync::SyncEngine::drain_trash`), since an
    /// orphaned upload in flight must not race a premature delete. A
    /// local vault has no such race and no async worker watching it, so
    /// its bytes are removed synchronously and the tombstone is closed
    /// out immediately.
    pub fn remove(&self, vault_id: VaultId, rel_path: &str, user_id: Option<i64>) -> VaultResult<()> {
        self.locks.with_locked(vec![(vault_id, rel_path.to_string())], || {
            let entry = self.resolve_by_path(rel_path)?;
            let size_bytes = if matches!(entry.kind, EntryKind::File) {
                self.pool.with_conn(|conn| queries::get_file_meta(conn, entry.id))?.size_bytes
            } else {
                0
            };
            let vault_type = self.manager.engine_for(vault_id)?.vault().vault_type;
            let trashed_id = self.pool.transaction(|txn| {
                queries::trash_entry(txn, &entry, size_bytes, &entry.path, user_id)
            })?;
            self.registry.evict_subtree(rel_path);
            if vault_type != VaultType::S3 && matches!(entry.kind, EntryKind::File) {
                if let Ok(engine) = self.manager.engine_for(vault_id) {
                    let _ = engine.remove(rel_path);
                }
                self.pool.with_conn(|conn| queries::mark_trashed_deleted(conn, trashed_id))?;
            }
            Ok(())
        })
    }

    /// Engine-specific: local is a backing-fs copy with new entry rows;
    /// cloud is a server-side CopyObject followed by Entry insertion.
    pub fn copy(&self, vault_id: VaultId, from_rel: &str, to_rel: &str, new_parent_id: EntryId, user_id: Option<i64>) -> VaultResult<Entry> {
        let (_, new_name) = path::parent_and_name(to_rel);
        self.locks.with_locked(
            vec![(vault_id, from_rel.to_string()), (vault_id, to_rel.to_string())],
            || {
                self.manager.copy_entry(vault_id, from_rel, to_rel)?;
                self.pool.transaction(|txn| {
                    let now = now_secs();
                    let entry = Entry {
                        id: next_entry_id(txn)?,
                        alias: Alias::generate(),
                        parent_id: Some(new_parent_id),
                        name: new_name.clone(),
                        path: to_rel.to_string(),
                        vault_id: Some(vault_id),
                        owner_uid: 0,
                        group_gid: 0,
                        mode: 0o644,
                        kind: EntryKind::File,
                        created_by: user_id,
                        last_modified_by: user_id,
                        created_at: now,
                        updated_at: now,
                    };
                    queries::insert_entry(txn, &entry, 0)?;
                    Ok(entry)
                })
            },
        )
    }

    /// Rejects a write/truncate that would push a vault's total usage
    /// (sum of `files.size_bytes`) past `quota_bytes`. A vault with
    /// `quota_bytes == 0` is unlimited and always passes.
    pub fn check_quota(&self, vault_id: VaultId, extra_bytes: u64) -> VaultResult<()> {
        let vault = self.manager.engine_for(vault_id)?.vault().clone();
        if vault.is_unlimited_quota() || extra_bytes == 0 {
            return Ok(());
        }
        let used = self.pool.with_conn(|conn| queries::vault_usage_bytes(conn, vault_id))?;
        if used.saturating_add(extra_bytes) > vault.quota_bytes {
            return Err(VaultError::QuotaExceeded(format!(
                "vault {} would exceed its {}-byte quota ({}B used, {}B requested)",
                vault_id, vault.quota_bytes, used, extra_bytes
            )));
        }
        Ok(())
    }

    /// Applies a FUSE `setattr` mutation to `rel_path`: chmod/chown are
    /// metadata-only column updates, while a size change (truncate)
    /// resizes the file's bytes through the storage engine and records
    /// the new size with parent-chain propagation, all before the
    /// metadata-only columns are touched in the same transaction.
    /// Returns the refreshed Entry for the caller to re-seed the
    /// registry's cache with.
    pub fn set_attrs(
        &self,
        vault_id: VaultId,
        rel_path: &str,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
    ) -> VaultResult<Entry> {
        let entry = self.resolve_by_path(rel_path)?;
        self.locks.with_locked(vec![(vault_id, rel_path.to_string())], || {
            if let Some(new_size) = size {
                if !matches!(entry.kind, EntryKind::File) {
                    return Err(VaultError::InvalidArgument("cannot truncate a directory".to_string()));
                }
                let engine = self.manager.engine_for(vault_id)?;
                let mut bytes = engine.read_file(rel_path).unwrap_or_default();
                let growth = (new_size as usize).saturating_sub(bytes.len()) as u64;
                self.check_quota(vault_id, growth)?;
                bytes.resize(new_size as usize, 0);
                let meta = engine.write_file(rel_path, &bytes)?;
                self.pool.transaction(|txn| {
                    let mut meta = meta.clone();
                    meta.entry_id = entry.id;
                    queries::update_file_meta_propagating(txn, &meta)?;
                    if mode.is_some() || uid.is_some() || gid.is_some() {
                        queries::update_entry_attrs(txn, entry.id, mode, uid, gid)?;
                    }
                    Ok(())
                })?;
            } else if mode.is_some() || uid.is_some() || gid.is_some() {
                self.pool.with_conn(|conn| queries::update_entry_attrs(conn, entry.id, mode, uid, gid))?;
            }
            self.pool.with_conn(|conn| queries::get_entry_by_id(conn, entry.id))
        })
    }
}

impl FsOps {
    /// Resolves a vault-relative path to its Entry, preferring the
    /// in-memory registry and falling back to a parent-then-child
    /// lookup against the store when the registry has no inode for it
    /// yet (e.g. remote-discovered entries not yet looked up).
    fn resolve_by_path(&self, rel_path: &str) -> VaultResult<Entry> {
        if let Some(inode) = self.registry.inode_for_path(rel_path) {
            if let Some(entry) = self.registry.entry_for_inode(inode) {
                return Ok(entry);
            }
        }
        let (parent_rel, name) = path::parent_and_name(rel_path);
        if name.is_empty() {
            return self.pool.with_conn(|conn| queries::get_entry_by_id(conn, ROOT_ENTRY_ID));
        }
        let parent = self.resolve_by_path(&parent_rel)?;
        self.pool
            .with_conn(|conn| queries::get_child(conn, parent.id, &name))?
            .ok_or_else(|| VaultError::NotFound(rel_path.to_string()))
    }
}

fn next_entry_id(conn: &rusqlite::Connection) -> VaultResult<EntryId> {
    let max: Option<i64> = conn.query_row("select max(id) from fs_entry", [], |row| row.get(0))?;
    Ok(max.unwrap_or(ROOT_ENTRY_ID) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathRoots;
    use crate::storage::Engine;
    use crate::types::{SyncPolicy, VaultType};

    struct Fixture {
        ops: FsOps,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&dir.path().join("meta.sqlite"), 4).unwrap();
        let registry = EntryRegistry::new();
        let manager = StorageManager::new(pool.clone());
        let mut roots = PathRoots::new(dir.path().join("mnt"), dir.path().join("backing"));
        roots.register_vault(1, "vaults/1");
        let vault = Vault {
            id: 1,
            name: "v".into(),
            owner_id: 1,
            vault_type: VaultType::Local,
            mount_point: "vaults/1".into(),
            quota_bytes: 0,
            is_active: true,
            sync_policy: SyncPolicy::Safe,
            sync_enabled: false,
            api_key_id: None,
            bucket: None,
            encrypt_upstream: false,
        };
        manager.register(1, Engine::new_local(vault, roots));
        Fixture { ops: FsOps::new(pool, registry, manager), _dir: dir }
    }

    #[test]
    fn create_file_then_lookup_round_trips() {
        let fx = fixture();
        let entry = fx.ops.create_file(1, ROOT_ENTRY_ID, "a.txt", 1000, 1000, 0o644, Some(1)).unwrap();
        assert_eq!(entry.path, "a.txt");
        let found = fx.ops.entry_for_path("a.txt").unwrap();
        assert_eq!(found.id, entry.id);
    }

    #[test]
    fn create_file_rejects_duplicate_name_in_same_parent() {
        let fx = fixture();
        fx.ops.create_file(1, ROOT_ENTRY_ID, "a.txt", 1000, 1000, 0o644, None).unwrap();
        let result = fx.ops.create_file(1, ROOT_ENTRY_ID, "a.txt", 1000, 1000, 0o644, None);
        assert!(matches!(result, Err(VaultError::AlreadyExists(_))));
    }

    #[test]
    fn mkdir_then_rename_rewrites_descendant_paths() {
        let fx = fixture();
        let dir_a = fx.ops.mkdir(1, ROOT_ENTRY_ID, "a", 1000, 1000, 0o755, None).unwrap();
        fx.ops.mkdir(1, dir_a.id, "b", 1000, 1000, 0o755, None).unwrap();
        fx.ops.create_file(1, dir_a.id, "x.txt", 1000, 1000, 0o644, None).unwrap();

        fx.ops.rename(1, "a", "A", ROOT_ENTRY_ID).unwrap();
        assert!(fx.ops.entry_for_path("a").is_err());
        let renamed = fx.ops.entry_for_path("A").unwrap();
        assert_eq!(renamed.id, dir_a.id);
        let child = fx.ops.entry_for_path("A/b").unwrap();
        assert_eq!(child.path, "A/b");
        let file = fx.ops.entry_for_path("A/x.txt").unwrap();
        assert_eq!(file.path, "A/x.txt");
    }

    #[test]
    fn rename_into_own_subtree_is_rejected() {
        let fx = fixture();
        fx.ops.mkdir(1, ROOT_ENTRY_ID, "a", 1000, 1000, 0o755, None).unwrap();
        let result = fx.ops.rename(1, "a", "a/b", ROOT_ENTRY_ID);
        assert!(matches!(result, Err(VaultError::InvalidArgument(_))));
    }

    #[test]
    fn remove_then_lookup_is_not_found() {
        let fx = fixture();
        fx.ops.create_file(1, ROOT_ENTRY_ID, "a.txt", 1000, 1000, 0o644, None).unwrap();
        fx.ops.remove(1, "a.txt", Some(1)).unwrap();
        assert!(matches!(fx.ops.entry_for_path("a.txt"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn quota_exceeded_rejects_growth_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&dir.path().join("meta.sqlite"), 4).unwrap();
        let registry = EntryRegistry::new();
        let manager = StorageManager::new(pool.clone());
        let mut roots = PathRoots::new(dir.path().join("mnt"), dir.path().join("backing"));
        roots.register_vault(1, "vaults/1");
        let vault = Vault {
            id: 1,
            name: "v".into(),
            owner_id: 1,
            vault_type: VaultType::Local,
            mount_point: "vaults/1".into(),
            quota_bytes: 10,
            is_active: true,
            sync_policy: SyncPolicy::Safe,
            sync_enabled: false,
            api_key_id: None,
            bucket: None,
            encrypt_upstream: false,
        };
        manager.register(1, Engine::new_local(vault, roots));
        let ops = FsOps::new(pool, registry, manager);

        assert!(ops.check_quota(1, 5).is_ok());
        assert!(matches!(ops.check_quota(1, 20), Err(VaultError::QuotaExceeded(_))));
    }
}
