//! Prepared-statement-shaped query functions against the schema in
//! `schema.rs`. Grounded on the teacher's `database.rs` (transactional
//! add/remove, attr, readdir) generalized to the full Entry/File/
//! Directory/Vault/SyncEvent model, and on
//! `core_daemon/src/database/Queries/FileQueries.cpp` /
//! `VaultQueries.cpp` for parent-stats propagation and vault CRUD shape.
//!
//! Every function here takes an open `&rusqlite::Connection` or
//! `&rusqlite::Transaction` (both implement the same query interface via
//! `rusqlite::Connection`'s trait methods); callers are responsible for
//! wrapping multi-row sequences in `Pool::transaction`.

use rusqlite::{params, OptionalExtension};

use crate::error::{VaultError, VaultResult};
use crate::types::*;

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    let kind_int: i64 = row.get("kind")?;
    Ok(Entry {
        id: row.get("id")?,
        alias: Alias(row.get("alias")?),
        parent_id: row.get("parent_id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        vault_id: row.get("vault_id")?,
        owner_uid: row.get("owner_uid")?,
        group_gid: row.get("group_gid")?,
        mode: row.get("mode")?,
        kind: if kind_int == 0 { EntryKind::File } else { EntryKind::Directory },
        created_by: row.get("created_by")?,
        last_modified_by: row.get("last_modified_by")?,
        created_at: row.get::<_, i64>("created_at")? as u64,
        updated_at: row.get::<_, i64>("updated_at")? as u64,
    })
}

pub fn get_entry_by_id(conn: &rusqlite::Connection, id: EntryId) -> VaultResult<Entry> {
    conn.query_row("select * from fs_entry where id = ?1", params![id], row_to_entry)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => VaultError::NotFound(format!("entry {}", id)),
            other => other.into(),
        })
}

pub fn get_child(conn: &rusqlite::Connection, parent_id: EntryId, name: &str) -> VaultResult<Option<Entry>> {
    conn.query_row(
        "select * from fs_entry where parent_id = ?1 and name = ?2",
        params![parent_id, name],
        row_to_entry,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_children(conn: &rusqlite::Connection, parent_id: EntryId) -> VaultResult<Vec<Entry>> {
    let mut stmt = conn.prepare("select * from fs_entry where parent_id = ?1 order by name")?;
    let rows = stmt.query_map(params![parent_id], row_to_entry)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Inserts a new Entry, its File or Directory row, and propagates size
/// deltas up the parent chain, inside one transaction.
pub fn insert_entry(
    txn: &rusqlite::Transaction,
    entry: &Entry,
    initial_size: u64,
) -> VaultResult<()> {
    let kind_int = match entry.kind {
        EntryKind::File => 0,
        EntryKind::Directory => 1,
    };
    txn.execute(
        "insert into fs_entry
            (id, alias, parent_id, name, path, vault_id, owner_uid, group_gid, mode, kind,
             created_by, last_modified_by, created_at, updated_at)
         values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            entry.id,
            entry.alias.0,
            entry.parent_id,
            entry.name,
            entry.path,
            entry.vault_id,
            entry.owner_uid,
            entry.group_gid,
            entry.mode,
            kind_int,
            entry.created_by,
            entry.last_modified_by,
            entry.created_at as i64,
            entry.updated_at as i64,
        ],
    )?;
    match entry.kind {
        EntryKind::File => {
            txn.execute(
                "insert into files (entry_id, size_bytes) values (?1, ?2)",
                params![entry.id, initial_size as i64],
            )?;
        }
        EntryKind::Directory => {
            txn.execute(
                "insert into directories (entry_id, size_bytes, file_count, subdirectory_count)
                 values (?1, 0, 0, 0)",
                params![entry.id],
            )?;
        }
    }
    if let Some(parent_id) = entry.parent_id {
        let is_dir = matches!(entry.kind, EntryKind::Directory);
        propagate_stats(txn, parent_id, initial_size as i64, if is_dir { 0 } else { 1 }, if is_dir { 1 } else { 0 })?;
    }
    Ok(())
}

/// Adds `size_delta`/`file_delta`/`dir_delta` to `directory`'s stats and
/// recurses to its parent, ordered child-to-root as required.
pub fn propagate_stats(
    txn: &rusqlite::Transaction,
    directory: EntryId,
    size_delta: i64,
    file_delta: i64,
    dir_delta: i64,
) -> VaultResult<()> {
    txn.execute(
        "update directories
         set size_bytes = size_bytes + ?1,
             file_count = file_count + ?2,
             subdirectory_count = subdirectory_count + ?3
         where entry_id = ?4",
        params![size_delta, file_delta, dir_delta, directory],
    )?;
    let parent: Option<EntryId> = txn
        .query_row(
            "select parent_id from fs_entry where id = ?1",
            params![directory],
            |row| row.get::<_, Option<EntryId>>(0),
        )
        .optional()?
        .flatten();
    if let Some(parent) = parent {
        propagate_stats(txn, parent, size_delta, file_delta, dir_delta)?;
    }
    Ok(())
}

/// Removes a non-root directory row once it has no remaining children,
/// per the invariant that empty directories scheduled for removal are
/// deleted rather than left dangling.
pub fn delete_empty_directory_if_scheduled(conn: &rusqlite::Connection, entry_id: EntryId) -> VaultResult<()> {
    if entry_id == ROOT_ENTRY_ID {
        return Ok(());
    }
    let counts: Option<(i64, i64)> = conn
        .query_row(
            "select file_count, subdirectory_count from directories where entry_id = ?1",
            params![entry_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((files, dirs)) = counts {
        if files + dirs == 0 {
            conn.execute("delete from directories where entry_id = ?1", params![entry_id])?;
        }
    }
    Ok(())
}

/// Rewrites an entry's (parent_id, name, path) and every descendant's
/// path, evicting affected cache entries is the caller's responsibility
/// (the registry, not the store, owns inode caches).
pub fn rename_entry(
    txn: &rusqlite::Transaction,
    entry_id: EntryId,
    new_parent_id: EntryId,
    new_name: &str,
    new_path: &str,
    old_path: &str,
) -> VaultResult<()> {
    txn.execute(
        "update fs_entry set parent_id = ?1, name = ?2, path = ?3, updated_at = ?4 where id = ?5",
        params![new_parent_id, new_name, new_path, now_secs() as i64, entry_id],
    )?;
    let old_prefix = format!("{}/", old_path);
    let new_prefix = format!("{}/", new_path);
    let mut stmt = txn.prepare("select id, path from fs_entry where path like ?1")?;
    let descendants: Vec<(EntryId, String)> = stmt
        .query_map(params![format!("{}%", old_prefix)], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    for (id, path) in descendants {
        let rewritten = format!("{}{}", new_prefix, &path[old_prefix.len()..]);
        txn.execute(
            "update fs_entry set path = ?1 where id = ?2",
            params![rewritten, id],
        )?;
    }
    Ok(())
}

/// Inserts a trashed-file tombstone and deletes the Entry/File rows,
/// updating parent stats, all inside one transaction. Returns the new
/// `files_trashed` row id, so the caller can close it out immediately
/// (local vaults, which have no async remote-delete worker) or leave it
/// for the cloud drain worker to find via `pending_trashed_deletes`.
pub fn trash_entry(
    txn: &rusqlite::Transaction,
    entry: &Entry,
    size_bytes: u64,
    backing_path: &str,
    trashed_by: Option<i64>,
) -> VaultResult<i64> {
    let vault_id = entry
        .vault_id
        .ok_or_else(|| VaultError::InvalidArgument("cannot trash an entry outside a vault".to_string()))?;
    txn.execute(
        "insert into files_trashed (vault_id, alias, size_bytes, trashed_by, trashed_at, backing_path, deleted_at)
         values (?1, ?2, ?3, ?4, ?5, ?6, null)",
        params![vault_id, entry.alias.0, size_bytes as i64, trashed_by, now_secs() as i64, backing_path],
    )?;
    let trashed_id = txn.last_insert_rowid();
    txn.execute("delete from fs_entry where id = ?1", params![entry.id])?;
    if let Some(parent_id) = entry.parent_id {
        let is_dir = matches!(entry.kind, EntryKind::Directory);
        propagate_stats(
            txn,
            parent_id,
            -(size_bytes as i64),
            if is_dir { 0 } else { -1 },
            if is_dir { -1 } else { 0 },
        )?;
        delete_empty_directory_if_scheduled(txn, parent_id)?;
    }
    Ok(trashed_id)
}

pub fn mark_trashed_deleted(conn: &rusqlite::Connection, id: i64) -> VaultResult<()> {
    conn.execute(
        "update files_trashed set deleted_at = ?1 where id = ?2",
        params![now_secs() as i64, id],
    )?;
    Ok(())
}

pub fn pending_trashed_deletes(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<Vec<TrashedFile>> {
    let mut stmt = conn.prepare(
        "select id, vault_id, alias, size_bytes, trashed_by, trashed_at, backing_path, deleted_at
         from files_trashed where vault_id = ?1 and deleted_at is null",
    )?;
    let rows = stmt.query_map(params![vault_id], |row| {
        Ok(TrashedFile {
            id: row.get(0)?,
            vault_id: row.get(1)?,
            alias: Alias(row.get(2)?),
            size_bytes: row.get::<_, i64>(3)? as u64,
            trashed_by: row.get(4)?,
            trashed_at: row.get::<_, i64>(5)? as u64,
            backing_path: row.get(6)?,
            deleted_at: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn update_file_meta(conn: &rusqlite::Connection, meta: &FileMeta) -> VaultResult<()> {
    conn.execute(
        "update files set size_bytes = ?1, mime_type = ?2, content_hash = ?3,
            encryption_iv = ?4, encrypted_with_key_version = ?5
         where entry_id = ?6",
        params![
            meta.size_bytes as i64,
            meta.mime_type,
            meta.content_hash,
            meta.encryption_iv,
            meta.encrypted_with_key_version,
            meta.entry_id,
        ],
    )?;
    Ok(())
}

/// Like `update_file_meta`, but also propagates the file's size delta up
/// the parent chain in the same transaction, per the invariant that
/// `size_bytes(d) = sum(size_bytes(child))` for every directory.
pub fn update_file_meta_propagating(txn: &rusqlite::Transaction, meta: &FileMeta) -> VaultResult<()> {
    let old_size: i64 = txn.query_row(
        "select size_bytes from files where entry_id = ?1",
        params![meta.entry_id],
        |row| row.get(0),
    )?;
    update_file_meta(txn, meta)?;
    let delta = meta.size_bytes as i64 - old_size;
    if delta != 0 {
        let parent_id: Option<EntryId> = txn
            .query_row("select parent_id from fs_entry where id = ?1", params![meta.entry_id], |row| row.get(0))
            .optional()?
            .flatten();
        if let Some(parent_id) = parent_id {
            propagate_stats(txn, parent_id, delta, 0, 0)?;
        }
    }
    txn.execute(
        "update fs_entry set updated_at = ?1 where id = ?2",
        params![now_secs() as i64, meta.entry_id],
    )?;
    Ok(())
}

/// Updates mode/uid/gid for chmod/chown (fuser's combined `setattr`),
/// touching only the columns whose new value is `Some`.
pub fn update_entry_attrs(
    conn: &rusqlite::Connection,
    entry_id: EntryId,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
) -> VaultResult<()> {
    conn.execute(
        "update fs_entry set
            mode = coalesce(?1, mode),
            owner_uid = coalesce(?2, owner_uid),
            group_gid = coalesce(?3, group_gid),
            updated_at = ?4
         where id = ?5",
        params![mode, uid, gid, now_secs() as i64, entry_id],
    )?;
    Ok(())
}

pub fn get_file_meta(conn: &rusqlite::Connection, entry_id: EntryId) -> VaultResult<FileMeta> {
    conn.query_row(
        "select entry_id, size_bytes, mime_type, content_hash, encryption_iv, encrypted_with_key_version
         from files where entry_id = ?1",
        params![entry_id],
        |row| {
            Ok(FileMeta {
                entry_id: row.get(0)?,
                size_bytes: row.get::<_, i64>(1)? as u64,
                mime_type: row.get(2)?,
                content_hash: row.get(3)?,
                encryption_iv: row.get(4)?,
                encrypted_with_key_version: row.get(5)?,
            })
        },
    )
    .map_err(Into::into)
}

// --- Vault CRUD (§3 supplement) -------------------------------------

pub fn insert_vault(conn: &rusqlite::Connection, vault: &Vault) -> VaultResult<()> {
    conn.execute(
        "insert into vault (id, name, owner_id, vault_type, mount_point, quota_bytes,
            is_active, sync_policy, sync_enabled)
         values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            vault.id,
            vault.name,
            vault.owner_id,
            vault_type_to_int(vault.vault_type),
            vault.mount_point,
            vault.quota_bytes as i64,
            vault.is_active,
            sync_policy_to_int(vault.sync_policy),
            vault.sync_enabled,
        ],
    )?;
    if vault.vault_type == VaultType::S3 {
        conn.execute(
            "insert into s3 (vault_id, api_key_id, bucket, encrypt_upstream) values (?1, ?2, ?3, ?4)",
            params![
                vault.id,
                vault.api_key_id,
                vault.bucket.clone().unwrap_or_default(),
                vault.encrypt_upstream,
            ],
        )?;
    }
    conn.execute(
        "insert into sync (vault_id, in_flight) values (?1, 0)",
        params![vault.id],
    )?;
    Ok(())
}

pub fn list_active_vaults(conn: &rusqlite::Connection) -> VaultResult<Vec<Vault>> {
    let mut stmt = conn.prepare(
        "select v.id, v.name, v.owner_id, v.vault_type, v.mount_point, v.quota_bytes,
                v.is_active, v.sync_policy, v.sync_enabled,
                s.api_key_id, s.bucket, s.encrypt_upstream
         from vault v left join s3 s on s.vault_id = v.id
         where v.is_active = 1",
    )?;
    let rows = stmt.query_map([], |row| {
        let vault_type_int: i64 = row.get(3)?;
        let sync_policy_int: i64 = row.get(7)?;
        Ok(Vault {
            id: row.get(0)?,
            name: row.get(1)?,
            owner_id: row.get(2)?,
            vault_type: int_to_vault_type(vault_type_int),
            mount_point: row.get(4)?,
            quota_bytes: row.get::<_, i64>(5)? as u64,
            is_active: row.get(6)?,
            sync_policy: int_to_sync_policy(sync_policy_int),
            sync_enabled: row.get(8)?,
            api_key_id: row.get(9)?,
            bucket: row.get(10)?,
            encrypt_upstream: row.get::<_, Option<bool>>(11)?.unwrap_or(false),
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn vault_type_to_int(t: VaultType) -> i64 {
    match t {
        VaultType::Local => 0,
        VaultType::S3 => 1,
    }
}
fn int_to_vault_type(i: i64) -> VaultType {
    if i == 0 { VaultType::Local } else { VaultType::S3 }
}
fn sync_policy_to_int(p: SyncPolicy) -> i64 {
    match p {
        SyncPolicy::Cache => 0,
        SyncPolicy::Safe => 1,
        SyncPolicy::MirrorKeepLocal => 2,
        SyncPolicy::MirrorKeepRemote => 3,
    }
}
fn int_to_sync_policy(i: i64) -> SyncPolicy {
    match i {
        0 => SyncPolicy::Cache,
        1 => SyncPolicy::Safe,
        2 => SyncPolicy::MirrorKeepLocal,
        _ => SyncPolicy::MirrorKeepRemote,
    }
}

// --- API key lookup (§3 supplement) ----------------------------------

pub fn get_api_key(conn: &rusqlite::Connection, id: i64) -> VaultResult<ApiKey> {
    conn.query_row(
        "select id, user_id, provider, access_key, region, endpoint,
                encrypted_secret_access_key, iv
         from api_keys where id = ?1",
        params![id],
        |row| {
            let provider_int: i64 = row.get(2)?;
            Ok(ApiKey {
                id: row.get(0)?,
                user_id: row.get(1)?,
                provider: int_to_s3_provider(provider_int),
                access_key: row.get(3)?,
                region: row.get(4)?,
                endpoint: row.get(5)?,
                encrypted_secret_access_key: row.get(6)?,
                iv: row.get(7)?,
            })
        },
    )
    .map_err(Into::into)
}

fn int_to_s3_provider(i: i64) -> S3Provider {
    match i {
        1 => S3Provider::Aws,
        2 => S3Provider::Minio,
        _ => S3Provider::GenericS3,
    }
}

// --- Vault key rotation bookkeeping (§3 supplement) ------------------

pub fn current_vault_key(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<Option<VaultKey>> {
    conn.query_row(
        "select vault_id, version, wrapped_key, wrap_iv, created_at from vault_keys where vault_id = ?1",
        params![vault_id],
        |row| {
            Ok(VaultKey {
                vault_id: row.get(0)?,
                version: row.get(1)?,
                wrapped_key: row.get(2)?,
                wrap_iv: row.get(3)?,
                created_at: row.get::<_, i64>(4)? as u64,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Begins rotation: moves the current key to the trashed table with
/// `rotation_completed_at = NULL` and installs `new_key` as current.
pub fn begin_key_rotation(txn: &rusqlite::Transaction, new_key: &VaultKey) -> VaultResult<()> {
    if let Some(old) = current_vault_key(txn, new_key.vault_id)? {
        txn.execute(
            "insert into vault_keys_trashed (vault_id, version, wrapped_key, wrap_iv, trashed_at, rotation_completed_at)
             values (?1, ?2, ?3, ?4, ?5, null)",
            params![old.vault_id, old.version, old.wrapped_key, old.wrap_iv, now_secs() as i64],
        )?;
        txn.execute("delete from vault_keys where vault_id = ?1", params![old.vault_id])?;
    }
    txn.execute(
        "insert into vault_keys (vault_id, version, wrapped_key, wrap_iv, created_at)
         values (?1, ?2, ?3, ?4, ?5)",
        params![new_key.vault_id, new_key.version, new_key.wrapped_key, new_key.wrap_iv, new_key.created_at as i64],
    )?;
    Ok(())
}

/// Number of files still encrypted under an older key version than
/// `current_version`; the rotation's re-encrypt worker drains this.
pub fn count_files_needing_reencryption(
    conn: &rusqlite::Connection,
    vault_id: VaultId,
    current_version: i64,
) -> VaultResult<u64> {
    let count: i64 = conn.query_row(
        "select count(*) from files f
         join fs_entry e on e.id = f.entry_id
         where e.vault_id = ?1 and (f.encrypted_with_key_version is null or f.encrypted_with_key_version < ?2)",
        params![vault_id, current_version],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn complete_key_rotation(conn: &rusqlite::Connection, vault_id: VaultId, version: i64) -> VaultResult<()> {
    conn.execute(
        "update vault_keys_trashed set rotation_completed_at = ?1 where vault_id = ?2 and version = ?3",
        params![now_secs() as i64, vault_id, version],
    )?;
    Ok(())
}

/// The trashed key still being rotated away from (`rotation_completed_at
/// IS NULL`), if any — the re-encrypt drain needs it to decrypt files
/// still written under the old version.
pub fn pending_trashed_key(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<Option<VaultKey>> {
    conn.query_row(
        "select vault_id, version, wrapped_key, wrap_iv, trashed_at from vault_keys_trashed
         where vault_id = ?1 and rotation_completed_at is null
         order by trashed_at desc limit 1",
        params![vault_id],
        |row| {
            Ok(VaultKey {
                vault_id: row.get(0)?,
                version: row.get(1)?,
                wrapped_key: row.get(2)?,
                wrap_iv: row.get(3)?,
                created_at: row.get::<_, i64>(4)? as u64,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Up to `limit` files still encrypted under an older key version than
/// `current_version`, for the rotation drain's batches.
pub fn files_needing_reencryption(
    conn: &rusqlite::Connection,
    vault_id: VaultId,
    current_version: i64,
    limit: u32,
) -> VaultResult<Vec<(Entry, FileMeta)>> {
    let mut stmt = conn.prepare(
        "select e.id, e.alias, e.parent_id, e.name, e.path, e.vault_id, e.owner_uid, e.group_gid,
                e.mode, e.kind, e.created_by, e.last_modified_by, e.created_at, e.updated_at,
                f.entry_id, f.size_bytes, f.mime_type, f.content_hash, f.encryption_iv, f.encrypted_with_key_version
         from fs_entry e join files f on f.entry_id = e.id
         where e.vault_id = ?1 and (f.encrypted_with_key_version is null or f.encrypted_with_key_version < ?2)
         limit ?3",
    )?;
    let rows = stmt.query_map(params![vault_id, current_version, limit], |row| {
        let entry = row_to_entry(row)?;
        let meta = FileMeta {
            entry_id: row.get(14)?,
            size_bytes: row.get::<_, i64>(15)? as u64,
            mime_type: row.get(16)?,
            content_hash: row.get(17)?,
            encryption_iv: row.get(18)?,
            encrypted_with_key_version: row.get(19)?,
        };
        Ok((entry, meta))
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Sum of `files.size_bytes` across every file belonging to a vault —
/// the quota check's usage figure. A plain aggregate over the leaf rows
/// rather than a read of the vault-root `directories` rollup, since a
/// vault's own root directory entry isn't guaranteed to exist yet for a
/// brand-new vault with no files.
pub fn vault_usage_bytes(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<u64> {
    let total: i64 = conn.query_row(
        "select coalesce(sum(f.size_bytes), 0) from files f
         join fs_entry e on e.id = f.entry_id
         where e.vault_id = ?1",
        params![vault_id],
        |row| row.get(0),
    )?;
    Ok(total as u64)
}

// --- Cache index (§4.E/§4.J eviction) --------------------------------

pub fn insert_cache_entry(conn: &rusqlite::Connection, entry: &CacheIndexEntry) -> VaultResult<i64> {
    conn.execute(
        "insert into cache_index (vault_id, file_id, path, entry_type, size, last_accessed)
         values (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.vault_id,
            entry.file_id,
            entry.path,
            entry.entry_type as i64,
            entry.size as i64,
            entry.last_accessed as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn remove_cache_entry(conn: &rusqlite::Connection, id: i64) -> VaultResult<()> {
    conn.execute("delete from cache_index where id = ?1", params![id])?;
    Ok(())
}

/// Returns the `n` largest cache-index rows for `vault_id`, used by the
/// eviction loop's doubling purge-batch strategy.
pub fn largest_cache_entries(conn: &rusqlite::Connection, vault_id: VaultId, n: u32) -> VaultResult<Vec<CacheIndexEntry>> {
    let mut stmt = conn.prepare(
        "select id, vault_id, file_id, path, entry_type, size, last_accessed
         from cache_index where vault_id = ?1 order by size desc limit ?2",
    )?;
    let rows = stmt.query_map(params![vault_id, n], |row| {
        let entry_type_int: i64 = row.get(4)?;
        Ok(CacheIndexEntry {
            id: row.get(0)?,
            vault_id: row.get(1)?,
            file_id: row.get(2)?,
            path: row.get(3)?,
            entry_type: if entry_type_int == 0 { CacheEntryType::File } else { CacheEntryType::Thumbnail },
            size: row.get::<_, i64>(5)? as u64,
            last_accessed: row.get::<_, i64>(6)? as u64,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn cache_size_total(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<u64> {
    let total: Option<i64> = conn.query_row(
        "select sum(size) from cache_index where vault_id = ?1",
        params![vault_id],
        |row| row.get(0),
    )?;
    Ok(total.unwrap_or(0) as u64)
}

pub fn cache_entry_by_path(conn: &rusqlite::Connection, vault_id: VaultId, path: &str) -> VaultResult<Option<CacheIndexEntry>> {
    conn.query_row(
        "select id, vault_id, file_id, path, entry_type, size, last_accessed
         from cache_index where vault_id = ?1 and path = ?2",
        params![vault_id, path],
        |row| {
            let entry_type_int: i64 = row.get(4)?;
            Ok(CacheIndexEntry {
                id: row.get(0)?,
                vault_id: row.get(1)?,
                file_id: row.get(2)?,
                path: row.get(3)?,
                entry_type: if entry_type_int == 0 { CacheEntryType::File } else { CacheEntryType::Thumbnail },
                size: row.get::<_, i64>(5)? as u64,
                last_accessed: row.get::<_, i64>(6)? as u64,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn remove_cache_entry_by_path(conn: &rusqlite::Connection, vault_id: VaultId, path: &str) -> VaultResult<()> {
    conn.execute(
        "delete from cache_index where vault_id = ?1 and path = ?2",
        params![vault_id, path],
    )?;
    Ok(())
}

// --- Vault file listing (§4.J `localFiles`) --------------------------

/// Every file Entry in `vault_id`, paired with its File row — the
/// `localFiles` set a reconcile run compares against the remote listing.
pub fn list_vault_files(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<Vec<(Entry, FileMeta)>> {
    let mut stmt = conn.prepare(
        "select e.id, e.alias, e.parent_id, e.name, e.path, e.vault_id, e.owner_uid, e.group_gid,
                e.mode, e.kind, e.created_by, e.last_modified_by, e.created_at, e.updated_at,
                f.entry_id, f.size_bytes, f.mime_type, f.content_hash, f.encryption_iv, f.encrypted_with_key_version
         from fs_entry e join files f on f.entry_id = e.id
         where e.vault_id = ?1 and e.kind = 0",
    )?;
    let rows = stmt.query_map(params![vault_id], |row| {
        let entry = row_to_entry(row)?;
        let meta = FileMeta {
            entry_id: row.get(14)?,
            size_bytes: row.get::<_, i64>(15)? as u64,
            mime_type: row.get(16)?,
            content_hash: row.get(17)?,
            encryption_iv: row.get(18)?,
            encrypted_with_key_version: row.get(19)?,
        };
        Ok((entry, meta))
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Every directory path already materialized in `vault_id`, for the
/// sync engine's EnsureDirectories phase (`DirectoryQueries::directoryExists`
/// in the original — only directories *not* in this set need creating).
pub fn list_vault_directory_paths(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<std::collections::HashSet<String>> {
    let mut stmt = conn.prepare("select path from fs_entry where vault_id = ?1 and kind = 1")?;
    let rows = stmt.query_map(params![vault_id], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<std::collections::HashSet<_>, _>>().map_err(Into::into)
}

// --- Sync bookkeeping (§4.J/§4.K) ------------------------------------

pub struct SyncState {
    pub last_success_at: Option<u64>,
    pub last_sync_at: Option<u64>,
    pub in_flight: bool,
}

pub fn get_sync_state(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<SyncState> {
    conn.query_row(
        "select last_success_at, last_sync_at, in_flight from sync where vault_id = ?1",
        params![vault_id],
        |row| {
            Ok(SyncState {
                last_success_at: row.get::<_, Option<i64>>(0)?.map(|v| v as u64),
                last_sync_at: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                in_flight: row.get(2)?,
            })
        },
    )
    .map_err(Into::into)
}

pub fn set_in_flight(conn: &rusqlite::Connection, vault_id: VaultId, in_flight: bool) -> VaultResult<()> {
    conn.execute(
        "update sync set in_flight = ?1, last_sync_at = ?2 where vault_id = ?3",
        params![in_flight, now_secs() as i64, vault_id],
    )?;
    Ok(())
}

pub fn record_sync_success(conn: &rusqlite::Connection, vault_id: VaultId) -> VaultResult<()> {
    conn.execute(
        "update sync set last_success_at = ?1 where vault_id = ?2",
        params![now_secs() as i64, vault_id],
    )?;
    Ok(())
}

fn sync_status_to_int(s: SyncStatus) -> i64 {
    match s {
        SyncStatus::Pending => 0,
        SyncStatus::Running => 1,
        SyncStatus::Success => 2,
        SyncStatus::Stalled => 3,
        SyncStatus::Error => 4,
        SyncStatus::Cancelled => 5,
    }
}

fn int_to_sync_status(i: i64) -> SyncStatus {
    match i {
        0 => SyncStatus::Pending,
        1 => SyncStatus::Running,
        2 => SyncStatus::Success,
        3 => SyncStatus::Stalled,
        4 => SyncStatus::Error,
        _ => SyncStatus::Cancelled,
    }
}

fn sync_trigger_to_int(t: SyncTrigger) -> i64 {
    match t {
        SyncTrigger::Schedule => 0,
        SyncTrigger::Manual => 1,
        SyncTrigger::Startup => 2,
        SyncTrigger::Webhook => 3,
        SyncTrigger::Retry => 4,
    }
}

fn int_to_sync_trigger(i: i64) -> SyncTrigger {
    match i {
        0 => SyncTrigger::Schedule,
        1 => SyncTrigger::Manual,
        2 => SyncTrigger::Startup,
        3 => SyncTrigger::Webhook,
        _ => SyncTrigger::Retry,
    }
}

/// Inserts a new `pending` SyncEvent row and marks the vault's `sync`
/// row `in_flight`, inside one transaction.
pub fn begin_sync_event(
    txn: &rusqlite::Transaction,
    vault_id: VaultId,
    run_uuid: &str,
    trigger: SyncTrigger,
    retry_attempt: u32,
) -> VaultResult<i64> {
    let now = now_secs();
    txn.execute(
        "insert into sync_event
            (vault_id, run_uuid, status, trigger, timestamp_begin, heartbeat_at, retry_attempt)
         values (?1, ?2, ?3, ?4, ?5, ?5, ?6)",
        params![vault_id, run_uuid, sync_status_to_int(SyncStatus::Running), sync_trigger_to_int(trigger), now as i64, retry_attempt],
    )?;
    let id = txn.last_insert_rowid();
    txn.execute("update sync set in_flight = 1 where vault_id = ?1", params![vault_id])?;
    Ok(id)
}

pub fn touch_heartbeat(conn: &rusqlite::Connection, sync_event_id: i64) -> VaultResult<()> {
    conn.execute(
        "update sync_event set heartbeat_at = ?1 where id = ?2",
        params![now_secs() as i64, sync_event_id],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn finish_sync_event(
    conn: &rusqlite::Connection,
    sync_event_id: i64,
    status: SyncStatus,
    num_ops_total: u64,
    bytes_up: u64,
    bytes_down: u64,
    error_code: Option<&str>,
    error_message: Option<&str>,
) -> VaultResult<()> {
    conn.execute(
        "update sync_event set status = ?1, timestamp_end = ?2, num_ops_total = ?3,
            bytes_up = ?4, bytes_down = ?5, error_code = ?6, error_message = ?7
         where id = ?8",
        params![
            sync_status_to_int(status),
            now_secs() as i64,
            num_ops_total as i64,
            bytes_up as i64,
            bytes_down as i64,
            error_code,
            error_message,
            sync_event_id,
        ],
    )?;
    let vault_id: VaultId = conn.query_row(
        "select vault_id from sync_event where id = ?1",
        params![sync_event_id],
        |row| row.get(0),
    )?;
    conn.execute("update sync set in_flight = 0 where vault_id = ?1", params![vault_id])?;
    Ok(())
}

pub fn mark_stalled(conn: &rusqlite::Connection, sync_event_id: i64, reason: &str) -> VaultResult<()> {
    conn.execute(
        "update sync_event set status = ?1, stall_reason = ?2 where id = ?3",
        params![sync_status_to_int(SyncStatus::Stalled), reason, sync_event_id],
    )?;
    Ok(())
}

/// Events still marked `running` whose last heartbeat is older than
/// `stall_window_secs`, for the scheduler's stall-detection tick.
pub fn running_events(conn: &rusqlite::Connection) -> VaultResult<Vec<(i64, VaultId, u64, u32)>> {
    let mut stmt = conn.prepare(
        "select id, vault_id, heartbeat_at, retry_attempt from sync_event where status = ?1",
    )?;
    let rows = stmt.query_map(params![sync_status_to_int(SyncStatus::Running)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64, row.get(3)?))
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn insert_throughput(conn: &rusqlite::Connection, sync_event_id: i64, record: &ThroughputRecord) -> VaultResult<()> {
    conn.execute(
        "insert into sync_throughput (sync_event_id, metric, count, bytes, duration_ms, failed)
         values (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            sync_event_id,
            throughput_metric_to_int(record.metric),
            record.count as i64,
            record.bytes as i64,
            record.duration_ms as i64,
            record.failed as i64,
        ],
    )?;
    Ok(())
}

fn throughput_metric_to_int(m: ThroughputMetric) -> i64 {
    match m {
        ThroughputMetric::Upload => 0,
        ThroughputMetric::Download => 1,
        ThroughputMetric::Delete => 2,
    }
}

pub fn insert_conflict(conn: &rusqlite::Connection, sync_event_id: i64, conflict: &SyncConflict) -> VaultResult<()> {
    conn.execute(
        "insert into sync_conflicts (sync_event_id, path, reason_code) values (?1, ?2, ?3)",
        params![sync_event_id, conflict.path, conflict.reason_code],
    )?;
    let conflict_id = conn.last_insert_rowid();
    for artifact in &conflict.artifacts {
        conn.execute(
            "insert into sync_conflict_artifacts (conflict_id, side, size, hash, mtime, iv, key_version)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conflict_id,
                artifact.side as i64,
                artifact.size.map(|v| v as i64),
                artifact.hash,
                artifact.mtime.map(|v| v as i64),
                artifact.iv,
                artifact.key_version,
            ],
        )?;
    }
    Ok(())
}

/// Reassembles a `SyncEvent` with its throughput/conflict children, for
/// reporting (e.g. via the control-plane frame surface).
pub fn get_sync_event(conn: &rusqlite::Connection, id: i64) -> VaultResult<SyncEvent> {
    let mut event = conn.query_row(
        "select id, vault_id, run_uuid, status, trigger, timestamp_begin, timestamp_end, heartbeat_at,
                retry_attempt, num_ops_total, bytes_up, bytes_down, local_state_hash, remote_state_hash,
                config_hash, stall_reason, error_code, error_message
         from sync_event where id = ?1",
        params![id],
        |row| {
            Ok(SyncEvent {
                id: row.get(0)?,
                vault_id: row.get(1)?,
                run_uuid: row.get(2)?,
                status: int_to_sync_status(row.get(3)?),
                trigger: int_to_sync_trigger(row.get(4)?),
                timestamp_begin: row.get::<_, i64>(5)? as u64,
                timestamp_end: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                heartbeat_at: row.get::<_, i64>(7)? as u64,
                retry_attempt: row.get(8)?,
                num_ops_total: row.get::<_, i64>(9)? as u64,
                bytes_up: row.get::<_, i64>(10)? as u64,
                bytes_down: row.get::<_, i64>(11)? as u64,
                local_state_hash: row.get(12)?,
                remote_state_hash: row.get(13)?,
                config_hash: row.get(14)?,
                stall_reason: row.get(15)?,
                error_code: row.get(16)?,
                error_message: row.get(17)?,
                throughputs: Vec::new(),
                conflicts: Vec::new(),
            })
        },
    )?;
    let mut stmt = conn.prepare(
        "select metric, count, bytes, duration_ms, failed from sync_throughput where sync_event_id = ?1",
    )?;
    let throughputs = stmt.query_map(params![id], |row| {
        let metric_int: i64 = row.get(0)?;
        Ok(ThroughputRecord {
            metric: match metric_int {
                0 => ThroughputMetric::Upload,
                1 => ThroughputMetric::Download,
                _ => ThroughputMetric::Delete,
            },
            count: row.get::<_, i64>(1)? as u64,
            bytes: row.get::<_, i64>(2)? as u64,
            duration_ms: row.get::<_, i64>(3)? as u64,
            failed: row.get::<_, i64>(4)? as u64,
        })
    })?;
    event.throughputs = throughputs.collect::<Result<Vec<_>, _>>()?;
    Ok(event)
}

fn now_secs() -> u64 {
    crate::types::now_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    fn open() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        schema::create_all(&conn).unwrap();
        conn
    }

    fn mkdir(txn: &rusqlite::Transaction, id: EntryId, parent_id: EntryId, name: &str, path: &str) {
        let entry = Entry {
            id,
            alias: Alias::generate(),
            parent_id: Some(parent_id),
            name: name.to_string(),
            path: path.to_string(),
            vault_id: Some(1),
            owner_uid: 0,
            group_gid: 0,
            mode: 0o755,
            kind: EntryKind::Directory,
            created_by: None,
            last_modified_by: None,
            created_at: 0,
            updated_at: 0,
        };
        insert_entry(txn, &entry, 0).unwrap();
    }

    fn mkfile(txn: &rusqlite::Transaction, id: EntryId, parent_id: EntryId, name: &str, path: &str, size: u64) {
        let entry = Entry {
            id,
            alias: Alias::generate(),
            parent_id: Some(parent_id),
            name: name.to_string(),
            path: path.to_string(),
            vault_id: Some(1),
            owner_uid: 0,
            group_gid: 0,
            mode: 0o644,
            kind: EntryKind::File,
            created_by: None,
            last_modified_by: None,
            created_at: 0,
            updated_at: 0,
        };
        insert_entry(txn, &entry, size).unwrap();
    }

    /// `size_bytes(d) = sum over children` and counts match, propagated up
    /// two levels in one transaction (§8 quantified invariant).
    #[test]
    fn insert_entry_propagates_stats_to_root() {
        let mut conn = open();
        let txn = conn.transaction().unwrap();
        mkdir(&txn, 2, ROOT_ENTRY_ID, "a", "/a");
        mkdir(&txn, 3, 2, "b", "/a/b");
        mkfile(&txn, 4, 3, "c.txt", "/a/b/c.txt", 100);
        txn.commit().unwrap();

        let root_stats: (i64, i64, i64) = conn
            .query_row("select size_bytes, file_count, subdirectory_count from directories where entry_id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(root_stats, (100, 0, 1));
        let a_stats: (i64, i64, i64) = conn
            .query_row("select size_bytes, file_count, subdirectory_count from directories where entry_id = 2", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(a_stats, (100, 0, 1));
        let b_stats: (i64, i64, i64) = conn
            .query_row("select size_bytes, file_count, subdirectory_count from directories where entry_id = 3", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(b_stats, (100, 1, 0));
    }

    /// `rename /a -> /A` rewrites every descendant's path in the same
    /// transaction (§8 scenario 4).
    #[test]
    fn rename_entry_rewrites_descendant_paths() {
        let mut conn = open();
        let mut txn = conn.transaction().unwrap();
        mkdir(&txn, 2, ROOT_ENTRY_ID, "a", "/a");
        mkdir(&txn, 3, 2, "b", "/a/b");
        mkfile(&txn, 4, 3, "c.txt", "/a/b/c.txt", 10);
        mkdir(&txn, 5, 3, "d", "/a/b/d");
        txn.commit().unwrap();

        txn = conn.transaction().unwrap();
        rename_entry(&txn, 2, ROOT_ENTRY_ID, "A", "/A", "/a").unwrap();
        txn.commit().unwrap();

        let b_path: String = conn.query_row("select path from fs_entry where id = 3", [], |r| r.get(0)).unwrap();
        let c_path: String = conn.query_row("select path from fs_entry where id = 4", [], |r| r.get(0)).unwrap();
        let d_path: String = conn.query_row("select path from fs_entry where id = 5", [], |r| r.get(0)).unwrap();
        assert_eq!(b_path, "/A/b");
        assert_eq!(c_path, "/A/b/c.txt");
        assert_eq!(d_path, "/A/b/d");
    }

    /// Trashing a file deletes the Entry row, inserts a pending tombstone,
    /// and reverses the parent-stats delta it originally contributed.
    #[test]
    fn trash_entry_reverses_parent_stats_and_queues_tombstone() {
        let mut conn = open();
        let mut txn = conn.transaction().unwrap();
        mkfile(&txn, 2, ROOT_ENTRY_ID, "x.txt", "/x.txt", 50);
        txn.commit().unwrap();

        let entry = get_entry_by_id(&conn, 2).unwrap();
        txn = conn.transaction().unwrap();
        let trashed_id = trash_entry(&txn, &entry, 50, "/x.txt", Some(1)).unwrap();
        txn.commit().unwrap();

        assert!(get_entry_by_id(&conn, 2).is_err());
        let root_stats: (i64, i64) = conn
            .query_row("select size_bytes, file_count from directories where entry_id = 1", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(root_stats, (0, 0));

        let pending = pending_trashed_deletes(&conn, 1).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].deleted_at.is_none());

        mark_trashed_deleted(&conn, trashed_id).unwrap();
        assert!(pending_trashed_deletes(&conn, 1).unwrap().is_empty());
    }

    /// An empty, non-root directory whose last child was just removed is
    /// deleted rather than left as a dangling zero-count row.
    #[test]
    fn trash_entry_deletes_emptied_directory() {
        let mut conn = open();
        let mut txn = conn.transaction().unwrap();
        mkdir(&txn, 2, ROOT_ENTRY_ID, "a", "/a");
        mkfile(&txn, 3, 2, "only.txt", "/a/only.txt", 5);
        txn.commit().unwrap();

        let file_entry = get_entry_by_id(&conn, 3).unwrap();
        txn = conn.transaction().unwrap();
        trash_entry(&txn, &file_entry, 5, "/a/only.txt", None).unwrap();
        txn.commit().unwrap();

        let still_there: Option<i64> = conn
            .query_row("select entry_id from directories where entry_id = 2", [], |r| r.get(0))
            .optional()
            .unwrap();
        assert!(still_there.is_none(), "emptied non-root directory row should be deleted");
        // the fs_entry row for /a itself is untouched by this helper.
        assert!(get_entry_by_id(&conn, 2).is_ok());
    }

    /// Vault key rotation: `begin_key_rotation` moves the old key to the
    /// trashed table with `rotation_completed_at = NULL`; completing it
    /// stamps that sentinel.
    #[test]
    fn key_rotation_moves_old_key_to_trashed_until_completed() {
        let mut conn = open();
        conn.execute(
            "insert into vault (id, name, owner_id, vault_type, mount_point) values (1, 'v', 1, 1, '/v')",
            [],
        )
        .unwrap();
        let key_v0 = VaultKey { vault_id: 1, version: 0, wrapped_key: vec![1, 2, 3], wrap_iv: "iv0".into(), created_at: 0 };
        let txn = conn.transaction().unwrap();
        begin_key_rotation(&txn, &key_v0).unwrap();
        txn.commit().unwrap();
        assert_eq!(current_vault_key(&conn, 1).unwrap().unwrap().version, 0);

        let key_v1 = VaultKey { vault_id: 1, version: 1, wrapped_key: vec![4, 5, 6], wrap_iv: "iv1".into(), created_at: 1 };
        let txn = conn.transaction().unwrap();
        begin_key_rotation(&txn, &key_v1).unwrap();
        txn.commit().unwrap();

        assert_eq!(current_vault_key(&conn, 1).unwrap().unwrap().version, 1);
        let pending = pending_trashed_key(&conn, 1).unwrap().unwrap();
        assert_eq!(pending.version, 0);

        complete_key_rotation(&conn, 1, 0).unwrap();
        assert!(pending_trashed_key(&conn, 1).unwrap().is_none());
    }

    /// `vault_usage_bytes` sums across all files in a vault for the quota
    /// check, independent of directory nesting.
    #[test]
    fn vault_usage_bytes_sums_all_files() {
        let mut conn = open();
        let txn = conn.transaction().unwrap();
        mkdir(&txn, 2, ROOT_ENTRY_ID, "a", "/a");
        mkfile(&txn, 3, 2, "x.txt", "/a/x.txt", 30);
        mkfile(&txn, 4, ROOT_ENTRY_ID, "y.txt", "/y.txt", 70);
        txn.commit().unwrap();
        assert_eq!(vault_usage_bytes(&conn, 1).unwrap(), 100);
    }

    /// `list_vault_directory_paths` returns only directories already
    /// materialized, so the sync engine's EnsureDirectories phase can
    /// skip ones that already exist.
    #[test]
    fn list_vault_directory_paths_excludes_files() {
        let mut conn = open();
        let txn = conn.transaction().unwrap();
        mkdir(&txn, 2, ROOT_ENTRY_ID, "docs", "docs");
        mkfile(&txn, 3, 2, "a.txt", "docs/a.txt", 3);
        txn.commit().unwrap();
        let dirs = list_vault_directory_paths(&conn, 1).unwrap();
        assert!(dirs.contains("docs"));
        assert!(!dirs.contains("docs/a.txt"));
    }

    /// Cache eviction candidate ordering: largest entries first.
    #[test]
    fn largest_cache_entries_orders_by_size_desc() {
        let conn = open();
        for (path, size) in [("/a", 10u64), ("/b", 50), ("/c", 30)] {
            insert_cache_entry(
                &conn,
                &CacheIndexEntry { id: 0, vault_id: 1, file_id: 1, path: path.into(), entry_type: CacheEntryType::File, size, last_accessed: 0 },
            )
            .unwrap();
        }
        let top2 = largest_cache_entries(&conn, 1, 2).unwrap();
        assert_eq!(top2.iter().map(|e| e.path.clone()).collect::<Vec<_>>(), vec!["/b", "/c"]);
        assert_eq!(cache_size_total(&conn, 1).unwrap(), 90);
    }
}
