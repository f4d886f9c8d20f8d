//! Vault key rotation: swaps an S3 vault's envelope-encryption data key
//! and drains re-encryption of files still sealed under the outgoing
//! one. Grounded on the same begin/drain-worker shape as the sync
//! engine's own background reconciliation, generalized to cover
//! key material rather than file bytes.

use log::{debug, info, warn};

use crate::crypto::{self, KeyMaterial, MasterKeyProvider};
use crate::db::queries;
use crate::error::{VaultError, VaultResult};
use crate::fsops::FsOps;
use crate::types::{VaultId, VaultKey};

/// Files re-encrypted per `drain_rotation` call, bounding how long a
/// single scheduler tick spends on any one vault.
const REENCRYPT_BATCH_SIZE: u32 = 200;

/// Generates a new data key, wraps it under the master key, records it
/// as current (trashing the outgoing key with `rotation_completed_at =
/// NULL`), and installs it on the live `CloudEngine` so new writes pick
/// it up immediately. A no-op if a rotation is already in flight for
/// this vault — callers must drain to completion before starting
/// another.
pub fn begin_rotation(fsops: &FsOps, vault_id: VaultId, master_key: &dyn MasterKeyProvider) -> VaultResult<()> {
    if fsops.pool_with(|conn| queries::pending_trashed_key(conn, vault_id))?.is_some() {
        return Err(VaultError::Conflict(format!("vault {} already has a rotation in progress", vault_id)));
    }
    let engine = fsops.manager().engine_for(vault_id)?;
    let cloud = engine
        .as_cloud()
        .ok_or_else(|| VaultError::InvalidArgument(format!("vault {} has no cloud engine", vault_id)))?;

    let new_data_key = KeyMaterial::generate();
    let new_version = cloud.current_key_version() + 1;
    let master = master_key.master_key()?;
    let sealed = crypto::wrap(&new_data_key, &master)?;
    let new_key_row = VaultKey {
        vault_id,
        version: new_version,
        wrapped_key: sealed.ciphertext_with_tag,
        wrap_iv: crypto::iv_to_base64(&sealed.iv),
        created_at: crate::types::now_secs(),
    };
    fsops.pool().transaction(|txn| queries::begin_key_rotation(txn, &new_key_row))?;
    cloud.rotate_key(new_data_key, new_version);
    info!(target: crate::logging::TARGET_SYNC, "vault {} rotated to key version {}", vault_id, new_version);
    Ok(())
}

/// Re-encrypts up to `REENCRYPT_BATCH_SIZE` files still sealed under the
/// trashed key, one scheduler-tick batch at a time. Returns the number
/// re-encrypted. Marks the trashed key `rotation_completed_at` once no
/// file references it anymore. A vault with no rotation in flight is a
/// cheap no-op (single `pending_trashed_key` lookup).
pub fn drain_rotation(fsops: &FsOps, vault_id: VaultId, master_key: &dyn MasterKeyProvider) -> VaultResult<u64> {
    let Some(outgoing) = fsops.pool_with(|conn| queries::pending_trashed_key(conn, vault_id))? else {
        return Ok(0);
    };
    let engine = fsops.manager().engine_for(vault_id)?;
    let cloud = engine
        .as_cloud()
        .ok_or_else(|| VaultError::InvalidArgument(format!("vault {} has no cloud engine", vault_id)))?;

    let master = master_key.master_key()?;
    let old_data_key = crypto::unwrap(&outgoing.wrapped_key, &master, &crypto::iv_from_base64(&outgoing.wrap_iv)?)?;
    let current_version = cloud.current_key_version();

    let batch = fsops.pool_with(|conn| {
        queries::files_needing_reencryption(conn, vault_id, current_version, REENCRYPT_BATCH_SIZE)
    })?;
    let mut reencrypted = 0u64;
    for (entry, mut meta) in batch {
        match cloud.reencrypt_file(&entry.path, &old_data_key) {
            Ok(new_meta) => {
                meta.entry_id = entry.id;
                meta.size_bytes = new_meta.size_bytes;
                meta.encryption_iv = new_meta.encryption_iv;
                meta.encrypted_with_key_version = new_meta.encrypted_with_key_version;
                fsops.pool().transaction(|txn| queries::update_file_meta_propagating(txn, &meta))?;
                reencrypted += 1;
            }
            Err(err) => {
                warn!(target: crate::logging::TARGET_SYNC, "vault {} rotation drain: failed to re-encrypt {}: {}", vault_id, entry.path, err);
            }
        }
    }
    if reencrypted > 0 {
        debug!(target: crate::logging::TARGET_SYNC, "vault {} rotation drain: re-encrypted {} files", vault_id, reencrypted);
    }

    let remaining = fsops.pool_with(|conn| queries::count_files_needing_reencryption(conn, vault_id, current_version))?;
    if remaining == 0 {
        fsops.pool_with(|conn| queries::complete_key_rotation(conn, vault_id, outgoing.version))?;
        info!(target: crate::logging::TARGET_SYNC, "vault {} rotation from key version {} complete", vault_id, outgoing.version);
    }
    Ok(reencrypted)
}
