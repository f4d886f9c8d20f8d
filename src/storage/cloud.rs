//! Cloud storage engine variant: routes reads/writes through an
//! S3-compatible endpoint, maintains a local decrypted-or-original
//! cache under `FILE_CACHE_ROOT`, and supports cache-mode's
//! index-without-materializing behavior.

use std::collections::HashMap;
use std::fs;

use parking_lot::RwLock;

use crate::config::CachingConfig;
use crate::crypto::{self, KeyMaterial};
use crate::db::{queries, Pool};
use crate::error::{VaultError, VaultResult};
use crate::path::PathRoots;
use crate::s3::client::S3Client;
use crate::types::{CacheEntryType, CacheIndexEntry, FileMeta, Vault};

pub struct CloudEngine {
    vault: Vault,
    roots: PathRoots,
    client: S3Client,
    pool: Pool,
    caching: CachingConfig,
    // Rotation (§3 supplement) swaps these in place on a live engine, so
    // they can't be plain fields: in-flight uploads must keep seeing a
    // consistent key/version pair even as the scheduler rotates the vault.
    data_key: RwLock<KeyMaterial>,
    key_version: RwLock<i64>,
}

impl CloudEngine {
    pub fn new(
        vault: Vault,
        roots: PathRoots,
        client: S3Client,
        pool: Pool,
        caching: CachingConfig,
        data_key: KeyMaterial,
        key_version: i64,
    ) -> CloudEngine {
        CloudEngine {
            vault,
            roots,
            client,
            pool,
            caching,
            data_key: RwLock::new(data_key),
            key_version: RwLock::new(key_version),
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn current_key_version(&self) -> i64 {
        *self.key_version.read()
    }

    /// Installs a newly-rotated key as the one future uploads (and
    /// decrypts of files already re-encrypted under it) use. Files still
    /// encrypted under the old version remain readable only via
    /// `reencrypt_file`'s explicit `old_key` argument until the drain
    /// worker catches them up.
    pub fn rotate_key(&self, new_key: KeyMaterial, new_version: i64) {
        *self.data_key.write() = new_key;
        *self.key_version.write() = new_version;
    }

    fn object_key(&self, rel: &str) -> String {
        crate::path::join(&self.vault.mount_point, rel)
    }

    fn cache_path(&self, rel: &str) -> VaultResult<std::path::PathBuf> {
        self.roots
            .abs(rel, crate::types::PathType::FileCacheRoot, Some(self.vault.id))
            .ok_or_else(|| VaultError::InvalidArgument("no cache root configured".to_string()))
    }

    fn user_metadata(&self, meta: &FileMeta) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Some(hash) = &meta.content_hash {
            metadata.insert("content-hash".to_string(), hash.clone());
        }
        if let Some(iv) = &meta.encryption_iv {
            metadata.insert("encryption-iv".to_string(), iv.clone());
        }
        if let Some(version) = meta.encrypted_with_key_version {
            metadata.insert("key-version".to_string(), version.to_string());
        }
        metadata
    }

    /// Uploads ciphertext (or plaintext if `encrypt_upstream=false`)
    /// with the standard user-metadata triple.
    pub fn upload(&self, rel: &str, plaintext: &[u8]) -> VaultResult<FileMeta> {
        let content_hash = crypto::sha256_hex(plaintext);
        let (body, meta) = if self.vault.encrypt_upstream {
            let data_key = self.data_key.read();
            let sealed = crypto::encrypt(plaintext, &data_key)?;
            let meta = FileMeta {
                entry_id: 0,
                size_bytes: plaintext.len() as u64,
                mime_type: None,
                content_hash: Some(content_hash),
                encryption_iv: Some(crypto::iv_to_base64(&sealed.iv)),
                encrypted_with_key_version: Some(*self.key_version.read()),
            };
            (sealed.ciphertext_with_tag, meta)
        } else {
            let meta = FileMeta {
                entry_id: 0,
                size_bytes: plaintext.len() as u64,
                mime_type: None,
                content_hash: Some(content_hash),
                encryption_iv: None,
                encrypted_with_key_version: None,
            };
            (plaintext.to_vec(), meta)
        };
        let metadata = self.user_metadata(&meta);
        self.client.upload_object(&self.object_key(rel), &body, &metadata)?;
        Ok(meta)
    }

    /// GET, decrypt if metadata says so, write to cache, insert a
    /// CacheIndex row.
    pub fn download_file(&self, rel: &str) -> VaultResult<Vec<u8>> {
        let key = self.object_key(rel);
        let metadata = self.client.head_object(&key)?;
        let tmp_dest = self.cache_path(rel)?;
        if let Some(parent) = tmp_dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.client.download_object(&key, &tmp_dest)?;
        let raw = fs::read(&tmp_dest)?;
        let plaintext = if let Some(iv_b64) = metadata.get("encryption-iv") {
            let iv = crypto::iv_from_base64(iv_b64)?;
            crypto::decrypt(&raw, &self.data_key.read(), &iv)?
        } else {
            raw
        };
        fs::write(&tmp_dest, &plaintext)?;
        self.pool.with_conn(|conn| {
            queries::insert_cache_entry(
                conn,
                &CacheIndexEntry {
                    id: 0,
                    vault_id: self.vault.id,
                    file_id: 0,
                    path: rel.to_string(),
                    entry_type: CacheEntryType::File,
                    size: plaintext.len() as u64,
                    last_accessed: crate::types::now_secs(),
                },
            )
        })?;
        Ok(plaintext)
    }

    /// Used in cache-mode to register that a file exists remotely
    /// without materializing bytes locally.
    pub fn index_and_delete_file(&self, rel: &str) -> VaultResult<()> {
        let cache_path = self.cache_path(rel)?;
        if cache_path.exists() {
            fs::remove_file(&cache_path)?;
        }
        self.pool.with_conn(|conn| queries::remove_cache_entry_by_path(conn, self.vault.id, rel))
    }

    /// Evicts a single cache-index row and its backing bytes by path,
    /// used by the cache-budget eviction loop (largest-first, doubling
    /// batch size).
    pub fn evict_cache_entry(&self, rel: &str) -> VaultResult<()> {
        self.index_and_delete_file(rel)
    }

    pub fn get_remote_content_hash(&self, rel: &str) -> VaultResult<Option<String>> {
        let metadata = self.client.head_object(&self.object_key(rel))?;
        Ok(metadata.get("content-hash").cloned())
    }

    /// Parses `ListBucketResult` into a path -> size map keyed on the
    /// relative path (vault prefix stripped).
    pub fn grouped_files_from_s3(&self) -> VaultResult<HashMap<String, u64>> {
        let prefix = format!("{}/", self.vault.mount_point.trim_matches('/'));
        let result = self.client.list_objects(&prefix)?;
        let mut map = HashMap::new();
        for content in result.contents {
            let rel = content.key.strip_prefix(&prefix).unwrap_or(&content.key);
            map.insert(rel.to_string(), content.size);
        }
        Ok(map)
    }

    pub fn read_file(&self, rel: &str) -> VaultResult<Vec<u8>> {
        let cached = self.cache_path(rel)?;
        if cached.exists() {
            Ok(fs::read(cached)?)
        } else {
            self.download_file(rel)
        }
    }

    pub fn write_file(&self, rel: &str, bytes: &[u8]) -> VaultResult<FileMeta> {
        let meta = self.upload(rel, bytes)?;
        let cached = self.cache_path(rel)?;
        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(cached, bytes)?;
        Ok(meta)
    }

    pub fn mkdir(&self, _rel: &str) -> VaultResult<()> {
        // S3 has no real directories; EnsureDirectories is a metadata-only
        // operation the sync engine performs against the store.
        Ok(())
    }

    pub fn move_path(&self, from: &str, to: &str) -> VaultResult<()> {
        let bytes = self.read_file(from)?;
        self.write_file(to, &bytes)?;
        self.remove(from)
    }

    pub fn copy_path(&self, from: &str, to: &str) -> VaultResult<()> {
        let bytes = self.read_file(from)?;
        self.write_file(to, &bytes)?;
        Ok(())
    }

    pub fn remove(&self, rel: &str) -> VaultResult<()> {
        self.client.delete_object(&self.object_key(rel))?;
        let cached = self.cache_path(rel)?;
        if cached.exists() {
            fs::remove_file(cached)?;
        }
        Ok(())
    }

    pub fn free_space(&self) -> VaultResult<u64> {
        let max_bytes = self.caching.max_size_mb * 1024 * 1024;
        let used = self.cache_size()?;
        Ok(max_bytes.saturating_sub(used))
    }

    pub fn vault_size(&self) -> VaultResult<u64> {
        let files = self.grouped_files_from_s3()?;
        Ok(files.values().sum())
    }

    pub fn cache_size(&self) -> VaultResult<u64> {
        self.pool.with_conn(|conn| queries::cache_size_total(conn, self.vault.id))
    }

    pub fn purge_thumbnails(&self, rel: &str) -> VaultResult<()> {
        let path = self
            .roots
            .abs(rel, crate::types::PathType::ThumbnailRoot, Some(self.vault.id))
            .ok_or_else(|| VaultError::InvalidArgument("no thumbnail root configured".to_string()))?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Re-seals one object under the engine's current key. `old_key`
    /// decrypts the object as it stands (a no-op pass-through if the
    /// object was never encrypted); the object is then re-uploaded
    /// sealed under whichever key `rotate_key` most recently installed,
    /// and the on-disk cache copy (if any) is refreshed to match. Used
    /// only by the rotation drain in the scheduler — never called with
    /// an object this engine didn't write.
    pub fn reencrypt_file(&self, rel: &str, old_key: &KeyMaterial) -> VaultResult<FileMeta> {
        let key = self.object_key(rel);
        let metadata = self.client.head_object(&key)?;
        let mut raw = Vec::new();
        let tmp = self.cache_path(rel)?;
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        self.client.download_object(&key, &tmp)?;
        raw.extend(fs::read(&tmp)?);
        let plaintext = if let Some(iv_b64) = metadata.get("encryption-iv") {
            let iv = crypto::iv_from_base64(iv_b64)?;
            crypto::decrypt(&raw, old_key, &iv)?
        } else {
            raw
        };
        let meta = self.upload(rel, &plaintext)?;
        fs::write(&tmp, &plaintext)?;
        Ok(meta)
    }
}
