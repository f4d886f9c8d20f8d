//! Local storage engine variant: root is a directory on the backing
//! filesystem; ops translate relative paths via the path model and use
//! standard POSIX calls. Encryption applies only when the owning vault
//! declares `encrypt_upstream`.

use std::fs;
use std::path::PathBuf;

use crate::crypto::{self, KeyMaterial};
use crate::error::{VaultError, VaultResult};
use crate::path::PathRoots;
use crate::types::{FileMeta, Vault};

pub struct LocalEngine {
    vault: Vault,
    roots: PathRoots,
    data_key: Option<KeyMaterial>,
    key_version: i64,
}

impl LocalEngine {
    pub fn new(vault: Vault, roots: PathRoots) -> LocalEngine {
        LocalEngine {
            vault,
            roots,
            data_key: None,
            key_version: 0,
        }
    }

    pub fn with_key(mut self, data_key: KeyMaterial, key_version: i64) -> LocalEngine {
        self.data_key = Some(data_key);
        self.key_version = key_version;
        self
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    fn backing_path(&self, rel: &str) -> VaultResult<PathBuf> {
        self.roots
            .abs(rel, crate::types::PathType::BackingVaultRoot, Some(self.vault.id))
            .ok_or_else(|| VaultError::InvalidArgument(format!("vault {} has no registered root", self.vault.id)))
    }

    fn encrypts(&self) -> bool {
        self.vault.encrypt_upstream
    }

    pub fn read_file(&self, rel: &str) -> VaultResult<Vec<u8>> {
        let path = self.backing_path(rel)?;
        let raw = fs::read(&path)?;
        if self.encrypts() {
            let key = self
                .data_key
                .as_ref()
                .ok_or_else(|| VaultError::Corrupt("no data key loaded for encrypted vault".to_string()))?;
            if raw.len() < crypto::NONCE_LEN {
                return Err(VaultError::Corrupt("ciphertext shorter than nonce".to_string()));
            }
            let (iv, ciphertext) = raw.split_at(crypto::NONCE_LEN);
            crypto::decrypt(ciphertext, key, iv)
        } else {
            Ok(raw)
        }
    }

    /// Encrypts into ciphertext using the vault's current key if
    /// required; the caller (filesystem ops) records iv/version/hash in
    /// the metadata store using the returned `FileMeta`.
    pub fn write_file(&self, rel: &str, bytes: &[u8]) -> VaultResult<FileMeta> {
        let path = self.backing_path(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content_hash = crypto::sha256_hex(bytes);
        if self.encrypts() {
            let key = self
                .data_key
                .as_ref()
                .ok_or_else(|| VaultError::Corrupt("no data key loaded for encrypted vault".to_string()))?;
            let sealed = crypto::encrypt(bytes, key)?;
            let mut on_disk = Vec::with_capacity(crypto::NONCE_LEN + sealed.ciphertext_with_tag.len());
            on_disk.extend_from_slice(&sealed.iv);
            on_disk.extend_from_slice(&sealed.ciphertext_with_tag);
            fs::write(&path, &on_disk)?;
            Ok(FileMeta {
                entry_id: 0,
                size_bytes: bytes.len() as u64,
                mime_type: None,
                content_hash: Some(content_hash),
                encryption_iv: Some(crypto::iv_to_base64(&sealed.iv)),
                encrypted_with_key_version: Some(self.key_version),
            })
        } else {
            fs::write(&path, bytes)?;
            Ok(FileMeta {
                entry_id: 0,
                size_bytes: bytes.len() as u64,
                mime_type: None,
                content_hash: Some(content_hash),
                encryption_iv: None,
                encrypted_with_key_version: None,
            })
        }
    }

    pub fn mkdir(&self, rel: &str) -> VaultResult<()> {
        let path = self.backing_path(rel)?;
        fs::create_dir_all(path)?;
        Ok(())
    }

    pub fn move_path(&self, from: &str, to: &str) -> VaultResult<()> {
        let from = self.backing_path(from)?;
        let to = self.backing_path(to)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }

    pub fn copy_path(&self, from: &str, to: &str) -> VaultResult<()> {
        let from = self.backing_path(from)?;
        let to = self.backing_path(to)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(from, to)?;
        }
        Ok(())
    }

    pub fn remove(&self, rel: &str) -> VaultResult<()> {
        let path = self.backing_path(rel)?;
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn free_space(&self) -> VaultResult<u64> {
        statvfs_free_bytes(&self.roots.backing_root)
    }

    pub fn vault_size(&self) -> VaultResult<u64> {
        let root = self.backing_path("")?;
        Ok(dir_size(&root).unwrap_or(0))
    }

    pub fn purge_thumbnails(&self, _rel: &str) -> VaultResult<()> {
        // Local engine has no separate thumbnail cache; thumbnails only
        // exist under the cloud cache roots.
        Ok(())
    }
}

fn copy_dir_recursive(from: &std::path::Path, to: &std::path::Path) -> VaultResult<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

fn dir_size(path: &std::path::Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                total += dir_size(&entry.path())?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn statvfs_free_bytes(path: &std::path::Path) -> VaultResult<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| VaultError::InvalidArgument(e.to_string()))?;
    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        let rc = libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr());
        if rc != 0 {
            return Err(VaultError::FatalIo("statvfs failed".to_string()));
        }
        let stat = stat.assume_init();
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn statvfs_free_bytes(_path: &std::path::Path) -> VaultResult<u64> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyMaterial;
    use crate::types::VaultType;

    fn vault(encrypt_upstream: bool) -> Vault {
        Vault {
            id: 1,
            name: "v".into(),
            owner_id: 1,
            vault_type: VaultType::Local,
            mount_point: "vaults/1".into(),
            quota_bytes: 0,
            is_active: true,
            sync_policy: crate::types::SyncPolicy::Safe,
            sync_enabled: false,
            api_key_id: None,
            bucket: None,
            encrypt_upstream,
        }
    }

    fn engine(dir: &tempfile::TempDir, encrypt_upstream: bool) -> LocalEngine {
        let mut roots = PathRoots::new(dir.path().join("mnt"), dir.path().join("backing"));
        roots.register_vault(1, "vaults/1");
        let mut engine = LocalEngine::new(vault(encrypt_upstream), roots);
        if encrypt_upstream {
            engine = engine.with_key(KeyMaterial::new([7u8; 32]), 0);
        }
        engine
    }

    #[test]
    fn write_then_read_round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, false);
        let meta = engine.write_file("docs/a.txt", b"hello, world").unwrap();
        assert_eq!(meta.encryption_iv, None);
        assert_eq!(meta.size_bytes, 12);
        let bytes = engine.read_file("docs/a.txt").unwrap();
        assert_eq!(bytes, b"hello, world");
    }

    #[test]
    fn write_then_read_round_trips_through_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, true);
        let meta = engine.write_file("docs/a.txt", b"hello, world").unwrap();
        assert!(meta.encryption_iv.is_some());
        assert_eq!(meta.encrypted_with_key_version, Some(0));
        // on-disk bytes are ciphertext+tag, never plaintext.
        let path = engine.backing_path("docs/a.txt").unwrap();
        let on_disk = fs::read(&path).unwrap();
        assert_ne!(on_disk, b"hello, world");
        let bytes = engine.read_file("docs/a.txt").unwrap();
        assert_eq!(bytes, b"hello, world");
    }

    #[test]
    fn move_then_copy_operate_on_backing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, false);
        engine.write_file("a.txt", b"data").unwrap();
        engine.move_path("a.txt", "b.txt").unwrap();
        assert!(engine.read_file("a.txt").is_err());
        assert_eq!(engine.read_file("b.txt").unwrap(), b"data");
        engine.copy_path("b.txt", "c.txt").unwrap();
        assert_eq!(engine.read_file("c.txt").unwrap(), b"data");
        assert_eq!(engine.read_file("b.txt").unwrap(), b"data");
    }
}
