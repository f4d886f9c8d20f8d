//! Envelope encryption: AES-256-GCM per-vault data keys wrapped under an
//! opaque master key. Grounded on the AEAD usage idiom in
//! `agucova-oxidized-cryptolib/crates/oxcrypt-core` (the `aes-gcm` crate,
//! `zeroize` on key material) since the teacher has no crypto of its own.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A key handle that zeroes its backing bytes on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn new(bytes: [u8; KEY_LEN]) -> KeyMaterial {
        KeyMaterial(bytes)
    }

    pub fn generate() -> KeyMaterial {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        KeyMaterial(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Opaque capability yielding a 32-byte key. The production binding is
/// TPM-backed; this crate only consumes the interface.
pub trait MasterKeyProvider: Send + Sync {
    fn master_key(&self) -> VaultResult<KeyMaterial>;
}

/// In-memory stand-in for tests and `dev.enabled` configurations. Never
/// used when `dev.enabled` is false.
pub struct InMemoryMasterKeyProvider {
    key: KeyMaterial,
}

impl InMemoryMasterKeyProvider {
    pub fn new(key: KeyMaterial) -> InMemoryMasterKeyProvider {
        InMemoryMasterKeyProvider { key }
    }

    pub fn ephemeral() -> InMemoryMasterKeyProvider {
        InMemoryMasterKeyProvider {
            key: KeyMaterial::generate(),
        }
    }
}

impl MasterKeyProvider for InMemoryMasterKeyProvider {
    fn master_key(&self) -> VaultResult<KeyMaterial> {
        Ok(self.key.clone())
    }
}

fn cipher_for(key: &[u8; KEY_LEN]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Result of an encrypt call: ciphertext with the GCM tag appended, plus
/// the nonce used.
pub struct Sealed {
    pub ciphertext_with_tag: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
}

/// Encrypts `plaintext` under `key`, generating a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &KeyMaterial) -> VaultResult<Sealed> {
    let mut iv = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let cipher = cipher_for(key.as_bytes());
    let nonce = Nonce::from_slice(&iv);
    let ciphertext_with_tag = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(VaultError::from)?;
    Ok(Sealed { ciphertext_with_tag, iv })
}

/// Decrypts `ciphertext_with_tag` under `key` and `iv`. Fails with
/// `AuthError` on tag mismatch.
pub fn decrypt(ciphertext_with_tag: &[u8], key: &KeyMaterial, iv: &[u8]) -> VaultResult<Vec<u8>> {
    if iv.len() != NONCE_LEN {
        return Err(VaultError::InvalidArgument("bad IV length".to_string()));
    }
    let cipher = cipher_for(key.as_bytes());
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext_with_tag, aad: &[] })
        .map_err(VaultError::from)
}

/// Wraps a per-vault data key under the master key. Returns the same
/// ciphertext+IV shape as `encrypt`.
pub fn wrap(data_key: &KeyMaterial, master_key: &KeyMaterial) -> VaultResult<Sealed> {
    encrypt(data_key.as_bytes(), master_key)
}

/// Unwraps a wrapped per-vault data key.
pub fn unwrap(wrapped: &[u8], master_key: &KeyMaterial, iv: &[u8]) -> VaultResult<KeyMaterial> {
    let plaintext = decrypt(wrapped, master_key, iv)?;
    if plaintext.len() != KEY_LEN {
        return Err(VaultError::Corrupt("unwrapped key has wrong length".to_string()));
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&plaintext);
    let mut plaintext = plaintext;
    plaintext.zeroize();
    Ok(KeyMaterial::new(bytes))
}

pub fn iv_to_base64(iv: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(iv)
}

pub fn iv_from_base64(s: &str) -> VaultResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| VaultError::Corrupt(e.to_string()))
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_of_encrypt_round_trips() {
        let key = KeyMaterial::generate();
        let sealed = encrypt(b"hello, world", &key).unwrap();
        let plain = decrypt(&sealed.ciphertext_with_tag, &key, &sealed.iv).unwrap();
        assert_eq!(plain, b"hello, world");
    }

    #[test]
    fn tampered_ciphertext_fails_with_auth_error() {
        let key = KeyMaterial::generate();
        let mut sealed = encrypt(b"hello, world", &key).unwrap();
        let last = sealed.ciphertext_with_tag.len() - 1;
        sealed.ciphertext_with_tag[last] ^= 0xff;
        let result = decrypt(&sealed.ciphertext_with_tag, &key, &sealed.iv);
        assert!(matches!(result, Err(VaultError::AuthError(_))));
    }

    #[test]
    fn wrap_unwrap_round_trips_a_data_key() {
        let master = KeyMaterial::generate();
        let data_key = KeyMaterial::generate();
        let sealed = wrap(&data_key, &master).unwrap();
        let unwrapped = unwrap(&sealed.ciphertext_with_tag, &master, &sealed.iv).unwrap();
        assert_eq!(unwrapped.as_bytes(), data_key.as_bytes());
    }

    #[test]
    fn ciphertext_is_plaintext_length_plus_tag() {
        let key = KeyMaterial::generate();
        let sealed = encrypt(b"abc", &key).unwrap();
        assert_eq!(sealed.ciphertext_with_tag.len(), 3 + TAG_LEN);
    }
}
