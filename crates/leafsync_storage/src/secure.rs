//! Encrypted storage for credentials and tokens.
//!
//! [`SecureStorage`] wraps any other backend with AES-256-GCM encryption at
//! rest. The key material is never stored next to the data: it is released
//! by a [`Vault`] (the platform credential store), which may refuse while the
//! device is locked.
//!
//! ## Value Format
//!
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//!
//! The storage key is bound to the ciphertext as associated data, so a value
//! copied under a different key fails authentication.

use crate::backend::Storage;
use crate::error::{StorageError, StorageResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::RngCore;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for AES-256-GCM.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random encryption key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::Encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a passphrase using HKDF-SHA256.
    ///
    /// HKDF is appropriate for high-entropy input such as a generated
    /// device secret, not for short user-chosen passwords.
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"leafsync-secure-storage-v1", &mut bytes)
            .map_err(|_| StorageError::Encryption("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A platform credential vault that releases the storage key.
///
/// Implementations back onto the host's keychain or keystore. While the
/// vault is locked, [`Vault::master_key`] must fail with
/// [`StorageError::AccessDenied`]; callers treat that as retryable.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Returns the key used to encrypt secure storage values.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AccessDenied`] while the vault is locked.
    async fn master_key(&self) -> StorageResult<EncryptionKey>;
}

/// An in-process vault holding its key in memory.
///
/// Stands in for the OS credential store in tests and on hosts without one.
/// It starts unlocked and can be locked to simulate a device that has not
/// been unlocked since boot.
#[derive(Debug)]
pub struct MemoryVault {
    key: EncryptionKey,
    locked: RwLock<bool>,
}

impl MemoryVault {
    /// Creates an unlocked vault holding `key`.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            key,
            locked: RwLock::new(false),
        }
    }

    /// Creates an unlocked vault with a freshly generated key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(EncryptionKey::generate())
    }

    /// Locks the vault; key requests fail until [`unlock`](Self::unlock).
    pub fn lock(&self) {
        *self.locked.write() = true;
    }

    /// Unlocks the vault.
    pub fn unlock(&self) {
        *self.locked.write() = false;
    }

    /// Returns true if the vault is locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        *self.locked.read()
    }
}

#[async_trait]
impl Vault for MemoryVault {
    async fn master_key(&self) -> StorageResult<EncryptionKey> {
        if self.is_locked() {
            return Err(StorageError::AccessDenied("vault is locked".into()));
        }
        Ok(self.key.clone())
    }
}

/// A storage backend that encrypts every value before handing it to an
/// inner backend.
///
/// Keys are stored in the clear (they must stay listable); values are
/// AES-256-GCM encrypted with a fresh random nonce per write.
///
/// # Example
///
/// ```rust
/// use leafsync_storage::{MemoryStorage, MemoryVault, SecureStorage, Storage};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// rt.block_on(async {
///     let vault = Arc::new(MemoryVault::generate());
///     let secure = SecureStorage::new(Arc::new(MemoryStorage::new()), vault.clone());
///     secure.set("auth/refresh-token", b"s3cret").await.unwrap();
///
///     vault.lock();
///     assert!(secure.get("auth/refresh-token").await.is_err());
/// });
/// ```
pub struct SecureStorage {
    inner: Arc<dyn Storage>,
    vault: Arc<dyn Vault>,
}

impl SecureStorage {
    /// Creates a secure storage over `inner`, keyed by `vault`.
    pub fn new(inner: Arc<dyn Storage>, vault: Arc<dyn Vault>) -> Self {
        Self { inner, vault }
    }

    async fn cipher(&self) -> StorageResult<Aes256Gcm> {
        let key = self.vault.master_key().await?;
        Ok(Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())))
    }

    fn encrypt(cipher: &Aes256Gcm, key: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let payload = Payload {
            msg: plaintext,
            aad: key.as_bytes(),
        };
        let ciphertext = cipher
            .encrypt(nonce, payload)
            .map_err(|_| StorageError::Encryption("encryption error".into()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    fn decrypt(cipher: &Aes256Gcm, key: &str, data: &[u8]) -> StorageResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StorageError::Encryption("ciphertext too short".into()));
        }
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let payload = Payload {
            msg: &data[NONCE_SIZE..],
            aad: key.as_bytes(),
        };
        cipher
            .decrypt(nonce, payload)
            .map_err(|_| StorageError::Encryption("authentication failed".into()))
    }
}

impl std::fmt::Debug for SecureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Storage for SecureStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let cipher = self.cipher().await?;
        match self.inner.get(key).await? {
            Some(data) => Self::decrypt(&cipher, key, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let cipher = self.cipher().await?;
        let sealed = Self::encrypt(&cipher, key, value)?;
        debug!(key, len = value.len(), "writing sealed value");
        self.inner.set(key, &sealed).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.vault.master_key().await?;
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.vault.master_key().await?;
        self.inner.keys(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    fn fixture() -> (Arc<MemoryStorage>, Arc<MemoryVault>, SecureStorage) {
        let inner = Arc::new(MemoryStorage::new());
        let vault = Arc::new(MemoryVault::new(
            EncryptionKey::from_bytes(&[0x42u8; KEY_SIZE]).unwrap(),
        ));
        let secure = SecureStorage::new(inner.clone(), vault.clone());
        (inner, vault, secure)
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let (inner, _vault, secure) = fixture();
        secure.set("token", b"Hello, encrypted world!").await.unwrap();

        assert_eq!(
            secure.get("token").await.unwrap(),
            Some(b"Hello, encrypted world!".to_vec())
        );
        let raw = inner.snapshot("token").unwrap();
        assert_eq!(raw.len(), NONCE_SIZE + 23 + TAG_SIZE);
        assert!(!raw.windows(9).any(|w| w == b"encrypted"));
    }

    #[tokio::test]
    async fn locked_vault_denies_access() {
        let (_inner, vault, secure) = fixture();
        secure.set("token", b"abc").await.unwrap();

        vault.lock();
        let err = secure.get("token").await.unwrap_err();
        assert!(matches!(err, StorageError::AccessDenied(_)));
        assert!(err.is_retryable());
        assert!(matches!(
            secure.set("token", b"x").await,
            Err(StorageError::AccessDenied(_))
        ));

        vault.unlock();
        assert_eq!(secure.get("token").await.unwrap(), Some(b"abc".to_vec()));
    }

    #[tokio::test]
    async fn tampered_data_fails() {
        let (inner, _vault, secure) = fixture();
        secure.set("token", b"Secret data").await.unwrap();

        let mut raw = inner.snapshot("token").unwrap();
        raw[NONCE_SIZE + 1] ^= 0xFF;
        inner.set("token", &raw).await.unwrap();

        assert!(matches!(
            secure.get("token").await,
            Err(StorageError::Encryption(_))
        ));
    }

    #[tokio::test]
    async fn value_moved_to_other_key_fails() {
        let (inner, _vault, secure) = fixture();
        secure.set("a", b"Secret data").await.unwrap();
        let raw = inner.snapshot("a").unwrap();
        inner.set("b", &raw).await.unwrap();

        assert!(secure.get("b").await.is_err());
    }

    #[tokio::test]
    async fn different_keys_fail() {
        let inner = Arc::new(MemoryStorage::new());
        let writer = SecureStorage::new(inner.clone(), Arc::new(MemoryVault::generate()));
        let reader = SecureStorage::new(inner.clone(), Arc::new(MemoryVault::generate()));

        writer.set("token", b"Secret data").await.unwrap();
        assert!(reader.get("token").await.is_err());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let (_inner, _vault, secure) = fixture();
        assert_eq!(secure.get("absent").await.unwrap(), None);
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let a = EncryptionKey::derive_from_passphrase(b"device-secret", b"salt").unwrap();
        let b = EncryptionKey::derive_from_passphrase(b"device-secret", b"salt").unwrap();
        let c = EncryptionKey::derive_from_passphrase(b"device-secret", b"pepper").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }

    #[test]
    fn invalid_key_size() {
        assert!(EncryptionKey::from_bytes(&[0u8; 16]).is_err());
    }
}
