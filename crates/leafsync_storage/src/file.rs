//! File-based storage backend for persistent storage.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   .lock                      exclusive process lock
//!   records%2Fnotes%2F42       one file per key
//!   records%2Fnotes%2F42.tmp.<uuid>   in-flight write (never read)
//! ```
//!
//! File names are a reversible escaping of the key: ASCII letters, digits,
//! `_` and `-` are kept, every other byte becomes `%XX`. Escaped names never
//! contain `.`, so temporary files and the lock file can't collide with a key.
//!
//! A key whose escaped name would be too long for the file system is stored
//! under a truncated escape followed by `~` and the SHA-256 of the key. Those
//! files start with a header holding the full key (a big-endian `u32` length
//! and the UTF-8 bytes) so [`Storage::keys`] can still list it.

use crate::backend::{validate_key, Storage};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_FILE: &str = ".lock";
const TEMP_MARKER: &str = ".tmp.";
/// Longest escaped file name we are willing to create.
const MAX_FILE_NAME_LEN: usize = 240;
/// Escaped characters kept in front of the hash of an over-long key.
const HASHED_PREFIX_LEN: usize = 96;
/// Separates the readable prefix from the hash. Escaping never produces it.
const HASH_MARKER: char = '~';

/// A file-based storage backend.
///
/// Each key maps to one file under the root directory. Data survives process
/// restarts.
///
/// # Durability
///
/// `set` writes the value to a temporary file, `fsync`s it, renames it over
/// the destination and `fsync`s the directory. A crash at any point leaves
/// either the old value or the new one readable, never a partial write.
/// Leftover temporary files are removed by [`FileStorage::open`].
///
/// # Thread Safety
///
/// This backend is thread-safe. The root directory is locked against other
/// processes for as long as the backend is alive.
///
/// # Example
///
/// ```no_run
/// use leafsync_storage::{FileStorage, Storage};
///
/// # async fn demo() -> leafsync_storage::StorageResult<()> {
/// let storage = FileStorage::open("/var/lib/reader/store").await?;
/// storage.set("settings/theme", b"dark").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    _lock: File,
}

impl FileStorage {
    /// Opens or creates a file storage rooted at `root`.
    ///
    /// Creates the directory if needed, takes the process lock and removes
    /// temporary files left behind by interrupted writes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the
    /// directory, or an I/O error if it can't be created.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(root))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?
    }

    fn open_blocking(root: PathBuf) -> StorageResult<Self> {
        std::fs::create_dir_all(&root)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if let Err(err) = lock.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(StorageError::Locked);
            }
            return Err(err.into());
        }

        let mut removed = 0usize;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().contains(TEMP_MARKER) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(root = %root.display(), removed, "removed interrupted writes");
        }

        Ok(Self { root, _lock: lock })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file for `key` and whether it carries a key header.
    fn path_for(&self, key: &str) -> StorageResult<(PathBuf, bool)> {
        validate_key(key)?;
        let name = file_name(key);
        let hashed = name.contains(HASH_MARKER);
        Ok((self.root.join(name), hashed))
    }

    #[cfg(unix)]
    async fn sync_directory(&self) -> StorageResult<()> {
        let dir = tokio::fs::File::open(&self.root).await?;
        dir.sync_all().await?;
        Ok(())
    }

    /// NTFS journals metadata updates, directories can't be fsynced there.
    #[cfg(not(unix))]
    async fn sync_directory(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let (path, hashed) = self.path_for(key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !hashed {
            return Ok(Some(data));
        }
        match split_header(&data) {
            Some((stored, value)) if stored == key => Ok(Some(value.to_vec())),
            Some((stored, _)) => {
                warn!(%key, %stored, "hashed file name collision");
                Ok(None)
            }
            None => Err(StorageError::Corrupted(format!(
                "missing key header in {}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let (path, hashed) = self.path_for(key)?;
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(format!("{TEMP_MARKER}{}", Uuid::new_v4().simple()));
        let temp_path = PathBuf::from(temp_name);

        let written: io::Result<()> = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            if hashed {
                file.write_all(&key_header(key)).await?;
            }
            file.write_all(value).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                debug!(path = %temp_path.display(), error = %cleanup, "temp file cleanup failed");
            }
            return Err(err.into());
        }

        self.sync_directory().await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let (path, _) = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.sync_directory().await?;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.contains('.') {
                continue;
            }
            let decoded = if name.contains(HASH_MARKER) {
                read_header_key(&entry.path()).await?
            } else {
                decode_name(name)
            };
            match decoded {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => debug!(name, "skipping foreign file"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Returns the file name for `key`, hashing it if the escape is too long.
fn file_name(key: &str) -> String {
    let name = encode_key(key);
    if name.len() <= MAX_FILE_NAME_LEN {
        return name;
    }
    // Don't cut through a `%XX` escape.
    let mut cut = HASHED_PREFIX_LEN;
    if let Some(pos) = name[..cut].rfind('%') {
        if pos + 3 > cut {
            cut = pos;
        }
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut hashed = String::with_capacity(cut + 1 + digest.len() * 2);
    hashed.push_str(&name[..cut]);
    hashed.push(HASH_MARKER);
    for byte in digest {
        hashed.push_str(&format!("{byte:02x}"));
    }
    hashed
}

fn key_header(key: &str) -> Vec<u8> {
    let mut header = Vec::with_capacity(4 + key.len());
    header.extend_from_slice(&(key.len() as u32).to_be_bytes());
    header.extend_from_slice(key.as_bytes());
    header
}

/// Splits a hashed file into its stored key and value.
fn split_header(data: &[u8]) -> Option<(&str, &[u8])> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let key = data.get(4..4 + len)?;
    Some((std::str::from_utf8(key).ok()?, &data[4 + len..]))
}

/// Reads only the key header of a hashed file.
async fn read_header_key(path: &Path) -> StorageResult<Option<String>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        // Deleted between listing and reading.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut len_bytes = [0u8; 4];
    if file.read_exact(&mut len_bytes).await.is_err() {
        return Ok(None);
    }
    let mut key = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
    if file.read_exact(&mut key).await.is_err() {
        return Ok(None);
    }
    Ok(String::from_utf8(key).ok())
}

/// Escapes a key into a file name.
fn encode_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

/// Reverses [`encode_key`]. Returns `None` for names we didn't produce.
fn decode_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = name.get(i + 1..i + 3)?;
                if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return None;
                }
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_create_new() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");

        let storage = FileStorage::open(&root).await.unwrap();
        assert!(root.exists());
        assert!(storage.keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_set_and_get() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();

        storage.set("records/notes/1", b"hello").await.unwrap();
        assert_eq!(
            storage.get("records/notes/1").await.unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn file_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_delete() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();

        storage.set("k", b"v").await.unwrap();
        assert!(storage.delete("k").await.unwrap());
        assert!(!storage.delete("k").await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_keys_by_prefix_sorted() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();

        storage.set("b/2", b"").await.unwrap();
        storage.set("b/1", b"").await.unwrap();
        storage.set("a/1", b"").await.unwrap();

        assert_eq!(storage.keys("b/").await.unwrap(), vec!["b/1", "b/2"]);
        assert_eq!(storage.keys("").await.unwrap(), vec!["a/1", "b/1", "b/2"]);
    }

    #[tokio::test]
    async fn file_persistence() {
        let dir = tempdir().unwrap();

        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage.set("persistent", b"data").await.unwrap();
        }

        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(
            storage.get("persistent").await.unwrap(),
            Some(b"data".to_vec())
        );
    }

    #[tokio::test]
    async fn crash_before_rename_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        storage.set("doc", b"committed value").await.unwrap();

        // A writer died after writing part of the temp file, before rename.
        let temp = dir.path().join(format!("{}{}dead", encode_key("doc"), TEMP_MARKER));
        std::fs::write(&temp, b"partial wr").unwrap();

        assert_eq!(
            storage.get("doc").await.unwrap(),
            Some(b"committed value".to_vec())
        );
        assert_eq!(storage.keys("").await.unwrap(), vec!["doc"]);

        drop(storage);
        let reopened = FileStorage::open(dir.path()).await.unwrap();
        assert!(!temp.exists());
        assert_eq!(
            reopened.get("doc").await.unwrap(),
            Some(b"committed value".to_vec())
        );
    }

    #[tokio::test]
    async fn crash_on_first_write_leaves_key_absent() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();

        let temp = dir.path().join(format!("{}{}dead", encode_key("new"), TEMP_MARKER));
        std::fs::write(&temp, b"half").unwrap();

        assert_eq!(storage.get("new").await.unwrap(), None);
        assert!(storage.keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_set_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        storage.set("doc", b"v1").await.unwrap();

        // Dropping the future before polling it to completion must not tear the value.
        let big = vec![7u8; 1 << 20];
        let fut = storage.set("doc", &big);
        drop(fut);

        assert_eq!(storage.get("doc").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStorage::open(dir.path()).await.unwrap();
        let second = FileStorage::open(dir.path()).await;
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[tokio::test]
    async fn long_non_ascii_keys_are_stored() {
        let dir = tempdir().unwrap();
        let key = "records/bookmarks/創世記第一章起初神創造天地地是空虛混沌淵面黑暗神的靈運行";
        assert!(encode_key(key).len() > MAX_FILE_NAME_LEN);

        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage.set(key, b"Genesis 1:2").await.unwrap();
            storage.set("records/bookmarks/short", b"s").await.unwrap();
            assert_eq!(
                storage.get(key).await.unwrap(),
                Some(b"Genesis 1:2".to_vec())
            );
        }

        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(
            storage.keys("records/bookmarks/").await.unwrap(),
            vec!["records/bookmarks/short".to_string(), key.to_string()]
        );
        assert_eq!(
            storage.get(key).await.unwrap(),
            Some(b"Genesis 1:2".to_vec())
        );
        assert!(storage.delete(key).await.unwrap());
        assert_eq!(storage.get(key).await.unwrap(), None);
        assert_eq!(storage.keys("").await.unwrap(), vec!["records/bookmarks/short"]);
    }

    #[test]
    fn long_keys_get_bounded_distinct_names() {
        let a = "/".repeat(100);
        let b = format!("{}x", "/".repeat(100));
        let name_a = file_name(&a);
        let name_b = file_name(&b);
        assert!(name_a.len() <= MAX_FILE_NAME_LEN);
        assert!(name_a.contains(HASH_MARKER));
        assert!(!name_a.contains('.'));
        assert_ne!(name_a, name_b);
        // The prefix never ends inside an escape.
        let prefix = name_a.split(HASH_MARKER).next().unwrap();
        assert_eq!(decode_name(prefix).map(|k| k.len()), Some(prefix.len() / 3));
    }

    #[test]
    fn short_keys_keep_plain_names() {
        assert_eq!(file_name("records/notes/1"), encode_key("records/notes/1"));
    }

    #[test]
    fn escaping_is_reversible() {
        let key = "records/bookmarks/ab.c d%é";
        let name = encode_key(key);
        assert!(!name.contains('.'));
        assert!(!name.contains('/'));
        assert_eq!(decode_name(&name).as_deref(), Some(key));
    }

    #[test]
    fn foreign_names_are_rejected() {
        assert_eq!(decode_name("has space"), None);
        assert_eq!(decode_name("bad%G1"), None);
        assert_eq!(decode_name("trailing%4"), None);
        assert_eq!(decode_name("sign%+1"), None);
    }

    proptest! {
        #[test]
        fn escaping_roundtrips_any_key(key in "\\PC{1,60}") {
            let name = encode_key(&key);
            prop_assert_eq!(decode_name(&name), Some(key));
        }

        #[test]
        fn distinct_keys_get_distinct_names(a in "\\PC{1,20}", b in "\\PC{1,20}") {
            prop_assume!(a != b);
            prop_assert_ne!(encode_key(&a), encode_key(&b));
        }
    }
}
