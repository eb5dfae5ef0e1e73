//! Filesystem chunk store.
//!
//! Layout under the data directory:
//! - `files/<hex(id)>`: published content
//! - `partial/<hex(id)>.<fingerprint prefix>`: in-progress downloads
//!
//! The catalog is rebuilt at open by hashing everything under `files/`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use share_core::integrity::FingerprintHasher;
use share_core::{ChunkStore, FileRef, StoreError};
use tracing::{debug, info, warn};

const HASH_BLOCK: usize = 1024 * 1024;

pub struct FsStore {
    root: PathBuf,
    catalog: DashMap<String, FileRef>,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("files"))?;
        fs::create_dir_all(root.join("partial"))?;
        let store = Self {
            root,
            catalog: DashMap::new(),
        };
        store.rescan()?;
        Ok(store)
    }

    fn rescan(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(self.root.join("files"))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(decode_name) else {
                warn!(path = %entry.path().display(), "skipping unrecognized file");
                continue;
            };
            let file = hash_file(&id, &entry.path())?;
            debug!(file = %file, "catalogued");
            self.catalog.insert(id, file);
        }
        info!(root = %self.root.display(), files = self.catalog.len(), "store opened");
        Ok(())
    }

    fn published_path(&self, file_id: &str) -> PathBuf {
        self.root.join("files").join(hex::encode(file_id))
    }

    fn partial_path(&self, file: &FileRef) -> PathBuf {
        let tag = &file.fingerprint.to_hex()[..16];
        self.root
            .join("partial")
            .join(format!("{}.{}", hex::encode(&file.id), tag))
    }

    /// Publish `content` under `id`, replacing any previous version.
    pub fn add_file(&self, id: &str, content: &[u8]) -> Result<FileRef, StoreError> {
        let file = FileRef::from_content(id, content);
        let path = self.published_path(id);
        let staging = path.with_extension("tmp");
        {
            let mut out = File::create(&staging)?;
            out.write_all(content)?;
            out.sync_all()?;
        }
        fs::rename(&staging, &path)?;
        self.catalog.insert(id.to_string(), file.clone());
        Ok(file)
    }

    /// Copy an existing file into the store under `id`.
    pub fn import(&self, id: &str, source: &Path) -> Result<FileRef, StoreError> {
        let path = self.published_path(id);
        let staging = path.with_extension("tmp");
        fs::copy(source, &staging)?;
        let file = hash_file(id, &staging)?;
        fs::rename(&staging, &path)?;
        self.catalog.insert(id.to_string(), file.clone());
        Ok(file)
    }
}

fn decode_name(name: &str) -> Option<String> {
    let bytes = hex::decode(name).ok()?;
    String::from_utf8(bytes).ok()
}

fn hash_file(id: &str, path: &Path) -> Result<FileRef, StoreError> {
    let mut input = File::open(path)?;
    let mut hasher = FingerprintHasher::new();
    let mut buf = vec![0u8; HASH_BLOCK];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let size = hasher.consumed();
    Ok(FileRef::new(id, size, hasher.finalize()))
}

fn read_at(path: &Path, offset: u64, length: u64, id: &str) -> Result<Vec<u8>, StoreError> {
    let mut input = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(id.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let size = input.metadata()?.len();
    if offset.checked_add(length).map_or(true, |end| end > size) {
        return Err(StoreError::OutOfRange {
            offset,
            length,
            size,
        });
    }
    input.seek(SeekFrom::Start(offset))?;
    let mut out = vec![0u8; length as usize];
    input.read_exact(&mut out)?;
    Ok(out)
}

impl ChunkStore for FsStore {
    fn lookup(&self, file_id: &str) -> Option<FileRef> {
        self.catalog.get(file_id).map(|e| e.value().clone())
    }

    fn catalog(&self) -> Vec<FileRef> {
        self.catalog.iter().map(|e| e.value().clone()).collect()
    }

    fn read_range(&self, file: &FileRef, offset: u64, length: u64) -> Result<Vec<u8>, StoreError> {
        if self.lookup(&file.id).as_ref() != Some(file) {
            return Err(StoreError::NotFound(file.id.clone()));
        }
        read_at(&self.published_path(&file.id), offset, length, &file.id)
    }

    fn partial_len(&self, file: &FileRef) -> u64 {
        fs::metadata(self.partial_path(file)).map_or(0, |m| m.len())
    }

    fn read_partial(&self, file: &FileRef, offset: u64, length: u64) -> Result<Vec<u8>, StoreError> {
        read_at(&self.partial_path(file), offset, length, &file.id)
    }

    fn write_range(&self, file: &FileRef, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let length = data.len() as u64;
        if offset.checked_add(length).map_or(true, |end| end > file.size) {
            return Err(StoreError::OutOfRange {
                offset,
                length,
                size: file.size,
            });
        }
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.partial_path(file))?;
        let current = out.metadata()?.len();
        if offset > current {
            return Err(StoreError::OutOfRange {
                offset,
                length,
                size: current,
            });
        }
        out.set_len(offset)?;
        out.seek(SeekFrom::Start(offset))?;
        out.write_all(data)?;
        out.sync_data()?;
        Ok(())
    }

    fn discard_partial(&self, file: &FileRef) -> Result<(), StoreError> {
        match fs::remove_file(self.partial_path(file)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&self, file: &FileRef) -> Result<(), StoreError> {
        let partial = self.partial_path(file);
        if file.size == 0 && !partial.exists() {
            File::create(&partial)?;
        }
        let actual = self.partial_len(file);
        if actual != file.size {
            return Err(StoreError::Incomplete {
                id: file.id.clone(),
                actual,
                expected: file.size,
            });
        }
        fs::rename(&partial, self.published_path(&file.id))?;
        self.catalog.insert(file.id.clone(), file.clone());
        info!(file = %file, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = {
            let store = FsStore::open(dir.path()).unwrap();
            store.add_file("docs/readme.txt", b"hello world").unwrap()
        };
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.lookup("docs/readme.txt"), Some(file.clone()));
        assert_eq!(store.read_range(&file, 6, 5).unwrap(), b"world");
        assert!(matches!(
            store.read_range(&file, 6, 6),
            Err(StoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn partial_write_then_publish() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let file = FileRef::from_content("f1", &content);

        store.write_range(&file, 0, &content[..4096]).unwrap();
        assert!(matches!(
            store.write_range(&file, 8192, &content[8192..]),
            Err(StoreError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.publish(&file),
            Err(StoreError::Incomplete { .. })
        ));
        // Rewriting an earlier range truncates after it.
        store.write_range(&file, 0, &content[..2048]).unwrap();
        assert_eq!(store.partial_len(&file), 2048);
        store.write_range(&file, 2048, &content[2048..]).unwrap();
        assert_eq!(store.read_partial(&file, 0, 16).unwrap(), content[..16]);
        store.publish(&file).unwrap();

        assert_eq!(store.partial_len(&file), 0);
        assert_eq!(store.lookup("f1"), Some(file.clone()));
        assert_eq!(store.read_range(&file, 0, 10_000).unwrap(), content);
    }

    #[test]
    fn discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let file = FileRef::from_content("f1", b"abc");
        store.write_range(&file, 0, b"ab").unwrap();
        store.discard_partial(&file).unwrap();
        store.discard_partial(&file).unwrap();
        assert_eq!(store.partial_len(&file), 0);
    }

    #[test]
    fn import_hashes_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("upload.bin");
        fs::write(&src, b"imported bytes").unwrap();
        let store = FsStore::open(dir.path().join("data")).unwrap();
        let file = store.import("upload", &src).unwrap();
        assert_eq!(file, FileRef::from_content("upload", b"imported bytes"));
    }
}
