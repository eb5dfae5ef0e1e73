//! Chunk Store Adapter: the synchronous seam to whatever actually holds file bytes.
//!
//! Sources read published content by range. Destinations write into a partial
//! copy keyed by the full FileRef, then either publish it or discard it.

use std::sync::Arc;

use dashmap::DashMap;

use crate::identity::FileRef;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("range {offset}+{length} outside {size} bytes")]
    OutOfRange { offset: u64, length: u64, size: u64 },
    #[error("partial content of {id} is {actual} bytes, expected {expected}")]
    Incomplete { id: String, actual: u64, expected: u64 },
    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Storage operations the P2P core consumes. Implementations must allow concurrent
/// reads of the same file; writes for one FileRef are serialized by the session table.
pub trait ChunkStore: Send + Sync {
    /// Published FileRef for an identifier.
    fn lookup(&self, file_id: &str) -> Option<FileRef>;

    /// Every published file.
    fn catalog(&self) -> Vec<FileRef>;

    /// Read a byte range of published content.
    fn read_range(&self, file: &FileRef, offset: u64, length: u64) -> Result<Vec<u8>, StoreError>;

    /// Bytes of partial content held for `file`.
    fn partial_len(&self, file: &FileRef) -> u64;

    /// Read a byte range of partial content.
    fn read_partial(&self, file: &FileRef, offset: u64, length: u64)
        -> Result<Vec<u8>, StoreError>;

    /// Write into partial content. `offset` may not leave a gap; writing below the
    /// current end truncates there first.
    fn write_range(&self, file: &FileRef, offset: u64, data: &[u8]) -> Result<(), StoreError>;

    /// Drop partial content. Missing partial content is not an error.
    fn discard_partial(&self, file: &FileRef) -> Result<(), StoreError>;

    /// Promote complete partial content to published content.
    fn publish(&self, file: &FileRef) -> Result<(), StoreError>;
}

fn check_range(offset: u64, length: u64, size: u64) -> Result<(), StoreError> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StoreError::OutOfRange {
            offset,
            length,
            size,
        }),
    }
}

/// In-memory store. Used for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    published: DashMap<String, (FileRef, Arc<Vec<u8>>)>,
    partial: DashMap<FileRef, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish content under `id`, deriving size and fingerprint from it.
    pub fn insert(&self, id: &str, content: Vec<u8>) -> FileRef {
        let file = FileRef::from_content(id, &content);
        self.published
            .insert(id.to_string(), (file.clone(), Arc::new(content)));
        file
    }

    /// Publish content under a FileRef supplied by the caller, without hashing.
    /// Models a catalog whose metadata is trusted from elsewhere.
    pub fn insert_unchecked(&self, file: FileRef, content: Vec<u8>) {
        self.published
            .insert(file.id.clone(), (file, Arc::new(content)));
    }

    /// Published bytes for an identifier.
    pub fn content(&self, file_id: &str) -> Option<Arc<Vec<u8>>> {
        self.published.get(file_id).map(|e| e.value().1.clone())
    }

    /// Copy of the partial bytes for `file`.
    pub fn partial(&self, file: &FileRef) -> Option<Vec<u8>> {
        self.partial.get(file).map(|e| e.value().clone())
    }
}

impl ChunkStore for MemoryStore {
    fn lookup(&self, file_id: &str) -> Option<FileRef> {
        self.published.get(file_id).map(|e| e.value().0.clone())
    }

    fn catalog(&self) -> Vec<FileRef> {
        self.published.iter().map(|e| e.value().0.clone()).collect()
    }

    fn read_range(&self, file: &FileRef, offset: u64, length: u64) -> Result<Vec<u8>, StoreError> {
        let entry = self
            .published
            .get(&file.id)
            .ok_or_else(|| StoreError::NotFound(file.id.clone()))?;
        let (stored, content) = entry.value();
        if stored != file {
            return Err(StoreError::NotFound(file.id.clone()));
        }
        let size = content.len() as u64;
        check_range(offset, length, size)?;
        Ok(content[offset as usize..(offset + length) as usize].to_vec())
    }

    fn partial_len(&self, file: &FileRef) -> u64 {
        self.partial.get(file).map_or(0, |e| e.value().len() as u64)
    }

    fn read_partial(
        &self,
        file: &FileRef,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StoreError> {
        let entry = self
            .partial
            .get(file)
            .ok_or_else(|| StoreError::NotFound(file.id.clone()))?;
        let size = entry.value().len() as u64;
        check_range(offset, length, size)?;
        Ok(entry.value()[offset as usize..(offset + length) as usize].to_vec())
    }

    fn write_range(&self, file: &FileRef, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        check_range(offset, data.len() as u64, file.size)?;
        let mut entry = self.partial.entry(file.clone()).or_default();
        let buf = entry.value_mut();
        let current = buf.len() as u64;
        if offset > current {
            return Err(StoreError::OutOfRange {
                offset,
                length: data.len() as u64,
                size: current,
            });
        }
        buf.truncate(offset as usize);
        buf.extend_from_slice(data);
        Ok(())
    }

    fn discard_partial(&self, file: &FileRef) -> Result<(), StoreError> {
        self.partial.remove(file);
        Ok(())
    }

    fn publish(&self, file: &FileRef) -> Result<(), StoreError> {
        let content = match self.partial.remove(file) {
            Some((_, content)) => content,
            None if file.size == 0 => Vec::new(),
            None => return Err(StoreError::NotFound(file.id.clone())),
        };
        if content.len() as u64 != file.size {
            let actual = content.len() as u64;
            self.partial.insert(file.clone(), content);
            return Err(StoreError::Incomplete {
                id: file.id.clone(),
                actual,
                expected: file.size,
            });
        }
        self.published
            .insert(file.id.clone(), (file.clone(), Arc::new(content)));
        Ok(())
    }
}
