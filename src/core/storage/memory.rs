//! Bundles and resident chunks held in memory

use super::Storage;
use crate::block::BlockAllocator;
use crate::error::{BundleError, Result};
use crate::memory_bundle::InMemoryBundle;
use crate::name::ResourceName;
use crate::reader::{BundleReader, ChunkSource, Handlers, ReadOutcome};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum MemoryEntry {
    /// Serialized bundle, read like a file
    Bundle(Bytes),
    /// Already resident chunk, delivered without copying
    Resident(InMemoryBundle),
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    prefix: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStorage {
    pub fn new(prefix: impl Into<String>) -> Self {
        MemoryStorage {
            prefix: prefix.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register serialized bundle bytes under `name`
    pub fn insert_bundle(&self, name: impl Into<String>, bytes: impl Into<Bytes>) {
        self.entries
            .write()
            .insert(name.into(), MemoryEntry::Bundle(bytes.into()));
    }

    /// Register a resident chunk under `name`
    pub fn insert_resident(&self, name: impl Into<String>, chunk: InMemoryBundle) {
        self.entries
            .write()
            .insert(name.into(), MemoryEntry::Resident(chunk));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn read(
        &self,
        name: &ResourceName<'_>,
        handlers: &Handlers<'_>,
        allocator: Arc<dyn BlockAllocator>,
    ) -> Result<ReadOutcome> {
        let entry = self
            .entries
            .read()
            .get(name.name())
            .cloned()
            .ok_or(BundleError::NotFound)?;

        match entry {
            MemoryEntry::Bundle(bytes) => BundleReader::new(Cursor::new(bytes))?
                .with_allocator(allocator)
                .read(name.subobject(), handlers),
            MemoryEntry::Resident(mut chunk) => chunk.read(name.subobject(), handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{HeapAllocator, ResourceBlock};
    use crate::reader::ChunkInfo;
    use crate::writer::{BundleWriter, ChunkType, WriterConfig};

    fn accept(_: &ChunkInfo<'_>, _: &mut ResourceBlock) -> bool {
        true
    }

    #[test]
    fn test_bundle_and_resident_entries() {
        let storage = MemoryStorage::new("mem");
        let mut writer = BundleWriter::new(WriterConfig::default());
        writer.add_raw_text_chunk("a", ChunkType::new(1), "alpha").unwrap();
        storage.insert_bundle("pack", writer.build_to_vec(0).unwrap());
        storage.insert_resident(
            "raw",
            InMemoryBundle::new(1, 1, 0, "only", Bytes::from_static(b"resident")),
        );
        assert_eq!(storage.len(), 2);

        let handlers = Handlers::new().with(1, accept);
        let allocator: Arc<dyn BlockAllocator> = Arc::new(HeapAllocator::default());

        let outcome = storage
            .read(&ResourceName::new("mem$pack$a"), &handlers, allocator.clone())
            .unwrap();
        assert_eq!(outcome.chunks[0].block.data(), b"alpha\0");

        let outcome = storage
            .read(&ResourceName::new("mem$raw"), &handlers, allocator.clone())
            .unwrap();
        assert!(outcome.chunks[0].block.is_shared());

        assert!(matches!(
            storage.read(&ResourceName::new("mem$missing"), &handlers, allocator),
            Err(BundleError::NotFound)
        ));
    }
}
