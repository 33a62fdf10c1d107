//! # resbundle - Resource Bundles and a Concurrent Resource Manager
//!
//! `resbundle` reads and writes a binary bundle format holding named, typed,
//! versioned chunks, and manages the resources loaded from them:
//!
//! - **Bundles** with CRC-checked, optionally compressed chunks and pointer
//!   fixups for 32-bit and 64-bit layouts
//! - **Dependency-ordered writer** so depended-upon chunk types come first
//! - **Staged loading**: several subsystems can process one resource in turn
//! - **Resource manager** with stable name indices, a shared cache and
//!   pluggable disk and memory storage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resbundle::{BundleWriter, ChunkType, ManagerConfig, ResourceManager, ResourceName, Result, TypeHooks, WriterConfig};
//!
//! # fn main() -> Result<()> {
//! // Write a bundle with one text chunk
//! let mut writer = BundleWriter::new(WriterConfig::default());
//! writer.add_raw_text_chunk("greeting", ChunkType::new(1), "hello")?;
//! let bytes = writer.build_to_vec(0)?;
//!
//! // Serve it from memory
//! let manager = ResourceManager::from_config(&ManagerConfig::default())?;
//! if let Some(memory) = manager.memory_storage() {
//!     memory.insert_bundle("intro", bytes);
//! }
//! manager.register_handler(1, |_: &mut resbundle::InitContext<'_>, _: &mut resbundle::ResourceBlock| true, TypeHooks::new())?;
//!
//! let handle = manager.get_index_from_name(1, &ResourceName::new("mem$intro$greeting"))?;
//! let text = manager.acquire(&handle);
//! assert_eq!(text.data(), b"hello\0");
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    block, cache, chunk_builder, compression, config, error, free_list, handle, header, manager,
    memory_bundle, name, reader, registry, storage, writer,
};

// Re-export the types users need
pub use crate::core::{
    AddressWidth, BlockAllocator, BlockLayout, BundleError, BundleHeader, BundleReader,
    BundleWriter, CacheStats, ChunkBuilder, ChunkInfo, ChunkSource, ChunkType, CompressionConfig,
    CompressionMethod, ConcurrentFreeList, DirectoryInfo, DiskStorage, DiskStorageConfig,
    ErrorCode, FreeList, HandleState, Handlers, HeapAllocator, InMemoryBundle, InitContext,
    LoadedChunk, ManagerConfig, ManagerRegistry, MemoryStorage, ReadOutcome, ResourceBlock,
    ResourceHandle, ResourceHandler, ResourceManager, ResourceName, Result, StageHandler, Storage,
    TypeHooks, WriterConfig, INVALID_INDEX, MAX_STAGES,
};
