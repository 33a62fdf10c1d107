//! Bundle format and resource manager internals
//!
//! - [`header`] - Binary layouts: bundle header, directory entry, chunk header
//! - [`compression`] - Chunk codecs (LZ4, Zstd) with raw fallback
//! - [`block`] - Resident blocks, stage memory and pointer relocation
//! - [`chunk_builder`] - Structured chunk construction
//! - [`writer`] - Dependency-ordered bundle writer
//! - [`reader`] - Streaming bundle reader and stage dispatch
//! - [`memory_bundle`] - Resident chunk presented as a bundle
//! - [`free_list`] - Indexed free lists with slot generations
//! - [`name`] - `storage$name$subobject` resource names
//! - [`handle`] - Resolved and unresolved resource handles
//! - [`cache`] - Published resources and in-flight loads
//! - [`storage`] - Disk and memory storage backends
//! - [`manager`] - Resource manager
//! - [`registry`] - Manager index registry
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ResourceName ──► ResourceManager ──► Storage (disk / mem)
//!                     │    ▲                 │
//!                     │    │ publish         ▼
//!                     │  ResourceCache   BundleReader / InMemoryBundle
//!                     │                      │
//!                     └── handlers ◄─────────┘ relocated ResourceBlock
//! ```

pub mod block;
pub mod cache;
pub mod chunk_builder;
pub mod compression;
pub mod config;
pub mod error;
pub mod free_list;
pub mod handle;
pub mod header;
pub mod manager;
pub mod memory_bundle;
pub mod name;
pub mod reader;
pub mod registry;
pub mod storage;
pub mod writer;

pub use block::{BlockAllocator, BlockLayout, HeapAllocator, ResourceBlock, MAX_STAGES};
pub use cache::{CacheStats, ResourceCache};
pub use chunk_builder::ChunkBuilder;
pub use compression::{CompressionConfig, CompressionMethod};
pub use config::{DiskStorageConfig, ManagerConfig};
pub use error::{BundleError, ErrorCode, Result};
pub use free_list::{ConcurrentFreeList, FreeList, INVALID_INDEX};
pub use handle::{HandleState, ResourceHandle};
pub use header::{AddressWidth, BundleHeader, ChunkHeader, DirectoryEntry};
pub use manager::{InitContext, ResourceHandler, ResourceManager, TypeHooks};
pub use memory_bundle::InMemoryBundle;
pub use name::ResourceName;
pub use reader::{
    BundleReader, ChunkInfo, ChunkSource, DirectoryInfo, Handlers, LoadedChunk, ReadOutcome,
    StageHandler,
};
pub use registry::ManagerRegistry;
pub use storage::{DiskStorage, MemoryStorage, Storage};
pub use writer::{BundleWriter, ChunkType, WriterConfig};
