//! Bundle reader
//!
//! Reads a bundle from any `Read + Seek` stream positioned at its header.
//! The reader walks `Unopened → HeaderRead → DirectoryLoaded → Done`, loading
//! the directory and string table once and then streaming chunks in stored
//! order without seeking backwards.
//!
//! For every chunk whose type has a registered [`StageHandler`]:
//!
//! 1. the stored bytes are read and their CRC checked
//! 2. compressed chunks are expanded into a scratch buffer and checked again
//! 3. a [`ResourceBlock`] is allocated through the caller's allocator
//! 4. the data region is copied and every fixup relocated
//! 5. handler stages run in ascending order, each with its extra memory
//!
//! A failure aborts the read. Handlers that already ran for earlier chunks
//! are not undone.

use crate::block::{BlockAllocator, BlockLayout, HeapAllocator, ResourceBlock, MAX_STAGES};
use crate::compression::{decompress_into, CompressionMethod};
use crate::error::{BundleError, Result};
use crate::header::{AddressWidth, BundleHeader, ChunkHeader, DirectoryEntry, HEADER_SIZE};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default ceiling on a single stored or uncompressed chunk
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 1 << 30;

/// What a stage handler is told about the chunk it processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo<'a> {
    pub name: &'a str,
    pub type_id: u32,
    pub stage: usize,
    pub version_major: u16,
    pub version_minor: u16,
}

/// One processing stage for a chunk type
pub trait StageHandler {
    /// Bytes of extra memory this stage needs in the block
    fn extra_memory(&self) -> usize {
        0
    }

    /// Ask for the stage prefix even without extra memory
    fn wants_prefix(&self) -> bool {
        false
    }

    /// Process a relocated block; `false` rejects the chunk
    fn process(&self, chunk: &ChunkInfo<'_>, block: &mut ResourceBlock) -> bool;
}

impl<F> StageHandler for F
where
    F: Fn(&ChunkInfo<'_>, &mut ResourceBlock) -> bool,
{
    fn process(&self, chunk: &ChunkInfo<'_>, block: &mut ResourceBlock) -> bool {
        self(chunk, block)
    }
}

pub type StageSlots<'h> = [Option<Box<dyn StageHandler + 'h>>; MAX_STAGES];

/// Handler stages keyed by chunk type id
#[derive(Default)]
pub struct Handlers<'h> {
    by_type: HashMap<u32, StageSlots<'h>>,
}

impl<'h> Handlers<'h> {
    pub fn new() -> Self {
        Handlers::default()
    }

    /// Install `handler` as stage `stage` of `type_id`, replacing any previous one
    pub fn set(
        &mut self,
        type_id: u32,
        stage: usize,
        handler: impl StageHandler + 'h,
    ) -> Result<()> {
        if stage >= MAX_STAGES {
            return Err(BundleError::Config(format!(
                "Stage {} exceeds the {} supported stages",
                stage, MAX_STAGES
            )));
        }
        self.by_type.entry(type_id).or_default()[stage] = Some(Box::new(handler));
        Ok(())
    }

    /// Builder form of [`Handlers::set`] for stage 0
    pub fn with(mut self, type_id: u32, handler: impl StageHandler + 'h) -> Self {
        self.by_type.entry(type_id).or_default()[0] = Some(Box::new(handler));
        self
    }

    pub fn stages(&self, type_id: u32) -> Option<&StageSlots<'h>> {
        self.by_type
            .get(&type_id)
            .filter(|slots| slots.iter().any(Option::is_some))
    }

    pub fn handles(&self, type_id: u32) -> bool {
        self.stages(type_id).is_some()
    }

    pub fn type_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_type.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// A chunk that passed every handler stage
#[derive(Debug, Clone)]
pub struct LoadedChunk {
    pub name: String,
    pub type_id: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub block: Arc<ResourceBlock>,
}

/// Result of a successful read
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    /// Opaque value from the bundle header
    pub user_data: u64,
    pub chunks: Vec<LoadedChunk>,
    /// Chunks with no handler or a different name
    pub skipped: usize,
    /// Chunks a handler stage refused
    pub rejected: usize,
}

/// Directory entry with its name resolved, for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryInfo {
    pub name: String,
    pub type_id: u32,
    pub codec: Option<CompressionMethod>,
    pub stored_offset: u64,
    pub stored_size: u64,
    pub uncompressed_size: u64,
    pub stored_crc: u32,
    pub uncompressed_crc: u32,
}

/// Anything that can deliver chunks to handlers
pub trait ChunkSource {
    fn directory_count(&mut self) -> Result<usize>;

    /// Load the chunk named `name`, or every chunk when `name` is empty
    fn read(&mut self, name: &str, handlers: &Handlers<'_>) -> Result<ReadOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReaderState {
    Unopened,
    HeaderRead,
    DirectoryLoaded,
    Done,
}

pub struct BundleReader<R> {
    inner: R,
    origin: u64,
    /// Stream position relative to `origin`
    position: u64,
    state: ReaderState,
    header: Option<BundleHeader>,
    width: AddressWidth,
    entries: Vec<DirectoryEntry>,
    strings: Vec<u8>,
    allocator: Arc<dyn BlockAllocator>,
    stored: Vec<u8>,
    scratch: Vec<u8>,
    max_chunk_size: u64,
}

impl BundleReader<BufReader<File>> {
    /// Open a bundle file through a buffered reader
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        BundleReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> BundleReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let origin = inner.stream_position()?;
        Ok(BundleReader {
            inner,
            origin,
            position: 0,
            state: ReaderState::Unopened,
            header: None,
            width: AddressWidth::host(),
            entries: Vec::new(),
            strings: Vec::new(),
            allocator: Arc::new(HeapAllocator::default()),
            stored: Vec::new(),
            scratch: Vec::new(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        })
    }

    /// Allocate resident blocks through `allocator`
    pub fn with_allocator(mut self, allocator: Arc<dyn BlockAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: u64) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn header(&self) -> Option<&BundleHeader> {
        self.header.as_ref()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the header without validating it and seek back to the start
    pub fn peek_header(&mut self) -> Result<BundleHeader> {
        if let Some(header) = self.header {
            return Ok(header);
        }
        self.inner.seek(SeekFrom::Start(self.origin))?;
        let mut raw = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut raw)?;
        self.inner.seek(SeekFrom::Start(self.origin))?;
        self.position = 0;
        BundleHeader::from_bytes(&raw)
    }

    fn read_header(&mut self) -> Result<BundleHeader> {
        if let Some(header) = self.header {
            return Ok(header);
        }
        if self.position != 0 {
            self.inner.seek(SeekFrom::Start(self.origin))?;
            self.position = 0;
        }

        let mut raw = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut raw)?;
        self.position = HEADER_SIZE as u64;

        let header = BundleHeader::from_bytes(&raw)?;
        self.width = header.validate()?;
        self.header = Some(header);
        self.state = ReaderState::HeaderRead;
        Ok(header)
    }

    fn load_directory(&mut self) -> Result<BundleHeader> {
        let header = self.read_header()?;
        if self.state >= ReaderState::DirectoryLoaded {
            return Ok(header);
        }

        let width = self.width;
        let entry_size = DirectoryEntry::size(width) as u64;
        let directory_len = u64::from(header.chunk_count) * entry_size;
        let mut raw = Vec::new();
        read_limited(&mut self.inner, directory_len, &mut raw)?;
        self.position += directory_len;

        self.entries = raw
            .chunks_exact(entry_size as usize)
            .map(|bytes| DirectoryEntry::from_bytes(bytes, width))
            .collect::<Result<_>>()?;

        self.skip_to(self.position + u64::from(header.strings_micro_offset))?;
        let mut strings = Vec::new();
        read_limited(&mut self.inner, u64::from(header.string_table_size), &mut strings)?;
        self.position += strings.len() as u64;
        self.strings = strings;

        self.state = ReaderState::DirectoryLoaded;
        debug!(
            "Loaded directory: {} chunks, {} bytes of names",
            self.entries.len(),
            self.strings.len()
        );
        Ok(header)
    }

    /// Seek forward to `target`; seeking backwards means the directory lies
    fn skip_to(&mut self, target: u64) -> Result<()> {
        if target < self.position {
            return Err(BundleError::Corrupt(format!(
                "Offset {} lies behind stream position {}",
                target, self.position
            )));
        }
        if target > self.position {
            self.inner.seek(SeekFrom::Start(self.origin + target))?;
            self.position = target;
        }
        Ok(())
    }

    fn entry_name(&self, entry: &DirectoryEntry) -> Result<String> {
        let bad = || BundleError::Corrupt(format!("Bad name offset {}", entry.name_offset));
        let start = usize::try_from(entry.name_offset).map_err(|_| bad())?;
        let tail = self.strings.get(start..).ok_or_else(bad)?;
        let end = tail.iter().position(|&b| b == 0).ok_or_else(bad)?;
        std::str::from_utf8(&tail[..end])
            .map(str::to_string)
            .map_err(|e| BundleError::Corrupt(format!("Chunk name is not UTF-8: {}", e)))
    }

    /// Directory entries with resolved names
    pub fn directory(&mut self) -> Result<Vec<DirectoryInfo>> {
        self.load_directory()?;
        self.entries
            .iter()
            .map(|entry| {
                Ok(DirectoryInfo {
                    name: self.entry_name(entry)?,
                    type_id: entry.id,
                    codec: if entry.is_compressed() {
                        CompressionMethod::from_u8(entry.codec_bits())
                    } else {
                        Some(CompressionMethod::None)
                    },
                    stored_offset: entry.stored_offset,
                    stored_size: entry.stored_size,
                    uncompressed_size: entry.uncompressed_size,
                    stored_crc: entry.stored_crc,
                    uncompressed_crc: entry.uncompressed_crc,
                })
            })
            .collect()
    }

    /// Read, check and (if needed) expand one chunk, then relocate it
    fn load_chunk(
        &mut self,
        entry: &DirectoryEntry,
        name: &str,
        chunk_area: u64,
        stages: &StageSlots<'_>,
    ) -> Result<(ResourceBlock, ChunkHeader)> {
        if entry.stored_size > self.max_chunk_size || entry.uncompressed_size > self.max_chunk_size
        {
            return Err(BundleError::Memory(format!(
                "Chunk '{}' of {} bytes exceeds the {} byte limit",
                name,
                entry.stored_size.max(entry.uncompressed_size),
                self.max_chunk_size
            )));
        }

        let start = chunk_area
            .checked_add(entry.stored_offset)
            .ok_or_else(|| BundleError::Corrupt(format!("Chunk '{}' offset overflows", name)))?;
        self.skip_to(start)?;

        let mut stored = std::mem::take(&mut self.stored);
        read_limited(&mut self.inner, entry.stored_size, &mut stored)?;
        self.position += entry.stored_size;

        let found = crc32fast::hash(&stored);
        if found != entry.stored_crc {
            self.stored = stored;
            return Err(BundleError::ChecksumMismatch {
                name: name.to_string(),
                expected: entry.stored_crc,
                found,
            });
        }

        let result = if entry.is_compressed() {
            match self.expand(entry, name, &stored) {
                Ok(size) => build_block(&self.scratch[..size], self.width, stages, &*self.allocator),
                Err(e) => Err(e),
            }
        } else {
            build_block(&stored, self.width, stages, &*self.allocator)
        };
        self.stored = stored;
        result
    }

    /// Decompress into the scratch buffer, returning the expanded length
    fn expand(&mut self, entry: &DirectoryEntry, name: &str, stored: &[u8]) -> Result<usize> {
        let method = match CompressionMethod::from_u8(entry.codec_bits()) {
            Some(CompressionMethod::None) | None => {
                return Err(BundleError::Compression(format!(
                    "Chunk '{}' sizes differ but codec {} is unusable",
                    name,
                    entry.codec_bits()
                )))
            }
            Some(method) => method,
        };

        let size = usize::try_from(entry.uncompressed_size)
            .map_err(|_| BundleError::Memory(format!("Chunk '{}' too large", name)))?;
        if self.scratch.len() < size {
            self.scratch.resize(size, 0);
        }
        decompress_into(stored, method, &mut self.scratch[..size])?;

        let found = crc32fast::hash(&self.scratch[..size]);
        if found != entry.uncompressed_crc {
            return Err(BundleError::ChecksumMismatch {
                name: name.to_string(),
                expected: entry.uncompressed_crc,
                found,
            });
        }
        Ok(size)
    }
}

impl<R: Read + Seek> ChunkSource for BundleReader<R> {
    fn directory_count(&mut self) -> Result<usize> {
        Ok(self.peek_header()?.chunk_count as usize)
    }

    fn read(&mut self, name: &str, handlers: &Handlers<'_>) -> Result<ReadOutcome> {
        let header = self.load_directory()?;
        let chunk_area = header.chunk_area_offset(self.width) as u64;

        // A repeated read starts over at the chunk area
        if self.position > chunk_area {
            self.inner.seek(SeekFrom::Start(self.origin + chunk_area))?;
            self.position = chunk_area;
        }

        let mut entries = self.entries.clone();
        entries.sort_by_key(|entry| entry.stored_offset);

        let mut outcome = ReadOutcome {
            user_data: header.user_data,
            ..Default::default()
        };
        let mut matched = 0usize;

        for entry in &entries {
            let Some(stages) = handlers.stages(entry.id) else {
                outcome.skipped += 1;
                continue;
            };
            let chunk_name = self.entry_name(entry)?;
            if !name.is_empty() && chunk_name != name {
                outcome.skipped += 1;
                continue;
            }
            matched += 1;

            let (mut block, chunk_header) = self.load_chunk(entry, &chunk_name, chunk_area, stages)?;

            let mut accepted = true;
            for (stage, slot) in stages.iter().enumerate() {
                let Some(handler) = slot else { continue };
                block.enter_stage(stage);
                block.carve_stage(stage, handler.extra_memory())?;
                let info = ChunkInfo {
                    name: &chunk_name,
                    type_id: entry.id,
                    stage,
                    version_major: chunk_header.version_major,
                    version_minor: chunk_header.version_minor,
                };
                if !handler.process(&info, &mut block) {
                    warn!("Stage {} rejected chunk '{}' (type {})", stage, chunk_name, entry.id);
                    accepted = false;
                    break;
                }
            }

            if accepted {
                debug!("Loaded chunk '{}' (type {}, {} bytes)", chunk_name, entry.id, block.len());
                outcome.chunks.push(LoadedChunk {
                    name: chunk_name,
                    type_id: entry.id,
                    version_major: chunk_header.version_major,
                    version_minor: chunk_header.version_minor,
                    block: Arc::new(block),
                });
            } else {
                outcome.rejected += 1;
            }
        }

        self.state = ReaderState::Done;
        if matched == 0 {
            return Err(BundleError::NotFound);
        }
        if outcome.chunks.is_empty() {
            return Err(BundleError::Rejected(format!(
                "All {} matching chunks were rejected",
                outcome.rejected
            )));
        }
        Ok(outcome)
    }
}

/// Read exactly `len` bytes into `buf`, growing it only as data arrives
fn read_limited<R: Read>(reader: &mut R, len: u64, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    let read = reader.take(len).read_to_end(buf)?;
    if read as u64 != len {
        return Err(BundleError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("Expected {} bytes, stream ended after {}", len, read),
        )));
    }
    Ok(())
}

/// Allocate a block for one decoded chunk and relocate its fixups
fn build_block(
    chunk: &[u8],
    width: AddressWidth,
    stages: &StageSlots<'_>,
    allocator: &dyn BlockAllocator,
) -> Result<(ResourceBlock, ChunkHeader)> {
    let header = ChunkHeader::from_bytes(chunk, width)?;
    header.validate(chunk.len(), width)?;

    // validate() bounds both regions by chunk.len()
    let data_start = header.data_offset as usize;
    let data_end = data_start + header.data_size as usize;
    let fixup_start = header.fixup_offset as usize;
    let fixup_end = fixup_start + header.fixup_size as usize;

    let mut layout = BlockLayout {
        prefix: false,
        data_size: data_end - data_start,
        stage_sizes: [0; MAX_STAGES],
    };
    for (stage, slot) in stages.iter().enumerate() {
        if let Some(handler) = slot {
            let extra = handler.extra_memory();
            layout.stage_sizes[stage] = extra;
            layout.prefix |= extra > 0 || handler.wants_prefix();
        }
    }

    let mut block = ResourceBlock::allocate(&layout, width, allocator)?;
    if let Some(data) = block.data_mut() {
        data.copy_from_slice(&chunk[data_start..data_end]);
    }

    let fixups = chunk[fixup_start..fixup_end]
        .chunks_exact(width.bytes())
        .map(|slot| width.read(slot, 0))
        .collect::<Result<Vec<u64>>>()?;
    block.relocate(&fixups)?;
    Ok((block, header))
}
