//! Bundle writer
//!
//! Chunks are accumulated with their type, compressed as they are added and
//! emitted by [`BundleWriter::build`] in dependency order: a chunk whose type
//! another chunk depends on is written first.
//!
//! Output layout:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ Header (32 bytes)        │
//! ├──────────────────────────┤
//! │ Directory entries        │
//! ├──────────────────────────┤
//! │ String table             │  after strings_micro_offset padding
//! ├──────────────────────────┤
//! │ Chunk area               │  8-byte aligned, chunks back to back
//! └──────────────────────────┘
//! ```

use crate::chunk_builder::{assemble_chunk, ChunkBuilder};
use crate::compression::{compress_if_beneficial, CompressionConfig, CompressionMethod};
use crate::error::{BundleError, Result};
use crate::header::{
    align_up, AddressWidth, BundleHeader, DirectoryEntry, CHUNK_ALIGN, HEADER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Type of a chunk: id, format version and the types it depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkType {
    pub id: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub dependencies: Vec<u32>,
}

impl ChunkType {
    pub fn new(id: u32) -> Self {
        ChunkType {
            id,
            version_major: 1,
            version_minor: 0,
            dependencies: Vec::new(),
        }
    }

    pub fn version(mut self, major: u16, minor: u16) -> Self {
        self.version_major = major;
        self.version_minor = minor;
        self
    }

    pub fn depends_on(mut self, id: u32) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }
}

/// Writer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub address_width: AddressWidth,
    pub compression: CompressionConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            address_width: AddressWidth::host(),
            compression: CompressionConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChunk {
    name: String,
    ty: ChunkType,
    stored: Vec<u8>,
    stored_crc: u32,
    uncompressed_crc: u32,
    uncompressed_size: u64,
    codec: CompressionMethod,
}

/// Accumulates chunks and emits a bundle
#[derive(Debug, Clone, Default)]
pub struct BundleWriter {
    config: WriterConfig,
    chunks: Vec<PendingChunk>,
}

impl BundleWriter {
    pub fn new(config: WriterConfig) -> Self {
        BundleWriter {
            config,
            chunks: Vec::new(),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Add text; a terminating NUL is appended unless already present
    pub fn add_raw_text_chunk(&mut self, name: &str, ty: ChunkType, text: &str) -> Result<()> {
        let mut data = text.as_bytes().to_vec();
        if data.last() != Some(&0) {
            data.push(0);
        }
        self.add_raw_binary_chunk(name, ty, &data)
    }

    pub fn add_raw_binary_chunk(&mut self, name: &str, ty: ChunkType, data: &[u8]) -> Result<()> {
        let width = self.config.address_width;
        let chunk = assemble_chunk(width, ty.version_major, ty.version_minor, data, &[])?;
        self.register(name, ty, &chunk)
    }

    /// Add a structured chunk built by `build`
    ///
    /// Nothing is registered if the callback or the layout fails.
    pub fn add_chunk<F>(&mut self, name: &str, ty: ChunkType, build: F) -> Result<()>
    where
        F: FnOnce(&mut ChunkBuilder) -> Result<()>,
    {
        let mut builder = ChunkBuilder::new();
        build(&mut builder)?;
        let chunk = builder.into_bytes(
            self.config.address_width,
            ty.version_major,
            ty.version_minor,
        )?;
        self.register(name, ty, &chunk)
    }

    fn register(&mut self, name: &str, ty: ChunkType, chunk: &[u8]) -> Result<()> {
        if name.as_bytes().contains(&0) {
            return Err(BundleError::InvalidName(name.to_string()));
        }
        let (stored, codec) = compress_if_beneficial(chunk, &self.config.compression)?;
        debug!(
            "Chunk '{}' type {}: {} -> {} bytes ({:?})",
            name,
            ty.id,
            chunk.len(),
            stored.len(),
            codec
        );
        self.chunks.push(PendingChunk {
            name: name.to_string(),
            ty,
            stored_crc: crc32fast::hash(&stored),
            uncompressed_crc: crc32fast::hash(chunk),
            uncompressed_size: chunk.len() as u64,
            stored,
            codec,
        });
        Ok(())
    }

    /// Reject dependency cycles between chunk types
    fn check_cycles(&self) -> Result<()> {
        let mut graph: HashMap<u32, HashSet<u32>> = HashMap::new();
        for chunk in &self.chunks {
            graph
                .entry(chunk.ty.id)
                .or_default()
                .extend(chunk.ty.dependencies.iter().copied());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(id: u32, graph: &HashMap<u32, HashSet<u32>>, marks: &mut HashMap<u32, Mark>) -> Result<()> {
            match marks.get(&id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(BundleError::DependencyCycle(id)),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(deps) = graph.get(&id) {
                for &dep in deps {
                    if graph.contains_key(&dep) {
                        visit(dep, graph, marks)?;
                    }
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut ids: Vec<u32> = graph.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            visit(id, &graph, &mut marks)?;
        }
        Ok(())
    }

    /// Chunk indices with every dependency ahead of its dependents
    ///
    /// Every popped chunk pushes all chunks of the types it depends on, and
    /// the last visit of each index decides its place. An index still waiting
    /// on the stack is not pushed again, since its pending copy is visited
    /// later anyway. This keeps long chains with several chunks per type from
    /// growing the visit list exponentially.
    pub fn dependency_order(&self) -> Result<Vec<usize>> {
        self.check_cycles()?;

        let mut by_type: HashMap<u32, Vec<usize>> = HashMap::new();
        for (index, chunk) in self.chunks.iter().enumerate() {
            by_type.entry(chunk.ty.id).or_default().push(index);
        }

        let mut stack: Vec<usize> = (0..self.chunks.len()).collect();
        let mut pending = vec![true; self.chunks.len()];
        let mut visited: Vec<usize> = Vec::with_capacity(self.chunks.len());
        while let Some(index) = stack.pop() {
            pending[index] = false;
            visited.push(index);
            for dep in &self.chunks[index].ty.dependencies {
                for &dependency in by_type.get(dep).map(Vec::as_slice).unwrap_or(&[]) {
                    if !pending[dependency] {
                        pending[dependency] = true;
                        stack.push(dependency);
                    }
                }
            }
        }

        let mut seen = vec![false; self.chunks.len()];
        let mut order = Vec::with_capacity(self.chunks.len());
        for &index in visited.iter().rev() {
            if !seen[index] {
                seen[index] = true;
                order.push(index);
            }
        }
        Ok(order)
    }

    /// Write the bundle to `out`, returning the number of bytes written
    pub fn build<W: Write>(&self, user_data: u64, out: &mut W) -> Result<u64> {
        let width = self.config.address_width;
        let order = self.dependency_order()?;

        let mut strings: Vec<u8> = Vec::new();
        let mut name_offsets = vec![0u64; self.chunks.len()];
        for &index in &order {
            name_offsets[index] = strings.len() as u64;
            strings.extend_from_slice(self.chunks[index].name.as_bytes());
            strings.push(0);
        }

        let directory_end = HEADER_SIZE + order.len() * DirectoryEntry::size(width);
        let strings_start = align_up(directory_end, CHUNK_ALIGN);
        let strings_end = strings_start + strings.len();
        let chunk_area = align_up(strings_end, CHUNK_ALIGN);

        let mut header = BundleHeader::new(width);
        header.user_data = user_data;
        header.strings_micro_offset = (strings_start - directory_end) as u16;
        header.chunks_micro_offset = (chunk_area - strings_end) as u16;
        header.string_table_size = u32::try_from(strings.len())
            .map_err(|_| BundleError::Corrupt("String table exceeds 4 GiB".to_string()))?;
        header.chunk_count = u32::try_from(order.len())
            .map_err(|_| BundleError::Corrupt("Too many chunks".to_string()))?;

        let mut directory = Vec::with_capacity(order.len() * DirectoryEntry::size(width));
        let mut offsets = Vec::with_capacity(order.len());
        let mut cursor = 0u64;
        for &index in &order {
            let chunk = &self.chunks[index];
            cursor = align_up(cursor as usize, CHUNK_ALIGN) as u64;
            offsets.push(cursor);
            DirectoryEntry {
                id: chunk.ty.id,
                stored_crc: chunk.stored_crc,
                uncompressed_crc: chunk.uncompressed_crc,
                flags: chunk.codec as u32,
                name_offset: name_offsets[index],
                stored_offset: cursor,
                stored_size: chunk.stored.len() as u64,
                uncompressed_size: chunk.uncompressed_size,
            }
            .write_to(&mut directory, width)?;
            cursor += chunk.stored.len() as u64;
        }

        let padding = [0u8; CHUNK_ALIGN];
        out.write_all(&header.to_bytes())?;
        out.write_all(&directory)?;
        out.write_all(&padding[..strings_start - directory_end])?;
        out.write_all(&strings)?;
        out.write_all(&padding[..chunk_area - strings_end])?;

        let mut written = 0u64;
        for (&index, &offset) in order.iter().zip(&offsets) {
            let gap = (offset - written) as usize;
            out.write_all(&padding[..gap])?;
            out.write_all(&self.chunks[index].stored)?;
            written = offset + self.chunks[index].stored.len() as u64;
        }

        let total = chunk_area as u64 + written;
        info!(
            "Built bundle: {} chunks, {} bytes, {}-bit",
            order.len(),
            total,
            width.bits()
        );
        Ok(total)
    }

    pub fn build_to_vec(&self, user_data: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.build(user_data, &mut out)?;
        Ok(out)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P, user_data: u64) -> Result<u64> {
        let mut out = BufWriter::new(File::create(path)?);
        let written = self.build(user_data, &mut out)?;
        out.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MAGIC;

    fn writer() -> BundleWriter {
        BundleWriter::new(WriterConfig::default())
    }

    fn order_names(writer: &BundleWriter) -> Vec<String> {
        writer
            .dependency_order()
            .unwrap()
            .into_iter()
            .map(|i| writer.chunks[i].name.clone())
            .collect()
    }

    #[test]
    fn test_header_and_layout() {
        let mut writer = writer();
        writer
            .add_raw_text_chunk("greeting", ChunkType::new(7), "hello")
            .unwrap();
        let bytes = writer.build_to_vec(99).unwrap();

        let header = BundleHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.user_data, 99);
        assert_eq!(header.chunk_count, 1);
        assert_eq!(header.string_table_size, 9);

        let width = header.validate().unwrap();
        assert_eq!(header.chunk_area_offset(width) % CHUNK_ALIGN, 0);
    }

    #[test]
    fn test_dependency_chain() {
        let mut writer = writer();
        writer
            .add_raw_text_chunk("c", ChunkType::new(3).depends_on(2), "c")
            .unwrap();
        writer.add_raw_text_chunk("a", ChunkType::new(1), "a").unwrap();
        writer
            .add_raw_text_chunk("b", ChunkType::new(2).depends_on(1), "b")
            .unwrap();
        assert_eq!(order_names(&writer), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_many_dependents_of_one_type() {
        let mut writer = writer();
        writer
            .add_raw_text_chunk("mesh", ChunkType::new(2).depends_on(1), "m")
            .unwrap();
        writer.add_raw_text_chunk("tex0", ChunkType::new(1), "t0").unwrap();
        writer.add_raw_text_chunk("tex1", ChunkType::new(1), "t1").unwrap();

        let names = order_names(&writer);
        let mesh = names.iter().position(|n| n == "mesh").unwrap();
        assert!(names.iter().position(|n| n == "tex0").unwrap() < mesh);
        assert!(names.iter().position(|n| n == "tex1").unwrap() < mesh);
    }

    #[test]
    fn test_deep_chain_with_several_chunks_per_type() {
        let mut writer = writer();
        for id in (0..20u32).rev() {
            for copy in 0..3 {
                let ty = if id == 0 {
                    ChunkType::new(id)
                } else {
                    ChunkType::new(id).depends_on(id - 1)
                };
                writer
                    .add_raw_binary_chunk(&format!("t{}_{}", id, copy), ty, &[id as u8])
                    .unwrap();
            }
        }

        let order = writer.dependency_order().unwrap();
        assert_eq!(order.len(), 60);
        let types: Vec<u32> = order.iter().map(|&i| writer.chunks[i].ty.id).collect();
        assert!(types.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut writer = writer();
        writer
            .add_raw_text_chunk("a", ChunkType::new(1).depends_on(2), "a")
            .unwrap();
        writer
            .add_raw_text_chunk("b", ChunkType::new(2).depends_on(1), "b")
            .unwrap();
        assert!(matches!(
            writer.build_to_vec(0),
            Err(BundleError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_failed_chunk_leaves_writer_intact() {
        let mut writer = writer();
        writer.add_raw_text_chunk("ok", ChunkType::new(1), "ok").unwrap();

        let result = writer.add_chunk("bad", ChunkType::new(2), |b| {
            b.pointer("missing");
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(writer.chunk_count(), 1);
        assert!(writer.build_to_vec(0).is_ok());
    }

    #[test]
    fn test_incompressible_stored_raw() {
        let mut writer = BundleWriter::new(WriterConfig {
            compression: CompressionConfig::lz4(),
            ..Default::default()
        });
        writer.add_raw_binary_chunk("tiny", ChunkType::new(1), b"x").unwrap();
        let chunk = &writer.chunks[0];
        assert_eq!(chunk.codec, CompressionMethod::None);
        assert_eq!(chunk.stored.len() as u64, chunk.uncompressed_size);
    }
}
