//! Resident memory blocks handed to resource handlers
//!
//! A block is one allocation laid out as:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Stage prefix (optional)      │  MAX_STAGES little-endian u64 slots
//! │  slot 0: size << 8 | stages  │
//! │  slot 1..3: stage offsets    │
//! ├──────────────────────────────┤
//! │ Chunk data (relocated)       │
//! ├──────────────────────────────┤
//! │ Stage 0 extra memory         │  carved from the tail, 8-byte aligned
//! │ Stage 1..3 extra memory      │
//! └──────────────────────────────┘
//! ```
//!
//! Relocated pointer slots inside the data hold block-relative offsets, never
//! raw addresses. [`ResourceBlock::follow`] re-validates a slot before
//! handing its target back.

use crate::error::{BundleError, Result};
use crate::header::{align_up, AddressWidth};
use ahash::RandomState;
use bytes::Bytes;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of processing stages per resource type
pub const MAX_STAGES: usize = 4;

/// Size of the stage prefix in bytes
pub const STAGE_PREFIX_SIZE: usize = MAX_STAGES * 8;

const EXTRA_ALIGN: usize = 8;

/// Sizes needed to allocate a block for one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockLayout {
    pub prefix: bool,
    pub data_size: usize,
    pub stage_sizes: [usize; MAX_STAGES],
}

impl BlockLayout {
    pub fn data_start(&self) -> usize {
        if self.prefix {
            STAGE_PREFIX_SIZE
        } else {
            0
        }
    }

    pub fn total_size(&self) -> usize {
        let extra: usize = self
            .stage_sizes
            .iter()
            .filter(|&&size| size > 0)
            .map(|&size| align_up(size, EXTRA_ALIGN))
            .sum();
        let data_end = self.data_start() + self.data_size;
        if extra > 0 {
            align_up(data_end, EXTRA_ALIGN) + extra
        } else {
            data_end
        }
    }
}

/// Source of memory for resident blocks
///
/// Blocks returned by the allocator are owned by whoever receives the block;
/// the reader never frees them itself.
pub trait BlockAllocator: Send + Sync {
    /// Allocate `size` zeroed bytes
    fn allocate(&self, size: usize) -> Result<Vec<u8>>;
}

/// Heap allocator with a per-block ceiling
#[derive(Debug)]
pub struct HeapAllocator {
    max_block_size: usize,
    allocated: AtomicU64,
    blocks: AtomicU64,
}

impl HeapAllocator {
    pub fn new(max_block_size: usize) -> Self {
        HeapAllocator {
            max_block_size,
            allocated: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
        }
    }

    /// Total bytes handed out so far
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        HeapAllocator::new(usize::MAX)
    }
}

impl BlockAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Vec<u8>> {
        if size > self.max_block_size {
            return Err(BundleError::Memory(format!(
                "Block of {} bytes exceeds limit of {} bytes",
                size, self.max_block_size
            )));
        }

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(size).map_err(|e| {
            BundleError::Memory(format!("Failed to allocate {} bytes: {}", size, e))
        })?;
        buffer.resize(size, 0);

        self.allocated.fetch_add(size as u64, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }
}

#[derive(Clone)]
enum Backing {
    Owned(Vec<u8>),
    /// Memory owned elsewhere; dropping the block leaves it untouched
    Shared(Bytes),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Owned(bytes) => bytes,
            Backing::Shared(bytes) => bytes,
        }
    }
}

/// One loaded resource: chunk data plus per-stage extra memory
#[derive(Clone)]
pub struct ResourceBlock {
    backing: Backing,
    width: AddressWidth,
    data: Range<usize>,
    prefix: bool,
    stages: [Option<Range<usize>>; MAX_STAGES],
    tail: usize,
    stage_count: u8,
}

impl ResourceBlock {
    /// Allocate a zeroed block for `layout` through `allocator`
    pub fn allocate(
        layout: &BlockLayout,
        width: AddressWidth,
        allocator: &dyn BlockAllocator,
    ) -> Result<Self> {
        let total = layout.total_size();
        let buffer = allocator.allocate(total)?;
        if buffer.len() != total {
            return Err(BundleError::Memory(format!(
                "Allocator returned {} bytes, {} requested",
                buffer.len(),
                total
            )));
        }

        let start = layout.data_start();
        let end = start + layout.data_size;
        let mut block = ResourceBlock {
            backing: Backing::Owned(buffer),
            width,
            data: start..end,
            prefix: layout.prefix,
            stages: Default::default(),
            tail: align_up(end, EXTRA_ALIGN).min(total),
            stage_count: 0,
        };
        block.write_prefix_header();
        Ok(block)
    }

    /// Wrap already-resident, already-relocated memory without copying it
    pub fn from_shared(bytes: Bytes, width: AddressWidth) -> Self {
        let len = bytes.len();
        ResourceBlock {
            backing: Backing::Shared(bytes),
            width,
            data: 0..len,
            prefix: false,
            stages: Default::default(),
            tail: len,
            stage_count: 0,
        }
    }

    /// Build an owned block holding `data` and nothing else
    pub fn from_vec(data: Vec<u8>, width: AddressWidth) -> Self {
        let len = data.len();
        ResourceBlock {
            backing: Backing::Owned(data),
            width,
            data: 0..len,
            prefix: false,
            stages: Default::default(),
            tail: len,
            stage_count: 0,
        }
    }

    /// Address width of relocated pointer slots
    pub fn address_width(&self) -> AddressWidth {
        self.width
    }

    /// Whole block, prefix and extra memory included
    pub fn as_bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    pub fn has_prefix(&self) -> bool {
        self.prefix
    }

    /// Block-relative offset of the data region
    pub fn data_start(&self) -> usize {
        self.data.start
    }

    pub fn data(&self) -> &[u8] {
        &self.as_bytes()[self.data.clone()]
    }

    /// Mutable data; `None` for shared blocks
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let range = self.data.clone();
        self.owned_mut().map(|bytes| &mut bytes[range])
    }

    /// Number of stages that have processed this block
    pub fn stage_count(&self) -> usize {
        self.stage_count as usize
    }

    pub fn stage_memory(&self, stage: usize) -> Option<&[u8]> {
        let range = self.stages.get(stage)?.clone()?;
        self.as_bytes().get(range)
    }

    pub fn stage_memory_mut(&mut self, stage: usize) -> Option<&mut [u8]> {
        let range = self.stages.get(stage)?.clone()?;
        self.owned_mut()?.get_mut(range)
    }

    /// Raw value of a prefix slot
    pub fn prefix_slot(&self, slot: usize) -> Option<u64> {
        if !self.prefix || slot >= MAX_STAGES {
            return None;
        }
        let offset = slot * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.as_bytes().get(offset..offset + 8)?);
        Some(u64::from_le_bytes(raw))
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let raw = self.data().get(offset..offset + 2)?;
        Some(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let raw = self.data().get(offset..offset + 4)?;
        Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let raw = self.data().get(offset..offset + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Some(u64::from_le_bytes(buf))
    }

    /// Follow a relocated pointer slot at data offset `slot`
    ///
    /// Returns the data-relative offset of the target, or `None` if the slot
    /// is outside the data or does not point into it.
    pub fn follow(&self, slot: usize) -> Option<usize> {
        if slot.checked_add(self.width.bytes())? > self.data.len() {
            return None;
        }
        let value = self.width.read(self.data(), slot).ok()?;
        let value = usize::try_from(value).ok()?;
        if value < self.data.start || value >= self.data.end {
            return None;
        }
        Some(value - self.data.start)
    }

    /// Read the null-terminated string a relocated slot points at
    pub fn follow_str(&self, slot: usize) -> Option<&str> {
        let start = self.follow(slot)?;
        let tail = &self.data()[start..];
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Rewrite every fixup slot from a data offset to a block offset
    ///
    /// Each entry is a byte offset into the data region naming a
    /// pointer-width slot. The stored value must point inside the data before
    /// and after relocation, and no slot may be listed twice.
    pub(crate) fn relocate(&mut self, fixups: &[u64]) -> Result<()> {
        let width = self.width;
        let data = self.data.clone();
        let data_size = data.len() as u64;
        let bytes = self
            .owned_mut()
            .ok_or_else(|| BundleError::Corrupt("Cannot relocate shared memory".to_string()))?;

        let mut seen: HashSet<u64, RandomState> = HashSet::default();
        for &slot in fixups {
            if !seen.insert(slot) {
                return Err(BundleError::Corrupt(format!(
                    "Fixup slot {} is listed more than once",
                    slot
                )));
            }
            let slot_end = slot.checked_add(width.bytes() as u64);
            if slot_end.map_or(true, |end| end > data_size) {
                return Err(BundleError::FixupOutOfBounds {
                    slot,
                    value: 0,
                    data_size,
                });
            }

            let at = data.start + slot as usize;
            let value = width.read(bytes, at)?;
            if value >= data_size {
                return Err(BundleError::FixupOutOfBounds {
                    slot,
                    value,
                    data_size,
                });
            }

            let relocated = data.start as u64 + value;
            if relocated < data.start as u64 || relocated >= data.end as u64 {
                return Err(BundleError::FixupOutOfBounds {
                    slot,
                    value: relocated,
                    data_size,
                });
            }
            width.write_into(bytes, at, relocated)?;
        }
        Ok(())
    }

    /// Carve `size` bytes for `stage` from the tail of the block
    pub(crate) fn carve_stage(&mut self, stage: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if stage >= MAX_STAGES {
            return Err(BundleError::Memory(format!("Stage {} out of range", stage)));
        }

        let start = self.tail;
        let end = start + align_up(size, EXTRA_ALIGN);
        if end > self.len() {
            return Err(BundleError::Memory(format!(
                "Stage {} needs {} bytes past the end of a {} byte block",
                stage,
                size,
                self.len()
            )));
        }
        self.stages[stage] = Some(start..start + size);
        self.tail = end;

        // Stage 0 memory sits right after the data, the rest are recorded
        if stage > 0 && self.prefix {
            self.write_prefix_slot(stage, start as u64);
        }
        Ok(())
    }

    /// Record that `stage` has been reached
    pub(crate) fn enter_stage(&mut self, stage: usize) {
        self.stage_count = self.stage_count.max(stage as u8 + 1);
        self.write_prefix_header();
    }

    fn write_prefix_header(&mut self) {
        if self.prefix {
            let packed = ((self.len() as u64) << 8) | u64::from(self.stage_count);
            self.write_prefix_slot(0, packed);
        }
    }

    fn write_prefix_slot(&mut self, slot: usize, value: u64) {
        if let Some(bytes) = self.owned_mut() {
            let offset = slot * 8;
            bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn owned_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.backing {
            Backing::Owned(bytes) => Some(bytes),
            Backing::Shared(_) => None,
        }
    }
}

impl PartialEq for ResourceBlock {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
            && (0..MAX_STAGES).all(|stage| self.stage_memory(stage) == other.stage_memory(stage))
    }
}

impl Eq for ResourceBlock {}

impl std::fmt::Debug for ResourceBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBlock")
            .field("len", &self.len())
            .field("data", &self.data)
            .field("prefix", &self.prefix)
            .field("stages", &self.stages)
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(prefix: bool, data_size: usize, stage_sizes: [usize; MAX_STAGES]) -> BlockLayout {
        BlockLayout {
            prefix,
            data_size,
            stage_sizes,
        }
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(layout(false, 10, [0; 4]).total_size(), 10);
        assert_eq!(layout(true, 10, [0; 4]).total_size(), STAGE_PREFIX_SIZE + 10);
        // 32 + 10 -> 48 aligned, then 8 + 16
        assert_eq!(layout(true, 10, [3, 0, 12, 0]).total_size(), 48 + 8 + 16);
    }

    #[test]
    fn test_allocator_limit() {
        let allocator = HeapAllocator::new(64);
        assert!(allocator.allocate(64).is_ok());
        assert!(matches!(allocator.allocate(65), Err(BundleError::Memory(_))));
        assert_eq!(allocator.allocated_bytes(), 64);
        assert_eq!(allocator.allocated_blocks(), 1);
    }

    #[test]
    fn test_relocation() {
        let allocator = HeapAllocator::default();
        let mut block = ResourceBlock::allocate(
            &layout(true, 24, [0; 4]),
            AddressWidth::Bits64,
            &allocator,
        )
        .unwrap();
        {
            let data = block.data_mut().unwrap();
            data[0..8].copy_from_slice(&16u64.to_le_bytes());
            data[16..20].copy_from_slice(b"abc\0");
        }
        block.relocate(&[0]).unwrap();

        assert_eq!(block.read_u64(0), Some(STAGE_PREFIX_SIZE as u64 + 16));
        assert_eq!(block.follow(0), Some(16));
        assert_eq!(block.follow_str(0), Some("abc"));
    }

    #[test]
    fn test_relocation_out_of_bounds() {
        let allocator = HeapAllocator::default();
        let mut block =
            ResourceBlock::allocate(&layout(false, 16, [0; 4]), AddressWidth::Bits64, &allocator)
                .unwrap();
        block.data_mut().unwrap()[0..8].copy_from_slice(&16u64.to_le_bytes());
        assert!(matches!(
            block.relocate(&[0]),
            Err(BundleError::FixupOutOfBounds { value: 16, .. })
        ));

        // Slot itself past the data
        assert!(matches!(
            block.relocate(&[12]),
            Err(BundleError::FixupOutOfBounds { slot: 12, .. })
        ));
    }

    #[test]
    fn test_relocation_rejects_repeated_slot() {
        let allocator = HeapAllocator::default();
        let mut block = ResourceBlock::allocate(
            &layout(true, 24, [0; 4]),
            AddressWidth::Bits64,
            &allocator,
        )
        .unwrap();
        block.data_mut().unwrap()[0..8].copy_from_slice(&8u64.to_le_bytes());
        assert!(matches!(
            block.relocate(&[0, 0]),
            Err(BundleError::Corrupt(_))
        ));
    }

    #[test]
    fn test_stage_carving() {
        let allocator = HeapAllocator::default();
        let mut block = ResourceBlock::allocate(
            &layout(true, 5, [4, 16, 0, 0]),
            AddressWidth::Bits64,
            &allocator,
        )
        .unwrap();

        block.enter_stage(0);
        block.carve_stage(0, 4).unwrap();
        block.enter_stage(1);
        block.carve_stage(1, 16).unwrap();

        assert_eq!(block.stage_count(), 2);
        assert_eq!(block.stage_memory(0).unwrap().len(), 4);
        assert_eq!(block.stage_memory(1).unwrap().len(), 16);
        assert_eq!(block.prefix_slot(1), Some(48));
        assert_eq!(block.prefix_slot(0), Some(((block.len() as u64) << 8) | 2));

        block.stage_memory_mut(1).unwrap()[0] = 7;
        assert_eq!(block.stage_memory(1).unwrap()[0], 7);

        // Nothing left for another stage
        assert!(block.carve_stage(2, 8).is_err());
    }

    #[test]
    fn test_shared_block_is_read_only() {
        let mut block = ResourceBlock::from_shared(Bytes::from_static(b"hello\0"), AddressWidth::host());
        assert!(block.is_shared());
        assert_eq!(block.data(), b"hello\0");
        assert!(block.data_mut().is_none());
        assert!(block.relocate(&[]).is_err());
    }

    #[test]
    fn test_block_equality() {
        let a = ResourceBlock::from_vec(b"same".to_vec(), AddressWidth::Bits64);
        let b = ResourceBlock::from_shared(Bytes::from_static(b"same"), AddressWidth::Bits64);
        let c = ResourceBlock::from_vec(b"diff".to_vec(), AddressWidth::Bits64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
