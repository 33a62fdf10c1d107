//! Binary layout of a bundle: header, directory entries and chunk headers
//!
//! All integers are little-endian. Pointer-width fields follow the address
//! width recorded in the header flags, so a 64-bit process can load bundles
//! written for 32-bit targets (the narrow fields are widened on load).

use crate::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

/// Bundle magic: "RBDL"
pub const MAGIC: u32 = u32::from_le_bytes(*b"RBDL");
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Size of the fixed bundle header in bytes
pub const HEADER_SIZE: usize = 32;

/// Chunk area and every chunk inside it are aligned to this many bytes
pub const CHUNK_ALIGN: usize = 8;

pub const FLAG_ADDRESS_32: u32 = 1 << 0;
pub const FLAG_ADDRESS_64: u32 = 1 << 1;

/// Round `value` up to the next multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Pointer width a bundle was written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressWidth {
    #[serde(rename = "32")]
    Bits32,
    #[serde(rename = "64")]
    Bits64,
}

impl AddressWidth {
    /// Pointer width of the running process
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            AddressWidth::Bits64
        } else {
            AddressWidth::Bits32
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            AddressWidth::Bits32 => 4,
            AddressWidth::Bits64 => 8,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub const fn flag(self) -> u32 {
        match self {
            AddressWidth::Bits32 => FLAG_ADDRESS_32,
            AddressWidth::Bits64 => FLAG_ADDRESS_64,
        }
    }

    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags & (FLAG_ADDRESS_32 | FLAG_ADDRESS_64) {
            FLAG_ADDRESS_32 => Ok(AddressWidth::Bits32),
            FLAG_ADDRESS_64 => Ok(AddressWidth::Bits64),
            other => Err(BundleError::Corrupt(format!(
                "Header address flags are ambiguous: {:#x}",
                other
            ))),
        }
    }

    /// A host can load bundles of its own width or narrower
    pub fn check_loadable(self, host: AddressWidth) -> Result<()> {
        if self.bytes() > host.bytes() {
            return Err(BundleError::AddressLength {
                bundle: self.bits(),
                host: host.bits(),
            });
        }
        Ok(())
    }

    /// Read one pointer-width field, widened to u64
    pub fn read(self, bytes: &[u8], offset: usize) -> Result<u64> {
        match self {
            AddressWidth::Bits32 => read_u32(bytes, offset).map(u64::from),
            AddressWidth::Bits64 => read_u64(bytes, offset),
        }
    }

    /// Write one pointer-width field; values that do not fit are corrupt
    pub fn write_into(self, bytes: &mut [u8], offset: usize, value: u64) -> Result<()> {
        let end = offset + self.bytes();
        let slot = bytes.get_mut(offset..end).ok_or_else(|| {
            BundleError::Corrupt(format!("Pointer slot {} out of range", offset))
        })?;
        match self {
            AddressWidth::Bits32 => {
                let narrow = u32::try_from(value).map_err(|_| {
                    BundleError::Corrupt(format!("Value {} does not fit a 32-bit field", value))
                })?;
                slot.copy_from_slice(&narrow.to_le_bytes());
            }
            AddressWidth::Bits64 => slot.copy_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }

    pub fn push(self, bytes: &mut Vec<u8>, value: u64) -> Result<()> {
        let start = bytes.len();
        bytes.resize(start + self.bytes(), 0);
        self.write_into(bytes, start, value)
    }
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let raw = bytes
        .get(offset..offset + 2)
        .ok_or_else(|| truncated(offset))?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let raw = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| truncated(offset))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let raw = bytes
        .get(offset..offset + 8)
        .ok_or_else(|| truncated(offset))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

fn truncated(offset: usize) -> BundleError {
    BundleError::Corrupt(format!("Truncated record at offset {}", offset))
}

/// Fixed 32-byte bundle header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleHeader {
    pub magic: u32,
    pub flags: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// Gap between the end of the directory and the string table
    pub strings_micro_offset: u16,
    /// Gap between the end of the string table and the chunk area
    pub chunks_micro_offset: u16,
    /// Opaque value chosen by the writer (cache/regeneration marker)
    pub user_data: u64,
    pub string_table_size: u32,
    pub chunk_count: u32,
}

impl BundleHeader {
    pub fn new(width: AddressWidth) -> Self {
        BundleHeader {
            magic: MAGIC,
            flags: width.flag(),
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            strings_micro_offset: 0,
            chunks_micro_offset: 0,
            user_data: 0,
            string_table_size: 0,
            chunk_count: 0,
        }
    }

    pub fn address_width(&self) -> Result<AddressWidth> {
        AddressWidth::from_flags(self.flags)
    }

    /// Validate magic, version and address width against this process
    pub fn validate(&self) -> Result<AddressWidth> {
        if self.magic != MAGIC {
            return Err(BundleError::InvalidMagic(self.magic));
        }

        // Major must match; a reader understands every minor up to its own
        if self.version_major != VERSION_MAJOR || self.version_minor > VERSION_MINOR {
            return Err(BundleError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        let width = self.address_width()?;
        width.check_loadable(AddressWidth::host())?;
        Ok(width)
    }

    /// Byte offset of the string table from the start of the bundle
    pub fn string_table_offset(&self, width: AddressWidth) -> usize {
        HEADER_SIZE
            + self.chunk_count as usize * DirectoryEntry::size(width)
            + self.strings_micro_offset as usize
    }

    /// Byte offset of the chunk area from the start of the bundle
    pub fn chunk_area_offset(&self, width: AddressWidth) -> usize {
        self.string_table_offset(width)
            + self.string_table_size as usize
            + self.chunks_micro_offset as usize
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.strings_micro_offset.to_le_bytes());
        bytes[14..16].copy_from_slice(&self.chunks_micro_offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.user_data.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.string_table_size.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.chunk_count.to_le_bytes());
        bytes
    }

    /// Parse a header without validating it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(BundleError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for bundle header",
            )));
        }

        Ok(BundleHeader {
            magic: read_u32(bytes, 0)?,
            flags: read_u32(bytes, 4)?,
            version_major: read_u16(bytes, 8)?,
            version_minor: read_u16(bytes, 10)?,
            strings_micro_offset: read_u16(bytes, 12)?,
            chunks_micro_offset: read_u16(bytes, 14)?,
            user_data: read_u64(bytes, 16)?,
            string_table_size: read_u32(bytes, 24)?,
            chunk_count: read_u32(bytes, 28)?,
        })
    }
}

/// Codec bits stored in [`DirectoryEntry::flags`]
pub const ENTRY_CODEC_MASK: u32 = 0b11;

/// One directory record per chunk
///
/// `name_offset` is relative to the string table. `stored_offset` is relative
/// to the chunk area. Equal stored and uncompressed sizes mean the payload is
/// stored raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    pub id: u32,
    pub stored_crc: u32,
    pub uncompressed_crc: u32,
    pub flags: u32,
    pub name_offset: u64,
    pub stored_offset: u64,
    pub stored_size: u64,
    pub uncompressed_size: u64,
}

impl DirectoryEntry {
    pub const fn size(width: AddressWidth) -> usize {
        16 + 4 * width.bytes()
    }

    pub fn is_compressed(&self) -> bool {
        self.uncompressed_size != self.stored_size
    }

    pub fn codec_bits(&self) -> u8 {
        (self.flags & ENTRY_CODEC_MASK) as u8
    }

    pub fn write_to(&self, out: &mut Vec<u8>, width: AddressWidth) -> Result<()> {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.stored_crc.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_crc.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        width.push(out, self.name_offset)?;
        width.push(out, self.stored_offset)?;
        width.push(out, self.stored_size)?;
        width.push(out, self.uncompressed_size)?;
        Ok(())
    }

    /// Decode one record, widening narrow pointer fields to native u64
    pub fn from_bytes(bytes: &[u8], width: AddressWidth) -> Result<Self> {
        let p = width.bytes();
        Ok(DirectoryEntry {
            id: read_u32(bytes, 0)?,
            stored_crc: read_u32(bytes, 4)?,
            uncompressed_crc: read_u32(bytes, 8)?,
            flags: read_u32(bytes, 12)?,
            name_offset: width.read(bytes, 16)?,
            stored_offset: width.read(bytes, 16 + p)?,
            stored_size: width.read(bytes, 16 + 2 * p)?,
            uncompressed_size: width.read(bytes, 16 + 3 * p)?,
        })
    }
}

/// Header at the start of every (decompressed) chunk
///
/// Offsets are relative to the start of the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    pub fixup_size: u64,
    pub data_size: u64,
    pub fixup_offset: u64,
    pub data_offset: u64,
    pub version_major: u16,
    pub version_minor: u16,
}

impl ChunkHeader {
    /// Encoded size, padded to the pointer alignment
    pub const fn size(width: AddressWidth) -> usize {
        align_up(4 * width.bytes() + 4, width.bytes())
    }

    pub fn write_to(&self, out: &mut Vec<u8>, width: AddressWidth) -> Result<()> {
        let start = out.len();
        width.push(out, self.fixup_size)?;
        width.push(out, self.data_size)?;
        width.push(out, self.fixup_offset)?;
        width.push(out, self.data_offset)?;
        out.extend_from_slice(&self.version_major.to_le_bytes());
        out.extend_from_slice(&self.version_minor.to_le_bytes());
        out.resize(start + Self::size(width), 0);
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8], width: AddressWidth) -> Result<Self> {
        if bytes.len() < Self::size(width) {
            return Err(BundleError::Corrupt(format!(
                "Chunk of {} bytes is smaller than its header",
                bytes.len()
            )));
        }
        let p = width.bytes();
        Ok(ChunkHeader {
            fixup_size: width.read(bytes, 0)?,
            data_size: width.read(bytes, p)?,
            fixup_offset: width.read(bytes, 2 * p)?,
            data_offset: width.read(bytes, 3 * p)?,
            version_major: read_u16(bytes, 4 * p)?,
            version_minor: read_u16(bytes, 4 * p + 2)?,
        })
    }

    /// Check that data and fixup regions lie inside a chunk of `chunk_len` bytes
    pub fn validate(&self, chunk_len: usize, width: AddressWidth) -> Result<()> {
        let within = |offset: u64, size: u64| {
            offset
                .checked_add(size)
                .map_or(false, |end| end <= chunk_len as u64)
        };
        if !within(self.data_offset, self.data_size) {
            return Err(BundleError::Corrupt(format!(
                "Data region {}+{} exceeds chunk of {} bytes",
                self.data_offset, self.data_size, chunk_len
            )));
        }
        if !within(self.fixup_offset, self.fixup_size) {
            return Err(BundleError::Corrupt(format!(
                "Fixup table {}+{} exceeds chunk of {} bytes",
                self.fixup_offset, self.fixup_size, chunk_len
            )));
        }
        if self.fixup_size % width.bytes() as u64 != 0 {
            return Err(BundleError::Corrupt(format!(
                "Fixup table size {} is not a multiple of {}",
                self.fixup_size,
                width.bytes()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_creation() {
        let header = BundleHeader::new(AddressWidth::Bits64);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version_major, VERSION_MAJOR);
        assert_eq!(header.version_minor, VERSION_MINOR);
        assert_eq!(header.flags, FLAG_ADDRESS_64);
    }

    #[test]
    fn test_header_serialization() {
        let mut header = BundleHeader::new(AddressWidth::Bits32);
        header.user_data = 0xDEAD_BEEF_0000_0001;
        header.chunk_count = 3;
        header.string_table_size = 17;
        header.strings_micro_offset = 4;
        header.chunks_micro_offset = 7;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = BundleHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_invalid_magic() {
        let mut header = BundleHeader::new(AddressWidth::host());
        header.magic = 0x1234_5678;
        assert!(matches!(
            header.validate(),
            Err(BundleError::InvalidMagic(0x1234_5678))
        ));
    }

    #[test]
    fn test_version_rules() {
        let mut header = BundleHeader::new(AddressWidth::host());
        header.version_major = VERSION_MAJOR + 1;
        assert!(matches!(
            header.validate(),
            Err(BundleError::UnsupportedVersion { .. })
        ));

        let mut header = BundleHeader::new(AddressWidth::host());
        header.version_minor = VERSION_MINOR + 1;
        assert!(matches!(
            header.validate(),
            Err(BundleError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_address_width_compatibility() {
        assert!(AddressWidth::Bits32
            .check_loadable(AddressWidth::Bits64)
            .is_ok());
        assert!(AddressWidth::Bits64
            .check_loadable(AddressWidth::Bits64)
            .is_ok());
        assert!(matches!(
            AddressWidth::Bits64.check_loadable(AddressWidth::Bits32),
            Err(BundleError::AddressLength { bundle: 64, host: 32 })
        ));
    }

    #[test]
    fn test_ambiguous_flags() {
        assert!(AddressWidth::from_flags(0).is_err());
        assert!(AddressWidth::from_flags(FLAG_ADDRESS_32 | FLAG_ADDRESS_64).is_err());
    }

    #[test]
    fn test_directory_entry_widths() {
        let entry = DirectoryEntry {
            id: 9,
            stored_crc: 1,
            uncompressed_crc: 2,
            flags: 1,
            name_offset: 5,
            stored_offset: 64,
            stored_size: 100,
            uncompressed_size: 200,
        };
        for width in [AddressWidth::Bits32, AddressWidth::Bits64] {
            let mut bytes = Vec::new();
            entry.write_to(&mut bytes, width).unwrap();
            assert_eq!(bytes.len(), DirectoryEntry::size(width));
            assert_eq!(DirectoryEntry::from_bytes(&bytes, width).unwrap(), entry);
        }
        assert!(entry.is_compressed());
    }

    #[test]
    fn test_narrow_field_overflow() {
        let entry = DirectoryEntry {
            stored_size: u64::from(u32::MAX) + 1,
            ..Default::default()
        };
        let mut bytes = Vec::new();
        assert!(entry.write_to(&mut bytes, AddressWidth::Bits32).is_err());
    }

    #[test]
    fn test_chunk_header_layout() {
        assert_eq!(ChunkHeader::size(AddressWidth::Bits64), 40);
        assert_eq!(ChunkHeader::size(AddressWidth::Bits32), 20);

        let header = ChunkHeader {
            fixup_size: 8,
            data_size: 16,
            fixup_offset: 56,
            data_offset: 40,
            version_major: 3,
            version_minor: 1,
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes, AddressWidth::Bits64).unwrap();
        let parsed = ChunkHeader::from_bytes(&bytes, AddressWidth::Bits64).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.validate(64, AddressWidth::Bits64).is_ok());
        assert!(parsed.validate(60, AddressWidth::Bits64).is_err());
    }
}
