//! Structured chunk writer
//!
//! A [`ChunkBuilder`] records typed fields into an intermediate list. Nothing
//! is laid out until [`ChunkBuilder::into_bytes`] runs, so labels may be
//! referenced before they are placed. Conversion produces
//! `{chunk header}{data}{fixup table}` for one address width:
//!
//! - pointers to labels and interned strings become pointer-width slots
//!   holding a data offset, each recorded in the fixup table
//! - strings live in a string area appended after the fields
//! - links are 16-byte records whose name slot is fixed up like a pointer

use crate::error::{BundleError, Result};
use crate::handle::LINK_RECORD_SIZE;
use crate::header::{align_up, AddressWidth, ChunkHeader, CHUNK_ALIGN};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Bytes(Vec<u8>),
    Align(usize),
    Label(String),
    Pointer(String),
    Str(String),
    Link { type_id: u32, name: String },
}

/// Intermediate representation of one structured chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkBuilder {
    fields: Vec<Field>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        ChunkBuilder::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Raw bytes, copied verbatim
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        match self.fields.last_mut() {
            Some(Field::Bytes(tail)) => tail.extend_from_slice(data),
            _ => self.fields.push(Field::Bytes(data.to_vec())),
        }
        self
    }

    /// Pad with zeros up to a multiple of `align`
    pub fn align(&mut self, align: usize) -> &mut Self {
        self.fields.push(Field::Align(align.max(1)));
        self
    }

    /// Name the current position so pointers can target it
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.fields.push(Field::Label(label.into()));
        self
    }

    /// Pointer-width slot holding the offset of `label`
    pub fn pointer(&mut self, label: impl Into<String>) -> &mut Self {
        self.fields.push(Field::Pointer(label.into()));
        self
    }

    /// Pointer-width slot holding the offset of a null-terminated copy of `value`
    pub fn string(&mut self, value: impl Into<String>) -> &mut Self {
        self.fields.push(Field::Str(value.into()));
        self
    }

    /// Link record naming another resource; an empty name writes a null link
    pub fn link(&mut self, type_id: u32, name: impl Into<String>) -> &mut Self {
        self.fields.push(Field::Link {
            type_id,
            name: name.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Lay the fields out as a complete chunk for `width`
    pub fn into_bytes(&self, width: AddressWidth, major: u16, minor: u16) -> Result<Vec<u8>> {
        let ptr = width.bytes();

        // Pass 1: positions of labels and the size of the field area
        let mut labels: HashMap<&str, usize> = HashMap::new();
        let mut cursor = 0usize;
        for field in &self.fields {
            match field {
                Field::Bytes(data) => cursor += data.len(),
                Field::Align(align) => cursor = align_up(cursor, *align),
                Field::Label(label) => {
                    if labels.insert(label.as_str(), cursor).is_some() {
                        return Err(BundleError::Corrupt(format!(
                            "Label '{}' is defined twice",
                            label
                        )));
                    }
                }
                Field::Pointer(_) | Field::Str(_) => cursor = align_up(cursor, ptr) + ptr,
                Field::Link { .. } => cursor = align_up(cursor, 8) + LINK_RECORD_SIZE,
            }
        }

        // String area follows the fields; identical strings share storage
        let mut strings: Vec<u8> = Vec::new();
        let mut interned: HashMap<&str, usize> = HashMap::new();
        let string_base = cursor;
        for field in &self.fields {
            let text = match field {
                Field::Str(text) => text.as_str(),
                Field::Link { name, .. } if !name.is_empty() => name.as_str(),
                _ => continue,
            };
            interned.entry(text).or_insert_with(|| {
                let at = string_base + strings.len();
                strings.extend_from_slice(text.as_bytes());
                strings.push(0);
                at
            });
        }

        // Pass 2: emit data and collect fixups
        let data_size = string_base + strings.len();
        let mut data: Vec<u8> = Vec::with_capacity(data_size);
        let mut fixups: Vec<u64> = Vec::new();
        for field in &self.fields {
            match field {
                Field::Bytes(bytes) => data.extend_from_slice(bytes),
                Field::Align(align) => data.resize(align_up(data.len(), *align), 0),
                Field::Label(_) => {}
                Field::Pointer(label) => {
                    let target = *labels.get(label.as_str()).ok_or_else(|| {
                        BundleError::Corrupt(format!("Pointer to undefined label '{}'", label))
                    })?;
                    // Relocated slots must land inside the data
                    if target >= data_size {
                        return Err(BundleError::Corrupt(format!(
                            "Label '{}' at offset {} is past the end of {} data bytes",
                            label, target, data_size
                        )));
                    }
                    push_slot(&mut data, &mut fixups, width, target)?;
                }
                Field::Str(text) => {
                    let target = interned.get(text.as_str()).copied().unwrap_or(string_base);
                    push_slot(&mut data, &mut fixups, width, target)?;
                }
                Field::Link { type_id, name } => {
                    data.resize(align_up(data.len(), 8), 0);
                    let record = data.len();
                    if name.is_empty() {
                        data.resize(record + 8, 0);
                    } else {
                        let target = interned.get(name.as_str()).copied().unwrap_or(string_base);
                        push_slot(&mut data, &mut fixups, width, target)?;
                        data.resize(record + 8, 0);
                    }
                    let name_len = u16::try_from(name.len()).map_err(|_| {
                        BundleError::Corrupt(format!("Link name of {} bytes is too long", name.len()))
                    })?;
                    data.extend_from_slice(&type_id.to_le_bytes());
                    data.extend_from_slice(&name_len.to_le_bytes());
                    data.extend_from_slice(&0u16.to_le_bytes());
                }
            }
        }
        data.extend_from_slice(&strings);

        assemble_chunk(width, major, minor, &data, &fixups)
    }
}

fn push_slot(
    data: &mut Vec<u8>,
    fixups: &mut Vec<u64>,
    width: AddressWidth,
    target: usize,
) -> Result<()> {
    data.resize(align_up(data.len(), width.bytes()), 0);
    fixups.push(data.len() as u64);
    width.push(data, target as u64)
}

/// Wrap `data` and its fixup slots in a chunk header
pub(crate) fn assemble_chunk(
    width: AddressWidth,
    major: u16,
    minor: u16,
    data: &[u8],
    fixups: &[u64],
) -> Result<Vec<u8>> {
    let ptr = width.bytes();
    let data_offset = align_up(ChunkHeader::size(width), CHUNK_ALIGN);
    let fixup_offset = align_up(data_offset + data.len(), ptr);
    let header = ChunkHeader {
        fixup_size: (fixups.len() * ptr) as u64,
        data_size: data.len() as u64,
        fixup_offset: fixup_offset as u64,
        data_offset: data_offset as u64,
        version_major: major,
        version_minor: minor,
    };

    let mut out = Vec::with_capacity(fixup_offset + fixups.len() * ptr);
    header.write_to(&mut out, width)?;
    out.resize(data_offset, 0);
    out.extend_from_slice(data);
    out.resize(fixup_offset, 0);
    for &slot in fixups {
        width.push(&mut out, slot)?;
    }
    Ok(out)
}
