//! Resource handles
//!
//! A handle names a resource of one type. Handles found inside freshly loaded
//! data are *unresolved*: they carry the target name. The owning manager
//! resolves them into an index plus the generation of that index's slot, so
//! a handle kept across a slot reuse compares as stale.
//!
//! Inside chunk data a link is a 16-byte record:
//!
//! ```text
//! offset 0   name pointer (pointer width, relocated, padded to 8 bytes)
//! offset 8   type id      u32
//! offset 12  name length  u16   (0 = null link)
//! offset 14  generation   u16   (ignored on load)
//! ```

use crate::block::ResourceBlock;
use crate::error::{BundleError, Result};
use crate::free_list::INVALID_INDEX;
use std::fmt;

pub const LINK_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleState {
    Invalid,
    Unresolved {
        name: String,
    },
    Resolved {
        index: u32,
        manager: u16,
        generation: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    type_id: u32,
    state: HandleState,
}

impl ResourceHandle {
    pub fn invalid(type_id: u32) -> Self {
        ResourceHandle {
            type_id,
            state: HandleState::Invalid,
        }
    }

    pub fn unresolved(type_id: u32, name: impl Into<String>) -> Self {
        ResourceHandle {
            type_id,
            state: HandleState::Unresolved { name: name.into() },
        }
    }

    pub fn resolved(type_id: u32, index: u32, manager: u16, generation: u16) -> Self {
        if index == INVALID_INDEX {
            return ResourceHandle::invalid(type_id);
        }
        ResourceHandle {
            type_id,
            state: HandleState::Resolved {
                index,
                manager,
                generation,
            },
        }
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn state(&self) -> &HandleState {
        &self.state
    }

    /// Resource index, [`INVALID_INDEX`] unless resolved
    pub fn index(&self) -> u32 {
        match self.state {
            HandleState::Resolved { index, .. } => index,
            _ => INVALID_INDEX,
        }
    }

    pub fn manager(&self) -> Option<u16> {
        match self.state {
            HandleState::Resolved { manager, .. } => Some(manager),
            _ => None,
        }
    }

    pub fn generation(&self) -> Option<u16> {
        match self.state {
            HandleState::Resolved { generation, .. } => Some(generation),
            _ => None,
        }
    }

    pub fn link_name(&self) -> Option<&str> {
        match &self.state {
            HandleState::Unresolved { name } => Some(name),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, HandleState::Resolved { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.state, HandleState::Invalid)
    }

    /// Decode the link record at data offset `offset`
    pub fn read_link(block: &ResourceBlock, offset: usize) -> Result<Self> {
        let corrupt = || BundleError::Corrupt(format!("Link record at {} is truncated", offset));
        let type_id = block.read_u32(offset + 8).ok_or_else(corrupt)?;
        let name_len = block.read_u16(offset + 12).ok_or_else(corrupt)? as usize;
        if name_len == 0 {
            return Ok(ResourceHandle::invalid(type_id));
        }

        let start = block.follow(offset).ok_or_else(|| {
            BundleError::Corrupt(format!("Link record at {} has a dangling name", offset))
        })?;
        let raw = block.data().get(start..start + name_len).ok_or_else(|| {
            BundleError::Corrupt(format!("Link name at {} overruns the data", start))
        })?;
        let name = std::str::from_utf8(raw)
            .map_err(|e| BundleError::Corrupt(format!("Link name is not UTF-8: {}", e)))?;
        Ok(ResourceHandle::unresolved(type_id, name))
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            HandleState::Invalid => write!(f, "{}:<invalid>", self.type_id),
            HandleState::Unresolved { name } => write!(f, "{}:{}", self.type_id, name),
            HandleState::Resolved {
                index,
                manager,
                generation,
            } => write!(f, "{}:#{}@{}g{}", self.type_id, index, manager, generation),
        }
    }
}
