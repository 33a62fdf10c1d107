//! Storage backends
//!
//! A storage owns a name prefix (`disk`, `mem`, ...) and turns the rest of a
//! resource name into chunk reads. The manager picks the storage from the
//! name's storage part and hands it the handler set for every type it knows.

mod disk;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use crate::block::BlockAllocator;
use crate::error::Result;
use crate::name::ResourceName;
use crate::reader::{Handlers, ReadOutcome};
use std::sync::Arc;

pub trait Storage: Send + Sync {
    /// Storage part of the names this backend serves
    fn prefix(&self) -> &str;

    /// Read the bundle `name` refers to, restricted to its sub-object if any
    fn read(
        &self,
        name: &ResourceName<'_>,
        handlers: &Handlers<'_>,
        allocator: Arc<dyn BlockAllocator>,
    ) -> Result<ReadOutcome>;
}
