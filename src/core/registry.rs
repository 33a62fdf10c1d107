//! Registry of live resource managers
//!
//! Handles carry a small manager index. The registry hands those indices out
//! and maps them back to managers; it holds weak references only, so a
//! dropped manager simply stops resolving.

use crate::error::{BundleError, Result};
use crate::free_list::FreeList;
use crate::handle::ResourceHandle;
use crate::manager::ResourceManager;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ManagerRegistry {
    managers: Mutex<FreeList<Weak<ResourceManager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        ManagerRegistry::default()
    }

    /// Assign `manager` an index and share it
    pub fn register(&self, mut manager: ResourceManager) -> Result<Arc<ResourceManager>> {
        let mut managers = self.managers.lock();
        let index = managers.alloc()?;
        let Ok(small) = u16::try_from(index) else {
            managers.erase(index);
            return Err(BundleError::Memory(format!(
                "Manager index {} does not fit in a handle",
                index
            )));
        };

        manager.set_index(small);
        let manager = Arc::new(manager);
        managers.set(index, Arc::downgrade(&manager));
        debug!("Registered resource manager {}", small);
        Ok(manager)
    }

    /// Release the index of `manager`
    pub fn unregister(&self, index: u16) -> bool {
        self.managers.lock().erase(u32::from(index)).is_some()
    }

    pub fn get(&self, index: u16) -> Option<Arc<ResourceManager>> {
        self.managers.lock().get(u32::from(index))?.upgrade()
    }

    /// Manager that resolved `handle`
    pub fn manager_for(&self, handle: &ResourceHandle) -> Option<Arc<ResourceManager>> {
        self.get(handle.manager()?)
    }

    /// Release the indices of managers that were dropped
    pub fn purge(&self) -> usize {
        let mut managers = self.managers.lock();
        let dead: Vec<u32> = (0..managers.capacity() as u32)
            .filter(|&index| {
                managers
                    .get(index)
                    .map_or(false, |manager| manager.strong_count() == 0)
            })
            .collect();
        for &index in &dead {
            managers.erase(index);
        }
        dead.len()
    }

    /// Registered indices, dropped managers included until purged
    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
