//! Resource manager
//!
//! Turns resource names into stable indices, loads resources through the
//! storage their name selects and publishes every loaded chunk in the cache.
//!
//! Each resource type has a primary handler (stage 0) and up to
//! `MAX_STAGES - 1` further handlers attached by other subsystems. A single
//! storage read is given the stages of every registered type, so one read
//! can publish several resources of different types from the same bundle.
//!
//! Loads of one index are collapsed: while a load runs, other callers of
//! [`ResourceManager::try_acquire`] get `None` and [`ResourceManager::acquire`]
//! backs off and retries.

use crate::block::{BlockAllocator, HeapAllocator, ResourceBlock, MAX_STAGES};
use crate::cache::{CacheEntry, CacheStats, ResourceCache};
use crate::config::ManagerConfig;
use crate::error::{BundleError, Result};
use crate::free_list::ConcurrentFreeList;
use crate::handle::{HandleState, ResourceHandle};
use crate::name::ResourceName;
use crate::reader::{ChunkInfo, Handlers, StageHandler};
use crate::storage::{DiskStorage, MemoryStorage, Storage};
use crate::writer::BundleWriter;
use ahash::RandomState;
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Load and unload callbacks for one stage of a resource type
pub trait ResourceHandler: Send + Sync {
    /// Extra bytes this stage needs next to the chunk data
    fn extra_memory(&self) -> usize {
        0
    }

    /// Accept (`true`) or reject a freshly relocated block
    fn init(&self, ctx: &mut InitContext<'_>, block: &mut ResourceBlock) -> bool;

    /// Release whatever `init` acquired outside the block
    fn destroy(&self, _stage: usize, _block: &ResourceBlock) -> bool {
        true
    }
}

impl<F> ResourceHandler for F
where
    F: Fn(&mut InitContext<'_>, &mut ResourceBlock) -> bool + Send + Sync,
{
    fn init(&self, ctx: &mut InitContext<'_>, block: &mut ResourceBlock) -> bool {
        self(ctx, block)
    }
}

pub type ChangedHook = Arc<dyn Fn(&ResourceName<'_>, &ResourceBlock) -> bool + Send + Sync>;
pub type SaveHook =
    Arc<dyn Fn(&ResourceName<'_>, &ResourceBlock, &mut BundleWriter) -> Result<()> + Send + Sync>;

/// Optional per-type hooks installed with the primary handler
#[derive(Clone, Default)]
pub struct TypeHooks {
    changed: Option<ChangedHook>,
    save: Option<SaveHook>,
}

impl TypeHooks {
    pub fn new() -> Self {
        TypeHooks::default()
    }

    /// Called by [`ResourceManager::evict_changed`]; `true` evicts the resource
    pub fn on_changed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ResourceName<'_>, &ResourceBlock) -> bool + Send + Sync + 'static,
    {
        self.changed = Some(Arc::new(hook));
        self
    }

    /// Called by [`ResourceManager::save_resource`]
    pub fn on_save<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ResourceName<'_>, &ResourceBlock, &mut BundleWriter) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.save = Some(Arc::new(hook));
        self
    }
}

type HandlerStages = [Option<Arc<dyn ResourceHandler>>; MAX_STAGES];

#[derive(Clone, Default)]
struct TypeEntry {
    stages: HandlerStages,
    hooks: TypeHooks,
}

/// What a stage handler sees while initialising a resource
pub struct InitContext<'a> {
    manager: &'a ResourceManager,
    name: &'a ResourceName<'a>,
    type_id: u32,
    stage: usize,
    version_major: u16,
    version_minor: u16,
}

impl<'a> InitContext<'a> {
    pub fn manager(&self) -> &'a ResourceManager {
        self.manager
    }

    /// Full name of the resource being loaded
    pub fn name(&self) -> &ResourceName<'a> {
        self.name
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn version(&self) -> (u16, u16) {
        (self.version_major, self.version_minor)
    }

    /// Resolve a link relative to the resource being loaded
    pub fn resolve_link(&self, link: &ResourceHandle) -> ResourceHandle {
        self.manager.resolve_link(link, self.name)
    }

    /// Decode the link record at data offset `offset` and resolve it
    pub fn read_link(&self, block: &ResourceBlock, offset: usize) -> Result<ResourceHandle> {
        let link = ResourceHandle::read_link(block, offset)?;
        Ok(self.resolve_link(&link))
    }
}

/// Adapts a manager handler to the reader's stage interface
struct StageAdapter<'a> {
    manager: &'a ResourceManager,
    bundle: &'a ResourceName<'a>,
    handler: Arc<dyn ResourceHandler>,
}

impl StageHandler for StageAdapter<'_> {
    fn extra_memory(&self) -> usize {
        self.handler.extra_memory()
    }

    fn process(&self, chunk: &ChunkInfo<'_>, block: &mut ResourceBlock) -> bool {
        let name = self.bundle.with_subobject(chunk.name);
        let mut ctx = InitContext {
            manager: self.manager,
            name: &name,
            type_id: chunk.type_id,
            stage: chunk.stage,
            version_major: chunk.version_major,
            version_minor: chunk.version_minor,
        };
        self.handler.init(&mut ctx, block)
    }
}

#[derive(Debug, Clone)]
struct NameSlot {
    name: ResourceName<'static>,
}

pub struct ResourceManager {
    index: u16,
    names: RwLock<HashMap<String, u32, RandomState>>,
    slots: ConcurrentFreeList<NameSlot>,
    name_lock: Mutex<()>,
    types: RwLock<HashMap<u32, TypeEntry>>,
    storages: RwLock<Vec<Arc<dyn Storage>>>,
    memory: Option<Arc<MemoryStorage>>,
    cache: ResourceCache,
    allocator: Arc<dyn BlockAllocator>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(HeapAllocator::default()), 0)
    }

    pub fn with_allocator(allocator: Arc<dyn BlockAllocator>, name_capacity: usize) -> Self {
        ResourceManager {
            index: 0,
            names: RwLock::new(HashMap::default()),
            slots: ConcurrentFreeList::with_capacity(name_capacity),
            name_lock: Mutex::new(()),
            types: RwLock::new(HashMap::new()),
            storages: RwLock::new(Vec::new()),
            memory: None,
            cache: ResourceCache::new(),
            allocator,
        }
    }

    /// Build a manager with the storages `config` describes
    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        let allocator = Arc::new(HeapAllocator::new(config.max_block_size));
        let mut manager = Self::with_allocator(allocator, config.initial_name_capacity);

        for disk in &config.disk {
            let mut storage = DiskStorage::new(disk.prefix.clone(), disk.root.clone())
                .with_mmap(disk.mmap);
            if let Some(extension) = &disk.extension {
                storage = storage.with_extension(extension.clone());
            }
            manager.register_storage(Arc::new(storage));
        }

        if !config.memory_prefix.is_empty() {
            let memory = Arc::new(MemoryStorage::new(config.memory_prefix.clone()));
            manager.register_storage(memory.clone());
            manager.memory = Some(memory);
        }
        Ok(manager)
    }

    /// Index carried in handles this manager resolves
    pub fn index(&self) -> u16 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: u16) {
        self.index = index;
    }

    /// Memory storage created from configuration, if any
    pub fn memory_storage(&self) -> Option<Arc<MemoryStorage>> {
        self.memory.clone()
    }

    /// Add a storage, replacing any storage with the same prefix
    pub fn register_storage(&self, storage: Arc<dyn Storage>) {
        let mut storages = self.storages.write();
        storages.retain(|existing| existing.prefix() != storage.prefix());
        info!("Registered storage '{}'", storage.prefix());
        storages.push(storage);
    }

    fn storage_for(&self, prefix: &str) -> Option<Arc<dyn Storage>> {
        self.storages
            .read()
            .iter()
            .find(|storage| storage.prefix() == prefix)
            .cloned()
    }

    /// Install the primary (stage 0) handler for `type_id`
    pub fn register_handler(
        &self,
        type_id: u32,
        handler: impl ResourceHandler + 'static,
        hooks: TypeHooks,
    ) -> Result<()> {
        let mut types = self.types.write();
        let entry = types.entry(type_id).or_default();
        if entry.stages[0].is_some() {
            return Err(BundleError::Config(format!(
                "Type {} already has a primary handler",
                type_id
            )));
        }
        entry.stages[0] = Some(Arc::new(handler));
        entry.hooks = hooks;
        debug!("Registered handler for type {}", type_id);
        Ok(())
    }

    /// Attach another stage to an already registered type, returning its index
    pub fn register_next_handler(
        &self,
        type_id: u32,
        handler: impl ResourceHandler + 'static,
    ) -> Result<usize> {
        let mut types = self.types.write();
        let entry = types
            .get_mut(&type_id)
            .filter(|entry| entry.stages[0].is_some())
            .ok_or_else(|| {
                BundleError::Config(format!("Type {} has no primary handler", type_id))
            })?;
        let stage = (1..MAX_STAGES)
            .find(|&stage| entry.stages[stage].is_none())
            .ok_or_else(|| {
                BundleError::Config(format!("Type {} has all {} stages in use", type_id, MAX_STAGES))
            })?;
        entry.stages[stage] = Some(Arc::new(handler));
        debug!("Registered stage {} for type {}", stage, type_id);
        Ok(stage)
    }

    fn handle_for(&self, type_id: u32, index: u32) -> ResourceHandle {
        match self.slots.generation(index) {
            Some(generation) => ResourceHandle::resolved(type_id, index, self.index, generation),
            None => ResourceHandle::invalid(type_id),
        }
    }

    /// Index for `name`, allocated on first sight
    pub fn get_index_from_name(&self, type_id: u32, name: &ResourceName<'_>) -> Result<ResourceHandle> {
        if !name.is_valid() {
            return Err(BundleError::InvalidName(name.to_string()));
        }
        if name.is_null() {
            return Ok(ResourceHandle::invalid(type_id));
        }

        if let Some(&index) = self.names.read().get(name.as_str()) {
            return Ok(self.handle_for(type_id, index));
        }

        let _first_sight = self.name_lock.lock();
        if let Some(&index) = self.names.read().get(name.as_str()) {
            return Ok(self.handle_for(type_id, index));
        }
        let index = self.slots.push(NameSlot {
            name: name.clone().into_owned(),
        })?;
        self.names.write().insert(name.as_str().to_string(), index);
        debug!("Assigned index {} to {}", index, name);
        Ok(self.handle_for(type_id, index))
    }

    /// Number of names with an index
    pub fn name_count(&self) -> usize {
        self.slots.len()
    }

    pub fn name_of(&self, handle: &ResourceHandle) -> Option<ResourceName<'static>> {
        match handle.state() {
            HandleState::Unresolved { name } => Some(ResourceName::new(name.clone())),
            HandleState::Resolved { index, .. } => {
                self.slots.with(*index, |slot| slot.name.clone())
            }
            HandleState::Invalid => None,
        }
    }

    /// True when the handle's slot was released or reused since it was resolved
    pub fn is_stale(&self, handle: &ResourceHandle) -> bool {
        match handle.state() {
            HandleState::Resolved {
                index,
                manager,
                generation,
            } => {
                *manager != self.index
                    || !self.slots.is_live(*index)
                    || self.slots.generation(*index) != Some(*generation)
            }
            _ => false,
        }
    }

    /// Turn a link found in loaded data into a handle of this manager
    pub fn resolve_link(&self, link: &ResourceHandle, current: &ResourceName<'_>) -> ResourceHandle {
        let type_id = link.type_id();
        let raw = match link.state() {
            HandleState::Invalid => return ResourceHandle::invalid(type_id),
            HandleState::Resolved { .. } => return link.clone(),
            HandleState::Unresolved { name } => name,
        };

        let target = ResourceName::new(raw.as_str());
        if !target.is_valid() || target.is_null() {
            return ResourceHandle::invalid(type_id);
        }
        let target = if target.is_current_link() {
            match target.rebase(current) {
                Some(rebased) => rebased,
                None => return ResourceHandle::invalid(type_id),
            }
        } else {
            target.into_owned()
        };

        self.get_index_from_name(type_id, &target)
            .unwrap_or_else(|e| {
                warn!("Cannot resolve link '{}': {}", raw, e);
                ResourceHandle::invalid(type_id)
            })
    }

    /// Loaded resource for `handle`, or `None` on a miss that could not be filled now
    pub fn try_acquire(&self, handle: &ResourceHandle) -> Option<Arc<ResourceBlock>> {
        let index = match handle.state() {
            HandleState::Invalid => return None,
            HandleState::Unresolved { name } => {
                let name = ResourceName::new(name.as_str());
                self.get_index_from_name(handle.type_id(), &name).ok()?.index()
            }
            HandleState::Resolved { index, .. } => {
                if self.is_stale(handle) {
                    warn!("Stale handle {}", handle);
                    return None;
                }
                *index
            }
        };

        if let Some(entry) = self.cache.get_entry(index) {
            return matching_type(handle, entry.type_id, entry.block);
        }

        let _loading = self.cache.begin_load(index)?;
        if let Some(entry) = self.cache.get_entry(index) {
            return matching_type(handle, entry.type_id, entry.block);
        }

        let name = self.slots.with(index, |slot| slot.name.clone())?;
        match self.load(index, handle.type_id(), &name) {
            Ok(block) => {
                let type_id = self.cache.type_of(index).unwrap_or(handle.type_id());
                matching_type(handle, type_id, block)
            }
            Err(e) => {
                warn!("Failed to load {}: {}", name, e);
                None
            }
        }
    }

    /// Retry [`ResourceManager::try_acquire`] until it succeeds
    ///
    /// A resource that can never load makes this spin forever.
    pub fn acquire(&self, handle: &ResourceHandle) -> Arc<ResourceBlock> {
        let backoff = Backoff::new();
        loop {
            if let Some(block) = self.try_acquire(handle) {
                return block;
            }
            backoff.snooze();
        }
    }

    fn handler_snapshot(&self) -> Vec<(u32, HandlerStages)> {
        self.types
            .read()
            .iter()
            .map(|(type_id, entry)| (*type_id, entry.stages.clone()))
            .collect()
    }

    fn load(&self, index: u32, type_id: u32, name: &ResourceName<'static>) -> Result<Arc<ResourceBlock>> {
        let storage = self.storage_for(name.storage()).ok_or_else(|| {
            warn!("No storage registered for '{}'", name.storage());
            BundleError::NotFound
        })?;

        let snapshot = self.handler_snapshot();
        let mut handlers = Handlers::new();
        for (chunk_type, stages) in &snapshot {
            for (stage, handler) in stages.iter().enumerate() {
                if let Some(handler) = handler {
                    handlers.set(
                        *chunk_type,
                        stage,
                        StageAdapter {
                            manager: self,
                            bundle: name,
                            handler: handler.clone(),
                        },
                    )?;
                }
            }
        }

        let outcome = storage.read(name, &handlers, self.allocator.clone())?;

        let mut requested = None;
        for chunk in outcome.chunks {
            let chunk_name = name.with_subobject(&chunk.name);
            let chunk_index = self.get_index_from_name(chunk.type_id, &chunk_name)?.index();
            let published = self.cache.insert(chunk_index, chunk.type_id, chunk.block);

            let whole_bundle = name.subobject().is_empty() && chunk.type_id == type_id;
            if requested.is_none() && (chunk_index == index || whole_bundle) {
                if chunk_index != index {
                    self.cache.insert(index, type_id, published.clone());
                }
                requested = Some(published);
            }
        }

        debug!("Loaded {} (user data {:#x})", name, outcome.user_data);
        requested.ok_or(BundleError::NotFound)
    }

    /// Run destroy stages last to first unless the block is still published elsewhere
    fn destroy(&self, index: u32, entry: &CacheEntry) {
        if self.cache.publishes(&entry.block) {
            return;
        }
        let stages = match self.types.read().get(&entry.type_id) {
            Some(types) => types.stages.clone(),
            None => return,
        };
        for stage in (0..MAX_STAGES).rev() {
            if let Some(handler) = &stages[stage] {
                if !handler.destroy(stage, &entry.block) {
                    warn!("Stage {} failed to destroy resource {}", stage, index);
                }
            }
        }
    }

    /// Release a name index; later handles to it compare as stale
    pub fn forget(&self, handle: &ResourceHandle) -> bool {
        let HandleState::Resolved { index, .. } = handle.state() else {
            return false;
        };
        if self.is_stale(handle) {
            return false;
        }

        if let Some(entry) = self.cache.remove(*index) {
            self.destroy(*index, &entry);
        }

        let _names = self.name_lock.lock();
        match self.slots.erase(*index) {
            Some(slot) => {
                self.names.write().remove(slot.name.as_str());
                debug!("Forgot {} (index {})", slot.name, index);
                true
            }
            None => false,
        }
    }

    /// Drop every cached resource, running destroy stages last to first
    pub fn flush_cache(&self) -> usize {
        let drained = self.cache.drain();
        let mut destroyed: Vec<&Arc<ResourceBlock>> = Vec::with_capacity(drained.len());
        for (index, entry) in &drained {
            if destroyed.iter().any(|block| Arc::ptr_eq(block, &entry.block)) {
                continue;
            }
            self.destroy(*index, entry);
            destroyed.push(&entry.block);
        }
        info!("Flushed {} cached resources", drained.len());
        drained.len()
    }

    /// Evict cached resources whose type's change hook reports a change
    pub fn evict_changed(&self) -> usize {
        let hooks: HashMap<u32, ChangedHook> = self
            .types
            .read()
            .iter()
            .filter_map(|(type_id, entry)| entry.hooks.changed.clone().map(|hook| (*type_id, hook)))
            .collect();
        if hooks.is_empty() {
            return 0;
        }

        let mut evicted = 0;
        for (index, entry) in self.cache.snapshot() {
            let Some(hook) = hooks.get(&entry.type_id) else {
                continue;
            };
            let Some(name) = self.slots.with(index, |slot| slot.name.clone()) else {
                continue;
            };
            if hook(&name, entry.block.as_ref()) {
                if let Some(entry) = self.cache.remove(index) {
                    self.destroy(index, &entry);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            info!("Evicted {} changed resources", evicted);
        }
        evicted
    }

    /// Hand a loaded resource to its type's save hook
    pub fn save_resource(&self, handle: &ResourceHandle, writer: &mut BundleWriter) -> Result<()> {
        let hook = self
            .types
            .read()
            .get(&handle.type_id())
            .and_then(|entry| entry.hooks.save.clone())
            .ok_or_else(|| {
                BundleError::Config(format!("Type {} has no save hook", handle.type_id()))
            })?;
        let name = self.name_of(handle).ok_or(BundleError::NotFound)?;
        let block = self.try_acquire(handle).ok_or(BundleError::NotFound)?;
        hook(&name, block.as_ref(), writer)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn is_cached(&self, handle: &ResourceHandle) -> bool {
        handle.is_resolved() && self.cache.contains(handle.index())
    }
}

/// Hand `block` out only if it was loaded as the handle's type
fn matching_type(
    handle: &ResourceHandle,
    type_id: u32,
    block: Arc<ResourceBlock>,
) -> Option<Arc<ResourceBlock>> {
    if type_id != handle.type_id() {
        warn!(
            "Handle {} expects type {} but the resource was loaded as type {}",
            handle,
            handle.type_id(),
            type_id
        );
        return None;
    }
    Some(block)
}

impl Default for ResourceManager {
    fn default() -> Self {
        ResourceManager::new()
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("index", &self.index)
            .field("names", &self.slots.len())
            .field("types", &self.types.read().len())
            .field("storages", &self.storages.read().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}
