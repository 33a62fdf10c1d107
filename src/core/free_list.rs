//! Indexed free lists: stable integer slots with O(1) allocate and release
//!
//! Released slots are chained together and handed out again before the
//! backing store grows. When the chain is empty the capacity doubles and the
//! new slots become a fresh chain. Every release bumps the slot generation so
//! holders of an old index can tell it was reused.
//!
//! [`FreeList`] is unsynchronized. [`ConcurrentFreeList`] grows in
//! segments so element access only contends on the slot being touched.

use crate::error::{BundleError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

/// Index value that never names a slot
pub const INVALID_INDEX: u32 = u32::MAX;

const MIN_CAPACITY: usize = 8;

fn grown_capacity(current: usize) -> Result<usize> {
    let next = if current == 0 {
        MIN_CAPACITY
    } else {
        current * 2
    };
    if next > INVALID_INDEX as usize {
        return Err(BundleError::Memory(format!(
            "Free list cannot grow past {} slots",
            current
        )));
    }
    Ok(next)
}

#[derive(Debug)]
enum Slot<T> {
    Free { next: Option<u32> },
    Live(Option<T>),
}

#[derive(Debug)]
struct Entry<T> {
    slot: Slot<T>,
    generation: u16,
}

/// Unsynchronized indexed free list
///
/// Callers must serialize all access themselves.
#[derive(Debug)]
pub struct FreeList<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> FreeList<T> {
    pub fn new() -> Self {
        FreeList {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut list = FreeList::new();
        list.grow_to(capacity.min(INVALID_INDEX as usize));
        list
    }

    fn grow_to(&mut self, capacity: usize) {
        let start = self.entries.len();
        if capacity <= start {
            return;
        }
        for index in start..capacity {
            let next = if index + 1 < capacity {
                Some(index as u32 + 1)
            } else {
                self.free_head
            };
            self.entries.push(Entry {
                slot: Slot::Free { next },
                generation: 0,
            });
        }
        self.free_head = Some(start as u32);
    }

    /// Reserve a slot; its value stays empty until [`FreeList::set`]
    pub fn alloc(&mut self) -> Result<u32> {
        if self.free_head.is_none() {
            let capacity = grown_capacity(self.entries.len())?;
            self.grow_to(capacity);
        }

        let index = self
            .free_head
            .ok_or_else(|| BundleError::Memory("Free list exhausted".to_string()))?;
        let entry = &mut self.entries[index as usize];
        self.free_head = match entry.slot {
            Slot::Free { next } => next,
            Slot::Live(_) => {
                return Err(BundleError::Memory(format!(
                    "Free chain points at live slot {}",
                    index
                )))
            }
        };
        entry.slot = Slot::Live(None);
        self.len += 1;
        Ok(index)
    }

    /// Allocate a slot and store `value` in it
    pub fn push(&mut self, value: T) -> Result<u32> {
        let index = self.alloc()?;
        self.entries[index as usize].slot = Slot::Live(Some(value));
        Ok(index)
    }

    /// Return a slot to the free chain, yielding its value
    pub fn erase(&mut self, index: u32) -> Option<T> {
        let head = self.free_head;
        let entry = self.entries.get_mut(index as usize)?;
        match std::mem::replace(&mut entry.slot, Slot::Free { next: head }) {
            Slot::Live(value) => {
                entry.generation = entry.generation.wrapping_add(1);
                self.free_head = Some(index);
                self.len -= 1;
                value
            }
            free @ Slot::Free { .. } => {
                entry.slot = free;
                tracing::warn!("Double release of free list slot {}", index);
                None
            }
        }
    }

    /// Store into a live slot; returns false if the slot is free
    pub fn set(&mut self, index: u32, value: T) -> bool {
        match self.entries.get_mut(index as usize).map(|e| &mut e.slot) {
            Some(Slot::Live(slot)) => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        match &self.entries.get(index as usize)?.slot {
            Slot::Live(value) => value.as_ref(),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        match &mut self.entries.get_mut(index as usize)?.slot {
            Slot::Live(value) => value.as_mut(),
            Slot::Free { .. } => None,
        }
    }

    pub fn generation(&self, index: u32) -> Option<u16> {
        self.entries.get(index as usize).map(|e| e.generation)
    }

    pub fn is_live(&self, index: u32) -> bool {
        matches!(
            self.entries.get(index as usize).map(|e| &e.slot),
            Some(Slot::Live(_))
        )
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

impl<T> Default for FreeList<T> {
    fn default() -> Self {
        FreeList::new()
    }
}

#[derive(Debug)]
struct SharedSlot<T> {
    value: RwLock<Option<T>>,
    generation: AtomicU16,
    live: AtomicBool,
}

impl<T> SharedSlot<T> {
    fn new() -> Self {
        SharedSlot {
            value: RwLock::new(None),
            generation: AtomicU16::new(0),
            live: AtomicBool::new(false),
        }
    }
}

type Segment<T> = Arc<[SharedSlot<T>]>;

#[derive(Debug)]
struct Segments<T> {
    /// (first index, slots); each new segment doubles the capacity
    list: Vec<(usize, Segment<T>)>,
    capacity: usize,
}

/// Thread-safe indexed free list
///
/// The free chain sits behind one short mutex. Slots live in segments that
/// are never moved, so reading or writing slot `i` only locks slot `i`.
#[derive(Debug)]
pub struct ConcurrentFreeList<T> {
    segments: RwLock<Segments<T>>,
    free: Mutex<Vec<u32>>,
    live: AtomicUsize,
}

impl<T> ConcurrentFreeList<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let list = ConcurrentFreeList {
            segments: RwLock::new(Segments {
                list: Vec::new(),
                capacity: 0,
            }),
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        };
        if capacity > 0 {
            let mut free = list.free.lock();
            list.add_segment(&mut free, capacity.min(INVALID_INDEX as usize));
        }
        list
    }

    fn add_segment(&self, free: &mut Vec<u32>, size: usize) {
        let mut segments = self.segments.write();
        let start = segments.capacity;
        let slots: Vec<SharedSlot<T>> = (0..size).map(|_| SharedSlot::new()).collect();
        segments.list.push((start, Arc::from(slots)));
        segments.capacity += size;

        // Lowest index on top of the stack
        free.extend((start..start + size).rev().map(|index| index as u32));
    }

    fn locate(&self, index: u32) -> Option<(Segment<T>, usize)> {
        let index = index as usize;
        let segments = self.segments.read();
        if index >= segments.capacity {
            return None;
        }
        let position = segments
            .list
            .partition_point(|(start, _)| *start <= index)
            .checked_sub(1)?;
        let (start, segment) = &segments.list[position];
        Some((Arc::clone(segment), index - start))
    }

    /// Reserve a slot; its value stays empty until [`ConcurrentFreeList::set`]
    pub fn alloc(&self) -> Result<u32> {
        let index = {
            let mut free = self.free.lock();
            if free.is_empty() {
                let capacity = self.segments.read().capacity;
                let grown = grown_capacity(capacity)?;
                self.add_segment(&mut free, grown - capacity);
            }
            free
                .pop()
                .ok_or_else(|| BundleError::Memory("Free list exhausted".to_string()))?
        };

        if let Some((segment, offset)) = self.locate(index) {
            segment[offset].live.store(true, Ordering::Release);
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    pub fn push(&self, value: T) -> Result<u32> {
        let index = self.alloc()?;
        self.set(index, value);
        Ok(index)
    }

    /// Return a slot to the free chain, yielding its value
    pub fn erase(&self, index: u32) -> Option<T> {
        let (segment, offset) = self.locate(index)?;
        let slot = &segment[offset];
        if !slot.live.swap(false, Ordering::AcqRel) {
            tracing::warn!("Double release of free list slot {}", index);
            return None;
        }

        let value = slot.value.write().take();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(index);
        value
    }

    /// Store into a live slot; returns false if the slot is free
    pub fn set(&self, index: u32, value: T) -> bool {
        match self.locate(index) {
            Some((segment, offset)) if segment[offset].live.load(Ordering::Acquire) => {
                *segment[offset].value.write() = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Run `f` against the value in slot `index`
    pub fn with<R>(&self, index: u32, f: impl FnOnce(&T) -> R) -> Option<R> {
        let (segment, offset) = self.locate(index)?;
        let guard = segment[offset].value.read();
        guard.as_ref().map(f)
    }

    pub fn get_cloned(&self, index: u32) -> Option<T>
    where
        T: Clone,
    {
        self.with(index, T::clone)
    }

    pub fn generation(&self, index: u32) -> Option<u16> {
        let (segment, offset) = self.locate(index)?;
        Some(segment[offset].generation.load(Ordering::Acquire))
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.locate(index)
            .map_or(false, |(segment, offset)| segment[offset].live.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.segments.read().capacity
    }
}

impl<T> Default for ConcurrentFreeList<T> {
    fn default() -> Self {
        ConcurrentFreeList::new()
    }
}
