//! Shared fixed-capacity arena for frame buffers.
//!
//! Every stage holds an `Arc<WeakHeap>`. Producers allocate a slot, write the
//! image bytes once, and publish the [`HeapHandle`] inside a packet; readers
//! only ever read. Slots are reference counted and return to the free list
//! when the last reference is released.
//!
//! Capacity is fixed at construction. Running out of space is reported as
//! [`HeapError::OutOfArena`], which producers treat as backpressure.

use crate::backend::id::HeapHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned by heap operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Not enough contiguous space for the allocation.
    #[error("Arena exhausted: requested {requested} bytes, {available} bytes free")]
    OutOfArena { requested: usize, available: usize },

    /// The handle was released or never belonged to this heap.
    #[error("Invalid heap handle {0:?}")]
    InvalidHandle(HeapHandle),

    /// A write did not match the allocated size.
    #[error("Size mismatch: slot holds {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// The handle was issued by a different heap.
    #[error("Heap handle {0:?} belongs to another heap")]
    ForeignHandle(HeapHandle),

    /// The packet was never bound to a heap.
    #[error("Packet is not bound to a heap")]
    Unbound,
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
struct Slot {
    offset: usize,
    len: usize,
    refs: u32,
    generation: u32,
}

#[derive(Debug)]
struct HeapInner {
    arena: Vec<u8>,
    /// Sorted by offset, always coalesced.
    free: Vec<FreeBlock>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    used: usize,
}

impl HeapInner {
    fn slot(&self, handle: HeapHandle) -> Result<&Slot, HeapError> {
        match self.slots.get(handle.slot as usize) {
            Some(s) if s.refs > 0 && s.generation == handle.generation => Ok(s),
            _ => Err(HeapError::InvalidHandle(handle)),
        }
    }

    fn slot_mut(&mut self, handle: HeapHandle) -> Result<&mut Slot, HeapError> {
        match self.slots.get_mut(handle.slot as usize) {
            Some(s) if s.refs > 0 && s.generation == handle.generation => Ok(s),
            _ => Err(HeapError::InvalidHandle(handle)),
        }
    }

    fn carve(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return Some(0);
        }
        let idx = self.free.iter().position(|b| b.len >= size)?;
        let block = &mut self.free[idx];
        let offset = block.offset;
        block.offset += size;
        block.len -= size;
        if block.len == 0 {
            self.free.remove(idx);
        }
        Some(offset)
    }

    fn give_back(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let idx = self.free.partition_point(|b| b.offset < offset);
        self.free.insert(idx, FreeBlock { offset, len });

        // Merge with the following block, then with the preceding one.
        if idx + 1 < self.free.len() {
            let next = self.free[idx + 1];
            if self.free[idx].offset + self.free[idx].len == next.offset {
                self.free[idx].len += next.len;
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let cur = self.free[idx];
            let prev = &mut self.free[idx - 1];
            if prev.offset + prev.len == cur.offset {
                prev.len += cur.len;
                self.free.remove(idx);
            }
        }
    }
}

/// Fixed-capacity, reference-counted byte arena shared by all stages.
#[derive(Debug)]
pub struct WeakHeap {
    id: u64,
    capacity: usize,
    inner: Mutex<HeapInner>,
}

impl WeakHeap {
    /// Create an arena of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let free = if capacity > 0 {
            vec![FreeBlock {
                offset: 0,
                len: capacity,
            }]
        } else {
            Vec::new()
        };
        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            inner: Mutex::new(HeapInner {
                arena: vec![0u8; capacity],
                free,
                slots: Vec::new(),
                free_slots: Vec::new(),
                used: 0,
            }),
        }
    }

    /// Create an arena of `size_mb` mebibytes.
    pub fn with_size_mb(size_mb: usize) -> Self {
        Self::new(size_mb * 1024 * 1024)
    }

    /// Process-unique identity, recorded in every [`ImageRef`](crate::backend::ImageRef).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held by live allocations.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    /// Bytes not held by live allocations (may be fragmented).
    pub fn available(&self) -> usize {
        self.capacity - self.used()
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.refs > 0).count()
    }

    /// Reserve `size` bytes. The returned handle starts with one reference.
    pub fn allocate(&self, size: usize) -> Result<HeapHandle, HeapError> {
        let mut inner = self.inner.lock();
        let offset = inner.carve(size).ok_or(HeapError::OutOfArena {
            requested: size,
            available: self.capacity - inner.used,
        })?;
        inner.used += size;

        let handle = match inner.free_slots.pop() {
            Some(idx) => {
                let slot = &mut inner.slots[idx as usize];
                slot.offset = offset;
                slot.len = size;
                slot.refs = 1;
                HeapHandle::new(idx, slot.generation)
            }
            None => {
                let idx = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    offset,
                    len: size,
                    refs: 1,
                    generation: 0,
                });
                HeapHandle::new(idx, 0)
            }
        };
        Ok(handle)
    }

    /// Copy `bytes` into the slot. The length must match the allocation.
    pub fn write(&self, handle: HeapHandle, bytes: &[u8]) -> Result<(), HeapError> {
        let mut inner = self.inner.lock();
        let (offset, len) = {
            let slot = inner.slot(handle)?;
            (slot.offset, slot.len)
        };
        if bytes.len() != len {
            return Err(HeapError::SizeMismatch {
                expected: len,
                actual: bytes.len(),
            });
        }
        inner.arena[offset..offset + len].copy_from_slice(bytes);
        Ok(())
    }

    /// Allocate and write in one step.
    pub fn store(&self, bytes: &[u8]) -> Result<HeapHandle, HeapError> {
        let handle = self.allocate(bytes.len())?;
        if let Err(e) = self.write(handle, bytes) {
            if let Err(release_err) = self.release(handle) {
                tracing::warn!("Failed to release slot after bad write {:?}: {}", handle, release_err);
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Copy the slot contents out.
    pub fn read(&self, handle: HeapHandle) -> Result<Vec<u8>, HeapError> {
        self.with_bytes(handle, |b| b.to_vec())
    }

    /// Borrow the slot contents without copying.
    pub fn with_bytes<R>(
        &self,
        handle: HeapHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, HeapError> {
        let inner = self.inner.lock();
        let slot = inner.slot(handle)?;
        Ok(f(&inner.arena[slot.offset..slot.offset + slot.len]))
    }

    /// Allocation size of the slot.
    pub fn len_of(&self, handle: HeapHandle) -> Result<usize, HeapError> {
        Ok(self.inner.lock().slot(handle)?.len)
    }

    /// Current reference count of the slot.
    pub fn ref_count(&self, handle: HeapHandle) -> Result<u32, HeapError> {
        Ok(self.inner.lock().slot(handle)?.refs)
    }

    /// Add a reference to a live slot.
    pub fn retain(&self, handle: HeapHandle) -> Result<(), HeapError> {
        let mut inner = self.inner.lock();
        inner.slot_mut(handle)?.refs += 1;
        Ok(())
    }

    /// Drop one reference. Returns `true` when the slot was freed.
    pub fn release(&self, handle: HeapHandle) -> Result<bool, HeapError> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(false);
        }
        let (offset, len) = (slot.offset, slot.len);
        slot.generation = slot.generation.wrapping_add(1);
        inner.used -= len;
        inner.give_back(offset, len);
        inner.free_slots.push(handle.slot);
        Ok(true)
    }
}
