//! Free/busy chunk bookkeeping for one memory domain.
//!
//! A [`Pool`] owns every chunk allocated in its domain. Chunks live in a slot
//! arena addressed by a generational [`ChunkId`]; a chunk is either busy
//! (`ref_count >= 1`) or parked in the free multimap under its size class
//! (`ref_count == 0`). Chunks are physically freed only by
//! [`Pool::clear_unused`] and [`Pool::clear_all`].
//!
//! The pool itself is not synchronized. [`crate::MemoryManager`] wraps each
//! pool in its own mutex.

use std::collections::HashMap;

use crate::{
    allocator::{AllocatorError, ELEMENT_SIZE},
    backend::{Backend, BufferPtr},
    config::PoolConfig,
    device::{Device, Domain},
};

/// Identity of a pooled chunk.
///
/// The generation changes every time the slot's chunk is physically freed,
/// so an identity issued before a clear never matches a later chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    index: u32,
    generation: u32,
}

impl ChunkId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Free-pool key: a rounded length on a given device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SizeClass {
    device: Device,
    len: usize,
}

/// One allocation unit tracked by a pool.
#[derive(Debug)]
struct MemoryChunk {
    device: Device,
    /// Rounded element count.
    len: usize,
    ptr: BufferPtr,
    ref_count: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    chunk: Option<MemoryChunk>,
}

/// A busy chunk handed out by [`Pool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Identity of the chunk.
    pub id: ChunkId,
    /// Address of the chunk's buffer.
    pub ptr: BufferPtr,
    /// Rounded element count of the chunk.
    pub len: usize,
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks with no outstanding references.
    pub free_chunks: usize,
    /// Chunks with at least one outstanding reference.
    pub busy_chunks: usize,
    /// Bytes held by free and busy chunks together.
    pub allocated_bytes: usize,
    /// Acquisitions served from the free pool.
    pub hits: u64,
    /// Acquisitions that required a backend allocation.
    pub misses: u64,
}

/// Chunk bookkeeping for one memory domain.
#[derive(Debug)]
pub(crate) struct Pool {
    domain: Domain,
    slots: Vec<Slot>,
    /// Slots whose chunk was physically freed.
    vacant: Vec<u32>,
    free: HashMap<SizeClass, Vec<u32>>,
    busy_chunks: usize,
    hits: u64,
    misses: u64,
}

impl Pool {
    pub(crate) fn new(domain: Domain) -> Self {
        Self {
            domain,
            slots: Vec::new(),
            vacant: Vec::new(),
            free: HashMap::new(),
            busy_chunks: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Hands out a busy chunk of at least `len` elements on `device`.
    ///
    /// A free chunk of the same size class is reused when available,
    /// otherwise `backend` allocates a new one.
    pub(crate) fn acquire(
        &mut self,
        backend: &dyn Backend,
        config: &PoolConfig,
        device: Device,
        len: usize,
    ) -> Result<Allocation, AllocatorError> {
        if device.domain() != self.domain {
            return Err(AllocatorError::DeviceUnavailable(device));
        }

        let Some(class_len) = config.size_class(len) else {
            return Err(AllocatorError::allocation_failure(
                device,
                len,
                "request does not fit in any size class",
            ));
        };
        let class = SizeClass {
            device,
            len: class_len,
        };

        if let Some(index) = self.pop_free(class) {
            let slot = &mut self.slots[index as usize];
            let Some(chunk) = slot.chunk.as_mut() else {
                unreachable!("free list points at an empty slot");
            };
            if config.zero_reused_chunks {
                let zeros = vec![0.0f32; chunk.len];
                // SAFETY: the chunk is live and holds `chunk.len` elements
                if let Err(e) = unsafe { backend.write(&zeros, chunk.ptr, device) } {
                    self.free.entry(class).or_default().push(index);
                    return Err(e);
                }
            }
            chunk.ref_count = 1;
            self.busy_chunks += 1;
            self.hits += 1;
            log::debug!(
                "reusing chunk {}v{} ({} elements) on {}",
                index,
                slot.generation,
                chunk.len,
                device
            );
            return Ok(Allocation {
                id: ChunkId::new(index, slot.generation),
                ptr: chunk.ptr,
                len: chunk.len,
            });
        }

        let ptr = backend.alloc(class.len, device)?;
        let chunk = MemoryChunk {
            device,
            len: class.len,
            ptr,
            ref_count: 1,
        };
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index as usize].chunk = Some(chunk);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    chunk: Some(chunk),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        self.busy_chunks += 1;
        self.misses += 1;
        log::debug!(
            "allocated chunk {}v{} ({} elements) on {}",
            index,
            generation,
            class.len,
            device
        );
        Ok(Allocation {
            id: ChunkId::new(index, generation),
            ptr,
            len: class.len,
        })
    }

    /// Increments the reference count of a busy chunk.
    pub(crate) fn add_reference(
        &mut self,
        device: Device,
        id: ChunkId,
    ) -> Result<usize, AllocatorError> {
        let chunk = self.busy_chunk_mut(device, id)?;
        chunk.ref_count += 1;
        log::trace!("chunk {} on {} now has {} references", id, device, chunk.ref_count);
        Ok(chunk.ref_count)
    }

    /// Decrements the reference count of a busy chunk, moving it to the free
    /// pool when the count reaches zero.
    pub(crate) fn release(&mut self, device: Device, id: ChunkId) -> Result<usize, AllocatorError> {
        let chunk = self.busy_chunk_mut(device, id)?;
        chunk.ref_count -= 1;
        let remaining = chunk.ref_count;
        if remaining == 0 {
            let class = SizeClass {
                device,
                len: chunk.len,
            };
            self.busy_chunks -= 1;
            self.free.entry(class).or_default().push(id.index);
            log::debug!("chunk {} on {} returned to the free pool", id, device);
        } else {
            log::trace!("chunk {} on {} now has {} references", id, device, remaining);
        }
        Ok(remaining)
    }

    /// Returns the reference count of a chunk, 0 if it is free, or `None` if
    /// `id` does not name a chunk of this pool on `device`.
    pub(crate) fn ref_count(&self, device: Device, id: ChunkId) -> Option<usize> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.chunk.as_ref())
            .filter(|chunk| chunk.device == device)
            .map(|chunk| chunk.ref_count)
    }

    /// Physically frees every free chunk. Returns the number of chunks freed.
    pub(crate) fn clear_unused(&mut self, backend: &dyn Backend) -> usize {
        let indices: Vec<u32> = self.free.drain().flat_map(|(_, v)| v).collect();
        let freed = indices.len();
        for index in indices {
            self.retire(backend, index);
        }
        if freed > 0 {
            log::debug!("freed {} unused chunks from the {} pool", freed, self.domain);
        }
        freed
    }

    /// Physically frees every chunk, busy or not. Returns the number of
    /// chunks freed.
    ///
    /// # Safety
    ///
    /// No buffer handed out by this pool may be accessed afterwards.
    pub(crate) unsafe fn clear_all(&mut self, backend: &dyn Backend) -> usize {
        let mut freed = self.clear_unused(backend);
        for index in 0..self.slots.len() as u32 {
            if self.slots[index as usize].chunk.is_some() {
                self.retire(backend, index);
                freed += 1;
            }
        }
        self.busy_chunks = 0;
        log::debug!("cleared the {} pool ({} chunks freed)", self.domain, freed);
        freed
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let free_chunks = self.free.values().map(Vec::len).sum();
        PoolStats {
            free_chunks,
            busy_chunks: self.busy_chunks,
            allocated_bytes: self.total_allocation_bytes(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Bytes held by free and busy chunks together.
    pub(crate) fn total_allocation_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.chunk.as_ref())
            .map(|chunk| chunk.len * ELEMENT_SIZE)
            .sum()
    }

    fn pop_free(&mut self, class: SizeClass) -> Option<u32> {
        let list = self.free.get_mut(&class)?;
        let index = list.pop();
        if list.is_empty() {
            self.free.remove(&class);
        }
        index
    }

    fn busy_chunk_mut(
        &mut self,
        device: Device,
        id: ChunkId,
    ) -> Result<&mut MemoryChunk, AllocatorError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.chunk.as_mut())
            .filter(|chunk| chunk.device == device && chunk.ref_count > 0)
            .ok_or(AllocatorError::UnknownReference { device, id })
    }

    /// Frees the chunk in `index` and makes the slot reusable under a new
    /// generation.
    fn retire(&mut self, backend: &dyn Backend, index: u32) {
        let slot = &mut self.slots[index as usize];
        if let Some(chunk) = slot.chunk.take() {
            // SAFETY: the chunk was allocated by `backend` with this length and
            // device, and it is no longer reachable through the pool
            unsafe { backend.dealloc(chunk.ptr, chunk.len, chunk.device) };
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, SimulatedAccelerator};

    #[test]
    fn test_acquire_rounds_to_size_class() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);

        let allocation = pool.acquire(&backend, &config, Device::Host, 1000)?;
        assert_eq!(allocation.len, 1024);
        assert_eq!(pool.ref_count(Device::Host, allocation.id), Some(1));
        assert_eq!(pool.stats().busy_chunks, 1);

        unsafe { pool.clear_all(&backend) };
        Ok(())
    }

    #[test]
    fn test_release_and_reuse() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);

        let first = pool.acquire(&backend, &config, Device::Host, 1000)?;
        assert_eq!(pool.release(Device::Host, first.id)?, 0);
        assert_eq!(pool.ref_count(Device::Host, first.id), Some(0));

        // 800 rounds to the same 1024 class
        let second = pool.acquire(&backend, &config, Device::Host, 800)?;
        assert_eq!(second, first);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.free_chunks, 0);

        unsafe { pool.clear_all(&backend) };
        Ok(())
    }

    #[test]
    fn test_different_class_is_not_reused() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);

        let small = pool.acquire(&backend, &config, Device::Host, 100)?;
        pool.release(Device::Host, small.id)?;
        let large = pool.acquire(&backend, &config, Device::Host, 300)?;
        assert_ne!(large.id, small.id);
        assert_eq!(pool.stats().free_chunks, 1);

        unsafe { pool.clear_all(&backend) };
        Ok(())
    }

    #[test]
    fn test_reference_counting() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);

        let allocation = pool.acquire(&backend, &config, Device::Host, 16)?;
        assert_eq!(pool.add_reference(Device::Host, allocation.id)?, 2);
        assert_eq!(pool.release(Device::Host, allocation.id)?, 1);
        assert_eq!(pool.stats().busy_chunks, 1);
        assert_eq!(pool.release(Device::Host, allocation.id)?, 0);
        assert_eq!(pool.stats().busy_chunks, 0);

        // a free chunk can no longer be referenced or released
        assert_eq!(
            pool.release(Device::Host, allocation.id),
            Err(AllocatorError::UnknownReference {
                device: Device::Host,
                id: allocation.id
            })
        );
        assert!(pool.add_reference(Device::Host, allocation.id).is_err());

        pool.clear_unused(&backend);
        Ok(())
    }

    #[test]
    fn test_accelerator_classes_are_per_device() -> Result<(), AllocatorError> {
        let backend = SimulatedAccelerator::new(2);
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Accelerator);

        let d0 = Device::accelerator(0);
        let d1 = Device::accelerator(1);
        let on_d0 = pool.acquire(&backend, &config, d0, 256)?;
        pool.release(d0, on_d0.id)?;

        let on_d1 = pool.acquire(&backend, &config, d1, 256)?;
        assert_ne!(on_d1.id, on_d0.id);
        assert_eq!(pool.ref_count(d1, on_d0.id), None);
        assert!(pool.add_reference(d1, on_d1.id).is_ok());
        assert!(pool.add_reference(d0, on_d1.id).is_err());

        unsafe { pool.clear_all(&backend) };
        assert_eq!(backend.used_bytes(0), 0);
        assert_eq!(backend.used_bytes(1), 0);
        Ok(())
    }

    #[test]
    fn test_clear_unused_keeps_busy_chunks() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);

        let kept = pool.acquire(&backend, &config, Device::Host, 10)?;
        let dropped = pool.acquire(&backend, &config, Device::Host, 10)?;
        pool.release(Device::Host, dropped.id)?;

        assert_eq!(pool.clear_unused(&backend), 1);
        let stats = pool.stats();
        assert_eq!(stats.free_chunks, 0);
        assert_eq!(stats.busy_chunks, 1);
        assert_eq!(stats.allocated_bytes, 256 * ELEMENT_SIZE);
        assert_eq!(pool.ref_count(Device::Host, kept.id), Some(1));
        assert_eq!(pool.ref_count(Device::Host, dropped.id), None);

        unsafe { pool.clear_all(&backend) };
        Ok(())
    }

    #[test]
    fn test_clear_all_invalidates_ids() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);

        let before = pool.acquire(&backend, &config, Device::Host, 10)?;
        assert_eq!(unsafe { pool.clear_all(&backend) }, 1);
        assert_eq!(pool.stats(), PoolStats { misses: 1, ..Default::default() });

        // the slot is reused under a new generation
        let after = pool.acquire(&backend, &config, Device::Host, 10)?;
        assert_eq!(after.id.index(), before.id.index());
        assert_ne!(after.id, before.id);
        assert!(pool.release(Device::Host, before.id).is_err());
        assert_eq!(pool.stats().misses, 2);

        unsafe { pool.clear_all(&backend) };
        Ok(())
    }

    #[test]
    fn test_zero_reused_chunks() -> Result<(), AllocatorError> {
        let backend = HostBackend::new();
        let config = PoolConfig {
            zero_reused_chunks: true,
            ..Default::default()
        };
        let mut pool = Pool::new(Domain::Host);

        let allocation = pool.acquire(&backend, &config, Device::Host, 4)?;
        unsafe { backend.write(&[7.0; 4], allocation.ptr, Device::Host)? };
        pool.release(Device::Host, allocation.id)?;

        let reused = pool.acquire(&backend, &config, Device::Host, 4)?;
        let mut out = [1.0f32; 4];
        unsafe { backend.read(reused.ptr, Device::Host, &mut out)? };
        assert_eq!(out, [0.0; 4]);

        unsafe { pool.clear_all(&backend) };
        Ok(())
    }

    #[test]
    fn test_oversized_request_fails() {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);
        let result = pool.acquire(&backend, &config, Device::Host, usize::MAX - 10);
        assert!(matches!(result, Err(AllocatorError::AllocationFailure { .. })));
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_wrong_domain_is_rejected() {
        let backend = HostBackend::new();
        let config = PoolConfig::default();
        let mut pool = Pool::new(Domain::Host);
        assert_eq!(
            pool.acquire(&backend, &config, Device::accelerator(0), 10),
            Err(AllocatorError::DeviceUnavailable(Device::accelerator(0)))
        );
    }
}
