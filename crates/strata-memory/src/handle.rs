//! Reference-counted handles over pooled chunks.
//!
//! A [`ChunkHandle`] is one reference to a busy chunk. Cloning it adds a
//! reference in the owning pool and dropping it releases one, so the pool's
//! reference count always equals the number of live handles.
//!
//! Handles aliasing one chunk share a reader-writer lock, so reads and writes
//! through them never overlap.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    allocator::AllocatorError,
    backend::{Backend, BufferPtr},
    device::Device,
    manager::MemoryManager,
    pool::ChunkId,
};

/// Shared view of one pooled chunk.
///
/// # Thread Safety
///
/// `ChunkHandle` is `Send` but not `Sync`: handles aliasing the same chunk may
/// be cloned and dropped on different threads, because every reference-count
/// change goes through the pool lock, but a single handle must not be shared.
/// [`ChunkHandle::read`] and [`ChunkHandle::write`] take the chunk's access
/// lock, shared by every alias. Raw access through [`ChunkHandle::ptr`]
/// bypasses it.
pub struct ChunkHandle {
    manager: Arc<MemoryManager>,
    device: Device,
    id: ChunkId,
    ptr: BufferPtr,
    /// Rounded element count of the chunk.
    len: usize,
    access: Arc<RwLock<()>>,
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

/// Shared access to a chunk that spans several reads.
///
/// No alias can write to the chunk while the reader is alive.
pub struct ChunkReader<'a> {
    handle: &'a ChunkHandle,
    _guard: RwLockReadGuard<'a, ()>,
}

impl ChunkReader<'_> {
    /// Copies `dst.len()` elements starting at `offset` into host memory.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::TransferFailure`] if the range is out of
    /// bounds or the backend copy fails.
    pub fn read(&self, offset: usize, dst: &mut [f32]) -> Result<(), AllocatorError> {
        let handle = self.handle;
        let src = handle.offset_ptr(offset, dst.len(), Device::Host)?;
        // SAFETY: the range was checked against the chunk length, the chunk
        // stays busy while the handle exists and no alias writes under the
        // read lock
        unsafe { handle.backend().read(src, handle.device, dst) }
            .map_err(|e| handle.transfer_error(handle.device, Device::Host, e))
    }
}

impl ChunkHandle {
    /// Acquires a chunk of at least `len` elements on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot allocate the chunk.
    pub fn acquire(
        manager: &Arc<MemoryManager>,
        device: Device,
        len: usize,
    ) -> Result<Self, AllocatorError> {
        let allocation = manager.acquire(device, len)?;
        Ok(Self {
            manager: Arc::clone(manager),
            device,
            id: allocation.id,
            ptr: allocation.ptr,
            len: allocation.len,
            access: Arc::new(RwLock::new(())),
            _not_sync: std::marker::PhantomData,
        })
    }

    /// Adds a reference to the chunk and returns a new handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::UnknownReference`] if the chunk is no longer
    /// busy, which only happens after the pool was cleared with `clear_all`.
    pub fn try_clone(&self) -> Result<Self, AllocatorError> {
        self.manager.add_reference(self.device, self.id)?;
        Ok(Self {
            manager: Arc::clone(&self.manager),
            device: self.device,
            id: self.id,
            ptr: self.ptr,
            len: self.len,
            access: Arc::clone(&self.access),
            _not_sync: std::marker::PhantomData,
        })
    }

    /// Returns the device the chunk lives on.
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the identity of the chunk.
    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Returns the address of the chunk.
    #[inline]
    pub fn ptr(&self) -> BufferPtr {
        self.ptr
    }

    /// Returns the number of elements in the chunk.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the chunk holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the manager owning the chunk.
    #[inline]
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// Returns the backend serving the chunk's device.
    #[inline]
    pub fn backend(&self) -> &dyn Backend {
        self.manager.backend(self.device.domain())
    }

    /// Returns the current number of references to the chunk.
    pub fn ref_count(&self) -> usize {
        self.manager.ref_count(self.device, self.id).unwrap_or(0)
    }

    /// Returns true if both handles reference the same chunk.
    pub fn same_chunk(&self, other: &ChunkHandle) -> bool {
        Arc::ptr_eq(&self.manager, &other.manager)
            && self.device == other.device
            && self.id == other.id
    }

    /// Copies `dst.len()` elements starting at `offset` into host memory.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::TransferFailure`] if the range is out of
    /// bounds or the backend copy fails.
    pub fn read(&self, offset: usize, dst: &mut [f32]) -> Result<(), AllocatorError> {
        self.reader().read(offset, dst)
    }

    /// Locks the chunk for reading until the returned reader is dropped.
    pub fn reader(&self) -> ChunkReader<'_> {
        ChunkReader {
            handle: self,
            _guard: read_lock(&self.access),
        }
    }

    /// Copies host memory into the chunk starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::TransferFailure`] if the range is out of
    /// bounds or the backend copy fails.
    pub fn write(&mut self, offset: usize, src: &[f32]) -> Result<(), AllocatorError> {
        let dst = self.offset_ptr(offset, src.len(), Device::Host)?;
        let _guard = write_lock(&self.access);
        // SAFETY: the range was checked against the chunk length, the chunk
        // stays busy while this handle exists and no alias accesses it under
        // the write lock
        unsafe { self.backend().write(src, dst, self.device) }
            .map_err(|e| self.transfer_error(Device::Host, self.device, e))
    }

    /// Copies `len` elements from `src` into this chunk. Both chunks must live
    /// on the same device.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::TransferFailure`] if the devices differ, a
    /// chunk is too short, or the backend copy fails.
    pub fn copy_from(&mut self, src: &ChunkHandle, len: usize) -> Result<(), AllocatorError> {
        if src.device != self.device {
            return Err(AllocatorError::transfer_failure(
                src.device,
                self.device,
                "chunk to chunk copies must stay on one device",
            ));
        }
        if len > src.len || len > self.len {
            return Err(AllocatorError::transfer_failure(
                src.device,
                self.device,
                format!("{} elements exceed the chunk length", len),
            ));
        }
        if self.same_chunk(src) || Arc::ptr_eq(&self.access, &src.access) {
            return Ok(());
        }
        // lock in address order so that opposite copies cannot deadlock
        let (_src_guard, _dst_guard) = if Arc::as_ptr(&src.access) < Arc::as_ptr(&self.access) {
            let src_guard = read_lock(&src.access);
            (src_guard, write_lock(&self.access))
        } else {
            let dst_guard = write_lock(&self.access);
            (read_lock(&src.access), dst_guard)
        };
        // SAFETY: both chunks are busy, distinct, locked and hold at least
        // `len` elements
        unsafe { self.backend().copy(src.ptr, self.ptr, len, self.device) }
            .map_err(|e| self.transfer_error(src.device, self.device, e))
    }

    fn offset_ptr(
        &self,
        offset: usize,
        count: usize,
        peer: Device,
    ) -> Result<BufferPtr, AllocatorError> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(BufferPtr::from_addr(
                self.ptr.addr() + offset * crate::allocator::ELEMENT_SIZE,
            )),
            _ => Err(AllocatorError::transfer_failure(
                self.device,
                peer,
                format!(
                    "range {}..{} exceeds chunk of {} elements",
                    offset,
                    offset.saturating_add(count),
                    self.len
                ),
            )),
        }
    }

    fn transfer_error(&self, from: Device, to: Device, e: AllocatorError) -> AllocatorError {
        match e {
            AllocatorError::TransferFailure { .. } => e,
            other => AllocatorError::transfer_failure(from, to, other.to_string()),
        }
    }
}

fn read_lock(lock: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    // the guarded data is `()`, a panicking holder leaves nothing inconsistent
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(lock: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Clone for ChunkHandle {
    /// Adds a reference to the chunk. O(1), the buffer is not copied.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is no longer tracked as busy. That only happens
    /// when the pool was torn down with `clear_all` while handles were alive,
    /// and continuing would hand out a dangling buffer.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("cannot add a reference to chunk {}: {}", self.id, e);
                panic!("chunk {} on {} was cleared while still referenced", self.id, self.device);
            }
        }
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(self.device, self.id) {
            log::warn!("dropping handle to chunk {}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
