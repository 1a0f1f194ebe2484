//! Backend abstraction for device memory operations.
//!
//! A [`Backend`] is the minimal device API the pools call into: allocate,
//! free, and copy between a device and host memory. The host pool is served
//! by [`HostBackend`]; the accelerator pool by [`SimulatedAccelerator`] or,
//! with the `cuda` feature, by [`crate::cuda::CudaBackend`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    allocator::{AllocatorError, HostAllocator, ELEMENT_SIZE},
    device::{Device, Domain},
};

/// Opaque address of a buffer in some memory domain.
///
/// For host buffers this is a real pointer. For accelerator buffers it is a
/// device address and must never be dereferenced on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferPtr(usize);

impl BufferPtr {
    /// Wraps a raw address.
    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address.
    pub fn addr(&self) -> usize {
        self.0
    }

    /// Reinterprets the address as a host pointer.
    pub fn as_host_ptr(&self) -> *mut f32 {
        self.0 as *mut f32
    }
}

impl From<NonNull<f32>> for BufferPtr {
    fn from(ptr: NonNull<f32>) -> Self {
        Self(ptr.as_ptr() as usize)
    }
}

/// Backend trait defining core device memory operations.
///
/// All lengths are element counts, not bytes.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. The pools call into a backend while
/// holding the owning pool lock.
pub trait Backend: Send + Sync + 'static {
    /// Returns the memory domain served by this backend.
    fn domain(&self) -> Domain;

    /// Allocates memory for `len` elements on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::AllocationFailure`] if the allocation is denied
    /// and [`AllocatorError::DeviceUnavailable`] if `device` is not served.
    fn alloc(&self, len: usize, device: Device) -> Result<BufferPtr, AllocatorError>;

    /// Deallocates memory on `device`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this backend with the same `len` and
    /// `device`, and must not be used after deallocation.
    unsafe fn dealloc(&self, ptr: BufferPtr, len: usize, device: Device);

    /// Copies `dst.len()` elements from a buffer on `device` into host memory.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `dst.len()` elements on `device`.
    unsafe fn read(&self, src: BufferPtr, device: Device, dst: &mut [f32])
        -> Result<(), AllocatorError>;

    /// Copies host memory into a buffer on `device`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `src.len()` elements on `device`.
    unsafe fn write(&self, src: &[f32], dst: BufferPtr, device: Device)
        -> Result<(), AllocatorError>;

    /// Copies `len` elements between two buffers on the same device.
    ///
    /// # Safety
    ///
    /// Both buffers must be valid for `len` elements on `device` and must not
    /// overlap.
    unsafe fn copy(
        &self,
        src: BufferPtr,
        dst: BufferPtr,
        len: usize,
        device: Device,
    ) -> Result<(), AllocatorError>;

    /// Waits for pending operations on `device`.
    ///
    /// Host operations are synchronous, so the default is a no-op.
    fn synchronize(&self, _device: Device) -> Result<(), AllocatorError> {
        Ok(())
    }
}

/// Host backend implementation using the system allocator.
#[derive(Debug, Clone, Default)]
pub struct HostBackend {
    allocator: HostAllocator,
}

impl HostBackend {
    /// Creates a new host backend.
    pub fn new() -> Self {
        Self {
            allocator: HostAllocator,
        }
    }

    fn check_device(&self, device: Device) -> Result<(), AllocatorError> {
        if device.is_host() {
            Ok(())
        } else {
            Err(AllocatorError::DeviceUnavailable(device))
        }
    }
}

impl Backend for HostBackend {
    fn domain(&self) -> Domain {
        Domain::Host
    }

    fn alloc(&self, len: usize, device: Device) -> Result<BufferPtr, AllocatorError> {
        self.check_device(device)?;
        self.allocator.alloc_zeroed(len).map(BufferPtr::from)
    }

    unsafe fn dealloc(&self, ptr: BufferPtr, len: usize, _device: Device) {
        if let Some(ptr) = NonNull::new(ptr.as_host_ptr()) {
            self.allocator.dealloc(ptr, len);
        }
    }

    unsafe fn read(
        &self,
        src: BufferPtr,
        device: Device,
        dst: &mut [f32],
    ) -> Result<(), AllocatorError> {
        self.check_device(device)?;
        std::ptr::copy_nonoverlapping(src.as_host_ptr(), dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    unsafe fn write(
        &self,
        src: &[f32],
        dst: BufferPtr,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.check_device(device)?;
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_host_ptr(), src.len());
        Ok(())
    }

    unsafe fn copy(
        &self,
        src: BufferPtr,
        dst: BufferPtr,
        len: usize,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.check_device(device)?;
        std::ptr::copy_nonoverlapping(src.as_host_ptr(), dst.as_host_ptr(), len);
        Ok(())
    }
}

/// Accelerator backend that emulates device memory in host memory.
///
/// It serves a fixed number of devices and can enforce a per-device byte
/// capacity, which makes allocation failures reproducible. Device addresses
/// it hands out are host addresses, but callers must still treat them as
/// opaque.
#[derive(Debug)]
pub struct SimulatedAccelerator {
    allocator: HostAllocator,
    /// Bytes currently allocated on each device.
    used: Vec<AtomicUsize>,
    capacity_bytes: Option<usize>,
}

impl SimulatedAccelerator {
    /// Creates a simulated accelerator with `num_devices` devices.
    pub fn new(num_devices: usize) -> Self {
        Self {
            allocator: HostAllocator,
            used: (0..num_devices).map(|_| AtomicUsize::new(0)).collect(),
            capacity_bytes: None,
        }
    }

    /// Limits the memory of every device to `capacity_bytes`.
    pub fn with_capacity(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    /// Returns the number of simulated devices.
    pub fn num_devices(&self) -> usize {
        self.used.len()
    }

    /// Returns the bytes currently allocated on `device_id`.
    pub fn used_bytes(&self, device_id: usize) -> usize {
        self.used
            .get(device_id)
            .map_or(0, |used| used.load(Ordering::Acquire))
    }

    fn device_counter(&self, device: Device) -> Result<&AtomicUsize, AllocatorError> {
        device
            .device_id()
            .and_then(|id| self.used.get(id))
            .ok_or(AllocatorError::DeviceUnavailable(device))
    }
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Backend for SimulatedAccelerator {
    fn domain(&self) -> Domain {
        Domain::Accelerator
    }

    fn alloc(&self, len: usize, device: Device) -> Result<BufferPtr, AllocatorError> {
        let counter = self.device_counter(device)?;
        let bytes = len.checked_mul(ELEMENT_SIZE).ok_or_else(|| {
            AllocatorError::allocation_failure(device, len, "byte size overflows usize")
        })?;
        let capacity = self.capacity_bytes.unwrap_or(usize::MAX);
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .map_err(|used| {
                AllocatorError::allocation_failure(
                    device,
                    len,
                    format!(
                        "{} bytes requested with {} of {} bytes in use",
                        bytes, used, capacity
                    ),
                )
            })?;
        match self.allocator.alloc_zeroed(len) {
            Ok(ptr) => Ok(BufferPtr::from(ptr)),
            Err(_) => {
                counter.fetch_sub(bytes, Ordering::AcqRel);
                Err(AllocatorError::allocation_failure(
                    device,
                    len,
                    "device memory exhausted",
                ))
            }
        }
    }

    unsafe fn dealloc(&self, ptr: BufferPtr, len: usize, device: Device) {
        if let Ok(counter) = self.device_counter(device) {
            counter.fetch_sub(len * ELEMENT_SIZE, Ordering::AcqRel);
        }
        if let Some(ptr) = NonNull::new(ptr.as_host_ptr()) {
            self.allocator.dealloc(ptr, len);
        }
    }

    unsafe fn read(
        &self,
        src: BufferPtr,
        device: Device,
        dst: &mut [f32],
    ) -> Result<(), AllocatorError> {
        self.device_counter(device)?;
        std::ptr::copy_nonoverlapping(src.as_host_ptr(), dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    unsafe fn write(
        &self,
        src: &[f32],
        dst: BufferPtr,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.device_counter(device)?;
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_host_ptr(), src.len());
        Ok(())
    }

    unsafe fn copy(
        &self,
        src: BufferPtr,
        dst: BufferPtr,
        len: usize,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.device_counter(device)?;
        std::ptr::copy_nonoverlapping(src.as_host_ptr(), dst.as_host_ptr(), len);
        Ok(())
    }
}
