use std::alloc;
use std::alloc::Layout;
use std::ptr::NonNull;

use thiserror::Error;

use crate::{config::ConfigError, device::Device, pool::ChunkId};

/// An error type for pooled allocator operations.
#[derive(Debug, Error, PartialEq)]
pub enum AllocatorError {
    /// The underlying host or device allocation was denied.
    #[error("Failed to allocate {len} elements on {device}: {reason}")]
    AllocationFailure {
        /// Device the allocation was requested on
        device: Device,
        /// Requested number of elements, after size-class rounding
        len: usize,
        /// Backend supplied reason
        reason: String,
    },

    /// A copy across the host/accelerator boundary failed.
    #[error("Failed to transfer data from {from} to {to}: {reason}")]
    TransferFailure {
        /// Source device
        from: Device,
        /// Destination device
        to: Device,
        /// Backend supplied reason
        reason: String,
    },

    /// A reference-count operation targeted a chunk that is not busy.
    #[error("Chunk {id} is not tracked as busy on {device}")]
    UnknownReference {
        /// Device the operation was routed to
        device: Device,
        /// The chunk identity that was not found
        id: ChunkId,
    },

    /// The requested device is not served by the backend.
    #[error("Device {0} is not available")]
    DeviceUnavailable(Device),

    /// The requested size cannot be expressed as a memory layout.
    #[error("Invalid buffer layout {0}")]
    LayoutError(core::alloc::LayoutError),

    /// The pool configuration was rejected.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl AllocatorError {
    /// Creates an AllocationFailure error with context.
    pub fn allocation_failure(device: Device, len: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            device,
            len,
            reason: reason.into(),
        }
    }

    /// Creates a TransferFailure error with context.
    pub fn transfer_failure(from: Device, to: Device, reason: impl Into<String>) -> Self {
        Self::TransferFailure {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Returns true if this error may be recoverable by clearing unused chunks.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::AllocationFailure { .. })
    }

    /// Returns true if this error indicates a lifecycle bug in the caller.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownReference { .. }
                | Self::DeviceUnavailable(_)
                | Self::LayoutError(_)
                | Self::InvalidConfig(_)
        )
    }

    /// Returns a user-friendly suggestion for resolving the error.
    pub fn suggestion(&self) -> &str {
        match self {
            Self::AllocationFailure { .. } => {
                "Call clear_unused() to return cached chunks to the system, or reduce tensor sizes"
            }
            Self::TransferFailure { .. } => "Check that the accelerator is reachable and retry",
            Self::UnknownReference { .. } => {
                "A handle outlived its pool (clear_all) or was released twice"
            }
            Self::DeviceUnavailable(_) => "Check the configured number of accelerator devices",
            Self::LayoutError(_) => "Reduce the requested element count",
            Self::InvalidConfig(_) => "Set allocation_unit and host_column_alignment above zero",
        }
    }
}

/// Size in bytes of one pooled element.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// Returns the layout of a buffer holding `len` pooled elements.
pub fn element_layout(len: usize) -> Result<Layout, AllocatorError> {
    Layout::array::<f32>(len).map_err(AllocatorError::LayoutError)
}

/// Allocator for host chunks backed by the system allocator.
///
/// Every allocation is zero-initialized.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAllocator;

impl HostAllocator {
    /// Allocates zeroed memory for `len` elements.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::AllocationFailure`] if the system allocator
    /// returns a null pointer.
    pub fn alloc_zeroed(&self, len: usize) -> Result<NonNull<f32>, AllocatorError> {
        let layout = element_layout(len.max(1))?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) } as *mut f32;
        NonNull::new(ptr).ok_or_else(|| {
            AllocatorError::allocation_failure(Device::Host, len, "system allocator returned null")
        })
    }

    /// Deallocates memory previously returned by [`HostAllocator::alloc_zeroed`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_zeroed` with the same `len` and must not be
    /// used afterwards.
    pub unsafe fn dealloc(&self, ptr: NonNull<f32>, len: usize) {
        if let Ok(layout) = element_layout(len.max(1)) {
            alloc::dealloc(ptr.as_ptr() as *mut u8, layout);
        }
    }
}
