use std::sync::OnceLock;

use cust::{
    context::{Context, CurrentContext},
    device::Device as CudaDevice,
    error::CudaError,
    memory::{cuda_free, cuda_malloc, CopyDestination, DevicePointer, DeviceSlice},
    CudaFlags,
};

use crate::{
    allocator::{AllocatorError, ELEMENT_SIZE},
    backend::{Backend, BufferPtr},
    device::{Device, Domain},
};

/// Accelerator backend for NVIDIA GPUs.
///
/// One context is created per device on first use. Device memory handed out
/// by this backend is not zero-initialized.
pub struct CudaBackend {
    contexts: Vec<OnceLock<Result<Context, CudaError>>>,
}

impl CudaBackend {
    /// Creates a backend serving devices `0..num_devices`.
    ///
    /// The driver is not touched until the first operation.
    pub fn new(num_devices: usize) -> Self {
        Self {
            contexts: (0..num_devices).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Makes the context of `device` current on the calling thread.
    fn bind(&self, device: Device) -> Result<(), AllocatorError> {
        let slot = device
            .device_id()
            .and_then(|id| self.contexts.get(id))
            .ok_or(AllocatorError::DeviceUnavailable(device))?;
        let context = slot.get_or_init(|| {
            static DRIVER: OnceLock<Result<(), CudaError>> = OnceLock::new();
            (*DRIVER.get_or_init(|| cust::init(CudaFlags::empty())))?;
            let ordinal = device.device_id().unwrap_or_default() as u32;
            CudaDevice::get_device(ordinal).and_then(Context::new)
        });
        match context {
            Ok(context) => CurrentContext::set_current(context).map_err(|e| {
                log::error!("cannot bind the context of {}: {}", device, e);
                AllocatorError::DeviceUnavailable(device)
            }),
            Err(e) => {
                log::error!("cannot create a context for {}: {}", device, e);
                Err(AllocatorError::DeviceUnavailable(device))
            }
        }
    }
}

fn device_ptr(ptr: BufferPtr) -> DevicePointer<f32> {
    DevicePointer::from_raw(ptr.addr() as u64)
}

impl Backend for CudaBackend {
    fn domain(&self) -> Domain {
        Domain::Accelerator
    }

    fn alloc(&self, len: usize, device: Device) -> Result<BufferPtr, AllocatorError> {
        if len.checked_mul(ELEMENT_SIZE).is_none() {
            return Err(AllocatorError::allocation_failure(
                device,
                len,
                "byte size overflows usize",
            ));
        }
        self.bind(device)?;
        // SAFETY: the returned memory is only accessed through this backend
        let ptr = unsafe { cuda_malloc::<f32>(len.max(1)) }
            .map_err(|e| AllocatorError::allocation_failure(device, len, e.to_string()))?;
        Ok(BufferPtr::from_addr(ptr.as_raw() as usize))
    }

    unsafe fn dealloc(&self, ptr: BufferPtr, _len: usize, device: Device) {
        if self.bind(device).is_err() {
            return;
        }
        if let Err(e) = cuda_free(device_ptr(ptr)) {
            log::error!("cuda free on {} failed: {}", device, e);
        }
    }

    unsafe fn read(
        &self,
        src: BufferPtr,
        device: Device,
        dst: &mut [f32],
    ) -> Result<(), AllocatorError> {
        self.bind(device)?;
        let slice = DeviceSlice::from_raw_parts(device_ptr(src), dst.len());
        slice
            .copy_to(dst)
            .map_err(|e| AllocatorError::transfer_failure(device, Device::Host, e.to_string()))
    }

    unsafe fn write(
        &self,
        src: &[f32],
        dst: BufferPtr,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.bind(device)?;
        let slice = DeviceSlice::from_raw_parts_mut(device_ptr(dst), src.len());
        slice
            .copy_from(src)
            .map_err(|e| AllocatorError::transfer_failure(Device::Host, device, e.to_string()))
    }

    unsafe fn copy(
        &self,
        src: BufferPtr,
        dst: BufferPtr,
        len: usize,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.bind(device)?;
        let src = DeviceSlice::from_raw_parts(device_ptr(src), len);
        let dst = DeviceSlice::from_raw_parts_mut(device_ptr(dst), len);
        dst.copy_from(src)
            .map_err(|e| AllocatorError::transfer_failure(device, device, e.to_string()))
    }

    fn synchronize(&self, device: Device) -> Result<(), AllocatorError> {
        if device.is_host() {
            return Ok(());
        }
        self.bind(device)?;
        CurrentContext::synchronize()
            .map_err(|e| AllocatorError::transfer_failure(device, device, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_backend_round_trip() -> Result<(), AllocatorError> {
        let backend = CudaBackend::new(1);
        let device = Device::accelerator(0);
        // skip if no CUDA device available
        let Ok(ptr) = backend.alloc(4, device) else {
            return Ok(());
        };
        let mut out = vec![0.0f32; 4];
        unsafe {
            backend.write(&[1.0, 2.0, 3.0, 4.0], ptr, device)?;
            backend.synchronize(device)?;
            backend.read(ptr, device, &mut out)?;
            backend.dealloc(ptr, 4, device);
        }
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_cuda_backend_unknown_device() {
        let backend = CudaBackend::new(1);
        assert_eq!(
            backend.alloc(4, Device::accelerator(2)),
            Err(AllocatorError::DeviceUnavailable(Device::accelerator(2)))
        );
    }
}
