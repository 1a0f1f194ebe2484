//! The process-facing memory manager.
//!
//! [`MemoryManager`] owns one host pool and one accelerator pool, each behind
//! its own lock. Every accelerator device shares the accelerator lock, so
//! operations on different devices are serialized with respect to each other.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::{
    allocator::AllocatorError,
    backend::{Backend, HostBackend, SimulatedAccelerator},
    config::{ConfigError, PoolConfig},
    device::{Device, Domain},
    pool::{Allocation, ChunkId, Pool, PoolStats},
};

/// Reference-counted chunk pools for host and accelerator memory.
///
/// # Examples
///
/// ```
/// use strata_memory::{Device, MemoryManager, PoolConfig};
///
/// let manager = MemoryManager::new(PoolConfig::default())?;
/// let first = manager.acquire(Device::Host, 1000)?;
/// manager.release(Device::Host, first.id)?;
///
/// // same size class, so the released chunk comes back
/// let second = manager.acquire(Device::Host, 1000)?;
/// assert_eq!(first.id, second.id);
/// # manager.release(Device::Host, second.id)?;
/// # Ok::<(), strata_memory::AllocatorError>(())
/// ```
pub struct MemoryManager {
    config: PoolConfig,
    host_backend: Arc<dyn Backend>,
    accelerator_backend: Arc<dyn Backend>,
    host: Mutex<Pool>,
    accelerator: Mutex<Pool>,
}

impl MemoryManager {
    /// Creates a manager with the host backend and the default accelerator
    /// backend for `config`.
    ///
    /// The default accelerator backend is [`crate::cuda::CudaBackend`] when the
    /// `cuda` feature is enabled and [`SimulatedAccelerator`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` does not pass
    /// [`PoolConfig::validate`].
    pub fn new(config: PoolConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let accelerator = default_accelerator_backend(&config);
        Ok(Self::build(config, Arc::new(HostBackend::new()), accelerator))
    }

    /// Creates a manager with explicit backends.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` does not pass
    /// [`PoolConfig::validate`].
    pub fn with_backends(
        config: PoolConfig,
        host_backend: Arc<dyn Backend>,
        accelerator_backend: Arc<dyn Backend>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, host_backend, accelerator_backend))
    }

    /// Returns the process-wide manager.
    ///
    /// It is built on first use from [`PoolConfig::from_env`], falling back to
    /// the default configuration when the environment is invalid.
    pub fn global() -> &'static Arc<MemoryManager> {
        static GLOBAL: OnceLock<Arc<MemoryManager>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = PoolConfig::from_env().unwrap_or_else(|e| {
                log::warn!("ignoring pool configuration from environment: {}", e);
                PoolConfig::default()
            });
            let accelerator = default_accelerator_backend(&config);
            Self::build(config, Arc::new(HostBackend::new()), accelerator)
        })
    }

    /// `config` must already be validated.
    fn build(
        config: PoolConfig,
        host_backend: Arc<dyn Backend>,
        accelerator_backend: Arc<dyn Backend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            host_backend,
            accelerator_backend,
            host: Mutex::new(Pool::new(Domain::Host)),
            accelerator: Mutex::new(Pool::new(Domain::Accelerator)),
        })
    }

    /// Returns the configuration of this manager.
    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the backend serving `domain`.
    pub fn backend(&self, domain: Domain) -> &dyn Backend {
        match domain {
            Domain::Host => self.host_backend.as_ref(),
            Domain::Accelerator => self.accelerator_backend.as_ref(),
        }
    }

    /// Returns a busy chunk of at least `len` elements on `device`, with a
    /// reference count of one.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::AllocationFailure`] if a new chunk is needed
    /// and the backend cannot allocate it.
    pub fn acquire(&self, device: Device, len: usize) -> Result<Allocation, AllocatorError> {
        let domain = device.domain();
        self.lock(domain)
            .acquire(self.backend(domain), &self.config, device, len)
    }

    /// Adds a reference to a busy chunk and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::UnknownReference`] if `id` is not busy on
    /// `device`.
    pub fn add_reference(&self, device: Device, id: ChunkId) -> Result<usize, AllocatorError> {
        self.lock(device.domain()).add_reference(device, id)
    }

    /// Drops a reference to a busy chunk and returns the remaining count.
    ///
    /// At zero the chunk moves to the free pool, where any later acquisition
    /// of the same size class may reuse it.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::UnknownReference`] if `id` is not busy on
    /// `device`.
    pub fn release(&self, device: Device, id: ChunkId) -> Result<usize, AllocatorError> {
        self.lock(device.domain()).release(device, id)
    }

    /// Returns the reference count of a chunk (0 while free), or `None` for an
    /// identity the pool does not know.
    pub fn ref_count(&self, device: Device, id: ChunkId) -> Option<usize> {
        self.lock(device.domain()).ref_count(device, id)
    }

    /// Physically frees every unreferenced chunk in `domain`.
    ///
    /// Busy chunks are left untouched. Returns the number of chunks freed.
    pub fn clear_unused(&self, domain: Domain) -> usize {
        self.lock(domain).clear_unused(self.backend(domain))
    }

    /// Physically frees every chunk in `domain`, including chunks that are
    /// still referenced. Returns the number of chunks freed.
    ///
    /// Handles dropped afterwards release into an unknown identity, which is
    /// logged and ignored.
    ///
    /// # Safety
    ///
    /// No buffer acquired from this domain before the call may be read or
    /// written afterwards, from any thread.
    pub unsafe fn clear_all(&self, domain: Domain) -> usize {
        self.lock(domain).clear_all(self.backend(domain))
    }

    /// Returns a snapshot of the pool serving `domain`.
    pub fn stats(&self, domain: Domain) -> PoolStats {
        self.lock(domain).stats()
    }

    /// Bytes held by the pool serving `domain`, free and busy chunks together.
    pub fn total_allocation_bytes(&self, domain: Domain) -> usize {
        self.lock(domain).total_allocation_bytes()
    }

    fn lock(&self, domain: Domain) -> MutexGuard<'_, Pool> {
        let pool = match domain {
            Domain::Host => &self.host,
            Domain::Accelerator => &self.accelerator,
        };
        // a panic while holding the lock cannot leave a chunk in both
        // collections, every mutation is a single step
        pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        // every handle keeps the manager alive, so nothing can reference the
        // chunks anymore
        let pools = [
            (&mut self.host, self.host_backend.as_ref()),
            (&mut self.accelerator, self.accelerator_backend.as_ref()),
        ];
        for (pool, backend) in pools {
            let pool = pool
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // SAFETY: no handle outlives the manager
            unsafe { pool.clear_all(backend) };
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("host", &self.stats(Domain::Host))
            .field("accelerator", &self.stats(Domain::Accelerator))
            .finish()
    }
}

#[cfg(not(feature = "cuda"))]
fn default_accelerator_backend(config: &PoolConfig) -> Arc<dyn Backend> {
    let backend = SimulatedAccelerator::new(config.accelerator_devices);
    match config.accelerator_capacity_bytes {
        Some(capacity) => Arc::new(backend.with_capacity(capacity)),
        None => Arc::new(backend),
    }
}

#[cfg(feature = "cuda")]
fn default_accelerator_backend(config: &PoolConfig) -> Arc<dyn Backend> {
    if config.accelerator_capacity_bytes.is_some() {
        log::warn!("accelerator_capacity_bytes only applies to the simulated accelerator");
    }
    Arc::new(crate::cuda::CudaBackend::new(config.accelerator_devices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_and_accelerator_pools_are_independent() -> Result<(), AllocatorError> {
        let manager = MemoryManager::new(PoolConfig::default())?;
        let host = manager.acquire(Device::Host, 10)?;
        let accel = manager.acquire(Device::accelerator(0), 10)?;

        assert_eq!(manager.stats(Domain::Host).busy_chunks, 1);
        assert_eq!(manager.stats(Domain::Accelerator).busy_chunks, 1);

        // releasing one domain leaves the other untouched
        manager.release(Device::accelerator(0), accel.id)?;
        assert_eq!(manager.stats(Domain::Accelerator).free_chunks, 1);
        assert_eq!(manager.stats(Domain::Host).busy_chunks, 1);

        manager.release(Device::Host, host.id)?;
        assert_eq!(manager.stats(Domain::Host).free_chunks, 1);
        assert_eq!(manager.clear_unused(Domain::Host), 1);
        assert_eq!(manager.total_allocation_bytes(Domain::Host), 0);
        Ok(())
    }

    #[test]
    fn test_unknown_device() -> Result<(), AllocatorError> {
        let manager = MemoryManager::new(PoolConfig::default())?;
        assert_eq!(
            manager.acquire(Device::accelerator(5), 10),
            Err(AllocatorError::DeviceUnavailable(Device::accelerator(5)))
        );
        Ok(())
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PoolConfig {
            allocation_unit: 0,
            ..Default::default()
        };
        assert_eq!(
            MemoryManager::new(config).err(),
            Some(ConfigError::Zero("allocation_unit"))
        );
        assert_eq!(
            MemoryManager::with_backends(
                PoolConfig {
                    host_column_alignment: 0,
                    ..Default::default()
                },
                Arc::new(HostBackend::new()),
                Arc::new(SimulatedAccelerator::new(1)),
            )
            .err(),
            Some(ConfigError::Zero("host_column_alignment"))
        );

        // the error converts for callers working with allocator results
        let err: AllocatorError = ConfigError::Zero("allocation_unit").into();
        assert!(err.is_programming_error());
    }

    #[test]
    fn test_oversized_acquire_is_an_error() -> Result<(), AllocatorError> {
        let manager = MemoryManager::new(PoolConfig::default())?;
        for device in [Device::Host, Device::accelerator(0)] {
            let err = manager.acquire(device, usize::MAX - 10).unwrap_err();
            assert!(err.is_out_of_memory());
            assert_eq!(manager.stats(device.domain()).busy_chunks, 0);
        }

        // a size class that fits but cannot be allocated fails in the backend
        assert!(manager.acquire(Device::Host, usize::MAX / 2).is_err());
        Ok(())
    }

    #[test]
    fn test_clear_all() -> Result<(), AllocatorError> {
        let manager = MemoryManager::new(PoolConfig::default())?;
        let busy = manager.acquire(Device::Host, 10)?;
        let free = manager.acquire(Device::Host, 600)?;
        manager.release(Device::Host, free.id)?;

        assert_eq!(unsafe { manager.clear_all(Domain::Host) }, 2);
        let stats = manager.stats(Domain::Host);
        assert_eq!(stats.busy_chunks, 0);
        assert_eq!(stats.free_chunks, 0);
        assert_eq!(manager.ref_count(Device::Host, busy.id), None);
        Ok(())
    }

    #[test]
    fn test_global_manager_is_shared() {
        let a = MemoryManager::global();
        let b = MemoryManager::global();
        assert!(Arc::ptr_eq(a, b));
    }
}
