use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use strata_memory::{
    AllocatorError, Backend, BufferPtr, ChunkHandle, Device, Domain, HostBackend, MemoryManager,
    PoolConfig, SimulatedAccelerator,
};
use strata_tensor::{ElementKind, Shape, SparseMatrix, SyncDirection, TensorData, TensorError};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_shape(rng: &mut StdRng) -> Result<Shape, TensorError> {
    let rank = rng.random_range(1..=4);
    let dims: Vec<usize> = (0..rank).map(|_| rng.random_range(1..=9)).collect();
    Shape::new(dims)
}

/// Simulated accelerator whose host to device copies can be made to fail.
struct FlakyAccelerator {
    inner: SimulatedAccelerator,
    fail_writes: AtomicBool,
}

impl Backend for FlakyAccelerator {
    fn domain(&self) -> Domain {
        self.inner.domain()
    }

    fn alloc(&self, len: usize, device: Device) -> Result<BufferPtr, AllocatorError> {
        self.inner.alloc(len, device)
    }

    unsafe fn dealloc(&self, ptr: BufferPtr, len: usize, device: Device) {
        self.inner.dealloc(ptr, len, device)
    }

    unsafe fn read(
        &self,
        src: BufferPtr,
        device: Device,
        dst: &mut [f32],
    ) -> Result<(), AllocatorError> {
        self.inner.read(src, device, dst)
    }

    unsafe fn write(
        &self,
        src: &[f32],
        dst: BufferPtr,
        device: Device,
    ) -> Result<(), AllocatorError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(AllocatorError::transfer_failure(
                Device::Host,
                device,
                "link down",
            ));
        }
        self.inner.write(src, dst, device)
    }

    unsafe fn copy(
        &self,
        src: BufferPtr,
        dst: BufferPtr,
        len: usize,
        device: Device,
    ) -> Result<(), AllocatorError> {
        self.inner.copy(src, dst, len, device)
    }
}

#[test]
fn test_padded_accelerator_to_host() -> Result<(), TensorError> {
    init_logger();
    let manager = MemoryManager::new(PoolConfig::default())?;
    let mut t = TensorData::new_in(
        &manager,
        Shape::new([4, 4])?,
        ElementKind::Dense,
        Device::accelerator(0),
    )?;
    let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
    t.copy_from_slice(&data)?;
    assert_eq!(t.dense_total_length_accelerator(), 16);

    assert!(t.send_to(Device::Host)?);
    assert_eq!(t.device(), Device::Host);
    assert_eq!(t.padded_host_col_size(), 8);
    assert_eq!(t.dense_total_length_host(), 32);
    assert_eq!(t.dense_total_length_accelerator(), 16);
    assert!(t.dense_accelerator_chunk().is_none());

    let host = unsafe { t.host_slice() }.map(<[f32]>::to_vec);
    let Some(host) = host else {
        panic!("host buffer missing after transfer");
    };
    assert_eq!(host.len(), 32);
    for (row, padded) in host.chunks_exact(8).enumerate() {
        assert_eq!(&padded[..4], &data[row * 4..row * 4 + 4]);
        assert_eq!(&padded[4..], &[0.0; 4]);
    }

    // the accelerator chunk went back to the free pool
    let stats = manager.stats(Domain::Accelerator);
    assert_eq!(stats.busy_chunks, 0);
    assert_eq!(stats.free_chunks, 1);
    Ok(())
}

#[test]
fn test_transfer_round_trip() -> Result<(), TensorError> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..25 {
        let shape = random_shape(&mut rng)?;
        let data: Vec<f32> = (0..shape.size()).map(|_| rng.random_range(-1.0..1.0)).collect();

        let mut dense =
            TensorData::new_in(&manager, shape.clone(), ElementKind::Dense, Device::Host)?;
        dense.copy_from_slice(&data)?;
        assert!(!dense.send_to(Device::Host)?);
        assert!(dense.send_to(Device::accelerator(0))?);
        assert!(dense.send_to(Device::Host)?);
        assert_eq!(dense.to_vec()?, data);

        let rows = shape.size() / shape.cols();
        let matrix = SparseMatrix::from_dense(rows, shape.cols(), &data)?;
        let mut sparse = TensorData::new_in(&manager, shape, ElementKind::Sparse, Device::Host)?;
        sparse.load_sparse(&matrix)?;
        assert!(sparse.send_to(Device::accelerator(0))?);
        assert!(sparse.sparse_chunk(Domain::Host).is_none());
        assert!(sparse.send_to(Device::Host)?);
        assert_eq!(sparse.sparse_matrix()?, matrix);
    }
    Ok(())
}

#[test]
fn test_reference_symmetry() -> Result<(), TensorError> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    let t = TensorData::new_in(
        &manager,
        Shape::new([8, 8])?,
        ElementKind::Dense,
        Device::accelerator(0),
    )?;
    let ref_count = |t: &TensorData| t.dense_accelerator_chunk().map(ChunkHandle::ref_count);

    let aliases: Vec<TensorData> = (0..5).map(|_| t.clone()).collect();
    assert_eq!(ref_count(&t), Some(6));

    let id = t.dense_accelerator_chunk().map(ChunkHandle::id);
    drop(aliases);
    assert_eq!(ref_count(&t), Some(1));
    drop(t);

    let id = id.ok_or(TensorError::MissingBuffer(Domain::Accelerator))?;
    assert_eq!(manager.ref_count(Device::accelerator(0), id), Some(0));
    assert_eq!(manager.stats(Domain::Accelerator).free_chunks, 1);
    Ok(())
}

#[test]
fn test_copy_independence() -> Result<(), TensorError> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    let shape = Shape::new([3, 5])?;
    for device in [Device::Host, Device::accelerator(0)] {
        let mut t = TensorData::new_in(&manager, shape.clone(), ElementKind::Dense, device)?;
        t.fill(0.25)?;

        let mut copy = t.create_copy()?;
        let chunk = |t: &TensorData| {
            t.dense_host_chunk()
                .or(t.dense_accelerator_chunk())
                .map(ChunkHandle::id)
        };
        assert!(chunk(&copy).is_some());
        assert_ne!(chunk(&copy), chunk(&t));
        copy.fill(2.0)?;
        let sum: f32 = t.to_vec()?.iter().sum();
        assert_relative_eq!(sum, 0.25 * 15.0);

        t.fill(-1.0)?;
        assert_eq!(copy.to_vec()?, vec![2.0; 15]);
    }
    Ok(())
}

#[test]
fn test_shallow_alias_equivalence() -> Result<(), TensorError> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    let shape = Shape::new([2, 5])?;
    let mut t = TensorData::new_in(&manager, shape, ElementKind::Dense, Device::Host)?;
    t.fill(0.0)?;
    let alias = t.clone();

    if let Some(host) = unsafe { t.host_slice_mut() } {
        host[3] = 7.0;
    }
    assert_eq!(alias.to_vec()?[3], 7.0);
    assert_eq!(alias.host_ptr(), t.host_ptr());
    Ok(())
}

#[test]
fn test_failed_transfer_leaves_tensor_untouched() -> Result<(), TensorError> {
    init_logger();
    let accelerator = Arc::new(FlakyAccelerator {
        inner: SimulatedAccelerator::new(1),
        fail_writes: AtomicBool::new(false),
    });
    let manager = MemoryManager::with_backends(
        PoolConfig::default(),
        Arc::new(HostBackend::new()),
        accelerator.clone(),
    )?;

    let mut t =
        TensorData::new_in(&manager, Shape::new([2, 2])?, ElementKind::Dense, Device::Host)?;
    t.copy_from_slice(&[1.0, 2.0, 3.0, 4.0])?;
    let before = t.dense_host_chunk().map(ChunkHandle::id);

    accelerator.fail_writes.store(true, Ordering::Release);
    let err = t.send_to(Device::accelerator(0)).unwrap_err();
    assert!(matches!(
        err,
        TensorError::Storage(AllocatorError::TransferFailure { .. })
    ));

    assert_eq!(t.device(), Device::Host);
    assert_eq!(t.dense_host_chunk().map(ChunkHandle::id), before);
    assert!(t.dense_accelerator_chunk().is_none());
    assert_eq!(t.to_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    // the target chunk was released, not leaked
    assert_eq!(manager.stats(Domain::Accelerator).busy_chunks, 0);

    accelerator.fail_writes.store(false, Ordering::Release);
    assert!(t.send_to(Device::accelerator(0))?);
    assert_eq!(t.to_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn test_failed_sync_reports_sync_failure() -> Result<(), TensorError> {
    let accelerator = Arc::new(FlakyAccelerator {
        inner: SimulatedAccelerator::new(1),
        fail_writes: AtomicBool::new(false),
    });
    let manager = MemoryManager::with_backends(
        PoolConfig::default(),
        Arc::new(HostBackend::new()),
        accelerator.clone(),
    )?;
    let mut t = TensorData::new_in(
        &manager,
        Shape::new([3])?,
        ElementKind::Dense,
        Device::accelerator(0),
    )?;
    t.copy_from_slice(&[1.0, 2.0, 3.0])?;
    t.attach_host_mirror()?;

    accelerator.fail_writes.store(true, Ordering::Release);
    assert!(t.sync_with_host(SyncDirection::AcceleratorToHost)?);
    assert!(matches!(
        t.sync_with_host(SyncDirection::HostToAccelerator),
        Err(TensorError::SyncFailure(_))
    ));
    Ok(())
}

#[test]
fn test_sparse_deep_copy_reuses_chunk() -> Result<(), TensorError> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    let shape = Shape::new([4, 3])?;
    let mut src = TensorData::new_in(&manager, shape.clone(), ElementKind::Sparse, Device::Host)?;
    let matrix = SparseMatrix::from_triplets(4, 3, &[(0, 0, 1.0), (3, 2, 5.0)])?;
    src.load_sparse(&matrix)?;

    let mut dst = TensorData::new_in(&manager, shape, ElementKind::Sparse, Device::Host)?;
    let before = dst.sparse_chunk(Domain::Host).map(ChunkHandle::id);
    TensorData::deep_copy(&mut dst, &src)?;

    // written in place
    assert_eq!(dst.sparse_chunk(Domain::Host).map(ChunkHandle::id), before);
    assert_eq!(dst.sparse_matrix()?, matrix);
    assert_eq!(dst.sparse_total_length(), src.sparse_total_length());

    // and stays independent from the source
    src.load_sparse(&SparseMatrix::zeros(4, 3))?;
    assert_eq!(dst.sparse_matrix()?, matrix);
    Ok(())
}

#[test]
fn test_tensors_across_threads() -> Result<(), Box<dyn std::error::Error>> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    let mut t = TensorData::new_in(
        &manager,
        Shape::new([16, 16])?,
        ElementKind::Dense,
        Device::accelerator(0),
    )?;
    t.fill(3.0)?;

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let alias = t.clone();
            std::thread::spawn(move || -> Result<f32, TensorError> {
                let clones: Vec<TensorData> = (0..50).map(|_| alias.clone()).collect();
                let copy = alias.create_copy()?;
                drop(clones);
                Ok(copy.to_vec()?.iter().sum())
            })
        })
        .collect();

    for worker in workers {
        let sum = worker.join().map_err(|_| "worker panicked")??;
        assert_relative_eq!(sum, 3.0 * 256.0);
    }
    assert_eq!(t.dense_accelerator_chunk().map(ChunkHandle::ref_count), Some(1));
    Ok(())
}

#[test]
fn test_pool_teardown_between_tests() -> Result<(), TensorError> {
    let manager = MemoryManager::new(PoolConfig::default())?;
    {
        let t = TensorData::new_in(&manager, Shape::new([10])?, ElementKind::Dense, Device::Host)?;
        let _alias = t.clone();
    }
    assert_eq!(manager.clear_unused(Domain::Host), 1);

    let t = TensorData::new_in(&manager, Shape::new([10])?, ElementKind::Dense, Device::Host)?;
    // SAFETY: `t` is only dropped after the clear
    unsafe { manager.clear_all(Domain::Host) };
    let stats = manager.stats(Domain::Host);
    assert_eq!((stats.free_chunks, stats.busy_chunks), (0, 0));
    drop(t);

    let _fresh = TensorData::new_in(&manager, Shape::new([10])?, ElementKind::Dense, Device::Host)?;
    let stats = manager.stats(Domain::Host);
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 3);
    Ok(())
}
