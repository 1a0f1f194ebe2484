use std::sync::Arc;

use strata_memory::{
    AllocatorError, BufferPtr, ChunkHandle, ConfigError, Device, Domain, MemoryManager,
};
use thiserror::Error;

use crate::{
    shape::Shape,
    sparse::{self, SparseLayout, SparseMatrix},
};

/// An error type for tensor data operations.
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    /// A shape has no dimension or a zero dimension.
    #[error("Invalid shape {dims:?}: {reason}")]
    InvalidShape {
        /// The rejected dimensions
        dims: Vec<usize>,
        /// Why they were rejected
        reason: String,
    },

    /// Two shapes are incompatible for the requested operation.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Shape required by the operation
        expected: Shape,
        /// Shape that was provided
        actual: Shape,
    },

    /// Dense and sparse data were mixed.
    #[error("Element kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        /// Element kind required by the operation
        expected: ElementKind,
        /// Element kind that was provided
        actual: ElementKind,
    },

    /// Two tensors live on different devices.
    #[error("Device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch {
        /// Device required by the operation
        expected: Device,
        /// Device that was provided
        actual: Device,
    },

    /// A buffer does not hold the number of elements the tensor needs.
    #[error("Length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch {
        /// Number of elements required
        expected: usize,
        /// Number of elements provided
        actual: usize,
    },

    /// Host and accelerator copies could not be synchronized.
    #[error("Cannot synchronize host and accelerator data: {0}")]
    SyncFailure(String),

    /// The tensor holds no buffer in the domain the operation needs.
    #[error("Tensor holds no buffer on {0}")]
    MissingBuffer(Domain),

    /// The operation requires sparse data.
    #[error("Operation requires sparse tensor data")]
    NotSparse,

    /// Sparse arrays do not form a valid matrix.
    #[error("Invalid sparse matrix: {0}")]
    InvalidSparse(String),

    /// Underlying pool or device operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] AllocatorError),
}

impl From<ConfigError> for TensorError {
    fn from(e: ConfigError) -> Self {
        Self::Storage(e.into())
    }
}

impl TensorError {
    /// Creates an InvalidShape error.
    pub fn invalid_shape(dims: Vec<usize>, reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            dims,
            reason: reason.into(),
        }
    }

    /// Returns true if this error is recoverable by freeing memory.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_out_of_memory(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a programming error.
    pub fn is_programming_error(&self) -> bool {
        match self {
            Self::SyncFailure(_) => false,
            Self::Storage(e) => e.is_programming_error(),
            _ => true,
        }
    }
}

/// Representation of the tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementKind {
    /// Row-major `f32` elements.
    #[default]
    Dense,
    /// Compressed sparse rows, see [`SparseMatrix`].
    Sparse,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementKind::Dense => write!(f, "dense"),
            ElementKind::Sparse => write!(f, "sparse"),
        }
    }
}

/// Direction of [`TensorData::sync_with_host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Overwrite the host buffer with the accelerator buffer.
    AcceleratorToHost,
    /// Overwrite the accelerator buffer with the host buffer.
    HostToAccelerator,
}

/// Lookup key of the descriptor that owns a tensor.
///
/// The key never keeps the descriptor alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorKey(pub usize);

/// Row geometry of dense data in both domains.
#[derive(Debug, Clone, Copy)]
struct DenseLayout {
    cols: usize,
    padded_cols: usize,
    host_len: usize,
    len: usize,
}

/// A sparse chunk sized for the densest matrix of its dimensions.
///
/// The number of stored values is packed in the chunk, so every alias decodes
/// the matrix last written through any of them.
#[derive(Debug, Clone)]
struct SparseChunk {
    handle: ChunkHandle,
    rows: usize,
    cols: usize,
}

impl SparseChunk {
    fn acquire(
        manager: &Arc<MemoryManager>,
        device: Device,
        len: usize,
        matrix: &SparseMatrix,
    ) -> Result<Self, AllocatorError> {
        let mut chunk = Self {
            handle: ChunkHandle::acquire(manager, device, len)?,
            rows: matrix.rows(),
            cols: matrix.cols(),
        };
        chunk.store(matrix)?;
        Ok(chunk)
    }

    fn read(&self) -> Result<SparseMatrix, TensorError> {
        let reader = self.handle.reader();
        let mut header = [0.0f32];
        reader.read(0, &mut header)?;
        let layout = SparseLayout {
            rows: self.rows,
            cols: self.cols,
            nnz: SparseMatrix::decode_nnz(header[0]),
        };
        if layout.total_length() > self.handle.len() {
            return Err(TensorError::InvalidSparse(format!(
                "{} stored values do not fit a chunk of {} elements",
                layout.nnz,
                self.handle.len()
            )));
        }
        let mut packed = vec![0.0; layout.total_length()];
        reader.read(0, &mut packed)?;
        drop(reader);
        SparseMatrix::decode(self.rows, self.cols, &packed)
    }

    /// Overwrites the chunk in place. `matrix` must have the chunk's
    /// dimensions.
    fn store(&mut self, matrix: &SparseMatrix) -> Result<(), AllocatorError> {
        self.handle.write(0, &matrix.encode())
    }

    fn duplicate(&self) -> Result<Self, AllocatorError> {
        Ok(Self {
            handle: duplicate_chunk(&self.handle)?,
            rows: self.rows,
            cols: self.cols,
        })
    }
}

/// Owning handle over the pooled buffers of one tensor.
///
/// A tensor keeps its elements in the domain of its [`Device`]. Dense data on
/// the host is stored with every row padded to
/// [`strata_memory::PoolConfig::host_column_alignment`] elements, while the
/// accelerator buffer is unpadded. An accelerator tensor may additionally
/// hold a host mirror, see [`TensorData::attach_host_mirror`].
///
/// # Copies
///
/// `clone` is a shallow copy: both values alias the same chunks and writes
/// through one are visible through the other, dense or sparse. A sparse
/// chunk is sized for the densest matrix of the shape, so loading a matrix
/// never moves it away from its aliases. [`TensorData::create_copy`]
/// allocates independent chunks. Dropping a tensor releases its references.
///
/// # Thread Safety
///
/// `TensorData` is `Send` but not `Sync`. Aliasing tensors may be cloned,
/// dropped, read and written on different threads: every safe access goes
/// through the chunk's access lock. Only the `unsafe` slice accessors bypass
/// it.
///
/// # Example
///
/// ```
/// use strata_memory::{Device, MemoryManager, PoolConfig};
/// use strata_tensor::{ElementKind, Shape, TensorData};
///
/// let manager = MemoryManager::new(PoolConfig::default())?;
/// let shape = Shape::new([4, 4])?;
/// let device = Device::accelerator(0);
/// let mut t = TensorData::new_in(&manager, shape, ElementKind::Dense, device)?;
/// t.fill(1.5)?;
///
/// assert!(t.send_to(Device::Host)?);
/// assert_eq!(t.dense_total_length_host(), 32);
/// assert_eq!(t.dense_total_length_accelerator(), 16);
/// assert_eq!(t.to_vec()?, vec![1.5; 16]);
/// # Ok::<(), strata_tensor::TensorError>(())
/// ```
#[derive(Clone, Default)]
pub struct TensorData {
    manager: Option<Arc<MemoryManager>>,
    shape: Shape,
    kind: ElementKind,
    device: Device,
    dense_host: Option<ChunkHandle>,
    dense_accelerator: Option<ChunkHandle>,
    sparse_host: Option<SparseChunk>,
    sparse_accelerator: Option<SparseChunk>,
    dense_total_length_host: usize,
    dense_total_length_accelerator: usize,
    padded_host_col_size: usize,
    sparse_total_length: usize,
    descriptor_key: Option<DescriptorKey>,
}

impl TensorData {
    /// Creates a tensor on the process-wide [`MemoryManager::global`].
    ///
    /// # Errors
    ///
    /// See [`TensorData::new_in`].
    pub fn new(shape: Shape, kind: ElementKind, device: Device) -> Result<Self, TensorError> {
        Self::new_in(MemoryManager::global(), shape, kind, device)
    }

    /// Creates a tensor whose buffer is acquired from `manager`.
    ///
    /// Dense contents are unspecified until written: chunks reused from the
    /// free pool keep their previous data unless the pool zeroes them. Sparse
    /// tensors start without stored values.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidShape`] for the empty shape or when a
    /// buffer length overflows `usize`, [`TensorError::InvalidSparse`] for
    /// sparse dimensions beyond 32-bit indices, and [`TensorError::Storage`]
    /// if the pool cannot provide the buffer.
    pub fn new_in(
        manager: &Arc<MemoryManager>,
        shape: Shape,
        kind: ElementKind,
        device: Device,
    ) -> Result<Self, TensorError> {
        if shape.dim() == 0 {
            return Err(TensorError::invalid_shape(
                Vec::new(),
                "a tensor needs at least one dimension",
            ));
        }
        let too_large = |what: &str| {
            TensorError::invalid_shape(
                shape.as_slice().to_vec(),
                format!("{} overflows usize", what),
            )
        };
        let cols = shape.cols();
        let row_count = shape.size() / cols;
        let padded_host_col_size = manager
            .config()
            .padded_cols(cols)
            .ok_or_else(|| too_large("padded host row"))?;
        let dense_total_length_host = row_count
            .checked_mul(padded_host_col_size)
            .ok_or_else(|| too_large("padded host length"))?;
        let sparse_total_length = match kind {
            ElementKind::Dense => 0,
            ElementKind::Sparse => {
                sparse::check_dims(row_count, cols)?;
                SparseLayout::reserved_length(row_count, cols)
                    .ok_or_else(|| too_large("sparse length"))?
            }
        };

        let mut tensor = Self {
            manager: Some(Arc::clone(manager)),
            dense_total_length_host,
            dense_total_length_accelerator: shape.size(),
            padded_host_col_size,
            sparse_total_length,
            shape,
            kind,
            device,
            ..Default::default()
        };

        match kind {
            ElementKind::Dense => {
                let handle =
                    ChunkHandle::acquire(manager, device, tensor.dense_length(device.domain()))?;
                *tensor.dense_slot_mut(device.domain()) = Some(handle);
            }
            ElementKind::Sparse => {
                let matrix = SparseMatrix::zeros(row_count, cols);
                let chunk = SparseChunk::acquire(manager, device, sparse_total_length, &matrix)?;
                *tensor.sparse_slot_mut(device.domain()) = Some(chunk);
            }
        }
        log::trace!("created {} tensor {} on {}", kind, tensor.shape, device);
        Ok(tensor)
    }

    /// Same as [`TensorData::new_in`] with an outer batch dimension of
    /// `batch_size` when it is greater than one.
    pub fn with_batch_in(
        manager: &Arc<MemoryManager>,
        shape: Shape,
        kind: ElementKind,
        device: Device,
        batch_size: usize,
    ) -> Result<Self, TensorError> {
        Self::new_in(manager, shape.with_batch(batch_size)?, kind, device)
    }

    /// Sets the key of the descriptor owning this tensor.
    pub fn with_descriptor_key(mut self, key: DescriptorKey) -> Self {
        self.descriptor_key = Some(key);
        self
    }

    /// Returns an independent tensor with the same contents.
    ///
    /// Every buffer held by `self` is duplicated into a freshly acquired chunk
    /// on the same device.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::Storage`] if a chunk cannot be acquired or
    /// copied.
    pub fn create_copy(&self) -> Result<TensorData, TensorError> {
        Ok(Self {
            manager: self.manager.clone(),
            shape: self.shape.clone(),
            kind: self.kind,
            device: self.device,
            dense_host: self.dense_host.as_ref().map(duplicate_chunk).transpose()?,
            dense_accelerator: self
                .dense_accelerator
                .as_ref()
                .map(duplicate_chunk)
                .transpose()?,
            sparse_host: self
                .sparse_host
                .as_ref()
                .map(SparseChunk::duplicate)
                .transpose()?,
            sparse_accelerator: self
                .sparse_accelerator
                .as_ref()
                .map(SparseChunk::duplicate)
                .transpose()?,
            dense_total_length_host: self.dense_total_length_host,
            dense_total_length_accelerator: self.dense_total_length_accelerator,
            padded_host_col_size: self.padded_host_col_size,
            sparse_total_length: self.sparse_total_length,
            descriptor_key: self.descriptor_key,
        })
    }

    /// Moves the tensor's data to `device`.
    ///
    /// Returns `Ok(false)` without doing anything if the tensor is already on
    /// `device`. Otherwise a buffer is acquired on the target, the contents
    /// are copied through host memory, and the previous buffers, including a
    /// host mirror, are released.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::Storage`] if the target buffer cannot be
    /// acquired or the copy fails. The tensor is left unchanged.
    pub fn send_to(&mut self, device: Device) -> Result<bool, TensorError> {
        if device == self.device {
            return Ok(false);
        }
        let manager = Arc::clone(self.manager()?);
        let domain = device.domain();

        match self.kind {
            ElementKind::Dense => {
                let data = self.read_dense()?;
                let mut target = ChunkHandle::acquire(&manager, device, self.dense_length(domain))?;
                store_dense(&mut target, self.dense_layout(), &data)?;
                self.dense_host = None;
                self.dense_accelerator = None;
                *self.dense_slot_mut(domain) = Some(target);
            }
            ElementKind::Sparse => {
                let matrix = self.primary_sparse()?.read()?;
                let target =
                    SparseChunk::acquire(&manager, device, self.sparse_total_length, &matrix)?;
                self.sparse_host = None;
                self.sparse_accelerator = None;
                *self.sparse_slot_mut(domain) = Some(target);
            }
        }

        log::debug!(
            "moved {} tensor {} from {} to {}",
            self.kind,
            self.shape,
            self.device,
            device
        );
        self.device = device;
        Ok(true)
    }

    /// Acquires a host buffer for an accelerator tensor and fills it from the
    /// accelerator buffer.
    ///
    /// Returns `Ok(false)` if the tensor lives on the host or already has a
    /// host mirror.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::Storage`] if the buffer cannot be acquired or
    /// filled.
    pub fn attach_host_mirror(&mut self) -> Result<bool, TensorError> {
        if self.device.is_host() {
            return Ok(false);
        }
        let manager = Arc::clone(self.manager()?);
        match self.kind {
            ElementKind::Dense => {
                if self.dense_host.is_some() {
                    return Ok(false);
                }
                let data = self.read_dense()?;
                let mut mirror =
                    ChunkHandle::acquire(&manager, Device::Host, self.dense_total_length_host)?;
                store_dense(&mut mirror, self.dense_layout(), &data)?;
                self.dense_host = Some(mirror);
            }
            ElementKind::Sparse => {
                if self.sparse_host.is_some() {
                    return Ok(false);
                }
                let matrix = self.primary_sparse()?.read()?;
                let len = self.sparse_total_length;
                let mirror = SparseChunk::acquire(&manager, Device::Host, len, &matrix)?;
                self.sparse_host = Some(mirror);
            }
        }
        Ok(true)
    }

    /// Copies the accelerator buffer into the host buffer, or the other way
    /// around, according to `direction`.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::SyncFailure`] if the tensor does not hold both
    /// buffers or the copy fails.
    pub fn sync_with_host(&mut self, direction: SyncDirection) -> Result<bool, TensorError> {
        match self.copy_across(direction) {
            Ok(true) => {
                log::trace!("synchronized tensor {} ({:?})", self.shape, direction);
                Ok(true)
            }
            Ok(false) => Err(TensorError::SyncFailure(format!(
                "{} data is not held on both host and accelerator",
                self.kind
            ))),
            Err(e) => Err(TensorError::SyncFailure(e.to_string())),
        }
    }

    /// Overwrites the contents of `dst` with the contents of `src`.
    ///
    /// Chunks of `dst` are written in place and keep their identity. Every
    /// domain held by both tensors is copied, and a mirror held only by `dst`
    /// is refreshed from the buffer on its device.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`], [`TensorError::KindMismatch`]
    /// or [`TensorError::DeviceMismatch`] if the tensors are not compatible,
    /// and [`TensorError::Storage`] if a copy fails.
    pub fn deep_copy(dst: &mut TensorData, src: &TensorData) -> Result<(), TensorError> {
        if dst.shape != src.shape {
            return Err(TensorError::ShapeMismatch {
                expected: dst.shape.clone(),
                actual: src.shape.clone(),
            });
        }
        if dst.kind != src.kind {
            return Err(TensorError::KindMismatch {
                expected: dst.kind,
                actual: src.kind,
            });
        }
        if dst.device != src.device {
            return Err(TensorError::DeviceMismatch {
                expected: dst.device,
                actual: src.device,
            });
        }

        let primary = dst.device.domain();
        let mut stale_mirror = false;
        for domain in [Domain::Host, Domain::Accelerator] {
            match src.kind {
                ElementKind::Dense => {
                    let len = dst.dense_length(domain);
                    match (dst.dense_slot_mut(domain).as_mut(), src.dense_slot(domain)) {
                        (Some(d), Some(s)) => d.copy_from(s, len)?,
                        (Some(_), None) => stale_mirror |= domain != primary,
                        _ => {}
                    }
                }
                ElementKind::Sparse => {
                    match (dst.sparse_slot_mut(domain).as_mut(), src.sparse_slot(domain)) {
                        (Some(d), Some(s)) => d.store(&s.read()?)?,
                        (Some(_), None) => stale_mirror |= domain != primary,
                        _ => {}
                    }
                }
            }
        }
        if stale_mirror {
            let direction = match primary {
                Domain::Host => SyncDirection::HostToAccelerator,
                Domain::Accelerator => SyncDirection::AcceleratorToHost,
            };
            dst.copy_across(direction)?;
        }
        Ok(())
    }

    /// Writes logical row-major elements into every dense buffer held.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::KindMismatch`] for sparse tensors and
    /// [`TensorError::LengthMismatch`] if `data` does not hold exactly
    /// `shape().size()` elements.
    pub fn copy_from_slice(&mut self, data: &[f32]) -> Result<(), TensorError> {
        self.expect_kind(ElementKind::Dense)?;
        if data.len() != self.shape.size() {
            return Err(TensorError::LengthMismatch {
                expected: self.shape.size(),
                actual: data.len(),
            });
        }
        let layout = self.dense_layout();
        for handle in [self.dense_host.as_mut(), self.dense_accelerator.as_mut()]
            .into_iter()
            .flatten()
        {
            store_dense(handle, layout, data)?;
        }
        Ok(())
    }

    /// Sets every element of a dense tensor to `value`.
    pub fn fill(&mut self, value: f32) -> Result<(), TensorError> {
        self.copy_from_slice(&vec![value; self.shape.size()])
    }

    /// Returns the logical row-major elements, without host padding.
    ///
    /// Sparse tensors are expanded to dense data.
    pub fn to_vec(&self) -> Result<Vec<f32>, TensorError> {
        match self.kind {
            ElementKind::Dense => self.read_dense(),
            ElementKind::Sparse => Ok(self.sparse_matrix()?.to_dense()),
        }
    }

    /// Stores `matrix` in every sparse buffer held.
    ///
    /// The matrix must have `shape().size() / cols()` rows, the batch
    /// dimensions stacked, and `cols()` columns.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::NotSparse`] for dense tensors and
    /// [`TensorError::InvalidSparse`] if the matrix is invalid or its size
    /// does not match.
    pub fn load_sparse(&mut self, matrix: &SparseMatrix) -> Result<(), TensorError> {
        if self.kind != ElementKind::Sparse {
            return Err(TensorError::NotSparse);
        }
        matrix.validate()?;
        let rows = self.shape.size() / self.shape.cols();
        if matrix.rows() != rows || matrix.cols() != self.shape.cols() {
            return Err(TensorError::InvalidSparse(format!(
                "expected a {}x{} matrix, got {}x{}",
                rows,
                self.shape.cols(),
                matrix.rows(),
                matrix.cols()
            )));
        }
        self.primary_sparse()?;
        for chunk in [self.sparse_host.as_mut(), self.sparse_accelerator.as_mut()]
            .into_iter()
            .flatten()
        {
            chunk.store(matrix)?;
        }
        Ok(())
    }

    /// Reads the sparse matrix from the buffer of the tensor's device.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::NotSparse`] for dense tensors.
    pub fn sparse_matrix(&self) -> Result<SparseMatrix, TensorError> {
        if self.kind != ElementKind::Sparse {
            return Err(TensorError::NotSparse);
        }
        self.primary_sparse()?.read()
    }

    /// Returns the shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the second-to-last dimension.
    #[inline]
    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    /// Returns the last dimension.
    #[inline]
    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    /// Returns the element kind.
    #[inline]
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Returns the device holding the tensor's data.
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the key of the owning descriptor, if any.
    #[inline]
    pub fn descriptor_key(&self) -> Option<DescriptorKey> {
        self.descriptor_key
    }

    /// Sets or clears the key of the owning descriptor.
    pub fn set_descriptor_key(&mut self, key: Option<DescriptorKey>) {
        self.descriptor_key = key;
    }

    /// Product of the dimensions in front of the trailing `required_dim`.
    pub fn batch_size(&self, required_dim: usize) -> usize {
        self.shape.batch_size(required_dim)
    }

    /// Elements of the dense host buffer, padding included.
    #[inline]
    pub fn dense_total_length_host(&self) -> usize {
        self.dense_total_length_host
    }

    /// Elements of the dense accelerator buffer.
    #[inline]
    pub fn dense_total_length_accelerator(&self) -> usize {
        self.dense_total_length_accelerator
    }

    /// Host row stride in elements.
    #[inline]
    pub fn padded_host_col_size(&self) -> usize {
        self.padded_host_col_size
    }

    /// Elements reserved for the packed sparse matrix, enough for its densest
    /// contents.
    #[inline]
    pub fn sparse_total_length(&self) -> usize {
        self.sparse_total_length
    }

    /// Host element count computed from the shape and the row stride.
    pub fn host_element_size(&self) -> usize {
        match self.shape.cols() {
            0 => 0,
            cols => self.shape.size() / cols * self.padded_host_col_size,
        }
    }

    /// Accelerator element count, the size of the shape.
    pub fn accelerator_element_size(&self) -> usize {
        self.shape.size()
    }

    /// Pointer to the dense host buffer.
    pub fn host_ptr(&self) -> Option<*const f32> {
        self.dense_host
            .as_ref()
            .map(|h| h.ptr().as_host_ptr() as *const f32)
    }

    /// Mutable pointer to the dense host buffer.
    pub fn host_mut_ptr(&mut self) -> Option<*mut f32> {
        self.dense_host.as_ref().map(|h| h.ptr().as_host_ptr())
    }

    /// Device address of the dense accelerator buffer. It must not be
    /// dereferenced on the host.
    pub fn accelerator_ptr(&self) -> Option<BufferPtr> {
        self.dense_accelerator.as_ref().map(ChunkHandle::ptr)
    }

    /// Returns the padded dense host buffer.
    ///
    /// # Safety
    ///
    /// No aliasing tensor may write to the buffer while the slice is alive.
    pub unsafe fn host_slice(&self) -> Option<&[f32]> {
        self.host_ptr()
            .map(|ptr| std::slice::from_raw_parts(ptr, self.dense_total_length_host))
    }

    /// Returns the padded dense host buffer for writing.
    ///
    /// # Safety
    ///
    /// No aliasing tensor may access the buffer while the slice is alive.
    pub unsafe fn host_slice_mut(&mut self) -> Option<&mut [f32]> {
        let len = self.dense_total_length_host;
        self.host_mut_ptr()
            .map(|ptr| std::slice::from_raw_parts_mut(ptr, len))
    }

    /// Handle of the dense host chunk.
    pub fn dense_host_chunk(&self) -> Option<&ChunkHandle> {
        self.dense_host.as_ref()
    }

    /// Handle of the dense accelerator chunk.
    pub fn dense_accelerator_chunk(&self) -> Option<&ChunkHandle> {
        self.dense_accelerator.as_ref()
    }

    /// Handle of the sparse chunk in `domain`.
    pub fn sparse_chunk(&self, domain: Domain) -> Option<&ChunkHandle> {
        self.sparse_slot(domain).map(|chunk| &chunk.handle)
    }

    /// Copies between the host and accelerator buffers. Returns `Ok(false)`
    /// if either buffer is missing.
    fn copy_across(&mut self, direction: SyncDirection) -> Result<bool, TensorError> {
        match self.kind {
            ElementKind::Dense => {
                let layout = self.dense_layout();
                let (Some(host), Some(accelerator)) =
                    (self.dense_host.as_mut(), self.dense_accelerator.as_mut())
                else {
                    return Ok(false);
                };
                let (src, dst) = match direction {
                    SyncDirection::AcceleratorToHost => (&*accelerator, host),
                    SyncDirection::HostToAccelerator => (&*host, accelerator),
                };
                let data = load_dense(src, layout)?;
                store_dense(dst, layout, &data)?;
            }
            ElementKind::Sparse => {
                let (Some(host), Some(accelerator)) =
                    (self.sparse_host.as_mut(), self.sparse_accelerator.as_mut())
                else {
                    return Ok(false);
                };
                let (src, dst) = match direction {
                    SyncDirection::AcceleratorToHost => (&*accelerator, host),
                    SyncDirection::HostToAccelerator => (&*host, accelerator),
                };
                dst.store(&src.read()?)?;
            }
        }
        Ok(true)
    }

    fn manager(&self) -> Result<&Arc<MemoryManager>, TensorError> {
        self.manager
            .as_ref()
            .ok_or(TensorError::MissingBuffer(self.device.domain()))
    }

    fn expect_kind(&self, kind: ElementKind) -> Result<(), TensorError> {
        if self.kind != kind {
            return Err(TensorError::KindMismatch {
                expected: kind,
                actual: self.kind,
            });
        }
        Ok(())
    }

    fn dense_length(&self, domain: Domain) -> usize {
        match domain {
            Domain::Host => self.dense_total_length_host,
            Domain::Accelerator => self.dense_total_length_accelerator,
        }
    }

    fn dense_slot(&self, domain: Domain) -> Option<&ChunkHandle> {
        match domain {
            Domain::Host => self.dense_host.as_ref(),
            Domain::Accelerator => self.dense_accelerator.as_ref(),
        }
    }

    fn dense_slot_mut(&mut self, domain: Domain) -> &mut Option<ChunkHandle> {
        match domain {
            Domain::Host => &mut self.dense_host,
            Domain::Accelerator => &mut self.dense_accelerator,
        }
    }

    fn sparse_slot(&self, domain: Domain) -> Option<&SparseChunk> {
        match domain {
            Domain::Host => self.sparse_host.as_ref(),
            Domain::Accelerator => self.sparse_accelerator.as_ref(),
        }
    }

    fn sparse_slot_mut(&mut self, domain: Domain) -> &mut Option<SparseChunk> {
        match domain {
            Domain::Host => &mut self.sparse_host,
            Domain::Accelerator => &mut self.sparse_accelerator,
        }
    }

    fn primary_sparse(&self) -> Result<&SparseChunk, TensorError> {
        let domain = self.device.domain();
        self.sparse_slot(domain)
            .ok_or(TensorError::MissingBuffer(domain))
    }

    /// Reads the logical elements of the buffer on the tensor's device.
    fn read_dense(&self) -> Result<Vec<f32>, TensorError> {
        let domain = self.device.domain();
        let handle = self
            .dense_slot(domain)
            .ok_or(TensorError::MissingBuffer(domain))?;
        Ok(load_dense(handle, self.dense_layout())?)
    }

    fn dense_layout(&self) -> DenseLayout {
        DenseLayout {
            cols: self.shape.cols(),
            padded_cols: self.padded_host_col_size,
            host_len: self.dense_total_length_host,
            len: self.dense_total_length_accelerator,
        }
    }
}

/// Reads the logical elements of `handle`, dropping host row padding.
fn load_dense(handle: &ChunkHandle, layout: DenseLayout) -> Result<Vec<f32>, AllocatorError> {
    if handle.device().is_host() && layout.padded_cols != layout.cols {
        let mut padded = vec![0.0; layout.host_len];
        handle.read(0, &mut padded)?;
        Ok(padded
            .chunks_exact(layout.padded_cols)
            .flat_map(|row| &row[..layout.cols])
            .copied()
            .collect())
    } else {
        let mut data = vec![0.0; layout.len];
        handle.read(0, &mut data)?;
        Ok(data)
    }
}

/// Writes logical elements into `handle`, padding host rows.
fn store_dense(
    handle: &mut ChunkHandle,
    layout: DenseLayout,
    data: &[f32],
) -> Result<(), AllocatorError> {
    if handle.device().is_host() && layout.padded_cols != layout.cols {
        let mut padded = vec![0.0; layout.host_len];
        for (dst, src) in padded
            .chunks_exact_mut(layout.padded_cols)
            .zip(data.chunks_exact(layout.cols))
        {
            dst[..layout.cols].copy_from_slice(src);
        }
        handle.write(0, &padded)
    } else {
        handle.write(0, data)
    }
}

fn duplicate_chunk(handle: &ChunkHandle) -> Result<ChunkHandle, AllocatorError> {
    let mut copy = ChunkHandle::acquire(handle.manager(), handle.device(), handle.len())?;
    copy.copy_from(handle, handle.len())?;
    Ok(copy)
}

impl std::fmt::Debug for TensorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorData")
            .field("shape", &self.shape)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("dense_host", &self.dense_host.as_ref().map(ChunkHandle::id))
            .field(
                "dense_accelerator",
                &self.dense_accelerator.as_ref().map(ChunkHandle::id),
            )
            .field("sparse_host", &self.sparse_host.as_ref().map(|c| c.handle.id()))
            .field(
                "sparse_accelerator",
                &self.sparse_accelerator.as_ref().map(|c| c.handle.id()),
            )
            .field("descriptor_key", &self.descriptor_key)
            .finish()
    }
}
