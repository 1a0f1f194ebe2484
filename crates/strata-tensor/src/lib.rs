#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `strata-tensor` provides [`TensorData`], the owning handle over the
//! buffers of one tensor. Buffers come from the pools of a
//! [`strata_memory::MemoryManager`]; a tensor holds one reference-counted
//! chunk per representation it uses, so shallow copies are O(1) and share
//! memory while [`TensorData::create_copy`] duplicates it.
//!
//! # Key Features
//!
//! - **Dense and sparse data**: row-major `f32` or CSR matrices packed in a single chunk
//! - **Host padding**: host rows are padded to an aligned stride, accelerator rows are not
//! - **Device migration**: [`TensorData::send_to`] moves data between host and accelerators
//!
//! # Quick Start
//!
//! ```rust
//! use strata_memory::{Device, MemoryManager, PoolConfig};
//! use strata_tensor::{ElementKind, Shape, TensorData};
//!
//! let manager = MemoryManager::new(PoolConfig::default())?;
//! let shape = Shape::new([2, 3])?;
//! let mut a = TensorData::new_in(&manager, shape, ElementKind::Dense, Device::Host)?;
//! a.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
//!
//! // shallow copy shares the buffer
//! let alias = a.clone();
//! // deep copy does not
//! let mut copy = a.create_copy()?;
//! copy.fill(0.0)?;
//!
//! assert_eq!(alias.to_vec()?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! # Ok::<(), strata_tensor::TensorError>(())
//! ```

/// Shape module containing tensor dimension bookkeeping.
pub mod shape;

/// Compressed sparse row matrices stored by sparse tensors.
pub mod sparse;

/// Tensor data module containing the owning buffer handle and error types.
pub mod tensor_data;

pub use crate::shape::Shape;
pub use crate::sparse::{SparseLayout, SparseMatrix};
pub use crate::tensor_data::{DescriptorKey, ElementKind, SyncDirection, TensorData, TensorError};
