#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `strata-memory` hands out fixed-size chunks of `f32` memory on the host
//! and on accelerator devices, and recycles them instead of freeing them.
//! Each domain is served by its own pool: a released chunk is parked under its
//! size class and handed back to the next request of that class.
//!
//! # Architecture
//!
//! - **MemoryManager**: owns the host pool and the accelerator pool, each behind its own lock
//! - **ChunkHandle**: RAII reference to a busy chunk; cloning adds a reference and dropping
//!   releases one
//! - **Backend**: raw allocation and copies for one memory domain
//! - **PoolConfig**: allocation unit, host row alignment and accelerator setup
//!
//! # Quick Start
//!
//! ```rust
//! use strata_memory::{ChunkHandle, Device, MemoryManager, PoolConfig};
//!
//! let manager = MemoryManager::new(PoolConfig::default())?;
//!
//! let mut chunk = ChunkHandle::acquire(&manager, Device::accelerator(0), 300)?;
//! assert_eq!(chunk.len(), 512);
//! chunk.write(0, &[1.0, 2.0, 3.0])?;
//!
//! let alias = chunk.clone();
//! assert_eq!(alias.ref_count(), 2);
//!
//! let mut out = [0.0f32; 3];
//! alias.read(0, &mut out)?;
//! assert_eq!(out, [1.0, 2.0, 3.0]);
//! # Ok::<(), strata_memory::AllocatorError>(())
//! ```

/// Allocator module containing the error type and the host allocator.
pub mod allocator;

/// backend module containing the per-domain device operations.
pub mod backend;

/// Pool configuration and environment overrides.
pub mod config;

/// CUDA accelerator backend.
#[cfg(feature = "cuda")]
pub mod cuda;

/// Device module containing device abstraction.
pub mod device;

/// Reference-counted chunk handles.
pub mod handle;

/// The two-domain memory manager.
pub mod manager;

/// Pool bookkeeping types.
pub mod pool;

pub use crate::allocator::{AllocatorError, HostAllocator, ELEMENT_SIZE};
pub use crate::backend::{Backend, BufferPtr, HostBackend, SimulatedAccelerator};
pub use crate::config::{ConfigError, PoolConfig};
#[cfg(feature = "cuda")]
pub use crate::cuda::CudaBackend;
pub use crate::device::{Device, Domain};
pub use crate::handle::{ChunkHandle, ChunkReader};
pub use crate::manager::MemoryManager;
pub use crate::pool::{Allocation, ChunkId, PoolStats};
