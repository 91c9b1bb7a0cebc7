// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Emulation of a DMA controller for a device emulation application performing DMA
//! against a foreign memory space, typically a guest's memory.
//!
//! Concepts:
//! - A DMA controller has its own 64-bit DMA address space.
//! - Foreign memory is made available to the controller in linear chunks called
//!   regions. Each region is backed by a file descriptor and is registered at a
//!   unique, non-overlapping span of the DMA address space. The registrations are
//!   delivered by an external collaborator (e.g. a VFIO-over-socket server relaying
//!   hypervisor messages); the controller only keeps the registry.
//! - To perform DMA, the application first translates a span of DMA addresses into a
//!   scatter-gather list with [`DmaController::translate`]. The list can then be
//!   mapped into the process's virtual address space with [`DmaController::map_sg`]
//!   for direct access, and unmapped with [`DmaController::unmap_sg`] when done.
//!   Every region is mapped into the application's address space at registration
//!   time with read/write permissions; the access intents a region declares are
//!   enforced at translation time only.
//! - When live migration is active, [`DmaController::start_dirty_logging`] records
//!   which pages were the target of write-intent translations, and
//!   [`DmaController::dirty_bitmap`] snapshots the record per region.
//!
//! # Example
//!
//! ```
//! use vm_dma::{Access, DmaAddress, DmaController, SgCursor, SgEntry};
//!
//! let mut dma = DmaController::new(8).unwrap();
//! // Register a 64 KiB region with no backing descriptor: it translates, but
//! // cannot be mapped into the process.
//! let index = dma
//!     .add_region(DmaAddress(0x1_0000), 0x1_0000, None, Access::READ_WRITE)
//!     .unwrap();
//! assert_eq!(index, 0);
//!
//! let mut cursor = SgCursor::default();
//! let mut sgl = [SgEntry::default(); 4];
//! let n = dma
//!     .translate(&mut cursor, DmaAddress(0x1_2000), 0x100, Access::READ, &mut sgl)
//!     .unwrap();
//! assert_eq!(n, 1);
//! assert!(!sgl[0].is_mappable());
//! ```

#![deny(missing_docs)]

pub mod address;
pub use address::{Address, AddressValue, DmaAddress, DmaUsize};

pub mod bitmap;
pub use bitmap::AtomicBitmap;

pub mod controller;
pub use controller::{DmaController, Error, Result};

pub mod mmap;
pub use mmap::{Error as MmapError, FileOffset, HostMapping};

pub mod region;
pub use region::{Access, DmaRegion};

pub mod sg;
pub use sg::{HostIovec, SgCursor, SgEntry};
