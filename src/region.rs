// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A registered span of the DMA address space and the host resources backing it.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::warn;

use crate::address::{Address, DmaAddress};
use crate::bitmap::AtomicBitmap;
use crate::mmap::{FileOffset, HostMapping};

bitflags! {
    /// Access intents a DMA transaction may declare against a region.
    ///
    /// A region is registered with the set of intents it permits; translations
    /// declare the intent of the access they authorize. Only [`Access::WRITE`] is
    /// enforced at translation time, the remaining bits are carried for the upper
    /// layer's bookkeeping.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Access: u32 {
        /// The transaction reads guest memory.
        const READ = 1;
        /// The transaction writes guest memory.
        const WRITE = 1 << 1;
        /// The transaction fetches instructions from guest memory.
        const EXECUTE = 1 << 2;
        /// Convenience union of [`Access::READ`] and [`Access::WRITE`].
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// A linear, non-overlapping span of the DMA address space, backed by a host file
/// descriptor.
///
/// A region is created by [`DmaController::add_region`](crate::DmaController::add_region)
/// and destroyed when it is removed from the controller; dropping it unmaps the host
/// mapping and releases the backing descriptor.
#[derive(Debug)]
pub struct DmaRegion {
    base: DmaAddress,
    size: u64,
    access: Access,
    file: Option<FileOffset>,
    mapping: Option<HostMapping>,
    refcount: AtomicU32,
    dirty: Option<AtomicBitmap>,
}

impl DmaRegion {
    /// Creates a region and attempts to map its backing file into the process.
    ///
    /// Mapping failure is not an error: the region is installed without a host
    /// mapping so that address-space accounting and dirty tracking remain sound.
    /// `base + size` must not overflow; the controller checks this before
    /// construction.
    pub(crate) fn new(
        base: DmaAddress,
        size: u64,
        file: Option<FileOffset>,
        access: Access,
    ) -> Self {
        let mapping = file.as_ref().and_then(|f| match HostMapping::from_file(f, size) {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                warn!(
                    "cannot map DMA region {:#x}+{:#x} into the host: {}",
                    base.raw_value(),
                    size,
                    e
                );
                None
            }
        });

        DmaRegion {
            base,
            size,
            access,
            file,
            mapping,
            refcount: AtomicU32::new(0),
            dirty: None,
        }
    }

    /// Returns the first address of the region.
    pub fn start_addr(&self) -> DmaAddress {
        self.base
    }

    /// Returns the first address past the region.
    pub fn end_addr(&self) -> DmaAddress {
        // Cannot overflow: region bounds were checked at registration.
        self.base.unchecked_add(self.size)
    }

    /// Returns the size of the region in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns `true` if the region is empty. Registered regions never are.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The access intents the region permits.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Returns information regarding the file backing this region, if any.
    pub fn file_offset(&self) -> Option<&FileOffset> {
        self.file.as_ref()
    }

    /// Returns `true` if the given address falls within the region.
    pub fn contains(&self, addr: DmaAddress) -> bool {
        addr >= self.base && addr < self.end_addr()
    }

    /// Returns `true` if `[addr, addr + len)` falls entirely within the region.
    ///
    /// `addr + len` must not overflow; the translator checks this before walking
    /// the table.
    pub(crate) fn contains_range(&self, addr: DmaAddress, len: u64) -> bool {
        addr >= self.base && addr.unchecked_add(len) <= self.end_addr()
    }

    /// Returns `true` if the region has a host mapping.
    ///
    /// A region without one (registered without a descriptor, or whose `mmap`
    /// failed) still translates, but mapping its scatter-gather entries fails.
    pub fn is_mappable(&self) -> bool {
        self.mapping.is_some()
    }

    /// Returns the host address of the byte at `offset` within the region, bounds
    /// checked against the region length.
    pub(crate) fn host_address(&self, offset: u64) -> Option<*mut u8> {
        if offset >= self.size {
            return None;
        }
        self.mapping
            .as_ref()
            .map(|m| m.as_ptr().wrapping_add(offset as usize))
    }

    /// The number of outstanding scatter-gather mappings into the region.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one outstanding mapping. Never goes below zero, so unmapping a list
    /// that was never fully mapped stays balanced.
    pub(crate) fn unpin(&self) {
        let _ = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub(crate) fn start_dirty_logging(&mut self, page_size: NonZeroUsize) {
        self.dirty = Some(AtomicBitmap::new(self.size as usize, page_size));
    }

    pub(crate) fn stop_dirty_logging(&mut self) {
        self.dirty = None;
    }

    pub(crate) fn dirty_bitmap(&self) -> Option<&AtomicBitmap> {
        self.dirty.as_ref()
    }

    /// Marks the pages covering `[offset, offset + len)` dirty. A no-op while
    /// logging is inactive.
    pub(crate) fn mark_dirty(&self, offset: u64, len: u64) {
        if let Some(bitmap) = &self.dirty {
            bitmap.mark_range(offset as usize, len as usize);
        }
    }
}
