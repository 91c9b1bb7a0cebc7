// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The DMA controller: a registry of regions plus address translation, mapping and
//! dirty-page logging on top of it.

use std::cmp;
use std::num::NonZeroUsize;
use std::result;

use log::debug;

use crate::address::{Address, DmaAddress};
use crate::mmap::FileOffset;
use crate::region::{Access, DmaRegion};
use crate::sg::{HostIovec, SgCursor, SgEntry};

/// Errors associated with DMA controller operations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The requested span overlaps the already registered region at `index`.
    #[error("Region overlaps the region at index {index}")]
    Overlap {
        /// Index of the conflicting region.
        index: usize,
    },
    /// The region table is at capacity.
    #[error("Region table is full")]
    TooManyRegions,
    /// The controller was asked for a zero-capacity region table.
    #[error("Region table capacity must not be zero")]
    InvalidCapacity,
    /// No region is registered at exactly the given address range.
    #[error("No region is registered at the given address range")]
    RegionNotFound,
    /// The region still has outstanding scatter-gather mappings.
    #[error("Region has outstanding mappings")]
    RegionInUse,
    /// The span cannot be covered by registered regions.
    #[error("Cannot translate DMA address range {:#x}+{:#x}", addr.0, len)]
    CannotTranslate {
        /// First address of the span.
        addr: DmaAddress,
        /// Length of the span in bytes.
        len: u64,
    },
    /// A write intent was declared against a region that does not permit writes.
    #[error("Write access to a region that does not permit writes")]
    ProtectionViolation,
    /// The region has no host mapping, so its entries cannot be mapped.
    #[error("Region has no host mapping")]
    NoHostMapping,
    /// The caller's output buffer holds fewer entries than the translation needs.
    #[error("Scatter-gather buffer too short, {needed} entries needed")]
    SgListTooShort {
        /// Number of entries required to complete the request.
        needed: usize,
    },
    /// Dirty-page logging is already active.
    #[error("Dirty page logging is already active")]
    AlreadyLogging,
    /// Dirty-page logging is not active.
    #[error("Dirty page logging is not active")]
    NotLogging,
    /// The dirty page size is zero or not a power of two.
    #[error("Dirty page size must be a non-zero power of two")]
    InvalidPageSize,
    /// The requested page size differs from the active logging granularity.
    #[error("Dirty page size does not match the active logging granularity")]
    PageSizeMismatch,
    /// The caller's output buffer is too small for the bitmap.
    #[error("Output buffer too small, {needed} bytes needed")]
    BufferTooSmall {
        /// Number of bytes required to hold the bitmap.
        needed: usize,
    },
    /// A zero or address-space-wrapping size was given.
    #[error("Invalid size for the address range")]
    InvalidSize,
}

/// Result of DMA controller operations.
pub type Result<T> = result::Result<T, Error>;

/// Emulation of a DMA controller translating between a device's DMA address space
/// and host memory.
///
/// Guest memory is registered with the controller in linear, non-overlapping chunks
/// called regions, each backed by a file descriptor. To perform DMA, a device first
/// translates a span of DMA addresses into a scatter-gather list with
/// [`translate`](DmaController::translate), then maps the list into host-virtual
/// iovecs with [`map_sg`](DmaController::map_sg) for direct access, and releases the
/// mappings with [`unmap_sg`](DmaController::unmap_sg) when done.
///
/// Dropping the controller unmaps every region and releases the backing
/// descriptors.
///
/// # Concurrency
///
/// Mutating operations take `&mut self` and must be serialized by the embedding (the
/// expected embedding is a single-request-at-a-time message loop). Translation and
/// mapping take `&self` and only touch atomics, so device threads may call them
/// concurrently in between serialized mutations.
#[derive(Debug)]
pub struct DmaController {
    regions: Vec<DmaRegion>,
    max_regions: usize,
    dirty_page_size: Option<NonZeroUsize>,
}

impl DmaController {
    /// Creates an empty controller that accepts up to `max_regions` regions.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCapacity`] if `max_regions` is zero.
    pub fn new(max_regions: usize) -> Result<Self> {
        if max_regions == 0 {
            return Err(Error::InvalidCapacity);
        }
        Ok(DmaController {
            regions: Vec::with_capacity(max_regions),
            max_regions,
            dirty_page_size: None,
        })
    }

    /// Registers a new region spanning `[base, base + size)`, backed by `size` bytes
    /// of `file` (when present).
    ///
    /// The backing file is mapped into the process with read/write protection
    /// regardless of `access`; `access` is retained for translation-time checks. A
    /// failed `mmap` does not fail the registration: the region is installed without
    /// a host mapping so that overlap accounting and dirty tracking remain sound,
    /// and mapping its translations reports [`Error::NoHostMapping`]. Registration
    /// without a file behaves the same way.
    ///
    /// Returns the index of the new region. Indices are positional: removing a
    /// region re-packs the table and shifts the indices of the regions after it,
    /// which is why scatter-gather entries record the region's base address
    /// alongside its index and are revalidated against it when mapped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is zero or `base + size` wraps.
    /// - [`Error::Overlap`] carrying the index of the first conflicting region.
    /// - [`Error::TooManyRegions`] if the table is full.
    pub fn add_region(
        &mut self,
        base: DmaAddress,
        size: u64,
        file: Option<FileOffset>,
        access: Access,
    ) -> Result<usize> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(Error::InvalidSize);
        }
        let end = base.unchecked_add(size);

        for (index, region) in self.regions.iter().enumerate() {
            if base < region.end_addr() && region.start_addr() < end {
                return Err(Error::Overlap { index });
            }
        }
        if self.regions.len() >= self.max_regions {
            return Err(Error::TooManyRegions);
        }

        let mut region = DmaRegion::new(base, size, file, access);
        if let Some(page_size) = self.dirty_page_size {
            region.start_dirty_logging(page_size);
        }

        debug!("add DMA region {:#x}+{:#x}", base.raw_value(), size);
        self.regions.push(region);
        Ok(self.regions.len() - 1)
    }

    /// Removes the region spanning exactly `[base, base + size)`.
    ///
    /// If the region still has outstanding scatter-gather mappings, `on_busy` is
    /// invoked once with the region to tell the upper layer that quiescence is
    /// required, and [`Error::RegionInUse`] is returned; the caller is expected to
    /// retry once it has released its mappings. The controller never blocks.
    ///
    /// On success the host mapping is destroyed and the backing descriptor released.
    pub fn remove_region<F>(&mut self, base: DmaAddress, size: u64, on_busy: F) -> Result<()>
    where
        F: FnOnce(&DmaRegion),
    {
        let index = self
            .regions
            .iter()
            .position(|r| r.start_addr() == base && r.len() == size)
            .ok_or(Error::RegionNotFound)?;

        let region = &self.regions[index];
        if region.refcount() > 0 {
            on_busy(region);
            return Err(Error::RegionInUse);
        }

        debug!("remove DMA region {:#x}+{:#x}", base.raw_value(), size);
        self.regions.remove(index);
        Ok(())
    }

    /// Removes every region, unmapping host memory and releasing descriptors.
    ///
    /// Outstanding mappings are not consulted; this is only safe during teardown.
    pub fn remove_all_regions(&mut self) {
        debug!("remove all {} DMA regions", self.regions.len());
        self.regions.clear();
    }

    /// Translates the span `[addr, addr + len)` into scatter-gather entries written
    /// to the front of `sgl`, returning how many were produced.
    ///
    /// The entries cover the span exactly and in order. A span that lies entirely
    /// within the region named by `cursor` takes a fast path that skips the table
    /// walk; otherwise the table is walked by address, crossing from one region into
    /// the next only when they are adjacent in the DMA address space. On success the
    /// cursor is updated to the last region emitted.
    ///
    /// A translation declaring [`Access::WRITE`] authorizes a device write: when
    /// dirty-page logging is active, the covered pages are marked dirty here, at
    /// translation time. The device may write through pointers it obtains later (or
    /// not at all), so marking at translation gives an upper bound on the pages
    /// actually written.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `len` is zero.
    /// - [`Error::CannotTranslate`] if the span is not fully covered by registered
    ///   regions adjacent in DMA address space.
    /// - [`Error::ProtectionViolation`] if the translation declares a write intent
    ///   and any region in the span does not permit writes.
    /// - [`Error::SgListTooShort`] if more than `sgl.len()` entries are needed; the
    ///   error carries the required count so the caller can grow its buffer and
    ///   retry.
    pub fn translate(
        &self,
        cursor: &mut SgCursor,
        addr: DmaAddress,
        len: u64,
        access: Access,
        sgl: &mut [SgEntry],
    ) -> Result<usize> {
        if len == 0 {
            return Err(Error::InvalidSize);
        }
        if addr.checked_add(len).is_none() {
            return Err(Error::CannotTranslate { addr, len });
        }

        // Fast path: the cursor's region covers the whole span.
        if !sgl.is_empty() {
            if let Some(region) = self.regions.get(cursor.region) {
                if region.contains_range(addr, len) {
                    sgl[0] = self.init_sg(cursor.region, addr, len, access)?;
                    return Ok(1);
                }
            }
        }

        // Slow path: walk the table by address.
        let count = self.translate_split(addr, len, access, sgl)?;
        cursor.region = sgl[count - 1].region;
        Ok(count)
    }

    fn translate_split(
        &self,
        addr: DmaAddress,
        len: u64,
        access: Access,
        sgl: &mut [SgEntry],
    ) -> Result<usize> {
        let mut index = self
            .find_region(addr)
            .ok_or(Error::CannotTranslate { addr, len })?;
        let mut cur = addr;
        let mut remaining = len;
        let mut needed = 0;

        loop {
            let region = &self.regions[index];
            let offset = cur.unchecked_offset_from(region.start_addr());
            let chunk = cmp::min(remaining, region.len() - offset);

            if needed < sgl.len() {
                sgl[needed] = self.init_sg(index, cur, chunk, access)?;
            } else if access.contains(Access::WRITE) && !region.access().contains(Access::WRITE) {
                // Entries past the caller's buffer are only counted, but protection
                // still holds for the whole span.
                return Err(Error::ProtectionViolation);
            }
            needed += 1;
            remaining -= chunk;
            if remaining == 0 {
                break;
            }

            // The walk continues only into the region that starts exactly where the
            // current one ends; a gap in the address space fails the translation.
            cur = region.end_addr();
            index = self
                .regions
                .iter()
                .position(|r| r.start_addr() == cur)
                .ok_or(Error::CannotTranslate { addr, len })?;
        }

        if needed > sgl.len() {
            return Err(Error::SgListTooShort { needed });
        }
        Ok(needed)
    }

    fn init_sg(&self, index: usize, addr: DmaAddress, len: u64, access: Access) -> Result<SgEntry> {
        let region = &self.regions[index];
        if access.contains(Access::WRITE) && !region.access().contains(Access::WRITE) {
            return Err(Error::ProtectionViolation);
        }

        let offset = addr.unchecked_offset_from(region.start_addr());
        if access.contains(Access::WRITE) {
            region.mark_dirty(offset, len);
        }

        Ok(SgEntry {
            region: index,
            region_base: region.start_addr(),
            offset,
            len,
            mappable: region.is_mappable(),
        })
    }

    /// Maps each entry of `sgl` into a host-virtual iovec written to the front of
    /// `iovs`, pinning the referenced regions.
    ///
    /// Every mapped entry increments its region's reference count; the region cannot
    /// be removed until [`unmap_sg`](DmaController::unmap_sg) drops the count back.
    /// On error, regions pinned before the failing entry stay pinned; unmapping the
    /// same list balances the counts (unmatched entries are skipped, and counts
    /// never go below zero).
    ///
    /// # Errors
    ///
    /// - [`Error::SgListTooShort`] if `iovs` holds fewer elements than `sgl`.
    /// - [`Error::RegionNotFound`] if an entry's index no longer names a region
    ///   with the entry's base address. Removals re-pack the table, so an index
    ///   can come to name a different region than the one translated; entries are
    ///   revalidated against their recorded base rather than trusted blindly.
    /// - [`Error::InvalidSize`] if an entry does not fit its region's bounds.
    /// - [`Error::NoHostMapping`] if an entry's region has no host mapping.
    pub fn map_sg(&self, sgl: &[SgEntry], iovs: &mut [HostIovec]) -> Result<()> {
        if iovs.len() < sgl.len() {
            return Err(Error::SgListTooShort { needed: sgl.len() });
        }

        for (sg, iov) in sgl.iter().zip(iovs.iter_mut()) {
            let region = self
                .regions
                .get(sg.region)
                .filter(|r| r.start_addr() == sg.region_base)
                .ok_or(Error::RegionNotFound)?;
            let end = sg.offset.checked_add(sg.len).ok_or(Error::InvalidSize)?;
            if end > region.len() {
                return Err(Error::InvalidSize);
            }
            let len = usize::try_from(sg.len).map_err(|_| Error::InvalidSize)?;
            let base = region.host_address(sg.offset).ok_or(Error::NoHostMapping)?;

            debug!(
                "map DMA range {:#x}+{:#x}",
                sg.dma_addr().raw_value(),
                sg.len
            );
            *iov = HostIovec::new(base, len);
            region.pin();
        }
        Ok(())
    }

    /// Releases the mappings previously established for `sgl`.
    ///
    /// Regions are located by their base address rather than by index, so the call
    /// tolerates table re-packing that happened after the list was mapped. Entries
    /// whose region is gone are skipped; reference counts never drop below zero.
    pub fn unmap_sg(&self, sgl: &[SgEntry]) {
        for sg in sgl {
            if let Some(region) = self.regions.iter().find(|r| r.start_addr() == sg.region_base) {
                debug!(
                    "unmap DMA range {:#x}+{:#x}",
                    sg.dma_addr().raw_value(),
                    sg.len
                );
                region.unpin();
            }
        }
    }

    /// Starts dirty-page logging at the given page granularity.
    ///
    /// Every registered region gets a zeroed bitmap with one bit per `page_size`
    /// bytes, as does every region added while logging stays active.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPageSize`] if `page_size` is zero or not a power of two.
    /// - [`Error::AlreadyLogging`] if logging is already active.
    pub fn start_dirty_logging(&mut self, page_size: usize) -> Result<()> {
        let page_size = NonZeroUsize::new(page_size)
            .filter(|p| p.is_power_of_two())
            .ok_or(Error::InvalidPageSize)?;
        if self.dirty_page_size.is_some() {
            return Err(Error::AlreadyLogging);
        }

        for region in &mut self.regions {
            region.start_dirty_logging(page_size);
        }
        self.dirty_page_size = Some(page_size);
        Ok(())
    }

    /// Stops dirty-page logging and releases every region's bitmap.
    ///
    /// # Errors
    ///
    /// - [`Error::NotLogging`] if logging is not active.
    pub fn stop_dirty_logging(&mut self) -> Result<()> {
        if self.dirty_page_size.take().is_none() {
            return Err(Error::NotLogging);
        }
        for region in &mut self.regions {
            region.stop_dirty_logging();
        }
        Ok(())
    }

    /// Snapshots the dirty bitmap of the region spanning exactly `[base, base + len)`
    /// into `buf`, then clears it.
    ///
    /// The snapshot is clear-on-read: between two consecutive calls, a bit set in
    /// the second call denotes a write-intent translation issued between them. The
    /// encoding is LSB-first, bit `i % 8` of byte `i / 8` representing page `i`,
    /// where page 0 covers `[base, base + page_size)`. A region that has no bitmap
    /// reports every page dirty, the safe upper bound.
    ///
    /// # Errors
    ///
    /// - [`Error::NotLogging`] if logging is not active.
    /// - [`Error::RegionNotFound`] if no region spans exactly the given range.
    /// - [`Error::PageSizeMismatch`] if `page_size` differs from the granularity
    ///   logging was started with.
    /// - [`Error::BufferTooSmall`] if `buf` cannot hold one bit per page; the error
    ///   carries the required byte count.
    pub fn dirty_bitmap(
        &self,
        base: DmaAddress,
        len: u64,
        page_size: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let active = self.dirty_page_size.ok_or(Error::NotLogging)?;
        let region = self
            .regions
            .iter()
            .find(|r| r.start_addr() == base && r.len() == len)
            .ok_or(Error::RegionNotFound)?;
        if page_size != active.get() {
            return Err(Error::PageSizeMismatch);
        }

        let pages = len.div_ceil(page_size as u64) as usize;
        let needed = pages.div_ceil(u8::BITS as usize);
        if buf.len() < needed {
            return Err(Error::BufferTooSmall { needed });
        }

        match region.dirty_bitmap() {
            Some(bitmap) => bitmap.snapshot_and_reset(&mut buf[..needed]),
            // No bitmap to consult, so report every page dirty.
            None => buf[..needed].fill(0xff),
        }
        Ok(())
    }

    /// Returns the number of registered regions.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Returns the capacity of the region table.
    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// Returns the region at `index`, if any.
    pub fn region(&self, index: usize) -> Option<&DmaRegion> {
        self.regions.get(index)
    }

    /// Iterates over the registered regions in insertion order.
    pub fn regions(&self) -> impl Iterator<Item = &DmaRegion> {
        self.regions.iter()
    }

    /// The active dirty-logging page size, or `None` while logging is off.
    pub fn dirty_page_size(&self) -> Option<usize> {
        self.dirty_page_size.map(NonZeroUsize::get)
    }

    fn find_region(&self, addr: DmaAddress) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(addr))
    }
}
