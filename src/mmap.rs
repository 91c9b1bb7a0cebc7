// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Helper structures for mapping region file descriptors into the current process.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::null_mut;
use std::result;
use std::sync::Arc;

/// Error conditions that may arise when creating a new [`HostMapping`] object.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The specified file offset and length cause overflow when added.
    #[error("The specified file offset and length cause overflow when added")]
    InvalidOffsetLength,
    /// A mapping with offset + length > EOF was attempted.
    #[error("The specified file offset and length is greater than file length")]
    MappingPastEof,
    /// The region length does not fit the host address space.
    #[error("The region length does not fit the host address space")]
    MappingSize,
    /// The `mmap` call returned an error.
    #[error("{0}")]
    Mmap(io::Error),
}

/// Result of mapping construction operations.
pub type Result<T> = result::Result<T, Error>;

/// A file descriptor plus the byte offset at which a region's first byte lives.
///
/// The descriptor is reference counted; it is closed when the last clone is dropped.
#[derive(Clone, Debug)]
pub struct FileOffset {
    file: Arc<File>,
    start: u64,
}

impl FileOffset {
    /// Creates a new `FileOffset` object.
    pub fn new(file: File, start: u64) -> Self {
        FileOffset::from_arc(Arc::new(file), start)
    }

    /// Creates a new `FileOffset` object based on an exiting `Arc<File>`.
    pub fn from_arc(file: Arc<File>, start: u64) -> Self {
        FileOffset { file, start }
    }

    /// Returns a reference to the inner `File` object.
    pub fn file(&self) -> &File {
        self.file.as_ref()
    }

    /// Return a reference to the inner `Arc<File>` object.
    pub fn arc(&self) -> &Arc<File> {
        &self.file
    }

    /// Returns the start offset within the file.
    pub fn start(&self) -> u64 {
        self.start
    }
}

/// Returns the host page size in bytes.
pub(crate) fn host_page_size() -> usize {
    // SAFETY: There's no unsafe potential in calling this function.
    unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
}

/// For a borrowed `FileOffset` and size, this function checks whether the mapping does
/// not extend past EOF, and that adding the size to the file offset does not lead to
/// overflow.
fn check_file_offset(file_offset: &FileOffset, size: usize) -> Result<()> {
    let end = file_offset
        .start()
        .checked_add(size as u64)
        .ok_or(Error::InvalidOffsetLength)?;

    if let Ok(metadata) = file_offset.file().metadata() {
        if metadata.len() < end {
            return Err(Error::MappingPastEof);
        }
    }

    Ok(())
}

/// A host-virtual mapping of a region's backing file.
///
/// The mapping is always created with `PROT_READ | PROT_WRITE` and `MAP_SHARED`; the
/// access intents a region declares are enforced at translation time, not here. Since
/// `mmap` requires a page-aligned file offset, an unaligned region offset is aligned
/// down to the host page size and the difference is folded into the returned pointer.
///
/// The mapping is destroyed on drop.
#[derive(Debug)]
pub struct HostMapping {
    addr: *mut u8,
    size: usize,
    align_offset: usize,
}

// SAFETY: Send and Sync aren't automatically inherited for the raw address pointer.
// Accessing that pointer is only done through the stateless interface which allows the
// object to be shared by multiple threads without a decrease in safety.
unsafe impl Send for HostMapping {}
// SAFETY: See comment above.
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Maps `size` bytes of `file_offset` into the current process.
    pub fn from_file(file_offset: &FileOffset, size: u64) -> Result<Self> {
        let size = usize::try_from(size).map_err(|_| Error::MappingSize)?;
        check_file_offset(file_offset, size)?;

        let page_mask = host_page_size() as u64 - 1;
        let aligned_start = file_offset.start() & !page_mask;
        let align_offset = (file_offset.start() - aligned_start) as usize;
        let mapping_size = size.checked_add(align_offset).ok_or(Error::MappingSize)?;

        // SAFETY: This is safe because we're not allowing MAP_FIXED, and invalid
        // parameters cannot break Rust safety guarantees.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                mapping_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file_offset.file().as_raw_fd(),
                aligned_start as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }

        Ok(HostMapping {
            addr: addr as *mut u8,
            size: mapping_size,
            align_offset,
        })
    }

    /// Returns a pointer to the first byte of the mapped region.
    ///
    /// Dereferencing the pointer is only sound within the region's length; the
    /// controller hands out bounds-checked `(pointer, length)` pairs instead of
    /// exposing this directly to devices.
    pub fn as_ptr(&self) -> *mut u8 {
        // The addition cannot overflow: `addr + align_offset` lies within the mapping.
        self.addr.wrapping_add(self.align_offset)
    }

    /// Returns the usable length of the mapping, excluding alignment slack.
    pub fn len(&self) -> usize {
        self.size - self.align_offset
    }

    /// Returns `true` if the usable length of the mapping is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: This is safe because we mmap the area at `addr` ourselves, and
        // nobody else is holding a reference to it.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use vmm_sys_util::tempfile::TempFile;

    fn backing_file(len: u64) -> File {
        let f = TempFile::new().unwrap().into_file();
        f.set_len(len).unwrap();
        f
    }

    #[test]
    fn test_map_whole_file() {
        let file_offset = FileOffset::new(backing_file(0x2000), 0);
        let mapping = HostMapping::from_file(&file_offset, 0x2000).unwrap();
        assert_eq!(mapping.len(), 0x2000);
        assert!(!mapping.is_empty());
        assert!(!mapping.as_ptr().is_null());
    }

    #[test]
    fn test_map_unaligned_offset() {
        let file_offset = FileOffset::new(backing_file(0x3000), 0x10);
        let mapping = HostMapping::from_file(&file_offset, 0x1000).unwrap();
        assert_eq!(mapping.len(), 0x1000);
        // The returned pointer carries the sub-page displacement.
        assert_eq!(mapping.as_ptr() as usize % host_page_size(), 0x10);

        // Bytes written through the mapping land at the file offset, not at the
        // aligned-down mapping start.
        // SAFETY: The mapping is `len` bytes long and exclusively owned here.
        let slice = unsafe { std::slice::from_raw_parts_mut(mapping.as_ptr(), 4) };
        slice.copy_from_slice(b"vdma");

        use std::io::{Read, Seek, SeekFrom};
        let mut file = file_offset.file().try_clone().unwrap();
        file.seek(SeekFrom::Start(0x10)).unwrap();
        let mut read_back = [0u8; 4];
        file.read_exact(&mut read_back).unwrap();
        assert_eq!(&read_back, b"vdma");
    }

    #[test]
    fn test_map_past_eof() {
        let file_offset = FileOffset::new(backing_file(0x1000), 0x800);
        let err = HostMapping::from_file(&file_offset, 0x1000).unwrap_err();
        assert!(matches!(err, Error::MappingPastEof));
    }

    #[test]
    fn test_offset_overflow() {
        let file_offset = FileOffset::new(backing_file(0x1000), u64::MAX - 0x10);
        let err = HostMapping::from_file(&file_offset, 0x1000).unwrap_err();
        assert!(matches!(err, Error::InvalidOffsetLength));
    }

    #[test]
    fn test_file_offset_accessors() {
        let file_offset = FileOffset::new(backing_file(0x1000), 0x400);
        assert_eq!(file_offset.start(), 0x400);
        assert_eq!(Arc::strong_count(file_offset.arc()), 1);
        let clone = file_offset.clone();
        assert_eq!(clone.start(), 0x400);
        assert_eq!(Arc::strong_count(file_offset.arc()), 2);
    }
}
