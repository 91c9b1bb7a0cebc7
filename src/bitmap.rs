// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Page-granular dirty bitmap backed by atomic integers.

use std::cmp;
use std::iter;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Records which pages of a byte range have been written, one bit per page.
///
/// Marking is atomic, so any number of translation threads may record writes
/// concurrently. Everything else leans on the embedding's serialization rules:
/// snapshots and resets are kept off the translation paths by the caller, and the
/// bits carry no payload beyond themselves, so relaxed memory ordering suffices
/// throughout. The read-modify-write on each word is what guarantees a snapshot
/// collects every mark that reached it.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Vec<AtomicU64>,
    pages: usize,
    page_size: NonZeroUsize,
}

#[allow(clippy::len_without_is_empty)]
impl AtomicBitmap {
    /// Creates a bitmap for `byte_size` bytes of memory at the given page
    /// granularity. A trailing partial page gets a bit of its own.
    pub fn new(byte_size: usize, page_size: NonZeroUsize) -> Self {
        let pages = byte_size.div_ceil(page_size.get());
        let words = iter::repeat_with(|| AtomicU64::new(0))
            .take(pages.div_ceil(u64::BITS as usize))
            .collect();

        AtomicBitmap {
            words,
            pages,
            page_size,
        }
    }

    /// Reports whether page `index` is dirty. Pages past the end of the bitmap
    /// always report clean.
    pub fn is_page_dirty(&self, index: usize) -> bool {
        if index >= self.pages {
            return false;
        }
        let word = self.words[index / 64].load(Ordering::Relaxed);
        word & (1 << (index % 64)) != 0
    }

    /// Reports whether the page holding byte offset `offset` is dirty.
    pub fn is_addr_dirty(&self, offset: usize) -> bool {
        self.is_page_dirty(offset / self.page_size)
    }

    /// Marks every page touched by `[offset, offset + len)` dirty. Pages past the
    /// end of the bitmap are left alone rather than wrapped around.
    pub fn mark_range(&self, offset: usize, len: usize) {
        if len == 0 || self.pages == 0 {
            return;
        }
        let first = offset / self.page_size;
        if first >= self.pages {
            return;
        }
        // Saturate so a range reaching the top of the address space cannot wrap.
        let last_byte = offset.saturating_add(len - 1);
        let last = cmp::min(last_byte / self.page_size, self.pages - 1);
        for page in first..=last {
            self.words[page / 64].fetch_or(1 << (page % 64), Ordering::Relaxed);
        }
    }

    /// Number of pages (bits) the bitmap covers.
    pub fn len(&self) -> usize {
        self.pages
    }

    /// Bytes needed to hold one bit per page, as written by
    /// [`AtomicBitmap::snapshot_and_reset`].
    pub fn byte_len(&self) -> usize {
        self.pages.div_ceil(u8::BITS as usize)
    }

    /// The page granularity the bitmap was created with.
    pub fn page_size(&self) -> NonZeroUsize {
        self.page_size
    }

    /// Copies the bitmap into `buf` and clears it in the same pass.
    ///
    /// The encoding is LSB-first: bit `i % 8` of byte `i / 8` stands for page `i`.
    /// `buf` should hold [`AtomicBitmap::byte_len`] bytes; extra bytes are left
    /// untouched, and a shorter buffer truncates the copy while the clearing still
    /// covers the whole bitmap.
    pub fn snapshot_and_reset(&self, buf: &mut [u8]) {
        let limit = cmp::min(buf.len(), self.byte_len());
        for (i, word) in self.words.iter().enumerate() {
            let value = word.swap(0, Ordering::Relaxed);
            let at = i * 8;
            if at < limit {
                let take = cmp::min(8, limit - at);
                buf[at..at + take].copy_from_slice(&value.to_le_bytes()[..take]);
            }
        }
    }

    /// Clears every bit.
    pub fn reset(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}
