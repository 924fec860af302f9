//! # Free-Space Management
//!
//! Allocation and release of pages, implemented as `Transaction` methods so
//! every bitmap and metadata mutation flows through the ordinary
//! copy-on-write dirty set and becomes durable at commit.
//!
//! Allocation assembles this transaction's view of the busy-page bitmap
//! (dirty bitmap pages shadow the mapping), runs the best-fit range search
//! over it, then marks the chosen bits busy and stamps the metadata
//! records of the run. Callers pass a locality hint, typically the most
//! recently allocated sibling page, so related data clusters and
//! sequential reads stay sequential.

use eyre::Result;

use crate::bitmap::find_free_range;
use crate::error::ErrorKind;
use crate::meta::{
    bitmap_pages, metadata_location, overflow_run_pages, PageMetadata, FLAG_METADATA,
    FLAG_OVERFLOW_FIRST, FLAG_OVERFLOW_REST, FLAG_SINGLE, METADATA_RECORD_SIZE,
    PAGES_PER_BITMAP_PAGE,
};
use crate::txn::{PageMut, Transaction};
use crate::PAGE_SIZE;

impl Transaction<'_> {
    /// Allocates a run of pages big enough for a value of `overflow_size`
    /// bytes (one page for sizes up to one page's worth), preferring
    /// placement near `near_page`. Returns the pinned writable run.
    ///
    /// Fails with `NoSpace` without touching any state when no sufficient
    /// free run exists.
    pub fn allocate_page(&mut self, overflow_size: u32, near_page: u64) -> Result<PageMut<'_>> {
        self.check_writable("allocate_page")?;
        self.check_page_bounds(near_page)
            .map_err(|e| e.wrap_err("allocation locality hint out of bounds"))?;

        let required = overflow_run_pages(overflow_size);
        let words = self.bitmap_words();
        let first = match find_free_range(&words, required, near_page) {
            Some(first) => first,
            None => fail!(
                ErrorKind::NoSpace,
                "no free run of {} pages ({} bytes requested)",
                required,
                overflow_size
            ),
        };

        for i in 0..required {
            let page = first + i;
            self.set_bitmap_bit(page, true)?;
            let (flags, size) = if required == 1 {
                (FLAG_SINGLE, 0)
            } else if i == 0 {
                (FLAG_OVERFLOW_FIRST, overflow_size)
            } else {
                (FLAG_OVERFLOW_REST, overflow_size - i as u32 * PAGE_SIZE as u32)
            };
            self.stamp_metadata(page, flags, size)?;
        }

        let mut run = self.modify_page(first)?;
        run.overflow_size = overflow_size;
        Ok(run)
    }

    /// Releases a page (for `single`) or a whole run (for
    /// `overflow_first`): clears the bitmap bits and zeroes the metadata
    /// records.
    ///
    /// Freeing an already-free page, an overflow continuation page or one
    /// of the pager's own bookkeeping pages is an `InvalidState` error and
    /// changes nothing.
    pub fn free_page(&mut self, page_num: u64) -> Result<()> {
        self.check_writable("free_page")?;
        self.check_page_bounds(page_num)?;

        let (overflow_size, flags) = self.page_metadata(page_num)?;
        check!(
            flags != 0,
            ErrorKind::InvalidState,
            "page {} is already free",
            page_num
        );
        check!(
            flags & FLAG_METADATA == 0,
            ErrorKind::InvalidState,
            "page {} belongs to the pager's bookkeeping and cannot be freed",
            page_num
        );
        check!(
            flags & FLAG_OVERFLOW_REST == 0,
            ErrorKind::InvalidState,
            "page {} is an overflow continuation; free the run through its first page",
            page_num
        );

        let run = if flags & FLAG_OVERFLOW_FIRST != 0 {
            overflow_run_pages(overflow_size)
        } else {
            1
        };
        for page in page_num..page_num + run {
            self.set_bitmap_bit(page, false)?;
            self.stamp_metadata(page, 0, 0)?;
        }
        Ok(())
    }

    /// Marks one of the bootstrap pages (header, bitmap, metadata) busy
    /// during first-time initialisation.
    pub(crate) fn mark_bootstrap_page(&mut self, page_num: u64) -> Result<()> {
        self.set_bitmap_bit(page_num, true)?;
        self.stamp_metadata(page_num, FLAG_SINGLE | FLAG_METADATA, 0)
    }

    /// This transaction's view of the whole bitmap as 64-bit words, with
    /// the bits past the last page forced busy.
    fn bitmap_words(&self) -> Vec<u64> {
        let total = self.pager().header.number_of_pages();
        let word_count = total.div_ceil(64) as usize;
        let mut words = Vec::with_capacity(word_count);

        'pages: for bitmap_page in 1..=bitmap_pages(total) {
            let page = self.raw_page(bitmap_page);
            for chunk in page.chunks_exact(8) {
                if words.len() == word_count {
                    break 'pages;
                }
                words.push(u64::from_le_bytes(chunk.try_into().unwrap()));
            }
        }

        let tail_bits = total % 64;
        if tail_bits != 0 {
            if let Some(last) = words.last_mut() {
                *last |= !0u64 << tail_bits;
            }
        }
        words
    }

    fn set_bitmap_bit(&mut self, page_num: u64, busy: bool) -> Result<()> {
        let bitmap_page = 1 + page_num / PAGES_PER_BITMAP_PAGE;
        let bit = (page_num % PAGES_PER_BITMAP_PAGE) as usize;
        let handle = self.modify_page(bitmap_page)?;
        let mask = 1u8 << (bit % 8);
        if busy {
            handle.data[bit / 8] |= mask;
        } else {
            handle.data[bit / 8] &= !mask;
        }
        Ok(())
    }

    /// Rewrites the metadata record of `page_num` with the given flags and
    /// overflow size (zeroing the rest of the record).
    fn stamp_metadata(&mut self, page_num: u64, flags: u8, overflow_size: u32) -> Result<()> {
        let header = &self.pager().header;
        let loc = metadata_location(
            header.number_of_pages(),
            header.pages_per_metadata_section(),
            page_num,
        );
        let offset = loc.index * METADATA_RECORD_SIZE;
        let handle = self.modify_page(loc.page)?;
        let record =
            PageMetadata::from_bytes_mut(&mut handle.data[offset..offset + METADATA_RECORD_SIZE])?;
        record.clear();
        record.set_flags(flags);
        record.set_overflow_size(overflow_size);
        Ok(())
    }

    /// Pages of the overflow run starting at `first`, first page included.
    /// Exposed for integrity assertions in tests.
    #[cfg(test)]
    pub(crate) fn run_pages(&self, first: u64) -> Result<Vec<u64>> {
        let (overflow_size, _) = self.page_metadata(first)?;
        Ok((first..first + overflow_run_pages(overflow_size)).collect())
    }

    /// Whether this transaction sees the page as busy.
    #[cfg(test)]
    pub(crate) fn page_busy(&self, page_num: u64) -> bool {
        let bitmap_page = 1 + page_num / PAGES_PER_BITMAP_PAGE;
        let bit = (page_num % PAGES_PER_BITMAP_PAGE) as usize;
        self.raw_page(bitmap_page)[bit / 8] & (1 << (bit % 8)) != 0
    }
}
