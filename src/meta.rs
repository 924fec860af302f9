//! # Page Metadata Records and Placement
//!
//! Every page in the file has one packed 16-byte metadata record, but the
//! file carries no per-page header and no central metadata table. Instead
//! the file is viewed as consecutive *ranges* of `pages_per_metadata_section`
//! pages, and the records for all pages of a range (the metadata pages
//! themselves included) live in the last pages of that range.
//!
//! ## Why This Layout
//!
//! - Payload pages keep their full 8192 bytes, which keeps power-of-two
//!   layouts (bitmaps, hash tables, tree nodes) simple for the layers above.
//! - Metadata-only scans touch a small contiguous span per range.
//! - A bad sector damages at most one range's metadata.
//! - Growing the file never relocates a global metadata region; each range
//!   owns its own.
//!
//! For the trailing partial range of a file whose page count is not a
//! multiple of the section size, the records sit at the very end of the
//! file and cover only the remaining pages.
//!
//! ## Record Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     overflow_size (LE): user-visible byte length of the value
//! 4       1     flags: free/single/overflow_first/overflow_rest/metadata
//! 5       3     padding
//! 8       8     reserved
//! ```
//!
//! On the first page of an overflow run `overflow_size` is the full value
//! length; on every continuation page it is the bytes remaining from that
//! page onward, so any page of a run knows how far the run still extends.

use eyre::Result;
use smallvec::SmallVec;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ErrorKind;
use crate::PAGE_SIZE;

pub const METADATA_RECORD_SIZE: usize = 16;
pub const METADATA_RECORDS_PER_PAGE: u64 = (PAGE_SIZE / METADATA_RECORD_SIZE) as u64;

/// Pages tracked by one bitmap page (one bit per page).
pub const PAGES_PER_BITMAP_PAGE: u64 = (PAGE_SIZE * 8) as u64;

pub const FLAG_SINGLE: u8 = 1 << 0;
pub const FLAG_OVERFLOW_FIRST: u8 = 1 << 1;
pub const FLAG_OVERFLOW_REST: u8 = 1 << 2;
pub const FLAG_METADATA: u8 = 1 << 3;

const KNOWN_FLAGS: u8 = FLAG_SINGLE | FLAG_OVERFLOW_FIRST | FLAG_OVERFLOW_REST | FLAG_METADATA;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageMetadata {
    overflow_size: U32,
    flags: u8,
    padding: [u8; 3],
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<PageMetadata>() == METADATA_RECORD_SIZE);

impl PageMetadata {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        check!(
            data.len() >= METADATA_RECORD_SIZE,
            ErrorKind::Corruption,
            "buffer too small for PageMetadata: {} < {}",
            data.len(),
            METADATA_RECORD_SIZE
        );
        match Self::ref_from_bytes(&data[..METADATA_RECORD_SIZE]) {
            Ok(record) => Ok(record),
            Err(e) => fail!(ErrorKind::Corruption, "failed to parse PageMetadata: {:?}", e),
        }
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        check!(
            data.len() >= METADATA_RECORD_SIZE,
            ErrorKind::Corruption,
            "buffer too small for PageMetadata: {} < {}",
            data.len(),
            METADATA_RECORD_SIZE
        );
        match Self::mut_from_bytes(&mut data[..METADATA_RECORD_SIZE]) {
            Ok(record) => Ok(record),
            Err(e) => fail!(ErrorKind::Corruption, "failed to parse PageMetadata: {:?}", e),
        }
    }

    /// Resets the record to the free state (all zeroes).
    pub fn clear(&mut self) {
        self.overflow_size = U32::new(0);
        self.flags = 0;
        self.padding = [0u8; 3];
        self.reserved = [0u8; 8];
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn is_free(&self) -> bool {
        self.flags == 0
    }

    pub fn is_single(&self) -> bool {
        self.flags & FLAG_SINGLE != 0
    }

    pub fn is_overflow_first(&self) -> bool {
        self.flags & FLAG_OVERFLOW_FIRST != 0
    }

    pub fn is_overflow_rest(&self) -> bool {
        self.flags & FLAG_OVERFLOW_REST != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.flags & FLAG_METADATA != 0
    }

    pub fn has_unknown_flags(&self) -> bool {
        self.flags & !KNOWN_FLAGS != 0
    }

    zerocopy_accessors! {
        overflow_size: u32,
    }
}

/// Where the metadata record of a page lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLocation {
    /// Page holding the record.
    pub page: u64,
    /// Record index within that page.
    pub index: usize,
}

/// Computes, in O(1), the location of the metadata record for `page_num`
/// in a file of `total_pages` pages with `section_pages`-page ranges.
///
/// Deterministic and stateless: the answer depends only on the three
/// arguments.
pub fn metadata_location(total_pages: u64, section_pages: u64, page_num: u64) -> MetadataLocation {
    debug_assert!(page_num < total_pages);

    let range_end = (page_num / section_pages + 1) * section_pages;
    let section_start = if range_end <= total_pages {
        let section_bytes = section_pages * METADATA_RECORD_SIZE as u64;
        range_end - section_bytes.div_ceil(PAGE_SIZE as u64)
    } else {
        // trailing partial range: records sit at the very end of the file
        let remainder = total_pages % section_pages;
        let section_bytes = remainder * METADATA_RECORD_SIZE as u64;
        total_pages - section_bytes.div_ceil(PAGE_SIZE as u64)
    };

    let index_within_section = page_num % section_pages;
    MetadataLocation {
        page: section_start + index_within_section / METADATA_RECORDS_PER_PAGE,
        index: (index_within_section % METADATA_RECORDS_PER_PAGE) as usize,
    }
}

/// Number of pages an overflow value of `overflow_size` bytes occupies.
/// Sizes of 0 or 1 page's worth still occupy a single page.
pub fn overflow_run_pages(overflow_size: u32) -> u64 {
    (overflow_size as u64).div_ceil(PAGE_SIZE as u64).max(1)
}

/// Number of pages needed to hold the records of a `range_pages`-page range.
pub fn metadata_pages_in_range(range_pages: u64) -> u64 {
    (range_pages * METADATA_RECORD_SIZE as u64).div_ceil(PAGE_SIZE as u64)
}

/// Number of bitmap pages needed to track `total_pages` pages.
pub fn bitmap_pages(total_pages: u64) -> u64 {
    total_pages.div_ceil(PAGES_PER_BITMAP_PAGE)
}

/// The `(first_page, page_count)` span of every metadata section in a file
/// of `total_pages` pages.
pub fn metadata_page_spans(total_pages: u64, section_pages: u64) -> SmallVec<[(u64, u64); 4]> {
    let mut spans = SmallVec::new();
    let mut range_start = 0;
    while range_start < total_pages {
        let range_end = (range_start + section_pages).min(total_pages);
        let pages = metadata_pages_in_range(range_end - range_start);
        spans.push((range_end - pages, pages));
        range_start += section_pages;
    }
    spans
}
