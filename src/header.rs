//! # File Header
//!
//! Page 0 of every data file starts with a fixed 64-byte header describing
//! the file's geometry. All multi-byte fields are little-endian; the
//! zerocopy wrapper types handle conversion, so the struct can be read
//! in place from the mapping and written in place into a page buffer.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic: "PGSTORE1"
//! 8       4     version (currently 1)
//! 12      4     page_size (8192)
//! 16      8     number_of_pages
//! 24      8     pages_per_metadata_section
//! 32      8     flags (must be zero in version 1)
//! 40      24    reserved, zero-filled
//! ```
//!
//! The rest of page 0 is zero. Opening a file whose magic, version or
//! geometry disagrees with the current build fails with a corruption
//! error; there is no in-place migration between layouts.

use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ErrorKind;
use crate::PAGE_SIZE;

pub const FILE_MAGIC: &[u8; 8] = b"PGSTORE1";
pub const CURRENT_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 8],
    version: U32,
    page_size: U32,
    number_of_pages: U64,
    pages_per_metadata_section: U64,
    flags: U64,
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(number_of_pages: u64, pages_per_metadata_section: u64) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(PAGE_SIZE as u32),
            number_of_pages: U64::new(number_of_pages),
            pages_per_metadata_section: U64::new(pages_per_metadata_section),
            flags: U64::new(0),
            reserved: [0u8; 24],
        }
    }

    /// Parses and validates the header at the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        check!(
            bytes.len() >= FILE_HEADER_SIZE,
            ErrorKind::Corruption,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = match Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE]) {
            Ok(header) => header,
            Err(e) => fail!(ErrorKind::Corruption, "failed to parse FileHeader: {:?}", e),
        };

        check!(
            &header.magic == FILE_MAGIC,
            ErrorKind::Corruption,
            "invalid magic bytes in data file header"
        );
        check!(
            header.version.get() == CURRENT_VERSION,
            ErrorKind::Corruption,
            "unsupported data file version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        check!(
            header.page_size.get() as usize == PAGE_SIZE,
            ErrorKind::Corruption,
            "page size mismatch: file uses {}, build uses {}",
            header.page_size.get(),
            PAGE_SIZE
        );

        Ok(header)
    }

    /// Copies the header into the start of a page buffer.
    pub fn write_to(&self, page: &mut [u8]) -> Result<()> {
        check!(
            page.len() >= FILE_HEADER_SIZE,
            ErrorKind::InvalidArgument,
            "buffer too small for FileHeader: {} < {}",
            page.len(),
            FILE_HEADER_SIZE
        );
        page[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    zerocopy_accessors! {
        number_of_pages: u64,
        pages_per_metadata_section: u64,
        flags: u64,
    }
}
