//! # Pager
//!
//! `Pager` owns one data file: the file handle, the read-only mapping and
//! an in-memory copy of the file header. It hands out transactions and
//! performs first-time initialisation and open-time verification.
//!
//! ## Bootstrap
//!
//! Opening a path that holds no data yet preallocates the initial file,
//! writes the header and runs an ordinary write transaction that marks the
//! bootstrap pages (header, bitmap pages, every metadata page) busy in the
//! bitmap and as `single|metadata` in the page metadata. The initial state
//! therefore satisfies the same invariants as any later state, and reaches
//! the disk through the same commit path.
//!
//! ## Opening an Existing File
//!
//! The header is validated against the current build (magic, version, page
//! size, section geometry) and the file length must equal
//! `number_of_pages * PAGE_SIZE`. Anything else is reported as corruption
//! and aborts the open. A full bitmap/metadata consistency scan is
//! available separately via [`Pager::verify`]; callers reopening after a
//! failed commit run it before trusting the file again.
//!
//! ## Concurrency
//!
//! Readers share the mapping and never take a lock. Writers serialise on
//! an exclusive mutex acquired for the lifetime of the write transaction.

use std::path::Path;

use eyre::{Result, WrapErr};
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::error::ErrorKind;
use crate::file::DataFile;
use crate::header::FileHeader;
use crate::meta::{
    bitmap_pages, metadata_location, metadata_page_spans, overflow_run_pages, PageMetadata,
    FLAG_METADATA, FLAG_SINGLE, METADATA_RECORD_SIZE, PAGES_PER_BITMAP_PAGE,
};
use crate::txn::{Transaction, TransactionKind};
use crate::{DEFAULT_INITIAL_SIZE, DEFAULT_PAGES_PER_SECTION, PAGE_SIZE};

/// Geometry used when a file is first created.
///
/// An existing file must agree with these values; there is no in-place
/// migration between section sizes.
#[derive(Debug, Clone, Copy)]
pub struct PagerOptions {
    /// Size the file is preallocated to on creation, in bytes. Must be a
    /// multiple of the page size.
    pub initial_size: u64,
    /// Pages covered by one metadata section.
    pub pages_per_section: u64,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            pages_per_section: DEFAULT_PAGES_PER_SECTION,
        }
    }
}

#[derive(Debug)]
pub struct Pager {
    pub(crate) file: DataFile,
    pub(crate) map: Mmap,
    pub(crate) header: FileHeader,
    pub(crate) writer: Mutex<()>,
}

impl Pager {
    /// Opens the page file at `path` with default geometry, creating and
    /// initialising it if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, PagerOptions::default())
    }

    /// Like [`Pager::open`], with explicit geometry.
    pub fn open_with<P: AsRef<Path>>(path: P, options: PagerOptions) -> Result<Self> {
        check!(
            options.pages_per_section >= 2,
            ErrorKind::InvalidArgument,
            "pages_per_section must be at least 2, got {}",
            options.pages_per_section
        );
        check!(
            options.initial_size % PAGE_SIZE as u64 == 0 && options.initial_size > 0,
            ErrorKind::InvalidArgument,
            "initial size {} is not a positive multiple of the page size",
            options.initial_size
        );

        let file = DataFile::create(path)?;
        let len = file.len()?;
        if len == 0 {
            Self::bootstrap(file, options)
        } else {
            Self::open_existing(file, len, options)
        }
    }

    fn bootstrap(file: DataFile, options: PagerOptions) -> Result<Self> {
        let number_of_pages = options.initial_size / PAGE_SIZE as u64;
        let bitmap = bitmap_pages(number_of_pages);
        let spans = metadata_page_spans(number_of_pages, options.pages_per_section);
        let metadata_total: u64 = spans.iter().map(|(_, pages)| pages).sum();
        check!(
            1 + bitmap + metadata_total < number_of_pages,
            ErrorKind::InvalidArgument,
            "initial size of {} pages leaves no payload pages ({} needed for bookkeeping)",
            number_of_pages,
            1 + bitmap + metadata_total
        );

        file.ensure_minimum_size(options.initial_size)
            .wrap_err("failed to size new page file")?;
        let map = file.map(options.initial_size)?;
        let header = FileHeader::new(number_of_pages, options.pages_per_section);

        let pager = Self {
            file,
            map,
            header,
            writer: Mutex::new(()),
        };

        let mut txn = pager.begin(TransactionKind::Write)?;
        txn.mark_extended();
        {
            let page0 = txn.modify_page(0)?;
            header.write_to(page0.data)?;
        }
        txn.mark_bootstrap_page(0)?;
        for bitmap_page in 1..=bitmap {
            txn.mark_bootstrap_page(bitmap_page)?;
        }
        for (start, pages) in &spans {
            for page in *start..start + pages {
                txn.mark_bootstrap_page(page)?;
            }
        }
        txn.commit().wrap_err("failed to commit page file bootstrap")?;

        Ok(pager)
    }

    fn open_existing(file: DataFile, len: u64, options: PagerOptions) -> Result<Self> {
        check!(
            len % PAGE_SIZE as u64 == 0,
            ErrorKind::Corruption,
            "file length {} is not a multiple of the page size",
            len
        );

        let map = file.map(len)?;
        let header = *FileHeader::from_bytes(&map[..])
            .wrap_err_with(|| format!("failed to read header of '{}'", file.path().display()))?;

        check!(
            header.number_of_pages() * PAGE_SIZE as u64 == len,
            ErrorKind::Corruption,
            "header declares {} pages but the file holds {} bytes",
            header.number_of_pages(),
            len
        );
        check!(
            header.pages_per_metadata_section() == options.pages_per_section,
            ErrorKind::Corruption,
            "pages_per_metadata_section mismatch: file uses {}, build expects {}",
            header.pages_per_metadata_section(),
            options.pages_per_section
        );
        check!(
            header.flags() == 0,
            ErrorKind::Corruption,
            "unknown header flags {:#x}",
            header.flags()
        );

        Ok(Self {
            file,
            map,
            header,
            writer: Mutex::new(()),
        })
    }

    /// Starts a transaction. `Write` blocks until it holds the exclusive
    /// writer lock; `Read` never blocks.
    pub fn begin(&self, kind: TransactionKind) -> Result<Transaction<'_>> {
        let guard = match kind {
            TransactionKind::Read => None,
            TransactionKind::Write => Some(self.writer.lock()),
        };
        Ok(Transaction::new(self, guard))
    }

    pub fn page_count(&self) -> u64 {
        self.header.number_of_pages()
    }

    pub fn pages_per_section(&self) -> u64 {
        self.header.pages_per_metadata_section()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Flushes file data to stable storage outside a commit.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()
    }

    /// Hints to the OS that the given page range will be read soon.
    pub fn prefetch(&self, start_page: u64, count: u64) {
        let total = self.header.number_of_pages();
        if start_page >= total {
            return;
        }
        let end = (start_page + count).min(total);
        let offset = start_page as usize * PAGE_SIZE;
        let len = (end - start_page) as usize * PAGE_SIZE;

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is a hint and has no effect on
        // memory contents. The range is in bounds: start_page was checked
        // against the page count and end is clamped to it, so offset + len
        // never exceeds the mapping length.
        unsafe {
            libc::madvise(
                self.map.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = (offset, len);
    }

    /// Full consistency scan of the durable state: every page's bitmap bit
    /// must agree with its metadata record, bootstrap pages must carry
    /// `single|metadata`, and overflow runs must be well-formed.
    ///
    /// Run after reopening a file whose last commit may not have completed.
    pub fn verify(&self) -> Result<()> {
        let total = self.header.number_of_pages();
        let section = self.header.pages_per_metadata_section();
        check!(
            bitmap_pages(total) < total,
            ErrorKind::Corruption,
            "file of {} pages cannot hold its own bitmap",
            total
        );

        let mut bootstrap = vec![false; total as usize];
        bootstrap[0] = true;
        for bitmap_page in 1..=bitmap_pages(total) {
            bootstrap[bitmap_page as usize] = true;
        }
        for (start, pages) in metadata_page_spans(total, section) {
            for page in start..start + pages {
                bootstrap[page as usize] = true;
            }
        }

        let mut rest_pages_expected: u64 = 0;
        let mut rest_size_expected: u32 = 0;
        for page in 0..total {
            let loc = metadata_location(total, section, page);
            let offset = loc.page as usize * PAGE_SIZE + loc.index * METADATA_RECORD_SIZE;
            let record = PageMetadata::from_bytes(&self.map[offset..offset + METADATA_RECORD_SIZE])?;

            check!(
                !record.has_unknown_flags(),
                ErrorKind::Corruption,
                "page {} carries unknown metadata flags {:#04x}",
                page,
                record.flags()
            );
            check!(
                self.bitmap_bit(page) == !record.is_free(),
                ErrorKind::Corruption,
                "bitmap and metadata disagree for page {}",
                page
            );
            if bootstrap[page as usize] {
                check!(
                    record.flags() == FLAG_SINGLE | FLAG_METADATA,
                    ErrorKind::Corruption,
                    "bootstrap page {} has flags {:#04x}",
                    page,
                    record.flags()
                );
            }

            if rest_pages_expected > 0 {
                check!(
                    record.is_overflow_rest(),
                    ErrorKind::Corruption,
                    "page {} should continue an overflow run",
                    page
                );
                check!(
                    record.overflow_size() == rest_size_expected,
                    ErrorKind::Corruption,
                    "page {} carries overflow remainder {} (expected {})",
                    page,
                    record.overflow_size(),
                    rest_size_expected
                );
                rest_pages_expected -= 1;
                rest_size_expected = rest_size_expected.saturating_sub(PAGE_SIZE as u32);
            } else {
                check!(
                    !record.is_overflow_rest(),
                    ErrorKind::Corruption,
                    "page {} is an orphaned overflow continuation",
                    page
                );
                if record.is_overflow_first() {
                    let run = overflow_run_pages(record.overflow_size());
                    check!(
                        page + run <= total,
                        ErrorKind::Corruption,
                        "overflow run at page {} extends past the end of the file",
                        page
                    );
                    rest_pages_expected = run - 1;
                    rest_size_expected = record.overflow_size().saturating_sub(PAGE_SIZE as u32);
                }
            }
        }
        check!(
            rest_pages_expected == 0,
            ErrorKind::Corruption,
            "overflow run truncated at the end of the file"
        );
        Ok(())
    }

    pub(crate) fn bitmap_bit(&self, page: u64) -> bool {
        let bitmap_page = 1 + page / PAGES_PER_BITMAP_PAGE;
        let bit = (page % PAGES_PER_BITMAP_PAGE) as usize;
        let offset = bitmap_page as usize * PAGE_SIZE + bit / 8;
        self.map[offset] & (1 << (bit % 8)) != 0
    }

    /// Closes the pager, surfacing deferred write errors. Dropping a
    /// `Pager` without calling this skips the final error check.
    pub fn close(self) -> Result<()> {
        let Self { file, map, .. } = self;
        drop(map);
        file.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_small(dir: &tempfile::TempDir) -> Pager {
        Pager::open(dir.path().join("pages.db")).unwrap()
    }

    #[test]
    fn bootstrap_creates_sized_file() {
        let dir = tempdir().unwrap();
        let pager = open_small(&dir);

        assert_eq!(pager.page_count(), 16);
        assert_eq!(pager.pages_per_section(), DEFAULT_PAGES_PER_SECTION);
        assert_eq!(
            std::fs::metadata(pager.path()).unwrap().len(),
            DEFAULT_INITIAL_SIZE
        );
    }

    #[test]
    fn bootstrap_marks_header_bitmap_and_metadata_pages() {
        let dir = tempdir().unwrap();
        let pager = open_small(&dir);

        let txn = pager.begin(TransactionKind::Read).unwrap();
        for page in [0u64, 1, 15] {
            assert!(pager.bitmap_bit(page), "page {page} should be busy");
            let (_, flags) = txn.page_metadata(page).unwrap();
            assert_eq!(flags, FLAG_SINGLE | FLAG_METADATA);
        }
        for page in 2..15u64 {
            assert!(!pager.bitmap_bit(page), "page {page} should be free");
        }
    }

    #[test]
    fn fresh_file_passes_verify() {
        let dir = tempdir().unwrap();
        let pager = open_small(&dir);

        pager.verify().unwrap();
    }

    #[test]
    fn reopen_preserves_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        Pager::open(&path).unwrap().close().unwrap();

        let pager = Pager::open(&path).unwrap();
        assert_eq!(pager.page_count(), 16);
        pager.verify().unwrap();
    }

    #[test]
    fn open_rejects_section_geometry_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        Pager::open(&path).unwrap().close().unwrap();

        let err = Pager::open_with(
            &path,
            PagerOptions {
                pages_per_section: 512,
                ..PagerOptions::default()
            },
        )
        .unwrap_err();

        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Corruption));
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        Pager::open(&path).unwrap().close().unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(DEFAULT_INITIAL_SIZE - 100).unwrap();
        drop(file);

        let err = Pager::open(&path).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Corruption));
    }

    #[test]
    fn open_rejects_tampered_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        Pager::open(&path).unwrap().close().unwrap();
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_all(b"XXXXXXXX").unwrap();
        }

        let err = Pager::open(&path).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::Corruption));
    }

    #[test]
    fn options_validation() {
        let dir = tempdir().unwrap();

        let err = Pager::open_with(
            dir.path().join("a.db"),
            PagerOptions {
                pages_per_section: 1,
                ..PagerOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidArgument));

        let err = Pager::open_with(
            dir.path().join("b.db"),
            PagerOptions {
                initial_size: 4096,
                ..PagerOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidArgument));

        // too small to hold the bootstrap pages plus any payload
        let err = Pager::open_with(
            dir.path().join("c.db"),
            PagerOptions {
                initial_size: 2 * PAGE_SIZE as u64,
                ..PagerOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn small_sections_place_metadata_per_range() {
        let dir = tempdir().unwrap();
        let pager = Pager::open_with(
            dir.path().join("pages.db"),
            PagerOptions {
                pages_per_section: 8,
                ..PagerOptions::default()
            },
        )
        .unwrap();

        // two full 8-page ranges: metadata pages at 7 and 15
        for page in [0u64, 1, 7, 15] {
            assert!(pager.bitmap_bit(page));
        }
        for page in [2u64, 6, 8, 14] {
            assert!(!pager.bitmap_bit(page));
        }
        pager.verify().unwrap();
    }

    #[test]
    fn prefetch_clamps_to_file_bounds() {
        let dir = tempdir().unwrap();
        let pager = open_small(&dir);

        pager.prefetch(0, 1000);
        pager.prefetch(1000, 1);
    }
}
