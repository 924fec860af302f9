//! # Transaction Envelope
//!
//! A [`Transaction`] is the only way to read or change pages. Read
//! transactions resolve every page straight from the mapping. Write
//! transactions additionally own a *dirty set*: copy-on-write buffers, one
//! per pinned page run, keyed by the run's first page. Commit writes the
//! dirty buffers back with positional writes and fsyncs the file; dropping
//! a transaction discards them.
//!
//! ## Visibility
//!
//! Within one transaction, `get_page` after `modify_page` observes the
//! dirty copy. Readers that begin after a commit returns observe all of
//! that commit's pages; readers that began before it are not guaranteed a
//! snapshot. At most one write transaction exists at a time, enforced by
//! the pager's writer mutex held for the transaction's lifetime.
//!
//! ## Handles
//!
//! [`Page`] and [`PageMut`] expose `{page_num, overflow_size, data}`. For
//! an overflow page `data` spans the remaining pages of the run, so a
//! value can be read or written through one contiguous slice; for single
//! pages `overflow_size` is 0 and `data` is exactly one page.
//!
//! The borrow checker keeps handles honest: a `PageMut` borrows the
//! transaction mutably, so no stale handle can survive a later
//! modification, and neither kind of handle can outlive its transaction.

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::MutexGuard;

use crate::error::ErrorKind;
use crate::meta::{
    metadata_location, overflow_run_pages, PageMetadata, METADATA_RECORD_SIZE,
};
use crate::pager::Pager;
use crate::PAGE_SIZE;

/// Whether a transaction may modify pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read,
    Write,
}

/// A read-only view of a page run.
#[derive(Debug)]
pub struct Page<'a> {
    pub page_num: u64,
    /// User-visible byte length of the value stored here; 0 for a single
    /// page.
    pub overflow_size: u32,
    pub data: &'a [u8],
}

impl Page<'_> {
    /// The value bytes: `overflow_size` bytes for an overflow run, the
    /// whole page otherwise.
    pub fn value(&self) -> &[u8] {
        if self.overflow_size == 0 {
            self.data
        } else {
            &self.data[..self.overflow_size as usize]
        }
    }
}

/// A writable view of a pinned page run.
#[derive(Debug)]
pub struct PageMut<'a> {
    pub page_num: u64,
    pub overflow_size: u32,
    pub data: &'a mut [u8],
}

impl PageMut<'_> {
    pub fn value_mut(&mut self) -> &mut [u8] {
        if self.overflow_size == 0 {
            self.data
        } else {
            &mut self.data[..self.overflow_size as usize]
        }
    }
}

pub struct Transaction<'p> {
    pager: &'p Pager,
    guard: Option<MutexGuard<'p, ()>>,
    /// Copy-on-write buffers keyed by the first page of the pinned run.
    dirty: HashMap<u64, Box<[u8]>>,
    /// Continuation pages of pinned runs, mapped to the run's first page.
    covered: HashMap<u64, u64>,
    extended: bool,
}

impl<'p> Transaction<'p> {
    pub(crate) fn new(pager: &'p Pager, guard: Option<MutexGuard<'p, ()>>) -> Self {
        Self {
            pager,
            guard,
            dirty: HashMap::new(),
            covered: HashMap::new(),
            extended: false,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        if self.guard.is_some() {
            TransactionKind::Write
        } else {
            TransactionKind::Read
        }
    }

    pub(crate) fn pager(&self) -> &'p Pager {
        self.pager
    }

    pub(crate) fn mark_extended(&mut self) {
        self.extended = true;
    }

    pub(crate) fn check_writable(&self, op: &str) -> Result<()> {
        check!(
            self.guard.is_some(),
            ErrorKind::InvalidState,
            "{} requires a write transaction",
            op
        );
        Ok(())
    }

    pub(crate) fn check_page_bounds(&self, page_num: u64) -> Result<()> {
        check!(
            page_num < self.pager.header.number_of_pages(),
            ErrorKind::InvalidArgument,
            "page {} out of bounds (page_count={})",
            page_num,
            self.pager.header.number_of_pages()
        );
        Ok(())
    }

    /// A single page's bytes as this transaction sees them: the dirty copy
    /// when the page is pinned, the mapping otherwise.
    pub(crate) fn raw_page(&self, page_num: u64) -> &[u8] {
        if let Some(buf) = self.dirty.get(&page_num) {
            return &buf[..PAGE_SIZE];
        }
        if let Some(&start) = self.covered.get(&page_num) {
            let offset = (page_num - start) as usize * PAGE_SIZE;
            return &self.dirty[&start][offset..offset + PAGE_SIZE];
        }
        let offset = page_num as usize * PAGE_SIZE;
        &self.pager.map[offset..offset + PAGE_SIZE]
    }

    /// Loads `(overflow_size, flags)` for a page without pinning anything.
    ///
    /// This is deliberately the only metadata path used by `modify_page`:
    /// metadata updates go through `modify_page` on the metadata page
    /// itself, and looking metadata up read-only here keeps that from
    /// recursing.
    pub(crate) fn page_metadata(&self, page_num: u64) -> Result<(u32, u8)> {
        let header = &self.pager.header;
        let loc = metadata_location(
            header.number_of_pages(),
            header.pages_per_metadata_section(),
            page_num,
        );
        let offset = loc.index * METADATA_RECORD_SIZE;
        let page = self.raw_page(loc.page);
        let record = PageMetadata::from_bytes(&page[offset..offset + METADATA_RECORD_SIZE])
            .wrap_err_with(|| format!("failed to load metadata record for page {page_num}"))?;
        check!(
            !record.has_unknown_flags(),
            ErrorKind::Corruption,
            "page {} carries unknown metadata flags {:#04x}",
            page_num,
            record.flags()
        );
        Ok((record.overflow_size(), record.flags()))
    }

    /// Reads a page (or the remainder of its overflow run).
    pub fn get_page(&self, page_num: u64) -> Result<Page<'_>> {
        self.check_page_bounds(page_num)?;
        let (overflow_size, _) = self.page_metadata(page_num)?;
        let run_pages = overflow_run_pages(overflow_size);
        check!(
            page_num + run_pages <= self.pager.header.number_of_pages(),
            ErrorKind::Corruption,
            "overflow run {}..{} extends past the end of the file",
            page_num,
            page_num + run_pages
        );

        let byte_len = run_pages as usize * PAGE_SIZE;
        let data: &[u8] = if let Some(buf) = self.dirty.get(&page_num) {
            &buf[..byte_len.min(buf.len())]
        } else if let Some(&start) = self.covered.get(&page_num) {
            let buf = &self.dirty[&start];
            let offset = (page_num - start) as usize * PAGE_SIZE;
            &buf[offset..(offset + byte_len).min(buf.len())]
        } else {
            let offset = page_num as usize * PAGE_SIZE;
            &self.pager.map[offset..offset + byte_len]
        };

        Ok(Page {
            page_num,
            overflow_size,
            data,
        })
    }

    /// Ensures the run containing `page_num` is pinned in the dirty set and
    /// returns the run's first page plus the byte offset of `page_num`
    /// within the buffer.
    ///
    /// A page freed and re-allocated with a different run length inside one
    /// transaction can leave the dirty set with a buffer that no longer
    /// covers the whole run; in that case the pinned run is rebuilt, and
    /// any previously pinned run it overlaps is absorbed so no page is ever
    /// backed by two dirty buffers.
    fn pin_run(&mut self, page_num: u64, run_pages: u64) -> Result<(u64, usize)> {
        let start = match self.covered.get(&page_num) {
            Some(&start) => start,
            None => page_num,
        };
        let offset = (page_num - start) as usize * PAGE_SIZE;
        let mut end = page_num + run_pages;

        if let Some(buf) = self.dirty.get(&start) {
            let pinned_end = start + (buf.len() / PAGE_SIZE) as u64;
            if pinned_end >= end {
                return Ok((start, offset));
            }
            end = end.max(pinned_end);
        }

        // absorb every already-pinned run overlapping [start, end)
        loop {
            let mut grew = false;
            for page in start..end {
                if let Some(buf) = self.dirty.get(&page) {
                    let pinned_end = page + (buf.len() / PAGE_SIZE) as u64;
                    if pinned_end > end {
                        end = pinned_end;
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }

        let total = (end - start) as usize;
        let mut merged = vec![0u8; total * PAGE_SIZE];
        for i in 0..total {
            merged[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
                .copy_from_slice(self.raw_page(start + i as u64));
        }

        for page in start..end {
            if page != start {
                self.dirty.remove(&page);
            }
            self.covered.remove(&page);
        }
        self.dirty.insert(start, merged.into_boxed_slice());
        for page in start + 1..end {
            self.covered.insert(page, start);
        }
        Ok((start, offset))
    }

    /// Pins a writable copy of the page's run and returns it. Calling this
    /// twice for the same page yields the same buffer.
    pub fn modify_page(&mut self, page_num: u64) -> Result<PageMut<'_>> {
        self.check_writable("modify_page")?;
        self.check_page_bounds(page_num)?;
        let (overflow_size, _) = self.page_metadata(page_num)?;
        let run_pages = overflow_run_pages(overflow_size);
        check!(
            page_num + run_pages <= self.pager.header.number_of_pages(),
            ErrorKind::Corruption,
            "overflow run {}..{} extends past the end of the file",
            page_num,
            page_num + run_pages
        );

        let (start, offset) = self.pin_run(page_num, run_pages)?;
        let byte_len = run_pages as usize * PAGE_SIZE;
        let buf = match self.dirty.get_mut(&start) {
            Some(buf) => buf,
            None => fail!(
                ErrorKind::InvalidState,
                "dirty run starting at page {} disappeared",
                start
            ),
        };
        let end = (offset + byte_len).min(buf.len());
        Ok(PageMut {
            page_num,
            overflow_size,
            data: &mut buf[offset..end],
        })
    }

    /// Writes the dirty set back, then fsyncs. The transaction is consumed
    /// whether the commit succeeds or not; on failure the durable state is
    /// indeterminate and the caller should reopen and [`Pager::verify`].
    pub fn commit(self) -> Result<()> {
        if self.guard.is_none() {
            return Ok(());
        }

        let mut starts: Vec<u64> = self.dirty.keys().copied().collect();
        starts.sort_unstable();
        for &start in &starts {
            let buf = &self.dirty[&start];
            self.pager
                .file
                .write_at(start * PAGE_SIZE as u64, buf)
                .wrap_err_with(|| format!("failed to write dirty run starting at page {start}"))?;
        }

        self.pager
            .file
            .sync_data()
            .wrap_err("failed to fsync data file at commit")?;
        if self.extended {
            self.pager
                .file
                .sync_parent()
                .wrap_err("failed to fsync parent directory after file extension")?;
        }
        Ok(())
    }

    /// Discards the transaction. Uncommitted modifications are dropped;
    /// equivalent to letting the transaction fall out of scope.
    pub fn close(self) {}
}
