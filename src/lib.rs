//! # pagestore - Embeddable Transactional Page Store
//!
//! pagestore turns a single data file into an addressable, transactional
//! space of fixed-size 8 KiB pages. It is the foundation layer an embedded
//! database builds its data structures on: trees, maps and logs all sit on
//! top of the page allocation and durability guarantees provided here.
//!
//! ## Design Philosophy
//!
//! - **Zero-copy reads**: the file is memory-mapped read-only and page reads
//!   return `&[u8]` slices pointing directly into the mapping.
//! - **Explicit writes**: modifications never go through a writable mapping.
//!   A writing transaction pins copy-on-write page buffers and commit writes
//!   them back with positional writes followed by fsync. Mixing writable
//!   mappings with positional writes is not cache-coherent on every
//!   platform, so the crate standardises on "map read-only, write
//!   explicitly".
//! - **No central metadata region**: per-page metadata lives in small
//!   sections at the end of each fixed-size page range, so payload pages
//!   keep their full power-of-two size and growing the file never relocates
//!   a global table.
//!
//! ## File Layout
//!
//! ```text
//! Page 0          File header (magic, version, geometry)
//! Pages 1..=K     Free-space bitmap, one bit per page in the file
//! ...             Payload pages
//! Last pages of   Packed 16-byte page metadata records, one per page
//! each range      in the range (the metadata pages included)
//! ```
//!
//! ## Transactions
//!
//! Readers run in parallel directly against the mapping and never block.
//! At most one writing transaction is active at a time; it accumulates a
//! dirty set of page buffers and publishes them atomically from the
//! readers' perspective at commit (write + fsync through the OS page
//! cache).
//!
//! ## Module Overview
//!
//! - [`file`]: platform file primitives (create, preallocate, map, write,
//!   directory durability barriers)
//! - [`bitmap`]: best-fit free-range search over the busy-page bitmap
//! - [`header`]: the on-disk file header
//! - [`meta`]: per-page metadata records and their O(1) placement
//! - [`pager`]: open/create, bootstrap, integrity verification
//! - [`txn`]: the transaction envelope (get/modify/allocate/free/commit)

#[macro_use]
mod macros;

mod alloc;
pub mod bitmap;
pub mod error;
pub mod file;
pub mod header;
pub mod meta;
pub mod pager;
pub mod txn;

pub use error::ErrorKind;
pub use pager::{Pager, PagerOptions};
pub use txn::{Page, PageMut, Transaction, TransactionKind};

/// Size of every page in the file, in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Default number of pages covered by one metadata section (8 GiB of
/// payload per section). Chosen so a maximal 4 GiB overflow value always
/// fits inside a single section's payload span.
pub const DEFAULT_PAGES_PER_SECTION: u64 = 1 << 20;

/// Default size of a freshly created file (16 pages), large enough for the
/// header, the initial bitmap page and the initial metadata page.
pub const DEFAULT_INITIAL_SIZE: u64 = 128 * 1024;
