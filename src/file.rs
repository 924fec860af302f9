//! # Platform File Primitives
//!
//! This module wraps the small set of filesystem operations the page store
//! needs: create-or-open with durable directory entries, explicit
//! preallocation, positional writes and a read-only shared mapping.
//!
//! ## Durability Model
//!
//! POSIX filesystems give no ordering guarantees between a file's data and
//! the directory entries naming it. Creating a file or growing it therefore
//! pairs the operation with an fsync of the parent directory, so that a
//! crash cannot leave a committed database unreachable by name.
//!
//! ## Read Path vs. Write Path
//!
//! Reads go through a read-only `mmap` of the file: zero copies, and the OS
//! page cache does the caching. Writes never touch the mapping; they use
//! positional `write` calls followed by fsync. On some platforms a writable
//! mapping and positional writes on the same file are not cache-coherent,
//! so the split keeps the read path guaranteed to observe what the writer
//! synced.
//!
//! ## Preallocation
//!
//! The file is grown with an explicit preallocation primitive
//! (`posix_fallocate` on Linux) rather than `ftruncate`, so the blocks
//! backing every page exist up front and a later page write cannot fail
//! with an out-of-space error in the middle of a commit.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use crate::error::{io_error, ErrorKind};

/// An open page file plus the path it was opened at.
///
/// The path is retained for error context and for locating the parent
/// directory when a durability barrier on the directory entry is needed.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    path: PathBuf,
}

impl DataFile {
    /// Opens the file at `path`, creating it (and any missing intermediate
    /// directories, with owner-only permissions) if necessary.
    ///
    /// Every directory created and the file creation itself are followed by
    /// an fsync of the containing directory.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        check!(
            !path.as_os_str().is_empty(),
            ErrorKind::InvalidArgument,
            "empty data file path"
        );
        if path.is_dir() {
            fail!(
                ErrorKind::NotAFile,
                "'{}' is a directory, not a data file",
                path.display()
            );
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_missing_directories(parent)?;
            }
        }

        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(io_error)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let data_file = Self {
            file,
            path: path.to_path_buf(),
        };
        if !existed {
            data_file.sync_parent()?;
        }
        Ok(data_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(io_error)
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?;
        Ok(metadata.len())
    }

    /// Grows the file to at least `len` bytes using explicit preallocation.
    ///
    /// Returns whether the file actually grew; calling this on a file that
    /// is already large enough is a no-op. Growth is followed by an fsync
    /// of the file and of the parent directory.
    pub fn ensure_minimum_size(&self, len: u64) -> Result<bool> {
        if self.len()? >= len {
            return Ok(false);
        }

        self.preallocate(len)
            .wrap_err_with(|| format!("failed to preallocate '{}' to {} bytes", self.path.display(), len))?;
        self.file
            .sync_all()
            .map_err(io_error)
            .wrap_err_with(|| format!("failed to fsync '{}' after preallocation", self.path.display()))?;
        self.sync_parent()?;
        Ok(true)
    }

    #[cfg(target_os = "linux")]
    fn preallocate(&self, len: u64) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        loop {
            let rc = unsafe { libc::posix_fallocate(self.file.as_raw_fd(), 0, len as libc::off_t) };
            if rc == 0 {
                return Ok(());
            }
            // posix_fallocate reports errors by return value, not errno
            if rc == libc::EINTR {
                continue;
            }
            return Err(io_error(io::Error::from_raw_os_error(rc)));
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn preallocate(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(io_error)
    }

    /// Positional write of the whole buffer at `offset`.
    ///
    /// Retries on signal interruption and loops on short writes until every
    /// byte is on its way to the file.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let mut written = 0usize;
        while written < buf.len() {
            match self.file.write_at(&buf[written..], offset + written as u64) {
                Ok(0) => fail!(
                    ErrorKind::Io,
                    "write to '{}' at offset {} returned zero bytes",
                    self.path.display(),
                    offset + written as u64
                ),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(io_error(e)).wrap_err_with(|| {
                        format!(
                            "failed to write {} bytes at offset {} in '{}'",
                            buf.len(),
                            offset,
                            self.path.display()
                        )
                    })
                }
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;

        let mut written = 0usize;
        while written < buf.len() {
            match self.file.seek_write(&buf[written..], offset + written as u64) {
                Ok(0) => fail!(
                    ErrorKind::Io,
                    "write to '{}' at offset {} returned zero bytes",
                    self.path.display(),
                    offset + written as u64
                ),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(io_error(e)).wrap_err_with(|| {
                        format!(
                            "failed to write {} bytes at offset {} in '{}'",
                            buf.len(),
                            offset,
                            self.path.display()
                        )
                    })
                }
            }
        }
        Ok(())
    }

    /// Flushes file data to stable storage (the commit barrier).
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(io_error)
            .wrap_err_with(|| format!("failed to fsync '{}'", self.path.display()))
    }

    /// Flushes the directory entry naming this file.
    pub fn sync_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fsync_dir(parent),
            _ => fsync_dir(Path::new(".")),
        }
    }

    /// Creates a read-only shared mapping of the first `len` bytes.
    pub fn map(&self, len: u64) -> Result<Mmap> {
        // SAFETY: mapping a file is unsafe because external mutation of the
        // file would be visible through the map. This is safe because:
        // 1. The pager is the only writer of the file within the process,
        //    and page files are not meant to be modified externally.
        // 2. The mapping is read-only; nothing in this crate writes through
        //    it, so writes always go through the explicit write path.
        // 3. The mapping's lifetime is tied to the Pager that owns both it
        //    and the file handle.
        let map = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map(&self.file)
                .map_err(io_error)
                .wrap_err_with(|| format!("failed to memory-map '{}'", self.path.display()))?
        };
        Ok(map)
    }

    /// Closes the file, surfacing deferred write errors reported by the
    /// filesystem at sync/close time.
    pub fn close(self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(io_error)
            .wrap_err_with(|| format!("failed to flush '{}' at close", self.path.display()))
    }
}

/// Creates every missing directory on the way to `dir`, deepest last, each
/// with owner-only permissions and followed by an fsync of its parent.
fn create_missing_directories(dir: &Path) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = dir;
    while !cursor.exists() {
        missing.push(cursor.to_path_buf());
        match cursor.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => cursor = parent,
            _ => break,
        }
    }

    for dir in missing.iter().rev() {
        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        match builder.create(dir) {
            Ok(()) => {}
            // another thread or process may have raced us to it
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(io_error(e))
                    .wrap_err_with(|| format!("failed to create directory '{}'", dir.display()))
            }
        }
        match dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fsync_dir(parent)?,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)
        .map_err(io_error)
        .wrap_err_with(|| format!("failed to open directory '{}' for fsync", dir.display()))?;
    handle
        .sync_all()
        .map_err(io_error)
        .wrap_err_with(|| format!("failed to fsync directory '{}'", dir.display()))
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    // directory entries cannot be fsynced portably off unix
    Ok(())
}
