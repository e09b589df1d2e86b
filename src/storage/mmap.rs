//! # Memory-Mapped File Storage
//!
//! `MmapFile` is the low-level building block for database file access: a
//! file handle plus a shared *read-only* memory map over it. All page reads
//! are zero-copy slices into the map; all page writes go through positional
//! file writes (`write_page`), which the kernel keeps coherent with a
//! `MAP_SHARED` mapping of the same file.
//!
//! ## Why a read-only map
//!
//! Readers and the writer share the same mapping. Because the writer never
//! stores through the map, a reader can never observe a half-written page
//! through it until the committing transaction has finished its positional
//! writes and made them authoritative by publishing a new meta page. The
//! mapping is just a window; durability ordering is controlled entirely by
//! `write_page` + `sync_data`.
//!
//! ## Remapping
//!
//! Growth invalidates the mapping, so `grow` takes `&mut self` and the
//! database wraps `MmapFile` in a reader/writer latch: read transactions
//! hold the shared side for their whole lifetime, a growing commit takes the
//! exclusive side. The compiler and the latch together guarantee no page
//! slice outlives the mapping it points into.
//!
//! ## Sizing
//!
//! The mapped length doubles from 32 KiB up to 1 GiB, then grows in 1 GiB
//! steps, capped at 256 TiB, and is always rounded to a whole multiple of
//! the page size. The file is extended to the mapped length up front so a
//! page fault inside the map can never hit EOF.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};
use tracing::debug;

use crate::error::Error;

use super::{PageId, MAX_MAP_SIZE, MAX_MMAP_STEP};

#[derive(Debug)]
pub(crate) struct MmapFile {
    file: File,
    mmap: Mmap,
    len: u64,
    page_size: usize,
    writable: bool,
    populate: bool,
    grow_sync: bool,
}

impl MmapFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        min_size: u64,
        writable: bool,
        populate: bool,
        grow_sync: bool,
    ) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(file_size > 0, Error::Corrupted);
        ensure!(file_size % page_size as u64 == 0, Error::Corrupted);

        let len = if writable {
            let target = mmap_size(page_size, file_size.max(min_size))?;
            if target > file_size {
                file.set_len(target)
                    .wrap_err_with(|| format!("failed to extend file to {} bytes", target))?;
                if grow_sync {
                    file.sync_all().wrap_err("failed to sync file after growth")?;
                }
            }
            target
        } else {
            file_size
        };

        let mmap = map_shared(&file, len, populate)?;

        Ok(Self {
            file,
            mmap,
            len,
            page_size,
            writable,
            populate,
            grow_sync,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page(&self, pgid: PageId) -> Result<&[u8]> {
        self.page_run(pgid, 1)
    }

    /// Borrows `count` contiguous pages starting at `pgid`.
    pub fn page_run(&self, pgid: PageId, count: usize) -> Result<&[u8]> {
        let start = pgid
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| eyre::eyre!(Error::Corrupted))?;
        let end = start + (count * self.page_size) as u64;
        ensure!(
            end <= self.len,
            "page run {}..+{} out of bounds (mapped {} bytes)",
            pgid,
            count,
            self.len
        );
        Ok(&self.mmap[start as usize..end as usize])
    }

    /// Grows the file and remaps so at least `min_size` bytes are addressable.
    pub fn grow(&mut self, min_size: u64) -> Result<()> {
        let target = mmap_size(self.page_size, min_size)?;
        if target <= self.len {
            return Ok(());
        }

        self.file
            .set_len(target)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", target))?;
        if self.grow_sync {
            self.file
                .sync_all()
                .wrap_err("failed to sync file after growth")?;
        }

        debug!(from = self.len, to = target, "remapping database file");
        self.mmap = map_shared(&self.file, target, self.populate)?;
        self.len = target;
        Ok(())
    }

    /// Writes one dirty page run at its slot in the file. Takes `&self`: the
    /// file offset is derived from the page id, and concurrent readers only
    /// ever look at pages the current meta does not reference.
    pub fn write_page(&self, pgid: PageId, data: &[u8]) -> Result<()> {
        ensure!(self.writable, Error::DatabaseReadOnly);
        let offset = pgid * self.page_size as u64;
        ensure!(
            offset + data.len() as u64 <= self.len,
            "write of page {} past end of mapped file",
            pgid
        );
        write_all_at(&self.file, data, offset)
            .wrap_err_with(|| format!("failed to write page {}", pgid))
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to fsync database file")
    }

    pub fn prefetch_pages(&self, pgid: PageId, count: usize) {
        let start = pgid as usize * self.page_size;
        if start >= self.len as usize {
            return;
        }
        let len = (count * self.page_size).min(self.len as usize - start);

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is a hint to the kernel. This is
        // safe because:
        // 1. start was bounds-checked above (early return past the map)
        // 2. len is clamped so start + len never exceeds the mapped length
        // 3. The mapping is valid for the whole mapped length
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(start) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = len;
    }
}

fn map_shared(file: &File, len: u64, populate: bool) -> Result<Mmap> {
    let mut options = MmapOptions::new();
    options.len(len as usize);
    #[cfg(unix)]
    if populate {
        options.populate();
    }
    #[cfg(not(unix))]
    let _ = populate;

    // SAFETY: Mmap::map is unsafe because the underlying file could be
    // modified externally, invalidating the mapping's contents. This is safe
    // because:
    // 1. The database holds the file for its whole lifetime and is the only
    //    writer (single-process contract; external locking is the caller's
    //    responsibility)
    // 2. The file was extended to `len` before mapping, so no access inside
    //    the mapping faults past EOF
    // 3. The mapping is replaced, never reused, after any file growth
    // 4. All access goes through page()/page_run() which bounds-check
    unsafe {
        options
            .map(file)
            .wrap_err("failed to memory-map database file")
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Computes the mapped length for a requested size: double from 32 KiB up to
/// 1 GiB, then round up to the next 1 GiB step, always a whole multiple of
/// the page size and at most 256 TiB.
pub(crate) fn mmap_size(page_size: usize, size: u64) -> Result<u64> {
    for i in 15..=30u32 {
        if size <= 1 << i {
            return Ok(1 << i);
        }
    }

    ensure!(size <= MAX_MAP_SIZE, "mmap too large: {} bytes", size);

    let mut sz = size;
    let remainder = sz % MAX_MMAP_STEP;
    if remainder > 0 {
        sz += MAX_MMAP_STEP - remainder;
    }

    let ps = page_size as u64;
    if sz % ps != 0 {
        sz = (sz / ps + 1) * ps;
    }

    if sz > MAX_MAP_SIZE {
        sz = MAX_MAP_SIZE;
    }

    Ok(sz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageBuf, PageType, DEFAULT_PAGE_SIZE};

    fn create_file(path: &Path, pages: u64) {
        let data = vec![0u8; (pages * DEFAULT_PAGE_SIZE as u64) as usize];
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn mmap_size_doubles_below_one_gib() {
        let ps = DEFAULT_PAGE_SIZE;
        assert_eq!(mmap_size(ps, 1).unwrap(), 1 << 15);
        assert_eq!(mmap_size(ps, 1 << 15).unwrap(), 1 << 15);
        assert_eq!(mmap_size(ps, (1 << 15) + 1).unwrap(), 1 << 16);
        assert_eq!(mmap_size(ps, 1 << 20).unwrap(), 1 << 20);
        assert_eq!(mmap_size(ps, 1 << 30).unwrap(), 1 << 30);
    }

    #[test]
    fn mmap_size_steps_by_one_gib_above_one_gib() {
        let ps = DEFAULT_PAGE_SIZE;
        let gib = 1u64 << 30;
        assert_eq!(mmap_size(ps, gib + 1).unwrap(), 2 * gib);
        assert_eq!(mmap_size(ps, 3 * gib).unwrap(), 3 * gib);
        assert_eq!(mmap_size(ps, 3 * gib + 123).unwrap(), 4 * gib);
    }

    #[test]
    fn mmap_size_rejects_over_max() {
        let err = mmap_size(DEFAULT_PAGE_SIZE, MAX_MAP_SIZE + 1).unwrap_err();
        assert!(err.to_string().contains("mmap too large"));
    }

    #[test]
    fn open_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::fs::write(&path, b"").unwrap();

        let err =
            MmapFile::open(&path, DEFAULT_PAGE_SIZE, 0, true, false, true).unwrap_err();
        assert_eq!(err.downcast_ref::<crate::Error>(), Some(&crate::Error::Corrupted));
    }

    #[test]
    fn open_rejects_unaligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::fs::write(&path, vec![0u8; DEFAULT_PAGE_SIZE + 13]).unwrap();

        let err =
            MmapFile::open(&path, DEFAULT_PAGE_SIZE, 0, true, false, true).unwrap_err();
        assert_eq!(err.downcast_ref::<crate::Error>(), Some(&crate::Error::Corrupted));
    }

    #[test]
    fn page_read_is_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_file(&path, 4);
        let mmap = MmapFile::open(&path, DEFAULT_PAGE_SIZE, 0, true, false, true).unwrap();

        assert!(mmap.page(0).is_ok());
        assert!(mmap.page(mmap.len() / DEFAULT_PAGE_SIZE as u64).is_err());
    }

    #[test]
    fn write_page_is_visible_through_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_file(&path, 4);
        let mmap = MmapFile::open(&path, DEFAULT_PAGE_SIZE, 0, true, false, true).unwrap();

        let buf = PageBuf::new(DEFAULT_PAGE_SIZE, 1, 2, PageType::Leaf);
        mmap.write_page(2, buf.bytes()).unwrap();

        let page = mmap.page(2).unwrap();
        assert_eq!(&page[..16], buf.bytes()[..16].as_ref());
    }

    #[test]
    fn grow_extends_file_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_file(&path, 4);
        let mut mmap = MmapFile::open(&path, DEFAULT_PAGE_SIZE, 0, true, false, true).unwrap();
        let before = mmap.len();

        mmap.grow(before + 1).unwrap();

        assert!(mmap.len() > before);
        assert_eq!(mmap.len() % DEFAULT_PAGE_SIZE as u64, 0);
        assert!(std::fs::metadata(&path).unwrap().len() >= mmap.len());
        let last_page = mmap.len() / DEFAULT_PAGE_SIZE as u64 - 1;
        assert!(mmap.page(last_page).is_ok());
    }

    #[test]
    fn read_only_map_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_file(&path, 4);
        let mmap = MmapFile::open(&path, DEFAULT_PAGE_SIZE, 0, false, false, true).unwrap();

        let buf = PageBuf::new(DEFAULT_PAGE_SIZE, 1, 2, PageType::Leaf);
        let err = mmap.write_page(2, buf.bytes()).unwrap_err();

        assert_eq!(
            err.downcast_ref::<crate::Error>(),
            Some(&crate::Error::DatabaseReadOnly)
        );
    }
}
