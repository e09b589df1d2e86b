//! # Database
//!
//! [`Database`] owns the file: the memory map, the two meta pages, the
//! freelist, and the locks that serialize writers and remaps. Handles are
//! cheap clones over shared state and safe to use from many threads; each
//! thread opens its own transactions.
//!
//! ## Opening
//!
//! A missing file is formatted first: meta pages at ids 0 and 1 (with
//! transaction ids 0 and 1, so the higher-txid rule picks a deterministic
//! initial meta), an empty freelist page at id 2, an empty root leaf at id 3,
//! and a high-water mark of 4. An existing file must carry at least one meta
//! page with a valid magic, version, and checksum; either slot may be the
//! good one, so a single torn or corrupted meta is survivable.
//!
//! ## Freelist persistence
//!
//! The freelist page is rewritten on every commit unless `no_freelist_sync`
//! is set, in which case the meta records a sentinel and the next open
//! rebuilds the freelist by walking every reachable page. When an instance
//! that wants a synced freelist opens a database left in the sentinel state,
//! it commits one empty write transaction to materialize the freelist on
//! disk.
//!
//! ## Concurrency
//!
//! One writer, many readers. `begin_rw` blocks on the writer mutex. Readers
//! hold the shared side of the remap latch for their lifetime, so a commit
//! that must grow the map waits for them; opening a write transaction while
//! holding a read transaction on the same thread can therefore deadlock on
//! growth, exactly like the classic single-file stores this follows. Size
//! `initial_mmap_size` generously when long readers and a growing writer
//! must overlap.

pub(crate) mod transaction;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Error;
use crate::storage::{
    Freelist, Meta, MmapFile, Page, PageHeader, PageId, PageType, TxnId, BUCKET_LEAF_FLAG,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, META_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE,
    PGID_NO_FREELIST,
};
use crate::tree::bucket::BucketHeader;

pub use transaction::{Transaction, TxStats};

/// Open-time configuration, builder style.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum time to wait for the host's file lock; `None` waits forever.
    /// The core does not acquire platform locks itself; the embedding layer
    /// reads this.
    pub(crate) timeout: Option<Duration>,
    pub(crate) no_grow_sync: bool,
    pub(crate) no_freelist_sync: bool,
    pub(crate) read_only: bool,
    pub(crate) mmap_populate: bool,
    pub(crate) initial_mmap_size: usize,
    pub(crate) page_size: usize,
    pub(crate) no_sync: bool,
}

impl Options {
    pub fn new() -> Self {
        Self {
            timeout: None,
            no_grow_sync: false,
            no_freelist_sync: false,
            read_only: false,
            mmap_populate: false,
            initial_mmap_size: 0,
            page_size: DEFAULT_PAGE_SIZE,
            no_sync: false,
        }
    }

    /// Maximum time the embedding layer should wait for the file lock.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skip the fsync after growing the file. The data fsync at commit still
    /// runs; metadata of the final size may lag after a crash.
    pub fn no_grow_sync(mut self, v: bool) -> Self {
        self.no_grow_sync = v;
        self
    }

    /// Do not persist the freelist; the next open rebuilds it by scanning.
    /// Commits get cheaper, opens get more expensive.
    pub fn no_freelist_sync(mut self, v: bool) -> Self {
        self.no_freelist_sync = v;
        self
    }

    /// Open without write access; write transactions fail with
    /// [`Error::DatabaseReadOnly`].
    pub fn read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    /// Pre-fault the mapping at open (`MAP_POPULATE` where available).
    pub fn mmap_populate(mut self, v: bool) -> Self {
        self.mmap_populate = v;
        self
    }

    /// Floor for the first mapping length. A generous value lets a growing
    /// writer avoid remaps that would wait on open readers.
    pub fn initial_mmap_size(mut self, bytes: usize) -> Self {
        self.initial_mmap_size = bytes;
        self
    }

    /// Page size used when *creating* a database; existing files keep the
    /// size they were created with. Must be a power of two in `[512, 65536]`.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Skip both fsyncs at commit, trading durability for throughput. A
    /// crash can lose recent commits but never corrupts the file structure.
    pub fn no_sync(mut self, v: bool) -> Self {
        self.no_sync = v;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Database> {
        Database::open_with(path.as_ref(), self)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) page_size: usize,
    pub(crate) mmap: RwLock<MmapFile>,
    /// Serializes write transactions.
    pub(crate) writer: Mutex<()>,
    /// Transaction ids of open read transactions, for freelist release.
    pub(crate) readers: Mutex<Vec<TxnId>>,
    pub(crate) freelist: Mutex<Freelist>,
}

/// An embedded, single-file, transactional key/value store. Cloning is cheap
/// and every clone refers to the same open database.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens (creating if absent) a database with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Database> {
        Options::new().open(path)
    }

    /// Builder entry point: `Database::options().page_size(8192).open(path)`.
    pub fn options() -> Options {
        Options::new()
    }

    fn open_with(path: &Path, options: Options) -> Result<Database> {
        if !path.exists() {
            ensure!(
                !options.read_only,
                "cannot create database '{}' in read-only mode",
                path.display()
            );
            init_file(path, options.page_size)?;
            info!(path = %path.display(), page_size = options.page_size, "created database file");
        }

        let file_len = std::fs::metadata(path)
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(file_len >= (2 * MIN_PAGE_SIZE) as u64, Error::Corrupted);

        let page_size = detect_page_size(path, &options)?;
        let min_size = file_len.max(options.initial_mmap_size as u64);
        let mmap = MmapFile::open(
            path,
            page_size,
            min_size,
            !options.read_only,
            options.mmap_populate,
            !options.no_grow_sync,
        )?;

        let meta = load_meta(&mmap)?;
        ensure!(meta.page_size() as usize == page_size, Error::Invalid);
        ensure!(meta.pgid() * page_size as u64 <= mmap.len(), Error::Corrupted);

        let mut freelist = Freelist::new();
        let mut materialize_freelist = false;
        if meta.freelist() == PGID_NO_FREELIST {
            if !options.read_only {
                freelist = rebuild_freelist(&mmap, &meta)?;
                materialize_freelist = !options.no_freelist_sync;
                debug!(
                    free = freelist.free_count(),
                    "rebuilt freelist from reachability scan"
                );
            }
        } else {
            let overflow = Page::from_buf(mmap.page(meta.freelist())?)?.overflow();
            let run = mmap.page_run(meta.freelist(), 1 + overflow as usize)?;
            freelist.read(Page::from_buf(run)?)?;
        }

        let db = Database {
            inner: Arc::new(DbInner {
                path: path.to_path_buf(),
                options,
                page_size,
                mmap: RwLock::new(mmap),
                writer: Mutex::new(()),
                readers: Mutex::new(Vec::new()),
                freelist: Mutex::new(freelist),
            }),
        };

        // the previous instance never persisted its freelist; write one now
        // so future opens skip the scan
        if materialize_freelist {
            db.begin_rw()?.commit()?;
        }

        info!(path = %db.inner.path.display(), txid = meta.txid(), "opened database");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    /// Begins a read transaction: a consistent snapshot as of the current
    /// meta. Many may be open at once.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let guard = self.inner.mmap.read();
        // sample the meta and register under one lock, so a committing
        // writer either sees this reader or is seen by it, never neither
        let mut readers = self.inner.readers.lock();
        let meta = load_meta(&guard)?;
        readers.push(meta.txid());
        drop(readers);
        Ok(Transaction::new_read(&self.inner, meta, guard))
    }

    /// Begins the write transaction, blocking while another one is open.
    /// See the module docs for the same-thread growth caveat.
    pub fn begin_rw(&self) -> Result<Transaction<'_>> {
        ensure!(!self.inner.options.read_only, Error::DatabaseReadOnly);
        let writer = self.inner.writer.lock();
        let guard = self.inner.mmap.upgradable_read();
        let meta = load_meta(&guard)?;
        Ok(Transaction::new_write(&self.inner, meta, guard, writer))
    }

    /// Runs `f` inside a read transaction, closing it on every exit path.
    pub fn view<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin()?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// Runs `f` inside a write transaction: commits when `f` succeeds, rolls
    /// back when it fails.
    pub fn update<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin_rw()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Forces an fsync of the file. Useful under `no_sync` to bound loss.
    pub fn sync(&self) -> Result<()> {
        self.inner.mmap.read().sync_data()
    }
}

/// Formats an empty database: two meta pages, an empty freelist page, and an
/// empty root leaf.
fn init_file(path: &Path, page_size: usize) -> Result<()> {
    ensure!(
        page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
        "invalid page size {}: must be a power of two in [{}, {}]",
        page_size,
        MIN_PAGE_SIZE,
        MAX_PAGE_SIZE
    );

    let mut buf = vec![0u8; page_size * 4];
    for (slot, txid) in [(0u64, 0u64), (1, 1)] {
        let off = slot as usize * page_size;
        PageHeader::new(slot, PageType::Meta).write_to(&mut buf[off..])?;
        let mut meta = Meta::new(page_size as u32);
        meta.set_root(3, 0);
        meta.set_freelist(2);
        meta.set_pgid(4);
        meta.set_txid(txid);
        meta.update_checksum();
        meta.write_to(&mut buf[off + PAGE_HEADER_SIZE..])?;
    }
    PageHeader::new(2, PageType::Freelist).write_to(&mut buf[2 * page_size..])?;
    PageHeader::new(3, PageType::Leaf).write_to(&mut buf[3 * page_size..])?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// Determines the page size of an existing file. Meta 0 lives at a fixed
/// offset regardless of page size; if it is damaged, its page-size field,
/// the configured size, and the default are each tried against meta 1.
fn detect_page_size(path: &Path, options: &Options) -> Result<usize> {
    let mut file = File::open(path)
        .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;
    let file_len = file.metadata()?.len();

    let head_len = 4096.min(file_len as usize);
    ensure!(head_len >= PAGE_HEADER_SIZE + META_SIZE, Error::Corrupted);
    let mut head = vec![0u8; head_len];
    file.read_exact(&mut head)?;

    let meta0 = Meta::from_bytes(&head[PAGE_HEADER_SIZE..])?;
    if meta0.validate().is_ok() {
        return Ok(meta0.page_size() as usize);
    }

    let candidates = [
        meta0.page_size() as usize,
        options.page_size,
        DEFAULT_PAGE_SIZE,
    ];
    for ps in candidates {
        if !ps.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) {
            continue;
        }
        if (ps + PAGE_HEADER_SIZE + META_SIZE) as u64 > file_len {
            continue;
        }
        let mut buf = vec![0u8; PAGE_HEADER_SIZE + META_SIZE];
        file.seek(SeekFrom::Start(ps as u64))?;
        file.read_exact(&mut buf)?;
        if PageHeader::from_bytes(&buf)?.page_type() != PageType::Meta {
            continue;
        }
        let meta1 = Meta::from_bytes(&buf[PAGE_HEADER_SIZE..])?;
        if meta1.validate().is_ok() {
            return Ok(meta1.page_size() as usize);
        }
    }

    bail!(Error::Invalid)
}

/// Picks the current meta: the one with the higher transaction id among the
/// checksum-valid pair. One damaged slot is survivable; two are fatal.
pub(crate) fn load_meta(mmap: &MmapFile) -> Result<Meta> {
    let read_slot = |pgid: PageId| -> Result<Meta> {
        let page = Page::from_buf(mmap.page(pgid)?)?;
        let meta = page.meta()?;
        meta.validate()?;
        Ok(*meta)
    };

    match (read_slot(0), read_slot(1)) {
        (Ok(a), Ok(b)) => Ok(if a.txid() > b.txid() { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(e), Err(_)) => Err(e.wrap_err("both meta pages are invalid")),
    }
}

/// Reconstructs the freelist by walking every page reachable from the root
/// bucket: whatever is unreachable below the high-water mark is free.
fn rebuild_freelist(mmap: &MmapFile, meta: &Meta) -> Result<Freelist> {
    mmap.prefetch_pages(0, meta.pgid() as usize);

    let mut reachable: HashSet<PageId> = HashSet::new();
    reachable.insert(0);
    reachable.insert(1);
    mark_tree(mmap, meta.root_pgid(), &mut reachable)?;

    let free = (2..meta.pgid())
        .filter(|id| !reachable.contains(id))
        .collect();
    Ok(Freelist::with_free(free))
}

fn mark_tree(mmap: &MmapFile, pgid: PageId, reachable: &mut HashSet<PageId>) -> Result<()> {
    let overflow = Page::from_buf(mmap.page(pgid)?)?.overflow();
    for id in pgid..=pgid + overflow as u64 {
        reachable.insert(id);
    }

    let page = Page::from_buf(mmap.page_run(pgid, 1 + overflow as usize)?)?;
    if page.is_branch() {
        for i in 0..page.count() {
            mark_tree(mmap, page.branch_pgid(i)?, reachable)?;
        }
    } else if page.is_leaf() {
        for i in 0..page.count() {
            let (_, value, flags) = page.leaf_entry(i)?;
            if flags & BUCKET_LEAF_FLAG != 0 {
                let header = BucketHeader::from_bytes(value)?;
                if header.root() != 0 {
                    mark_tree(mmap, header.root(), reachable)?;
                }
            }
        }
    } else {
        bail!(Error::Corrupted);
    }
    Ok(())
}
