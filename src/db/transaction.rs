//! # Transactions
//!
//! A [`Transaction`] is either a snapshot (read) or exclusive (write) view of
//! the database. Read transactions copy the current meta, register their
//! transaction id with the database (so the freelist defers reclaiming pages
//! they can still see), and hold the shared side of the remap latch for
//! their whole lifetime, so the map can never be pulled out from under their
//! borrowed pages. The single write transaction additionally holds the
//! writer mutex and the upgradable side of the latch, and bumps the meta's
//! transaction id by one.
//!
//! ## Commit pipeline
//!
//! 1. Rebalance every unbalanced node (merge / collapse).
//! 2. Spill: split oversize nodes, copy the whole modified path onto fresh
//!    pages, update every bucket header and `meta.root`.
//! 3. Free the old freelist page and write a new one from `free ∪ pending`
//!    (or record the no-persist sentinel under `no_freelist_sync`).
//! 4. Grow the file and remap if the high-water mark outgrew the map.
//! 5. Write every dirty page, in ascending page id order.
//! 6. fsync the data (unless `no_sync`).
//! 7. Checksum the meta and write it to slot `txid % 2`; fsync again.
//! 8. Release pending frees up to one less than the oldest open reader.
//! 9. Run commit callbacks and release the writer lock.
//!
//! Any failure before step 7 rolls the transaction back and leaves the
//! previous meta authoritative; a crash after step 7 is benign because the
//! new meta is already durable and the freelist is rebuilt from it.
//!
//! Transactions are single-threaded objects: interior state sits behind a
//! `RefCell`, handles ([`crate::Bucket`], [`crate::Cursor`]) borrow the
//! transaction and take `&self`. Values handed out are owned copies, valid
//! beyond any internal borrow.

use std::cell::RefCell;

use eyre::{ensure, eyre, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{MutexGuard, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::db::DbInner;
use crate::error::Error;
use crate::storage::{
    Freelist, Meta, MmapFile, Page, PageBuf, PageId, PageType, TxnId, MAX_ALLOC_SIZE,
    PAGE_HEADER_SIZE, PGID_NO_FREELIST,
};
use crate::tree::bucket::{Bucket, BucketData, BucketHeader, BUCKET_HEADER_SIZE};
use crate::tree::cursor::BucketsCursor;

/// Counters for one transaction's write-path work.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxStats {
    /// Pages allocated, in pages.
    pub page_count: u64,
    /// Pages allocated, in bytes.
    pub page_alloc: u64,
    /// Nodes materialized.
    pub node_count: u64,
    /// Rebalance passes over a node.
    pub rebalance: u64,
    /// Node splits performed during spill.
    pub split: u64,
    /// Nodes written to dirty pages.
    pub spill: u64,
}

pub(crate) struct TxInner {
    pub(crate) writable: bool,
    pub(crate) closed: bool,
    pub(crate) meta: Meta,
    pub(crate) page_size: usize,
    /// Dirty page runs by first page id, written at commit in ascending order.
    pub(crate) pages: HashMap<PageId, PageBuf>,
    /// Bucket arena; index 0 is the root bucket.
    pub(crate) buckets: Vec<BucketData>,
    pub(crate) stats: TxStats,
    pub(crate) handlers: Vec<Box<dyn FnOnce()>>,
}

impl TxInner {
    fn new(writable: bool, meta: Meta, page_size: usize) -> Self {
        let root = BucketData::from_root(meta.root_pgid(), meta.root_sequence());
        Self {
            writable,
            closed: false,
            meta,
            page_size,
            pages: HashMap::new(),
            buckets: vec![root],
            stats: TxStats::default(),
            handlers: Vec::new(),
        }
    }

    /// Bytes of a page run: this transaction's dirty copy if present,
    /// otherwise the mapped file.
    pub(crate) fn page_bytes<'a>(&'a self, mmap: &'a MmapFile, pgid: PageId) -> Result<&'a [u8]> {
        if let Some(buf) = self.pages.get(&pgid) {
            return Ok(buf.bytes());
        }
        let overflow = Page::from_buf(mmap.page(pgid)?)?.overflow();
        mmap.page_run(pgid, 1 + overflow as usize)
    }

    /// Hands out a fresh page run: the lowest fitting freelist run, or new
    /// pages past the high-water mark (the commit grows the file to cover
    /// them).
    pub(crate) fn allocate(&mut self, fl: &mut Freelist, count: usize) -> Result<PageId> {
        ensure!(
            count > 0 && count.saturating_mul(self.page_size) <= MAX_ALLOC_SIZE,
            "allocation of {} pages exceeds the maximum contiguous size",
            count
        );

        let mut pgid = fl.allocate(self.meta.txid(), count);
        if pgid == 0 {
            pgid = self.meta.pgid();
            self.meta.set_pgid(pgid + count as u64);
        }
        self.stats.page_count += count as u64;
        self.stats.page_alloc += (count * self.page_size) as u64;
        Ok(pgid)
    }
}

pub(crate) enum MmapGuard<'db> {
    Read(RwLockReadGuard<'db, MmapFile>),
    Upgradable(RwLockUpgradableReadGuard<'db, MmapFile>),
}

impl MmapGuard<'_> {
    pub(crate) fn get(&self) -> &MmapFile {
        match self {
            MmapGuard::Read(g) => g,
            MmapGuard::Upgradable(g) => g,
        }
    }
}

pub struct Transaction<'db> {
    pub(crate) db: &'db DbInner,
    pub(crate) inner: RefCell<TxInner>,
    pub(crate) mmap: Option<MmapGuard<'db>>,
    pub(crate) writer: Option<MutexGuard<'db, ()>>,
}

impl<'db> std::fmt::Debug for Transaction<'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn new_read(
        db: &'db DbInner,
        meta: Meta,
        guard: RwLockReadGuard<'db, MmapFile>,
    ) -> Self {
        Self {
            db,
            inner: RefCell::new(TxInner::new(false, meta, db.page_size)),
            mmap: Some(MmapGuard::Read(guard)),
            writer: None,
        }
    }

    pub(crate) fn new_write(
        db: &'db DbInner,
        mut meta: Meta,
        guard: RwLockUpgradableReadGuard<'db, MmapFile>,
        writer: MutexGuard<'db, ()>,
    ) -> Self {
        meta.set_txid(meta.txid() + 1);
        Self {
            db,
            inner: RefCell::new(TxInner::new(true, meta, db.page_size)),
            mmap: Some(MmapGuard::Upgradable(guard)),
            writer: Some(writer),
        }
    }

    pub(crate) fn mmap_ref(&self) -> &MmapFile {
        self.mmap
            .as_ref()
            .expect("open transaction holds the map latch")
            .get()
    }

    /// Transaction id: the snapshot's id for readers, the id being produced
    /// for the writer.
    pub fn id(&self) -> TxnId {
        self.inner.borrow().meta.txid()
    }

    pub fn writable(&self) -> bool {
        self.inner.borrow().writable
    }

    /// Database size as of this snapshot: high-water mark times page size.
    pub fn size(&self) -> u64 {
        let inner = self.inner.borrow();
        inner.meta.pgid() * inner.page_size as u64
    }

    pub fn stats(&self) -> TxStats {
        self.inner.borrow().stats
    }

    /// Registers a callback to run after a successful commit.
    pub fn on_commit(&self, f: impl FnOnce() + 'static) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        ensure!(!inner.closed, Error::TxClosed);
        ensure!(inner.writable, Error::TxReadOnly);
        inner.handlers.push(Box::new(f));
        Ok(())
    }

    /// Opens a top-level bucket.
    pub fn bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        Bucket { tx: self, id: 0 }.bucket(name)
    }

    /// Creates a top-level bucket.
    pub fn create_bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        Bucket { tx: self, id: 0 }.create_bucket(name)
    }

    pub fn create_bucket_if_not_exists<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        Bucket { tx: self, id: 0 }.create_bucket_if_not_exists(name)
    }

    /// Recursively deletes a top-level bucket.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        Bucket { tx: self, id: 0 }.delete_bucket(name)
    }

    /// Cursor over the top-level bucket names.
    pub fn buckets<'tx>(&'tx self) -> BucketsCursor<'tx, 'db> {
        Bucket { tx: self, id: 0 }.buckets()
    }

    /// Commits the write transaction, making every change durable atomically.
    pub fn commit(mut self) -> Result<()> {
        match self.commit_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback_inner();
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            ensure!(!inner.closed, Error::TxClosed);
            ensure!(inner.writable, Error::TxReadOnly);
        }

        let page_size = self.db.page_size;
        let no_sync = self.db.options.no_sync;

        // steps 1-3: restructure the tree and rewrite the freelist, all
        // in-memory, under the freelist lock
        {
            let mmap = self
                .mmap
                .as_ref()
                .expect("open transaction holds the map latch")
                .get();
            let mut inner = self.inner.borrow_mut();
            let mut fl = self.db.freelist.lock();

            inner.rebalance_bucket(mmap, &mut fl, 0)?;
            inner.spill_bucket(mmap, &mut fl, 0)?;

            let (root, sequence) = {
                let b = &inner.buckets[0];
                (b.root, b.sequence)
            };
            inner.meta.set_root(root, sequence);

            let old_freelist = inner.meta.freelist();
            if old_freelist != PGID_NO_FREELIST {
                let overflow = Page::from_buf(mmap.page(old_freelist)?)?.overflow();
                let txid = inner.meta.txid();
                fl.free(txid, old_freelist, overflow);
            }

            if self.db.options.no_freelist_sync {
                inner.meta.set_freelist(PGID_NO_FREELIST);
            } else {
                let pages = fl.size().div_ceil(page_size);
                let pgid = inner.allocate(&mut fl, pages)?;
                let mut buf = PageBuf::new(page_size, pages, pgid, PageType::Freelist);
                fl.write(&mut buf)?;
                inner.pages.insert(pgid, buf);
                inner.meta.set_freelist(pgid);
            }
        }

        // step 4: grow the file and remap if the high-water mark ran past
        // the current map
        let min_size = self.inner.borrow().meta.pgid() * page_size as u64;
        let mapped = self
            .mmap
            .as_ref()
            .expect("open transaction holds the map latch")
            .get()
            .len();
        if min_size > mapped {
            let guard = self
                .mmap
                .take()
                .expect("open transaction holds the map latch");
            let MmapGuard::Upgradable(up) = guard else {
                unreachable!("write transactions hold the upgradable latch");
            };
            let mut write_guard = RwLockUpgradableReadGuard::upgrade(up);
            let grown = write_guard.grow(min_size);
            self.mmap = Some(MmapGuard::Upgradable(
                RwLockWriteGuard::downgrade_to_upgradable(write_guard),
            ));
            grown?;
        }

        // steps 5-8: dirty pages, fsync, meta, fsync, pending release. The
        // reader registry is held across the meta publish and the release:
        // a reader beginning concurrently either registered before the new
        // meta landed (so the release respects it) or will sample the new
        // meta (so it cannot need the pages being released).
        {
            let mmap = self
                .mmap
                .as_ref()
                .expect("open transaction holds the map latch")
                .get();
            let inner = self.inner.borrow();

            let mut pgids: Vec<PageId> = inner.pages.keys().copied().collect();
            pgids.sort_unstable();
            for pgid in &pgids {
                mmap.write_page(*pgid, inner.pages[pgid].bytes())?;
            }
            if !no_sync {
                mmap.sync_data()?;
            }

            let mut meta = inner.meta;
            drop(inner);
            meta.update_checksum();

            let readers = self.db.readers.lock();

            let slot = meta.txid() % 2;
            let mut buf = PageBuf::new(page_size, 1, slot, PageType::Meta);
            meta.write_to(buf.payload_mut())?;
            mmap.write_page(slot, buf.bytes())?;
            if !no_sync {
                mmap.sync_data()?;
            }

            let mut fl = self.db.freelist.lock();
            match readers.iter().min() {
                Some(&oldest) => fl.release(oldest.saturating_sub(1)),
                None => fl.release(meta.txid()),
            }

            trace!(
                txid = meta.txid(),
                pages = pgids.len(),
                pgid_high = meta.pgid(),
                "committed write transaction"
            );
        }

        // step 9: callbacks, then drop the guards (writer lock last)
        let handlers = {
            let mut inner = self.inner.borrow_mut();
            inner.closed = true;
            std::mem::take(&mut inner.handlers)
        };
        self.mmap = None;
        self.writer = None;
        for handler in handlers {
            handler();
        }
        Ok(())
    }

    /// Rolls the transaction back, discarding all uncommitted changes.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let (txid, writable) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.pages.clear();
            (inner.meta.txid(), inner.writable)
        };

        if writable {
            let mut fl = self.db.freelist.lock();
            fl.rollback(txid);
            // re-read the persisted freelist so the in-memory state matches
            // the still-authoritative meta exactly
            if let Some(guard) = self.mmap.as_ref() {
                if let Err(e) = reload_freelist(&mut fl, guard.get()) {
                    debug!("freelist reload after rollback failed: {:#}", e);
                }
            }
        } else {
            let mut readers = self.db.readers.lock();
            if let Some(pos) = readers.iter().position(|&t| t == txid) {
                readers.swap_remove(pos);
            }
            // frees quarantined behind this reader may now be reclaimable up
            // to the next-oldest snapshot
            if let Some(&next_oldest) = readers.iter().min() {
                if next_oldest > txid {
                    self.db
                        .freelist
                        .lock()
                        .release_range(txid, next_oldest - 1);
                }
            }
        }

        self.mmap = None;
        self.writer = None;
    }

    /// Walks the committed tree of this snapshot and verifies structural
    /// invariants: every reachable page is in bounds and referenced exactly
    /// once, no reachable page is on the freelist, and branch keys are
    /// sorted. Meant to run on a fresh read transaction.
    pub fn check(&self) -> Result<()> {
        let inner = self.inner.borrow();
        ensure!(!inner.closed, Error::TxClosed);
        let mmap = self.mmap_ref();
        let fl = self.db.freelist.lock();

        let high = inner.meta.pgid();
        let mut seen: HashSet<PageId> = HashSet::new();
        seen.insert(0);
        seen.insert(1);

        let freelist_pgid = inner.meta.freelist();
        if freelist_pgid != PGID_NO_FREELIST {
            ensure!(freelist_pgid < high, Error::Corrupted);
            let overflow = Page::from_buf(mmap.page(freelist_pgid)?)?.overflow();
            for id in freelist_pgid..=freelist_pgid + overflow as u64 {
                ensure!(seen.insert(id), "page {} referenced twice", id);
            }
        }

        check_subtree(mmap, &fl, inner.meta.root_pgid(), high, &mut seen)
    }
}

/// Restores the freelist from its on-disk page after a writer rollback,
/// keeping quarantined frees for transactions that are still protected.
fn reload_freelist(fl: &mut Freelist, mmap: &MmapFile) -> Result<()> {
    let meta = crate::db::load_meta(mmap)?;
    if meta.freelist() == PGID_NO_FREELIST {
        return Ok(());
    }
    let overflow = Page::from_buf(mmap.page(meta.freelist())?)?.overflow();
    let run = mmap.page_run(meta.freelist(), 1 + overflow as usize)?;
    fl.reload(Page::from_buf(run)?)
}

fn check_subtree(
    mmap: &MmapFile,
    fl: &Freelist,
    pgid: PageId,
    high: PageId,
    seen: &mut HashSet<PageId>,
) -> Result<()> {
    ensure!(pgid >= 2 && pgid < high, Error::Corrupted);

    let overflow = Page::from_buf(mmap.page(pgid)?)?.overflow();
    for id in pgid..=pgid + overflow as u64 {
        ensure!(seen.insert(id), "page {} referenced twice", id);
        ensure!(!fl.is_free(id), "page {} is both reachable and free", id);
    }

    let page = Page::from_buf(mmap.page_run(pgid, 1 + overflow as usize)?)?;
    if page.is_branch() {
        ensure!(page.count() > 0, Error::Corrupted);
        let mut prev: Option<&[u8]> = None;
        for i in 0..page.count() {
            let key = page.branch_key(i)?;
            if let Some(p) = prev {
                ensure!(p < key, "branch keys out of order on page {}", pgid);
            }
            prev = Some(key);
            check_subtree(mmap, fl, page.branch_pgid(i)?, high, seen)?;
        }
    } else if page.is_leaf() {
        let mut prev: Option<&[u8]> = None;
        for i in 0..page.count() {
            let (key, value, flags) = page.leaf_entry(i)?;
            if let Some(p) = prev {
                ensure!(p < key, "leaf keys out of order on page {}", pgid);
            }
            prev = Some(key);
            if flags & crate::storage::BUCKET_LEAF_FLAG != 0 {
                ensure!(value.len() >= BUCKET_HEADER_SIZE, Error::Corrupted);
                let header = BucketHeader::from_bytes(value)?;
                if header.root() != 0 {
                    check_subtree(mmap, fl, header.root(), high, seen)?;
                } else {
                    ensure!(
                        value.len() >= BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE,
                        Error::Corrupted
                    );
                }
            }
        }
    } else {
        return Err(eyre!(Error::Corrupted)
            .wrap_err(format!("unexpected page type reachable at page {}", pgid)));
    }
    Ok(())
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}
