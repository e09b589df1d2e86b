//! # Freelist Management
//!
//! The freelist tracks every page id that can be reused by a future
//! allocation, and, because readers hold snapshots, every page id that
//! *will* become reusable once the readers that might still observe it are
//! gone.
//!
//! ## State
//!
//! - `free`: sorted ids available for allocation right now
//! - `pending`: ids freed by transaction `txid`, keyed by `txid`; they join
//!   `free` only when no read transaction older than `txid` remains open
//! - `allocs`: which transaction took each id out of `free`, so an aborted
//!   transaction can put its allocations back
//! - `cache`: membership set over `free ∪ pending` for O(1) double-free
//!   detection
//!
//! ## Allocation
//!
//! `allocate(txid, n)` finds the *lowest* run of `n` contiguous ids in
//! `free`. Returning 0 means no run fits and the caller extends the file's
//! high-water mark instead.
//!
//! ## Serialization
//!
//! The on-disk freelist merges `free` with every pending list: a crash
//! discards in-flight transactions, so any id pending for an uncommitted
//! transaction is genuinely free after recovery. `reload` inverts this,
//! subtracting ids that are still pending for transactions known to be open.
//!
//! ## Thread Safety
//!
//! Not thread-safe on its own; the database holds a mutex around it and only
//! the single writer mutates it.

use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};

use eyre::Result;

use super::page::write_freelist_ids;
use super::{Page, PageBuf, PageId, TxnId, PAGE_HEADER_SIZE};

#[derive(Debug, Default)]
pub(crate) struct Freelist {
    free: Vec<PageId>,
    pending: BTreeMap<TxnId, Vec<PageId>>,
    allocs: HashMap<PageId, TxnId>,
    cache: HashSet<PageId>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_free(mut free: Vec<PageId>) -> Self {
        free.sort_unstable();
        let cache = free.iter().copied().collect();
        Self {
            free,
            pending: BTreeMap::new(),
            allocs: HashMap::new(),
            cache,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// True if the id is immediately reusable (not merely pending).
    pub fn is_free(&self, pgid: PageId) -> bool {
        self.free.binary_search(&pgid).is_ok()
    }

    /// Finds the lowest run of `n` contiguous free ids, removes it, and
    /// returns its first id. Returns 0 when no run fits.
    pub fn allocate(&mut self, txid: TxnId, n: usize) -> PageId {
        if self.free.is_empty() {
            return 0;
        }

        let mut initial: PageId = 0;
        let mut previd: PageId = 0;

        for i in 0..self.free.len() {
            let id = self.free[i];
            debug_assert!(id > 1, "meta page {} on the freelist", id);

            if previd == 0 || id - previd != 1 {
                initial = id;
            }

            if id - initial + 1 == n as u64 {
                self.free.drain(i + 1 - n..=i);
                for pg in initial..initial + n as u64 {
                    self.cache.remove(&pg);
                    self.allocs.insert(pg, txid);
                }
                return initial;
            }

            previd = id;
        }

        0
    }

    /// Queues a page run freed by `txid` for later reuse.
    ///
    /// Panics on a double free: a page that is already free or pending means
    /// the tree and the freelist disagree, and continuing would hand the
    /// same page to two owners.
    pub fn free(&mut self, txid: TxnId, pgid: PageId, overflow: u32) {
        assert!(pgid > 1, "cannot free meta page {}", pgid);
        let ids = self.pending.entry(txid).or_default();
        for id in pgid..=pgid + overflow as u64 {
            assert!(self.cache.insert(id), "page {} already freed", id);
            self.allocs.remove(&id);
            ids.push(id);
        }
    }

    /// Moves every pending list for transactions `<= txid` into `free`.
    pub fn release(&mut self, txid: TxnId) {
        let rest = self.pending.split_off(&(txid + 1));
        let done = std::mem::replace(&mut self.pending, rest);
        for (_, ids) in done {
            self.free.extend(ids);
        }
        self.free.sort_unstable();
    }

    /// Targeted release of the pending lists for transactions in
    /// `[begin, end]`.
    pub fn release_range(&mut self, begin: TxnId, end: TxnId) {
        if begin > end {
            return;
        }
        let txids: Vec<TxnId> = self
            .pending
            .range(begin..=end)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in txids {
            if let Some(ids) = self.pending.remove(&txid) {
                self.free.extend(ids);
            }
        }
        self.free.sort_unstable();
    }

    /// Undoes the effects of an aborted transaction: its pending frees are
    /// forgotten (the pages are still live) and the ids it took out of
    /// `free` are put back.
    pub fn rollback(&mut self, txid: TxnId) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }

        let taken: Vec<PageId> = self
            .allocs
            .iter()
            .filter(|(_, t)| **t == txid)
            .map(|(pg, _)| *pg)
            .collect();
        for pg in taken {
            self.allocs.remove(&pg);
            if self.cache.insert(pg) {
                self.free.push(pg);
            }
        }
        self.free.sort_unstable();
    }

    /// Rebuilds `free` from a freelist page read at open time. Pending state
    /// is expected to be empty.
    pub fn read(&mut self, page: Page<'_>) -> Result<()> {
        let mut ids = page.freelist_ids()?;
        ids.sort_unstable();
        self.cache = ids.iter().copied().collect();
        self.free = ids;
        Ok(())
    }

    /// Rebuilds state from a freelist page, then subtracts any ids that are
    /// still pending for transactions that remain open, since the on-disk
    /// list merges pending into free.
    pub fn reload(&mut self, page: Page<'_>) -> Result<()> {
        let mut ids = page.freelist_ids()?;
        ids.sort_unstable();

        let pending_ids: HashSet<PageId> = self
            .pending
            .values()
            .flat_map(|v| v.iter().copied())
            .collect();

        self.free = ids
            .into_iter()
            .filter(|id| !pending_ids.contains(id))
            .collect();
        self.cache = self
            .free
            .iter()
            .copied()
            .chain(pending_ids.iter().copied())
            .collect();
        Ok(())
    }

    /// Bytes needed to serialize `free ∪ pending`, including the page header
    /// and the 0xFFFF count escape slot when required.
    pub fn size(&self) -> usize {
        let mut n = self.count();
        if n >= 0xFFFF {
            n += 1;
        }
        PAGE_HEADER_SIZE + n * 8
    }

    /// Serializes `free ∪ pending`, sorted, into a freelist page run. The
    /// owning transactions of pending ids cannot have committed if this page
    /// is ever read back, so recovery treats all of them as free.
    pub fn write(&self, buf: &mut PageBuf) -> Result<()> {
        let mut ids: Vec<PageId> = self
            .free
            .iter()
            .copied()
            .chain(self.pending.values().flat_map(|v| v.iter().copied()))
            .collect();
        ids.sort_unstable();
        write_freelist_ids(buf, &ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageType, DEFAULT_PAGE_SIZE};

    #[test]
    fn allocate_returns_zero_when_empty() {
        let mut fl = Freelist::new();
        assert_eq!(fl.allocate(1, 1), 0);
    }

    #[test]
    fn allocate_takes_lowest_run() {
        let mut fl = Freelist::with_free(vec![3, 4, 5, 9, 12, 13]);

        assert_eq!(fl.allocate(7, 1), 3);
        assert_eq!(fl.allocate(7, 2), 4);
        assert_eq!(fl.allocate(7, 1), 9);
        assert_eq!(fl.free_count(), 2);
    }

    #[test]
    fn allocate_skips_fragmented_gaps() {
        let mut fl = Freelist::with_free(vec![3, 5, 6, 7, 10]);

        assert_eq!(fl.allocate(1, 3), 5);
        assert_eq!(fl.free_count(), 2);
        assert!(fl.is_free(3));
        assert!(fl.is_free(10));
    }

    #[test]
    fn allocate_returns_zero_when_no_run_fits() {
        let mut fl = Freelist::with_free(vec![3, 5, 7]);

        assert_eq!(fl.allocate(1, 2), 0);
        assert_eq!(fl.free_count(), 3);
    }

    #[test]
    fn free_queues_the_whole_overflow_run() {
        let mut fl = Freelist::new();

        fl.free(5, 10, 2);

        assert_eq!(fl.pending_count(), 3);
        assert_eq!(fl.free_count(), 0);
    }

    #[test]
    #[should_panic(expected = "already freed")]
    fn double_free_panics() {
        let mut fl = Freelist::new();
        fl.free(5, 10, 0);
        fl.free(6, 10, 0);
    }

    #[test]
    #[should_panic(expected = "meta page")]
    fn freeing_a_meta_page_panics() {
        let mut fl = Freelist::new();
        fl.free(5, 1, 0);
    }

    #[test]
    fn release_merges_pending_up_to_txid() {
        let mut fl = Freelist::new();
        fl.free(3, 10, 0);
        fl.free(5, 20, 0);
        fl.free(7, 30, 0);

        fl.release(5);

        assert_eq!(fl.free_count(), 2);
        assert!(fl.is_free(10));
        assert!(fl.is_free(20));
        assert!(!fl.is_free(30));
        assert_eq!(fl.pending_count(), 1);
    }

    #[test]
    fn released_pages_are_allocatable_again() {
        let mut fl = Freelist::new();
        fl.free(3, 12, 1);
        fl.release(3);

        assert_eq!(fl.allocate(4, 2), 12);
    }

    #[test]
    fn release_range_only_touches_the_window() {
        let mut fl = Freelist::new();
        fl.free(3, 10, 0);
        fl.free(5, 20, 0);
        fl.free(7, 30, 0);

        fl.release_range(4, 6);

        assert!(fl.is_free(20));
        assert!(!fl.is_free(10));
        assert!(!fl.is_free(30));
    }

    #[test]
    fn rollback_discards_pending_and_restores_allocations() {
        let mut fl = Freelist::with_free(vec![4, 5, 6]);
        let got = fl.allocate(9, 2);
        assert_eq!(got, 4);
        fl.free(9, 30, 0);

        fl.rollback(9);

        // the pages tx 9 took come back, its free of page 30 is forgotten
        assert_eq!(fl.free_count(), 3);
        assert!(fl.is_free(4));
        assert!(fl.is_free(5));
        assert_eq!(fl.pending_count(), 0);
        // page 30 is live again, so freeing it later must not be a double free
        fl.free(10, 30, 0);
    }

    #[test]
    fn rollback_leaves_other_transactions_alone() {
        let mut fl = Freelist::new();
        fl.free(3, 10, 0);
        fl.free(4, 20, 0);

        fl.rollback(4);

        assert_eq!(fl.pending_count(), 1);
        fl.release(3);
        assert!(fl.is_free(10));
        assert!(!fl.is_free(20));
    }

    #[test]
    fn write_then_read_roundtrips_free_and_pending() {
        let mut fl = Freelist::with_free(vec![7, 9]);
        fl.free(3, 12, 1);

        let pages = fl.size().div_ceil(DEFAULT_PAGE_SIZE);
        let mut buf = PageBuf::new(DEFAULT_PAGE_SIZE, pages, 2, PageType::Freelist);
        fl.write(&mut buf).unwrap();

        let mut reloaded = Freelist::new();
        reloaded.read(buf.page().unwrap()).unwrap();

        assert_eq!(reloaded.free_count(), 4);
        for id in [7, 9, 12, 13] {
            assert!(reloaded.is_free(id));
        }
    }

    #[test]
    fn reload_subtracts_still_pending_ids() {
        let mut fl = Freelist::with_free(vec![7, 9]);
        fl.free(3, 12, 0);

        let pages = fl.size().div_ceil(DEFAULT_PAGE_SIZE);
        let mut buf = PageBuf::new(DEFAULT_PAGE_SIZE, pages, 2, PageType::Freelist);
        fl.write(&mut buf).unwrap();

        fl.reload(buf.page().unwrap()).unwrap();

        assert!(fl.is_free(7));
        assert!(fl.is_free(9));
        assert!(!fl.is_free(12));
        assert_eq!(fl.pending_count(), 1);
    }

    #[test]
    fn size_accounts_for_the_count_escape() {
        let fl = Freelist::with_free((2..2 + 0xFFFF).collect());

        assert_eq!(fl.size(), PAGE_HEADER_SIZE + (0xFFFF + 1) * 8);
    }
}
