//! # Cursors
//!
//! A cursor walks one bucket's B+tree with a stack of
//! `{page-or-node, element index}` frames from the root down to the current
//! element. Frames store page ids, not pointers: each operation re-resolves a
//! frame through [`TxInner::page_node`], which prefers the bucket's
//! materialized node (so a write transaction sees its own uncommitted state)
//! and falls back to the page: a dirty page from this transaction, the
//! bucket's inline root, or the map.
//!
//! `seek` carries the partial-match contract: it returns the first element at
//! or after the target key, stepping into the next leaf when the binary
//! search lands past the end of one. Callers compare keys to decide hit vs.
//! miss. `next`/`prev` are exact inverses and skip empty pages.
//!
//! Two public variants share the walker: [`Cursor`] yields only plain
//! key/value pairs, [`BucketsCursor`] yields only sub-bucket names.

use eyre::{bail, ensure, eyre, Result};
use smallvec::SmallVec;

use crate::db::transaction::TxInner;
use crate::error::Error;
use crate::storage::{MmapFile, Page, PageId, BUCKET_LEAF_FLAG};
use crate::tree::bucket::Bucket;
use crate::tree::node::Node;

/// One stack frame: the page (or node) id and the element index within it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemRef {
    pub pgid: PageId,
    pub index: usize,
}

pub(crate) type CursorStack = SmallVec<[ElemRef; 8]>;

/// A frame resolves either to a materialized node or a read-only page view.
pub(crate) enum PageNode<'a> {
    Page(Page<'a>),
    Node(&'a Node),
}

impl<'a> PageNode<'a> {
    pub fn count(&self) -> usize {
        match self {
            PageNode::Page(p) => p.count(),
            PageNode::Node(n) => n.inodes.len(),
        }
    }

    pub fn is_leaf(&self) -> Result<bool> {
        match self {
            PageNode::Page(p) => {
                ensure!(p.is_leaf() || p.is_branch(), Error::Corrupted);
                Ok(p.is_leaf())
            }
            PageNode::Node(n) => Ok(n.leaf),
        }
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        match self {
            PageNode::Page(p) => {
                if p.is_leaf() {
                    p.leaf_key(index)
                } else {
                    p.branch_key(index)
                }
            }
            PageNode::Node(n) => n
                .inodes
                .get(index)
                .map(|ino| ino.key.as_slice())
                .ok_or_else(|| eyre!(Error::Corrupted)),
        }
    }

    pub fn branch_child(&self, index: usize) -> Result<PageId> {
        match self {
            PageNode::Page(p) => p.branch_pgid(index),
            PageNode::Node(n) => n
                .inodes
                .get(index)
                .map(|ino| ino.pgid)
                .ok_or_else(|| eyre!(Error::Corrupted)),
        }
    }

    pub fn leaf_entry(&self, index: usize) -> Result<(&'a [u8], &'a [u8], u32)> {
        match self {
            PageNode::Page(p) => p.leaf_entry(index),
            PageNode::Node(n) => n
                .inodes
                .get(index)
                .map(|ino| (ino.key.as_slice(), ino.value.as_slice(), ino.flags))
                .ok_or_else(|| eyre!(Error::Corrupted)),
        }
    }
}

impl TxInner {
    /// Resolves a frame id: materialized node first, then the inline root
    /// (id 0), then a dirty page, then the map.
    pub(crate) fn page_node<'a>(
        &'a self,
        mmap: &'a MmapFile,
        bucket: usize,
        pgid: PageId,
    ) -> Result<PageNode<'a>> {
        let b = &self.buckets[bucket];
        if let Some(node) = b.nodes.get(&pgid) {
            return Ok(PageNode::Node(node));
        }
        if pgid == 0 {
            let data = b
                .inline_page
                .as_deref()
                .ok_or_else(|| eyre!(Error::Corrupted))?;
            return Ok(PageNode::Page(Page::from_buf(data)?));
        }
        Ok(PageNode::Page(Page::from_buf(self.page_bytes(mmap, pgid)?)?))
    }

    /// Root frame id for a bucket; 0 doubles as the inline root's id.
    pub(crate) fn bucket_root(&self, bucket: usize) -> PageId {
        self.buckets[bucket].root
    }
}

/// Descends from the root to the leaf that owns `key`, binary-searching each
/// branch for the last child whose separator is `<=` the target. The stack's
/// top frame indexes the leaf's lower bound for `key` (possibly one past the
/// last element).
pub(crate) fn search(
    inner: &TxInner,
    mmap: &MmapFile,
    bucket: usize,
    key: &[u8],
    stack: &mut CursorStack,
) -> Result<()> {
    stack.clear();
    let mut pgid = inner.bucket_root(bucket);

    loop {
        let pn = inner.page_node(mmap, bucket, pgid)?;
        let count = pn.count();

        if pn.is_leaf()? {
            let mut lo = 0usize;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if pn.key_at(mid)? < key {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            stack.push(ElemRef { pgid, index: lo });
            return Ok(());
        }

        ensure!(count > 0, Error::Corrupted);
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if pn.key_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let mut index = lo;
        let exact = index < count && pn.key_at(index)? == key;
        if !exact && index > 0 {
            index -= 1;
        }
        let child = pn.branch_child(index)?;
        stack.push(ElemRef { pgid, index });
        pgid = child;
    }
}

/// Key, value, and flags at the stack's current position, or `None` when the
/// top index points past the leaf's end.
pub(crate) fn key_value<'a>(
    inner: &'a TxInner,
    mmap: &'a MmapFile,
    bucket: usize,
    stack: &CursorStack,
) -> Result<Option<(&'a [u8], &'a [u8], u32)>> {
    let Some(top) = stack.last() else {
        return Ok(None);
    };
    let pn = inner.page_node(mmap, bucket, top.pgid)?;
    ensure!(pn.is_leaf()?, Error::Corrupted);
    if top.index >= pn.count() {
        return Ok(None);
    }
    pn.leaf_entry(top.index).map(Some)
}

/// Descends to the leftmost leaf under the stack's top frame.
pub(crate) fn first_descend(
    inner: &TxInner,
    mmap: &MmapFile,
    bucket: usize,
    stack: &mut CursorStack,
) -> Result<()> {
    loop {
        let top = *stack.last().ok_or_else(|| eyre!(Error::Corrupted))?;
        let pn = inner.page_node(mmap, bucket, top.pgid)?;
        if pn.is_leaf()? {
            return Ok(());
        }
        ensure!(pn.count() > 0, Error::Corrupted);
        let child = pn.branch_child(top.index)?;
        stack.push(ElemRef {
            pgid: child,
            index: 0,
        });
    }
}

/// Descends to the rightmost leaf under the stack's top frame.
pub(crate) fn last_descend(
    inner: &TxInner,
    mmap: &MmapFile,
    bucket: usize,
    stack: &mut CursorStack,
) -> Result<()> {
    loop {
        let top = *stack.last().ok_or_else(|| eyre!(Error::Corrupted))?;
        let pn = inner.page_node(mmap, bucket, top.pgid)?;
        if pn.is_leaf()? {
            return Ok(());
        }
        ensure!(pn.count() > 0, Error::Corrupted);
        let child = pn.branch_child(top.index)?;
        let child_count = inner.page_node(mmap, bucket, child)?.count();
        stack.push(ElemRef {
            pgid: child,
            index: child_count.saturating_sub(1),
        });
    }
}

/// Advances to the next leaf element, popping exhausted frames and skipping
/// empty pages. Returns `None` at end of tree.
pub(crate) fn move_next(
    inner: &TxInner,
    mmap: &MmapFile,
    bucket: usize,
    stack: &mut CursorStack,
) -> Result<Option<()>> {
    loop {
        // deepest frame that can still advance
        let mut depth = stack.len();
        while depth > 0 {
            let frame = stack[depth - 1];
            let count = inner.page_node(mmap, bucket, frame.pgid)?.count();
            if frame.index + 1 < count {
                stack[depth - 1].index += 1;
                break;
            }
            depth -= 1;
        }
        if depth == 0 {
            return Ok(None);
        }
        stack.truncate(depth);

        first_descend(inner, mmap, bucket, stack)?;

        let top = *stack.last().ok_or_else(|| eyre!(Error::Corrupted))?;
        if inner.page_node(mmap, bucket, top.pgid)?.count() == 0 {
            continue;
        }
        return Ok(Some(()));
    }
}

/// Retreats to the previous leaf element; exact inverse of [`move_next`].
pub(crate) fn move_prev(
    inner: &TxInner,
    mmap: &MmapFile,
    bucket: usize,
    stack: &mut CursorStack,
) -> Result<Option<()>> {
    loop {
        let mut moved = false;
        while let Some(top) = stack.last_mut() {
            if top.index > 0 {
                top.index -= 1;
                moved = true;
                break;
            }
            stack.pop();
        }
        if !moved {
            return Ok(None);
        }

        last_descend(inner, mmap, bucket, stack)?;

        let top = *stack.last().ok_or_else(|| eyre!(Error::Corrupted))?;
        if inner.page_node(mmap, bucket, top.pgid)?.count() == 0 {
            continue;
        }
        return Ok(Some(()));
    }
}

/// What a cursor variant yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Yield {
    Values,
    Buckets,
}

struct RawCursor<'tx, 'db> {
    bucket: Bucket<'tx, 'db>,
    stack: CursorStack,
    yields: Yield,
}

impl<'tx, 'db> RawCursor<'tx, 'db> {
    fn new(bucket: Bucket<'tx, 'db>, yields: Yield) -> Self {
        Self {
            bucket,
            stack: CursorStack::new(),
            yields,
        }
    }

    fn wants(&self, flags: u32) -> bool {
        let is_bucket = flags & BUCKET_LEAF_FLAG != 0;
        (self.yields == Yield::Buckets) == is_bucket
    }

    /// Returns the current element if it matches the variant, otherwise
    /// walks forward until one does.
    fn settle_forward(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tx = self.bucket.tx;
        let inner = tx.inner.borrow();
        let mmap = tx.mmap_ref();
        loop {
            match key_value(&inner, mmap, self.bucket.id, &self.stack)? {
                Some((k, v, flags)) if self.wants(flags) => {
                    return Ok(Some((k.to_vec(), v.to_vec())));
                }
                _ => {
                    if move_next(&inner, mmap, self.bucket.id, &mut self.stack)?.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn settle_backward(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let tx = self.bucket.tx;
        let inner = tx.inner.borrow();
        let mmap = tx.mmap_ref();
        loop {
            match key_value(&inner, mmap, self.bucket.id, &self.stack)? {
                Some((k, v, flags)) if self.wants(flags) => {
                    return Ok(Some((k.to_vec(), v.to_vec())));
                }
                _ => {
                    if move_prev(&inner, mmap, self.bucket.id, &mut self.stack)?.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        {
            let tx = self.bucket.tx;
            let inner = tx.inner.borrow();
            let mmap = tx.mmap_ref();
            let root = inner.bucket_root(self.bucket.id);
            self.stack.clear();
            self.stack.push(ElemRef {
                pgid: root,
                index: 0,
            });
            first_descend(&inner, mmap, self.bucket.id, &mut self.stack)?;
        }
        self.settle_forward()
    }

    fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        {
            let tx = self.bucket.tx;
            let inner = tx.inner.borrow();
            let mmap = tx.mmap_ref();
            let root = inner.bucket_root(self.bucket.id);
            let count = inner.page_node(mmap, self.bucket.id, root)?.count();
            self.stack.clear();
            self.stack.push(ElemRef {
                pgid: root,
                index: count.saturating_sub(1),
            });
            if count > 0 {
                last_descend(&inner, mmap, self.bucket.id, &mut self.stack)?;
            }
        }
        self.settle_backward()
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        {
            let tx = self.bucket.tx;
            let inner = tx.inner.borrow();
            let mmap = tx.mmap_ref();
            if move_next(&inner, mmap, self.bucket.id, &mut self.stack)?.is_none() {
                return Ok(None);
            }
        }
        self.settle_forward()
    }

    fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        {
            let tx = self.bucket.tx;
            let inner = tx.inner.borrow();
            let mmap = tx.mmap_ref();
            if move_prev(&inner, mmap, self.bucket.id, &mut self.stack)?.is_none() {
                return Ok(None);
            }
        }
        self.settle_backward()
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        {
            let tx = self.bucket.tx;
            let inner = tx.inner.borrow();
            let mmap = tx.mmap_ref();
            search(&inner, mmap, self.bucket.id, key, &mut self.stack)?;
        }
        self.settle_forward()
    }
}

/// Iterates a bucket's plain key/value pairs in lexicographic key order.
/// Sub-bucket entries are skipped; see [`BucketsCursor`] for those.
pub struct Cursor<'tx, 'db> {
    raw: RawCursor<'tx, 'db>,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    pub(crate) fn new(bucket: Bucket<'tx, 'db>) -> Self {
        Self {
            raw: RawCursor::new(bucket, Yield::Values),
        }
    }

    /// Positions on the first pair. `None` on an empty bucket.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.raw.first()
    }

    /// Positions on the last pair.
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.raw.last()
    }

    /// Advances one pair; `None` at the end of the bucket.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.raw.next()
    }

    /// Retreats one pair; exact inverse of [`Cursor::next`].
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.raw.prev()
    }

    /// Positions on the first pair whose key is at or after `key`. The
    /// returned key may differ from the target; compare to detect an exact
    /// hit.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.raw.seek(key)
    }

    /// Deletes the pair the cursor is positioned on. Requires a writable
    /// transaction.
    pub fn delete(&mut self) -> Result<()> {
        let tx = self.raw.bucket.tx;
        let key = {
            let inner = tx.inner.borrow();
            ensure!(!inner.closed, Error::TxClosed);
            ensure!(inner.writable, Error::TxReadOnly);
            let mmap = tx.mmap_ref();
            let Some((k, _, flags)) = key_value(&inner, mmap, self.raw.bucket.id, &self.raw.stack)?
            else {
                bail!("cursor is not positioned on an element");
            };
            ensure!(flags & BUCKET_LEAF_FLAG == 0, Error::IncompatibleValue);
            k.to_vec()
        };
        let mmap = tx.mmap_ref();
        let mut inner = tx.inner.borrow_mut();
        inner.bucket_delete(mmap, self.raw.bucket.id, &key)
    }
}

/// Iterates a bucket's sub-bucket names in lexicographic order.
pub struct BucketsCursor<'tx, 'db> {
    raw: RawCursor<'tx, 'db>,
}

impl<'tx, 'db> BucketsCursor<'tx, 'db> {
    pub(crate) fn new(bucket: Bucket<'tx, 'db>) -> Self {
        Self {
            raw: RawCursor::new(bucket, Yield::Buckets),
        }
    }

    pub fn first(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.raw.first()?.map(|(name, _)| name))
    }

    pub fn last(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.raw.last()?.map(|(name, _)| name))
    }

    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.raw.next()?.map(|(name, _)| name))
    }

    pub fn prev(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.raw.prev()?.map(|(name, _)| name))
    }

    pub fn seek(&mut self, name: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.raw.seek(name)?.map(|(name, _)| name))
    }
}
