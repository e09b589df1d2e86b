//! # Buckets
//!
//! A bucket is a named B+tree root with a sequence counter; buckets nest
//! recursively. On disk a bucket is the 16-byte [`BucketHeader`] stored as
//! its parent leaf's value (tagged with `BUCKET_LEAF_FLAG`). A header whose
//! root page id is 0 is an *inline* bucket: its entire root leaf page
//! follows the header inside the same value, so a tiny bucket costs no page
//! of its own.
//!
//! In memory, per-transaction bucket state lives in an arena on the
//! transaction (`TxInner::buckets`, index 0 = root bucket): the root page id
//! and sequence, the node cache keyed by page id, the opened sub-buckets
//! keyed by name, the inline page bytes, and the fill percent. The public
//! [`Bucket`] handle is a `Copy` capability (a transaction reference plus an
//! arena index), so handles can be chained (`create_bucket(..)?.put(..)`)
//! and freely duplicated without ownership cycles.
//!
//! ## Spill and the inline rule
//!
//! At commit, buckets spill depth-first: each modified sub-bucket is spilled
//! and its updated header (or full inline image) is written back into the
//! parent's tree, then the parent spills its own nodes. A bucket is rewritten
//! inline when its materialized root is a leaf, holds no sub-bucket entries,
//! and serializes to at most a quarter page; otherwise it gets real pages and
//! the header records the new root. The threshold is re-evaluated on every
//! spill, so buckets move between the two representations as they grow and
//! shrink.

use eyre::{bail, ensure, eyre, Result};
use hashbrown::HashMap;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::db::transaction::{Transaction, TxInner};
use crate::error::Error;
use crate::storage::{
    Freelist, MmapFile, Page, PageId, BUCKET_LEAF_FLAG, DEFAULT_FILL_PERCENT, MAX_KEY_SIZE,
    MAX_VALUE_SIZE, PAGE_HEADER_SIZE,
};
use crate::tree::cursor::{self, BucketsCursor, Cursor, CursorStack};

pub(crate) const BUCKET_HEADER_SIZE: usize = 16;

/// On-disk bucket record: root page id plus the sequence counter. Stored as
/// the leaf value of the bucket's name in its parent.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct BucketHeader {
    root: U64,
    sequence: U64,
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == BUCKET_HEADER_SIZE);

impl BucketHeader {
    pub fn new(root: PageId, sequence: u64) -> Self {
        Self {
            root: U64::new(root),
            sequence: U64::new(sequence),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        crate::storage::read_record(bytes)
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= BUCKET_HEADER_SIZE,
            "bucket header needs {} bytes, got {}",
            BUCKET_HEADER_SIZE,
            data.len()
        );
        data[..BUCKET_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn root(&self) -> PageId {
        self.root.get()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.get()
    }
}

/// Per-transaction state of one opened bucket.
#[derive(Debug)]
pub(crate) struct BucketData {
    /// Root page id; 0 while the bucket is inline.
    pub root: PageId,
    pub sequence: u64,
    /// Materialized nodes, keyed by the page id they shadow (0 = inline root).
    pub nodes: HashMap<PageId, crate::tree::node::Node>,
    /// Cache key of the materialized root node, if any path was materialized.
    pub root_node: Option<PageId>,
    /// Opened sub-buckets by name; indexes into the transaction's arena.
    pub children: HashMap<Vec<u8>, usize>,
    /// Serialized root page of an inline bucket.
    pub inline_page: Option<Vec<u8>>,
    pub fill_percent: f64,
}

impl BucketData {
    pub fn from_root(root: PageId, sequence: u64) -> Self {
        Self {
            root,
            sequence,
            nodes: HashMap::new(),
            root_node: None,
            children: HashMap::new(),
            inline_page: None,
            fill_percent: DEFAULT_FILL_PERCENT,
        }
    }

    /// Opens a bucket from its serialized value in a parent leaf. Inline
    /// buckets copy their page image out of the value so later mutation of
    /// the parent cannot move it from under us.
    pub fn from_value(value: &[u8]) -> Result<Self> {
        let header = BucketHeader::from_bytes(value)?;
        let root = header.root();
        let inline_page = if root == 0 {
            ensure!(
                value.len() >= BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE,
                Error::Corrupted
            );
            Some(value[BUCKET_HEADER_SIZE..].to_vec())
        } else {
            None
        };
        Ok(Self {
            root,
            sequence: header.sequence(),
            nodes: HashMap::new(),
            root_node: None,
            children: HashMap::new(),
            inline_page,
            fill_percent: DEFAULT_FILL_PERCENT,
        })
    }

    /// Serialized value of a brand-new bucket: header plus an empty inline
    /// leaf page.
    pub fn empty_inline_value() -> Vec<u8> {
        let root = crate::tree::node::Node::new_leaf();
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + root.size()];
        BucketHeader::new(0, 0)
            .write_to(&mut value)
            .expect("value holds its header");
        root.write(&mut value[BUCKET_HEADER_SIZE..])
            .expect("value holds its empty root page");
        value
    }
}

pub(crate) fn validate_put(key: &[u8], value_len: usize) -> Result<()> {
    ensure!(!key.is_empty(), Error::KeyRequired);
    ensure!(key.len() <= MAX_KEY_SIZE, Error::KeyTooLarge);
    ensure!(value_len <= MAX_VALUE_SIZE, Error::ValueTooLarge);
    Ok(())
}

fn validate_bucket_name(name: &[u8]) -> Result<()> {
    ensure!(!name.is_empty(), Error::BucketNameRequired);
    ensure!(name.len() <= MAX_KEY_SIZE, Error::KeyTooLarge);
    Ok(())
}

impl TxInner {
    fn seek_exact<'a>(
        &'a self,
        mmap: &'a MmapFile,
        bucket: usize,
        key: &[u8],
    ) -> Result<Option<(&'a [u8], u32)>> {
        let mut stack = CursorStack::new();
        cursor::search(self, mmap, bucket, key, &mut stack)?;
        match cursor::key_value(self, mmap, bucket, &stack)? {
            Some((k, v, flags)) if k == key => Ok(Some((v, flags))),
            _ => Ok(None),
        }
    }

    pub(crate) fn bucket_get(
        &self,
        mmap: &MmapFile,
        bucket: usize,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        match self.seek_exact(mmap, bucket, key)? {
            // a sub-bucket header is not a value
            Some((_, flags)) if flags & BUCKET_LEAF_FLAG != 0 => Ok(None),
            Some((v, _)) => Ok(Some(v.to_vec())),
            None => Ok(None),
        }
    }

    /// Unchecked insert/replace into the bucket's tree; the leaf path is
    /// materialized and the entry landed in the leaf node.
    pub(crate) fn tree_put(
        &mut self,
        mmap: &MmapFile,
        bucket: usize,
        key: &[u8],
        value: Vec<u8>,
        flags: u32,
    ) -> Result<()> {
        let mut stack = CursorStack::new();
        cursor::search(self, mmap, bucket, key, &mut stack)?;
        self.materialize_path(mmap, bucket, &stack)?;
        let leaf_pgid = stack.last().expect("search stack is never empty").pgid;
        let node = self.buckets[bucket]
            .nodes
            .get_mut(&leaf_pgid)
            .expect("leaf was just materialized");
        node.put(key, key, value, 0, flags);
        Ok(())
    }

    fn tree_del(&mut self, mmap: &MmapFile, bucket: usize, key: &[u8]) -> Result<()> {
        let mut stack = CursorStack::new();
        cursor::search(self, mmap, bucket, key, &mut stack)?;
        self.materialize_path(mmap, bucket, &stack)?;
        let leaf_pgid = stack.last().expect("search stack is never empty").pgid;
        let node = self.buckets[bucket]
            .nodes
            .get_mut(&leaf_pgid)
            .expect("leaf was just materialized");
        node.del(key);
        Ok(())
    }

    /// Insert or replace a user value. Returns false when the key exists and
    /// `overwrite` is off.
    pub(crate) fn bucket_put(
        &mut self,
        mmap: &MmapFile,
        bucket: usize,
        key: &[u8],
        value: &[u8],
        overwrite: bool,
    ) -> Result<bool> {
        if let Some((_, flags)) = self.seek_exact(mmap, bucket, key)? {
            ensure!(flags & BUCKET_LEAF_FLAG == 0, Error::IncompatibleValue);
            if !overwrite {
                return Ok(false);
            }
        }
        self.tree_put(mmap, bucket, key, value.to_vec(), 0)?;
        Ok(true)
    }

    /// Remove a user value; deleting a missing key is a no-op, deleting a
    /// sub-bucket entry is refused.
    pub(crate) fn bucket_delete(
        &mut self,
        mmap: &MmapFile,
        bucket: usize,
        key: &[u8],
    ) -> Result<()> {
        match self.seek_exact(mmap, bucket, key)? {
            None => Ok(()),
            Some((_, flags)) => {
                ensure!(flags & BUCKET_LEAF_FLAG == 0, Error::IncompatibleValue);
                self.tree_del(mmap, bucket, key)
            }
        }
    }

    /// Opens a sub-bucket, loading its header (inline or external) from the
    /// parent's tree. Returns the arena index.
    pub(crate) fn open_bucket(
        &mut self,
        mmap: &MmapFile,
        parent: usize,
        name: &[u8],
    ) -> Result<usize> {
        validate_bucket_name(name)?;
        if let Some(&id) = self.buckets[parent].children.get(name) {
            return Ok(id);
        }

        let data = match self.seek_exact(mmap, parent, name)? {
            None => bail!(Error::BucketNotFound),
            Some((_, flags)) if flags & BUCKET_LEAF_FLAG == 0 => {
                bail!(Error::IncompatibleValue)
            }
            Some((value, _)) => BucketData::from_value(value)?,
        };

        let id = self.buckets.len();
        self.buckets.push(data);
        self.buckets[parent].children.insert(name.to_vec(), id);
        Ok(id)
    }

    pub(crate) fn create_bucket(
        &mut self,
        mmap: &MmapFile,
        parent: usize,
        name: &[u8],
        if_not_exists: bool,
    ) -> Result<usize> {
        validate_bucket_name(name)?;

        if let Some((_, flags)) = self.seek_exact(mmap, parent, name)? {
            if flags & BUCKET_LEAF_FLAG != 0 {
                if if_not_exists {
                    return self.open_bucket(mmap, parent, name);
                }
                bail!(Error::BucketExists);
            }
            // a plain value already claims this key
            bail!(Error::IncompatibleValue);
        }

        let value = BucketData::empty_inline_value();
        self.tree_put(mmap, parent, name, value, BUCKET_LEAF_FLAG)?;
        self.open_bucket(mmap, parent, name)
    }

    pub(crate) fn delete_bucket(
        &mut self,
        mmap: &MmapFile,
        fl: &mut Freelist,
        parent: usize,
        name: &[u8],
    ) -> Result<()> {
        validate_bucket_name(name)?;

        match self.seek_exact(mmap, parent, name)? {
            None => bail!(Error::BucketNotFound),
            Some((_, flags)) => {
                ensure!(flags & BUCKET_LEAF_FLAG != 0, Error::IncompatibleValue);
            }
        }

        let child = self.open_bucket(mmap, parent, name)?;
        self.delete_bucket_tree(mmap, fl, child)?;
        self.buckets[parent].children.remove(name);
        self.tree_del(mmap, parent, name)
    }

    /// Recursively frees a bucket's sub-buckets, then every page of its own
    /// tree.
    fn delete_bucket_tree(&mut self, mmap: &MmapFile, fl: &mut Freelist, bucket: usize) -> Result<()> {
        let names = self.bucket_child_names(mmap, bucket)?;
        for name in names {
            let grandchild = self.open_bucket(mmap, bucket, &name)?;
            self.delete_bucket_tree(mmap, fl, grandchild)?;
        }
        self.buckets[bucket].children.clear();
        self.free_bucket_pages(mmap, fl, bucket)
    }

    /// Collects the names of every sub-bucket entry in a bucket.
    fn bucket_child_names(&self, mmap: &MmapFile, bucket: usize) -> Result<Vec<Vec<u8>>> {
        let mut names = Vec::new();
        let mut stack = CursorStack::new();
        stack.push(cursor::ElemRef {
            pgid: self.bucket_root(bucket),
            index: 0,
        });
        cursor::first_descend(self, mmap, bucket, &mut stack)?;
        loop {
            if let Some((k, _, flags)) = cursor::key_value(self, mmap, bucket, &stack)? {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    names.push(k.to_vec());
                }
            }
            if cursor::move_next(self, mmap, bucket, &mut stack)?.is_none() {
                return Ok(names);
            }
        }
    }

    /// Posts every page of the bucket's tree to the freelist, walking nodes
    /// where they shadow pages and pages otherwise.
    fn free_bucket_pages(&mut self, mmap: &MmapFile, fl: &mut Freelist, bucket: usize) -> Result<()> {
        let root = if let Some(rn) = self.buckets[bucket].root_node {
            rn
        } else if self.buckets[bucket].root != 0 {
            self.buckets[bucket].root
        } else {
            // inline and untouched: nothing on disk
            return Ok(());
        };
        self.free_subtree(mmap, fl, bucket, root)
    }

    fn free_subtree(
        &mut self,
        mmap: &MmapFile,
        fl: &mut Freelist,
        bucket: usize,
        pgid: PageId,
    ) -> Result<()> {
        let txid = self.meta.txid();

        if let Some(node) = self.buckets[bucket].nodes.remove(&pgid) {
            if !node.leaf {
                for ino in &node.inodes {
                    self.free_subtree(mmap, fl, bucket, ino.pgid)?;
                }
            }
            if node.pgid != 0 {
                fl.free(txid, node.pgid, node.overflow);
            }
            return Ok(());
        }

        let (overflow, children) = {
            let data = self.page_bytes(mmap, pgid)?;
            let page = Page::from_buf(data)?;
            let mut children = Vec::new();
            if page.is_branch() {
                for i in 0..page.count() {
                    children.push(page.branch_pgid(i)?);
                }
            }
            (page.overflow(), children)
        };
        for child in children {
            self.free_subtree(mmap, fl, bucket, child)?;
        }
        fl.free(txid, pgid, overflow);
        Ok(())
    }

    /// A bucket fits inline when its materialized root is a leaf with no
    /// sub-bucket entries and serializes to at most a quarter page.
    fn bucket_inlineable(&self, bucket: usize) -> bool {
        let b = &self.buckets[bucket];
        let Some(rn) = b.root_node else {
            return false;
        };
        let Some(node) = b.nodes.get(&rn) else {
            return false;
        };
        if !node.leaf {
            return false;
        }
        if node.inodes.iter().any(|ino| ino.flags & BUCKET_LEAF_FLAG != 0) {
            return false;
        }
        node.size() <= self.page_size / 4
    }

    fn write_inline_value(&self, bucket: usize) -> Result<Vec<u8>> {
        let b = &self.buckets[bucket];
        let rn = b.root_node.ok_or_else(|| eyre!(Error::Corrupted))?;
        let node = b.nodes.get(&rn).ok_or_else(|| eyre!(Error::Corrupted))?;

        let mut value = vec![0u8; BUCKET_HEADER_SIZE + node.size()];
        BucketHeader::new(0, b.sequence).write_to(&mut value)?;
        node.write(&mut value[BUCKET_HEADER_SIZE..])?;
        Ok(value)
    }

    /// Commit step 2: spills this bucket and, depth-first, every materialized
    /// sub-bucket, writing each child's updated value back into this
    /// bucket's tree. Returns the new serialized value for the parent, or
    /// `None` when the bucket was never structurally touched.
    pub(crate) fn spill_bucket(
        &mut self,
        mmap: &MmapFile,
        fl: &mut Freelist,
        bucket: usize,
    ) -> Result<Option<Vec<u8>>> {
        let mut children: Vec<(Vec<u8>, usize)> = self.buckets[bucket]
            .children
            .iter()
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        children.sort();

        for (name, child) in children {
            if let Some(value) = self.spill_bucket(mmap, fl, child)? {
                self.tree_put(mmap, bucket, &name, value, BUCKET_LEAF_FLAG)?;
            }
        }

        if self.buckets[bucket].root_node.is_none() {
            return Ok(None);
        }

        if bucket != 0 && self.bucket_inlineable(bucket) {
            let value = self.write_inline_value(bucket)?;
            // the old on-disk tree, if any, is no longer referenced
            self.free_bucket_pages(mmap, fl, bucket)?;
            let b = &mut self.buckets[bucket];
            b.root = 0;
            b.root_node = None;
            b.nodes.clear();
            b.inline_page = Some(value[BUCKET_HEADER_SIZE..].to_vec());
            return Ok(Some(value));
        }

        self.spill_bucket_nodes(fl, bucket)?;

        let b = &self.buckets[bucket];
        let mut value = vec![0u8; BUCKET_HEADER_SIZE];
        BucketHeader::new(b.root, b.sequence).write_to(&mut value)?;
        Ok(Some(value))
    }

    pub(crate) fn bucket_next_sequence(&mut self, mmap: &MmapFile, bucket: usize) -> Result<u64> {
        // materialize the root so the updated header is written on commit
        let root = self.bucket_root(bucket);
        self.node_for(mmap, bucket, root, None)?;
        let b = &mut self.buckets[bucket];
        b.sequence += 1;
        Ok(b.sequence)
    }

    pub(crate) fn bucket_set_sequence(
        &mut self,
        mmap: &MmapFile,
        bucket: usize,
        sequence: u64,
    ) -> Result<()> {
        let root = self.bucket_root(bucket);
        self.node_for(mmap, bucket, root, None)?;
        self.buckets[bucket].sequence = sequence;
        Ok(())
    }
}

/// Handle to one bucket within a transaction. Copyable; all methods take
/// `&self`, and data returned to the caller is owned.
#[derive(Clone, Copy)]
pub struct Bucket<'tx, 'db> {
    pub(crate) tx: &'tx Transaction<'db>,
    pub(crate) id: usize,
}

impl<'tx, 'db> std::fmt::Debug for Bucket<'tx, 'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("id", &self.id).finish()
    }
}

impl<'tx, 'db> Bucket<'tx, 'db> {
    fn require_writable(&self) -> Result<()> {
        let inner = self.tx.inner.borrow();
        ensure!(!inner.closed, Error::TxClosed);
        ensure!(inner.writable, Error::TxReadOnly);
        Ok(())
    }

    /// Retrieves the value for `key`, or `None` when the key is missing or
    /// names a sub-bucket.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.tx.inner.borrow();
        ensure!(!inner.closed, Error::TxClosed);
        inner.bucket_get(self.tx.mmap_ref(), self.id, key)
    }

    /// Inserts or replaces `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_writable()?;
        validate_put(key, value.len())?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        inner.bucket_put(mmap, self.id, key, value, true)?;
        Ok(())
    }

    /// Inserts `key` only if absent; returns whether the value was stored.
    pub fn try_put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.require_writable()?;
        validate_put(key, value.len())?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        inner.bucket_put(mmap, self.id, key, value, false)
    }

    /// Removes `key`. Removing a missing key is a no-op; removing a
    /// sub-bucket entry fails with [`Error::IncompatibleValue`]; use
    /// [`Bucket::delete_bucket`].
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.require_writable()?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        inner.bucket_delete(mmap, self.id, key)
    }

    /// Opens an existing sub-bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        ensure!(!inner.closed, Error::TxClosed);
        let id = inner.open_bucket(mmap, self.id, name)?;
        Ok(Bucket { tx: self.tx, id })
    }

    /// Creates a new sub-bucket; fails with [`Error::BucketExists`] if it
    /// already does.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        self.require_writable()?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        let id = inner.create_bucket(mmap, self.id, name, false)?;
        Ok(Bucket { tx: self.tx, id })
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        self.require_writable()?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        let id = inner.create_bucket(mmap, self.id, name, true)?;
        Ok(Bucket { tx: self.tx, id })
    }

    /// Recursively deletes a sub-bucket and frees every page it occupied.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.require_writable()?;
        let mmap = self.tx.mmap_ref();
        let mut fl = self.tx.db.freelist.lock();
        let mut inner = self.tx.inner.borrow_mut();
        inner.delete_bucket(mmap, &mut fl, self.id, name)
    }

    /// Cursor over this bucket's plain key/value pairs.
    pub fn cursor(&self) -> Cursor<'tx, 'db> {
        Cursor::new(*self)
    }

    /// Cursor over this bucket's sub-bucket names.
    pub fn buckets(&self) -> BucketsCursor<'tx, 'db> {
        BucketsCursor::new(*self)
    }

    pub fn sequence(&self) -> u64 {
        self.tx.inner.borrow().buckets[self.id].sequence
    }

    /// Increments and returns the bucket's sequence counter.
    pub fn next_sequence(&self) -> Result<u64> {
        self.require_writable()?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        inner.bucket_next_sequence(mmap, self.id)
    }

    pub fn set_sequence(&self, sequence: u64) -> Result<()> {
        self.require_writable()?;
        let mmap = self.tx.mmap_ref();
        let mut inner = self.tx.inner.borrow_mut();
        inner.bucket_set_sequence(mmap, self.id, sequence)
    }

    /// Root page id of this bucket; 0 while the bucket is stored inline.
    pub fn root(&self) -> PageId {
        self.tx.inner.borrow().buckets[self.id].root
    }

    /// Split threshold as a fraction of the page size. Values are clamped to
    /// `[0.1, 1.0]` at split time; higher packs pages denser, lower leaves
    /// room for future inserts.
    pub fn set_fill_percent(&self, fill_percent: f64) {
        self.tx.inner.borrow_mut().buckets[self.id].fill_percent = fill_percent;
    }

    /// Calls `f` for every plain key/value pair, in key order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut cursor = self.cursor();
        let mut entry = cursor.first()?;
        while let Some((key, value)) = entry {
            f(&key, &value)?;
            entry = cursor.next()?;
        }
        Ok(())
    }

    /// Calls `f` for every sub-bucket name, in order.
    pub fn for_each_bucket(&self, mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let mut cursor = self.buckets();
        let mut entry = cursor.first()?;
        while let Some(name) = entry {
            f(&name)?;
            entry = cursor.next()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<BucketHeader>(), 16);
    }

    #[test]
    fn bucket_header_roundtrip() {
        let header = BucketHeader::new(42, 7);
        let mut buf = [0u8; 16];
        header.write_to(&mut buf).unwrap();

        let parsed = BucketHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.root(), 42);
        assert_eq!(parsed.sequence(), 7);
    }

    #[test]
    fn empty_inline_value_parses_as_inline_bucket() {
        let value = BucketData::empty_inline_value();
        let data = BucketData::from_value(&value).unwrap();

        assert_eq!(data.root, 0);
        assert_eq!(data.sequence, 0);
        let page = Page::from_buf(data.inline_page.as_deref().unwrap()).unwrap();
        assert!(page.is_leaf());
        assert_eq!(page.count(), 0);
    }

    #[test]
    fn from_value_rejects_truncated_inline_page() {
        let value = vec![0u8; BUCKET_HEADER_SIZE + 3];
        let err = BucketData::from_value(&value).unwrap_err();

        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Corrupted));
    }

    #[test]
    fn from_value_external_root_has_no_inline_page() {
        let mut value = vec![0u8; BUCKET_HEADER_SIZE];
        BucketHeader::new(9, 3).write_to(&mut value).unwrap();

        let data = BucketData::from_value(&value).unwrap();
        assert_eq!(data.root, 9);
        assert_eq!(data.sequence, 3);
        assert!(data.inline_page.is_none());
    }

    #[test]
    fn validate_put_boundaries() {
        assert_eq!(
            validate_put(b"", 0).unwrap_err().downcast_ref::<Error>(),
            Some(&Error::KeyRequired)
        );
        assert_eq!(
            validate_put(&vec![0u8; MAX_KEY_SIZE + 1], 0)
                .unwrap_err()
                .downcast_ref::<Error>(),
            Some(&Error::KeyTooLarge)
        );
        assert!(validate_put(&vec![0u8; MAX_KEY_SIZE], 0).is_ok());
        assert!(validate_put(b"k", MAX_VALUE_SIZE).is_ok());
        assert_eq!(
            validate_put(b"k", MAX_VALUE_SIZE + 1)
                .unwrap_err()
                .downcast_ref::<Error>(),
            Some(&Error::ValueTooLarge)
        );
        assert!(validate_put(b"k", 0).is_ok());
    }
}
