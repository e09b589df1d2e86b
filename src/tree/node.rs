//! # In-Memory Nodes
//!
//! A `Node` is the mutable shadow of one page, materialized the first time a
//! write transaction touches the path leading to it. Reads never materialize
//! nodes; they walk pages straight out of the map. Writes materialize the
//! whole path from the bucket root down to the target leaf, mutate the leaf's
//! inode vector, and leave the rest to commit time:
//!
//! - **rebalance** merges under-filled nodes (below a quarter page or the
//!   minimum key count) into a sibling, always preferring to merge into the
//!   left sibling so the separator keys stay monotone, and collapses a root
//!   branch with a single child.
//! - **spill** runs post-order over the materialized subtree, splits each
//!   node at the fill-percent boundary, allocates fresh pages for every
//!   piece (freeing the shadowed source page), and serializes them into the
//!   transaction's dirty-page set. The parent replaces its single child entry
//!   with one entry per piece; when the root itself splits, a new branch root
//!   is built from the pieces and spilled in turn. This is the copy-on-write
//!   step: the entire modified path is rewritten onto fresh pages.
//!
//! Nodes reference their parent by page id, resolved through the owning
//! bucket's node cache; there are no owning pointer cycles. Inode keys and
//! values are owned buffers, copied out of the map at materialization time,
//! so node mutation never aliases the mapping.

use eyre::{ensure, eyre, Result};

use crate::db::transaction::TxInner;
use crate::error::Error;
use crate::storage::{
    BranchElem, Freelist, LeafElem, MmapFile, Page, PageBuf, PageHeader, PageId, PageType,
    BRANCH_ELEM_SIZE, LEAF_ELEM_SIZE, MAX_FILL_PERCENT, MIN_FILL_PERCENT, MIN_KEYS_PER_PAGE,
    PAGE_HEADER_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inode {
    pub flags: u32,
    pub pgid: PageId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub leaf: bool,
    pub unbalanced: bool,
    pub spilled: bool,
    /// Key this node is filed under in its parent; fixed at read time even
    /// if smaller keys are inserted later.
    pub key: Vec<u8>,
    /// Source page id; 0 for nodes with no on-disk identity yet.
    pub pgid: PageId,
    /// Overflow count of the source page, needed to free the whole run.
    pub overflow: u32,
    /// Page id of the parent node in the bucket's node cache.
    pub parent: Option<PageId>,
    pub inodes: Vec<Inode>,
}

impl Node {
    pub fn new_leaf() -> Self {
        Self {
            leaf: true,
            unbalanced: false,
            spilled: false,
            key: Vec::new(),
            pgid: 0,
            overflow: 0,
            parent: None,
            inodes: Vec::new(),
        }
    }

    pub fn new_branch(inodes: Vec<Inode>) -> Self {
        Self {
            leaf: false,
            unbalanced: false,
            spilled: false,
            key: Vec::new(),
            pgid: 0,
            overflow: 0,
            parent: None,
            inodes,
        }
    }

    /// Materializes a node from a page, copying keys and values into owned
    /// buffers.
    pub fn read(page: Page<'_>, pgid: PageId, parent: Option<PageId>) -> Result<Self> {
        let leaf = page.is_leaf();
        ensure!(leaf || page.is_branch(), Error::Corrupted);

        let count = page.count();
        let mut inodes = Vec::with_capacity(count);
        for i in 0..count {
            if leaf {
                let (key, value, flags) = page.leaf_entry(i)?;
                inodes.push(Inode {
                    flags,
                    pgid: 0,
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
            } else {
                inodes.push(Inode {
                    flags: 0,
                    pgid: page.branch_pgid(i)?,
                    key: page.branch_key(i)?.to_vec(),
                    value: Vec::new(),
                });
            }
        }

        let key = inodes.first().map(|ino| ino.key.clone()).unwrap_or_default();

        Ok(Self {
            leaf,
            unbalanced: false,
            spilled: false,
            key,
            pgid,
            overflow: page.overflow(),
            parent,
            inodes,
        })
    }

    pub fn min_keys(&self) -> usize {
        if self.leaf {
            1
        } else {
            MIN_KEYS_PER_PAGE
        }
    }

    fn elem_size(&self) -> usize {
        if self.leaf {
            LEAF_ELEM_SIZE
        } else {
            BRANCH_ELEM_SIZE
        }
    }

    /// Bytes needed to serialize this node into a page run.
    pub fn size(&self) -> usize {
        let elem = self.elem_size();
        PAGE_HEADER_SIZE
            + self
                .inodes
                .iter()
                .map(|ino| elem + ino.key.len() + ino.value.len())
                .sum::<usize>()
    }

    /// Inserts or replaces an entry. `old_key` locates the slot (it differs
    /// from `new_key` only when a parent rewrites a child reference).
    pub fn put(&mut self, old_key: &[u8], new_key: &[u8], value: Vec<u8>, pgid: PageId, flags: u32) {
        match self
            .inodes
            .binary_search_by(|ino| ino.key.as_slice().cmp(old_key))
        {
            Ok(i) => {
                self.inodes[i] = Inode {
                    flags,
                    pgid,
                    key: new_key.to_vec(),
                    value,
                };
            }
            Err(i) => {
                self.inodes.insert(
                    i,
                    Inode {
                        flags,
                        pgid,
                        key: new_key.to_vec(),
                        value,
                    },
                );
                self.unbalanced = true;
            }
        }
    }

    /// Removes an entry by exact key; a miss is a no-op.
    pub fn del(&mut self, key: &[u8]) {
        if let Ok(i) = self
            .inodes
            .binary_search_by(|ino| ino.key.as_slice().cmp(key))
        {
            self.inodes.remove(i);
            self.unbalanced = true;
        }
    }

    /// Serializes the node into `out`, which must already hold a page header
    /// (id and overflow are preserved; flags and count are set here).
    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() >= self.size(),
            "page buffer too small for node: {} < {}",
            out.len(),
            self.size()
        );
        ensure!(self.inodes.len() < 0xFFFF, Error::Corrupted);

        let typ = if self.leaf {
            PageType::Leaf
        } else {
            PageType::Branch
        };
        let header = PageHeader::from_bytes_mut(out)?;
        header.set_flags(typ.flags());
        header.set_count(self.inodes.len() as u16);

        let elem_size = self.elem_size();
        let mut data_off = PAGE_HEADER_SIZE + self.inodes.len() * elem_size;
        for (i, ino) in self.inodes.iter().enumerate() {
            let elem_off = PAGE_HEADER_SIZE + i * elem_size;
            let pos = (data_off - elem_off) as u32;
            if self.leaf {
                LeafElem::new(ino.flags, pos, ino.key.len() as u32, ino.value.len() as u32)
                    .write_to(&mut out[elem_off..])?;
            } else {
                BranchElem::new(pos, ino.key.len() as u32, ino.pgid)
                    .write_to(&mut out[elem_off..])?;
            }
            out[data_off..data_off + ino.key.len()].copy_from_slice(&ino.key);
            data_off += ino.key.len();
            out[data_off..data_off + ino.value.len()].copy_from_slice(&ino.value);
            data_off += ino.value.len();
        }

        Ok(())
    }

    /// Splits into a chain of sibling nodes, each fitting one page at the
    /// configured fill percent. A node at or under one page returns itself.
    pub fn split(self, page_size: usize, fill_percent: f64) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut node = self;
        loop {
            match node.split_two(page_size, fill_percent) {
                Some(rest) => {
                    nodes.push(node);
                    node = rest;
                }
                None => {
                    nodes.push(node);
                    break;
                }
            }
        }
        nodes
    }

    fn split_two(&mut self, page_size: usize, fill_percent: f64) -> Option<Node> {
        if self.inodes.len() <= MIN_KEYS_PER_PAGE * 2 || self.size() <= page_size {
            return None;
        }

        let fill = fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill) as usize;
        let index = self.split_index(threshold);
        let rest = self.inodes.split_off(index);

        Some(Node {
            leaf: self.leaf,
            unbalanced: false,
            spilled: false,
            key: Vec::new(),
            pgid: 0,
            overflow: 0,
            parent: self.parent,
            inodes: rest,
        })
    }

    /// Highest index whose prefix serializes to at most `threshold` bytes,
    /// keeping at least `MIN_KEYS_PER_PAGE` entries on each side.
    fn split_index(&self, threshold: usize) -> usize {
        let elem_size = self.elem_size();
        let mut sz = PAGE_HEADER_SIZE;
        let mut index = 0;
        let max = self.inodes.len() - MIN_KEYS_PER_PAGE;
        for (i, ino) in self.inodes.iter().take(max).enumerate() {
            index = i;
            let el = elem_size + ino.key.len() + ino.value.len();
            if i >= MIN_KEYS_PER_PAGE && sz + el > threshold {
                break;
            }
            sz += el;
        }
        index
    }
}

impl TxInner {
    /// Ensures the node for `pgid` is materialized in the bucket's cache.
    /// `pgid` 0 names the bucket's inline root page.
    pub(crate) fn node_for(
        &mut self,
        mmap: &MmapFile,
        bucket: usize,
        pgid: PageId,
        parent: Option<PageId>,
    ) -> Result<()> {
        if self.buckets[bucket].nodes.contains_key(&pgid) {
            return Ok(());
        }

        let node = if pgid == 0 {
            let data = self.buckets[bucket]
                .inline_page
                .as_deref()
                .ok_or_else(|| eyre!(Error::Corrupted))?;
            Node::read(Page::from_buf(data)?, 0, parent)?
        } else {
            let data = self.page_bytes(mmap, pgid)?;
            Node::read(Page::from_buf(data)?, pgid, parent)?
        };

        let b = &mut self.buckets[bucket];
        if parent.is_none() {
            b.root_node = Some(pgid);
        }
        b.nodes.insert(pgid, node);
        self.stats.node_count += 1;
        Ok(())
    }

    /// Materializes every node along a cursor stack, root first.
    pub(crate) fn materialize_path(
        &mut self,
        mmap: &MmapFile,
        bucket: usize,
        stack: &[crate::tree::cursor::ElemRef],
    ) -> Result<()> {
        let mut parent = None;
        for frame in stack {
            self.node_for(mmap, bucket, frame.pgid, parent)?;
            parent = Some(frame.pgid);
        }
        Ok(())
    }

    /// Commit step 1: merge or collapse every unbalanced node, in this
    /// bucket and every materialized sub-bucket.
    pub(crate) fn rebalance_bucket(
        &mut self,
        mmap: &MmapFile,
        fl: &mut Freelist,
        bucket: usize,
    ) -> Result<()> {
        let pgids: Vec<PageId> = self.buckets[bucket].nodes.keys().copied().collect();
        for pgid in pgids {
            self.rebalance_node(mmap, fl, bucket, pgid)?;
        }

        let children: Vec<usize> = self.buckets[bucket].children.values().copied().collect();
        for child in children {
            self.rebalance_bucket(mmap, fl, child)?;
        }
        Ok(())
    }

    fn rebalance_node(
        &mut self,
        mmap: &MmapFile,
        fl: &mut Freelist,
        bucket: usize,
        pgid: PageId,
    ) -> Result<()> {
        let (unbalanced, size, len, min_keys, leaf, parent) = {
            // the node may already have been merged away by an earlier pass
            let Some(node) = self.buckets[bucket].nodes.get(&pgid) else {
                return Ok(());
            };
            (
                node.unbalanced,
                node.size(),
                node.inodes.len(),
                node.min_keys(),
                node.leaf,
                node.parent,
            )
        };
        if !unbalanced {
            return Ok(());
        }
        if let Some(node) = self.buckets[bucket].nodes.get_mut(&pgid) {
            node.unbalanced = false;
        }
        self.stats.rebalance += 1;

        let threshold = self.page_size / 4;
        if size > threshold && len > min_keys {
            return Ok(());
        }

        let Some(parent_pgid) = parent else {
            // root branch with a single child: the child becomes the root
            if !leaf && len == 1 {
                let child_pgid = self.buckets[bucket].nodes[&pgid].inodes[0].pgid;
                self.node_for(mmap, bucket, child_pgid, Some(pgid))?;
                let child = self.buckets[bucket]
                    .nodes
                    .remove(&child_pgid)
                    .expect("child node was just materialized");
                let b = &mut self.buckets[bucket];
                let root = b.nodes.get_mut(&pgid).expect("root node is cached");
                root.leaf = child.leaf;
                root.inodes = child.inodes;
                for n in b.nodes.values_mut() {
                    if n.parent == Some(child_pgid) {
                        n.parent = Some(pgid);
                    }
                }
                if child.pgid != 0 {
                    fl.free(self.meta.txid(), child.pgid, child.overflow);
                }
            }
            return Ok(());
        };

        if len == 0 {
            // the node emptied out entirely; unlink it from its parent
            let node = self.buckets[bucket]
                .nodes
                .remove(&pgid)
                .expect("node is cached");
            let parent_node = self.buckets[bucket]
                .nodes
                .get_mut(&parent_pgid)
                .expect("nodes are materialized with their parents");
            parent_node.del(&node.key);
            if node.pgid != 0 {
                fl.free(self.meta.txid(), node.pgid, node.overflow);
            }
            return self.rebalance_node(mmap, fl, bucket, parent_pgid);
        }

        let (idx, sibling_count) = {
            let p = &self.buckets[bucket].nodes[&parent_pgid];
            let idx = p
                .inodes
                .iter()
                .position(|ino| ino.pgid == pgid)
                .ok_or_else(|| eyre!("node {} missing from its parent", pgid))?;
            (idx, p.inodes.len())
        };
        if sibling_count < 2 {
            // nothing to pair with; the parent's own rebalance handles it
            return Ok(());
        }

        let txid = self.meta.txid();
        if idx == 0 {
            // leftmost node: pull the right sibling's entries into this one
            let sib_pgid = self.buckets[bucket].nodes[&parent_pgid].inodes[1].pgid;
            self.node_for(mmap, bucket, sib_pgid, Some(parent_pgid))?;
            let sib = self.buckets[bucket]
                .nodes
                .remove(&sib_pgid)
                .expect("sibling was just materialized");
            let b = &mut self.buckets[bucket];
            for n in b.nodes.values_mut() {
                if n.parent == Some(sib_pgid) {
                    n.parent = Some(pgid);
                }
            }
            b.nodes
                .get_mut(&pgid)
                .expect("node is cached")
                .inodes
                .extend(sib.inodes);
            b.nodes
                .get_mut(&parent_pgid)
                .expect("parent is cached")
                .del(&sib.key);
            if sib.pgid != 0 {
                fl.free(txid, sib.pgid, sib.overflow);
            }
        } else {
            // merge into the left sibling so the split key stays monotone
            let sib_pgid = self.buckets[bucket].nodes[&parent_pgid].inodes[idx - 1].pgid;
            self.node_for(mmap, bucket, sib_pgid, Some(parent_pgid))?;
            let node = self.buckets[bucket]
                .nodes
                .remove(&pgid)
                .expect("node is cached");
            let b = &mut self.buckets[bucket];
            for n in b.nodes.values_mut() {
                if n.parent == Some(pgid) {
                    n.parent = Some(sib_pgid);
                }
            }
            b.nodes
                .get_mut(&sib_pgid)
                .expect("sibling was just materialized")
                .inodes
                .extend(node.inodes);
            b.nodes
                .get_mut(&parent_pgid)
                .expect("parent is cached")
                .del(&node.key);
            if node.pgid != 0 {
                fl.free(txid, node.pgid, node.overflow);
            }
        }

        self.rebalance_node(mmap, fl, bucket, parent_pgid)
    }

    /// Commit step 2 for one bucket: split every materialized node to fit,
    /// write the pieces onto fresh pages, and install the new root page id.
    pub(crate) fn spill_bucket_nodes(&mut self, fl: &mut Freelist, bucket: usize) -> Result<()> {
        let Some(root_key) = self.buckets[bucket].root_node else {
            return Ok(());
        };

        let mut parts = self.spill_node(fl, bucket, root_key)?;
        while parts.len() > 1 {
            // the root split: grow the tree by one level and spill the new root
            let inodes = parts
                .into_iter()
                .map(|(key, pgid)| Inode {
                    flags: 0,
                    pgid,
                    key,
                    value: Vec::new(),
                })
                .collect();
            parts = self.write_spilled(fl, bucket, Node::new_branch(inodes))?;
        }

        let (_, new_root) = parts.pop().expect("spill produces at least one page");
        let b = &mut self.buckets[bucket];
        b.root = new_root;
        b.root_node = None;
        b.inline_page = None;
        b.nodes.clear();
        Ok(())
    }

    /// Post-order spill: children first, so this node's entries reference
    /// their final page ids before it is serialized itself. Returns one
    /// `(min_key, pgid)` entry per piece the node split into.
    fn spill_node(
        &mut self,
        fl: &mut Freelist,
        bucket: usize,
        pgid: PageId,
    ) -> Result<Vec<(Vec<u8>, PageId)>> {
        let mut node = self.buckets[bucket]
            .nodes
            .remove(&pgid)
            .ok_or_else(|| eyre!("node {} vanished from the cache during spill", pgid))?;

        if !node.leaf {
            let mut i = 0;
            while i < node.inodes.len() {
                let child_pgid = node.inodes[i].pgid;
                if self.buckets[bucket].nodes.contains_key(&child_pgid) {
                    let parts = self.spill_node(fl, bucket, child_pgid)?;
                    let added = parts.len();
                    node.inodes.splice(
                        i..=i,
                        parts.into_iter().map(|(key, pgid)| Inode {
                            flags: 0,
                            pgid,
                            key,
                            value: Vec::new(),
                        }),
                    );
                    i += added;
                } else {
                    i += 1;
                }
            }
        }

        self.write_spilled(fl, bucket, node)
    }

    fn write_spilled(
        &mut self,
        fl: &mut Freelist,
        bucket: usize,
        node: Node,
    ) -> Result<Vec<(Vec<u8>, PageId)>> {
        debug_assert!(!node.spilled, "node {} spilled twice", node.pgid);
        if node.pgid != 0 {
            fl.free(self.meta.txid(), node.pgid, node.overflow);
        }

        let page_size = self.page_size;
        let fill = self.buckets[bucket].fill_percent;
        let parts = node.split(page_size, fill);
        if parts.len() > 1 {
            self.stats.split += (parts.len() - 1) as u64;
        }

        let mut out = Vec::with_capacity(parts.len());
        for mut part in parts {
            let pages = part.size().div_ceil(page_size);
            let pgid = self.allocate(fl, pages)?;
            part.pgid = pgid;

            let typ = if part.leaf {
                PageType::Leaf
            } else {
                PageType::Branch
            };
            let mut buf = PageBuf::new(page_size, pages, pgid, typ);
            part.write(buf.bytes_mut())?;
            part.spilled = true;
            self.stats.spill += 1;

            let key = part
                .inodes
                .first()
                .map(|ino| ino.key.clone())
                .unwrap_or_default();
            self.pages.insert(pgid, buf);
            out.push((key, pgid));
        }
        Ok(out)
    }
}
