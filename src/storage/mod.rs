//! # Storage Module
//!
//! This module provides the foundational storage layer for burrowdb: the
//! on-disk page formats, the memory-mapped file, and the free-page accounting
//! that backs MVCC page reuse.
//!
//! ## Architecture Overview
//!
//! The database is a single file of fixed-size pages. Reads go through a
//! shared read-only memory map; writes go through positional file writes
//! performed by the committing write transaction, followed by an fsync and a
//! meta-page swap. Readers therefore never observe torn pages: until the new
//! meta page is durable, the previous meta (and every page it references)
//! remains the authoritative tree.
//!
//! ## File Layout
//!
//! ```text
//! page 0   meta (txid even)
//! page 1   meta (txid odd)
//! page 2.. freelist, branch, and leaf pages, allocated copy-on-write
//! ```
//!
//! The two meta pages alternate: a committing transaction writes its meta to
//! slot `txid % 2`, so a crash mid-write damages at most the non-current
//! slot. On open, whichever meta has the higher transaction id *and* a valid
//! checksum wins.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when the file grows and is remapped.
//! Remapping takes the exclusive side of a reader/writer latch while every
//! open read transaction holds the shared side, so a mapping is never pulled
//! out from under a borrowed page slice.
//!
//! ## Module Organization
//!
//! - `page`: page header, branch/leaf element layouts, `Page` view, `PageBuf`
//! - `meta`: the meta record and its CRC-64 checksum
//! - `mmap`: `MmapFile`, grow/remap sizing
//! - `freelist`: free page tracking with per-transaction pending lists

mod freelist;
mod meta;
mod mmap;
mod page;

pub(crate) use freelist::Freelist;
pub(crate) use meta::{Meta, META_SIZE, PGID_NO_FREELIST};
pub(crate) use mmap::MmapFile;
pub(crate) use page::{
    BranchElem, LeafElem, Page, PageBuf, PageHeader, PageType, BRANCH_ELEM_SIZE,
    BUCKET_LEAF_FLAG, LEAF_ELEM_SIZE, PAGE_HEADER_SIZE,
};

use eyre::{eyre, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::Error;

/// 64-bit index of a page within the database file.
pub type PageId = u64;

/// 64-bit monotone transaction id; one per committed write transaction.
pub type TxnId = u64;

/// Default page size for newly created databases.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

pub(crate) const MIN_PAGE_SIZE: usize = 512;
pub(crate) const MAX_PAGE_SIZE: usize = 65536;

/// Minimum number of elements a page keeps on either side of a split.
pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

/// Largest contiguous page run a single allocation may cover.
pub(crate) const MAX_ALLOC_SIZE: usize = (1 << 31) - 1;

/// Ceiling on the mapped region: 256 TiB.
pub(crate) const MAX_MAP_SIZE: u64 = 1 << 48;

/// Once the map exceeds 1 GiB it grows in steps of this size.
pub(crate) const MAX_MMAP_STEP: u64 = 1 << 30;

pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;

/// Target fraction of a page to fill when choosing a split point.
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Interprets the front of `bytes` as an on-disk record, leaving any trailing
/// payload alone. Every record type in this crate is `Unaligned`, so the only
/// way the cast can fail is a buffer too short for the record, which means a
/// page header lied about its contents: the caller sees [`Error::Corrupted`].
#[inline]
pub(crate) fn read_record<T>(bytes: &[u8]) -> Result<&T>
where
    T: FromBytes + KnownLayout + Immutable,
{
    match T::ref_from_prefix(bytes) {
        Ok((record, _rest)) => Ok(record),
        Err(_) => Err(eyre!(Error::Corrupted)),
    }
}

/// Mutable variant of [`read_record`], for patching a record in place.
#[inline]
pub(crate) fn read_record_mut<T>(bytes: &mut [u8]) -> Result<&mut T>
where
    T: FromBytes + IntoBytes + KnownLayout,
{
    match T::mut_from_prefix(bytes) {
        Ok((record, _rest)) => Ok(record),
        Err(_) => Err(eyre!(Error::Corrupted)),
    }
}
