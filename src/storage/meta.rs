//! # Meta Record
//!
//! The meta record describes one complete, committed version of the database:
//! the root bucket, the freelist location, the allocation high-water mark,
//! and the transaction id that produced it. Two copies live at pages 0 and 1;
//! a committing transaction writes slot `txid % 2`, so the previous version
//! survives any crash during the write.
//!
//! ## Layout (64 bytes, little endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       4     magic (0xED0CDAED)
//! 4       4     version (2)
//! 8       4     page_size
//! 12      4     flags
//! 16      8     root_pgid       root bucket page id
//! 24      8     root_sequence   root bucket sequence counter
//! 32      8     freelist        freelist page id (u64::MAX = not persisted)
//! 40      8     pgid            allocation high-water mark
//! 48      8     txid
//! 56      8     checksum        CRC-64/ECMA-182 over bytes 0..56
//! ```
//!
//! The checksum covers every preceding field, so a torn meta write is
//! indistinguishable from a corrupt one and the other slot is used instead.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::Error;

use super::{read_record, PageId, TxnId};

pub(crate) const MAGIC: u32 = 0xED0C_DAED;
pub(crate) const VERSION: u32 = 2;

/// Sentinel freelist page id: the freelist was not persisted and must be
/// rebuilt by scanning the file on the next open.
pub(crate) const PGID_NO_FREELIST: PageId = u64::MAX;

pub(crate) const META_SIZE: usize = 64;
const CHECKSUM_OFFSET: usize = 56;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    root_pgid: U64,
    root_sequence: U64,
    freelist: U64,
    pgid: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            page_size: U32::new(page_size),
            flags: U32::new(0),
            root_pgid: U64::new(0),
            root_sequence: U64::new(0),
            freelist: U64::new(0),
            pgid: U64::new(0),
            txid: U64::new(0),
            checksum: U64::new(0),
        }
    }

    /// Parses a meta record from raw bytes. Only the record shape is checked
    /// here; call [`Meta::validate`] before trusting the contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        read_record(bytes)
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= META_SIZE,
            "meta record needs {} bytes, got {}",
            META_SIZE,
            data.len()
        );
        data[..META_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn magic(&self) -> u32 {
        self.magic.get()
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn root_pgid(&self) -> PageId {
        self.root_pgid.get()
    }

    pub fn root_sequence(&self) -> u64 {
        self.root_sequence.get()
    }

    pub fn freelist(&self) -> PageId {
        self.freelist.get()
    }

    pub fn set_freelist(&mut self, pgid: PageId) {
        self.freelist = U64::new(pgid);
    }

    pub fn pgid(&self) -> PageId {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: PageId) {
        self.pgid = U64::new(pgid);
    }

    pub fn txid(&self) -> TxnId {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: TxnId) {
        self.txid = U64::new(txid);
    }

    pub fn set_root(&mut self, pgid: PageId, sequence: u64) {
        self.root_pgid = U64::new(pgid);
        self.root_sequence = U64::new(sequence);
    }

    pub fn sum64(&self) -> u64 {
        CRC64.checksum(&self.as_bytes()[..CHECKSUM_OFFSET])
    }

    pub fn update_checksum(&mut self) {
        self.checksum = U64::new(self.sum64());
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.magic.get() == MAGIC, Error::Invalid);
        ensure!(self.version.get() == VERSION, Error::Invalid);
        ensure!(self.checksum.get() == self.sum64(), Error::Invalid);
        Ok(())
    }
}
