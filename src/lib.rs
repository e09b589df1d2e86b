//! # burrowdb - Embedded Transactional Key/Value Store
//!
//! burrowdb is an embedded, single-file, transactional key/value store: a
//! copy-on-write B+tree over a memory-mapped file with full ACID semantics
//! for a single writer and any number of concurrent readers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::Database;
//!
//! let db = Database::open("./app.db")?;
//!
//! db.update(|tx| {
//!     let widgets = tx.create_bucket_if_not_exists(b"widgets")?;
//!     widgets.put(b"a", b"1")?;
//!     Ok(())
//! })?;
//!
//! db.view(|tx| {
//!     let widgets = tx.bucket(b"widgets")?;
//!     assert_eq!(widgets.get(b"a")?, Some(b"1".to_vec()));
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Public API (Database/Transaction)  │
//! ├─────────────────────────────────────┤
//! │   Buckets │ Cursors │ Node shadows  │
//! ├─────────────────────────────────────┤
//! │  Page codec │ Freelist (MVCC reuse) │
//! ├─────────────────────────────────────┤
//! │   Memory-mapped single-file I/O     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Copy-on-write**: a commit never overwrites a live page. The modified
//!   path is rewritten onto freshly allocated pages, then one of two
//!   alternating, checksummed meta pages is published with an fsync. A crash
//!   at any byte boundary leaves either the old or the new version intact.
//! - **MVCC reads**: read transactions pin the meta they started from; pages
//!   they can still see are quarantined on a pending list and reused only
//!   after every older reader has closed.
//! - **Ordered buckets**: keys are sorted byte strings inside named buckets,
//!   which nest recursively. Tiny buckets are stored inline in their
//!   parent's leaf to avoid burning a page each.
//! - **Zero-copy reads**: lookups walk the map directly; only the returned
//!   keys and values are copied out.
//!
//! ## Concurrency
//!
//! One writer at a time (serialized internally), any number of readers.
//! Readers hold the shared side of the remap latch, so a commit that must
//! grow the map waits for them; do not open a write transaction while the
//! same thread holds a read transaction. Multi-process access is out of
//! scope; guard the file with an external lock if multiple processes may
//! open it.
//!
//! ## Module Overview
//!
//! - `storage`: page codec, meta record, memory map, freelist
//! - `tree`: buckets, cursors, and the copy-on-write node machinery
//! - `db`: database handle, open options, transaction lifecycle

mod db;
mod error;
mod storage;
mod tree;

pub use db::{Database, Options, Transaction, TxStats};
pub use error::Error;
pub use storage::{PageId, TxnId, DEFAULT_PAGE_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use tree::{Bucket, BucketsCursor, Cursor};
