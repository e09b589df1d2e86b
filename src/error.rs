//! # Error Kinds
//!
//! Well-known failure classes raised by the database. All fallible operations
//! return `eyre::Result`; the variants below are attached to the report so
//! callers can classify failures with `err.downcast_ref::<Error>()` while the
//! report text still carries free-form context (paths, page numbers).
//!
//! Argument violations (`KeyRequired`, `KeyTooLarge`, `ValueTooLarge`,
//! `Bucket*`, `IncompatibleValue`) surface immediately from the offending
//! call. I/O errors during commit roll the write transaction back before the
//! meta page is updated, leaving the database usable on its prior snapshot.
//! Format errors (`Invalid`, `Corrupted`) are fatal to `open`. Internal
//! invariant violations (a double free in the freelist) panic.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The file is not a database: bad magic, version, or meta checksum.
    #[error("invalid database: bad magic, version, or checksum")]
    Invalid,
    /// The file is a database but its structure is damaged: truncated file,
    /// page reference out of bounds, element extents past the page end.
    #[error("database file is corrupted")]
    Corrupted,
    /// The transaction has already been committed or rolled back.
    #[error("transaction is closed")]
    TxClosed,
    /// A mutating operation was attempted on a read-only transaction.
    #[error("transaction is read-only")]
    TxReadOnly,
    /// A write transaction was requested on a read-only database.
    #[error("database is opened in read-only mode")]
    DatabaseReadOnly,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("bucket already exists")]
    BucketExists,
    #[error("bucket name required")]
    BucketNameRequired,
    #[error("key required")]
    KeyRequired,
    #[error("key too large")]
    KeyTooLarge,
    #[error("value too large")]
    ValueTooLarge,
    /// The key names a value of the other kind: a `put`/`delete` aimed at a
    /// sub-bucket, or a bucket operation aimed at a plain value.
    #[error("incompatible value")]
    IncompatibleValue,
}
