//! # B+Tree Module
//!
//! The copy-on-write B+tree: buckets (named roots, recursively nestable),
//! cursors (stack-based walkers over pages and materialized nodes), and
//! nodes (the in-memory mutable shadows a write transaction edits before
//! commit rewrites the modified path onto fresh pages).
//!
//! Reads walk pages straight out of the memory map and copy nothing but the
//! returned keys and values. Writes materialize the touched root-to-leaf
//! path as nodes inside the owning bucket, so the transaction sees its own
//! uncommitted state through the same cursors.

pub(crate) mod bucket;
pub(crate) mod cursor;
pub(crate) mod node;

pub use bucket::Bucket;
pub use cursor::{BucketsCursor, Cursor};
