//! Attachment storage for the chat relay.
//!
//! Bytes live on disk, one file per `fileId`, written atomically. Metadata
//! (original name, content type, size, SHA-256) lives in a small SQLite table
//! and the hash is re-checked on every read.

mod store;

pub use store::{atomic_write, encode_filename, BlobError, BlobStore, FileMeta, Result};
