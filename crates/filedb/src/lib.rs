//! Deduplicating, reference-counted content-addressed file store.
//!
//! Each distinct byte sequence is stored once, keyed by its BLAKE3 digest,
//! and tracked by a record with a stable integer id. Owners hold ids; adding
//! identical content again takes another reference to the same record, and
//! the blob is deleted when the last reference is released.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use filedb::{ByteRange, DedupEngine, StoreConfig};
//!
//! // Create from environment (reads FILEDB_PATH)
//! let config = StoreConfig::from_env().unwrap();
//! let engine = DedupEngine::open(&config).unwrap();
//!
//! // Store content
//! let record = engine.add(b"Hello, World!", None).unwrap();
//! println!("Stored {} as {}", record.id, record.filename());
//!
//! // Read it back, verifying the digest
//! let data = engine.read(record.id, true).unwrap();
//!
//! // Or just a slice of it
//! let part = engine.stream(record.id, ByteRange::new(0, Some(4)), false).unwrap();
//! println!("{}", part.range().content_range());
//!
//! // Drop the reference; the blob goes with the last one
//! engine.release(record.id, false).unwrap();
//! ```
//!
//! # Layout
//!
//! ```text
//! {base_path}/
//! ├── index.db          # records, unique on digest
//! ├── objects/ab/cde…   # blobs (files backend)
//! ├── blobs.db          # blobs (column backend)
//! └── staging/          # spooled uploads
//! ```
//!
//! # Sharing
//!
//! Many threads and processes may use one store. The SQLite index decides
//! every race: concurrent adds of the same content end up on one record, and
//! concurrent releases delete it exactly once.

pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod index;
pub mod range;
pub mod reconcile;
pub mod record;
pub mod slot;
pub mod sniff;
pub mod spool;

// Re-exports for convenience
pub use blob::{BlobStore, ColumnBlobStore, FileBlobStore};
pub use config::{Backend, BlobStoreConfig, StoreConfig};
pub use engine::{Content, DedupEngine, Release, ReleaseMode};
pub use error::{Error, Result};
pub use hash::{Digest, DigestWriter, HashError};
pub use index::ObjectIndex;
pub use range::{parse_range_header, ByteRange, ObjectStream, ResolvedRange};
pub use reconcile::{Census, ReconcileAction, ReconcileReport, Reconciler};
pub use record::{MetaField, ObjectId, ObjectRecord};
pub use slot::PayloadSlot;
