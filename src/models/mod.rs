//! Core data models for the expiring object store.
//!
//! An uploaded object is split across two backends that share one key: the
//! raw bytes live in the blob store and a small descriptive record lives in
//! the metadata store. Both serialize naturally as JSON via `serde`.

pub mod object_id;
pub mod record;

pub use object_id::ObjectId;
pub use record::{MetadataRecord, StoredObject};
