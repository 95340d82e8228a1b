//! Checkpoint management for couch-sync
//!
//! Persists the resume position of a changes feed so that ingestion can
//! pick up where it left off after a restart.
//!
//! # Architecture
//!
//! - [`CheckpointStore`] - the storage-agnostic interface the ingestion loop
//!   uses (`initialize`, `read`, `read_or_create`, `update_or_create`)
//! - [`DocumentCheckpointStore`] - keeps the value in a document of the
//!   watched database itself, written through the document store so that
//!   an existing checkpoint document is overwritten with one corrective
//!   revision lookup
//!
//! Checkpoint writes show up in the changes feed like any other document
//! change; consumers filter them out by [`CheckpointStore::entry_id`].

mod document;
pub mod store;


pub use document::{DocumentCheckpointStore, SEQUENCE_VALUE_PROPERTY};
pub use store::CheckpointStore;
