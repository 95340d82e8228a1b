//! Shared types for couch-sync
//!
//! Provides the plain data types that flow between the document client,
//! the changes feed readers, the checkpoint store and the embedding shell:
//!
//! - [`JsonDocument`] - a thin wrapper over a JSON object that reads and
//!   writes top-level string properties (`_id`, `_rev`, `sequenceValue`)
//!   without mapping the whole body onto a typed struct
//! - [`Cursor`] - the resume position handed to the `_changes` feed
//! - [`ChangeEvent`] - one entry of the feed
//! - [`FetchOutcome`], [`StoreOutcome`], [`ReadOutcome`] - terminal result
//!   values returned by operations that can fail

mod change;
mod codec;
mod cursor;
mod error;
mod outcome;

pub use change::{sequence_text, ChangeEvent, ChangeRow, RevEntry};
pub use codec::{JsonDocument, ID_FIELD, REV_FIELD};
pub use cursor::Cursor;
pub use error::{CodecError, Result};
pub use outcome::{FetchOutcome, FetchStatus, ReadOutcome, ReadStatus, StoreOutcome, StoreStatus};
