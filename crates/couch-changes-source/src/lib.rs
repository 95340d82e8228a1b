//! Changes feed source for couch-sync
//!
//! Reads the `_changes` feed of a CouchDB / Cloudant database and drives
//! incremental ingestion with resumable checkpoints.
//!
//! # Readers
//!
//! Both strategies implement [`ChangesFeedReader`]:
//!
//! - [`ManagedFeedReader`] - long-poll subscription over the shared
//!   [`couch_client::HttpSession`]; request failures are reported and retried
//! - [`DirectFeedReader`] - one `feed=continuous` response read line by
//!   line; the session ends on the first connection problem
//!
//! # Ingestion
//!
//! [`run`] (or [`run_incremental_sync`] for the common HTTP setup) resolves
//! the start position, forwards changes to an [`EventSink`], skips the
//! checkpoint document's own changes and persists the last sequence token
//! every `checkpoint_interval` events and on shutdown.

mod direct;
mod ingest;
mod managed;
mod reader;

#[cfg(test)]
mod tests;

pub use direct::{parse_line, DirectFeedReader, FeedLine};
pub use ingest::{
    run, run_incremental_sync, EventSink, FeedSource, IngestConfigError, IngestOptions,
    IngestSummary, SessionFeedSource, StartMode,
};
pub use managed::ManagedFeedReader;
pub use reader::{open_reader, ChangesFeedReader, FeedOptions, FeedStrategy, OpenError, StopHandle};
