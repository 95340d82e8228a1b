//! couch-sync library
//!
//! Change data capture from the `_changes` feed of CouchDB / Cloudant
//! databases.
//!
//! # Features
//!
//! - Streaming changes: long-poll subscription or one continuous response
//! - Reliable checkpointing: the last processed sequence token is kept in a
//!   document of the watched database and ingestion resumes from it
//! - Optimistic-concurrency writes: create-or-update with a single corrective
//!   revision lookup on conflicts
//!
//! # Crates
//!
//! - [`types`] (`couch-types`) - documents, cursors, change events, outcomes
//! - [`client`] (`couch-client`) - configuration, HTTP session, document store
//! - [`checkpoint`] - checkpoint store trait and document-backed store
//! - [`source`] (`couch-sync-changes-source`) - feed readers and ingestion loop
//!
//! # Embedding
//!
//! The library has no binary; an embedding application flattens
//! [`SyncOpts`] into its own clap parser (or deserializes it), installs a
//! `tracing` subscriber and calls [`run_sync`]:
//!
//! ```ignore
//! let opts = SyncOpts::parse();
//! let (sender, mut receiver) = tokio::sync::mpsc::channel(1024);
//! let shutdown = CancellationToken::new();
//! tokio::spawn(async move { while let Some(event) = receiver.recv().await { /* ... */ } });
//! let summary = couch_sync::run_sync(&opts, &sender, shutdown).await?;
//! ```

use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use checkpoint;
pub use couch_client as client;
pub use couch_sync_changes_source as source;
pub use couch_types as types;

pub use checkpoint::{CheckpointStore, DocumentCheckpointStore};
pub use couch_client::{Configuration, DocumentStore, HttpSession, TokenProvider};
pub use couch_sync_changes_source::{
    open_reader, ChangesFeedReader, EventSink, FeedStrategy, IngestOptions, IngestSummary,
    StartMode,
};
pub use couch_types::{ChangeEvent, Cursor, ReadOutcome};

/// Connection and ingestion settings for one database.
#[derive(Parser, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOpts {
    #[command(flatten)]
    pub connection: Configuration,

    #[command(flatten)]
    #[serde(default)]
    pub ingest: IngestOptions,
}

/// Connect with Basic authentication and ingest until `shutdown` fires.
pub async fn run_sync<S: EventSink + ?Sized>(
    opts: &SyncOpts,
    sink: &S,
    shutdown: CancellationToken,
) -> anyhow::Result<IngestSummary> {
    // Reject bad ingest settings before connecting.
    opts.ingest.validate()?;
    let session = Arc::new(HttpSession::connect(opts.connection.clone()).await?);
    run_with_session(session, &opts.ingest, sink, shutdown).await
}

/// Like [`run_sync`], authenticating with an API key through `provider`.
pub async fn run_sync_with_token_provider<S: EventSink + ?Sized>(
    opts: &SyncOpts,
    provider: Arc<dyn TokenProvider>,
    sink: &S,
    shutdown: CancellationToken,
) -> anyhow::Result<IngestSummary> {
    opts.ingest.validate()?;
    let session = Arc::new(
        HttpSession::connect_with_token_provider(opts.connection.clone(), provider).await?,
    );
    run_with_session(session, &opts.ingest, sink, shutdown).await
}

async fn run_with_session<S: EventSink + ?Sized>(
    session: Arc<HttpSession>,
    ingest: &IngestOptions,
    sink: &S,
    shutdown: CancellationToken,
) -> anyhow::Result<IngestSummary> {
    let result =
        couch_sync_changes_source::run_incremental_sync(session.clone(), ingest, sink, shutdown)
            .await;
    session.disconnect().await;
    if let Ok(summary) = &result {
        info!(
            "Sync of '{}' finished: {} events emitted",
            session.config().database,
            summary.emitted
        );
    }
    result
}
