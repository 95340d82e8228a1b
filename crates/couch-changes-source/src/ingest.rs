//! Incremental ingestion from the changes feed.
//!
//! Resolves the starting position (optionally from a checkpoint document),
//! streams changes into an [`EventSink`] and periodically persists the last
//! seen sequence token so that a restart resumes where the previous run
//! stopped.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use checkpoint::{CheckpointStore, DocumentCheckpointStore};
use clap::{Args, ValueEnum};
use couch_client::{DocumentStore, HttpSession};
use couch_types::{ChangeEvent, Cursor, ReadOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::reader::{
    next_backoff, open_reader, ChangesFeedReader, FeedOptions, FeedStrategy, OpenError,
    INITIAL_BACKOFF,
};

const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1000;

/// Where ingestion starts when no checkpoint overrides it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartMode {
    /// Replay the whole history.
    #[default]
    All,
    /// Only changes made from now on.
    Now,
    /// The literal token given in `since`.
    #[value(alias = "fromParameter")]
    FromParameter,
    /// The token stored in the checkpoint document; it must exist.
    #[value(alias = "fromDatabase")]
    FromDatabase,
}

/// Ingestion settings.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOptions {
    /// Start position
    #[arg(long, value_enum, default_value_t = StartMode::All)]
    #[serde(default)]
    pub start_mode: StartMode,

    /// Literal sequence token, used with --start-mode from-parameter
    #[arg(long)]
    #[serde(default)]
    pub since: Option<String>,

    /// Id of the document that stores the last processed sequence token
    #[arg(long, env = "COUCH_CHECKPOINT_DOCUMENT")]
    #[serde(default)]
    pub checkpoint_document_id: Option<String>,

    /// Overwrite the checkpoint document with the start position
    #[arg(long)]
    #[serde(default)]
    pub reset_sequence_document: bool,

    /// Persist the sequence token every N emitted events
    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_INTERVAL)]
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Include document bodies in the emitted events
    #[arg(long)]
    #[serde(default)]
    pub include_docs: bool,

    /// How the feed is read
    #[arg(long, value_enum, default_value_t = FeedStrategy::Managed)]
    #[serde(default)]
    pub strategy: FeedStrategy,
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            start_mode: StartMode::All,
            since: None,
            checkpoint_document_id: None,
            reset_sequence_document: false,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            include_docs: false,
            strategy: FeedStrategy::Managed,
        }
    }
}

/// Combinations of [`IngestOptions`] that cannot work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestConfigError {
    #[error("reset_sequence_document requires a checkpoint document id")]
    ResetWithoutCheckpoint,

    #[error("start mode fromDatabase requires a checkpoint document id")]
    FromDatabaseWithoutCheckpoint,

    #[error("start mode fromDatabase cannot be combined with reset_sequence_document")]
    ResetFromDatabase,

    #[error("start mode fromParameter requires a sequence token in 'since'")]
    MissingSince,

    #[error("checkpoint_interval must be at least 1")]
    ZeroCheckpointInterval,

    #[error("a checkpoint document id is configured but no checkpoint store was supplied")]
    MissingCheckpointStore,
}

impl IngestOptions {
    /// Check the options before anything touches the network.
    ///
    /// Returns warnings for settings that are accepted but have no effect.
    pub fn validate(&self) -> std::result::Result<Vec<String>, IngestConfigError> {
        let has_checkpoint = self.checkpoint_document_id().is_some();
        if self.checkpoint_interval == 0 {
            return Err(IngestConfigError::ZeroCheckpointInterval);
        }
        if self.reset_sequence_document && !has_checkpoint {
            return Err(IngestConfigError::ResetWithoutCheckpoint);
        }

        let mut warnings = Vec::new();
        match self.start_mode {
            StartMode::FromDatabase if !has_checkpoint => {
                return Err(IngestConfigError::FromDatabaseWithoutCheckpoint)
            }
            StartMode::FromDatabase if self.reset_sequence_document => {
                return Err(IngestConfigError::ResetFromDatabase)
            }
            StartMode::FromParameter if self.literal_since().is_none() => {
                return Err(IngestConfigError::MissingSince)
            }
            StartMode::FromParameter => {}
            mode => {
                if let Some(since) = self.literal_since() {
                    warnings.push(format!(
                        "Ignoring since '{since}': it is only used with start mode fromParameter (start mode is {mode:?})"
                    ));
                }
            }
        }
        Ok(warnings)
    }

    pub fn checkpoint_document_id(&self) -> Option<&str> {
        self.checkpoint_document_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    fn literal_since(&self) -> Option<&str> {
        self.since.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Start position implied by the mode alone.
    pub fn initial_cursor(&self) -> Cursor {
        match self.start_mode {
            StartMode::Now => Cursor::Now,
            StartMode::FromParameter => Cursor::from_optional(self.literal_since()),
            StartMode::All | StartMode::FromDatabase => Cursor::Beginning,
        }
    }

    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            include_docs: self.include_docs,
        }
    }
}

/// Destination of ingested change events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ChangeEvent) -> Result<()>;
}

#[async_trait]
impl EventSink for mpsc::Sender<ChangeEvent> {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.send(event)
            .await
            .map_err(|_| anyhow!("change event receiver was dropped"))
    }
}

/// Opens feed readers; the loop reopens through it after a session ends.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn open(
        &self,
        since: &Cursor,
        options: FeedOptions,
    ) -> std::result::Result<Box<dyn ChangesFeedReader>, OpenError>;
}

/// [`FeedSource`] backed by an [`HttpSession`].
pub struct SessionFeedSource {
    session: Arc<HttpSession>,
    strategy: FeedStrategy,
}

impl SessionFeedSource {
    pub fn new(session: Arc<HttpSession>, strategy: FeedStrategy) -> Self {
        Self { session, strategy }
    }
}

#[async_trait]
impl FeedSource for SessionFeedSource {
    async fn open(
        &self,
        since: &Cursor,
        options: FeedOptions,
    ) -> std::result::Result<Box<dyn ChangesFeedReader>, OpenError> {
        open_reader(self.strategy, &self.session, since, options).await
    }
}

/// Counters of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Events handed to the sink.
    pub emitted: u64,
    /// Events dropped because they describe the checkpoint document itself.
    pub skipped: u64,
    /// Token of the last delivered or skipped event.
    pub last_sequence: Option<String>,
}

/// Run ingestion over an [`HttpSession`] until `shutdown` is cancelled.
///
/// The checkpoint document, when configured, lives in the watched database.
pub async fn run_incremental_sync<S: EventSink + ?Sized>(
    session: Arc<HttpSession>,
    options: &IngestOptions,
    sink: &S,
    shutdown: CancellationToken,
) -> Result<IngestSummary> {
    let source = SessionFeedSource::new(session.clone(), options.strategy);
    let span = info_span!("ingest", database = %session.config().database);

    match options.checkpoint_document_id() {
        Some(id) => {
            let mut store = DocumentCheckpointStore::new(DocumentStore::new(session.clone()), id);
            run(&source, options, Some(&mut store), sink, shutdown)
                .instrument(span)
                .await
        }
        None => {
            run::<_, DocumentCheckpointStore<HttpSession>, _>(&source, options, None, sink, shutdown)
                .instrument(span)
                .await
        }
    }
}

/// Run ingestion until `shutdown` is cancelled or a fatal error occurs.
///
/// Options are validated before any request is made. On exit the reader is
/// stopped and the last handled token is flushed to the checkpoint store.
/// Delivery is at least once: an event whose delivery was interrupted by
/// shutdown or failed in the sink is not checkpointed.
pub async fn run<F, C, S>(
    source: &F,
    options: &IngestOptions,
    mut checkpoint: Option<&mut C>,
    sink: &S,
    shutdown: CancellationToken,
) -> Result<IngestSummary>
where
    F: FeedSource + ?Sized,
    C: CheckpointStore + ?Sized,
    S: EventSink + ?Sized,
{
    for warning in options.validate()? {
        warn!("{warning}");
    }
    if options.checkpoint_document_id().is_some() && checkpoint.is_none() {
        return Err(IngestConfigError::MissingCheckpointStore.into());
    }

    let start = resolve_start(options, checkpoint.as_deref_mut()).await?;
    let checkpoint_id = checkpoint.as_deref().map(|c| c.entry_id().to_string());
    let feed_options = options.feed_options();
    info!("Starting changes ingestion from '{start}'");

    let mut summary = IngestSummary::default();
    let mut flushed: Option<String> = None;
    let mut since_flush = 0u64;

    let Some(mut reader) = open_with_retry(source, &start, feed_options, &shutdown).await? else {
        return Ok(summary);
    };
    // Reopens before the first event resume from the resolved position.
    let start = reader.start().clone();

    let outcome: Result<()> = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            next = reader.next() => next,
        };

        match next {
            ReadOutcome::Change(event) => {
                let seq = event.sequence_token.clone();
                if checkpoint_id.as_deref() == Some(event.document_id.as_str()) {
                    trace!("Skipping change of checkpoint document '{}'", event.document_id);
                    if seq.is_some() {
                        summary.last_sequence = seq;
                    }
                    summary.skipped += 1;
                    continue;
                }

                // An event that was not delivered keeps the previous token,
                // so it is read again after a restart.
                let delivered = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("Shutdown while delivering a change, it will be read again");
                        break Ok(());
                    }
                    delivered = sink.emit(event) => delivered,
                };
                if let Err(e) = delivered {
                    break Err(e.context("Failed to deliver change event"));
                }
                if seq.is_some() {
                    summary.last_sequence = seq;
                }
                summary.emitted += 1;
                since_flush += 1;
                if summary.emitted % 1000 == 0 {
                    info!("Processed {} changes", summary.emitted);
                }

                if since_flush >= options.checkpoint_interval {
                    since_flush = 0;
                    if let Some(store) = checkpoint.as_deref_mut() {
                        if let Err(e) = flush(store, &summary, &mut flushed).await {
                            warn!("{e:#}");
                        }
                    }
                }
            }
            ReadOutcome::Heartbeat => trace!("Reader heartbeat received"),
            ReadOutcome::Error(message) if reader.is_terminated() => {
                let resume = summary
                    .last_sequence
                    .as_deref()
                    .map(Cursor::from_token)
                    .unwrap_or_else(|| start.clone());
                warn!("Changes feed session ended ({message}), reopening from '{resume}'");
                match open_with_retry(source, &resume, feed_options, &shutdown).await {
                    Ok(Some(reopened)) => reader = reopened,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            ReadOutcome::Error(message) => warn!("Error reading changes feed: {message}"),
        }
    };

    reader.stop();
    if let Some(store) = checkpoint.as_deref_mut() {
        if let Err(e) = flush(store, &summary, &mut flushed).await {
            error!("{e:#}");
            outcome?;
            return Err(e);
        }
    }
    outcome?;

    info!(
        "Changes ingestion stopped after {} events ({} skipped), last sequence {:?}",
        summary.emitted, summary.skipped, summary.last_sequence
    );
    Ok(summary)
}

/// Pick the starting cursor, consulting the checkpoint store if present.
async fn resolve_start<C: CheckpointStore + ?Sized>(
    options: &IngestOptions,
    checkpoint: Option<&mut C>,
) -> Result<Cursor> {
    let initial = options.initial_cursor();
    let Some(store) = checkpoint else {
        return Ok(initial);
    };

    if !store.initialize().await {
        bail!(
            "Failed to initialize checkpoint store '{}': {}",
            store.entry_id(),
            store.last_error()
        );
    }

    if options.start_mode == StartMode::FromDatabase {
        let stored = store.read_required().await?;
        debug!("Read sequence '{stored}' from checkpoint document");
        return Ok(Cursor::from_token(&stored));
    }

    if options.reset_sequence_document {
        if !store.update_or_create(initial.as_str()).await {
            bail!(
                "Failed to reset checkpoint document '{}': {}",
                store.entry_id(),
                store.last_error()
            );
        }
        info!("Reset checkpoint document '{}' to '{initial}'", store.entry_id());
        return Ok(initial);
    }

    let stored = store.read_or_create_required(initial.as_str()).await?;
    Ok(Cursor::from_token(&stored))
}

/// Open a reader, retrying server errors with exponential backoff.
///
/// Returns `None` if `shutdown` fires first.
async fn open_with_retry<F: FeedSource + ?Sized>(
    source: &F,
    since: &Cursor,
    options: FeedOptions,
    shutdown: &CancellationToken,
) -> Result<Option<Box<dyn ChangesFeedReader>>> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let opened = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(None),
            opened = source.open(since, options) => opened,
        };
        match opened {
            Ok(reader) => return Ok(Some(reader)),
            Err(e) if e.is_retryable() => {
                warn!("Failed to open changes feed, retrying in {backoff:?}: {e}");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to open changes feed from '{since}'")))
            }
        }
    }
}

/// Store the last seen token unless it was already stored.
async fn flush<C: CheckpointStore + ?Sized>(
    store: &mut C,
    summary: &IngestSummary,
    flushed: &mut Option<String>,
) -> Result<()> {
    let Some(seq) = summary.last_sequence.as_deref() else {
        return Ok(());
    };
    if flushed.as_deref() == Some(seq) {
        return Ok(());
    }
    if !store.update_or_create(seq).await {
        bail!(
            "Failed to store sequence '{seq}' in checkpoint '{}': {}",
            store.entry_id(),
            store.last_error()
        );
    }
    debug!("Checkpoint stored at sequence '{seq}'");
    *flushed = Some(seq.to_string());
    Ok(())
}
