//! Unit tests for the ingestion loop, driven by scripted feed sessions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use checkpoint::{CheckpointStore, DocumentCheckpointStore, SEQUENCE_VALUE_PROPERTY};
use clap::Parser;
use couch_client::{DocumentStore, MemoryTransport};
use couch_types::{ChangeEvent, Cursor, ReadOutcome};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::reader::{ChangesFeedReader, FeedOptions, OpenError, StopHandle};
use crate::{run, EventSink, FeedSource, IngestConfigError, IngestOptions, StartMode};

fn change(id: &str, seq: &str) -> ReadOutcome {
    ReadOutcome::Change(ChangeEvent {
        document_id: id.to_string(),
        sequence_token: Some(seq.to_string()),
        deleted: false,
        revision: Some("1-a".to_string()),
        document: None,
    })
}

enum Session {
    /// Opening fails with this HTTP status.
    Fail(u16),
    /// Replays the outcomes; then either ends the session or, for the last
    /// session, cancels the run.
    Outcomes(Vec<ReadOutcome>, bool),
    /// Like `Outcomes`, reporting this resolved start position.
    Resolved(Cursor, Vec<ReadOutcome>, bool),
}

struct ScriptedReader {
    start: Cursor,
    outcomes: VecDeque<ReadOutcome>,
    ends: bool,
    terminated: bool,
    stop: CancellationToken,
    shutdown: CancellationToken,
}

#[async_trait]
impl ChangesFeedReader for ScriptedReader {
    async fn next(&mut self) -> ReadOutcome {
        if let Some(outcome) = self.outcomes.pop_front() {
            return outcome;
        }
        if self.ends {
            self.terminated = true;
            return ReadOutcome::Error("changes feed stream ended".to_string());
        }
        self.shutdown.cancel();
        ReadOutcome::Heartbeat
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.stop.clone())
    }

    fn is_terminated(&self) -> bool {
        self.terminated || self.stop.is_cancelled()
    }

    fn start(&self) -> &Cursor {
        &self.start
    }
}

struct ScriptedSource {
    sessions: Mutex<VecDeque<Session>>,
    opens: Mutex<Vec<Cursor>>,
    shutdown: CancellationToken,
}

impl ScriptedSource {
    fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            opens: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn opens(&self) -> Vec<Cursor> {
        self.opens.lock().unwrap().clone()
    }

    fn reader(
        &self,
        start: Cursor,
        outcomes: Vec<ReadOutcome>,
        ends: bool,
    ) -> Box<dyn ChangesFeedReader> {
        Box::new(ScriptedReader {
            start,
            outcomes: outcomes.into(),
            ends,
            terminated: false,
            stop: CancellationToken::new(),
            shutdown: self.shutdown.clone(),
        })
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    async fn open(
        &self,
        since: &Cursor,
        _options: FeedOptions,
    ) -> Result<Box<dyn ChangesFeedReader>, OpenError> {
        self.opens.lock().unwrap().push(since.clone());
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Session::Outcomes(Vec::new(), false));
        match session {
            Session::Fail(status) => Err(OpenError::from_status(status, "scripted".to_string())),
            Session::Outcomes(outcomes, ends) => Ok(self.reader(since.clone(), outcomes, ends)),
            Session::Resolved(start, outcomes, ends) => Ok(self.reader(start, outcomes, ends)),
        }
    }
}

/// Checkpoint store that records every write.
#[derive(Default)]
struct RecordingStore {
    stored: Option<String>,
    updates: Vec<String>,
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    fn entry_id(&self) -> &str {
        "cp"
    }

    async fn initialize(&mut self) -> bool {
        true
    }

    async fn read(&mut self) -> Option<String> {
        self.stored.clone()
    }

    async fn read_or_create(&mut self, initial: &str) -> Option<String> {
        if self.stored.is_none() {
            self.stored = Some(initial.to_string());
        }
        self.stored.clone()
    }

    async fn update_or_create(&mut self, value: &str) -> bool {
        self.updates.push(value.to_string());
        self.stored = Some(value.to_string());
        true
    }

    fn last_error(&self) -> &str {
        if self.stored.is_none() {
            "document not found"
        } else {
            ""
        }
    }
}

/// Accepts `limit` events, then fails.
struct LimitedSink {
    limit: usize,
    received: Mutex<Vec<String>>,
}

#[async_trait]
impl EventSink for LimitedSink {
    async fn emit(&self, event: ChangeEvent) -> anyhow::Result<()> {
        let mut received = self.received.lock().unwrap();
        if received.len() >= self.limit {
            anyhow::bail!("sink is full");
        }
        received.push(event.document_id);
        Ok(())
    }
}

fn with_checkpoint(mode: StartMode) -> IngestOptions {
    IngestOptions {
        start_mode: mode,
        checkpoint_document_id: Some("cp".to_string()),
        ..IngestOptions::default()
    }
}

fn drain(mut receiver: mpsc::Receiver<ChangeEvent>) -> Vec<String> {
    let mut ids = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        ids.push(event.document_id);
    }
    ids
}

// ============================================================================
// Loop behaviour
// ============================================================================

#[tokio::test]
async fn test_checkpoint_document_change_is_skipped_but_tracked() {
    let transport = Arc::new(MemoryTransport::new("db"));
    let mut store = DocumentCheckpointStore::new(DocumentStore::new(transport.clone()), "cp");
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![
            change("a", "1"),
            ReadOutcome::Heartbeat,
            change("b", "2"),
            change("cp", "3"),
        ],
        false,
    )]);
    let (sender, receiver) = mpsc::channel(16);

    let summary = run(
        &source,
        &with_checkpoint(StartMode::All),
        Some(&mut store),
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(drain(receiver), vec!["a", "b"]);
    assert_eq!(summary.emitted, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.last_sequence.as_deref(), Some("3"));
    assert_eq!(source.opens(), vec![Cursor::Beginning]);

    // final flush stored the token of the skipped change
    let doc = transport.document("cp").await.unwrap();
    assert_eq!(doc[SEQUENCE_VALUE_PROPERTY], "3");
}

#[tokio::test]
async fn test_resumes_from_stored_checkpoint() {
    let mut store = RecordingStore {
        stored: Some("17-abc".to_string()),
        ..RecordingStore::default()
    };
    let source = ScriptedSource::new(vec![Session::Outcomes(Vec::new(), false)]);
    let (sender, _receiver) = mpsc::channel(16);

    let summary = run(
        &source,
        &with_checkpoint(StartMode::All),
        Some(&mut store),
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(source.opens(), vec![Cursor::Token("17-abc".to_string())]);
    assert_eq!(summary.last_sequence, None);
    // nothing seen, nothing written
    assert!(store.updates.is_empty());
}

#[tokio::test]
async fn test_periodic_and_final_flush() {
    let mut store = RecordingStore::default();
    let options = IngestOptions {
        checkpoint_interval: 2,
        ..with_checkpoint(StartMode::All)
    };
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![
            change("a", "1"),
            change("b", "2"),
            change("c", "3"),
            change("d", "4"),
            change("e", "5"),
        ],
        false,
    )]);
    let (sender, receiver) = mpsc::channel(16);

    run(&source, &options, Some(&mut store), &sender, source.shutdown.clone())
        .await
        .unwrap();

    assert_eq!(drain(receiver).len(), 5);
    assert_eq!(store.updates, vec!["2", "4", "5"]);
}

#[tokio::test]
async fn test_final_flush_skips_unchanged_token() {
    let mut store = RecordingStore::default();
    let options = IngestOptions {
        checkpoint_interval: 2,
        ..with_checkpoint(StartMode::All)
    };
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![change("a", "1"), change("b", "2")],
        false,
    )]);
    let (sender, _receiver) = mpsc::channel(16);

    run(&source, &options, Some(&mut store), &sender, source.shutdown.clone())
        .await
        .unwrap();

    assert_eq!(store.updates, vec!["2"]);
}

#[tokio::test]
async fn test_reopens_after_session_ends() {
    let source = ScriptedSource::new(vec![
        Session::Outcomes(vec![change("a", "5-x")], true),
        Session::Outcomes(vec![change("b", "6-y")], false),
    ]);
    let (sender, receiver) = mpsc::channel(16);

    let summary = run(
        &source,
        &IngestOptions::default(),
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(drain(receiver), vec!["a", "b"]);
    assert_eq!(
        source.opens(),
        vec![Cursor::Beginning, Cursor::Token("5-x".to_string())]
    );
    assert_eq!(summary.last_sequence.as_deref(), Some("6-y"));
}

#[tokio::test]
async fn test_transient_error_does_not_reopen() {
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![
            ReadOutcome::Error("poll failed".to_string()),
            change("a", "1"),
        ],
        false,
    )]);
    let (sender, receiver) = mpsc::channel(16);

    run(
        &source,
        &IngestOptions::default(),
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(drain(receiver), vec!["a"]);
    assert_eq!(source.opens().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_on_open_is_retried() {
    let source = ScriptedSource::new(vec![
        Session::Fail(503),
        Session::Fail(500),
        Session::Outcomes(vec![change("a", "1")], false),
    ]);
    let (sender, receiver) = mpsc::channel(16);

    run(
        &source,
        &IngestOptions::default(),
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(drain(receiver), vec!["a"]);
    assert_eq!(source.opens().len(), 3);
}

#[tokio::test]
async fn test_client_error_on_open_is_fatal() {
    let source = ScriptedSource::new(vec![Session::Fail(401)]);
    let (sender, _receiver) = mpsc::channel(16);

    let err = run(
        &source,
        &IngestOptions::default(),
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("401"));
    assert_eq!(source.opens().len(), 1);
}

#[tokio::test]
async fn test_sink_error_is_fatal_but_flushes_delivered_token() {
    let mut store = RecordingStore::default();
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![change("a", "1"), change("b", "2")],
        false,
    )]);
    let sink = LimitedSink {
        limit: 1,
        received: Mutex::new(Vec::new()),
    };

    let err = run(
        &source,
        &with_checkpoint(StartMode::All),
        Some(&mut store),
        &sink,
        source.shutdown.clone(),
    )
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("sink is full"));
    assert_eq!(*sink.received.lock().unwrap(), vec!["a"]);
    // "b" was not delivered, so its token is not stored
    assert_eq!(store.updates, vec!["1"]);
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_delivery() {
    let mut store = RecordingStore::default();
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![change("a", "1"), change("b", "2"), change("c", "3")],
        false,
    )]);
    // room for one event and nobody reading
    let (sender, _receiver) = mpsc::channel(1);

    let shutdown = source.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(3),
        run(
            &source,
            &with_checkpoint(StartMode::All),
            Some(&mut store),
            &sender,
            source.shutdown.clone(),
        ),
    )
    .await
    .expect("run kept waiting on the sink after shutdown")
    .unwrap();

    assert_eq!(summary.emitted, 1);
    assert_eq!(summary.last_sequence.as_deref(), Some("1"));
    assert_eq!(store.updates, vec!["1"]);
}

#[tokio::test]
async fn test_heartbeat_keeps_last_token() {
    let mut store = RecordingStore::default();
    let source = ScriptedSource::new(vec![Session::Outcomes(
        vec![change("a", "1"), ReadOutcome::Heartbeat],
        false,
    )]);
    let (sender, _receiver) = mpsc::channel(16);

    let summary = run(
        &source,
        &with_checkpoint(StartMode::All),
        Some(&mut store),
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(summary.last_sequence.as_deref(), Some("1"));
    assert_eq!(store.updates, vec!["1"]);
}

#[tokio::test]
async fn test_reopen_before_any_event_uses_resolved_start() {
    let source = ScriptedSource::new(vec![
        Session::Resolved(Cursor::Token("9-now".to_string()), Vec::new(), true),
        Session::Outcomes(vec![change("gap", "10-x")], false),
    ]);
    let (sender, receiver) = mpsc::channel(16);
    let options = IngestOptions {
        start_mode: StartMode::Now,
        ..IngestOptions::default()
    };

    run(
        &source,
        &options,
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(
        source.opens(),
        vec![Cursor::Now, Cursor::Token("9-now".to_string())]
    );
    assert_eq!(drain(receiver), vec!["gap"]);
}

#[tokio::test]
async fn test_shutdown_before_open() {
    let source = ScriptedSource::new(Vec::new());
    source.shutdown.cancel();
    let (sender, _receiver) = mpsc::channel(16);

    let summary = run(
        &source,
        &IngestOptions::default(),
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(summary.emitted, 0);
    assert!(source.opens().is_empty());
}

// ============================================================================
// Start position
// ============================================================================

#[tokio::test]
async fn test_from_database_uses_stored_token() {
    let mut store = RecordingStore {
        stored: Some("42-x".to_string()),
        ..RecordingStore::default()
    };
    let source = ScriptedSource::new(Vec::new());
    let (sender, _receiver) = mpsc::channel(16);

    run(
        &source,
        &with_checkpoint(StartMode::FromDatabase),
        Some(&mut store),
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(source.opens(), vec![Cursor::Token("42-x".to_string())]);
}

#[tokio::test]
async fn test_from_database_without_document_fails() {
    let transport = Arc::new(MemoryTransport::new("db"));
    let mut store = DocumentCheckpointStore::new(DocumentStore::new(transport.clone()), "cp");
    let source = ScriptedSource::new(Vec::new());
    let (sender, _receiver) = mpsc::channel(16);

    let err = run(
        &source,
        &with_checkpoint(StartMode::FromDatabase),
        Some(&mut store),
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("document not found"));
    assert!(source.opens().is_empty());
    assert_eq!(transport.document_count().await, 0);
}

#[tokio::test]
async fn test_reset_overwrites_stored_token() {
    let mut store = RecordingStore {
        stored: Some("99-old".to_string()),
        ..RecordingStore::default()
    };
    let options = IngestOptions {
        reset_sequence_document: true,
        ..with_checkpoint(StartMode::Now)
    };
    let source = ScriptedSource::new(Vec::new());
    let (sender, _receiver) = mpsc::channel(16);

    run(&source, &options, Some(&mut store), &sender, source.shutdown.clone())
        .await
        .unwrap();

    assert_eq!(store.updates, vec!["now"]);
    assert_eq!(source.opens(), vec![Cursor::Now]);
}

#[tokio::test]
async fn test_from_parameter_starts_at_literal() {
    let options = IngestOptions {
        start_mode: StartMode::FromParameter,
        since: Some("3-abc".to_string()),
        ..IngestOptions::default()
    };
    let source = ScriptedSource::new(Vec::new());
    let (sender, _receiver) = mpsc::channel(16);

    run(
        &source,
        &options,
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap();

    assert_eq!(source.opens(), vec![Cursor::Token("3-abc".to_string())]);
}

#[tokio::test]
async fn test_reset_without_checkpoint_fails_before_any_request() {
    let options = IngestOptions {
        reset_sequence_document: true,
        ..IngestOptions::default()
    };
    let source = ScriptedSource::new(Vec::new());
    let (sender, _receiver) = mpsc::channel(16);

    let err = run(
        &source,
        &options,
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap_err();

    assert_eq!(
        err.downcast_ref::<IngestConfigError>(),
        Some(&IngestConfigError::ResetWithoutCheckpoint)
    );
    assert!(source.opens().is_empty());
}

#[tokio::test]
async fn test_checkpoint_id_without_store_is_rejected() {
    let source = ScriptedSource::new(Vec::new());
    let (sender, _receiver) = mpsc::channel(16);

    let err = run(
        &source,
        &with_checkpoint(StartMode::All),
        None::<&mut RecordingStore>,
        &sender,
        source.shutdown.clone(),
    )
    .await
    .unwrap_err();

    assert_eq!(
        err.downcast_ref::<IngestConfigError>(),
        Some(&IngestConfigError::MissingCheckpointStore)
    );
}

// ============================================================================
// Options
// ============================================================================

#[test]
fn test_validate_rules() {
    let mut options = IngestOptions {
        start_mode: StartMode::FromParameter,
        ..IngestOptions::default()
    };
    assert_eq!(options.validate(), Err(IngestConfigError::MissingSince));

    options.since = Some("5".to_string());
    assert_eq!(options.validate(), Ok(Vec::new()));

    options.start_mode = StartMode::Now;
    let warnings = options.validate().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Ignoring since '5'"));
    assert_eq!(options.initial_cursor(), Cursor::Now);

    let options = IngestOptions {
        start_mode: StartMode::FromDatabase,
        ..IngestOptions::default()
    };
    assert_eq!(
        options.validate(),
        Err(IngestConfigError::FromDatabaseWithoutCheckpoint)
    );

    let options = IngestOptions {
        reset_sequence_document: true,
        ..with_checkpoint(StartMode::FromDatabase)
    };
    assert_eq!(options.validate(), Err(IngestConfigError::ResetFromDatabase));

    let options = IngestOptions {
        checkpoint_interval: 0,
        ..IngestOptions::default()
    };
    assert_eq!(
        options.validate(),
        Err(IngestConfigError::ZeroCheckpointInterval)
    );

    let options = IngestOptions {
        checkpoint_document_id: Some("  ".to_string()),
        reset_sequence_document: true,
        ..IngestOptions::default()
    };
    assert_eq!(
        options.validate(),
        Err(IngestConfigError::ResetWithoutCheckpoint)
    );
}

#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    ingest: IngestOptions,
}

#[test]
fn test_options_from_command_line() {
    let cli = Cli::parse_from([
        "couch-sync",
        "--start-mode",
        "fromDatabase",
        "--checkpoint-document-id",
        "cp",
        "--strategy",
        "direct",
        "--include-docs",
    ]);
    assert_eq!(cli.ingest.start_mode, StartMode::FromDatabase);
    assert_eq!(cli.ingest.checkpoint_document_id(), Some("cp"));
    assert_eq!(cli.ingest.strategy, crate::FeedStrategy::Direct);
    assert!(cli.ingest.include_docs);
    assert_eq!(cli.ingest.checkpoint_interval, 1000);
}

#[test]
fn test_options_from_json() {
    let options: IngestOptions =
        serde_json::from_str(r#"{"startMode":"fromParameter","since":"5-a","strategy":"direct"}"#)
            .unwrap();
    assert_eq!(options.start_mode, StartMode::FromParameter);
    assert_eq!(options.initial_cursor(), Cursor::Token("5-a".to_string()));
    assert_eq!(options.checkpoint_interval, 1000);
    assert_eq!(options.feed_options(), FeedOptions { include_docs: false });
}
