//! Changes subscription managed over the shared [`HttpSession`].
//!
//! Instead of holding one response open, the worker issues back-to-back
//! `feed=longpoll` requests, each bounded by the heartbeat interval, and
//! carries the `last_seq` of one response into the `since` of the next.
//! Request failures are reported and retried; the subscription only ends
//! when the session is closed or the server rejects the request itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use couch_client::{ChangesQuery, FeedMode, HttpSession, TransportError};
use couch_types::{sequence_text, ChangeRow, Cursor, ReadOutcome};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::reader::{
    next_backoff, ChangesFeedReader, FeedOptions, FeedWorker, OpenError, StopHandle,
    WorkerContext, INITIAL_BACKOFF,
};

/// Body of a `normal` or `longpoll` feed response.
#[derive(Debug, Deserialize)]
struct ChangesPage {
    #[serde(default)]
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Value,
}

pub struct ManagedFeedReader {
    worker: FeedWorker,
    start: Cursor,
}

impl ManagedFeedReader {
    /// Check that the feed can be read from `since`, then start polling.
    ///
    /// `Cursor::Now` is resolved to the server's current sequence here so
    /// that later polls resume from a concrete token.
    pub async fn open(
        session: Arc<HttpSession>,
        since: &Cursor,
        options: FeedOptions,
    ) -> Result<Self, OpenError> {
        let mut lookup = ChangesQuery::new(FeedMode::Normal);
        lookup.since = since.since_param().map(str::to_string);
        lookup.limit = 1;

        let response = session
            .get_changes(&lookup, session.config().read_timeout())
            .await
            .map_err(|e| OpenError::Connect(e.to_string()))?;
        if response.status != 200 {
            return Err(OpenError::from_status(
                response.status,
                response.error_reason(),
            ));
        }

        let start = match since {
            Cursor::Now => response
                .json::<ChangesPage>()
                .ok()
                .and_then(|page| sequence_text(&page.last_seq))
                .map(Cursor::Token)
                .unwrap_or(Cursor::Now),
            other => other.clone(),
        };

        let database = session.config().database.clone();
        info!("Changes subscription on database '{database}' starting at '{start}'");

        let heartbeat = session.config().heartbeat_interval();
        let span = info_span!("changes_feed", database = %database, strategy = "managed");
        let since_param = start.since_param().map(str::to_string);
        let include_docs = options.include_docs;
        let worker = FeedWorker::spawn(heartbeat, move |ctx| {
            poll(session, ctx, since_param, include_docs, heartbeat).instrument(span)
        });

        Ok(Self { worker, start })
    }
}

async fn poll(
    session: Arc<HttpSession>,
    ctx: WorkerContext,
    mut since: Option<String>,
    include_docs: bool,
    heartbeat: Duration,
) {
    // The request has to outlive the server-side long-poll timeout.
    let request_timeout = heartbeat + session.config().read_timeout();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut query = ChangesQuery::new(FeedMode::Longpoll);
        query.since = since.clone();
        query.include_docs = include_docs;
        query.timeout_ms = heartbeat.as_millis() as u64;

        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            response = session.get_changes(&query, request_timeout) => response,
        };

        let failure = match response {
            Ok(response) if response.status == 200 => match response.json::<ChangesPage>() {
                Ok(page) => {
                    backoff = INITIAL_BACKOFF;
                    if page.results.is_empty() && !ctx.send(ReadOutcome::Heartbeat).await {
                        return;
                    }
                    for row in page.results {
                        if !ctx.send(ReadOutcome::Change(row.into_event(include_docs))).await {
                            return;
                        }
                    }
                    if let Some(last_seq) = sequence_text(&page.last_seq) {
                        debug!("Subscription advanced to {last_seq}");
                        since = Some(last_seq);
                    }
                    continue;
                }
                Err(e) => format!("Malformed changes response: {e}"),
            },
            Ok(response) => {
                let error = OpenError::from_status(response.status, response.error_reason());
                if !error.is_retryable() {
                    warn!("Changes subscription rejected: {error}");
                    ctx.finish(error.to_string()).await;
                    return;
                }
                error.to_string()
            }
            Err(TransportError::Disconnected) => {
                ctx.finish(TransportError::Disconnected.to_string()).await;
                return;
            }
            Err(e) => e.to_string(),
        };

        warn!("Changes subscription error, retrying in {backoff:?}: {failure}");
        if !ctx.send(ReadOutcome::Error(failure)).await {
            return;
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
}

#[async_trait]
impl ChangesFeedReader for ManagedFeedReader {
    async fn next(&mut self) -> ReadOutcome {
        self.worker.next().await
    }

    fn stop_handle(&self) -> StopHandle {
        self.worker.stop_handle()
    }

    fn is_terminated(&self) -> bool {
        self.worker.is_terminated()
    }

    fn start(&self) -> &Cursor {
        &self.start
    }
}
