//! Continuous changes feed read straight off one streaming HTTP response.

use std::time::Duration;

use async_trait::async_trait;
use couch_client::url::database_url;
use couch_client::{build_http_client, ChangesQuery, Configuration, Credentials, FeedMode, HttpResponse};
use couch_types::{sequence_text, ChangeEvent, ChangeRow, Cursor, ReadOutcome};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::reader::{ChangesFeedReader, FeedOptions, FeedWorker, OpenError, StopHandle, WorkerContext};

/// One line of a continuous feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLine {
    /// Empty keep-alive line.
    Heartbeat,
    Change(ChangeEvent),
    /// The `{"last_seq": ...}` line the server sends before closing the feed.
    LastSeq(Option<String>),
}

/// Parse one line of `feed=continuous` output.
///
/// Blank lines are heartbeats; a trailing comma left by servers that frame
/// the feed like an array is dropped before parsing.
pub fn parse_line(line: &str, include_docs: bool) -> serde_json::Result<FeedLine> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(FeedLine::Heartbeat);
    }
    let line = line.strip_suffix(',').unwrap_or(line);

    let value: Value = serde_json::from_str(line)?;
    if value.get("id").is_none() {
        if let Some(seq) = value.get("last_seq") {
            return Ok(FeedLine::LastSeq(sequence_text(seq)));
        }
    }
    let row: ChangeRow = serde_json::from_value(value)?;
    Ok(FeedLine::Change(row.into_event(include_docs)))
}

/// Reader over `GET <db>/_changes?feed=continuous`.
///
/// Uses its own HTTP client with Basic authentication. The session ends on
/// the first read timeout, body error or end of stream; the reader then
/// reports [`ChangesFeedReader::is_terminated`] and has to be reopened.
pub struct DirectFeedReader {
    worker: FeedWorker,
    start: Cursor,
}

impl DirectFeedReader {
    pub async fn open(
        config: &Configuration,
        since: &Cursor,
        options: FeedOptions,
    ) -> Result<Self, OpenError> {
        let credentials = Credentials::basic_from_config(config)
            .map_err(|e| OpenError::InvalidConfig(e.to_string()))?;
        let database = database_url(&config.url, &config.database)
            .map_err(|e| OpenError::InvalidConfig(e.to_string()))?;
        let client = build_http_client(config).map_err(|e| OpenError::Connect(e.to_string()))?;

        let read_timeout = config.read_timeout();
        let start = match since {
            Cursor::Now => resolve_now(&client, &credentials, &database, read_timeout).await?,
            other => other.clone(),
        };

        let mut query = ChangesQuery::new(FeedMode::Continuous);
        query.since = Some(start.as_str().to_string());
        query.include_docs = options.include_docs;
        query.heartbeat_ms = config.heartbeat_interval_ms;
        query.seq_interval = 1;
        let url = query.url(&database);
        debug!("Starting changes watcher for URL: {url}");

        let request = credentials
            .apply(client.get(url))
            .await
            .map_err(|e| OpenError::Connect(e.to_string()))?;
        let response = send_checked(request, read_timeout).await?;

        info!(
            "Changes feed opened on database '{}' since '{start}'",
            config.database
        );
        let span = info_span!("changes_feed", database = %config.database, strategy = "direct");
        let include_docs = options.include_docs;
        let worker = FeedWorker::spawn(config.heartbeat_interval(), move |ctx| {
            stream_lines(response, ctx, read_timeout, include_docs).instrument(span)
        });

        Ok(Self { worker, start })
    }
}

/// Send a feed request, mapping a missing response or a non-200 status.
async fn send_checked(
    request: reqwest::RequestBuilder,
    read_timeout: Duration,
) -> Result<reqwest::Response, OpenError> {
    let response = match tokio::time::timeout(read_timeout, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(OpenError::Connect(e.to_string())),
        Err(_) => {
            return Err(OpenError::Connect(format!(
                "no response within {read_timeout:?}"
            )))
        }
    };

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(OpenError::from_status(
            status,
            HttpResponse::new(status, body).error_reason(),
        ));
    }
    Ok(response)
}

/// Ask the server for its current sequence so a reopen after a dropped
/// session resumes from a concrete token instead of `now`.
async fn resolve_now(
    client: &reqwest::Client,
    credentials: &Credentials,
    database: &reqwest::Url,
    read_timeout: Duration,
) -> Result<Cursor, OpenError> {
    let mut lookup = ChangesQuery::new(FeedMode::Normal);
    lookup.since = Some(Cursor::Now.as_str().to_string());
    lookup.limit = 1;

    let request = credentials
        .apply(client.get(lookup.url(database)))
        .await
        .map_err(|e| OpenError::Connect(e.to_string()))?;
    let response = send_checked(request, read_timeout).await?;
    let body = response.text().await.unwrap_or_default();

    let resolved = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|page| page.get("last_seq").and_then(sequence_text));
    match resolved {
        Some(token) => Ok(Cursor::Token(token)),
        None => {
            warn!("Server did not report a current sequence, following from 'now'");
            Ok(Cursor::Now)
        }
    }
}

async fn stream_lines(
    response: reqwest::Response,
    ctx: WorkerContext,
    read_timeout: Duration,
    include_docs: bool,
) {
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    let reason = loop {
        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let outcome = match parse_line(&line, include_docs) {
                Ok(FeedLine::Heartbeat) => {
                    trace!("Reader heartbeat received");
                    ReadOutcome::Heartbeat
                }
                Ok(FeedLine::Change(event)) => ReadOutcome::Change(event),
                Ok(FeedLine::LastSeq(seq)) => {
                    debug!("Feed closing at last_seq {seq:?}");
                    continue;
                }
                Err(e) => {
                    warn!("Skipping malformed changes line: {e}");
                    ReadOutcome::Error(format!("Malformed changes line: {e}"))
                }
            };
            if !ctx.send(outcome).await {
                return;
            }
        }

        let chunk = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            chunk = tokio::time::timeout(read_timeout, body.next()) => chunk,
        };
        match chunk {
            Ok(Some(Ok(bytes))) => buffer.extend_from_slice(&bytes),
            Ok(Some(Err(e))) => break format!("Error reading changes feed: {e}"),
            Ok(None) => break "Changes feed stream ended".to_string(),
            Err(_) => break format!("No data on changes feed within {read_timeout:?}"),
        }
    };

    warn!("{reason}");
    ctx.finish(reason).await;
}

#[async_trait]
impl ChangesFeedReader for DirectFeedReader {
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
