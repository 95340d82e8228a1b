//! Changes feed reader trait and the worker plumbing shared by both strategies.
//!
//! A reader owns one background task that talks to the server and forwards
//! [`ReadOutcome`]s through a bounded channel. [`ChangesFeedReader::next`]
//! drains that channel and reports a heartbeat when nothing arrived within
//! one heartbeat interval, so callers never block longer than that.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use couch_client::HttpSession;
use couch_types::{Cursor, ReadOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::direct::DirectFeedReader;
use crate::managed::ManagedFeedReader;

const CHANNEL_CAPACITY: usize = 256;
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Double a retry delay, capped at [`MAX_BACKOFF`].
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// What each feed entry should carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedOptions {
    /// Request document bodies (`include_docs=true`).
    pub include_docs: bool,
}

/// Errors that prevent a feed session from starting.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Changes request rejected with HTTP {status}: {reason}")]
    ClientRequest { status: u16, reason: String },

    #[error("Server error HTTP {status} while opening changes feed: {reason}")]
    Server { status: u16, reason: String },

    #[error("Unexpected HTTP status {status} while opening changes feed")]
    UnexpectedStatus { status: u16 },

    #[error("Failed to connect to changes feed: {0}")]
    Connect(String),

    #[error("Invalid changes feed configuration: {0}")]
    InvalidConfig(String),
}

impl OpenError {
    /// Classify a non-200 status of the initial feed response.
    pub fn from_status(status: u16, reason: String) -> Self {
        match status {
            400..=499 => OpenError::ClientRequest { status, reason },
            500..=u16::MAX => OpenError::Server { status, reason },
            _ => OpenError::UnexpectedStatus { status },
        }
    }

    /// Only server-side failures are worth retrying with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpenError::Server { .. })
    }
}

/// How the feed is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStrategy {
    /// Repeated long-poll requests over the shared session; recovers from
    /// request failures on its own.
    #[default]
    Managed,
    /// One continuous streaming request read line by line; ends on the
    /// first connection problem.
    Direct,
}

/// Stops a reader from any task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    #[cfg(test)]
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Idempotent. A `next()` blocked on the reader returns promptly.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A session on the `_changes` feed of one database.
///
/// States: `Connecting` (inside `open`, failures are returned from there),
/// `Streaming`, and `Stopped` once [`ChangesFeedReader::stop`] was called or
/// the session ended ([`ChangesFeedReader::is_terminated`]).
#[async_trait]
pub trait ChangesFeedReader: Send {
    /// Next entry; returns a heartbeat within one heartbeat interval when
    /// nothing happened.
    async fn next(&mut self) -> ReadOutcome;

    /// Handle that stops this reader from another task.
    fn stop_handle(&self) -> StopHandle;

    /// True once the reader was stopped or its session ended. A terminated
    /// reader only returns errors; open a new one to continue.
    fn is_terminated(&self) -> bool;

    /// Position the session was opened at. `Cursor::Now` is replaced by the
    /// server's current sequence when the server reported one, so a reopen
    /// after a dropped session does not skip changes made in between.
    fn start(&self) -> &Cursor;

    fn stop(&self) {
        self.stop_handle().stop();
    }
}

/// Open a reader with the chosen strategy, starting after `since`.
pub async fn open_reader(
    strategy: FeedStrategy,
    session: &Arc<HttpSession>,
    since: &Cursor,
    options: FeedOptions,
) -> Result<Box<dyn ChangesFeedReader>, OpenError> {
    match strategy {
        FeedStrategy::Managed => Ok(Box::new(
            ManagedFeedReader::open(session.clone(), since, options).await?,
        )),
        FeedStrategy::Direct => Ok(Box::new(
            DirectFeedReader::open(session.config(), since, options).await?,
        )),
    }
}

/// Sending side handed to a worker task.
pub(crate) struct WorkerContext {
    sender: mpsc::Sender<ReadOutcome>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Forward an outcome. Returns false once the reader is stopped or gone.
    pub(crate) async fn send(&self, outcome: ReadOutcome) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sender.send(outcome) => sent.is_ok(),
        }
    }

    /// End the session, reporting `message` as the last outcome.
    pub(crate) async fn finish(self, message: String) {
        self.finished.store(true, Ordering::SeqCst);
        self.send(ReadOutcome::Error(message)).await;
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Receiving side owned by a reader.
pub(crate) struct FeedWorker {
    receiver: mpsc::Receiver<ReadOutcome>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    task: JoinHandle<()>,
    heartbeat: Duration,
}

impl FeedWorker {
    pub(crate) fn spawn<F, Fut>(heartbeat: Duration, run: F) -> Self
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let context = WorkerContext {
            sender,
            cancel: cancel.clone(),
            finished: finished.clone(),
        };
        let task = tokio::spawn(run(context));

        Self {
            receiver,
            cancel,
            finished,
            task,
            heartbeat: heartbeat.max(MIN_HEARTBEAT),
        }
    }

    pub(crate) async fn next(&mut self) -> ReadOutcome {
        if self.cancel.is_cancelled() {
            self.task.abort();
            return stopped();
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.task.abort();
                stopped()
            }
            received = self.receiver.recv() => match received {
                Some(outcome) => outcome,
                None => {
                    self.finished.store(true, Ordering::SeqCst);
                    ReadOutcome::Error("changes feed session ended".to_string())
                }
            },
            _ = tokio::time::sleep(self.heartbeat) => ReadOutcome::Heartbeat,
        }
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.cancel.clone(),
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled() || self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for FeedWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

fn stopped() -> ReadOutcome {
    ReadOutcome::Error("changes feed reader is stopped".to_string())
}
