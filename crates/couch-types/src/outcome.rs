//! Terminal result values.
//!
//! Operations that talk to the database never propagate failures as errors;
//! they return one of these values and the caller decides what to do.

use serde::{Deserialize, Serialize};

use crate::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    Ok,
    NotFound,
    Other,
}

/// Result of reading a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    /// Raw JSON body of the document when the fetch succeeded.
    pub body: Option<String>,
    pub error_message: Option<String>,
}

impl FetchOutcome {
    pub fn ok(body: String) -> Self {
        Self {
            status: FetchStatus::Ok,
            body: Some(body),
            error_message: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::failed(FetchStatus::NotFound, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::failed(FetchStatus::Other, message)
    }

    fn failed(status: FetchStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            body: None,
            error_message: Some(non_empty(message.into())),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Ok,
    BadInput,
    DocConflict,
    CantRead,
    Other,
}

/// Result of creating or updating a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    /// Id reported by the server for a successful write.
    pub id: Option<String>,
    /// Revision reported by the server for a successful write.
    pub revision: Option<String>,
    pub error_message: Option<String>,
}

impl StoreOutcome {
    pub fn ok(id: Option<String>, revision: Option<String>) -> Self {
        Self {
            status: StoreStatus::Ok,
            id,
            revision,
            error_message: None,
        }
    }

    pub fn failed(status: StoreStatus, message: impl Into<String>) -> Self {
        debug_assert!(status != StoreStatus::Ok);
        Self {
            status,
            id: None,
            revision: None,
            error_message: Some(non_empty(message.into())),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StoreStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStatus {
    Ok,
    Heartbeat,
    Error,
}

/// Result of pulling the next entry from a changes feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A change was received.
    Change(ChangeEvent),
    /// The connection is alive but nothing changed.
    Heartbeat,
    /// The feed reported a problem; the message describes it.
    Error(String),
}

impl ReadOutcome {
    pub fn status(&self) -> ReadStatus {
        match self {
            ReadOutcome::Change(_) => ReadStatus::Ok,
            ReadOutcome::Heartbeat => ReadStatus::Heartbeat,
            ReadOutcome::Error(_) => ReadStatus::Error,
        }
    }

    pub fn event(&self) -> Option<&ChangeEvent> {
        match self {
            ReadOutcome::Change(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            ReadOutcome::Change(event) => Some(event),
            _ => None,
        }
    }
}

fn non_empty(message: String) -> String {
    if message.trim().is_empty() {
        "unspecified error".to_string()
    } else {
        message
    }
}
