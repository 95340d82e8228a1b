//! Checkpoint storage in a document of the watched database.

use async_trait::async_trait;
use couch_client::{DocumentStore, Transport};
use couch_types::{FetchStatus, JsonDocument};
use tracing::{debug, error};

use crate::store::CheckpointStore;

/// Name of the property holding the sequence value.
pub const SEQUENCE_VALUE_PROPERTY: &str = "sequenceValue";

/// Keeps the sequence value in a document `{"sequenceValue": "<token>"}`
/// stored in the same database the feed is read from.
///
/// After the entry has been read or written once, the cached value is
/// trusted and [`CheckpointStore::read_or_create`] does not fetch again.
pub struct DocumentCheckpointStore<T: Transport + ?Sized> {
    documents: DocumentStore<T>,
    document_id: String,
    initialized: bool,
    entry_exists: bool,
    value: Option<String>,
    last_error: String,
}

impl<T: Transport + ?Sized> DocumentCheckpointStore<T> {
    pub fn new(documents: DocumentStore<T>, document_id: impl Into<String>) -> Self {
        Self {
            documents,
            document_id: document_id.into(),
            initialized: false,
            entry_exists: false,
            value: None,
            last_error: String::new(),
        }
    }

    /// Value cached by the last successful read or write.
    pub fn cached_value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn fail(&mut self, message: String) {
        error!("Checkpoint '{}': {message}", self.document_id);
        self.last_error = message;
    }

    fn ensure_initialized(&mut self, operation: &str) -> bool {
        if !self.initialized {
            self.fail(format!("{operation}(): store is not initialized"));
        }
        self.initialized
    }

    /// Fetch the entry unless it was read before. `Ok(false)` means the
    /// document does not exist.
    async fn read_entry(&mut self) -> Result<bool, String> {
        if self.entry_exists {
            return Ok(true);
        }

        let fetched = self.documents.fetch(&self.document_id, None).await;
        match fetched.status {
            FetchStatus::Ok => {
                let body = fetched.body.unwrap_or_default();
                let entry = JsonDocument::parse(&body)
                    .map_err(|e| format!("read(): invalid checkpoint document: {e}"))?;
                self.value = entry.get_str(SEQUENCE_VALUE_PROPERTY);
                self.entry_exists = true;
                Ok(true)
            }
            FetchStatus::NotFound => Ok(false),
            FetchStatus::Other => Err(format!(
                "read(): {}",
                fetched.error_message.unwrap_or_default()
            )),
        }
    }
}

#[async_trait]
impl<T: Transport + ?Sized> CheckpointStore for DocumentCheckpointStore<T> {
    fn entry_id(&self) -> &str {
        &self.document_id
    }

    async fn initialize(&mut self) -> bool {
        self.last_error.clear();
        if self.document_id.trim().is_empty() {
            self.fail("initialize(): document id is empty".to_string());
            return false;
        }
        self.initialized = true;
        true
    }

    async fn read(&mut self) -> Option<String> {
        self.last_error.clear();
        if !self.ensure_initialized("read") {
            return None;
        }

        match self.read_entry().await {
            Ok(true) => {
                if self.value.is_none() {
                    self.fail(format!(
                        "read(): document has no '{SEQUENCE_VALUE_PROPERTY}' property"
                    ));
                }
                self.value.clone()
            }
            Ok(false) => {
                self.fail("read(): document not found".to_string());
                None
            }
            Err(message) => {
                self.fail(message);
                None
            }
        }
    }

    async fn read_or_create(&mut self, initial: &str) -> Option<String> {
        self.last_error.clear();
        if !self.ensure_initialized("read_or_create") {
            return None;
        }

        match self.read_entry().await {
            Ok(true) => return self.value.clone(),
            Ok(false) => {
                debug!(
                    "Checkpoint document '{}' not found, creating it with '{initial}'",
                    self.document_id
                );
            }
            Err(message) => {
                self.fail(message);
                return None;
            }
        }

        if !self.update_or_create(initial).await {
            return None;
        }
        self.value.clone()
    }

    async fn update_or_create(&mut self, value: &str) -> bool {
        self.last_error.clear();
        if !self.ensure_initialized("update_or_create") {
            return false;
        }

        let mut doc = JsonDocument::new();
        doc.set_str(SEQUENCE_VALUE_PROPERTY, value);
        let outcome = self
            .documents
            .store_document(doc, Some(self.document_id.as_str()), None)
            .await;

        if !outcome.is_ok() {
            self.fail(format!(
                "update_or_create(): {}",
                outcome.error_message.unwrap_or_default()
            ));
            return false;
        }

        debug!(
            "Stored sequence value '{value}' in checkpoint document '{}'",
            self.document_id
        );
        self.value = Some(value.to_string());
        self.entry_exists = true;
        true
    }

    fn last_error(&self) -> &str {
        &self.last_error
    }
}
