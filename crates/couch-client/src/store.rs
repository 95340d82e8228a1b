//! Document fetch and store with optimistic concurrency.

use std::sync::Arc;

use couch_types::{FetchOutcome, JsonDocument, StoreOutcome, StoreStatus, ID_FIELD, REV_FIELD};
use serde::Deserialize;
use tracing::{debug, error, trace};

use crate::transport::{StatusClass, Transport};

/// Body of a successful write: `{"ok": true, "id": "...", "rev": "..."}`.
#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    rev: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// `POST <db>`: create; the server assigns an id when the body has none.
    Save,
    /// `PUT <db>/<id>` with `_rev` in the body: overwrite a known revision.
    Update,
}

/// Reads and writes documents through a [`Transport`].
///
/// Every operation returns an outcome value; transport failures and error
/// statuses never escape as `Err`.
pub struct DocumentStore<T: ?Sized> {
    transport: Arc<T>,
}

impl<T: ?Sized> Clone for DocumentStore<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport + ?Sized> DocumentStore<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Fetch a document, the latest revision unless `revision` is given.
    ///
    /// A missing document is reported as `NotFound` and only logged at debug
    /// level: checkpoint readers routinely look up documents that do not
    /// exist yet.
    pub async fn fetch(&self, id: &str, revision: Option<&str>) -> FetchOutcome {
        let query: Vec<(&str, String)> = match revision.filter(|r| !r.is_empty()) {
            Some(rev) => vec![("rev", rev.to_string())],
            None => Vec::new(),
        };

        let response = match self.transport.get(&[id], &query).await {
            Ok(response) => response,
            Err(e) => {
                let message = format!("Exception during find of '{id}': {e}");
                error!("{message}");
                return FetchOutcome::other(message);
            }
        };

        match response.class() {
            StatusClass::Success => FetchOutcome::ok(response.body),
            StatusClass::NotFound => {
                debug!("Document '{id}' not found");
                FetchOutcome::not_found(format!(
                    "Document '{id}' not found: {}",
                    response.error_reason()
                ))
            }
            _ => {
                let message = format!("Failed to fetch '{id}': {}", response.error_reason());
                error!("{message}");
                FetchOutcome::other(message)
            }
        }
    }

    /// Create or update a document given as JSON text.
    ///
    /// See [`DocumentStore::store_document`] for the id/revision rules.
    pub async fn store(
        &self,
        document: &str,
        id: Option<&str>,
        revision: Option<&str>,
    ) -> StoreOutcome {
        match JsonDocument::parse(document) {
            Ok(doc) => self.store_document(doc, id, revision).await,
            Err(e) => StoreOutcome::failed(
                StoreStatus::BadInput,
                format!("The document is not a valid JSON object: {e}"),
            ),
        }
    }

    /// Create or update a document.
    ///
    /// Non-empty `id` / `revision` arguments replace the `_id` / `_rev`
    /// fields of the body first. The resulting combination decides the call:
    ///
    /// | `_id` | `_rev` | action |
    /// |---|---|---|
    /// | no | yes | rejected with `BadInput` |
    /// | yes | yes | update; a conflict is returned as `DocConflict` |
    /// | no | no | save; the server assigns id and revision |
    /// | yes | no | save; on conflict fetch the latest revision once and update with it |
    pub async fn store_document(
        &self,
        mut doc: JsonDocument,
        id: Option<&str>,
        revision: Option<&str>,
    ) -> StoreOutcome {
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            doc.set_str(ID_FIELD, id);
        }
        if let Some(rev) = revision.filter(|s| !s.is_empty()) {
            doc.set_str(REV_FIELD, rev);
        }

        match (doc.id(), doc.revision()) {
            (None, Some(_)) => StoreOutcome::failed(
                StoreStatus::BadInput,
                "The document does not have an _id attribute, but has a _rev attribute. \
                 This combination is not allowed.",
            ),
            (Some(_), Some(_)) => self.write(&doc, WriteMode::Update).await,
            (None, None) => self.write(&doc, WriteMode::Save).await,
            (Some(id), None) => {
                let saved = self.write(&doc, WriteMode::Save).await;
                if saved.status != StoreStatus::DocConflict {
                    return saved;
                }

                // The id exists with an unknown revision: learn it and retry once.
                let fetched = self.fetch(&id, None).await;
                let latest = match fetched.body.as_deref().map(JsonDocument::parse) {
                    Some(Ok(current)) if fetched.is_ok() => current.revision(),
                    _ => None,
                };
                let Some(latest) = latest else {
                    return StoreOutcome::failed(
                        StoreStatus::CantRead,
                        format!(
                            "Error during get revision: {}",
                            fetched
                                .error_message
                                .unwrap_or_else(|| "fetched document has no _rev".to_string())
                        ),
                    );
                };

                trace!("update doc '{id}', fetched revision: {latest}");
                doc.set_str(REV_FIELD, latest);
                self.write(&doc, WriteMode::Update).await
            }
        }
    }

    async fn write(&self, doc: &JsonDocument, mode: WriteMode) -> StoreOutcome {
        let body = doc.as_value();
        let result = match (mode, doc.id()) {
            (WriteMode::Update, Some(id)) => self.transport.put(&[id.as_str()], &body).await,
            _ => self.transport.post(&[], &body).await,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let message = format!("Exception during save: {e}");
                error!("{message}");
                return StoreOutcome::failed(StoreStatus::Other, message);
            }
        };

        match response.class() {
            StatusClass::Success => {
                let written: WriteResponse = response.json().unwrap_or(WriteResponse {
                    id: None,
                    rev: None,
                });
                StoreOutcome::ok(written.id.or_else(|| doc.id()), written.rev)
            }
            StatusClass::Conflict => {
                trace!("Document conflict during {mode:?}, giving up");
                StoreOutcome::failed(
                    StoreStatus::DocConflict,
                    format!("Document conflict: {}", response.error_reason()),
                )
            }
            _ => {
                let message = format!("Failed to {mode:?} document: {}", response.error_reason());
                error!("{message}");
                StoreOutcome::failed(StoreStatus::Other, message)
            }
        }
    }
}
