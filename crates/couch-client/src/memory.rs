//! In-process transport emulating the document API.
//!
//! Implements enough of CouchDB's document semantics to exercise the
//! document store and checkpoint logic without a server: revision
//! bookkeeping, `409 Conflict` on stale or missing revisions, `404` for
//! unknown ids. Responses can be scripted per method to simulate failures.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::transport::{HttpResponse, Transport};

/// A request seen by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    generation: u64,
    revision: String,
    body: Value,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, StoredDocument>,
    scripted: HashMap<&'static str, VecDeque<Scripted>>,
    requests: Vec<RecordedRequest>,
    counter: u64,
}

enum Scripted {
    Response(HttpResponse),
    Disconnected,
}

pub struct MemoryTransport {
    database: String,
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Store a document directly, bypassing conflict checks. Returns its revision.
    pub async fn insert(&self, id: &str, body: Value) -> String {
        let mut state = self.state.lock().await;
        let generation = state
            .documents
            .get(id)
            .map(|doc| doc.generation + 1)
            .unwrap_or(1);
        let revision = state.next_revision(generation);
        state.documents.insert(
            id.to_string(),
            StoredDocument {
                generation,
                revision: revision.clone(),
                body,
            },
        );
        revision
    }

    /// Current body of a document, with `_id` and `_rev` filled in.
    pub async fn document(&self, id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.documents.get(id).map(|doc| doc.render(id))
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    /// Make the next `method` request return `response` instead of being executed.
    pub async fn script_response(&self, method: &'static str, response: HttpResponse) {
        let mut state = self.state.lock().await;
        state
            .scripted
            .entry(method)
            .or_default()
            .push_back(Scripted::Response(response));
    }

    /// Make the next `method` request fail without a response.
    pub async fn script_disconnect(&self, method: &'static str) {
        let mut state = self.state.lock().await;
        state
            .scripted
            .entry(method)
            .or_default()
            .push_back(Scripted::Disconnected);
    }

    /// All requests received so far, in order.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.requests.clone()
    }

    async fn handle(
        &self,
        method: &'static str,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<HttpResponse> {
        let mut state = self.state.lock().await;
        state.requests.push(RecordedRequest {
            method,
            path: path.join("/"),
        });

        if let Some(scripted) = state.scripted.get_mut(method).and_then(VecDeque::pop_front) {
            return match scripted {
                Scripted::Response(response) => Ok(response),
                Scripted::Disconnected => Err(TransportError::Disconnected),
            };
        }

        let response = match (method, path) {
            ("GET", []) => HttpResponse::json_body(200, &json!({ "db_name": self.database })),
            ("GET", [id]) => {
                let rev = query
                    .iter()
                    .find(|(k, _)| *k == "rev")
                    .map(|(_, v)| v.as_str());
                state.read(id, rev)
            }
            ("POST", []) => {
                let body = body.cloned().unwrap_or_else(|| json!({}));
                let id = match body.get("_id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        state.counter += 1;
                        format!("{:032x}", state.counter)
                    }
                };
                state.write(&id, body)
            }
            ("PUT", [id]) => {
                let body = body.cloned().unwrap_or_else(|| json!({}));
                state.write(id, body)
            }
            _ => HttpResponse::json_body(
                405,
                &json!({ "error": "method_not_allowed", "reason": "Only GET, POST and PUT on documents are supported" }),
            ),
        };
        Ok(response)
    }
}

impl StoredDocument {
    fn render(&self, id: &str) -> Value {
        let mut body = self.body.clone();
        if let Value::Object(map) = &mut body {
            map.insert("_id".to_string(), Value::String(id.to_string()));
            map.insert("_rev".to_string(), Value::String(self.revision.clone()));
        }
        body
    }
}

impl State {
    fn next_revision(&mut self, generation: u64) -> String {
        self.counter += 1;
        format!("{generation}-{:032x}", self.counter)
    }

    fn read(&self, id: &str, rev: Option<&str>) -> HttpResponse {
        match self.documents.get(id) {
            Some(doc) if rev.map(|r| r == doc.revision).unwrap_or(true) => {
                HttpResponse::json_body(200, &doc.render(id))
            }
            _ => HttpResponse::json_body(404, &json!({ "error": "not_found", "reason": "missing" })),
        }
    }

    fn write(&mut self, id: &str, mut body: Value) -> HttpResponse {
        let supplied_rev = body
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string);
        let current = self.documents.get(id);

        let generation = match (current, supplied_rev.as_deref()) {
            (None, None) => 1,
            (Some(doc), Some(rev)) if doc.revision == rev => doc.generation + 1,
            _ => {
                return HttpResponse::json_body(
                    409,
                    &json!({ "error": "conflict", "reason": "Document update conflict." }),
                )
            }
        };

        if let Value::Object(map) = &mut body {
            map.remove("_id");
            map.remove("_rev");
        }
        let revision = self.next_revision(generation);
        self.documents.insert(
            id.to_string(),
            StoredDocument {
                generation,
                revision: revision.clone(),
                body,
            },
        );
        HttpResponse::json_body(201, &json!({ "ok": true, "id": id, "rev": revision }))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn database(&self) -> &str {
        &self.database
    }

    async fn get(&self, path: &[&str], query: &[(&str, String)]) -> Result<HttpResponse> {
        self.handle("GET", path, query, None).await
    }

    async fn put(&self, path: &[&str], body: &Value) -> Result<HttpResponse> {
        self.handle("PUT", path, &[], Some(body)).await
    }

    async fn post(&self, path: &[&str], body: &Value) -> Result<HttpResponse> {
        self.handle("POST", path, &[], Some(body)).await
    }
}
