//! In-process fake of the CouchDB document and `_changes` API.
//!
//! Serves one database `db` guarded by Basic authentication `admin:pw`.
//! Supports document GET/PUT/POST with revision checks and the `normal`,
//! `longpoll` and `continuous` feeds.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use couch_sync::Configuration;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub const DATABASE: &str = "db";
const AUTHORIZATION: &str = "Basic YWRtaW46cHc="; // admin:pw

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("couch_sync=debug,couch_sync_changes_source=debug,couch_client=debug,checkpoint=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct StoredDoc {
    generation: u64,
    rev: String,
    body: Value,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct ChangeEntry {
    seq: u64,
    id: String,
    rev: String,
    deleted: bool,
}

#[derive(Default)]
struct Data {
    docs: HashMap<String, StoredDoc>,
    changes: Vec<ChangeEntry>,
    seq: u64,
    counter: u64,
    failures: VecDeque<u16>,
    changes_queries: Vec<HashMap<String, String>>,
    requests: Vec<String>,
}

struct FakeState {
    data: Mutex<Data>,
    notify: Notify,
    streams: Mutex<CancellationToken>,
}

/// Handle to a running fake server.
#[derive(Clone)]
pub struct FakeCouch {
    pub url: String,
    state: Arc<FakeState>,
}

fn seq_token(seq: u64) -> String {
    if seq == 0 {
        "0".to_string()
    } else {
        format!("{seq}-g1AAAAB{seq:06x}")
    }
}

fn parse_since(since: Option<&String>, current: u64) -> u64 {
    match since.map(String::as_str) {
        None | Some("") | Some("0") => 0,
        Some("now") => current,
        Some(token) => token
            .split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
    }
}

impl Data {
    fn write(&mut self, id: &str, mut body: Value, deleted: bool) -> Result<String, StatusCode> {
        let supplied = body.get("_rev").and_then(Value::as_str).map(str::to_string);
        let generation = match (self.docs.get(id), supplied.as_deref()) {
            (None, None) => 1,
            (Some(doc), None) if doc.deleted => doc.generation + 1,
            (Some(doc), Some(rev)) if doc.rev == rev => doc.generation + 1,
            _ => return Err(StatusCode::CONFLICT),
        };
        if let Value::Object(map) = &mut body {
            map.remove("_id");
            map.remove("_rev");
        }
        self.counter += 1;
        let rev = format!("{generation}-{:032x}", self.counter);
        self.seq += 1;
        self.docs.insert(
            id.to_string(),
            StoredDoc {
                generation,
                rev: rev.clone(),
                body,
                deleted,
            },
        );
        self.changes.push(ChangeEntry {
            seq: self.seq,
            id: id.to_string(),
            rev: rev.clone(),
            deleted,
        });
        Ok(rev)
    }

    fn render(&self, id: &str) -> Option<Value> {
        let doc = self.docs.get(id)?;
        let mut body = if doc.deleted {
            json!({ "_deleted": true })
        } else {
            doc.body.clone()
        };
        if let Value::Object(map) = &mut body {
            map.insert("_id".to_string(), json!(id));
            map.insert("_rev".to_string(), json!(doc.rev));
        }
        Some(body)
    }

    fn row(&self, change: &ChangeEntry, include_docs: bool) -> Value {
        let mut row = json!({
            "seq": seq_token(change.seq),
            "id": change.id,
            "changes": [{ "rev": change.rev }],
        });
        if change.deleted {
            row["deleted"] = json!(true);
        }
        if include_docs {
            row["doc"] = self.render(&change.id).unwrap_or(Value::Null);
        }
        row
    }

    fn rows_after(&self, since: u64, include_docs: bool) -> Vec<(u64, Value)> {
        self.changes
            .iter()
            .filter(|c| c.seq > since)
            .map(|c| (c.seq, self.row(c, include_docs)))
            .collect()
    }
}

impl FakeCouch {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState {
            data: Mutex::new(Data::default()),
            notify: Notify::new(),
            streams: Mutex::new(CancellationToken::new()),
        });

        let app = Router::new()
            .route("/db", get(database).post(post_document))
            .route("/db/_changes", get(changes))
            .route("/db/:id", get(get_document).put(put_document))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    /// Configuration for this server with a short heartbeat.
    pub fn config(&self) -> Configuration {
        let mut config = Configuration::with_password(&self.url, "admin", "pw", DATABASE);
        config.heartbeat_interval_ms = 200;
        config.read_timeout_secs = 5;
        config.connect_timeout_secs = 5;
        config
    }

    /// Create or overwrite a document, bypassing revision checks.
    pub fn put(&self, id: &str, body: Value) -> String {
        let rev = {
            let mut data = self.state.data.lock().unwrap();
            let current = data.docs.get(id).map(|d| d.rev.clone());
            let mut body = body;
            if let (Some(rev), Value::Object(map)) = (current, &mut body) {
                map.insert("_rev".to_string(), json!(rev));
            }
            data.write(id, body, false).unwrap()
        };
        self.state.notify.notify_waiters();
        rev
    }

    pub fn delete(&self, id: &str) {
        {
            let mut data = self.state.data.lock().unwrap();
            let rev = data.docs.get(id).map(|d| d.rev.clone());
            data.write(id, json!({ "_rev": rev }), true).unwrap();
        }
        self.state.notify.notify_waiters();
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.state.data.lock().unwrap().render(id)
    }

    /// Token of the most recent change.
    pub fn current_seq(&self) -> String {
        seq_token(self.state.data.lock().unwrap().seq)
    }

    /// Make the next `_changes` requests fail with these statuses.
    pub fn fail_next_changes(&self, status: u16) {
        self.state.data.lock().unwrap().failures.push_back(status);
    }

    /// Query parameters of every `_changes` request so far.
    pub fn changes_queries(&self) -> Vec<HashMap<String, String>> {
        self.state.data.lock().unwrap().changes_queries.clone()
    }

    /// `METHOD /path` of every document request so far.
    pub fn document_requests(&self) -> Vec<String> {
        self.state.data.lock().unwrap().requests.clone()
    }

    /// Close every open continuous feed response.
    pub fn drop_streams(&self) {
        let mut streams = self.state.streams.lock().unwrap();
        streams.cancel();
        *streams = CancellationToken::new();
    }
}

fn unauthorized(headers: &HeaderMap) -> Option<Response> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == AUTHORIZATION)
        .unwrap_or(false);
    if authorized {
        None
    } else {
        Some(
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized", "reason": "Name or password is incorrect." })),
            )
                .into_response(),
        )
    }
}

fn conflict() -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "conflict", "reason": "Document update conflict." })),
    )
        .into_response()
}

async fn database(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    if let Some(denied) = unauthorized(&headers) {
        return denied;
    }
    let data = state.data.lock().unwrap();
    Json(json!({ "db_name": DATABASE, "update_seq": seq_token(data.seq) })).into_response()
}

async fn get_document(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(denied) = unauthorized(&headers) {
        return denied;
    }
    let mut data = state.data.lock().unwrap();
    data.requests.push(format!("GET /db/{id}"));
    let found = data
        .docs
        .get(&id)
        .filter(|doc| !doc.deleted)
        .filter(|doc| query.get("rev").map(|r| *r == doc.rev).unwrap_or(true))
        .is_some();
    match data.render(&id) {
        Some(body) if found => Json(body).into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "reason": "missing" })),
        )
            .into_response(),
    }
}

async fn put_document(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = unauthorized(&headers) {
        return denied;
    }
    let written = {
        let mut data = state.data.lock().unwrap();
        data.requests.push(format!("PUT /db/{id}"));
        data.write(&id, body, false)
    };
    respond_write(&state, &id, written)
}

async fn post_document(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = unauthorized(&headers) {
        return denied;
    }
    let (id, written) = {
        let mut data = state.data.lock().unwrap();
        data.requests.push("POST /db".to_string());
        let id = match body.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                data.counter += 1;
                format!("{:032x}", data.counter)
            }
        };
        let written = data.write(&id, body, false);
        (id, written)
    };
    respond_write(&state, &id, written)
}

fn respond_write(state: &FakeState, id: &str, written: Result<String, StatusCode>) -> Response {
    match written {
        Ok(rev) => {
            state.notify.notify_waiters();
            (
                StatusCode::CREATED,
                Json(json!({ "ok": true, "id": id, "rev": rev })),
            )
                .into_response()
        }
        Err(_) => conflict(),
    }
}

async fn changes(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(denied) = unauthorized(&headers) {
        return denied;
    }

    let (since, failure) = {
        let mut data = state.data.lock().unwrap();
        data.changes_queries.push(query.clone());
        let current = data.seq;
        (parse_since(query.get("since"), current), data.failures.pop_front())
    };
    if let Some(status) = failure {
        return (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "error": "scripted", "reason": format!("scripted failure {status}") })),
        )
            .into_response();
    }

    let include_docs = query.get("include_docs").map(String::as_str) == Some("true");
    let millis = |name: &str, default: u64| {
        query
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    };

    match query.get("feed").map(String::as_str) {
        Some("continuous") => {
            let heartbeat = Duration::from_millis(millis("heartbeat", 60_000));
            continuous(state, since, include_docs, heartbeat)
        }
        Some("longpoll") => {
            let timeout = Duration::from_millis(millis("timeout", 60_000));
            let notified = state.notify.notified();
            let rows = state.data.lock().unwrap().rows_after(since, include_docs);
            if rows.is_empty() {
                let _ = tokio::time::timeout(timeout, notified).await;
            }
            let rows = state.data.lock().unwrap().rows_after(since, include_docs);
            page(rows, since, 0)
        }
        _ => {
            let rows = state.data.lock().unwrap().rows_after(since, include_docs);
            let limit = millis("limit", 0) as usize;
            page(rows, since, limit)
        }
    }
}

fn page(rows: Vec<(u64, Value)>, since: u64, limit: usize) -> Response {
    let rows: Vec<(u64, Value)> = if limit > 0 {
        rows.into_iter().take(limit).collect()
    } else {
        rows
    };
    let last_seq = rows.last().map(|(seq, _)| *seq).unwrap_or(since);
    let results: Vec<Value> = rows.into_iter().map(|(_, row)| row).collect();
    Json(json!({ "results": results, "last_seq": seq_token(last_seq) })).into_response()
}

fn continuous(
    state: Arc<FakeState>,
    mut since: u64,
    include_docs: bool,
    heartbeat: Duration,
) -> Response {
    let (sender, receiver) = mpsc::channel::<Result<String, Infallible>>(64);
    let closed = state.streams.lock().unwrap().clone();

    tokio::spawn(async move {
        loop {
            let notified = state.notify.notified();
            let rows = state.data.lock().unwrap().rows_after(since, include_docs);
            for (seq, row) in rows {
                since = seq;
                if sender.send(Ok(format!("{row}\n"))).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = closed.cancelled() => return,
                _ = notified => {}
                _ = tokio::time::sleep(heartbeat) => {
                    if sender.send(Ok("\n".to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    });
    (StatusCode::OK, Body::from_stream(stream)).into_response()
}
