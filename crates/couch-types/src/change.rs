//! Changes feed entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single change reported by the `_changes` feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub document_id: String,
    /// Position of this change; pass it back as `since` to resume after it.
    pub sequence_token: Option<String>,
    pub deleted: bool,
    /// First (winning) revision listed for the change.
    pub revision: Option<String>,
    /// Raw JSON of the document body, present when documents were requested.
    pub document: Option<String>,
}

/// Wire shape of one feed row:
///
/// ```json
/// {"seq": 5, "id": "d1", "changes": [{"rev": "2-abc"}], "deleted": true, "doc": {...}}
/// ```
#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    pub id: String,
    #[serde(default)]
    pub seq: Value,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub changes: Vec<RevEntry>,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RevEntry {
    pub rev: String,
}

impl ChangeRow {
    /// Convert the row into an event. The document body is only kept when
    /// `include_document` is set.
    pub fn into_event(self, include_document: bool) -> ChangeEvent {
        let revision = self.changes.into_iter().next().map(|c| c.rev);
        let document = if include_document {
            self.doc
                .filter(|doc| !doc.is_null())
                .map(|doc| doc.to_string())
        } else {
            None
        };

        ChangeEvent {
            document_id: self.id,
            sequence_token: sequence_text(&self.seq),
            deleted: self.deleted,
            revision,
            document,
        }
    }
}

/// Render a sequence value as the token string handed back in `since`.
///
/// Modern servers send opaque strings, older ones plain integers or arrays;
/// strings are kept verbatim and anything else uses its compact JSON text.
pub fn sequence_text(seq: &Value) -> Option<String> {
    match seq {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
