//! Normalized change events.
//!
//! The upstream feed delivers heterogeneous notification documents. They
//! are normalized here into a [`ChangeEvent`] with a fixed shape:
//!
//! | Raw field | Normalized as |
//! |-----------|---------------|
//! | `_id` | [`ResumeToken`] |
//! | `operationType` | [`OperationKind`] (copied verbatim) |
//! | `documentKey` | document key |
//! | `fullDocumentBeforeChange` | before-image |
//! | `fullDocument` | after-image |
//! | `ns.coll` | source collection |
//! | `clusterTime` / `wallTime` | origin timestamp |
//!
//! Explicit `null` and absent fields both normalize to absence.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, ID_FIELD, into_document};
use crate::error::{NormalizeError, NormalizeResult};

/// The kind of mutation a change event describes.
///
/// Unrecognized kinds are preserved as [`OperationKind::Other`] so that
/// nothing reported by the feed is lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    /// A document was inserted.
    Insert,
    /// A document was partially updated.
    Update,
    /// A document was replaced wholesale.
    Replace,
    /// A document was deleted.
    Delete,
    /// The feed was invalidated (collection dropped or renamed).
    Invalidate,
    /// Any other operation reported by the feed.
    Other(String),
}

impl OperationKind {
    /// The wire name of this operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "replace" => Self::Replace,
            "delete" => Self::Delete,
            "invalidate" => Self::Invalidate,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for OperationKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<OperationKind> for String {
    fn from(value: OperationKind) -> Self {
        match value {
            OperationKind::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque feed position, used to reopen a feed after the last seen event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub Value);

/// A normalized change notification.
///
/// Produced once per underlying notification and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    operation: OperationKind,
    document_key: Option<Document>,
    before: Option<Document>,
    after: Option<Document>,
    collection: String,
    cluster_time: Option<Value>,
    wall_time: Option<DateTime<Utc>>,
    resume_token: Option<ResumeToken>,
}

impl ChangeEvent {
    /// Create an event from already-normalized parts.
    #[must_use]
    pub fn new(
        collection: impl Into<String>,
        operation: OperationKind,
        document_key: Option<Document>,
        before: Option<Document>,
        after: Option<Document>,
    ) -> Self {
        Self {
            operation,
            document_key,
            before,
            after,
            collection: collection.into(),
            cluster_time: None,
            wall_time: None,
            resume_token: None,
        }
    }

    /// Attach the feed position this event was read at.
    #[must_use]
    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    /// Normalize a raw feed notification.
    ///
    /// `subscribed_collection` is used when the notification carries no
    /// namespace (some event kinds omit it).
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError`] if `operationType` is absent or not a
    /// string, or if `documentKey` is present but not a document.
    pub fn from_notification(
        mut raw: Document,
        subscribed_collection: &str,
    ) -> NormalizeResult<Self> {
        let operation = match raw.remove("operationType") {
            Some(Value::String(op)) => OperationKind::from(op),
            Some(_) => {
                return Err(NormalizeError::InvalidField {
                    field: "operationType",
                    expected: "a string",
                });
            },
            None => {
                return Err(NormalizeError::MissingField {
                    field: "operationType",
                });
            },
        };

        let document_key = match raw.remove("documentKey") {
            None | Some(Value::Null) => None,
            Some(Value::Object(key)) => Some(key),
            Some(_) => {
                return Err(NormalizeError::InvalidField {
                    field: "documentKey",
                    expected: "a document",
                });
            },
        };

        let collection = raw
            .get("ns")
            .and_then(|ns| ns.get("coll"))
            .and_then(Value::as_str)
            .unwrap_or(subscribed_collection)
            .to_owned();

        let wall_time = raw
            .get("wallTime")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(Self {
            operation,
            document_key,
            before: raw.remove("fullDocumentBeforeChange").and_then(into_document),
            after: raw.remove("fullDocument").and_then(into_document),
            collection,
            cluster_time: raw.remove("clusterTime").filter(|v| !v.is_null()),
            wall_time,
            resume_token: raw
                .remove(ID_FIELD)
                .filter(|v| !v.is_null())
                .map(ResumeToken),
        })
    }

    /// The kind of mutation.
    #[must_use]
    pub fn operation(&self) -> &OperationKind {
        &self.operation
    }

    /// The full document key, if the notification carried one.
    #[must_use]
    pub fn document_key(&self) -> Option<&Document> {
        self.document_key.as_ref()
    }

    /// The primary identifier of the mutated document.
    ///
    /// This is the key's `_id` field. Keys without `_id` (sharded
    /// collections may carry only the shard key) yield the whole key;
    /// events without a key yield `null`.
    #[must_use]
    pub fn document_id(&self) -> Value {
        match &self.document_key {
            Some(key) => key
                .get(ID_FIELD)
                .cloned()
                .unwrap_or_else(|| Value::Object(key.clone())),
            None => Value::Null,
        }
    }

    /// The document state before the mutation, if retained.
    #[must_use]
    pub fn before(&self) -> Option<&Document> {
        self.before.as_ref()
    }

    /// The document state after the mutation, if available.
    #[must_use]
    pub fn after(&self) -> Option<&Document> {
        self.after.as_ref()
    }

    /// The collection the mutation happened in.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The logical cluster time of the mutation, as reported.
    #[must_use]
    pub fn cluster_time(&self) -> Option<&Value> {
        self.cluster_time.as_ref()
    }

    /// The wall-clock time of the mutation, when reported.
    #[must_use]
    pub fn wall_time(&self) -> Option<DateTime<Utc>> {
        self.wall_time
    }

    /// The feed position of this event.
    #[must_use]
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Document {
        into_document(value).unwrap()
    }

    #[test]
    fn test_operation_kind_round_trips_names() {
        for name in ["insert", "update", "replace", "delete", "invalidate"] {
            let kind = OperationKind::from(name);
            assert!(!matches!(kind, OperationKind::Other(_)));
            assert_eq!(kind.as_str(), name);
        }
        let other = OperationKind::from("drop");
        assert_eq!(other, OperationKind::Other("drop".to_owned()));
        assert_eq!(String::from(other), "drop");
    }

    #[test]
    fn test_operation_kind_serializes_as_string() {
        assert_eq!(
            serde_json::to_value(OperationKind::Update).unwrap(),
            json!("update")
        );
        let parsed: OperationKind = serde_json::from_value(json!("rename")).unwrap();
        assert_eq!(parsed.as_str(), "rename");
    }

    #[test]
    fn test_normalize_update() {
        let event = ChangeEvent::from_notification(
            raw(json!({
                "_id": { "_data": "826" },
                "operationType": "update",
                "clusterTime": { "t": 1, "i": 2 },
                "wallTime": "2024-05-01T10:00:00Z",
                "ns": { "db": "shop", "coll": "orders" },
                "documentKey": { "_id": "o-1" },
                "fullDocumentBeforeChange": { "_id": "o-1", "qty": 1 },
                "fullDocument": { "_id": "o-1", "qty": 2 },
                "updateDescription": { "updatedFields": { "qty": 2 } }
            })),
            "orders",
        )
        .unwrap();

        assert_eq!(event.operation(), &OperationKind::Update);
        assert_eq!(event.document_id(), json!("o-1"));
        assert_eq!(event.before().unwrap().get("qty"), Some(&json!(1)));
        assert_eq!(event.after().unwrap().get("qty"), Some(&json!(2)));
        assert_eq!(event.collection(), "orders");
        assert_eq!(event.cluster_time(), Some(&json!({ "t": 1, "i": 2 })));
        assert!(event.wall_time().is_some());
        assert_eq!(
            event.resume_token(),
            Some(&ResumeToken(json!({ "_data": "826" })))
        );
    }

    #[test]
    fn test_normalize_null_images_are_absent() {
        let event = ChangeEvent::from_notification(
            raw(json!({
                "operationType": "insert",
                "documentKey": { "_id": 1 },
                "fullDocumentBeforeChange": null,
                "fullDocument": { "_id": 1 }
            })),
            "items",
        )
        .unwrap();

        assert!(event.before().is_none());
        assert!(event.after().is_some());
        assert_eq!(event.collection(), "items");
        assert!(event.resume_token().is_none());
    }

    #[test]
    fn test_normalize_missing_operation_type() {
        let err = ChangeEvent::from_notification(raw(json!({ "documentKey": {} })), "c")
            .unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingField {
                field: "operationType"
            }
        );
    }

    #[test]
    fn test_normalize_rejects_scalar_document_key() {
        let err = ChangeEvent::from_notification(
            raw(json!({ "operationType": "delete", "documentKey": 5 })),
            "c",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::InvalidField {
                field: "documentKey",
                ..
            }
        ));
    }

    #[test]
    fn test_document_id_without_id_field_uses_whole_key() {
        let key = raw(json!({ "region": "eu", "sku": 4 }));
        let event = ChangeEvent::new("c", OperationKind::Delete, Some(key), None, None);
        assert_eq!(event.document_id(), json!({ "region": "eu", "sku": 4 }));
    }

    #[test]
    fn test_document_id_without_key_is_null() {
        let event = ChangeEvent::new("c", OperationKind::Invalidate, None, None, None);
        assert_eq!(event.document_id(), Value::Null);
    }
}
