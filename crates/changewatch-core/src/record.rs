//! The canonical audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::event::OperationKind;

/// One persisted audit record.
///
/// The timestamp is the capture time (when the record was built), not
/// the mutation time. Records are immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Collection the mutation happened in.
    pub collection: String,
    /// Primary identifier of the mutated document.
    pub document_id: Value,
    /// Kind of mutation.
    pub operation: OperationKind,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Document state before the mutation (after the transform, if any).
    pub before: Option<Document>,
    /// Document state after the mutation (after the transform, if any).
    pub after: Option<Document>,
    /// Set when the transform failed and the record was kept regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_error: Option<String>,
}

impl AuditRecord {
    /// Render the record as the document written to the audit collection.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("collection".into(), Value::String(self.collection.clone()));
        doc.insert("documentId".into(), self.document_id.clone());
        doc.insert(
            "operation".into(),
            Value::String(self.operation.as_str().to_owned()),
        );
        doc.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        doc.insert("before".into(), image_value(self.before.as_ref()));
        doc.insert("after".into(), image_value(self.after.as_ref()));
        if let Some(error) = &self.transform_error {
            doc.insert("transformError".into(), Value::String(error.clone()));
        }
        doc
    }

    /// Whether this record was kept despite a transform failure.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.transform_error.is_some()
    }
}

fn image_value(image: Option<&Document>) -> Value {
    image.map_or(Value::Null, |doc| Value::Object(doc.clone()))
}
