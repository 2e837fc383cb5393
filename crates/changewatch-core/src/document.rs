//! The document shape used for commands, notifications and records.

use serde_json::Value;

/// A database document: an ordered map of field names to JSON values.
pub type Document = serde_json::Map<String, Value>;

/// Name of the primary identifier field in every document key.
pub const ID_FIELD: &str = "_id";

/// Convert a JSON value into a [`Document`].
///
/// Returns `None` for anything that is not an object, including `null`.
#[must_use]
pub fn into_document(value: Value) -> Option<Document> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
