//! The upstream database collaborator.
//!
//! The pipeline never speaks a wire protocol itself. It needs exactly
//! three capabilities from a connected session, expressed by
//! [`Connection`]:
//!
//! 1. run administrative commands (`connectionStatus`, `usersInfo`, `collMod`)
//! 2. open a continuous per-collection change feed
//! 3. insert a document into a named collection

use async_trait::async_trait;
use changewatch_core::{Document, ResumeToken};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

/// A continuous feed of raw change notifications.
///
/// The stream ends when the server closes the feed; an `Err` item is a
/// feed fault. Either way the caller decides whether to reopen.
pub type ChangeStream = BoxStream<'static, DriverResult<Document>>;

/// Whether notifications carry the current full document on update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocument {
    /// Only the update description.
    #[default]
    Default,
    /// Look up the current full document.
    UpdateLookup,
}

/// Whether notifications carry the document state before the change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocumentBeforeChange {
    /// Never.
    #[default]
    Off,
    /// When retention is enabled on the collection; absent otherwise.
    WhenAvailable,
    /// Always; the feed fails if retention is disabled.
    Required,
}

/// Options for opening a change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    /// After-image mode.
    pub full_document: FullDocument,
    /// Before-image mode.
    pub full_document_before_change: FullDocumentBeforeChange,
    /// Resume after this position instead of starting from now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_after: Option<ResumeToken>,
}

impl WatchOptions {
    /// Options requesting after-images on update and best-effort
    /// before-images on every operation.
    #[must_use]
    pub fn with_images() -> Self {
        Self {
            full_document: FullDocument::UpdateLookup,
            full_document_before_change: FullDocumentBeforeChange::WhenAvailable,
            resume_after: None,
        }
    }

    /// Resume after `token`, if any.
    #[must_use]
    pub fn resuming_after(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_after = token;
        self
    }
}

/// A connected database session.
///
/// Implementations must be thread-safe; one connection is shared by every
/// feed task and the sink.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the session is currently established.
    fn is_connected(&self) -> bool;

    /// Run an administrative command and return the server's reply.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`](crate::DriverError) if the command could
    /// not be sent or the server rejected it.
    async fn run_command(&self, command: Document) -> DriverResult<Document>;

    /// Open a change feed on `collection`.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`](crate::DriverError) if the feed cannot be
    /// opened.
    async fn watch(&self, collection: &str, options: WatchOptions) -> DriverResult<ChangeStream>;

    /// Insert `document` into `collection`.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`](crate::DriverError) if the write fails.
    async fn insert_one(&self, collection: &str, document: Document) -> DriverResult<()>;
}
