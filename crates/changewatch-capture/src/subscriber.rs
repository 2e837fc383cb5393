//! Per-collection change subscriptions.

use std::sync::Arc;

use changewatch_core::{ChangeEvent, ResumeToken};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info};

use crate::connection::{Connection, WatchOptions};
use crate::error::{DriverResult, FeedError};

/// A normalized change feed for one collection.
///
/// `Err(FeedError::Driver)` means the underlying feed faulted and should
/// be reopened; `Err(FeedError::Malformed)` affects one notification only.
pub type EventStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// Opens change feeds that request before- and after-images.
#[derive(Clone)]
pub struct ChangeSubscriber {
    connection: Arc<dyn Connection>,
}

impl ChangeSubscriber {
    /// Create a subscriber over `connection`.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Open one feed on `collection`.
    ///
    /// With `resume_after`, the feed continues after that position;
    /// otherwise it starts from now. Before-images are best-effort and
    /// are absent when retention is not enabled on the collection.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`](crate::DriverError) if the feed cannot be
    /// opened.
    pub async fn subscribe(
        &self,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> DriverResult<EventStream> {
        let resuming = resume_after.is_some();
        let options = WatchOptions::with_images().resuming_after(resume_after);
        let raw = self.connection.watch(collection, options).await?;
        info!(collection, resuming, "Change feed opened");

        let subscribed = collection.to_owned();
        let events = raw.map(move |item| -> Result<ChangeEvent, FeedError> {
            let raw = item?;
            let event = ChangeEvent::from_notification(raw, &subscribed)?;
            debug!(
                collection = %event.collection(),
                operation = %event.operation(),
                "Change received"
            );
            Ok(event)
        });
        Ok(events.boxed())
    }
}

impl std::fmt::Debug for ChangeSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscriber").finish_non_exhaustive()
    }
}
