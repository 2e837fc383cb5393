//! Maps normalized change events into audit records.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use changewatch_config::TransformFailureMode;
use changewatch_core::{AuditRecord, ChangeEvent, Document};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::TransformError;

type TransformFn = dyn Fn(&Document) -> Result<Document, TransformError> + Send + Sync;

/// A user-supplied image transform.
///
/// Applied independently to each present image. A panic inside the
/// transform is caught and reported as [`TransformError::Panicked`].
#[derive(Clone)]
pub struct Transform(Arc<TransformFn>);

impl Transform {
    /// Wrap a fallible transform.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Document) -> Result<Document, TransformError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a transform that cannot fail.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn(&Document) -> Document + Send + Sync + 'static,
    {
        Self::new(move |doc| Ok(f(doc)))
    }

    /// Apply the transform to one image.
    ///
    /// # Errors
    ///
    /// Returns the transform's own error, or [`TransformError::Panicked`]
    /// if it panicked.
    pub fn apply(&self, image: &Document) -> Result<Document, TransformError> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(image)))
            .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(&*payload))))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform(..)")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// What to do with an event whose transform failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransformFailurePolicy {
    /// Write nothing for the event.
    #[default]
    Drop,
    /// Write the record with the raw, untransformed images.
    Untransformed,
    /// Write the record with both images absent and the error recorded.
    MarkErrored,
}

impl From<TransformFailureMode> for TransformFailurePolicy {
    fn from(mode: TransformFailureMode) -> Self {
        match mode {
            TransformFailureMode::Drop => Self::Drop,
            TransformFailureMode::Untransformed => Self::Untransformed,
            TransformFailureMode::MarkErrored => Self::MarkErrored,
        }
    }
}

/// Builds [`AuditRecord`]s from [`ChangeEvent`]s.
///
/// Capture timestamps handed out by one builder (and its clones) strictly
/// increase, so records never share a timestamp even when the clock does
/// not advance between two builds.
#[derive(Debug, Clone, Default)]
pub struct AuditRecordBuilder {
    transform: Option<Transform>,
    policy: TransformFailurePolicy,
    last_stamp: Arc<Mutex<DateTime<Utc>>>,
}

impl AuditRecordBuilder {
    /// Create a builder with an optional transform and failure policy.
    #[must_use]
    pub fn new(transform: Option<Transform>, policy: TransformFailurePolicy) -> Self {
        Self {
            transform,
            policy,
            last_stamp: Arc::default(),
        }
    }

    /// The configured failure policy.
    #[must_use]
    pub fn policy(&self) -> TransformFailurePolicy {
        self.policy
    }

    /// Build the record for `event`.
    ///
    /// The timestamp is the capture time. Absent images stay absent and
    /// never reach the transform.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if the transform fails on either image.
    pub fn build(&self, event: &ChangeEvent) -> Result<AuditRecord, TransformError> {
        let before = self.transform_image(event.before())?;
        let after = self.transform_image(event.after())?;
        Ok(record(event, self.stamp(), before, after, None))
    }

    /// Build the record for `event`, applying the failure policy if the
    /// transform fails. Returns `None` when the event is dropped.
    #[must_use]
    pub fn build_or_recover(&self, event: &ChangeEvent) -> Option<AuditRecord> {
        let error = match self.build(event) {
            Ok(record) => return Some(record),
            Err(e) => e,
        };

        warn!(
            collection = %event.collection(),
            operation = %event.operation(),
            document_id = %event.document_id(),
            policy = ?self.policy,
            error = %error,
            "Transform failed"
        );

        match self.policy {
            TransformFailurePolicy::Drop => None,
            TransformFailurePolicy::Untransformed => Some(record(
                event,
                self.stamp(),
                event.before().cloned(),
                event.after().cloned(),
                None,
            )),
            TransformFailurePolicy::MarkErrored => {
                Some(record(event, self.stamp(), None, None, Some(error.to_string())))
            },
        }
    }

    /// The current time, or one nanosecond past the last stamp if the clock
    /// has not moved beyond it.
    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let stamp = match last.checked_add_signed(chrono::Duration::nanoseconds(1)) {
            Some(next) if next > now => next,
            _ => now,
        };
        *last = stamp;
        stamp
    }

    fn transform_image(
        &self,
        image: Option<&Document>,
    ) -> Result<Option<Document>, TransformError> {
        match (image, &self.transform) {
            (None, _) => Ok(None),
            (Some(doc), None) => Ok(Some(doc.clone())),
            (Some(doc), Some(transform)) => transform.apply(doc).map(Some),
        }
    }
}

fn record(
    event: &ChangeEvent,
    timestamp: DateTime<Utc>,
    before: Option<Document>,
    after: Option<Document>,
    transform_error: Option<String>,
) -> AuditRecord {
    AuditRecord {
        collection: event.collection().to_owned(),
        document_id: event.document_id(),
        operation: event.operation().clone(),
        timestamp,
        before,
        after,
        transform_error,
    }
}
