//! Changewatch Core - Domain types for the change-capture audit pipeline.
//!
//! This crate provides:
//! - The [`Document`] shape shared by every collection and command
//! - The connected principal's role and privilege snapshot ([`PrincipalProfile`])
//! - Normalized change notifications ([`ChangeEvent`])
//! - The canonical, immutable [`AuditRecord`]
//!
//! Nothing here performs I/O. The pipeline that moves these values
//! between the database and the audit collection lives in
//! `changewatch-capture`.
//!
//! # Example
//!
//! ```rust
//! use changewatch_core::{ChangeEvent, OperationKind};
//! use serde_json::json;
//!
//! let raw = json!({
//!     "_id": { "_data": "8263A1" },
//!     "operationType": "delete",
//!     "ns": { "db": "shop", "coll": "orders" },
//!     "documentKey": { "_id": 7 },
//!     "fullDocumentBeforeChange": { "_id": 7, "status": "paid" }
//! });
//!
//! let event = ChangeEvent::from_notification(raw.as_object().unwrap().clone(), "orders").unwrap();
//! assert_eq!(event.operation(), &OperationKind::Delete);
//! assert_eq!(event.document_id(), json!(7));
//! assert!(event.after().is_none());
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod document;
mod error;
mod event;
mod principal;
mod record;

pub use document::{Document, ID_FIELD, into_document};
pub use error::{NormalizeError, NormalizeResult};
pub use event::{ChangeEvent, OperationKind, ResumeToken};
pub use principal::{Principal, PrincipalProfile, Privilege, RoleRef};
pub use record::AuditRecord;
