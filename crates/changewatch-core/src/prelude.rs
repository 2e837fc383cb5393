//! Prelude module - commonly used types for convenient import.
//!
//! Use `use changewatch_core::prelude::*;` to import all essential types.

// Errors
pub use crate::{NormalizeError, NormalizeResult};

// Documents
pub use crate::{Document, ID_FIELD, into_document};

// Change events
pub use crate::{ChangeEvent, OperationKind, ResumeToken};

// Principals
pub use crate::{Principal, PrincipalProfile, Privilege, RoleRef};

// Records
pub use crate::AuditRecord;
