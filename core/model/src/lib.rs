//! Shared entity model and operation envelope for Ledgerline sync.
//!
//! The sync engine moves shallow field maps, not typed structs, so that the
//! conflict analyzer can compare arbitrary fields without knowing every
//! entity shape. The typed entities here are the boundary types the
//! application works with; `fields_of` flattens them into the wire shape.

pub mod entity;
pub mod envelope;

pub use entity::{
    fields_of, mergeable_fields, monetary_fields, Account, Budget, EntityKind, FieldMap, Goal,
    Transaction,
};
pub use envelope::{OperationType, SyncOperation};
