//! Generic, domain-agnostic append-only action ledger.
//!
//! Records every invocation of an instrumented action, indexed by id and by
//! flow (the causal chain the invocation belongs to). Zero knowledge of rules,
//! frames, or any concept's business logic.
//!
//! Inputs and outputs are opaque JSON objects.

pub mod error;
pub mod store;
pub mod types;

pub use error::LedgerError;
pub use store::Ledger;
pub use types::{ActionRecord, ActionRef, Mapping, NewRecord, OwnerRef};
