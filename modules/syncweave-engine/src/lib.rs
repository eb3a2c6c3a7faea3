//! Declarative synchronization engine.
//!
//! Provides a generic dispatch loop: record → match → transform → fire →
//! recurse until settled. Records form causal chains (flows) in the
//! underlying [`Ledger`].
//!
//! Consumers define their domain by implementing [`Concept`] (actions and
//! queries over their own state) and registering [`Syncs`]: named
//! `when`/`where`/`then` rules that react to completed actions in a flow by
//! invoking further actions in the same flow.

pub mod concept;
pub mod config;
pub mod engine;
pub mod error;
pub mod frames;
pub mod pattern;
pub mod vars;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use concept::{Action, Concept, Instrumented, Invocation, Methods, Query};
pub use config::{EngineConfig, Logging};
pub use engine::{SyncDeclaration, SyncEngine, Synchronization, Syncs, Transform};
pub use error::SyncError;
pub use frames::{Frame, Frames, DEFAULT_QUERY_CONCURRENCY};
pub use pattern::{mapping, ActionPattern, Fields, Term};
pub use vars::{flow_key, Var, Vars};

pub use syncweave_ledger::{ActionRecord, ActionRef, Ledger, LedgerError, Mapping, OwnerRef};
