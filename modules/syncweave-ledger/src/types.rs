//! Core types for the ledger. Domain-agnostic.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A JSON object: the shape of every action input and output.
pub type Mapping = serde_json::Map<String, serde_json::Value>;

static NEXT_REF: AtomicU64 = AtomicU64::new(1);

fn next_ref() -> u64 {
    NEXT_REF.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Identity of a concept instance that owns actions.
///
/// Two refs are equal only if they came from the same `OwnerRef::new` call.
/// The name is a label for traces and never takes part in equality.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerRef {
    id: u64,
    name: String,
}

impl OwnerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_ref(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for OwnerRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OwnerRef {}

impl Hash for OwnerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity of one action on one owner. Displays as `Owner.action`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRef {
    id: u64,
    owner: OwnerRef,
    name: String,
}

impl ActionRef {
    pub fn new(owner: &OwnerRef, name: impl Into<String>) -> Self {
        Self {
            id: next_ref(),
            owner: owner.clone(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ActionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActionRef {}

impl Hash for ActionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner.name, self.name)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An action invocation as stored in the ledger. Returned by all read methods.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub id: String,
    pub action: ActionRef,
    pub owner: OwnerRef,
    pub input: Mapping,
    /// Absent while the underlying implementation is still running.
    pub output: Option<Mapping>,
    /// Sync name → id of the consequent record that sync produced.
    pub synced: BTreeMap<String, String>,
    pub flow: String,
    pub ts: DateTime<Utc>,
}

impl ActionRecord {
    pub fn is_complete(&self) -> bool {
        self.output.is_some()
    }

    /// Whether this record already contributed to a firing of `sync`.
    pub fn is_synced_by(&self, sync: &str) -> bool {
        self.synced.contains_key(sync)
    }
}

/// A record to be appended. The caller builds this; the ledger assigns the id
/// (unless one is supplied) and the timestamp.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: Option<String>,
    pub action: ActionRef,
    pub input: Mapping,
    pub flow: String,
}

impl NewRecord {
    pub fn new(action: ActionRef, input: Mapping, flow: impl Into<String>) -> Self {
        Self {
            id: None,
            action,
            input,
            flow: flow.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
