//! Append-only in-memory record store.
//!
//! Records are indexed by id and partitioned by flow. Partitions only ever
//! grow; the only mutations after `invoke` are attaching the output once and
//! adding synced marks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::types::{ActionRecord, Mapping, NewRecord};

#[derive(Default)]
struct Inner {
    records: HashMap<String, ActionRecord>,
    /// Flow token → record ids in insertion order.
    partitions: HashMap<String, Vec<String>>,
    /// Flow tokens in first-seen order.
    flows: Vec<String>,
}

/// Append-only action ledger. Cheap to clone; clones share storage.
#[derive(Clone, Default)]
pub struct Ledger {
    inner: Arc<Mutex<Inner>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new record with no output. Returns its id (minted if absent).
    ///
    /// The record always lands in its own flow's partition. A reused id
    /// replaces the earlier record: within the same flow it keeps its slot
    /// and synced marks, across flows it moves to the new flow's partition.
    pub fn invoke(&self, record: NewRecord) -> String {
        let id = record.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut stored = ActionRecord {
            id: id.clone(),
            owner: record.action.owner().clone(),
            action: record.action,
            input: record.input,
            output: None,
            synced: BTreeMap::new(),
            flow: record.flow,
            ts: Utc::now(),
        };

        let mut guard = self.lock();
        let inner = &mut *guard;
        let flow = stored.flow.clone();

        if let Some(previous) = inner.records.remove(&id) {
            warn!(
                id = id.as_str(),
                previous_flow = previous.flow.as_str(),
                flow = flow.as_str(),
                "Action record id reused"
            );
            if previous.flow == flow {
                stored.synced = previous.synced;
                inner.records.insert(id.clone(), stored);
                return id;
            }
            if let Some(ids) = inner.partitions.get_mut(&previous.flow) {
                ids.retain(|existing| existing != &id);
            }
        }

        inner.records.insert(id.clone(), stored);
        if !inner.partitions.contains_key(&flow) {
            inner.flows.push(flow.clone());
        }
        inner.partitions.entry(flow).or_default().push(id.clone());
        id
    }

    /// Attach the output of a completed invocation.
    pub fn invoked(&self, id: &str, output: Mapping) -> Result<String, LedgerError> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownRecord(id.to_string()))?;
        record.output = Some(output);
        Ok(id.to_string())
    }

    /// Mark a record as having contributed to a firing of `sync`, which
    /// produced the consequent record `then_id`.
    pub fn mark_synced(&self, id: &str, sync: &str, then_id: &str) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownRecord(id.to_string()))?;
        record.synced.insert(sync.to_string(), then_id.to_string());
        Ok(())
    }

    /// All records of a flow, in insertion order. Empty if the flow is unseen.
    pub fn by_flow(&self, flow: &str) -> Vec<ActionRecord> {
        let inner = self.lock();
        let Some(ids) = inner.partitions.get(flow) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    pub fn by_id(&self, id: &str) -> Option<ActionRecord> {
        self.lock().records.get(id).cloned()
    }

    /// Flow tokens in the order they were first seen.
    pub fn flows(&self) -> Vec<String> {
        self.lock().flows.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
