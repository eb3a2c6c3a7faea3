use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger was asked to update a record it never stored. Indicates a
    /// framework bug, never a user-facing condition.
    #[error("Action record {0} not found in ledger")]
    UnknownRecord(String),
}
