use syncweave_ledger::LedgerError;
use thiserror::Error;

/// Configuration and framework errors raised by the engine.
///
/// These are programmer errors: they abort the current sync firing and
/// propagate to whoever called the originating action. Business failures are
/// ordinary action outputs and never show up here.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("When pattern {action} in sync {sync} is missing an output pattern")]
    MissingOutputPattern { sync: String, action: String },

    #[error("Missing binding {var} while resolving {context}")]
    UnboundVariable { var: String, context: String },

    #[error("Frame in sync {0} lost the record marker of a when clause")]
    MissingActionMarker(String),

    #[error("Action produced from `then` of sync {0} is missing an id")]
    MissingThenId(String),

    #[error("Action {0} is not instrumented by this engine")]
    NotInstrumented(String),

    #[error("Concept {concept} has no {kind} named {name}")]
    UnknownMethod {
        concept: String,
        kind: &'static str,
        name: String,
    },

    #[error("Method {concept}.{name}: query names start with `_`, action names must not")]
    MethodNaming { concept: String, name: String },

    #[error("Sync {0} is already registered")]
    DuplicateSync(String),

    #[error("Sync engine dropped while {0} was still in use")]
    EngineDropped(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
