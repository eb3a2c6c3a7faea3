//! Action patterns: templates over action records whose fields are either
//! literal values or binding keys.

use std::fmt;

use serde_json::Value;
use syncweave_ledger::{ActionRef, Mapping, OwnerRef};

use crate::concept::Action;
use crate::error::SyncError;
use crate::frames::Frame;
use crate::vars::{flow_key, Var};

/// Convert a `json!({...})` object into a [`Mapping`]. Non-object values
/// yield an empty mapping.
pub fn mapping(value: Value) -> Mapping {
    match value {
        Value::Object(map) => map,
        _ => Mapping::new(),
    }
}

// ---------------------------------------------------------------------------
// Term
// ---------------------------------------------------------------------------

/// One field of a pattern: a literal that must match exactly, or a binding key.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Var(Var),
    Value(Value),
}

impl Term {
    /// Substitute a binding key from `frame`; literals pass through.
    pub fn resolve(&self, frame: &Frame) -> Option<Value> {
        match self {
            Term::Var(var) => frame.get(var).cloned(),
            Term::Value(value) => Some(value.clone()),
        }
    }
}

impl From<Var> for Term {
    fn from(var: Var) -> Self {
        Term::Var(var)
    }
}

impl From<&Var> for Term {
    fn from(var: &Var) -> Self {
        Term::Var(var.clone())
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term::Value(value)
    }
}

macro_rules! literal_terms {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Term {
                fn from(value: $ty) -> Self {
                    Term::Value(Value::from(value))
                }
            }
        )*
    };
}

literal_terms!(&str, String, bool, i32, i64, u32, u64, f64);

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Ordered `field → term` template for an input or output mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(String, Term)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, term: impl Into<Term>) -> Self {
        self.0.push((key.into(), term.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.0.iter().map(|(key, term)| (key.as_str(), term))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a concrete mapping by substituting every binding key from `frame`.
    pub fn resolve(&self, frame: &Frame, context: &str) -> Result<Mapping, SyncError> {
        let mut resolved = Mapping::new();
        for (key, term) in &self.0 {
            let value = term.resolve(frame).ok_or_else(|| SyncError::UnboundVariable {
                var: match term {
                    Term::Var(var) => format!("{var:?}"),
                    Term::Value(_) => key.clone(),
                },
                context: context.to_string(),
            })?;
            resolved.insert(key.clone(), value);
        }
        Ok(resolved)
    }

    /// Unify this template against a record mapping, extending `frame`.
    ///
    /// Every field must be present in `actual`. Literals must be equal; a
    /// binding key binds if unbound and must be equal if already bound.
    pub(crate) fn unify(&self, actual: &Mapping, frame: &mut Frame) -> bool {
        for (key, term) in &self.0 {
            let Some(value) = actual.get(key) else {
                return false;
            };
            match term {
                Term::Value(expected) => {
                    if expected != value {
                        return false;
                    }
                }
                Term::Var(var) => match frame.get(var) {
                    Some(bound) if bound != value => return false,
                    Some(_) => {}
                    None => {
                        frame.insert(var.clone(), value.clone());
                    }
                },
            }
        }
        true
    }
}

impl<K: Into<String>, T: Into<Term>, const N: usize> From<[(K, T); N]> for Fields {
    fn from(entries: [(K, T); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(key, term)| (key.into(), term.into()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// ActionPattern
// ---------------------------------------------------------------------------

/// Template over one action: which action, which input/output fields, and
/// the flow key tying it to the rest of the rule.
///
/// `when` clauses need an output pattern (possibly empty, see
/// [`ActionPattern::completed`]); `then` clauses never have one.
#[derive(Clone)]
pub struct ActionPattern {
    action: Action,
    input: Fields,
    output: Option<Fields>,
    flow: Var,
}

impl ActionPattern {
    pub fn new(action: &Action) -> Self {
        Self {
            action: action.clone(),
            input: Fields::new(),
            output: None,
            flow: flow_key().clone(),
        }
    }

    pub fn input(mut self, key: impl Into<String>, term: impl Into<Term>) -> Self {
        self.input = self.input.with(key, term);
        self
    }

    pub fn output(mut self, key: impl Into<String>, term: impl Into<Term>) -> Self {
        self.output = Some(self.output.take().unwrap_or_default().with(key, term));
        self
    }

    /// Match the completed action regardless of its output fields.
    pub fn completed(mut self) -> Self {
        self.output.get_or_insert_with(Fields::new);
        self
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn action_ref(&self) -> &ActionRef {
        self.action.action_ref()
    }

    pub fn owner(&self) -> &OwnerRef {
        self.action.owner()
    }

    pub fn input_fields(&self) -> &Fields {
        &self.input
    }

    pub fn output_fields(&self) -> Option<&Fields> {
        self.output.as_ref()
    }

    pub fn flow(&self) -> &Var {
        &self.flow
    }
}

impl fmt::Debug for ActionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionPattern")
            .field("action", &self.action_ref().to_string())
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}
