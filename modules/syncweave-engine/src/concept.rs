//! Action interception.
//!
//! A concept declares its actions and queries once through [`Methods`].
//! Instrumenting it (see [`SyncEngine::instrument`](crate::SyncEngine::instrument))
//! wraps every action so each call is recorded in the ledger and followed by
//! dispatch, and binds every query as-is. Query names start with `_`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use anyhow::Result;
use futures::future::{self, BoxFuture, FutureExt};
use syncweave_ledger::{ActionRef, Mapping, NewRecord, OwnerRef};
use uuid::Uuid;

use crate::engine::EngineShared;
use crate::error::SyncError;

/// Raw action implementation, normalized to the async contract.
pub type ActionFn = Arc<dyn Fn(Mapping) -> BoxFuture<'static, Result<Mapping>> + Send + Sync>;

/// Raw query implementation, normalized to the async contract.
pub type QueryFn = Arc<dyn Fn(Mapping) -> BoxFuture<'static, Result<Vec<Mapping>>> + Send + Sync>;

/// Owner of a set of actions and queries.
pub trait Concept: Send + Sync + 'static {
    /// Label used in traces, e.g. `Counter`.
    fn name(&self) -> &str;

    /// Declare every action and query this concept exposes.
    fn methods(self: Arc<Self>, methods: &mut Methods);
}

// ---------------------------------------------------------------------------
// Methods: declaration table
// ---------------------------------------------------------------------------

pub(crate) enum Method {
    Action(ActionFn),
    Query(QueryFn),
}

#[derive(Default)]
pub struct Methods {
    pub(crate) entries: Vec<(String, Method)>,
}

impl Methods {
    pub fn action<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Mapping) -> Result<Mapping> + Send + Sync + 'static,
    {
        let f: ActionFn = Arc::new(move |input| future::ready(f(input)).boxed());
        self.entries.push((name.to_string(), Method::Action(f)));
    }

    pub fn action_async<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Mapping) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Mapping>> + Send + 'static,
    {
        let f: ActionFn = Arc::new(move |input| f(input).boxed());
        self.entries.push((name.to_string(), Method::Action(f)));
    }

    pub fn query<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Mapping) -> Result<Vec<Mapping>> + Send + Sync + 'static,
    {
        let query = Query::from_fn(name, f);
        self.entries.push((name.to_string(), Method::Query(query.f)));
    }

    pub fn query_async<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Mapping) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Mapping>>> + Send + 'static,
    {
        let query = Query::from_async(name, f);
        self.entries.push((name.to_string(), Method::Query(query.f)));
    }
}

pub(crate) fn is_query_name(name: &str) -> bool {
    name.starts_with('_')
}

// ---------------------------------------------------------------------------
// Query: bound, never recorded
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Query {
    owner: Option<OwnerRef>,
    name: Arc<str>,
    f: QueryFn,
}

impl Query {
    /// Ad-hoc query from a synchronous function.
    pub fn from_fn<F>(name: &str, f: F) -> Self
    where
        F: Fn(Mapping) -> Result<Vec<Mapping>> + Send + Sync + 'static,
    {
        Self {
            owner: None,
            name: Arc::from(name),
            f: Arc::new(move |input| future::ready(f(input)).boxed()),
        }
    }

    /// Ad-hoc query from an asynchronous function.
    pub fn from_async<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Mapping) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Mapping>>> + Send + 'static,
    {
        Self {
            owner: None,
            name: Arc::from(name),
            f: Arc::new(move |input| f(input).boxed()),
        }
    }

    pub(crate) fn bound(owner: &OwnerRef, name: &str, f: QueryFn) -> Self {
        Self {
            owner: Some(owner.clone()),
            name: Arc::from(name),
            f,
        }
    }

    /// `Owner._name` for bound queries, `_name` for ad-hoc ones.
    pub fn name(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{owner}.{}", self.name),
            None => self.name.to_string(),
        }
    }

    pub fn call(&self, input: Mapping) -> BoxFuture<'static, Result<Vec<Mapping>>> {
        (self.f)(input)
    }

    pub fn ptr_eq(&self, other: &Query) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Query").field(&self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Action: instrumented
// ---------------------------------------------------------------------------

/// One call of an instrumented action. Flow and id are minted when absent.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub input: Mapping,
    pub flow: Option<String>,
    pub id: Option<String>,
}

impl Invocation {
    pub fn new(input: Mapping) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn in_flow(mut self, flow: impl Into<String>) -> Self {
        self.flow = Some(flow.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

struct ActionInner {
    action: ActionRef,
    raw: ActionFn,
    engine: Weak<EngineShared>,
}

/// Instrumented action. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl Action {
    pub(crate) fn new(action: ActionRef, raw: ActionFn, engine: Weak<EngineShared>) -> Self {
        Self {
            inner: Arc::new(ActionInner { action, raw, engine }),
        }
    }

    pub fn action_ref(&self) -> &ActionRef {
        &self.inner.action
    }

    pub fn owner(&self) -> &OwnerRef {
        self.inner.action.owner()
    }

    pub fn ptr_eq(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn belongs_to(&self, engine: &Arc<EngineShared>) -> bool {
        std::ptr::eq(self.inner.engine.as_ptr(), Arc::as_ptr(engine))
    }

    /// Call as an externally triggered action: fresh flow, fresh id.
    pub async fn call(&self, input: Mapping) -> Result<Mapping> {
        self.invoke(Invocation::new(input)).await
    }

    /// Record, execute, record the output, synchronize, then hand back the
    /// raw output. Every sync reachable from this call has settled by the
    /// time the future resolves.
    pub fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Result<Mapping>> {
        let this = self.clone();
        async move {
            let engine = this
                .inner
                .engine
                .upgrade()
                .ok_or_else(|| SyncError::EngineDropped(this.inner.action.to_string()))?;

            let Invocation { input, flow, id } = invocation;
            let flow = flow.unwrap_or_else(|| Uuid::new_v4().to_string());
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

            let record = NewRecord::new(this.inner.action.clone(), input.clone(), flow).with_id(id);
            let id = engine.ledger.invoke(record);

            let output = (this.inner.raw)(input).await?;

            engine.ledger.invoked(&id, output.clone()).map_err(SyncError::from)?;
            let completed = engine
                .ledger
                .by_id(&id)
                .ok_or_else(|| SyncError::Ledger(syncweave_ledger::LedgerError::UnknownRecord(id.clone())))?;
            engine.synchronize(&completed).await?;

            Ok::<_, anyhow::Error>(output)
        }
        .boxed()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.inner.action.to_string()).finish()
    }
}

// ---------------------------------------------------------------------------
// Instrumented: the wrapped concept
// ---------------------------------------------------------------------------

/// Name-keyed record of a concept's wrapped actions and bound queries.
#[derive(Clone)]
pub struct Instrumented {
    pub(crate) owner: OwnerRef,
    pub(crate) actions: BTreeMap<String, Action>,
    pub(crate) queries: BTreeMap<String, Query>,
}

impl Instrumented {
    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    pub fn action(&self, name: &str) -> Result<Action, SyncError> {
        self.actions.get(name).cloned().ok_or_else(|| SyncError::UnknownMethod {
            concept: self.owner.name().to_string(),
            kind: "action",
            name: name.to_string(),
        })
    }

    pub fn query(&self, name: &str) -> Result<Query, SyncError> {
        self.queries.get(name).cloned().ok_or_else(|| SyncError::UnknownMethod {
            concept: self.owner.name().to_string(),
            kind: "query",
            name: name.to_string(),
        })
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }
}

impl fmt::Debug for Instrumented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumented")
            .field("owner", &self.owner.name())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .finish()
    }
}
