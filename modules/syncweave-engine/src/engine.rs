//! The dispatch loop.
//!
//! Record → match → transform → fire → recurse until settled. Every action
//! completion runs the syncs indexed under it; consequent actions re-enter
//! interception in the same flow, so dispatch is depth-first and fully
//! awaited before the original caller sees its result.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use syncweave_ledger::{ActionRecord, ActionRef, Ledger, OwnerRef};
use tracing::{debug, info};
use uuid::Uuid;

use crate::concept::{is_query_name, Action, Concept, Instrumented, Invocation, Method, Methods, Query};
use crate::config::{EngineConfig, Logging};
use crate::error::SyncError;
use crate::frames::{Frame, Frames};
use crate::pattern::ActionPattern;
use crate::vars::{flow_key, Var, Vars};

// ---------------------------------------------------------------------------
// Where clauses
// ---------------------------------------------------------------------------

/// Frame transform applied between matching and firing.
///
/// May filter, extend or multiply frames (including through queries) but
/// never touches the ledger.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, frames: Frames) -> Result<Frames>;
}

struct SyncTransform<F>(F);

#[async_trait]
impl<F> Transform for SyncTransform<F>
where
    F: Fn(Frames) -> Frames + Send + Sync,
{
    async fn apply(&self, frames: Frames) -> Result<Frames> {
        Ok((self.0)(frames))
    }
}

struct AsyncTransform<F>(F);

#[async_trait]
impl<F> Transform for AsyncTransform<F>
where
    F: Fn(Frames) -> BoxFuture<'static, Result<Frames>> + Send + Sync,
{
    async fn apply(&self, frames: Frames) -> Result<Frames> {
        (self.0)(frames).await
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// What a sync declaration function returns: `when`, optional `where`, `then`.
#[derive(Default)]
pub struct SyncDeclaration {
    when: Vec<ActionPattern>,
    where_clause: Option<Arc<dyn Transform>>,
    then: Vec<ActionPattern>,
}

impl SyncDeclaration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, pattern: ActionPattern) -> Self {
        self.when.push(pattern);
        self
    }

    pub fn then(mut self, pattern: ActionPattern) -> Self {
        self.then.push(pattern);
        self
    }

    pub fn where_clause(mut self, transform: impl Transform + 'static) -> Self {
        self.where_clause = Some(Arc::new(transform));
        self
    }

    /// Synchronous `where`: plain frame algebra, no queries that await.
    pub fn where_frames<F>(self, f: F) -> Self
    where
        F: Fn(Frames) -> Frames + Send + Sync + 'static,
    {
        self.where_clause(SyncTransform(f))
    }

    /// Asynchronous `where`, typically one that calls [`Frames::query`].
    pub fn where_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Frames) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Frames>> + Send + 'static,
    {
        self.where_clause(AsyncTransform(
            move |frames: Frames| -> BoxFuture<'static, Result<Frames>> { f(frames).boxed() },
        ))
    }
}

/// A registered sync: a named declaration.
pub struct Synchronization {
    pub name: String,
    pub when: Vec<ActionPattern>,
    pub where_clause: Option<Arc<dyn Transform>>,
    pub then: Vec<ActionPattern>,
}

impl fmt::Debug for Synchronization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronization")
            .field("name", &self.name)
            .field("when", &self.when)
            .field("where", &self.where_clause.is_some())
            .field("then", &self.then)
            .finish()
    }
}

type SyncFn = Box<dyn FnOnce(&Vars) -> SyncDeclaration + Send>;

/// Named sync declaration functions, registered in insertion order.
#[derive(Default)]
pub struct Syncs {
    entries: Vec<(String, SyncFn)>,
}

impl Syncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(mut self, name: impl Into<String>, declare: F) -> Self
    where
        F: FnOnce(&Vars) -> SyncDeclaration + Send + 'static,
    {
        self.entries.push((name.into(), Box::new(declare)));
        self
    }

    /// Merge `other` with every name qualified as `prefix.Name`.
    pub fn nest(mut self, prefix: &str, other: Syncs) -> Self {
        self.entries.extend(
            other
                .entries
                .into_iter()
                .map(|(name, declare)| (format!("{prefix}.{name}"), declare)),
        );
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    syncs: Vec<Arc<Synchronization>>,
    by_action: HashMap<u64, Vec<Arc<Synchronization>>>,
}

/// Identity-keyed instrumentation cache entry: one per concept instance.
struct Wrapped {
    // Keeps the concept alive so its address cannot be reused while cached.
    _concept: Arc<dyn Concept>,
    instrumented: Instrumented,
}

pub(crate) struct EngineShared {
    pub(crate) ledger: Ledger,
    config: EngineConfig,
    registry: RwLock<Registry>,
    wrapped: Mutex<HashMap<usize, Wrapped>>,
}

/// Sync registry and dispatcher. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_ledger(Ledger::new(), config)
    }

    pub fn with_ledger(ledger: Ledger, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                ledger,
                config,
                registry: RwLock::new(Registry::default()),
                wrapped: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.shared.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Wrap a concept's actions and bind its queries.
    ///
    /// Memoized by concept identity: instrumenting the same `Arc` twice
    /// returns the same wrapped actions, so rules built from either handle
    /// index the same identities.
    pub fn instrument<C: Concept>(&self, concept: Arc<C>) -> Result<Instrumented, SyncError> {
        let key = Arc::as_ptr(&concept) as *const () as usize;
        let mut wrapped = lock(&self.shared.wrapped);
        if let Some(existing) = wrapped.get(&key) {
            return Ok(existing.instrumented.clone());
        }

        let owner = OwnerRef::new(concept.name());
        let mut methods = Methods::default();
        concept.clone().methods(&mut methods);

        let mut instrumented = Instrumented {
            owner: owner.clone(),
            actions: Default::default(),
            queries: Default::default(),
        };
        for (name, method) in methods.entries {
            match method {
                Method::Query(f) if is_query_name(&name) => {
                    let query = Query::bound(&owner, &name, f);
                    instrumented.queries.insert(name, query);
                }
                Method::Action(f) if !is_query_name(&name) => {
                    let action_ref = ActionRef::new(&owner, &name);
                    let action = Action::new(action_ref, f, Arc::downgrade(&self.shared));
                    instrumented.actions.insert(name, action);
                }
                _ => {
                    return Err(SyncError::MethodNaming {
                        concept: owner.name().to_string(),
                        name,
                    })
                }
            }
        }

        debug!(
            concept = owner.name(),
            actions = instrumented.actions.len(),
            queries = instrumented.queries.len(),
            "Instrumented concept"
        );
        wrapped.insert(
            key,
            Wrapped {
                _concept: concept,
                instrumented: instrumented.clone(),
            },
        );
        Ok(instrumented)
    }

    /// Declare and index every sync in `syncs`.
    ///
    /// Each declaration function gets its own fresh [`Vars`]. A sync is
    /// indexed under every distinct action its `when` clauses reference.
    pub fn register(&self, syncs: Syncs) -> Result<(), SyncError> {
        let mut declared: Vec<Arc<Synchronization>> = Vec::with_capacity(syncs.len());
        for (name, declare) in syncs.entries {
            let declaration = declare(&Vars::new());
            let sync = Synchronization {
                name,
                when: declaration.when,
                where_clause: declaration.where_clause,
                then: declaration.then,
            };
            for pattern in sync.when.iter().chain(&sync.then) {
                if !pattern.action().belongs_to(&self.shared) {
                    return Err(SyncError::NotInstrumented(pattern.action_ref().to_string()));
                }
            }
            declared.push(Arc::new(sync));
        }

        let mut registry = self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut seen: HashSet<&str> = registry.syncs.iter().map(|s| s.name.as_str()).collect();
        for sync in &declared {
            if !seen.insert(sync.name.as_str()) {
                return Err(SyncError::DuplicateSync(sync.name.clone()));
            }
        }

        for sync in declared {
            let mut indexed = HashSet::new();
            for pattern in &sync.when {
                let action_id = pattern.action_ref().id();
                if indexed.insert(action_id) {
                    registry.by_action.entry(action_id).or_default().push(sync.clone());
                }
            }
            debug!(sync = sync.name.as_str(), "Registered sync");
            registry.syncs.push(sync);
        }
        Ok(())
    }

    /// Names of the syncs indexed under `action`, in registration order.
    pub fn syncs_for(&self, action: &Action) -> Vec<String> {
        self.shared
            .syncs_for(action.action_ref().id())
            .iter()
            .map(|sync| sync.name.clone())
            .collect()
    }

    /// Run every sync indexed under the record's action. Called automatically
    /// after each instrumented action completes; safe to call again, since
    /// already-synced records never re-fire.
    pub async fn synchronize(&self, record: &ActionRecord) -> Result<()> {
        self.shared.synchronize(record).await
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.shared.config)
            .field("records", &self.shared.ledger.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl EngineShared {
    fn syncs_for(&self, action_id: u64) -> Vec<Arc<Synchronization>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_action
            .get(&action_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn synchronize(&self, record: &ActionRecord) -> Result<()> {
        self.trace_record(record);

        let syncs = self.syncs_for(record.action.id());
        for sync in syncs {
            let (frames, markers) = self.match_when(record, &sync)?;
            if frames.is_empty() {
                continue;
            }
            self.log_frames(&sync.name, "matched when", &frames);

            let frames = match &sync.where_clause {
                Some(transform) => {
                    let frames = transform.apply(frames).await?;
                    self.log_frames(&sync.name, "after where", &frames);
                    frames
                }
                None => frames,
            };

            self.fire_then(frames, &sync, &markers).await?;
        }
        Ok(())
    }

    /// Join the sync's `when` clauses against the record's flow.
    ///
    /// Returns the surviving frames plus one private marker per clause; each
    /// frame binds every marker to the id of the record that satisfied it.
    fn match_when(&self, record: &ActionRecord, sync: &Synchronization) -> Result<(Frames, Vec<Var>), SyncError> {
        for pattern in &sync.when {
            if pattern.output_fields().is_none() {
                return Err(SyncError::MissingOutputPattern {
                    sync: sync.name.clone(),
                    action: pattern.action_ref().to_string(),
                });
            }
        }

        let candidates: Vec<ActionRecord> = self
            .ledger
            .by_flow(&record.flow)
            .into_iter()
            .filter(|candidate| candidate.is_complete() && !candidate.is_synced_by(&sync.name))
            .collect();

        let mut frames = vec![Frame::new().bind(flow_key(), record.flow.clone())];
        let mut markers = Vec::with_capacity(sync.when.len());

        for (i, pattern) in sync.when.iter().enumerate() {
            let marker = Var::fresh(&format!("action_{i}"));
            let mut next = Vec::new();
            for frame in &frames {
                for candidate in &candidates {
                    if let Some(matched) = match_record(candidate, pattern, frame, &marker) {
                        next.push(matched);
                    }
                }
            }
            frames = next;
            markers.push(marker);
        }

        let frames = Frames::from(frames).with_query_concurrency(self.config.query_concurrency);
        Ok((frames, markers))
    }

    /// Resolve every `then` for every frame, mark the evidence, then run the
    /// consequent actions one at a time.
    async fn fire_then(&self, frames: Frames, sync: &Synchronization, markers: &[Var]) -> Result<()> {
        let mut pending: Vec<(Action, Invocation)> = Vec::new();

        for frame in &frames {
            let mut evidence = Vec::with_capacity(markers.len());
            for marker in markers {
                let id = frame
                    .str(marker)
                    .ok_or_else(|| SyncError::MissingActionMarker(sync.name.clone()))?;
                evidence.push(id.to_string());
            }

            for pattern in &sync.then {
                let invocation = resolve_then(pattern, frame, &sync.name)?;
                let then_id = invocation
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| SyncError::MissingThenId(sync.name.clone()))?;
                for when_id in &evidence {
                    self.ledger
                        .mark_synced(when_id, &sync.name, &then_id)
                        .map_err(SyncError::from)?;
                }
                pending.push((pattern.action().clone(), invocation));
            }
        }

        for (action, invocation) in pending {
            if self.config.logging == Logging::Verbose {
                let input = Value::Object(invocation.input.clone());
                debug!(
                    sync = sync.name.as_str(),
                    then = %action.action_ref(),
                    input = %input,
                    "Firing then"
                );
            }
            action.invoke(invocation).await?;
        }
        Ok(())
    }

    fn trace_record(&self, record: &ActionRecord) {
        if self.config.logging == Logging::Off {
            return;
        }
        let input = Value::Object(record.input.clone());
        let output = record.output.clone().map(Value::Object).unwrap_or(Value::Null);
        match self.config.logging {
            Logging::Off => {}
            Logging::Trace => {
                info!("{} {} => {}", record.action, input, output);
            }
            Logging::Verbose => {
                info!(
                    action = %record.action,
                    id = record.id.as_str(),
                    flow = record.flow.as_str(),
                    input = %input,
                    output = %output,
                    "Synchronizing action"
                );
            }
        }
    }

    fn log_frames(&self, sync: &str, stage: &str, frames: &Frames) {
        if self.config.logging != Logging::Verbose || frames.is_empty() {
            return;
        }
        for frame in frames {
            let bindings: Vec<String> = frame.iter().map(|(var, value)| format!("{var:?}={value}")).collect();
            debug!(sync, stage, frame = %bindings.join(" "), "Frame");
        }
    }
}

/// Unify one record against one `when` pattern under `frame`.
fn match_record(record: &ActionRecord, pattern: &ActionPattern, frame: &Frame, marker: &Var) -> Option<Frame> {
    if record.action != *pattern.action_ref() || record.owner != *pattern.owner() {
        return None;
    }
    let output_fields = pattern.output_fields()?;
    let output = record.output.as_ref()?;

    let mut matched = frame.clone();
    if !pattern.input_fields().unify(&record.input, &mut matched) {
        return None;
    }
    if !output_fields.unify(output, &mut matched) {
        return None;
    }
    matched.insert(marker.clone(), Value::String(record.id.clone()));
    Some(matched)
}

/// Turn a `then` pattern into a concrete invocation in the frame's flow.
fn resolve_then(pattern: &ActionPattern, frame: &Frame, sync: &str) -> Result<Invocation, SyncError> {
    let context = format!("then {} of sync {sync}", pattern.action_ref());
    let input = pattern.input_fields().resolve(frame, &context)?;
    let flow = frame.str(pattern.flow()).ok_or_else(|| SyncError::UnboundVariable {
        var: format!("{:?}", pattern.flow()),
        context: context.clone(),
    })?;
    Ok(Invocation::new(input)
        .in_flow(flow)
        .with_id(Uuid::new_v4().to_string()))
}
