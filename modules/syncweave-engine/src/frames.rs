//! Frame algebra.
//!
//! A [`Frame`] is one variable-binding environment; [`Frames`] is an ordered
//! set of them. Every operator consumes a `Frames` and returns a `Frames`, so
//! `where` clauses compose arbitrarily long chains of `map`, `filter`,
//! `flat_map`, `query` and `collect_as`.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use syncweave_ledger::Mapping;

use crate::concept::Query;
use crate::pattern::Fields;
use crate::vars::Var;

/// Default number of per-frame query calls allowed in flight at once.
pub const DEFAULT_QUERY_CONCURRENCY: usize = 16;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    bindings: BTreeMap<Var, Value>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, var: &Var) -> Option<&Value> {
        self.bindings.get(var)
    }

    /// String value bound to `var`, if it is bound to a string.
    pub fn str(&self, var: &Var) -> Option<&str> {
        self.get(var).and_then(Value::as_str)
    }

    pub fn contains(&self, var: &Var) -> bool {
        self.bindings.contains_key(var)
    }

    /// Builder-style bind, overwriting any previous value.
    pub fn bind(mut self, var: &Var, value: impl Into<Value>) -> Self {
        self.bindings.insert(var.clone(), value.into());
        self
    }

    pub fn insert(&mut self, var: Var, value: Value) -> Option<Value> {
        self.bindings.insert(var, value)
    }

    pub fn remove(&mut self, var: &Var) -> Option<Value> {
        self.bindings.remove(var)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Value)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Frames {
    frames: Vec<Frame>,
    query_concurrency: usize,
}

impl Default for Frames {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            query_concurrency: DEFAULT_QUERY_CONCURRENCY,
        }
    }
}

impl PartialEq for Frames {
    fn eq(&self, other: &Self) -> bool {
        self.frames == other.frames
    }
}

impl Frames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of concurrent calls [`Frames::query`] issues.
    pub fn with_query_concurrency(mut self, limit: usize) -> Self {
        self.query_concurrency = limit.max(1);
        self
    }

    pub fn query_concurrency(&self) -> usize {
        self.query_concurrency
    }

    fn rewrap(&self, frames: Vec<Frame>) -> Frames {
        Frames {
            frames,
            query_concurrency: self.query_concurrency,
        }
    }

    fn take(self) -> (Vec<Frame>, Frames) {
        let empty = self.rewrap(Vec::new());
        (self.frames, empty)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    pub fn first(&self) -> Option<&Frame> {
        self.frames.first()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn into_vec(self) -> Vec<Frame> {
        self.frames
    }

    pub fn map(self, f: impl FnMut(Frame) -> Frame) -> Frames {
        let (frames, mut out) = self.take();
        out.frames = frames.into_iter().map(f).collect();
        out
    }

    pub fn filter(self, mut predicate: impl FnMut(&Frame) -> bool) -> Frames {
        let (frames, mut out) = self.take();
        out.frames = frames.into_iter().filter(|frame| predicate(frame)).collect();
        out
    }

    pub fn flat_map<I>(self, f: impl FnMut(Frame) -> I) -> Frames
    where
        I: IntoIterator<Item = Frame>,
    {
        let (frames, mut out) = self.take();
        out.frames = frames.into_iter().flat_map(f).collect();
        out
    }

    /// Dependent join against a query.
    ///
    /// For every frame, resolve `input` against it, call `query`, and emit
    /// one extended frame per result tuple, binding each `(field, var)` of
    /// `output` to that field of the tuple. Fields missing from a tuple stay
    /// unbound. Calls run concurrently up to the configured limit; output is
    /// ordered by input frame, then by result order.
    pub async fn query(self, query: &Query, input: Fields, output: &[(&str, &Var)]) -> Result<Frames> {
        let context = format!("query {}", query.name());
        let inputs = self
            .frames
            .iter()
            .map(|frame| input.resolve(frame, &context))
            .collect::<Result<Vec<Mapping>, _>>()?;

        let results: Vec<Vec<Mapping>> = stream::iter(inputs.into_iter().map(|args| query.call(args)))
            .buffered(self.query_concurrency)
            .try_collect()
            .await?;

        Ok(self.extend_with(results, output))
    }

    /// Like [`Frames::query`], but awaits each frame's call before issuing
    /// the next one.
    pub async fn query_sequential(
        self,
        query: &Query,
        input: Fields,
        output: &[(&str, &Var)],
    ) -> Result<Frames> {
        let context = format!("query {}", query.name());
        let mut results = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            let args = input.resolve(frame, &context)?;
            results.push(query.call(args).await?);
        }
        Ok(self.extend_with(results, output))
    }

    fn extend_with(&self, results: Vec<Vec<Mapping>>, output: &[(&str, &Var)]) -> Frames {
        let mut extended = Vec::new();
        for (frame, tuples) in self.frames.iter().zip(results) {
            for tuple in tuples {
                let mut next = frame.clone();
                for (field, var) in output {
                    if let Some(value) = tuple.get(*field) {
                        next.insert((*var).clone(), value.clone());
                    }
                }
                extended.push(next);
            }
        }
        self.rewrap(extended)
    }

    /// Group-by aggregation.
    ///
    /// Frames are grouped by their bindings outside `collect`. Each group
    /// becomes one frame: the shared bindings plus `as_key` bound to an array
    /// of `{label: value}` objects, one per grouped frame, built from the
    /// collected keys. Groups keep first-seen order.
    pub fn collect_as(self, collect: &[Var], as_key: &Var) -> Frames {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Frame, Vec<Value>)> = Vec::new();

        for frame in &self.frames {
            let mut shared = Frame::new();
            let mut collected = Mapping::new();
            for (var, value) in frame.iter() {
                if collect.contains(var) {
                    collected.insert(var.label().to_string(), value.clone());
                } else {
                    shared.insert(var.clone(), value.clone());
                }
            }

            let key = group_key(&shared);
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((shared, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(Value::Object(collected));
        }

        let grouped = groups
            .into_iter()
            .map(|(shared, items)| shared.bind(as_key, Value::Array(items)))
            .collect();
        self.rewrap(grouped)
    }
}

/// Serialized form of a sub-frame, used as the grouping key.
fn group_key(frame: &Frame) -> String {
    let entries: Vec<(u64, &Value)> = frame.iter().map(|(var, value)| (var.id(), value)).collect();
    serde_json::to_string(&entries).unwrap_or_default()
}

impl From<Vec<Frame>> for Frames {
    fn from(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }
}

impl FromIterator<Frame> for Frames {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl Extend<Frame> for Frames {
    fn extend<I: IntoIterator<Item = Frame>>(&mut self, iter: I) {
        self.frames.extend(iter);
    }
}

impl IntoIterator for Frames {
    type Item = Frame;
    type IntoIter = std::vec::IntoIter<Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl<'a> IntoIterator for &'a Frames {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}
