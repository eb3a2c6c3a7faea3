//! Binding keys.
//!
//! A [`Var`] is an opaque, process-unique token naming a logical variable in
//! a sync declaration. Identity comes from a global counter; the label is
//! only for display, so two vars labelled `count` never collide.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

static NEXT_VAR: AtomicU64 = AtomicU64::new(1);

static FLOW: LazyLock<Var> = LazyLock::new(|| Var::fresh("flow"));

/// The reserved binding key every matched frame binds to its flow token.
pub fn flow_key() -> &'static Var {
    &FLOW
}

#[derive(Clone)]
pub struct Var {
    id: u64,
    label: Arc<str>,
}

impl Var {
    pub(crate) fn fresh(label: &str) -> Self {
        Self {
            id: NEXT_VAR.fetch_add(1, Ordering::Relaxed),
            label: Arc::from(label),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Var {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Var {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}#{}", self.label, self.id)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Token factory handed to each sync declaration.
///
/// Every call mints a new [`Var`]; asking twice for the same name yields two
/// distinct keys.
#[derive(Debug, Default)]
pub struct Vars {
    minted: AtomicUsize,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(&self, label: &str) -> Var {
        self.minted.fetch_add(1, Ordering::Relaxed);
        Var::fresh(label)
    }

    /// Mint several keys at once: `let [value, tag] = vars.vars(["value", "tag"]);`
    pub fn vars<const N: usize>(&self, labels: [&str; N]) -> [Var; N] {
        labels.map(|label| self.var(label))
    }

    /// How many keys this factory has handed out.
    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_label_yields_distinct_keys() {
        let vars = Vars::new();
        let a = vars.var("count");
        let b = vars.var("count");
        assert_ne!(a, b);
        assert_eq!(a.label(), b.label());
        assert_eq!(vars.minted(), 2);
    }

    #[test]
    fn separate_factories_never_share_keys() {
        let [x] = Vars::new().vars(["x"]);
        let [y] = Vars::new().vars(["x"]);
        assert_ne!(x, y);
    }

    #[test]
    fn flow_key_is_stable() {
        assert_eq!(flow_key(), flow_key());
        assert_eq!(flow_key().label(), "flow");
    }
}
