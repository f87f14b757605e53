//! Hash-consing of label set derivations.
//!
//! Deriving `{parent + key=value}` twice from the same parent yields the same
//! node when both derivations go through one [`Interner`]. Entries hold weak
//! references, so the cache never keeps a set alive on its own; dead entries
//! are pruned once the cache passes a high-water mark.

use std::collections::HashMap;
use std::sync::Arc;

use crate::labelset::{LabelSet, WeakLabelSet};
use crate::value::{Binding, LabelValue, Lookup, Override};

const MIN_HIGH_WATER: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum BindingKey {
    Str(Arc<str>),
    Bool(bool),
    Num(u64),
    Absent,
}

impl From<&Binding> for BindingKey {
    fn from(binding: &Binding) -> Self {
        match binding {
            Binding::Value(LabelValue::Str(s)) => Self::Str(Arc::clone(s)),
            Binding::Value(LabelValue::Bool(b)) => Self::Bool(*b),
            Binding::Value(LabelValue::Num(n)) => Self::Num(n.to_bits()),
            Binding::Absent => Self::Absent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DerivationKey {
    parent: u64,
    key: Arc<str>,
    binding: BindingKey,
}

/// Weak cache of derivations keyed by `(parent identity, key, binding)`.
#[derive(Debug)]
pub struct Interner {
    sets: HashMap<DerivationKey, WeakLabelSet>,
    high_water: usize,
    hits: u64,
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Interner {
    /// Create an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
            high_water: MIN_HIGH_WATER,
            hits: 0,
        }
    }

    /// Number of cached derivations, live or dead.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether the cache holds no derivations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// How many derivations were answered from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Interned equivalent of [`LabelSet::set`].
    pub fn set<K, V>(&mut self, base: &LabelSet, key: K, value: V) -> LabelSet
    where
        K: AsRef<str> + Into<Arc<str>>,
        V: Into<LabelValue>,
    {
        let value = value.into();
        if matches!(base.get(key.as_ref()), Lookup::Value(v) if *v == value) {
            return base.clone();
        }
        self.derive(base, key.into(), Binding::Value(value))
    }

    /// Interned equivalent of [`LabelSet::delete`].
    pub fn delete<K>(&mut self, base: &LabelSet, key: K) -> LabelSet
    where
        K: AsRef<str> + Into<Arc<str>>,
    {
        if matches!(base.get(key.as_ref()), Lookup::Absent) {
            return base.clone();
        }
        self.derive(base, key.into(), Binding::Absent)
    }

    /// Interned equivalent of [`LabelSet::apply`].
    pub fn apply<I, K>(&mut self, base: &LabelSet, overrides: I) -> LabelSet
    where
        I: IntoIterator<Item = (K, Override)>,
        K: AsRef<str> + Into<Arc<str>>,
    {
        overrides
            .into_iter()
            .fold(base.clone(), |acc, (key, op)| match op {
                Override::Set(value) => self.set(&acc, key, value),
                Override::Delete => self.delete(&acc, key),
            })
    }

    fn derive(&mut self, parent: &LabelSet, key: Arc<str>, binding: Binding) -> LabelSet {
        let lookup = DerivationKey {
            parent: parent.addr(),
            key,
            binding: BindingKey::from(&binding),
        };
        if let Some(existing) = self.sets.get(&lookup).and_then(WeakLabelSet::upgrade) {
            // A live cached node keeps its parent alive, so its parent
            // address cannot have been reused; check anyway.
            let same = existing.head().is_some_and(|(k, b, p)| {
                p.ptr_eq(parent) && *k == lookup.key && b.same_content(&binding)
            });
            if same {
                self.hits += 1;
                return existing;
            }
        }
        let derived = LabelSet::bind(parent, Arc::clone(&lookup.key), binding);
        let _ = self.sets.insert(lookup, derived.downgrade());
        if self.sets.len() > self.high_water {
            self.prune();
        }
        derived
    }

    /// Drop entries whose sets are gone.
    pub fn prune(&mut self) {
        self.sets.retain(|_, weak| weak.is_alive());
        self.high_water = MIN_HIGH_WATER.max(self.sets.len() * 2);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
