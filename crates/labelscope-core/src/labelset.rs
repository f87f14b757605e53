//! Persistent label sets.
//!
//! A [`LabelSet`] is either the empty set or a node that records one key's
//! [`Binding`] plus an owning reference to the set it was derived from.
//! Nodes are reference-counted and never mutated after construction, so a
//! set can be shared freely between contexts and threads, and every
//! "modification" is a new node pointing at the old chain.
//!
//! # Reader ABI
//!
//! Every node starts with a [`RawNode`] prefix (`#[repr(C)]`) that describes
//! the node using plain addresses. An out-of-process reader that knows the
//! address of a chain head can walk the chain by following
//! [`RawNode::parent`] without understanding any Rust layout. The prefix is
//! filled in before the node is shared, and nothing about a node changes
//! afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::value::{Binding, LabelValue, Lookup, Override};

// ─────────────────────────────────────────────────────────────────────────────
// Reader-visible layout
// ─────────────────────────────────────────────────────────────────────────────

/// How [`RawNode::value_word`] and [`RawNode::value_len`] are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueTag {
    /// `value_word` is the address of `value_len` UTF-8 bytes.
    Str = 1,
    /// `value_word` is `0` or `1`.
    Bool = 2,
    /// `value_word` is the bit pattern of an `f64`.
    Num = 3,
    /// The key is explicitly absent; both value fields are zero.
    Absent = 4,
}

impl ValueTag {
    /// Parse a raw tag.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Str),
            2 => Some(Self::Bool),
            3 => Some(Self::Num),
            4 => Some(Self::Absent),
            _ => None,
        }
    }
}

/// Reader-visible prefix of every chain node.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawNode {
    /// Address of the key's UTF-8 bytes.
    pub key_ptr: u64,
    /// Key length in bytes.
    pub key_len: u64,
    /// A [`ValueTag`] discriminant.
    pub tag: u32,
    /// Always zero.
    pub reserved: u32,
    /// Tag-dependent payload.
    pub value_word: u64,
    /// Byte length for string values, otherwise zero.
    pub value_len: u64,
    /// Address of the parent node, or zero for the empty set.
    pub parent: u64,
}

impl RawNode {
    /// Size of the prefix in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Decode a prefix from native-endian bytes.
    #[must_use]
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let word = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[off..off + 8]);
            u64::from_ne_bytes(b)
        };
        let half = |off: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[off..off + 4]);
            u32::from_ne_bytes(b)
        };
        Self {
            key_ptr: word(0),
            key_len: word(8),
            tag: half(16),
            reserved: half(20),
            value_word: word(24),
            value_len: word(32),
            parent: word(40),
        }
    }
}

fn address_of<T: ?Sized>(ptr: *const T) -> u64 {
    ptr.cast::<u8>().addr() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

#[repr(C)]
struct Node {
    // Must stay the first field: the node's address is the prefix's address.
    raw: RawNode,
    key: Arc<str>,
    binding: Binding,
    parent: LabelSet,
    depth: usize,
}

impl Drop for Node {
    // Unlink iteratively so that dropping a long uniquely-owned chain does
    // not recurse once per node.
    fn drop(&mut self) {
        let mut next = self.parent.0.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut owned) => next = owned.parent.0.take(),
                Err(_) => break,
            }
        }
    }
}

/// One effective label of a materialized set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Label {
    /// Label key.
    pub key: Arc<str>,
    /// Label value.
    pub value: LabelValue,
}

/// Immutable, structurally shared key/value mapping.
///
/// Cloning is a reference-count bump. Equality compares effective content
/// (the materialized mapping), not chain identity; use
/// [`LabelSet::ptr_eq`] for identity.
#[derive(Clone, Default)]
pub struct LabelSet(Option<Arc<Node>>);

impl LabelSet {
    /// The canonical empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(None)
    }

    /// Derive a node from `parent` without any no-op or dedup checks.
    pub(crate) fn bind(parent: &Self, key: Arc<str>, binding: Binding) -> Self {
        let (tag, value_word, value_len) = match &binding {
            Binding::Value(LabelValue::Str(s)) => {
                (ValueTag::Str, address_of(s.as_ptr()), s.len() as u64)
            }
            Binding::Value(LabelValue::Bool(b)) => (ValueTag::Bool, u64::from(*b), 0),
            Binding::Value(LabelValue::Num(n)) => (ValueTag::Num, n.to_bits(), 0),
            Binding::Absent => (ValueTag::Absent, 0, 0),
        };
        let raw = RawNode {
            key_ptr: address_of(key.as_ptr()),
            key_len: key.len() as u64,
            tag: tag as u32,
            reserved: 0,
            value_word,
            value_len,
            parent: parent.addr(),
        };
        Self(Some(Arc::new(Node {
            raw,
            key,
            binding,
            parent: parent.clone(),
            depth: parent.depth() + 1,
        })))
    }

    /// Address of the chain head as seen by an external reader (zero for
    /// the empty set).
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.0.as_ref().map_or(0, |node| address_of(Arc::as_ptr(node)))
    }

    /// Number of nodes in the chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.as_ref().map_or(0, |node| node.depth)
    }

    /// Whether the set has no effective labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_none() || self.materialize().is_empty()
    }

    /// Number of effective labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.materialize().len()
    }

    /// Whether both handles refer to the same chain head.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The binding recorded by the chain head.
    pub(crate) fn head(&self) -> Option<(&Arc<str>, &Binding, &Self)> {
        self.0
            .as_deref()
            .map(|node| (&node.key, &node.binding, &node.parent))
    }

    pub(crate) fn downgrade(&self) -> WeakLabelSet {
        WeakLabelSet(self.0.as_ref().map(Arc::downgrade))
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(self.0.as_deref(), |node| node.parent.0.as_deref())
    }

    /// Resolve `key`, walking from the head toward the empty set.
    ///
    /// The first node mentioning the key decides: an absent marker stops the
    /// walk and does not fall through to an ancestor's binding.
    #[must_use]
    pub fn get(&self, key: &str) -> Lookup<'_> {
        for node in self.nodes() {
            if &*node.key == key {
                return match &node.binding {
                    Binding::Value(v) => Lookup::Value(v),
                    Binding::Absent => Lookup::Absent,
                };
            }
        }
        Lookup::Unset
    }

    /// Derive a set with `key` bound to `value`. Returns `self` unchanged when
    /// the key already resolves to an equal value.
    #[must_use]
    pub fn set<K, V>(&self, key: K, value: V) -> Self
    where
        K: AsRef<str> + Into<Arc<str>>,
        V: Into<LabelValue>,
    {
        let value = value.into();
        if matches!(self.get(key.as_ref()), Lookup::Value(v) if *v == value) {
            return self.clone();
        }
        Self::bind(self, key.into(), Binding::Value(value))
    }

    /// Derive a set in which `key` resolves to absent. Returns `self`
    /// unchanged when the key is already absent.
    #[must_use]
    pub fn delete<K>(&self, key: K) -> Self
    where
        K: AsRef<str> + Into<Arc<str>>,
    {
        if matches!(self.get(key.as_ref()), Lookup::Absent) {
            return self.clone();
        }
        Self::bind(self, key.into(), Binding::Absent)
    }

    /// Apply an ordered override sequence.
    #[must_use]
    pub fn apply<I, K>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, Override)>,
        K: AsRef<str> + Into<Arc<str>>,
    {
        overrides
            .into_iter()
            .fold(self.clone(), |acc, (key, op)| match op {
                Override::Set(value) => acc.set(key, value),
                Override::Delete => acc.delete(key),
            })
    }

    fn resolved(&self) -> BTreeMap<&Arc<str>, &Binding> {
        let mut out = BTreeMap::new();
        for node in self.nodes() {
            let _ = out.entry(&node.key).or_insert(&node.binding);
        }
        out
    }

    /// The effective mapping as a key-ordered list, excluding absent keys.
    ///
    /// Every call walks the chain afresh, so the result can be recomputed at
    /// any time and always agrees with [`LabelSet::get`].
    #[must_use]
    pub fn materialize(&self) -> Vec<Label> {
        self.resolved()
            .into_iter()
            .filter_map(|(key, binding)| match binding {
                Binding::Value(value) => Some(Label {
                    key: Arc::clone(key),
                    value: value.clone(),
                }),
                Binding::Absent => None,
            })
            .collect()
    }

    /// Rebuild the chain with exactly one node per resolved key.
    ///
    /// Absent markers are kept so that [`LabelSet::get`] answers are
    /// unchanged.
    #[must_use]
    pub fn compact(&self) -> Self {
        let resolved = self.resolved();
        if resolved.len() == self.depth() {
            return self.clone();
        }
        resolved
            .into_iter()
            .fold(Self::empty(), |acc, (key, binding)| {
                Self::bind(&acc, Arc::clone(key), binding.clone())
            })
    }
}

/// Non-owning handle to a label set, used by the interner.
#[derive(Clone, Debug)]
pub(crate) struct WeakLabelSet(Option<Weak<Node>>);

impl WeakLabelSet {
    pub(crate) fn upgrade(&self) -> Option<LabelSet> {
        match &self.0 {
            None => Some(LabelSet::empty()),
            Some(weak) => weak.upgrade().map(|node| LabelSet(Some(node))),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.as_ref().is_none_or(|weak| weak.strong_count() > 0)
    }
}

impl PartialEq for LabelSet {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.materialize() == other.materialize()
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: AsRef<str> + Into<Arc<str>>,
    V: Into<LabelValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |acc, (k, v)| acc.set(k, v))
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.materialize().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", label.key, label.value)?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LabelSet{self}")
    }
}

impl Serialize for LabelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let labels = self.materialize();
        let mut map = serializer.serialize_map(Some(labels.len()))?;
        for label in &labels {
            map.serialize_entry(&*label.key, &label.value)?;
        }
        map.end()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn empty_is_canonical() {
        let a = LabelSet::empty();
        let b = LabelSet::default();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.addr(), 0);
        assert_eq!(a.depth(), 0);
        assert!(a.is_empty());
        assert_eq!(a.get("x"), Lookup::Unset);
    }

    #[test]
    fn set_then_get() {
        let ls = LabelSet::empty().set("a", "1");
        assert_eq!(ls.get("a").value(), Some(&LabelValue::from("1")));
        assert_eq!(ls.get("b"), Lookup::Unset);
        assert_eq!(ls.len(), 1);
    }

    #[test]
    fn set_equal_value_is_noop() {
        let ls = LabelSet::empty().set("a", "1");
        let again = ls.set("a", "1");
        assert!(again.ptr_eq(&ls));
        let changed = ls.set("a", "2");
        assert!(!changed.ptr_eq(&ls));
        assert_eq!(changed.depth(), 2);
    }

    #[test]
    fn parent_is_untouched_by_derivation() {
        let base = LabelSet::empty().set("a", "1");
        let child = base.set("a", "2").set("b", true);
        assert_eq!(base.get("a").value(), Some(&LabelValue::from("1")));
        assert_eq!(base.get("b"), Lookup::Unset);
        assert_eq!(child.get("a").value(), Some(&LabelValue::from("2")));
    }

    #[test]
    fn absent_short_circuits() {
        let ls = LabelSet::empty().set("a", "1").delete("a");
        assert_matches!(ls.get("a"), Lookup::Absent);
        assert!(ls.is_empty());
        assert!(ls.materialize().is_empty());
    }

    #[test]
    fn absent_and_unset_are_distinct() {
        let ls = LabelSet::empty().delete("a");
        assert_matches!(ls.get("a"), Lookup::Absent);
        assert_matches!(ls.get("b"), Lookup::Unset);
    }

    #[test]
    fn delete_of_absent_is_noop() {
        let ls = LabelSet::empty().set("a", "1").delete("a");
        assert!(ls.delete("a").ptr_eq(&ls));
    }

    #[test]
    fn set_after_delete_rebinds() {
        let ls = LabelSet::empty().set("a", "1").delete("a").set("a", "3");
        assert_eq!(ls.get("a").value(), Some(&LabelValue::from("3")));
    }

    #[test]
    fn apply_in_order() {
        let ls = LabelSet::empty().apply([
            ("a", Override::from("1")),
            ("b", Override::from(2)),
            ("a", Override::from("3")),
            ("b", Override::Delete),
        ]);
        assert_eq!(ls.to_string(), r#"{a="3"}"#);
    }

    #[test]
    fn materialize_is_key_ordered_and_restartable() {
        let ls: LabelSet = [("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();
        let first = ls.materialize();
        let second = ls.materialize();
        assert_eq!(first, second);
        let keys: Vec<&str> = first.iter().map(|l| &*l.key).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn display_and_serialize() {
        let ls = LabelSet::empty().set("user", "marta").set("n", 3).set("ok", true);
        insta::assert_snapshot!(ls.to_string(), @r#"{n=3, ok=true, user="marta"}"#);
        assert_eq!(
            serde_json::to_value(&ls).unwrap(),
            serde_json::json!({"n": 3.0, "ok": true, "user": "marta"})
        );
        assert_eq!(LabelSet::empty().to_string(), "{}");
    }

    #[test]
    fn content_equality_ignores_chain_shape() {
        let a = LabelSet::empty().set("a", "1").set("b", "2");
        let b = LabelSet::empty().set("b", "2").set("a", "0").set("a", "1");
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn compact_preserves_lookups() {
        let ls = LabelSet::empty()
            .set("a", "1")
            .set("a", "2")
            .set("b", "x")
            .delete("b")
            .set("c", false);
        let compacted = ls.compact();
        assert_eq!(compacted.depth(), 3);
        for key in ["a", "b", "c", "d"] {
            assert_eq!(compacted.get(key), ls.get(key));
        }
        assert!(compacted.compact().ptr_eq(&compacted));
    }

    #[test]
    fn raw_prefix_describes_node() {
        let base = LabelSet::empty().set("k", "value");
        let ls = base.set("flag", true);
        let node = ls.0.as_ref().unwrap();
        assert_eq!(node.raw.key_len, 4);
        assert_eq!(node.raw.tag, ValueTag::Bool as u32);
        assert_eq!(node.raw.value_word, 1);
        assert_eq!(node.raw.parent, base.addr());
        assert_eq!(ls.addr(), address_of(std::ptr::from_ref(&node.raw)));

        let base_node = base.0.as_ref().unwrap();
        assert_eq!(base_node.raw.tag, ValueTag::Str as u32);
        assert_eq!(base_node.raw.value_len, 5);
        assert_eq!(base_node.raw.parent, 0);
    }

    #[test]
    fn raw_node_layout() {
        assert_eq!(RawNode::SIZE, 48);
        let raw = RawNode {
            key_ptr: 1,
            key_len: 2,
            tag: 3,
            reserved: 0,
            value_word: 4,
            value_len: 5,
            parent: 6,
        };
        let mut buf = [0u8; RawNode::SIZE];
        for (i, w) in [1u64, 2].iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&w.to_ne_bytes());
        }
        buf[16..20].copy_from_slice(&3u32.to_ne_bytes());
        buf[24..32].copy_from_slice(&4u64.to_ne_bytes());
        buf[32..40].copy_from_slice(&5u64.to_ne_bytes());
        buf[40..48].copy_from_slice(&6u64.to_ne_bytes());
        assert_eq!(RawNode::from_bytes(&buf), raw);
    }

    #[test]
    fn long_chain_drops_without_recursion() {
        let mut ls = LabelSet::empty();
        for i in 0..200_000u32 {
            ls = LabelSet::bind(&ls, Arc::from("k"), Binding::Value(LabelValue::from(i)));
        }
        assert_eq!(ls.depth(), 200_000);
        drop(ls);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn op() -> impl Strategy<Value = (String, Option<u8>)> {
            ("[a-d]", proptest::option::of(0u8..4))
        }

        proptest! {
            #[test]
            fn get_matches_last_write(ops in proptest::collection::vec(op(), 0..40)) {
                let ls = ops.iter().fold(LabelSet::empty(), |acc, (k, v)| match v {
                    Some(v) => acc.set(k.as_str(), u32::from(*v)),
                    None => acc.delete(k.as_str()),
                });
                for key in ["a", "b", "c", "d"] {
                    let last = ops.iter().rev().find(|(k, _)| k == key);
                    let expected = match last {
                        None => Lookup::Unset,
                        Some((_, None)) => Lookup::Absent,
                        Some((_, Some(v))) => {
                            let got = ls.get(key);
                            prop_assert_eq!(got.value(), Some(&LabelValue::from(u32::from(*v))));
                            continue;
                        }
                    };
                    prop_assert_eq!(ls.get(key), expected);
                }
                let compacted = ls.compact();
                for key in ["a", "b", "c", "d"] {
                    prop_assert_eq!(compacted.get(key), ls.get(key));
                }
                prop_assert!(compacted.depth() <= 4);
            }
        }
    }
}
