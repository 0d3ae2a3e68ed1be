//! The working state of one match run: the transactional pattern-to-host
//! binding map, the per-run tag caches, and the current value-iterator
//! bindings.

use crate::model::{AttrValue, ModelGraph, Name, NodeId};
use derive_more::From;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write;

/// Handle for a collapsed multi-hop path materialized during a search. Paths
/// are search-local; their values live in the matcher's path arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct PathId(pub u32);

/// One side of a binding: a graph node or a collapsed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub enum MatchKey {
    Node(NodeId),
    Path(PathId),
}

impl MatchKey {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            MatchKey::Node(id) => Some(*id),
            MatchKey::Path(_) => None,
        }
    }
}

/// A saved size of the binding map; rolling back to it undoes every insertion
/// made since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(usize);

/// An insertion-ordered, injective, bidirectional map from pattern elements
/// to host elements.
///
/// Every binding made during the search is speculative until the recursive
/// continuation succeeds, so the map supports truncating back to a previously
/// recorded size ([`MatchResult::retain`]); this restores both directions to
/// exactly the state after the first `n` insertions.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    entries: Vec<(MatchKey, MatchKey)>,
    forward: HashMap<MatchKey, MatchKey>,
    reverse: HashMap<MatchKey, MatchKey>,
}

impl MatchResult {
    pub fn new() -> Self {
        MatchResult::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds a pattern element to a host element. Both must be unbound;
    /// binding an already-bound element is an internal error.
    pub fn put(&mut self, pattern: impl Into<MatchKey>, host: impl Into<MatchKey>) {
        let pattern = pattern.into();
        let host = host.into();
        if self.forward.contains_key(&pattern) || self.reverse.contains_key(&host) {
            panic!("cannot bind {pattern:?} -> {host:?}: an element is already bound");
        }
        self.forward.insert(pattern, host);
        self.reverse.insert(host, pattern);
        self.entries.push((pattern, host));
    }

    pub fn get(&self, pattern: impl Into<MatchKey>) -> Option<MatchKey> {
        self.forward.get(&pattern.into()).copied()
    }

    /// Reverse lookup: the pattern element a host element is bound to.
    pub fn get_key(&self, host: impl Into<MatchKey>) -> Option<MatchKey> {
        self.reverse.get(&host.into()).copied()
    }

    /// Forward lookup restricted to node-to-node bindings.
    pub fn get_node(&self, pattern: NodeId) -> Option<NodeId> {
        self.get(pattern).and_then(|key| key.as_node())
    }

    pub fn contains_key(&self, pattern: impl Into<MatchKey>) -> bool {
        self.forward.contains_key(&pattern.into())
    }

    pub fn contains_value(&self, host: impl Into<MatchKey>) -> bool {
        self.reverse.contains_key(&host.into())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.entries.len())
    }

    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        self.retain(checkpoint.0);
    }

    /// Truncates the map back to its first `n` insertions.
    pub fn retain(&mut self, n: usize) {
        debug_assert!(n <= self.entries.len(), "rollback past a live checkpoint");
        while self.entries.len() > n {
            let (pattern, host) = self.entries.pop().expect("len > n >= 0");
            self.forward.remove(&pattern);
            self.reverse.remove(&host);
        }
    }

    /// Bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (MatchKey, MatchKey)> + '_ {
        self.entries.iter().copied()
    }

    /// Node-to-node bindings in insertion order.
    pub fn node_bindings(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.entries.iter().filter_map(|(pattern, host)| {
            Some((pattern.as_node()?, host.as_node()?))
        })
    }

    /// Stable, name-sorted rendering of the node bindings.
    pub fn display(&self, pattern: &ModelGraph, host: &ModelGraph) -> String {
        let mut lines: Vec<(String, String)> = self
            .node_bindings()
            .map(|(p, h)| (pattern.full_name(p), host.full_name(h)))
            .collect();
        lines.sort();
        let mut out = String::new();
        for (p, h) in lines {
            let _ = writeln!(out, "{p} : {h}");
        }
        out
    }
}

///////////////////////////////////////////////////////////////////
// tag caches

type CacheLine = RefCell<Vec<(u64, bool)>>;

/// Per-run memo of derived tag predicates, keyed by node index. The
/// predicates are interdependent (an optional container changes the ignored
/// status of its descendants), so they are only ever invalidated together:
/// one generation bump clears every cache.
#[derive(Debug, Default)]
struct TagCaches {
    generation: u64,
    static_skip: CacheLine,
    negated: CacheLine,
}

impl TagCaches {
    fn clear_all(&mut self) {
        self.generation += 1;
    }

    fn lookup(&self, line: &CacheLine, node: NodeId, compute: impl FnOnce() -> bool) -> bool {
        let index = node.0 as usize;
        {
            let line = line.borrow();
            if let Some(&(generation, value)) = line.get(index)
                && generation == self.generation
            {
                return value;
            }
        }
        let value = compute();
        let mut line = line.borrow_mut();
        if line.len() <= index {
            line.resize(index + 1, (0, false));
        }
        line[index] = (self.generation, value);
        value
    }
}

/// The full working state of one top-level match invocation.
#[derive(Debug, Default)]
pub struct MatchState {
    map: MatchResult,
    params: HashMap<Name, AttrValue>,
    caches: TagCaches,
    /// Optional containers degraded to absent in the current branch, in
    /// degradation order.
    degraded: Vec<NodeId>,
}

impl MatchState {
    pub fn new() -> Self {
        MatchState::default()
    }

    /// Clears the bindings and all caches (one generation bump); parameter
    /// bindings survive, they belong to the enclosing enumeration.
    pub fn reset(&mut self) {
        self.map = MatchResult::new();
        self.caches.clear_all();
        self.degraded.clear();
    }

    pub fn map(&self) -> &MatchResult {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut MatchResult {
        &mut self.map
    }

    /// Clones the current bindings into an immutable result.
    pub fn snapshot(&self) -> MatchResult {
        self.map.clone()
    }

    ///////////////////////////////////////////////////////////////////
    // value-iterator bindings

    pub fn bind_param(&mut self, name: Name, value: AttrValue) {
        self.params.insert(name, value);
    }

    pub fn params(&self) -> &HashMap<Name, AttrValue> {
        &self.params
    }

    /// Restores the pre-run state of all enumerated parameters.
    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    ///////////////////////////////////////////////////////////////////
    // derived tag predicates

    /// Whether the node, or an ancestor, is tagged Ignored or Created.
    /// Created nodes exist only for the transformer; neither participates in
    /// structural matching.
    pub fn is_statically_skipped(&self, g: &ModelGraph, node: NodeId) -> bool {
        self.caches.lookup(&self.caches.static_skip, node, || {
            let tags = &g.node(node).tags;
            if tags.ignored || tags.created {
                return true;
            }
            match g.parent(node) {
                Some(parent) => self.is_statically_skipped(g, parent),
                None => false,
            }
        })
    }

    /// Whether the node, or an ancestor, is tagged Negated.
    pub fn is_negated(&self, g: &ModelGraph, node: NodeId) -> bool {
        self.caches.lookup(&self.caches.negated, node, || {
            if g.node(node).tags.negated {
                return true;
            }
            match g.parent(node) {
                Some(parent) => self.is_negated(g, parent),
                None => false,
            }
        })
    }

    ///////////////////////////////////////////////////////////////////
    // optional degradation

    /// Marks an optional container as absent for the current branch.
    pub fn degrade(&mut self, node: NodeId) {
        self.degraded.push(node);
    }

    /// Undoes the most recent degradation of `node` (on backtrack).
    pub fn undegrade(&mut self, node: NodeId) {
        if let Some(pos) = self.degraded.iter().rposition(|&n| n == node) {
            self.degraded.remove(pos);
        }
    }

    /// Whether the node or an ancestor was degraded in this branch.
    pub fn is_degraded(&self, g: &ModelGraph, node: NodeId) -> bool {
        if self.degraded.is_empty() {
            return false;
        }
        let mut current = Some(node);
        while let Some(n) = current {
            if self.degraded.contains(&n) {
                return true;
            }
            current = g.parent(n);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;
    use proptest::prelude::*;

    fn key(n: u32) -> MatchKey {
        MatchKey::Node(NodeId(n))
    }

    #[test]
    fn forward_and_reverse() {
        let mut m = MatchResult::new();
        m.put(key(0), key(10));
        m.put(key(1), key(11));
        assert_eq!(m.get(key(0)), Some(key(10)));
        assert_eq!(m.get_key(key(11)), Some(key(1)));
        assert!(m.contains_key(key(1)));
        assert!(m.contains_value(key(10)));
        assert!(!m.contains_key(key(10)));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn rollback_restores_both_directions() {
        let mut m = MatchResult::new();
        m.put(key(0), key(10));
        let ckpt = m.checkpoint();
        m.put(key(1), key(11));
        m.put(key(2), key(12));
        m.rollback_to(ckpt);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(key(0)), Some(key(10)));
        assert_eq!(m.get(key(1)), None);
        assert_eq!(m.get_key(key(12)), None);
        // the freed host elements can be bound again
        m.put(key(2), key(11));
        assert_eq!(m.get(key(2)), Some(key(11)));
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn double_binding_is_rejected() {
        let mut m = MatchResult::new();
        m.put(key(0), key(10));
        m.put(key(1), key(10));
    }

    #[test]
    fn caches_invalidate_together() {
        let mut g = ModelGraph::new("top");
        let a = g.add_atomic(g.root(), "a", "x").unwrap();
        let mut state = MatchState::new();
        assert!(!state.is_statically_skipped(&g, a));
        g.set_tag(a, Tag::Ignored);
        // stale until reset
        assert!(!state.is_statically_skipped(&g, a));
        state.reset();
        assert!(state.is_statically_skipped(&g, a));
    }

    #[test]
    fn degradation_covers_descendants() {
        let mut g = ModelGraph::new("top");
        let c = g.add_composite(g.root(), "c", "box").unwrap();
        let inner = g.add_atomic(c, "inner", "x").unwrap();
        let mut state = MatchState::new();
        assert!(!state.is_degraded(&g, inner));
        state.degrade(c);
        assert!(state.is_degraded(&g, inner));
        assert!(state.is_degraded(&g, c));
        state.undegrade(c);
        assert!(!state.is_degraded(&g, inner));
    }

    proptest! {
        /// `retain(n)` leaves exactly the first n entries, in order, in both
        /// directions.
        #[test]
        fn retain_is_exact(
            pairs in proptest::collection::vec((0u32..500, 500u32..1000), 1..40),
            cut_ratio in 0.0f64..1.0,
        ) {
            let mut m = MatchResult::new();
            let mut inserted: Vec<(MatchKey, MatchKey)> = Vec::new();
            for (p, h) in pairs {
                let (p, h) = (key(p), key(h));
                if m.contains_key(p) || m.contains_value(h) {
                    continue;
                }
                m.put(p, h);
                inserted.push((p, h));
            }
            let n = (inserted.len() as f64 * cut_ratio) as usize;
            m.retain(n);
            prop_assert_eq!(m.len(), n);
            let kept: Vec<_> = m.iter().collect();
            prop_assert_eq!(&kept[..], &inserted[..n]);
            for (i, &(p, h)) in inserted.iter().enumerate() {
                if i < n {
                    prop_assert_eq!(m.get(p), Some(h));
                    prop_assert_eq!(m.get_key(h), Some(p));
                } else {
                    prop_assert_eq!(m.get(p), None);
                    prop_assert_eq!(m.get_key(h), None);
                }
            }
        }

        /// The map is injective in both directions at all times.
        #[test]
        fn injectivity_holds(
            pairs in proptest::collection::vec((0u32..100, 100u32..200), 1..60),
        ) {
            let mut m = MatchResult::new();
            for (p, h) in pairs {
                let (p, h) = (key(p), key(h));
                if !m.contains_key(p) && !m.contains_value(h) {
                    m.put(p, h);
                }
            }
            let mut seen_patterns = std::collections::HashSet::new();
            let mut seen_hosts = std::collections::HashSet::new();
            for (p, h) in m.iter() {
                prop_assert!(seen_patterns.insert(p));
                prop_assert!(seen_hosts.insert(h));
            }
        }
    }
}
