//! The backtracking search that embeds a pattern graph into a host graph.
//!
//! The search follows a mark-and-rollback discipline: every matching function
//! records a checkpoint of the binding map on entry and rolls back to it on
//! failure, so a failed attempt is side-effect-free. Deferred sibling joins
//! (lookback lists) let later bindings constrain earlier choices: when a
//! composite is matched, its attribute/port/child lists are queued rather
//! than resolved left to right, and [`GraphMatcher::check_backward`] revisits
//! the queue in LIFO order once the recursion reaches a leaf.
//!
//! A full candidate match passes a negation pass (no Negated pattern element
//! may bind anywhere in the host) before the callback sees a snapshot of the
//! bindings. The callback returns `true` to stop the search or `false` to
//! keep enumerating; optional sub-patterns degrade to absent instead of
//! failing the surrounding match.

use crate::analyzer::{self, ChildCursor, PathCursor, PathValue, Visited};
use crate::ingredient::{self, values_match};
use crate::match_state::{MatchKey, MatchResult, MatchState, PathId};
use crate::model::{AttrValue, ModelGraph, Name, NodeId, NodeKind};
use crate::util::log;

/// A queued join of a pattern sibling list against a host sibling list.
#[derive(Debug)]
struct LookbackEntry {
    pattern_items: Vec<MatchKey>,
    host_items: Vec<MatchKey>,
    host_used: Vec<bool>,
    /// Index of the next pattern item to pair; items before it are claimed
    /// by frames deeper in the recursion.
    cursor: usize,
    finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindTag {
    Attribute,
    Port,
    Atomic,
    Composite,
    Relation,
}

fn kind_tag(g: &ModelGraph, id: NodeId) -> KindTag {
    match &g.node(id).kind {
        NodeKind::Attribute { .. } => KindTag::Attribute,
        NodeKind::Port(_) => KindTag::Port,
        NodeKind::Atomic => KindTag::Atomic,
        NodeKind::Composite(_) => KindTag::Composite,
        NodeKind::Relation { .. } => KindTag::Relation,
    }
}

/// Matches a pattern against subgraphs of a host.
pub struct GraphMatcher<'g, F> {
    pattern: &'g ModelGraph,
    host: &'g ModelGraph,
    callback: F,
    state: MatchState,
    lookback: Vec<LookbackEntry>,
    /// Arena of collapsed paths materialized during this run, for both the
    /// pattern and the host side.
    paths: Vec<PathValue>,
    /// Topmost Negated pattern nodes, probed after every candidate match.
    negated_roots: Vec<NodeId>,
    negation: bool,
    success: bool,
    found: usize,
    last: Option<MatchResult>,
}

impl<'g> GraphMatcher<'g, fn(&MatchResult) -> bool> {
    /// A matcher that stops at the first match (the callback always accepts).
    pub fn new(pattern: &'g ModelGraph, host: &'g ModelGraph) -> Self {
        fn stop(_: &MatchResult) -> bool {
            true
        }
        GraphMatcher::with_callback(pattern, host, stop as fn(&MatchResult) -> bool)
    }

    /// The first match, if any.
    pub fn find_first(pattern: &ModelGraph, host: &ModelGraph) -> Option<MatchResult> {
        let mut matcher = GraphMatcher::new(pattern, host);
        matcher.match_pattern();
        matcher.last
    }

    /// All matches, in enumeration order.
    pub fn find_all(pattern: &ModelGraph, host: &ModelGraph) -> Vec<MatchResult> {
        let mut results = Vec::new();
        let mut matcher = GraphMatcher::with_callback(pattern, host, |result: &MatchResult| {
            results.push(result.clone());
            false
        });
        matcher.match_pattern();
        drop(matcher);
        results
    }
}

impl<'g, F: FnMut(&MatchResult) -> bool> GraphMatcher<'g, F> {
    /// The callback is invoked with a snapshot of each candidate match that
    /// survives the negation pass; returning `true` stops the search.
    pub fn with_callback(pattern: &'g ModelGraph, host: &'g ModelGraph, callback: F) -> Self {
        GraphMatcher {
            pattern,
            host,
            callback,
            state: MatchState::new(),
            lookback: Vec::new(),
            paths: Vec::new(),
            negated_roots: Vec::new(),
            negation: false,
            success: false,
            found: 0,
            last: None,
        }
    }

    /// Whether the last run was successful, i.e. the callback accepted a
    /// match. Enumerating every match with an always-`false` callback is not
    /// "successful" even when matches were reported; see
    /// [`GraphMatcher::found_count`].
    pub fn is_successful(&self) -> bool {
        self.success
    }

    /// Number of candidate matches reported to the callback in the last run.
    pub fn found_count(&self) -> usize {
        self.found
    }

    /// The most recent match reported to the callback.
    pub fn match_result(&self) -> Option<&MatchResult> {
        self.last.as_ref()
    }

    /// Matches the pattern against the host at every composite depth,
    /// enumerating the cross-product of all pattern value iterators as an
    /// outer loop. Returns whether the callback accepted a match.
    pub fn match_pattern(&mut self) -> bool {
        self.success = false;
        self.found = 0;
        self.last = None;
        self.negated_roots = self.collect_negated_roots();

        let iterators = collect_value_iterators(self.pattern);
        if iterators.iter().any(|(_, values)| values.is_empty()) {
            log::warn!("a value iterator has no values; the pattern cannot match");
            return false;
        }
        let candidates = self.host.descendant_composites(self.host.root());
        let root = self.pattern.root();

        let mut indices = vec![0usize; iterators.len()];
        'combinations: loop {
            for (k, (param, values)) in iterators.iter().enumerate() {
                self.state.bind_param(*param, values[indices[k]].clone());
            }
            for &candidate in &candidates {
                self.state.reset();
                self.lookback.clear();
                self.paths.clear();
                if self.match_key(MatchKey::Node(root), MatchKey::Node(candidate)) {
                    self.success = true;
                    break 'combinations;
                }
                debug_assert!(self.state.map().is_empty());
            }
            // advance the odometer
            let mut position = indices.len();
            loop {
                if position == 0 {
                    break 'combinations;
                }
                position -= 1;
                indices[position] += 1;
                if indices[position] < iterators[position].1.len() {
                    break;
                }
                indices[position] = 0;
            }
        }
        self.state.clear_params();
        if !self.success {
            self.state.reset();
            self.lookback.clear();
        }
        self.success
    }

    ///////////////////////////////////////////////////////////////////
    // dispatch

    fn match_key(&mut self, lhs: MatchKey, host: MatchKey) -> bool {
        if let Some(bound) = self.state.map().get(lhs) {
            return if bound == host {
                self.check_backward()
            } else {
                false
            };
        }
        if self.state.map().contains_value(host) {
            return false;
        }
        match (lhs, host) {
            (MatchKey::Node(l), MatchKey::Node(h)) => {
                match (kind_tag(self.pattern, l), kind_tag(self.host, h)) {
                    (KindTag::Atomic, KindTag::Atomic) => self.match_atomic(l, h),
                    (KindTag::Composite, KindTag::Composite) => self.match_composite(l, h),
                    (KindTag::Port, KindTag::Port) => self.match_port(l, h),
                    (KindTag::Relation, KindTag::Relation) => self.match_relation(l, h),
                    (KindTag::Attribute, KindTag::Attribute) => self.match_attribute(l, h),
                    _ => false,
                }
            }
            (MatchKey::Path(l), MatchKey::Path(h)) => self.match_path(l, h),
            _ => false,
        }
    }

    /// Revisits queued lookback work, most recent first. When none is left,
    /// the candidate match is complete.
    fn check_backward(&mut self) -> bool {
        match self.lookback.iter().rposition(|entry| !entry.finished) {
            Some(index) => self.match_list(index),
            None if self.negation => true,
            None => self.complete_match(),
        }
    }

    fn complete_match(&mut self) -> bool {
        if !self.negated_roots.is_empty() && self.negation_pass() {
            return false;
        }
        if !self.root_constraints_ok() {
            return false;
        }
        let result = self.state.snapshot();
        self.found += 1;
        log::debug!("match #{} found ({} bindings)", self.found, result.len());
        self.last = Some(result.clone());
        (self.callback)(&result)
    }

    ///////////////////////////////////////////////////////////////////
    // per-kind rules

    fn match_atomic(&mut self, l: NodeId, h: NodeId) -> bool {
        let ckpt = self.state.map().checkpoint();
        let base = self.lookback.len();
        self.state.map_mut().put(MatchKey::Node(l), MatchKey::Node(h));

        let mut success = self.shallow_match_node(l, h);
        if success {
            let pattern_items = keys(self.pattern.ports(l))
                .chain(keys(self.pattern.attributes(l)))
                .collect();
            let host_items = keys(self.host.ports(h))
                .chain(keys(self.host.attributes(h)))
                .collect();
            self.push_list(pattern_items, host_items);
            success = self.check_backward();
        }
        if !success {
            self.state.map_mut().rollback_to(ckpt);
            self.lookback.truncate(base);
        }
        success
    }

    fn match_composite(&mut self, l: NodeId, h: NodeId) -> bool {
        let ckpt = self.state.map().checkpoint();
        let base = self.lookback.len();
        self.state.map_mut().put(MatchKey::Node(l), MatchKey::Node(h));

        let mut success = self.shallow_match_node(l, h) && self.shallow_match_composite(l, h);
        if success {
            let pattern_children = keys(self.collect_pattern_children(l)).collect();
            let host_children = keys(self.collect_host_children(h)).collect();
            self.push_list(
                keys(self.pattern.attributes(l)).collect(),
                keys(self.host.attributes(h)).collect(),
            );
            self.push_list(
                keys(self.pattern.ports(l)).collect(),
                keys(self.host.ports(h)).collect(),
            );
            self.push_list(pattern_children, host_children);
            success = self.check_backward();
        }
        if !success {
            self.state.map_mut().rollback_to(ckpt);
            self.lookback.truncate(base);
        }
        success
    }

    fn match_port(&mut self, l: NodeId, h: NodeId) -> bool {
        let ckpt = self.state.map().checkpoint();
        let base = self.lookback.len();
        self.state.map_mut().put(MatchKey::Node(l), MatchKey::Node(h));

        let mut success = self.shallow_match_port(l, h);
        if success {
            // The owning entity first, then every collapsed path leaving the
            // port, then any non-collapsible relations matched as units.
            let mut pattern_items = Vec::new();
            if let Some(container) = self.pattern.parent(l) {
                pattern_items.push(MatchKey::Node(container));
            }
            pattern_items.extend(self.collect_port_paths(true, l));
            let mut host_items = Vec::new();
            if let Some(container) = self.host.parent(h) {
                host_items.push(MatchKey::Node(container));
            }
            host_items.extend(self.collect_port_paths(false, h));
            self.push_list(pattern_items, host_items);
            success = self.check_backward();
        }
        if !success {
            self.state.map_mut().rollback_to(ckpt);
            self.lookback.truncate(base);
        }
        success
    }

    fn match_relation(&mut self, l: NodeId, h: NodeId) -> bool {
        let ckpt = self.state.map().checkpoint();
        let base = self.lookback.len();
        self.state.map_mut().put(MatchKey::Node(l), MatchKey::Node(h));

        let mut success = self.shallow_match_node(l, h);
        if success {
            let pattern_items = keys(self.pattern.linked(l)).collect();
            let host_items = keys(self.host.linked(h)).collect();
            self.push_list(pattern_items, host_items);
            success = self.check_backward();
        }
        if !success {
            self.state.map_mut().rollback_to(ckpt);
            self.lookback.truncate(base);
        }
        success
    }

    fn match_attribute(&mut self, l: NodeId, h: NodeId) -> bool {
        if self.pattern.node(l).name != self.host.node(h).name {
            return false;
        }
        let (NodeKind::Attribute { value: lv }, NodeKind::Attribute { value: hv }) =
            (&self.pattern.node(l).kind, &self.host.node(h).kind)
        else {
            return false;
        };
        if !values_match(lv, hv, self.state.params()) {
            return false;
        }
        let ckpt = self.state.map().checkpoint();
        self.state.map_mut().put(MatchKey::Node(l), MatchKey::Node(h));
        let success = self.check_backward();
        if !success {
            self.state.map_mut().rollback_to(ckpt);
        }
        success
    }

    fn match_path(&mut self, l: PathId, h: PathId) -> bool {
        let l_end = self.paths[l.0 as usize].end_port();
        let h_end = self.paths[h.0 as usize].end_port();
        if !self.shallow_match_port(l_end, h_end) {
            return false;
        }
        let ckpt = self.state.map().checkpoint();
        self.state.map_mut().put(MatchKey::Path(l), MatchKey::Path(h));
        let success = self.match_key(MatchKey::Node(l_end), MatchKey::Node(h_end));
        if !success {
            self.state.map_mut().rollback_to(ckpt);
        }
        success
    }

    ///////////////////////////////////////////////////////////////////
    // list matching

    fn push_list(&mut self, pattern_items: Vec<MatchKey>, host_items: Vec<MatchKey>) {
        let host_used = vec![false; host_items.len()];
        self.lookback.push(LookbackEntry {
            pattern_items,
            host_items,
            host_used,
            cursor: 0,
            finished: false,
        });
    }

    /// Pairs the next unclaimed pattern item of the entry with some unused
    /// host item, first success wins, and continues the search from there.
    /// An exhausted entry is marked finished and control returns to
    /// [`GraphMatcher::check_backward`].
    fn match_list(&mut self, index: usize) -> bool {
        let cursor = self.lookback[index].cursor;
        if cursor >= self.lookback[index].pattern_items.len() {
            let ckpt = self.state.map().checkpoint();
            self.lookback[index].finished = true;
            let success = self.check_backward();
            self.lookback[index].finished = false;
            if !success {
                self.state.map_mut().rollback_to(ckpt);
            }
            return success;
        }

        let lhs = self.lookback[index].pattern_items[cursor];
        if let MatchKey::Node(node) = lhs
            && self.skip_in_current_pass(node)
        {
            self.lookback[index].cursor += 1;
            let success = self.match_list(index);
            self.lookback[index].cursor -= 1;
            return success;
        }

        // An element bound earlier in the search (e.g. a port's container)
        // may only pair with its existing counterpart; if that counterpart is
        // not in this host list, the list cannot be satisfied.
        let bound = self.state.map().get(lhs);
        let ckpt = self.state.map().checkpoint();
        self.lookback[index].cursor += 1;
        let mut success = false;
        for hi in 0..self.lookback[index].host_items.len() {
            if self.lookback[index].host_used[hi] {
                continue;
            }
            let host_item = self.lookback[index].host_items[hi];
            match bound {
                Some(counterpart) => {
                    if counterpart != host_item {
                        continue;
                    }
                }
                None => {
                    if self.state.map().contains_value(host_item) {
                        continue;
                    }
                }
            }
            self.lookback[index].host_used[hi] = true;
            if self.match_key(lhs, host_item) {
                success = true;
                break;
            }
            self.lookback[index].host_used[hi] = false;
        }
        self.lookback[index].cursor -= 1;

        if !success
            && !self.negation
            && bound.is_none()
            && let MatchKey::Node(node) = lhs
            && self.pattern.node(node).tags.optional
        {
            // Optional sub-pattern: degrade to absent and retry the list
            // without it. The degradation holds for the rest of this branch.
            log::trace!(
                "optional sub-pattern `{}` degrades to absent",
                self.pattern.full_name(node)
            );
            self.state.degrade(node);
            self.lookback[index].cursor += 1;
            success = self.match_list(index);
            self.lookback[index].cursor -= 1;
            if !success {
                self.state.undegrade(node);
            }
        }

        if !success {
            self.state.map_mut().rollback_to(ckpt);
        }
        success
    }

    ///////////////////////////////////////////////////////////////////
    // shallow checks

    /// Class compatibility plus the node's criteria, evaluated against the
    /// host candidate. An unparsable ingredient list fails closed.
    fn shallow_match_node(&self, l: NodeId, h: NodeId) -> bool {
        if !self.pattern.node(l).class.accepts(&self.host.node(h).class) {
            return false;
        }
        match ingredient::parse_of(self.pattern, l) {
            Ok(ingredients) => ingredients
                .criteria
                .iter()
                .all(|criterion| criterion.is_satisfied(self.host, h, self.state.params())),
            Err(err) => {
                log::warn!(
                    "ingredient list of `{}` failed to parse ({err}); treating as non-matching",
                    self.pattern.full_name(l)
                );
                false
            }
        }
    }

    fn shallow_match_port(&self, l: NodeId, h: NodeId) -> bool {
        let (NodeKind::Port(lf), NodeKind::Port(hf)) =
            (&self.pattern.node(l).kind, &self.host.node(h).kind)
        else {
            return false;
        };
        if (lf.input && !hf.input) || (lf.output && !hf.output) || (lf.multi && !hf.multi) {
            return false;
        }
        self.shallow_match_node(l, h)
    }

    /// Opacity boundaries must agree, and executors must be absent on both
    /// sides or of the same class.
    fn shallow_match_composite(&self, l: NodeId, h: NodeId) -> bool {
        if self.pattern.is_opaque(l) != self.host.is_opaque(h) {
            return false;
        }
        let (NodeKind::Composite(ld), NodeKind::Composite(hd)) =
            (&self.pattern.node(l).kind, &self.host.node(h).kind)
        else {
            return false;
        };
        match (&ld.executor, &hd.executor) {
            (None, None) => true,
            (Some(le), Some(he)) => le.class == he.class,
            _ => false,
        }
    }

    ///////////////////////////////////////////////////////////////////
    // candidate collection

    fn collect_pattern_children(&self, top: NodeId) -> Vec<NodeId> {
        let pattern = self.pattern;
        let state = &self.state;
        let negation = self.negation;
        let map = state.map();
        let excluded = |n: NodeId| {
            map.contains_key(MatchKey::Node(n))
                || state.is_statically_skipped(pattern, n)
                || (!negation && state.is_negated(pattern, n))
                || state.is_degraded(pattern, n)
        };
        collect_children(pattern, top, &excluded)
    }

    fn collect_host_children(&self, top: NodeId) -> Vec<NodeId> {
        let host = self.host;
        let map = self.state.map();
        let excluded = |n: NodeId| map.contains_value(MatchKey::Node(n));
        collect_children(host, top, &excluded)
    }

    /// Every collapsed path leaving the port, plus any non-collapsible
    /// relations linked to it (matched as units instead of collapsed).
    fn collect_port_paths(&mut self, pattern_side: bool, port: NodeId) -> Vec<MatchKey> {
        let g = if pattern_side { self.pattern } else { self.host };
        let opaque = |n: NodeId| g.is_opaque(n);
        let mut cursor = PathCursor::new(port);
        let mut visited = Visited::default();
        let mut items = Vec::new();
        let mut found = analyzer::first_path(g, &mut cursor, &mut visited, &opaque);
        while found {
            let id = PathId(self.paths.len() as u32);
            self.paths.push(cursor.snapshot());
            items.push(MatchKey::Path(id));
            found = analyzer::next_path(g, &mut cursor, &mut visited, &opaque);
        }
        for rel in g.linked_relations(port) {
            if matches!(g.node(rel).kind, NodeKind::Relation { collapsible: false }) {
                items.push(MatchKey::Node(rel));
            }
        }
        items
    }

    fn skip_in_current_pass(&self, node: NodeId) -> bool {
        self.state.is_statically_skipped(self.pattern, node)
            || (!self.negation && self.state.is_negated(self.pattern, node))
            || self.state.is_degraded(self.pattern, node)
    }

    ///////////////////////////////////////////////////////////////////
    // negation

    fn collect_negated_roots(&self) -> Vec<NodeId> {
        self.pattern
            .nodes()
            .filter(|&(id, data)| {
                data.tags.negated
                    && self
                        .pattern
                        .parent(id)
                        .is_none_or(|parent| !self.state.is_negated(self.pattern, parent))
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// The second pass over Negated pattern elements: if any of them can
    /// bind to (so far unmatched) host structure, the candidate match is
    /// forbidden. All probe bindings are rolled back either way.
    fn negation_pass(&mut self) -> bool {
        let ckpt = self.state.map().checkpoint();
        let base = self.lookback.len();
        self.negation = true;
        let mut forbidden = false;
        let roots = self.negated_roots.clone();
        'probe: for negated in roots {
            let Some(context) = self.host_context_of(negated) else {
                continue;
            };
            for candidate in self.negation_candidates(negated, context) {
                if self.state.map().contains_value(MatchKey::Node(candidate)) {
                    continue;
                }
                if self.match_key(MatchKey::Node(negated), MatchKey::Node(candidate)) {
                    log::trace!(
                        "negated `{}` matches host `{}`; rejecting candidate match",
                        self.pattern.full_name(negated),
                        self.host.full_name(candidate)
                    );
                    forbidden = true;
                    break 'probe;
                }
            }
        }
        self.negation = false;
        self.lookback.truncate(base);
        self.state.map_mut().rollback_to(ckpt);
        forbidden
    }

    /// The host node bound to the nearest matched ancestor of a pattern node.
    fn host_context_of(&self, node: NodeId) -> Option<NodeId> {
        for ancestor in self.pattern.ancestors(node) {
            if let Some(host) = self.state.map().get_node(ancestor) {
                return Some(host);
            }
        }
        None
    }

    fn negation_candidates(&self, negated: NodeId, context: NodeId) -> Vec<NodeId> {
        match kind_tag(self.pattern, negated) {
            KindTag::Atomic | KindTag::Composite => self.collect_host_children(context),
            KindTag::Port => self.host.ports(context),
            KindTag::Relation => self.host.relations(context),
            KindTag::Attribute => self.host.attributes(context),
        }
    }

    fn root_constraints_ok(&self) -> bool {
        let root = self.pattern.root();
        match self.state.map().get_node(root) {
            Some(host_root) => self.shallow_match_node(root, host_root),
            None => false,
        }
    }
}

fn keys(nodes: Vec<NodeId>) -> impl Iterator<Item = MatchKey> {
    nodes.into_iter().map(MatchKey::Node)
}

fn collect_children(
    g: &ModelGraph,
    top: NodeId,
    excluded: &dyn Fn(NodeId) -> bool,
) -> Vec<NodeId> {
    let opaque = |n: NodeId| g.is_opaque(n);
    let mut cursor = ChildCursor::new();
    let mut out = Vec::new();
    let mut child = analyzer::first_child(g, top, &mut cursor, excluded, &opaque);
    while let Some(c) = child {
        out.push(c);
        child = analyzer::next_child(g, top, &mut cursor, excluded, &opaque);
    }
    out
}

/// All value iterators at or below the graph root, in preorder. This walk
/// deliberately ignores opacity boundaries: parameters of opaque composites
/// are still enumerated.
fn collect_value_iterators(g: &ModelGraph) -> Vec<(Name, Vec<AttrValue>)> {
    let mut out = Vec::new();
    let mut stack = vec![g.root()];
    while let Some(current) = stack.pop() {
        if let NodeKind::Composite(data) = &g.node(current).kind {
            for iterator in &data.iterators {
                out.push((iterator.param, iterator.values.clone()));
            }
        }
        for &child in g.children(current).iter().rev() {
            if g.node(child).kind.is_entity() {
                stack.push(child);
            }
        }
    }
    out
}
