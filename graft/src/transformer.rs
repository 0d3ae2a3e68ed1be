//! Turns a match result into a concrete rewrite of the host graph.
//!
//! A [`Rule`] is a pattern graph plus a replacement graph, correlated per
//! node: an explicit correspondence tag wins, nodes without one pair up by
//! equal names under corresponding parents. The transformer composes that
//! static table with the pattern-to-host match result and then applies a
//! strictly ordered edit sequence: snapshot preserved content, create
//! replacement-only nodes, apply per-node operations, unlink edges dropped by
//! the replacement, remove unmatched nodes (shallow-flattening composites
//! that still have surviving content), reconnect the replacement topology,
//! and normalize leftover relations.
//!
//! A failure in any step aborts the remaining steps for that match: the edits
//! applied so far stay (they are consistent, just incomplete) and are all in
//! the report's [`EditLog`], so callers needing atomicity can wrap one
//! transform in their own transaction and roll the log back.

use crate::edit::{EditLog, GraphEdit};
use crate::ingredient::{self, RewriteOp};
use crate::match_state::MatchResult;
use crate::matcher::GraphMatcher;
use crate::model::{
    ModelGraph, Name, NodeId, NodeKind, NodeProto, TagSet,
};
use crate::util::log;
use error_stack::{ResultExt, bail};
use std::collections::HashMap;
use thiserror::Error;

/// A graph transformation rule: what to find and what to turn it into.
#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: ModelGraph,
    pub replacement: ModelGraph,
}

impl Rule {
    pub fn new(pattern: ModelGraph, replacement: ModelGraph) -> Self {
        Rule {
            pattern,
            replacement,
        }
    }

    /// An identity rule: the replacement is the pattern itself.
    pub fn identity(pattern: ModelGraph) -> Self {
        let replacement = pattern.clone();
        Rule {
            pattern,
            replacement,
        }
    }

    /// Eagerly checks every ingredient list in both graphs.
    pub fn validate(&self) -> Result<(), ingredient::MalformedPattern> {
        ingredient::validate(&self.pattern)?;
        ingredient::validate(&self.replacement)
    }

    /// The static pattern-to-replacement correspondence. Roots always
    /// correspond; a `corresponds_to` tag names the replacement node by full
    /// path, and untagged nodes mirror by name under corresponding parents.
    pub fn correspondence(&self) -> HashMap<NodeId, NodeId> {
        let mut map = HashMap::new();
        map.insert(self.pattern.root(), self.replacement.root());
        let mut stack = vec![self.pattern.root()];
        while let Some(parent) = stack.pop() {
            for &child in self.pattern.children(parent) {
                let target = match &self.pattern.node(child).tags.corresponds_to {
                    Some(path) => self.replacement.resolve_path(path),
                    None => map
                        .get(&parent)
                        .and_then(|&rp| {
                            self.replacement
                                .child_by_name(rp, self.pattern.node(child).name)
                        }),
                };
                if let Some(target) = target {
                    map.insert(child, target);
                }
                stack.push(child);
            }
        }
        map
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("the match result does not bind the pattern root")]
    MissingRootBinding,
    #[error("a rule graph has a malformed ingredient list")]
    MalformedPattern,
    #[error("a structural edit was rejected by the host graph")]
    EditRejected,
}

pub type TransformResult<T> = error_stack::Result<T, TransformError>;

/// What one transform did to the host.
#[derive(Debug)]
pub struct TransformReport {
    /// Every edit applied, in order.
    pub log: EditLog,
    /// Roots of subtrees created in the host.
    pub created: Vec<NodeId>,
}

/// Applies [`Rule`]s to host graphs.
#[derive(Debug, Clone)]
pub struct GraphTransformer {
    /// Whether normalization may merge directly-linked collapsible relations
    /// into one.
    pub hide_relations: bool,
}

impl Default for GraphTransformer {
    fn default() -> Self {
        GraphTransformer {
            hide_relations: true,
        }
    }
}

impl GraphTransformer {
    pub fn new() -> Self {
        GraphTransformer::default()
    }

    /// Matches the rule's pattern once and transforms the first match, if
    /// any.
    pub fn apply_first(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
    ) -> TransformResult<Option<TransformReport>> {
        let Some(result) = GraphMatcher::find_first(&rule.pattern, host) else {
            return Ok(None);
        };
        self.transform(rule, host, &result).map(Some)
    }

    /// Transforms each match independently; a failed match does not stop the
    /// others.
    pub fn transform_all(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        results: &[MatchResult],
    ) -> Vec<TransformResult<TransformReport>> {
        results
            .iter()
            .map(|result| self.transform(rule, host, result))
            .collect()
    }

    /// Rewrites the host according to the rule and one match result.
    pub fn transform(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        result: &MatchResult,
    ) -> TransformResult<TransformReport> {
        rule.validate()
            .change_context(TransformError::MalformedPattern)?;
        let Some(region) = result.get_node(rule.pattern.root()) else {
            bail!(TransformError::MissingRootBinding);
        };

        let pat2repl = rule.correspondence();
        let mut repl_to_host: HashMap<NodeId, NodeId> = HashMap::new();
        for (p, h) in result.node_bindings() {
            if let Some(&r) = pat2repl.get(&p) {
                repl_to_host.insert(r, h);
            }
        }
        repl_to_host.insert(rule.replacement.root(), region);

        // 1. Snapshot preserved subtrees before anything is deleted, and
        // mirror their replacement-side descendants onto the host by name.
        let mut preserved: Vec<(NodeId, NodeId, NodeProto)> = Vec::new();
        for (p, h) in result.node_bindings() {
            if rule.pattern.node(p).tags.preserved {
                preserved.push((p, h, host.snapshot(h)));
                if let Some(&r) = pat2repl.get(&p) {
                    mirror_by_name(&rule.replacement, r, host, h, &mut repl_to_host);
                }
            }
        }

        let mut edit_log = EditLog::new();
        let mut created = Vec::new();

        // 2. Create replacement-only nodes. The top-down walk creates missing
        // ancestors one level at a time below the nearest mapped ancestor,
        // which is exactly what Created-tagged pattern nodes need.
        self.create_missing(rule, host, &mut repl_to_host, &mut edit_log, &mut created)?;

        // 3. Per-node operations, in document order.
        self.apply_operations(rule, host, &repl_to_host, &mut edit_log)?;

        // 4. Unlink edges the replacement dropped.
        self.remove_dangling_edges(rule, host, result, &pat2repl, &mut edit_log)?;

        // 5. Remove nodes without replacement counterparts.
        self.remove_nodes(rule, host, result, &pat2repl, &mut edit_log)?;

        // 5b. Re-add preserved content whose host node was deleted as part of
        // an enclosing subtree.
        for (p, h, proto) in &preserved {
            if host.contains(*h) {
                continue;
            }
            let new_home = pat2repl
                .get(p)
                .and_then(|&r| rule.replacement.parent(r))
                .and_then(|rp| repl_to_host.get(&rp).copied())
                .filter(|&hp| host.contains(hp));
            if let Some(parent) = new_home {
                log::debug!(
                    "re-adding preserved `{}` under `{}`",
                    proto.name,
                    host.full_name(parent)
                );
                let restored = edit_log
                    .apply(
                        host,
                        GraphEdit::CreateNode {
                            parent,
                            proto: proto.clone(),
                        },
                    )
                    .change_context(TransformError::EditRejected)
                    .attach_printable("while re-adding a preserved subtree")?
                    .expect("CreateNode returns the new root");
                if let Some(&r) = pat2repl.get(p) {
                    repl_to_host.insert(r, restored);
                }
                created.push(restored);
            }
        }

        // 6. Reconnect: make the host topology cover the replacement's.
        self.reconnect(rule, host, &repl_to_host, &mut edit_log)?;

        // 7. Normalize relations in the rewritten region.
        self.normalize(host, region, &mut edit_log)?;

        Ok(TransformReport {
            log: edit_log,
            created,
        })
    }

    ///////////////////////////////////////////////////////////////////
    // step 2

    fn create_missing(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        repl_to_host: &mut HashMap<NodeId, NodeId>,
        edit_log: &mut EditLog,
        created: &mut Vec<NodeId>,
    ) -> TransformResult<()> {
        let repl = &rule.replacement;
        let mut stack = vec![repl.root()];
        while let Some(r) = stack.pop() {
            if !repl_to_host.contains_key(&r) {
                let parent = repl.parent(r).expect("the root is always mapped");
                let &hp = repl_to_host
                    .get(&parent)
                    .expect("parents are visited before children");
                if subtree_unmapped(repl, r, repl_to_host) {
                    // Nothing below has a host counterpart: instantiate the
                    // subtree wholesale.
                    let mut proto = repl.snapshot(r);
                    strip_rule_only(&mut proto);
                    let h = edit_log
                        .apply(host, GraphEdit::CreateNode { parent: hp, proto })
                        .change_context(TransformError::EditRejected)
                        .attach_printable_lazy(|| {
                            format!("while creating `{}`", repl.full_name(r))
                        })?
                        .expect("CreateNode returns the new root");
                    record_subtree(repl, r, host, h, repl_to_host, created);
                    continue;
                }
                let mut proto = single_proto(repl, r);
                strip_rule_only(&mut proto);
                let h = edit_log
                    .apply(host, GraphEdit::CreateNode { parent: hp, proto })
                    .change_context(TransformError::EditRejected)
                    .attach_printable_lazy(|| format!("while creating `{}`", repl.full_name(r)))?
                    .expect("CreateNode returns the new root");
                repl_to_host.insert(r, h);
                created.push(h);
            }
            for &child in repl.children(r).iter().rev() {
                stack.push(child);
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // step 3

    fn apply_operations(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        repl_to_host: &HashMap<NodeId, NodeId>,
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        let repl = &rule.replacement;
        let mut stack = vec![repl.root()];
        while let Some(r) = stack.pop() {
            for &child in repl.children(r).iter().rev() {
                stack.push(child);
            }
            if repl.node(r).ingredients.is_none() {
                continue;
            }
            let ingredients = ingredient::parse_of(repl, r)
                .change_context(TransformError::MalformedPattern)?;
            let Some(&h) = repl_to_host.get(&r) else {
                continue;
            };
            for op in ingredients.operations {
                let edit = match op {
                    RewriteOp::Rename(name) => GraphEdit::Rename { node: h, name },
                    RewriteOp::Retype(class) => GraphEdit::Retype { node: h, class },
                    RewriteOp::SetAttribute(name, value) => GraphEdit::SetAttribute {
                        node: h,
                        name,
                        value,
                    },
                    RewriteOp::RemoveAttribute(name) => {
                        GraphEdit::RemoveAttribute { node: h, name }
                    }
                };
                edit_log
                    .apply(host, edit)
                    .change_context(TransformError::EditRejected)
                    .attach_printable_lazy(|| {
                        format!("operation on `{}`", repl.full_name(r))
                    })?;
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // step 4

    fn remove_dangling_edges(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        result: &MatchResult,
        pat2repl: &HashMap<NodeId, NodeId>,
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        for (pa, pb) in graph_links(&rule.pattern) {
            let (Some(ha), Some(hb)) = (result.get_node(pa), result.get_node(pb)) else {
                continue;
            };
            let kept = match (pat2repl.get(&pa), pat2repl.get(&pb)) {
                (Some(&ra), Some(&rb)) => rule.replacement.is_linked(ra, rb),
                _ => false,
            };
            if !kept && host.is_linked(ha, hb) {
                edit_log
                    .apply(host, GraphEdit::Unlink { a: ha, b: hb })
                    .change_context(TransformError::EditRejected)
                    .attach_printable_lazy(|| {
                        format!(
                            "while unlinking `{}` from `{}`",
                            host.full_name(ha),
                            host.full_name(hb)
                        )
                    })?;
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // step 5

    fn remove_nodes(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        result: &MatchResult,
        pat2repl: &HashMap<NodeId, NodeId>,
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        let mut removal: Vec<(NodeId, NodeId)> = result
            .node_bindings()
            .filter(|(p, _)| {
                let tags = &rule.pattern.node(*p).tags;
                !pat2repl.contains_key(p) && !tags.preserved && !tags.created
            })
            .collect();
        // ancestors first, so subtree deletions subsume their descendants
        removal.sort_by_key(|(p, _)| rule.pattern.ancestors(*p).len());

        let removed_hosts: Vec<NodeId> = removal.iter().map(|&(_, h)| h).collect();
        let mut done: Vec<NodeId> = Vec::new();
        for (p, h) in removal {
            if rule
                .pattern
                .ancestors(p)
                .iter()
                .any(|ancestor| done.contains(ancestor))
            {
                done.push(p);
                continue;
            }
            done.push(p);
            if !host.contains(h) {
                continue;
            }
            let is_composite = matches!(host.node(h).kind, NodeKind::Composite(_));
            if is_composite {
                let survivors: Vec<NodeId> = host
                    .entities(h)
                    .into_iter()
                    .chain(host.relations(h))
                    .filter(|child| !removed_hosts.contains(child))
                    .collect();
                if survivors.is_empty() {
                    self.delete(host, h, edit_log)?;
                } else {
                    self.shallow_flatten(host, h, &survivors, edit_log)?;
                }
            } else {
                self.delete(host, h, edit_log)?;
            }
        }
        Ok(())
    }

    fn delete(
        &self,
        host: &mut ModelGraph,
        node: NodeId,
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        edit_log
            .apply(host, GraphEdit::DeleteNode { node })
            .change_context(TransformError::EditRejected)
            .attach_printable_lazy(|| format!("while deleting `{}`", host.full_name(node)))?;
        Ok(())
    }

    /// Deletes a composite while keeping its surviving children: they are
    /// hoisted to the composite's parent, and for every boundary port that
    /// connected surviving inner ports to the outside, a fresh relation is
    /// synthesized that carries those connections over.
    fn shallow_flatten(
        &self,
        host: &mut ModelGraph,
        composite: NodeId,
        survivors: &[NodeId],
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        let parent = host
            .parent(composite)
            .expect("a matched composite is never the host root's parent");

        let inside = |host: &ModelGraph, n: NodeId| {
            n == composite || host.ancestors(n).contains(&composite)
        };
        let surviving_port = |host: &ModelGraph, port: NodeId| {
            host.ancestors(port)
                .iter()
                .any(|owner| survivors.contains(owner))
        };

        for port in host.ports(composite) {
            let mut outside_relations = Vec::new();
            let mut inner_ports = Vec::new();
            for rel in host.linked_relations(port) {
                if inside(host, rel) {
                    for linked in host.linked_ports(rel) {
                        if linked != port
                            && surviving_port(host, linked)
                            && !inner_ports.contains(&linked)
                        {
                            inner_ports.push(linked);
                        }
                    }
                } else if !outside_relations.contains(&rel) {
                    outside_relations.push(rel);
                }
            }
            if outside_relations.is_empty() || inner_ports.is_empty() {
                continue;
            }

            let name = fresh_name(host, parent, &format!("{}_bridge", host.node(port).name));
            let mut proto = NodeProto::leaf(
                name,
                "*",
                NodeKind::Relation { collapsible: true },
            );
            proto.position = average_position(
                host,
                inner_ports.iter().chain(outside_relations.iter()).copied(),
            );
            let bridge = edit_log
                .apply(host, GraphEdit::CreateNode { parent, proto })
                .change_context(TransformError::EditRejected)
                .attach_printable("while synthesizing a bridge relation")?
                .expect("CreateNode returns the new root");
            for inner in inner_ports {
                edit_log
                    .apply(host, GraphEdit::Link { a: inner, b: bridge })
                    .change_context(TransformError::EditRejected)?;
            }
            for outer in outside_relations {
                edit_log
                    .apply(host, GraphEdit::Link { a: bridge, b: outer })
                    .change_context(TransformError::EditRejected)?;
            }
        }

        for &survivor in survivors {
            edit_log
                .apply(
                    host,
                    GraphEdit::Reparent {
                        node: survivor,
                        new_parent: parent,
                    },
                )
                .change_context(TransformError::EditRejected)
                .attach_printable_lazy(|| {
                    format!("while hoisting `{}`", host.full_name(survivor))
                })?;
        }
        self.delete(host, composite, edit_log)
    }

    ///////////////////////////////////////////////////////////////////
    // step 6

    fn reconnect(
        &self,
        rule: &Rule,
        host: &mut ModelGraph,
        repl_to_host: &HashMap<NodeId, NodeId>,
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        for (ra, rb) in graph_links(&rule.replacement) {
            let (Some(&ha), Some(&hb)) = (repl_to_host.get(&ra), repl_to_host.get(&rb)) else {
                continue;
            };
            if !host.contains(ha) || !host.contains(hb) || host.is_linked(ha, hb) {
                continue;
            }
            edit_log
                .apply(host, GraphEdit::Link { a: ha, b: hb })
                .change_context(TransformError::EditRejected)
                .attach_printable_lazy(|| {
                    format!(
                        "while linking `{}` to `{}`",
                        host.full_name(ha),
                        host.full_name(hb)
                    )
                })?;
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // step 7

    fn normalize(
        &self,
        host: &mut ModelGraph,
        region: NodeId,
        edit_log: &mut EditLog,
    ) -> TransformResult<()> {
        let mut relations = Vec::new();
        let mut stack = vec![region];
        while let Some(current) = stack.pop() {
            for &child in host.children(current) {
                match &host.node(child).kind {
                    NodeKind::Relation { .. } => relations.push(child),
                    NodeKind::Composite(_) => stack.push(child),
                    _ => {}
                }
            }
        }

        for rel in relations {
            if !host.contains(rel) {
                continue;
            }
            if self.hide_relations {
                // merge directly-linked attribute-free collapsible relations
                loop {
                    let mergeable = host.linked(rel).into_iter().find(|&n| {
                        matches!(host.node(n).kind, NodeKind::Relation { collapsible: true })
                            && matches!(
                                host.node(rel).kind,
                                NodeKind::Relation { collapsible: true }
                            )
                            && host.attributes(n).is_empty()
                            && host.attributes(rel).is_empty()
                    });
                    let Some(other) = mergeable else { break };
                    for neighbor in host.linked(other) {
                        if neighbor != rel && !host.is_linked(rel, neighbor) {
                            edit_log
                                .apply(host, GraphEdit::Link { a: rel, b: neighbor })
                                .change_context(TransformError::EditRejected)?;
                        }
                    }
                    if let Some(position) =
                        average_position(host, [rel, other].into_iter())
                    {
                        edit_log
                            .apply(host, GraphEdit::SetPosition { node: rel, position })
                            .change_context(TransformError::EditRejected)?;
                    }
                    self.delete(host, other, edit_log)?;
                }
            }
            if host.linked(rel).len() <= 1 {
                log::trace!("dropping dangling relation `{}`", host.full_name(rel));
                self.delete(host, rel, edit_log)?;
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////
// helpers

fn graph_links(g: &ModelGraph) -> Vec<(NodeId, NodeId)> {
    let mut out = Vec::new();
    for (id, _) in g.nodes() {
        for neighbor in g.linked(id) {
            if id < neighbor {
                out.push((id, neighbor));
            }
        }
    }
    out
}

fn subtree_unmapped(
    repl: &ModelGraph,
    root: NodeId,
    repl_to_host: &HashMap<NodeId, NodeId>,
) -> bool {
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        if repl_to_host.contains_key(&current) {
            return false;
        }
        stack.extend(repl.children(current));
    }
    true
}

fn record_subtree(
    repl: &ModelGraph,
    r: NodeId,
    host: &ModelGraph,
    h: NodeId,
    repl_to_host: &mut HashMap<NodeId, NodeId>,
    created: &mut Vec<NodeId>,
) {
    repl_to_host.insert(r, h);
    created.push(h);
    for &rc in repl.children(r) {
        if let Some(hc) = host.child_by_name(h, repl.node(rc).name) {
            record_subtree(repl, rc, host, hc, repl_to_host, created);
        }
    }
}

fn mirror_by_name(
    repl: &ModelGraph,
    r: NodeId,
    host: &ModelGraph,
    h: NodeId,
    repl_to_host: &mut HashMap<NodeId, NodeId>,
) {
    for &rc in repl.children(r) {
        if let Some(hc) = host.child_by_name(h, repl.node(rc).name) {
            repl_to_host.insert(rc, hc);
            mirror_by_name(repl, rc, host, hc, repl_to_host);
        }
    }
}

/// A single-node prototype (no children, no links).
fn single_proto(g: &ModelGraph, id: NodeId) -> NodeProto {
    let data = g.node(id);
    NodeProto {
        name: data.name,
        class: data.class,
        kind: data.kind.clone(),
        tags: TagSet::default(),
        ingredients: None,
        position: data.position,
        children: Vec::new(),
        links: Vec::new(),
    }
}

/// Drops rule-only baggage (tags, ingredient lists, value iterators) from a
/// prototype about to be instantiated in a host graph.
fn strip_rule_only(proto: &mut NodeProto) {
    proto.tags = TagSet::default();
    proto.ingredients = None;
    if let NodeKind::Composite(data) = &mut proto.kind {
        data.iterators.clear();
    }
    for child in &mut proto.children {
        strip_rule_only(child);
    }
}

fn fresh_name(g: &ModelGraph, parent: NodeId, base: &str) -> Name {
    let candidate: Name = base.into();
    if g.child_by_name(parent, candidate).is_none() {
        return candidate;
    }
    for i in 2.. {
        let candidate: Name = format!("{base}_{i}").into();
        if g.child_by_name(parent, candidate).is_none() {
            return candidate;
        }
    }
    unreachable!("some suffix is always free")
}

fn average_position(
    g: &ModelGraph,
    nodes: impl Iterator<Item = NodeId>,
) -> Option<(f64, f64)> {
    let mut sum = (0.0, 0.0);
    let mut count = 0usize;
    for node in nodes {
        if let Some((x, y)) = g.node(node).position {
            sum.0 += x;
            sum.1 += y;
            count += 1;
        }
    }
    if count == 0 {
        None
    } else {
        Some((sum.0 / count as f64, sum.1 / count as f64))
    }
}
