//! The hierarchical attributed multigraph that patterns, replacements and
//! host graphs are all instances of.
//!
//! Nodes live in an arena and are addressed by [`NodeId`] handles. Containment
//! is an ordered tree (children keep declaration order); port/relation
//! connectivity is kept separately in an insertion-ordered adjacency store, so
//! that every enumeration the matcher performs is deterministic across runs.

use crate::interned_string_newtype;
use crate::util::InternString;
use derive_more::From;
use petgraph::graphmap::UnGraphMap;
use std::fmt;
use thiserror::Error;

pub mod dot;

/// Arena handle for a node of a [`ModelGraph`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Debug, From)]
#[debug("n{_0}")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

/// A node name, unique within its container.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Name(pub InternString);
interned_string_newtype!(Name);

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The (dotted) class of an entity, port or relation, e.g. `"filter.lowpass"`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityClass(pub InternString);
interned_string_newtype!(EntityClass);

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EntityClass {
    /// The wildcard class, compatible with any host class.
    pub fn any() -> Self {
        "*".into()
    }

    pub fn is_wildcard(&self) -> bool {
        &*self.0 == "*"
    }

    /// Whether `other` is the same class or lives in this class's namespace
    /// (`"filter"` accepts `"filter.lowpass"`).
    pub fn accepts(&self, other: &EntityClass) -> bool {
        if self.is_wildcard() || self == other {
            return true;
        }
        other.0.starts_with(&*self.0)
            && other.0.as_bytes().get(self.0.len()) == Some(&b'.')
    }
}

/// An attribute value, or a pattern-side predicate over one.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AttrValue {
    /// Pattern-only: matches any host value.
    Any,
    /// Pattern-only: matches the current binding of a value iterator.
    Param(Name),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(InternString),
}

impl AttrValue {
    pub fn str(s: impl Into<InternString>) -> Self {
        AttrValue::Str(s.into())
    }
}

/// Structural tags attached to pattern nodes. They do not affect the host
/// graph; the matcher and transformer interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Tag {
    Ignored,
    Negated,
    Optional,
    Preserved,
    Created,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TagSet {
    pub ignored: bool,
    pub negated: bool,
    pub optional: bool,
    pub preserved: bool,
    pub created: bool,
    /// Full (dotted) name of the corresponding node in the other graph of a
    /// rule (pattern side names a replacement node).
    pub corresponds_to: Option<InternString>,
}

impl TagSet {
    pub fn has(&self, tag: Tag) -> bool {
        match tag {
            Tag::Ignored => self.ignored,
            Tag::Negated => self.negated,
            Tag::Optional => self.optional,
            Tag::Preserved => self.preserved,
            Tag::Created => self.created,
        }
    }

    pub fn set(&mut self, tag: Tag) {
        match tag {
            Tag::Ignored => self.ignored = true,
            Tag::Negated => self.negated = true,
            Tag::Optional => self.optional = true,
            Tag::Preserved => self.preserved = true,
            Tag::Created => self.created = true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortFlags {
    pub input: bool,
    pub output: bool,
    pub multi: bool,
}

impl PortFlags {
    pub fn input() -> Self {
        PortFlags {
            input: true,
            ..Default::default()
        }
    }

    pub fn output() -> Self {
        PortFlags {
            output: true,
            ..Default::default()
        }
    }
}

/// A local executor attached to a composite. A composite with an executor is
/// opaque: it is matched as a single unit and its internals are hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutorSpec {
    pub class: EntityClass,
}

/// A pattern parameter owned by a composite: during matching, `param` is
/// bound to each of `values` in turn (cross-product over all iterators in
/// the pattern), and `$param` references in the pattern resolve to the
/// current binding.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueIterator {
    pub param: Name,
    pub values: Vec<AttrValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompositeData {
    /// Whether the composite may be flattened into its surroundings during
    /// matching. Off means the composite is opaque.
    pub flatten: bool,
    pub executor: Option<ExecutorSpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub iterators: Vec<ValueIterator>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeKind {
    Attribute { value: AttrValue },
    Port(PortFlags),
    Atomic,
    Composite(CompositeData),
    Relation { collapsible: bool },
}

impl NodeKind {
    pub fn is_entity(&self) -> bool {
        matches!(self, NodeKind::Atomic | NodeKind::Composite(_))
    }

    pub fn is_port(&self) -> bool {
        matches!(self, NodeKind::Port(_))
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, NodeKind::Relation { .. })
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self, NodeKind::Attribute { .. })
    }

    fn describe(&self) -> &'static str {
        match self {
            NodeKind::Attribute { .. } => "attribute",
            NodeKind::Port(_) => "port",
            NodeKind::Atomic => "atomic entity",
            NodeKind::Composite(_) => "composite entity",
            NodeKind::Relation { .. } => "relation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeData {
    pub name: Name,
    pub class: EntityClass,
    pub kind: NodeKind,
    pub tags: TagSet,
    /// Raw ingredient list (criteria and operations), parsed on demand.
    pub ingredients: Option<InternString>,
    /// Layout hint, carried through rewrites.
    pub position: Option<(f64, f64)>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl NodeData {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// A serializable prototype of a node subtree, used for snapshots of
/// preserved content and for the `CreateNode` edit description.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeProto {
    pub name: Name,
    pub class: EntityClass,
    pub kind: NodeKind,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tags: TagSet,
    pub ingredients: Option<String>,
    pub position: Option<(f64, f64)>,
    pub children: Vec<NodeProto>,
    /// Links whose both endpoints lie inside this subtree, as name paths
    /// relative to the subtree root (empty path = the root itself).
    pub links: Vec<(Vec<Name>, Vec<Name>)>,
}

impl NodeProto {
    pub fn leaf(name: impl Into<Name>, class: impl Into<EntityClass>, kind: NodeKind) -> Self {
        NodeProto {
            name: name.into(),
            class: class.into(),
            kind,
            tags: TagSet::default(),
            ingredients: None,
            position: None,
            children: Vec::new(),
            links: Vec::new(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("node {0:?} does not exist (removed or from another graph)")]
    NodeNotFound(NodeId),
    #[error("a child named `{name}` already exists in `{parent}`")]
    NameCollision { parent: String, name: Name },
    #[error("a {child} cannot be contained in a {parent}")]
    IllegalContainment {
        parent: &'static str,
        child: &'static str,
    },
    #[error("cannot link {0:?} and {1:?}: one endpoint must be a relation")]
    IllegalLink(NodeId, NodeId),
    #[error("{0:?} and {1:?} are not linked")]
    NotLinked(NodeId, NodeId),
    #[error("the root of a graph cannot be removed")]
    CannotRemoveRoot,
    #[error("node `{0}` has no attribute `{1}`")]
    NoSuchAttribute(String, Name),
    #[error("path `{0}` does not resolve to a node")]
    UnresolvedPath(String),
}

/// A hierarchical attributed multigraph.
///
/// Children keep declaration order and connectivity keeps link-insertion
/// order; candidate enumeration during matching follows these orders, which
/// makes match results reproducible for a given graph construction sequence.
#[derive(Clone)]
pub struct ModelGraph {
    slots: Vec<Option<NodeData>>,
    links: UnGraphMap<NodeId, ()>,
    root: NodeId,
}

impl ModelGraph {
    /// Creates a graph whose root is a composite with the given name.
    pub fn new(root_name: impl Into<Name>) -> Self {
        let root_data = NodeData {
            name: root_name.into(),
            class: EntityClass::any(),
            kind: NodeKind::Composite(CompositeData::default()),
            tags: TagSet::default(),
            ingredients: None,
            position: None,
            parent: None,
            children: Vec::new(),
        };
        ModelGraph {
            slots: vec![Some(root_data)],
            links: UnGraphMap::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    /// Panics if the id is stale. Use [`ModelGraph::try_node`] for fallible
    /// lookups at API boundaries.
    pub fn node(&self, id: NodeId) -> &NodeData {
        self.try_node(id).expect("stale node id")
    }

    pub fn try_node(&self, id: NodeId) -> Option<&NodeData> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
            .expect("stale node id")
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|data| (NodeId(i as u32), data)))
    }

    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    ///////////////////////////////////////////////////////////////////
    // construction

    fn insert(&mut self, parent: NodeId, data: NodeData) -> Result<NodeId, ModelError> {
        if !self.contains(parent) {
            return Err(ModelError::NodeNotFound(parent));
        }
        if self.child_by_name(parent, data.name).is_some() {
            return Err(ModelError::NameCollision {
                parent: self.full_name(parent),
                name: data.name,
            });
        }
        let parent_kind = &self.node(parent).kind;
        let ok = match &data.kind {
            NodeKind::Attribute { .. } => true,
            NodeKind::Port(_) => parent_kind.is_entity(),
            NodeKind::Atomic | NodeKind::Composite(_) | NodeKind::Relation { .. } => {
                matches!(parent_kind, NodeKind::Composite(_))
            }
        };
        if !ok {
            return Err(ModelError::IllegalContainment {
                parent: parent_kind.describe(),
                child: data.kind.describe(),
            });
        }
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(NodeData {
            parent: Some(parent),
            ..data
        }));
        self.node_mut(parent).children.push(id);
        Ok(id)
    }

    fn blank(name: Name, class: EntityClass, kind: NodeKind) -> NodeData {
        NodeData {
            name,
            class,
            kind,
            tags: TagSet::default(),
            ingredients: None,
            position: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn add_atomic(
        &mut self,
        parent: NodeId,
        name: impl Into<Name>,
        class: impl Into<EntityClass>,
    ) -> Result<NodeId, ModelError> {
        self.insert(
            parent,
            Self::blank(name.into(), class.into(), NodeKind::Atomic),
        )
    }

    /// Adds a composite entity. It starts opaque (flattening off, no
    /// executor); see [`ModelGraph::set_flatten`] and
    /// [`ModelGraph::set_executor`].
    pub fn add_composite(
        &mut self,
        parent: NodeId,
        name: impl Into<Name>,
        class: impl Into<EntityClass>,
    ) -> Result<NodeId, ModelError> {
        self.insert(
            parent,
            Self::blank(
                name.into(),
                class.into(),
                NodeKind::Composite(CompositeData::default()),
            ),
        )
    }

    pub fn add_port(
        &mut self,
        parent: NodeId,
        name: impl Into<Name>,
        flags: PortFlags,
    ) -> Result<NodeId, ModelError> {
        self.insert(
            parent,
            Self::blank(name.into(), EntityClass::any(), NodeKind::Port(flags)),
        )
    }

    pub fn add_relation(
        &mut self,
        parent: NodeId,
        name: impl Into<Name>,
    ) -> Result<NodeId, ModelError> {
        self.insert(
            parent,
            Self::blank(
                name.into(),
                EntityClass::any(),
                NodeKind::Relation { collapsible: true },
            ),
        )
    }

    pub fn add_attribute(
        &mut self,
        parent: NodeId,
        name: impl Into<Name>,
        value: AttrValue,
    ) -> Result<NodeId, ModelError> {
        self.insert(
            parent,
            Self::blank(
                name.into(),
                EntityClass::any(),
                NodeKind::Attribute { value },
            ),
        )
    }

    pub fn set_flatten(&mut self, id: NodeId, flatten: bool) {
        if let NodeKind::Composite(data) = &mut self.node_mut(id).kind {
            data.flatten = flatten;
        }
    }

    pub fn set_executor(&mut self, id: NodeId, executor: Option<ExecutorSpec>) {
        if let NodeKind::Composite(data) = &mut self.node_mut(id).kind {
            data.executor = executor;
        }
    }

    pub fn add_value_iterator(
        &mut self,
        id: NodeId,
        param: impl Into<Name>,
        values: Vec<AttrValue>,
    ) {
        if let NodeKind::Composite(data) = &mut self.node_mut(id).kind {
            data.iterators.push(ValueIterator {
                param: param.into(),
                values,
            });
        }
    }

    pub fn set_collapsible(&mut self, id: NodeId, value: bool) {
        if let NodeKind::Relation { collapsible } = &mut self.node_mut(id).kind {
            *collapsible = value;
        }
    }

    pub fn set_tag(&mut self, id: NodeId, tag: Tag) {
        self.node_mut(id).tags.set(tag);
    }

    pub fn set_corresponds_to(&mut self, id: NodeId, path: impl Into<InternString>) {
        self.node_mut(id).tags.corresponds_to = Some(path.into());
    }

    pub fn set_ingredients(&mut self, id: NodeId, src: impl Into<InternString>) {
        self.node_mut(id).ingredients = Some(src.into());
    }

    pub fn set_position(&mut self, id: NodeId, position: (f64, f64)) {
        self.node_mut(id).position = Some(position);
    }

    pub fn rename(&mut self, id: NodeId, name: impl Into<Name>) -> Result<(), ModelError> {
        let name = name.into();
        if let Some(parent) = self.node(id).parent {
            let existing = self.child_by_name(parent, name);
            if existing.is_some_and(|other| other != id) {
                return Err(ModelError::NameCollision {
                    parent: self.full_name(parent),
                    name,
                });
            }
        }
        self.node_mut(id).name = name;
        Ok(())
    }

    pub fn set_class(&mut self, id: NodeId, class: impl Into<EntityClass>) {
        self.node_mut(id).class = class.into();
    }

    /// Creates or overwrites the child attribute `name` of `node`.
    pub fn set_attribute(
        &mut self,
        node: NodeId,
        name: impl Into<Name>,
        value: AttrValue,
    ) -> Result<NodeId, ModelError> {
        let name = name.into();
        if let Some(existing) = self.child_by_name(node, name)
            && self.node(existing).kind.is_attribute()
        {
            self.node_mut(existing).kind = NodeKind::Attribute { value };
            return Ok(existing);
        }
        self.add_attribute(node, name, value)
    }

    pub fn attr_value(&self, node: NodeId, name: impl Into<Name>) -> Option<&AttrValue> {
        let name = name.into();
        let attr = self.child_by_name(node, name)?;
        match &self.node(attr).kind {
            NodeKind::Attribute { value } => Some(value),
            _ => None,
        }
    }

    pub fn remove_attribute(
        &mut self,
        node: NodeId,
        name: impl Into<Name>,
    ) -> Result<(), ModelError> {
        let name = name.into();
        let attr = self
            .child_by_name(node, name)
            .filter(|&id| self.node(id).kind.is_attribute())
            .ok_or_else(|| ModelError::NoSuchAttribute(self.full_name(node), name))?;
        self.remove_node(attr)
    }

    /// Removes a node and its whole subtree, including any links incident to
    /// removed nodes. Surviving siblings keep their relative order.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), ModelError> {
        if !self.contains(id) {
            return Err(ModelError::NodeNotFound(id));
        }
        if id == self.root {
            return Err(ModelError::CannotRemoveRoot);
        }
        let parent = self.node(id).parent.expect("non-root node has a parent");
        self.node_mut(parent).children.retain(|&child| child != id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let data = self.slots[current.0 as usize]
                .take()
                .expect("subtree nodes are alive");
            self.links.remove_node(current);
            stack.extend(data.children);
        }
        Ok(())
    }

    /// Moves `node` (with its subtree and links) under `new_parent`.
    pub fn reparent(&mut self, node: NodeId, new_parent: NodeId) -> Result<(), ModelError> {
        if node == self.root {
            return Err(ModelError::CannotRemoveRoot);
        }
        if self.child_by_name(new_parent, self.node(node).name).is_some() {
            return Err(ModelError::NameCollision {
                parent: self.full_name(new_parent),
                name: self.node(node).name,
            });
        }
        let old_parent = self.node(node).parent.expect("non-root node has a parent");
        self.node_mut(old_parent)
            .children
            .retain(|&child| child != node);
        self.node_mut(new_parent).children.push(node);
        self.node_mut(node).parent = Some(new_parent);
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // connectivity

    /// Links a port or relation to a relation. Linking twice is a no-op.
    pub fn link(&mut self, a: NodeId, b: NodeId) -> Result<(), ModelError> {
        if !self.contains(a) {
            return Err(ModelError::NodeNotFound(a));
        }
        if !self.contains(b) {
            return Err(ModelError::NodeNotFound(b));
        }
        let a_kind = &self.node(a).kind;
        let b_kind = &self.node(b).kind;
        let legal = (a_kind.is_relation() && (b_kind.is_port() || b_kind.is_relation()))
            || (b_kind.is_relation() && a_kind.is_port());
        if !legal {
            return Err(ModelError::IllegalLink(a, b));
        }
        self.links.add_edge(a, b, ());
        Ok(())
    }

    pub fn unlink(&mut self, a: NodeId, b: NodeId) -> Result<(), ModelError> {
        self.links
            .remove_edge(a, b)
            .ok_or(ModelError::NotLinked(a, b))?;
        Ok(())
    }

    pub fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.contains_edge(a, b)
    }

    /// Direct link neighbors, in link-insertion order.
    pub fn linked(&self, id: NodeId) -> Vec<NodeId> {
        if !self.links.contains_node(id) {
            return Vec::new();
        }
        self.links.neighbors(id).collect()
    }

    /// The transitive group of relations reachable from `rel` over
    /// relation-relation links, starting with `rel` itself.
    pub fn relation_group(&self, rel: NodeId) -> Vec<NodeId> {
        let mut group = vec![rel];
        let mut next = 0;
        while next < group.len() {
            let current = group[next];
            next += 1;
            for neighbor in self.linked(current) {
                if self.node(neighbor).kind.is_relation() && !group.contains(&neighbor) {
                    group.push(neighbor);
                }
            }
        }
        group
    }

    /// All ports linked to `rel` or to any relation in its group.
    pub fn linked_ports(&self, rel: NodeId) -> Vec<NodeId> {
        let mut ports = Vec::new();
        for member in self.relation_group(rel) {
            for neighbor in self.linked(member) {
                if self.node(neighbor).kind.is_port() && !ports.contains(&neighbor) {
                    ports.push(neighbor);
                }
            }
        }
        ports
    }

    /// Relations directly linked to a port, in link-insertion order.
    pub fn linked_relations(&self, port: NodeId) -> Vec<NodeId> {
        self.linked(port)
            .into_iter()
            .filter(|&n| self.node(n).kind.is_relation())
            .collect()
    }

    ///////////////////////////////////////////////////////////////////
    // traversal

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).children()
    }

    fn children_of_kind(&self, id: NodeId, pred: fn(&NodeKind) -> bool) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|&child| pred(&self.node(child).kind))
            .collect()
    }

    pub fn entities(&self, id: NodeId) -> Vec<NodeId> {
        self.children_of_kind(id, NodeKind::is_entity)
    }

    pub fn ports(&self, id: NodeId) -> Vec<NodeId> {
        self.children_of_kind(id, NodeKind::is_port)
    }

    pub fn relations(&self, id: NodeId) -> Vec<NodeId> {
        self.children_of_kind(id, NodeKind::is_relation)
    }

    pub fn attributes(&self, id: NodeId) -> Vec<NodeId> {
        self.children_of_kind(id, NodeKind::is_attribute)
    }

    pub fn child_by_name(&self, id: NodeId, name: impl Into<Name>) -> Option<NodeId> {
        let name = name.into();
        self.children(id)
            .iter()
            .copied()
            .find(|&child| self.node(child).name == name)
    }

    /// Ancestors of `id`, nearest first, ending with the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.node(id).parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.node(parent).parent;
        }
        out
    }

    /// Whether an entity hides its internals: atomic entities always do,
    /// composites do unless flattening is on and no executor is attached.
    pub fn is_opaque(&self, id: NodeId) -> bool {
        match &self.node(id).kind {
            NodeKind::Atomic => true,
            NodeKind::Composite(data) => !data.flatten || data.executor.is_some(),
            _ => false,
        }
    }

    /// All composite entities in the subtree rooted at `from` (preorder,
    /// `from` included if it is a composite), regardless of opacity.
    pub fn descendant_composites(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if matches!(self.node(current).kind, NodeKind::Composite(_)) {
                out.push(current);
            }
            for &child in self.children(current).iter().rev() {
                if self.node(child).kind.is_entity() {
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Dotted path of the node from the root, e.g. `"top.filter.out"`.
    pub fn full_name(&self, id: NodeId) -> String {
        let Some(data) = self.try_node(id) else {
            return format!("<stale {id:?}>");
        };
        let mut parts = vec![data.name.to_string()];
        for ancestor in self.ancestors(id) {
            parts.push(self.node(ancestor).name.to_string());
        }
        parts.reverse();
        parts.join(".")
    }

    /// Resolves a dotted path as produced by [`ModelGraph::full_name`]. The
    /// leading segment must name the root.
    pub fn resolve_path(&self, path: &str) -> Option<NodeId> {
        let mut segments = path.split('.');
        let root_name: Name = segments.next()?.into();
        if self.node(self.root).name != root_name {
            return None;
        }
        let mut current = self.root;
        for segment in segments {
            current = self.child_by_name(current, segment)?;
        }
        Some(current)
    }

    /// Path of `id` relative to `ancestor` (empty if `id == ancestor`).
    pub fn relative_path(&self, ancestor: NodeId, id: NodeId) -> Option<Vec<Name>> {
        let mut parts = Vec::new();
        let mut current = id;
        while current != ancestor {
            parts.push(self.node(current).name);
            current = self.node(current).parent?;
        }
        parts.reverse();
        Some(parts)
    }

    fn resolve_relative(&self, from: NodeId, path: &[Name]) -> Option<NodeId> {
        let mut current = from;
        for &segment in path {
            current = self.child_by_name(current, segment)?;
        }
        Some(current)
    }

    ///////////////////////////////////////////////////////////////////
    // snapshots

    /// Serializes the subtree rooted at `id`, including links that are fully
    /// internal to the subtree.
    pub fn snapshot(&self, id: NodeId) -> NodeProto {
        let mut proto = self.snapshot_nodes(id);
        let mut subtree = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            subtree.push(current);
            stack.extend(self.children(current));
        }
        for &a in &subtree {
            for b in self.linked(a) {
                if a < b && subtree.contains(&b) {
                    let pa = self.relative_path(id, a).expect("a is in the subtree");
                    let pb = self.relative_path(id, b).expect("b is in the subtree");
                    proto.links.push((pa, pb));
                }
            }
        }
        proto
    }

    fn snapshot_nodes(&self, id: NodeId) -> NodeProto {
        let data = self.node(id);
        NodeProto {
            name: data.name,
            class: data.class,
            kind: data.kind.clone(),
            tags: data.tags.clone(),
            ingredients: data.ingredients.map(|s| s.to_string()),
            position: data.position,
            children: self
                .children(id)
                .iter()
                .map(|&child| self.snapshot_nodes(child))
                .collect(),
            links: Vec::new(),
        }
    }

    /// Instantiates a prototype subtree under `parent` and returns the new
    /// subtree root. Fails on name collision or illegal containment without
    /// partially inserting the subtree.
    pub fn instantiate(
        &mut self,
        parent: NodeId,
        proto: &NodeProto,
    ) -> Result<NodeId, ModelError> {
        let watermark = self.slots.len();
        match self.instantiate_inner(parent, proto) {
            Ok(root) => Ok(root),
            Err(err) => {
                // Drop everything inserted by the failed attempt.
                let removed: Vec<NodeData> = self.slots.drain(watermark..).flatten().collect();
                let watermark = watermark as u32;
                for id in watermark..watermark + removed.len() as u32 {
                    self.links.remove_node(NodeId(id));
                }
                for data in removed {
                    if let Some(p) = data.parent
                        && p.0 < watermark
                    {
                        self.slots[p.0 as usize]
                            .as_mut()
                            .expect("parent is alive")
                            .children
                            .retain(|child| child.0 < watermark);
                    }
                }
                Err(err)
            }
        }
    }

    fn instantiate_inner(
        &mut self,
        parent: NodeId,
        proto: &NodeProto,
    ) -> Result<NodeId, ModelError> {
        let root = self.instantiate_node(parent, proto)?;
        for (pa, pb) in &proto.links {
            let a = self
                .resolve_relative(root, pa)
                .ok_or_else(|| ModelError::UnresolvedPath(join_path(pa)))?;
            let b = self
                .resolve_relative(root, pb)
                .ok_or_else(|| ModelError::UnresolvedPath(join_path(pb)))?;
            self.link(a, b)?;
        }
        Ok(root)
    }

    fn instantiate_node(
        &mut self,
        parent: NodeId,
        proto: &NodeProto,
    ) -> Result<NodeId, ModelError> {
        let mut data = Self::blank(proto.name, proto.class, proto.kind.clone());
        data.tags = proto.tags.clone();
        data.ingredients = proto.ingredients.as_ref().map(|s| s.clone().into());
        data.position = proto.position;
        let id = self.insert(parent, data)?;
        for child in &proto.children {
            self.instantiate_node(id, child)?;
        }
        Ok(id)
    }
}

fn join_path(path: &[Name]) -> String {
    path.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

impl fmt::Debug for ModelGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelGraph({} nodes)", self.node_count())
    }
}
