//! Serializable descriptions of host-graph mutations.
//!
//! The transformer never touches the host directly; every mutation is a
//! [`GraphEdit`] routed through [`EditLog::apply`], which records the edit on
//! success. The log is serializable, so a sequence of edits can be persisted,
//! replayed against another copy of the graph, or wrapped in a caller-side
//! transaction.

use crate::model::{
    AttrValue, EntityClass, ModelError, ModelGraph, Name, NodeId, NodeProto,
};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GraphEdit {
    /// Instantiate a subtree under `parent`; returns the new subtree root.
    CreateNode { parent: NodeId, proto: NodeProto },
    /// Delete a node and its subtree.
    DeleteNode { node: NodeId },
    Link { a: NodeId, b: NodeId },
    Unlink { a: NodeId, b: NodeId },
    SetAttribute {
        node: NodeId,
        name: Name,
        value: AttrValue,
    },
    RemoveAttribute { node: NodeId, name: Name },
    Rename { node: NodeId, name: Name },
    Retype { node: NodeId, class: EntityClass },
    SetPosition { node: NodeId, position: (f64, f64) },
    /// Move a subtree under a new parent, keeping links.
    Reparent { node: NodeId, new_parent: NodeId },
}

/// Applies edits to a graph and keeps the ordered log of those that took
/// effect. A rejected edit is not recorded.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EditLog {
    edits: Vec<GraphEdit>,
}

impl EditLog {
    pub fn new() -> Self {
        EditLog::default()
    }

    pub fn edits(&self) -> &[GraphEdit] {
        &self.edits
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Applies one edit. Returns the created subtree root for
    /// [`GraphEdit::CreateNode`], `None` otherwise.
    pub fn apply(
        &mut self,
        g: &mut ModelGraph,
        edit: GraphEdit,
    ) -> Result<Option<NodeId>, ModelError> {
        let created = match &edit {
            GraphEdit::CreateNode { parent, proto } => Some(g.instantiate(*parent, proto)?),
            GraphEdit::DeleteNode { node } => {
                g.remove_node(*node)?;
                None
            }
            GraphEdit::Link { a, b } => {
                g.link(*a, *b)?;
                None
            }
            GraphEdit::Unlink { a, b } => {
                g.unlink(*a, *b)?;
                None
            }
            GraphEdit::SetAttribute { node, name, value } => {
                g.set_attribute(*node, *name, value.clone())?;
                None
            }
            GraphEdit::RemoveAttribute { node, name } => {
                g.remove_attribute(*node, *name)?;
                None
            }
            GraphEdit::Rename { node, name } => {
                g.rename(*node, *name)?;
                None
            }
            GraphEdit::Retype { node, class } => {
                if !g.contains(*node) {
                    return Err(ModelError::NodeNotFound(*node));
                }
                g.set_class(*node, *class);
                None
            }
            GraphEdit::SetPosition { node, position } => {
                if !g.contains(*node) {
                    return Err(ModelError::NodeNotFound(*node));
                }
                g.set_position(*node, *position);
                None
            }
            GraphEdit::Reparent { node, new_parent } => {
                g.reparent(*node, *new_parent)?;
                None
            }
        };
        self.edits.push(edit);
        Ok(created)
    }
}

impl IntoIterator for EditLog {
    type Item = GraphEdit;
    type IntoIter = std::vec::IntoIter<GraphEdit>;

    fn into_iter(self) -> Self::IntoIter {
        self.edits.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeKind, PortFlags};

    #[test]
    fn rejected_edits_are_not_recorded() {
        let mut g = ModelGraph::new("top");
        let a = g.add_atomic(g.root(), "a", "x").unwrap();
        let mut log = EditLog::new();
        log.apply(
            &mut g,
            GraphEdit::SetAttribute {
                node: a,
                name: "rate".into(),
                value: AttrValue::Int(1),
            },
        )
        .unwrap();
        let root = g.root();
        let err = log.apply(
            &mut g,
            GraphEdit::Rename {
                node: root,
                name: "a".into(),
            },
        );
        assert!(err.is_ok()); // root has no siblings, rename is fine
        let err = log.apply(
            &mut g,
            GraphEdit::RemoveAttribute {
                node: a,
                name: "missing".into(),
            },
        );
        assert!(err.is_err());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn create_returns_subtree_root() {
        let mut g = ModelGraph::new("top");
        let mut proto = NodeProto::leaf("b", "sink", NodeKind::Atomic);
        proto
            .children
            .push(NodeProto::leaf("in", "*", NodeKind::Port(PortFlags::input())));
        let mut log = EditLog::new();
        let root = g.root();
        let b = log
            .apply(
                &mut g,
                GraphEdit::CreateNode {
                    parent: root,
                    proto,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(g.full_name(b), "top.b");
        assert!(g.child_by_name(b, "in").is_some());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn log_round_trips_through_json() {
        let mut g = ModelGraph::new("top");
        let a = g.add_atomic(g.root(), "a", "x").unwrap();
        let mut log = EditLog::new();
        log.apply(
            &mut g,
            GraphEdit::SetAttribute {
                node: a,
                name: "rate".into(),
                value: AttrValue::Int(44100),
            },
        )
        .unwrap();
        log.apply(&mut g, GraphEdit::Rename { node: a, name: "b".into() })
            .unwrap();

        let json = serde_json::to_string(&log).unwrap();
        let restored: EditLog = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.edits(), log.edits());

        // replaying against a fresh copy reproduces the mutations
        let mut replica = ModelGraph::new("top");
        let ra = replica.add_atomic(replica.root(), "a", "x").unwrap();
        assert_eq!(ra, a);
        let mut replay = EditLog::new();
        for edit in restored {
            replay.apply(&mut replica, edit).unwrap();
        }
        assert_eq!(replica.attr_value(ra, "rate"), Some(&AttrValue::Int(44100)));
        assert_eq!(replica.node(ra).name, "b".into());
    }
}
