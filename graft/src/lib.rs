//! Graft is a pattern matching and rewriting engine for hierarchical
//! attributed graphs.
//!
//! A *pattern* graph (ordinary graph nodes annotated with tags, criteria and
//! parameters) is embedded into a subgraph of a *host* graph by a recursive
//! backtracking search ([`GraphMatcher`]); the resulting [`MatchResult`] is
//! an injective, insertion-ordered map from pattern elements to host
//! elements. A [`Rule`] pairs the pattern with a *replacement* graph, and the
//! [`GraphTransformer`] turns one match into a concrete, logged sequence of
//! host edits: create, delete, relink, shallow-flatten.
//!
//! ```
//! use graft::{GraphMatcher, ModelGraph, PortFlags};
//!
//! // host: a source wired to a sink
//! let mut host = ModelGraph::new("top");
//! let src = host.add_atomic(host.root(), "src", "gen").unwrap();
//! let snk = host.add_atomic(host.root(), "snk", "print").unwrap();
//! let out = host.add_port(src, "out", PortFlags::output()).unwrap();
//! let inp = host.add_port(snk, "in", PortFlags::input()).unwrap();
//! let wire = host.add_relation(host.root(), "wire").unwrap();
//! host.link(out, wire).unwrap();
//! host.link(inp, wire).unwrap();
//!
//! // pattern: any entity with an output port
//! let mut pattern = ModelGraph::new("lhs");
//! let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
//! let p = pattern.add_port(a, "p", PortFlags::output()).unwrap();
//!
//! let result = GraphMatcher::find_first(&pattern, &host).unwrap();
//! assert_eq!(result.get_node(a), Some(src));
//! ```
//!
//! Matching holds only a shared borrow of the host, transforming an exclusive
//! one, so the borrow checker enforces the reader/writer discipline the
//! engine needs; there is no internal locking or parallelism.

pub mod analyzer;
pub mod edit;
pub mod ingredient;
pub mod match_state;
pub mod matcher;
pub mod model;
pub mod transformer;
pub mod util;

pub use edit::{EditLog, GraphEdit};
pub use ingredient::{
    Criterion, IngredientParseError, Ingredients, MalformedPattern, RewriteOp,
};
pub use match_state::{Checkpoint, MatchKey, MatchResult, MatchState, PathId};
pub use matcher::GraphMatcher;
pub use model::dot::DotCollector;
pub use model::{
    AttrValue, CompositeData, EntityClass, ExecutorSpec, ModelError, ModelGraph, Name, NodeId,
    NodeKind, NodeProto, PortFlags, Tag, TagSet, ValueIterator,
};
pub use transformer::{
    GraphTransformer, Rule, TransformError, TransformReport, TransformResult,
};
pub use util::InternString;
