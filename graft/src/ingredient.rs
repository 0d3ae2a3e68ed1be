//! Criteria and operations attached to pattern and replacement nodes.
//!
//! Both are carried as a compact textual ingredient list on the node (e.g.
//! `"criterion.input; criterion.subclass:filter; operation.rename:gain2"`)
//! and parsed on demand. An unparsable list makes the owning node's criteria
//! check fail closed: the node matches nothing. [`crate::Rule::validate`]
//! reports the same parse errors eagerly, before any search.

use crate::model::{AttrValue, EntityClass, ModelGraph, Name, NodeId, NodeKind};
use std::collections::HashMap;
use thiserror::Error;

/// A typed predicate a host candidate must satisfy.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Criterion {
    PortIsInput,
    PortIsOutput,
    PortIsMulti,
    SubclassOf(EntityClass),
    AttributeEquals(Name, AttrValue),
    AttributeDefined(Name),
}

/// A typed edit applied to the host counterpart of a replacement node.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RewriteOp {
    Rename(Name),
    Retype(EntityClass),
    SetAttribute(Name, AttrValue),
    RemoveAttribute(Name),
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ingredients {
    pub criteria: Vec<Criterion>,
    pub operations: Vec<RewriteOp>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngredientParseError {
    #[error("unknown ingredient `{0}`")]
    UnknownIngredient(String),
    #[error("ingredient `{0}` expects {1} argument(s)")]
    ArgumentCount(String, usize),
}

/// Parses an ingredient list. Entries are `;`-separated, each
/// `criterion.<name>[:<args>]` or `operation.<name>[:<args>]` with
/// `,`-separated arguments.
pub fn parse(src: &str) -> Result<Ingredients, IngredientParseError> {
    let mut ingredients = Ingredients::default();
    for entry in src.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (head, args) = match entry.split_once(':') {
            Some((head, args)) => (
                head.trim(),
                args.split(',').map(str::trim).collect::<Vec<_>>(),
            ),
            None => (entry, Vec::new()),
        };
        if let Some(name) = head.strip_prefix("criterion.") {
            ingredients.criteria.push(parse_criterion(name, &args)?);
        } else if let Some(name) = head.strip_prefix("operation.") {
            ingredients.operations.push(parse_operation(name, &args)?);
        } else {
            return Err(IngredientParseError::UnknownIngredient(entry.to_string()));
        }
    }
    Ok(ingredients)
}

/// Parses the ingredient list of a node, empty if it has none.
pub fn parse_of(g: &ModelGraph, node: NodeId) -> Result<Ingredients, IngredientParseError> {
    match &g.node(node).ingredients {
        Some(src) => parse(src),
        None => Ok(Ingredients::default()),
    }
}

/// A node whose ingredient list failed to parse, reported eagerly before a
/// search or transform touches the graph.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("node `{node}` has a malformed ingredient list: {source}")]
pub struct MalformedPattern {
    pub node: String,
    #[source]
    pub source: IngredientParseError,
}

/// Checks every ingredient list in the graph. During a search the same
/// errors fail closed instead; this surfaces them up front.
pub fn validate(g: &ModelGraph) -> Result<(), MalformedPattern> {
    for (id, data) in g.nodes() {
        if data.ingredients.is_some() {
            parse_of(g, id).map_err(|source| MalformedPattern {
                node: g.full_name(id),
                source,
            })?;
        }
    }
    Ok(())
}

fn expect_args(
    name: &str,
    args: &[&str],
    count: usize,
) -> Result<(), IngredientParseError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(IngredientParseError::ArgumentCount(name.to_string(), count))
    }
}

fn parse_criterion(name: &str, args: &[&str]) -> Result<Criterion, IngredientParseError> {
    match name {
        "input" => {
            expect_args(name, args, 0)?;
            Ok(Criterion::PortIsInput)
        }
        "output" => {
            expect_args(name, args, 0)?;
            Ok(Criterion::PortIsOutput)
        }
        "multi" => {
            expect_args(name, args, 0)?;
            Ok(Criterion::PortIsMulti)
        }
        "subclass" => {
            expect_args(name, args, 1)?;
            Ok(Criterion::SubclassOf(args[0].into()))
        }
        "attr" => {
            expect_args(name, args, 2)?;
            Ok(Criterion::AttributeEquals(
                args[0].into(),
                parse_value(args[1]),
            ))
        }
        "defined" => {
            expect_args(name, args, 1)?;
            Ok(Criterion::AttributeDefined(args[0].into()))
        }
        other => Err(IngredientParseError::UnknownIngredient(format!(
            "criterion.{other}"
        ))),
    }
}

fn parse_operation(name: &str, args: &[&str]) -> Result<RewriteOp, IngredientParseError> {
    match name {
        "rename" => {
            expect_args(name, args, 1)?;
            Ok(RewriteOp::Rename(args[0].into()))
        }
        "retype" => {
            expect_args(name, args, 1)?;
            Ok(RewriteOp::Retype(args[0].into()))
        }
        "set" => {
            expect_args(name, args, 2)?;
            Ok(RewriteOp::SetAttribute(args[0].into(), parse_value(args[1])))
        }
        "unset" => {
            expect_args(name, args, 1)?;
            Ok(RewriteOp::RemoveAttribute(args[0].into()))
        }
        other => Err(IngredientParseError::UnknownIngredient(format!(
            "operation.{other}"
        ))),
    }
}

/// `*` is the wildcard, `$name` a value-iterator reference, then bool, int,
/// float, and finally a bare string.
pub fn parse_value(src: &str) -> AttrValue {
    if src == "*" {
        return AttrValue::Any;
    }
    if let Some(param) = src.strip_prefix('$') {
        return AttrValue::Param(param.into());
    }
    if let Ok(b) = src.parse::<bool>() {
        return AttrValue::Bool(b);
    }
    if let Ok(i) = src.parse::<i64>() {
        return AttrValue::Int(i);
    }
    if let Ok(f) = src.parse::<f64>() {
        return AttrValue::Float(f);
    }
    AttrValue::Str(src.to_string().into())
}

/// Whether a pattern-side value accepts a host value, under the current
/// value-iterator bindings.
pub fn values_match(
    pattern: &AttrValue,
    host: &AttrValue,
    params: &HashMap<Name, AttrValue>,
) -> bool {
    match pattern {
        AttrValue::Any => true,
        AttrValue::Param(name) => params.get(name).is_some_and(|bound| bound == host),
        literal => literal == host,
    }
}

impl Criterion {
    /// Evaluates the criterion against a host node. Criteria over the wrong
    /// node kind fail closed rather than erroring, so arbitrary user-supplied
    /// lists cannot derail a search.
    pub fn is_satisfied(
        &self,
        host: &ModelGraph,
        node: NodeId,
        params: &HashMap<Name, AttrValue>,
    ) -> bool {
        match self {
            Criterion::PortIsInput => port_flag(host, node, |f| f.input),
            Criterion::PortIsOutput => port_flag(host, node, |f| f.output),
            Criterion::PortIsMulti => port_flag(host, node, |f| f.multi),
            Criterion::SubclassOf(class) => class.accepts(&host.node(node).class),
            Criterion::AttributeEquals(name, value) => host
                .attr_value(node, *name)
                .is_some_and(|host_value| values_match(value, host_value, params)),
            Criterion::AttributeDefined(name) => host.attr_value(node, *name).is_some(),
        }
    }
}

fn port_flag(
    host: &ModelGraph,
    node: NodeId,
    flag: fn(&crate::model::PortFlags) -> bool,
) -> bool {
    match &host.node(node).kind {
        NodeKind::Port(flags) => flag(flags),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PortFlags;

    #[test]
    fn parses_mixed_list() {
        let ingredients = parse(
            "criterion.input; criterion.subclass:filter; operation.rename:gain2; operation.set:rate,44100",
        )
        .unwrap();
        assert_eq!(
            ingredients.criteria,
            vec![
                Criterion::PortIsInput,
                Criterion::SubclassOf("filter".into())
            ]
        );
        assert_eq!(
            ingredients.operations,
            vec![
                RewriteOp::Rename("gain2".into()),
                RewriteOp::SetAttribute("rate".into(), AttrValue::Int(44100)),
            ]
        );
    }

    #[test]
    fn trailing_separator_ok() {
        let ingredients = parse("criterion.output;").unwrap();
        assert_eq!(ingredients.criteria, vec![Criterion::PortIsOutput]);
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(matches!(
            parse("criterion.bogus"),
            Err(IngredientParseError::UnknownIngredient(_))
        ));
        assert!(matches!(
            parse("frobnicate"),
            Err(IngredientParseError::UnknownIngredient(_))
        ));
        assert!(matches!(
            parse("criterion.subclass"),
            Err(IngredientParseError::ArgumentCount(_, 1))
        ));
    }

    #[test]
    fn value_forms() {
        assert_eq!(parse_value("*"), AttrValue::Any);
        assert_eq!(parse_value("$rate"), AttrValue::Param("rate".into()));
        assert_eq!(parse_value("true"), AttrValue::Bool(true));
        assert_eq!(parse_value("3"), AttrValue::Int(3));
        assert_eq!(parse_value("3.5"), AttrValue::Float(3.5));
        assert_eq!(parse_value("hello"), AttrValue::str("hello"));
    }

    #[test]
    fn criteria_fail_closed_on_wrong_kind() {
        let mut g = ModelGraph::new("top");
        let a = g.add_atomic(g.root(), "a", "src").unwrap();
        let params = HashMap::new();
        // a port criterion on an entity is simply unsatisfied
        assert!(!Criterion::PortIsInput.is_satisfied(&g, a, &params));
        let p = g.add_port(a, "in", PortFlags::input()).unwrap();
        assert!(Criterion::PortIsInput.is_satisfied(&g, p, &params));
        assert!(!Criterion::PortIsOutput.is_satisfied(&g, p, &params));
    }

    #[test]
    fn attribute_criteria() {
        let mut g = ModelGraph::new("top");
        let a = g.add_atomic(g.root(), "a", "src").unwrap();
        g.add_attribute(a, "rate", AttrValue::Int(8000)).unwrap();
        let params = HashMap::new();
        assert!(
            Criterion::AttributeEquals("rate".into(), AttrValue::Int(8000))
                .is_satisfied(&g, a, &params)
        );
        assert!(
            !Criterion::AttributeEquals("rate".into(), AttrValue::Int(44100))
                .is_satisfied(&g, a, &params)
        );
        assert!(Criterion::AttributeDefined("rate".into()).is_satisfied(&g, a, &params));
        assert!(!Criterion::AttributeDefined("gain".into()).is_satisfied(&g, a, &params));

        let mut params = HashMap::new();
        params.insert(Name::from("r"), AttrValue::Int(8000));
        assert!(
            Criterion::AttributeEquals("rate".into(), AttrValue::Param("r".into()))
                .is_satisfied(&g, a, &params)
        );
    }
}
