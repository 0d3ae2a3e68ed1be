use graft::{GraphMatcher, ModelGraph, NodeId, PortFlags};

/// Host with two entities, both carrying an output port.
fn two_candidate_host() -> (ModelGraph, NodeId, NodeId) {
    let mut host = ModelGraph::new("top");
    let x = host.add_atomic(host.root(), "x", "gen").unwrap();
    host.add_port(x, "p", PortFlags::output()).unwrap();
    let y = host.add_atomic(host.root(), "y", "gen").unwrap();
    host.add_port(y, "p", PortFlags::output()).unwrap();
    (host, x, y)
}

fn output_port_pattern() -> (ModelGraph, NodeId) {
    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    pattern.add_port(a, "p", PortFlags::output()).unwrap();
    (pattern, a)
}

#[test]
fn first_match_follows_declaration_order() {
    let (host, x, _y) = two_candidate_host();
    let (pattern, a) = output_port_pattern();
    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(x));
}

#[test]
fn continuing_enumerates_the_second_candidate() {
    let (host, x, y) = two_candidate_host();
    let (pattern, a) = output_port_pattern();
    let results = GraphMatcher::find_all(&pattern, &host);
    let bindings: Vec<_> = results.iter().filter_map(|r| r.get_node(a)).collect();
    assert_eq!(bindings[0], x);
    assert!(bindings.contains(&y));
}

#[test]
fn callback_controls_termination() {
    let (host, _, _) = two_candidate_host();
    let (pattern, _) = output_port_pattern();

    let mut seen = 0;
    let mut matcher = GraphMatcher::with_callback(&pattern, &host, |_| {
        seen += 1;
        true // stop at the first match
    });
    assert!(matcher.match_pattern());
    assert!(matcher.is_successful());
    assert_eq!(matcher.found_count(), 1);
    drop(matcher);
    assert_eq!(seen, 1);

    // an always-false callback sees everything but is "unsuccessful"
    let mut matcher = GraphMatcher::with_callback(&pattern, &host, |_| false);
    assert!(!matcher.match_pattern());
    assert!(!matcher.is_successful());
    assert!(matcher.found_count() >= 2);
}

#[test]
fn port_direction_is_respected() {
    let mut host = ModelGraph::new("top");
    let x = host.add_atomic(host.root(), "x", "gen").unwrap();
    host.add_port(x, "p", PortFlags::input()).unwrap();

    let (pattern, _) = output_port_pattern();
    assert!(GraphMatcher::find_first(&pattern, &host).is_none());
}

#[test]
fn completed_results_are_injective() {
    let (host, _, _) = two_candidate_host();
    let (pattern, _) = output_port_pattern();
    for result in GraphMatcher::find_all(&pattern, &host) {
        let mut hosts_seen = std::collections::HashSet::new();
        let mut patterns_seen = std::collections::HashSet::new();
        for (p, h) in result.iter() {
            assert!(patterns_seen.insert(p), "pattern element bound twice");
            assert!(hosts_seen.insert(h), "host element bound twice");
        }
    }
}

#[test]
fn pattern_matches_at_any_depth() {
    let mut host = ModelGraph::new("top");
    host.add_atomic(host.root(), "noise", "other").unwrap();
    let mid = host.add_composite(host.root(), "mid", "box").unwrap();
    let deep = host.add_composite(mid, "deep", "box").unwrap();
    let x = host.add_atomic(deep, "x", "gen").unwrap();
    host.add_port(x, "p", PortFlags::output()).unwrap();

    let (pattern, a) = output_port_pattern();
    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(x));
}

#[test]
fn class_constrains_candidates() {
    let (host, _x, y) = two_candidate_host();
    let mut host = host;
    host.set_class(y, "filter.lowpass");

    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "filter").unwrap();
    pattern.add_port(a, "p", PortFlags::output()).unwrap();

    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(y));
}

#[test]
fn criteria_prune_candidates() {
    let mut host = ModelGraph::new("top");
    let x = host.add_atomic(host.root(), "x", "gen").unwrap();
    host.add_attribute(x, "rate", graft::AttrValue::Int(8000))
        .unwrap();
    let y = host.add_atomic(host.root(), "y", "gen").unwrap();
    host.add_attribute(y, "rate", graft::AttrValue::Int(44100))
        .unwrap();

    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    pattern.set_ingredients(a, "criterion.attr:rate,44100");

    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(y));
}

#[test]
fn malformed_criteria_fail_closed() {
    let (host, _, _) = two_candidate_host();
    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    pattern.set_ingredients(a, "criterion.definitely_not_a_thing");

    // the node matches nothing, and validation reports the reason
    assert!(GraphMatcher::find_first(&pattern, &host).is_none());
    assert!(graft::ingredient::validate(&pattern).is_err());
}

#[test]
fn two_entity_pattern_binds_injectively() {
    let (host, x, y) = two_candidate_host();
    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    pattern.add_port(a, "p", PortFlags::output()).unwrap();
    let b = pattern.add_atomic(pattern.root(), "b", "*").unwrap();
    pattern.add_port(b, "p", PortFlags::output()).unwrap();

    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    let ha = result.get_node(a).unwrap();
    let hb = result.get_node(b).unwrap();
    assert_ne!(ha, hb);
    assert_eq!(result.get_node(a), Some(x));
    assert_eq!(result.get_node(b), Some(y));
}

#[test]
fn ignored_nodes_are_not_required() {
    let mut host = ModelGraph::new("top");
    let x = host.add_atomic(host.root(), "x", "gen").unwrap();
    host.add_port(x, "p", PortFlags::output()).unwrap();

    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    pattern.add_port(a, "p", PortFlags::output()).unwrap();
    // this one has no host counterpart, but it is ignored
    let ghost = pattern.add_atomic(pattern.root(), "ghost", "*").unwrap();
    pattern.set_tag(ghost, graft::Tag::Ignored);

    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(x));
    assert_eq!(result.get_node(ghost), None);
}
