use graft::{AttrValue, GraphMatcher, ModelGraph, NodeId};

fn host_with_rate(rate: i64) -> (ModelGraph, NodeId) {
    let mut host = ModelGraph::new("top");
    let x = host.add_atomic(host.root(), "x", "gen").unwrap();
    host.add_attribute(x, "rate", AttrValue::Int(rate)).unwrap();
    (host, x)
}

/// Pattern whose entity requires `rate == $rate`, with `$rate` enumerated
/// over the given values.
fn rate_pattern(values: Vec<AttrValue>) -> (ModelGraph, NodeId) {
    let mut pattern = ModelGraph::new("lhs");
    pattern.add_value_iterator(pattern.root(), "rate", values);
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    pattern.set_ingredients(a, "criterion.attr:rate,$rate");
    (pattern, a)
}

#[test]
fn parameter_is_enumerated_until_a_value_fits() {
    let (host, x) = host_with_rate(44100);
    let (pattern, a) = rate_pattern(vec![AttrValue::Int(8000), AttrValue::Int(44100)]);
    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(x));
}

#[test]
fn no_value_fits_means_no_match() {
    let (host, _) = host_with_rate(11025);
    let (pattern, _) = rate_pattern(vec![AttrValue::Int(8000), AttrValue::Int(44100)]);
    assert!(GraphMatcher::find_first(&pattern, &host).is_none());
}

#[test]
fn empty_iterator_matches_nothing() {
    let (host, _) = host_with_rate(8000);
    let (pattern, _) = rate_pattern(Vec::new());
    assert!(GraphMatcher::find_first(&pattern, &host).is_none());
}

#[test]
fn cross_product_over_two_iterators() {
    let mut host = ModelGraph::new("top");
    let x = host.add_atomic(host.root(), "x", "gen").unwrap();
    host.add_attribute(x, "rate", AttrValue::Int(2)).unwrap();
    let y = host.add_atomic(host.root(), "y", "sink").unwrap();
    host.add_attribute(y, "depth", AttrValue::Int(1)).unwrap();

    let mut pattern = ModelGraph::new("lhs");
    pattern.add_value_iterator(
        pattern.root(),
        "r",
        vec![AttrValue::Int(1), AttrValue::Int(2)],
    );
    pattern.add_value_iterator(
        pattern.root(),
        "d",
        vec![AttrValue::Int(1), AttrValue::Int(2)],
    );
    let a = pattern.add_atomic(pattern.root(), "a", "gen").unwrap();
    pattern.set_ingredients(a, "criterion.attr:rate,$r");
    let b = pattern.add_atomic(pattern.root(), "b", "sink").unwrap();
    pattern.set_ingredients(b, "criterion.attr:depth,$d");

    // only the (r=2, d=1) combination satisfies both criteria
    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(x));
    assert_eq!(result.get_node(b), Some(y));
}

#[test]
fn iterator_on_a_nested_composite_is_seen() {
    let mut host = ModelGraph::new("top");
    let c = host.add_composite(host.root(), "c", "box").unwrap();
    let x = host.add_atomic(c, "x", "gen").unwrap();
    host.add_attribute(x, "rate", AttrValue::Int(16)).unwrap();

    let mut pattern = ModelGraph::new("lhs");
    let pc = pattern.add_composite(pattern.root(), "c", "box").unwrap();
    pattern.add_value_iterator(pc, "rate", vec![AttrValue::Int(8), AttrValue::Int(16)]);
    let a = pattern.add_atomic(pc, "x", "gen").unwrap();
    pattern.set_ingredients(a, "criterion.attr:rate,$rate");

    let result = GraphMatcher::find_first(&pattern, &host).unwrap();
    assert_eq!(result.get_node(a), Some(x));
}
