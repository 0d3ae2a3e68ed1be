//! Matching against generated hosts: results must be deterministic for a
//! given construction sequence, and the search must stay robust on denser
//! graphs than the hand-built fixtures.

use graft::{GraphMatcher, ModelGraph, NodeId, PortFlags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_host(seed: u64, entities: usize, wires: usize) -> ModelGraph {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut host = ModelGraph::new("top");
    let mut outs = Vec::new();
    let mut ins = Vec::new();
    for i in 0..entities {
        let e = host
            .add_atomic(host.root(), format!("e{i}"), "gen")
            .unwrap();
        outs.push(host.add_port(e, "out", PortFlags::output()).unwrap());
        ins.push(host.add_port(e, "in", PortFlags::input()).unwrap());
    }
    for w in 0..wires {
        let r = host.add_relation(host.root(), format!("r{w}")).unwrap();
        let from = outs[rng.random_range(0..outs.len())];
        let to = ins[rng.random_range(0..ins.len())];
        host.link(from, r).unwrap();
        host.link(to, r).unwrap();
    }
    host
}

fn chain_pattern() -> (ModelGraph, NodeId, NodeId) {
    let mut pattern = ModelGraph::new("lhs");
    let a = pattern.add_atomic(pattern.root(), "a", "*").unwrap();
    let out = pattern.add_port(a, "out", PortFlags::output()).unwrap();
    let b = pattern.add_atomic(pattern.root(), "b", "*").unwrap();
    let inp = pattern.add_port(b, "in", PortFlags::input()).unwrap();
    let r = pattern.add_relation(pattern.root(), "r").unwrap();
    pattern.link(out, r).unwrap();
    pattern.link(inp, r).unwrap();
    (pattern, a, b)
}

#[test_log::test]
fn results_are_reproducible() {
    let (pattern, a, b) = chain_pattern();
    for seed in 0..4 {
        let host1 = random_host(seed, 12, 18);
        let host2 = random_host(seed, 12, 18);
        let r1 = GraphMatcher::find_first(&pattern, &host1);
        let r2 = GraphMatcher::find_first(&pattern, &host2);
        match (r1, r2) {
            (Some(m1), Some(m2)) => {
                assert_eq!(m1.get_node(a), m2.get_node(a), "seed {seed}");
                assert_eq!(m1.get_node(b), m2.get_node(b), "seed {seed}");
            }
            (None, None) => {}
            _ => panic!("seed {seed}: one run matched, the other did not"),
        }
    }
}

#[test_log::test]
fn denser_hosts_still_terminate() {
    let (pattern, a, b) = chain_pattern();
    let host = random_host(7, 20, 60);
    if let Some(result) = GraphMatcher::find_first(&pattern, &host) {
        let ha = result.get_node(a).unwrap();
        let hb = result.get_node(b).unwrap();
        // the reported edge really exists in the host
        let out = host.child_by_name(ha, "out").unwrap();
        let inp = host.child_by_name(hb, "in").unwrap();
        let connected = host
            .linked_relations(out)
            .iter()
            .any(|&rel| host.linked_ports(rel).contains(&inp));
        assert!(connected, "match reported a non-existent connection");
    }
}

#[test]
fn every_reported_match_is_an_embedding() {
    let (pattern, a, b) = chain_pattern();
    let host = random_host(3, 8, 12);
    for result in GraphMatcher::find_all(&pattern, &host) {
        let ha = result.get_node(a).unwrap();
        let hb = result.get_node(b).unwrap();
        assert_ne!(ha, hb);
        let out = host.child_by_name(ha, "out").unwrap();
        let inp = host.child_by_name(hb, "in").unwrap();
        let connected = host
            .linked_relations(out)
            .iter()
            .any(|&rel| host.linked_ports(rel).contains(&inp));
        assert!(connected);
    }
}
