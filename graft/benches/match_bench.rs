use criterion::{Criterion, criterion_group, criterion_main};
use graft::{GraphMatcher, ModelGraph, NodeId, PortFlags};

/// A linear pipeline: e0.out -- r0 -- e1.in, e1.out -- r1 -- e2.in, ...
fn chain_host(n: usize) -> ModelGraph {
    let mut host = ModelGraph::new("top");
    let mut previous: Option<NodeId> = None;
    for i in 0..n {
        let e = host
            .add_atomic(host.root(), format!("e{i}"), "stage")
            .unwrap();
        let inp = host.add_port(e, "in", PortFlags::input()).unwrap();
        let out = host.add_port(e, "out", PortFlags::output()).unwrap();
        if let Some(prev_out) = previous {
            let r = host.add_relation(host.root(), format!("r{i}")).unwrap();
            host.link(prev_out, r).unwrap();
            host.link(inp, r).unwrap();
        }
        previous = Some(out);
    }
    host
}

fn chain_pattern(n: usize) -> ModelGraph {
    let mut pattern = ModelGraph::new("lhs");
    let mut previous: Option<NodeId> = None;
    for i in 0..n {
        let e = pattern
            .add_atomic(pattern.root(), format!("p{i}"), "stage")
            .unwrap();
        let inp = pattern.add_port(e, "in", PortFlags::input()).unwrap();
        let out = pattern.add_port(e, "out", PortFlags::output()).unwrap();
        if let Some(prev_out) = previous {
            let r = pattern.add_relation(pattern.root(), format!("r{i}")).unwrap();
            pattern.link(prev_out, r).unwrap();
            pattern.link(inp, r).unwrap();
        }
        previous = Some(out);
    }
    pattern
}

fn bench_chain_match(c: &mut Criterion) {
    let host = chain_host(50);
    let pattern = chain_pattern(3);
    c.bench_function("match_3_chain_in_50_chain", |b| {
        b.iter(|| GraphMatcher::find_first(&pattern, &host))
    });

    let pattern = chain_pattern(8);
    c.bench_function("match_8_chain_in_50_chain", |b| {
        b.iter(|| GraphMatcher::find_first(&pattern, &host))
    });
}

criterion_group!(benches, bench_chain_match);
criterion_main!(benches);
