//! Benchmarks for flow graph construction.
//!
//! - A loop with a local carried around the back edge
//! - A chain of diamonds, with and without the optional passes
//! - Dominance queries on the chain

extern crate dotsym;

use criterion::{criterion_group, criterion_main, Criterion};
use dotsym::{
    assembly::{decode_operations, MethodBody},
    cdfg::{build, ControlFlowQueries, GraphOptions},
    host::{MethodContext, MethodSignature, SimpleHost, TypeRef},
    token::Token,
};
use std::hint::black_box;

fn body(code: Vec<u8>) -> MethodBody {
    MethodBody {
        max_stack: 8,
        local_signature_token: Token(0),
        init_locals: false,
        code,
        exception_handlers: Vec::new(),
    }
}

fn context() -> MethodContext {
    MethodContext::new(
        Token(0x0600_0001),
        MethodSignature::new(TypeRef::Void, vec![TypeRef::Boolean]),
        vec![TypeRef::I32],
    )
}

/// ldc.i4.0; stloc.0; L: ldloc.0; ldc.i4.1; add; dup; stloc.0; ldc.i4.s 10; blt.s L; ret
fn counting_loop() -> MethodBody {
    body(vec![
        0x16, 0x0A, 0x06, 0x17, 0x58, 0x25, 0x0A, 0x1F, 0x0A, 0x32, 0xF7, 0x2A,
    ])
}

/// 32 times: ldarg.0; brtrue.s T; ldc.i4.0; br.s J; T: ldc.i4.1; J: stloc.0; then ret
fn diamonds() -> MethodBody {
    let mut code = Vec::new();
    for _ in 0..32 {
        code.extend([0x02, 0x2D, 0x03, 0x16, 0x2B, 0x01, 0x17, 0x0A]);
    }
    code.push(0x2A);
    body(code)
}

fn bench_loop(c: &mut Criterion) {
    let body = counting_loop();
    let operations = decode_operations(&body.code).unwrap();
    let context = context();
    let host = SimpleHost::new();

    c.bench_function("cdfg_loop_full", |b| {
        b.iter(|| {
            let graph = build(
                black_box(&body),
                &operations,
                &context,
                &host,
                None,
                GraphOptions::full(),
            )
            .unwrap();
            black_box(graph)
        });
    });
}

fn bench_diamonds(c: &mut Criterion) {
    let body = diamonds();
    let operations = decode_operations(&body.code).unwrap();
    let context = context();
    let host = SimpleHost::new();

    c.bench_function("cdfg_diamonds_full", |b| {
        b.iter(|| {
            let graph = build(
                black_box(&body),
                &operations,
                &context,
                &host,
                None,
                GraphOptions::full(),
            )
            .unwrap();
            black_box(graph)
        });
    });

    c.bench_function("cdfg_diamonds_control_flow_only", |b| {
        b.iter(|| {
            let graph = build(
                black_box(&body),
                &operations,
                &context,
                &host,
                None,
                GraphOptions::control_flow_only(),
            )
            .unwrap();
            black_box(graph)
        });
    });
}

fn bench_dominators(c: &mut Criterion) {
    let body = diamonds();
    let operations = decode_operations(&body.code).unwrap();
    let graph = build(
        &body,
        &operations,
        &context(),
        &SimpleHost::new(),
        None,
        GraphOptions::control_flow_only(),
    )
    .unwrap();

    c.bench_function("cdfg_dominance_frontiers", |b| {
        b.iter(|| {
            let queries = ControlFlowQueries::new(black_box(&graph));
            let frontiers: usize = graph
                .blocks()
                .map(|(id, _)| queries.dominance_frontier_of(id).len())
                .sum();
            black_box(frontiers)
        });
    });
}

criterion_group!(benches, bench_loop, bench_diamonds, bench_dominators);
criterion_main!(benches);
