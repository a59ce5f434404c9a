//! Benchmarks for the method body codec.
//!
//! - Decoding a straight-line body and a branchy loop
//! - Re-encoding decoded operations
//! - Generating a body with branch size fitting

extern crate dotsym;

use criterion::{criterion_group, criterion_main, Criterion};
use dotsym::{
    assembly::{decode_operations, encode_operations, IlGenerator, OpCode},
    token::Token,
};
use std::hint::black_box;

/// ldc.i4.0; stloc.0; L: ldloc.0; ldc.i4.1; add; dup; stloc.0; ldc.i4.s 10; blt.s L; ret
const LOOP: [u8; 12] = [
    0x16, 0x0A, 0x06, 0x17, 0x58, 0x25, 0x0A, 0x1F, 0x0A, 0x32, 0xF7, 0x2A,
];

/// 256 arithmetic operations followed by ret
fn straight_line() -> Vec<u8> {
    let mut code = vec![0x16];
    for _ in 0..128 {
        code.extend([0x17, 0x58]);
    }
    code.extend([0x26, 0x2A]);
    code
}

fn bench_decode_straight_line(c: &mut Criterion) {
    let code = straight_line();
    c.bench_function("decode_straight_line", |b| {
        b.iter(|| {
            let operations = decode_operations(black_box(&code)).unwrap();
            black_box(operations)
        });
    });
}

fn bench_decode_loop(c: &mut Criterion) {
    c.bench_function("decode_loop", |b| {
        b.iter(|| {
            let operations = decode_operations(black_box(&LOOP)).unwrap();
            black_box(operations)
        });
    });
}

fn bench_encode(c: &mut Criterion) {
    let operations = decode_operations(&straight_line()).unwrap();
    c.bench_function("encode_straight_line", |b| {
        b.iter(|| {
            let code = encode_operations(black_box(&operations)).unwrap();
            black_box(code)
        });
    });
}

/// Forward branches over growing distances, shortened where they fit
fn bench_generate_best_fit(c: &mut Criterion) {
    c.bench_function("generate_best_fit", |b| {
        b.iter(|| {
            let mut generator = IlGenerator::new(Token(0x0600_0001));
            let end = generator.define_label();
            for _ in 0..64 {
                generator.emit_argument(OpCode::Ldarg0, 0).unwrap();
                generator.emit_label(OpCode::Brtrue, end).unwrap();
                generator.emit(OpCode::Nop).unwrap();
            }
            generator.mark_label(end).unwrap();
            generator.emit(OpCode::Ret).unwrap();
            generator.adjust_branch_sizes_to_best_fit().unwrap();
            black_box(generator.finish().unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_decode_straight_line,
    bench_decode_loop,
    bench_encode,
    bench_generate_best_fit,
);
criterion_main!(benches);
