//! Benchmarks for hashing, serialization, and script execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kestrel_core::codec::{Decodable, Encodable};
use kestrel_core::hash::{hash160, hash256, Hash256};
use kestrel_core::script::interpreter::execute;
use kestrel_core::script::opcodes::*;
use kestrel_core::script::SigVersion;
use kestrel_core::tx::{OutPoint, Transaction, TxBuilder};

fn sample_tx() -> Transaction {
    let mut builder = TxBuilder::new();
    for i in 0..4u8 {
        builder = builder.input(
            OutPoint { txid: Hash256([i; 32]), index: i as u32 },
            vec![0x51; 40],
            0xffff_ffff,
        );
    }
    for _ in 0..4 {
        builder = builder.output(50_000, vec![0x76, 0xa9, 0x14].into_iter().chain([0u8; 20]).chain([0x88, 0xac]).collect());
    }
    builder.finalize()
}

fn bench_hashing(c: &mut Criterion) {
    let data = vec![0xabu8; 1024];
    c.bench_function("hash256_1k", |b| b.iter(|| hash256(black_box(&data))));
    c.bench_function("hash160_1k", |b| b.iter(|| hash160(black_box(&data))));
}

fn bench_tx_codec(c: &mut Criterion) {
    let tx = sample_tx();
    let encoded = tx.encode();
    c.bench_function("tx_encode", |b| b.iter(|| black_box(&tx).encode()));
    c.bench_function("tx_decode", |b| {
        b.iter(|| Transaction::decode(black_box(&encoded)).unwrap())
    });
    c.bench_function("txid", |b| {
        b.iter(|| {
            // Rebuild so the cache does not short-circuit the hash.
            sample_tx().txid()
        })
    });
}

fn bench_script(c: &mut Criterion) {
    let tx = sample_tx();
    let script = [OP_1, OP_2, OP_ADD, OP_3, OP_NUMEQUAL, OP_VERIFY, OP_1];
    c.bench_function("script_arith", |b| {
        b.iter(|| {
            let mut stack = Vec::new();
            execute(
                black_box(&script),
                &mut stack,
                &tx,
                0,
                0,
                0,
                SigVersion::Base,
            )
            .unwrap();
            stack
        })
    });
}

criterion_group!(benches, bench_hashing, bench_tx_codec, bench_script);
criterion_main!(benches);
