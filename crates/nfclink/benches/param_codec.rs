// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! LLC parameter codec micro-benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nfclink::protocol::param::{decode, encode, Param};

fn bench_encode(c: &mut Criterion) {
    let params = vec![
        Param::Version(0x11),
        Param::Miu(2175),
        Param::Wks(0x0013),
        Param::Lto(500),
        Param::Rw(15),
        Param::ServiceName("urn:nfc:sn:snep".into()),
    ];
    c.bench_function("param_encode_connect", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(64);
            encode(black_box(&params), &mut out, Some(128));
            out
        });
    });
}

fn bench_decode(c: &mut Criterion) {
    let mut wire = Vec::new();
    encode(
        &[
            Param::Version(0x11),
            Param::Miu(2175),
            Param::Wks(0x0013),
            Param::Lto(500),
            Param::Rw(15),
            Param::ServiceName("urn:nfc:sn:snep".into()),
        ],
        &mut wire,
        None,
    );
    c.bench_function("param_decode_connect", |b| {
        b.iter(|| decode(black_box(&wire)));
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
