use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tern_sctp::chunk::{Chunk, DataChunk, GapAckBlock, SackChunk};
use tern_sctp::types::{PayloadProtocolId, Ssn, StreamId, Tsn, TsnUnwrapper};

fn data_chunk(payload_len: usize) -> Chunk {
    Chunk::Data(DataChunk {
        tsn: Tsn::new(1000),
        stream_id: StreamId(5),
        ssn: Ssn(42),
        ppid: PayloadProtocolId(53),
        payload: Bytes::from(vec![0u8; payload_len]),
        immediate_ack: false,
        unordered: false,
        beginning: true,
        end: true,
    })
}

fn bench_data_chunk_serialize(c: &mut Criterion) {
    let chunk = data_chunk(1200); // Typical full-MTU fragment

    c.bench_function("data_chunk_serialize", |b| {
        b.iter(|| {
            let bytes = black_box(&chunk).serialize();
            black_box(bytes);
        });
    });
}

fn bench_data_chunk_parse(c: &mut Criterion) {
    let bytes = data_chunk(1200).serialize();

    c.bench_function("data_chunk_parse", |b| {
        b.iter(|| {
            let chunk = Chunk::parse(black_box(&bytes)).unwrap();
            black_box(chunk);
        });
    });
}

fn bench_sack_chunk_serialize(c: &mut Criterion) {
    let chunk = Chunk::Sack(SackChunk {
        cumulative_tsn_ack: Tsn::new(1000),
        a_rwnd: 128 * 1024,
        gap_ack_blocks: (0..8).map(|i| GapAckBlock::new(i * 4 + 2, i * 4 + 3)).collect(),
        duplicate_tsns: vec![Tsn::new(990), Tsn::new(995)],
    });

    c.bench_function("sack_chunk_serialize", |b| {
        b.iter(|| {
            let bytes = black_box(&chunk).serialize();
            black_box(bytes);
        });
    });
}

fn bench_sack_chunk_parse(c: &mut Criterion) {
    let bytes = Chunk::Sack(SackChunk {
        cumulative_tsn_ack: Tsn::new(1000),
        a_rwnd: 128 * 1024,
        gap_ack_blocks: (0..8).map(|i| GapAckBlock::new(i * 4 + 2, i * 4 + 3)).collect(),
        duplicate_tsns: vec![Tsn::new(990), Tsn::new(995)],
    })
    .serialize();

    c.bench_function("sack_chunk_parse", |b| {
        b.iter(|| {
            let chunk = Chunk::parse(black_box(&bytes)).unwrap();
            black_box(chunk);
        });
    });
}

fn bench_tsn_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("tsn");

    group.bench_function("increment", |b| {
        let mut tsn = Tsn::new(1000);
        b.iter(|| {
            tsn.increment();
            black_box(&tsn);
        });
    });

    group.bench_function("distance", |b| {
        let x = Tsn::new(1000);
        let y = Tsn::new(2000);
        b.iter(|| {
            let dist = black_box(x).distance_to(black_box(y));
            black_box(dist);
        });
    });

    group.bench_function("comparison", |b| {
        let x = Tsn::new(1000);
        let y = Tsn::new(2000);
        b.iter(|| {
            let result = black_box(x).lt(black_box(y));
            black_box(result);
        });
    });

    group.bench_function("unwrap", |b| {
        let mut unwrapper = TsnUnwrapper::new();
        let mut tsn = Tsn::new(u32::MAX - 1000);
        b.iter(|| {
            let unwrapped = unwrapper.unwrap_tsn(black_box(tsn));
            tsn.increment();
            black_box(unwrapped);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_data_chunk_serialize,
    bench_data_chunk_parse,
    bench_sack_chunk_serialize,
    bench_sack_chunk_parse,
    bench_tsn_ops
);
criterion_main!(benches);
