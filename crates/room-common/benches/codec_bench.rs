use criterion::{black_box, criterion_group, criterion_main, Criterion};
use room_common::boxstream::{BoxReader, BoxWriter};
use room_common::frame::{Header, Packet};

const KEY: [u8; 32] = [0x24u8; 32];
const NONCE: [u8; 24] = [0x01u8; 24];

fn bench_packet_serialize(c: &mut Criterion) {
    let pkt = Packet {
        stream: true,
        end_or_error: false,
        body_type: room_common::frame::BodyType::Binary,
        req: -7,
        body: vec![0xABu8; 1024],
    };

    c.bench_function("packet_serialize_1kb", |b| {
        b.iter(|| black_box(pkt.serialize().unwrap()));
    });
}

fn bench_packet_parse(c: &mut Criterion) {
    let bytes = Packet::json(3, false, false, br#"{"name":["whoami"],"args":[]}"#.to_vec())
        .serialize()
        .unwrap();

    c.bench_function("packet_parse_request", |b| {
        b.iter(|| black_box(Packet::parse(&bytes).unwrap()));
    });
}

fn bench_header_parse(c: &mut Criterion) {
    let header = Packet::end_of_stream(-12).header().unwrap().encode();

    c.bench_function("header_parse", |b| {
        b.iter(|| black_box(Header::parse(&header).unwrap()));
    });
}

fn bench_box_seal_4kb(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let payload = vec![0xABu8; 4096];

    c.bench_function("box_seal_4kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut writer = BoxWriter::new(Vec::with_capacity(4200), &KEY, NONCE);
                writer.write_all(&payload).await.unwrap();
                black_box(writer)
            })
        });
    });
}

fn bench_box_open_4kb(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let wire = rt.block_on(async {
        let mut sink = Vec::new();
        let mut writer = BoxWriter::new(&mut sink, &KEY, NONCE);
        writer.write_all(&[0xABu8; 4096]).await.unwrap();
        drop(writer);
        sink
    });

    c.bench_function("box_open_4kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut reader = BoxReader::new(wire.as_slice(), &KEY, NONCE);
                black_box(reader.read_message().await.unwrap())
            })
        });
    });
}

criterion_group!(
    benches,
    bench_packet_serialize,
    bench_packet_parse,
    bench_header_parse,
    bench_box_seal_4kb,
    bench_box_open_4kb,
);
criterion_main!(benches);
