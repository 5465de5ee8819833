use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use canopy::crypto::{compute_mac, verify_mac};
use canopy::packet::{MsgType, Nid, Packet};

fn nid(byte: u8) -> Nid {
    Nid([byte; 16])
}

fn sample(payload_len: usize) -> Packet {
    let mut p = Packet::new(nid(0xaa), nid(0xbb), MsgType::Data, 8, 7, vec![0xab; payload_len]);
    p.mac = compute_mac(&[0x42; 32], &p.mac_input());
    p
}

fn encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_codec");

    for payload_len in [0, 64, 256, 1024, 4096] {
        let packet = sample(payload_len);
        group.throughput(Throughput::Bytes((canopy::packet::HEADER_LEN + payload_len) as u64));

        group.bench_with_input(BenchmarkId::new("encode", payload_len), &packet, |b, packet| {
            b.iter(|| black_box(packet.encode().unwrap()))
        });

        let bytes = packet.encode().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", payload_len), &bytes, |b, bytes| {
            b.iter(|| black_box(Packet::decode(bytes).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("mac_compute_and_verify", payload_len), &packet, |b, packet| {
            let key = [0x42; 32];
            b.iter(|| {
                let mac = compute_mac(&key, &packet.mac_input());
                black_box(verify_mac(&key, &packet.mac_input(), &mac))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, encode_decode);
criterion_main!(benches);
