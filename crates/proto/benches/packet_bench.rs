//! Packet and transport throughput benchmarks.
//!
//! Run with: `cargo bench --bench packet_bench`

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use halyard_proto::ssh::cipher::{AesCtrFactory, CipherFactory};
use halyard_proto::ssh::compression::{CompressionFactory, NoCompressionFactory};
use halyard_proto::ssh::mac::{HmacFactory, MacFactory};
use halyard_proto::ssh::packet::{DirectionCrypto, PacketCodec};
use halyard_proto::ssh::{Ed25519HostKey, StaticHostKeys, Transport, TransportConfig};
use std::sync::Arc;
use std::time::Instant;

const KEY: [u8; 64] = [0x42; 64];
const IV: [u8; 16] = [0x24; 16];

fn crypto() -> DirectionCrypto {
    DirectionCrypto {
        cipher: AesCtrFactory::Aes128.create(&KEY, &IV).unwrap(),
        mac: HmacFactory::Sha256.create(&KEY).unwrap(),
        compression: NoCompressionFactory.create(),
    }
}

fn keyed_pair() -> (PacketCodec, PacketCodec) {
    let mut sender = PacketCodec::new();
    sender.set_outbound(crypto());
    let mut receiver = PacketCodec::new();
    receiver.set_inbound(crypto());
    (sender, receiver)
}

fn bench_seal_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("aes128-ctr+hmac-sha2-256");
    for size in [64usize, 1024, 32 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("seal", size), &payload, |b, payload| {
            let (mut sender, _) = keyed_pair();
            b.iter(|| black_box(sender.seal(black_box(payload)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("seal+open", size), &payload, |b, payload| {
            let (mut sender, mut receiver) = keyed_pair();
            let mut buf = BytesMut::new();
            b.iter(|| {
                buf.extend_from_slice(&sender.seal(payload).unwrap());
                black_box(receiver.open(&mut buf).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let keys = Arc::new(StaticHostKeys::new().with_key(Arc::new(Ed25519HostKey::generate().unwrap())));
    c.bench_function("handshake curve25519-sha256", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut client = Transport::new(TransportConfig::client(), now).unwrap();
            let mut server = Transport::new(TransportConfig::server(keys.clone()), now).unwrap();
            loop {
                let mut moved = false;
                if let Some(bytes) = client.take_outbound() {
                    server.feed(&bytes, now).unwrap();
                    moved = true;
                }
                if let Some(bytes) = server.take_outbound() {
                    client.feed(&bytes, now).unwrap();
                    moved = true;
                }
                if !moved {
                    break;
                }
            }
            black_box(client.session_id().map(<[u8]>::len))
        });
    });
}

criterion_group!(benches, bench_seal_open, bench_handshake);
criterion_main!(benches);
