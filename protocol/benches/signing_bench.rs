// Signing & verification benchmarks for the mesh relay message envelope.
//
// Covers Ed25519 and ECDSA P-384 keypair generation, envelope hashing, and
// single-message sign/verify, matching the curves the router actually
// accepts on the wire.

use criterion::{criterion_group, criterion_main, Criterion};

use meshrelay_protocol::crypto::keys::NodeKeypair;
use meshrelay_protocol::crypto::signatures::{sign_message, verify_message};
use meshrelay_protocol::identity::NodeId;

fn node_id() -> NodeId {
    NodeId::from_bytes([7u8; 32])
}

fn bench_keypair_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("keypair_generate");
    group.bench_function("ed25519", |b| b.iter(NodeKeypair::generate_ed25519));
    group.bench_function("ecdsa_p384", |b| b.iter(NodeKeypair::generate_ecdsa_p384));
    group.finish();
}

fn bench_sign_message(c: &mut Criterion) {
    let from = node_id();
    let data = b"gossip payload of representative size for a pub/sub message";

    let mut group = c.benchmark_group("sign_message");
    let ed25519 = NodeKeypair::generate_ed25519();
    group.bench_function("ed25519", |b| {
        b.iter(|| sign_message(&ed25519, "bench-topic", &from, 42, data));
    });
    let p384 = NodeKeypair::generate_ecdsa_p384();
    group.bench_function("ecdsa_p384", |b| {
        b.iter(|| sign_message(&p384, "bench-topic", &from, 42, data));
    });
    group.finish();
}

fn bench_verify_message(c: &mut Criterion) {
    let from = node_id();
    let data = b"gossip payload of representative size for a pub/sub message";

    let mut group = c.benchmark_group("verify_message");

    let ed25519 = NodeKeypair::generate_ed25519();
    let ed25519_sig = sign_message(&ed25519, "bench-topic", &from, 42, data);
    let ed25519_pub = ed25519.public_key_bytes();
    group.bench_function("ed25519", |b| {
        b.iter(|| {
            verify_message(
                ed25519.key_type(),
                &ed25519_pub,
                "bench-topic",
                &from,
                42,
                data,
                &ed25519_sig,
            )
            .unwrap();
        });
    });

    let p384 = NodeKeypair::generate_ecdsa_p384();
    let p384_sig = sign_message(&p384, "bench-topic", &from, 42, data);
    let p384_pub = p384.public_key_bytes();
    group.bench_function("ecdsa_p384", |b| {
        b.iter(|| {
            verify_message(p384.key_type(), &p384_pub, "bench-topic", &from, 42, data, &p384_sig)
                .unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_keypair_generation, bench_sign_message, bench_verify_message);
criterion_main!(benches);
