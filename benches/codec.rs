//! Micro-benchmarks for decoding and encoding typical KRPC messages, compared
//! against serde_bencode. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench codec`

use mainline_core::bencode::{self, Dict, Value};
use std::time::Instant;

const ITERS: u32 = 100_000;
const MTU: usize = 2048;

fn main() {
    println!("codec\n");

    let ping = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec();
    let find_node = find_node_response();

    for (name, message) in [("ping", &ping), ("find_node response", &find_node)] {
        bench_decode(name, message);
        bench_encode(name, message);
    }
}

fn find_node_response() -> Vec<u8> {
    let nodes: Vec<u8> = (0..8 * 26).map(|i| i as u8).collect();
    let mut r = Dict::new();
    r.insert("id", Value::from(vec![7u8; 20]));
    r.insert("nodes", Value::from(nodes));
    r.insert("token", Value::from(vec![3u8; 20]));

    let mut message = Dict::new();
    message.insert("r", Value::from(r));
    message.insert("t", Value::from(&b"aa"[..]));
    message.insert("v", Value::from(&b"RS\x00\x05"[..]));
    message.insert("y", Value::from("r"));

    bencode::encode(&message, MTU).unwrap().to_vec()
}

fn bench_decode(name: &str, message: &[u8]) {
    let start = Instant::now();
    for _ in 0..ITERS {
        std::hint::black_box(bencode::decode(std::hint::black_box(message)).unwrap());
    }
    let ours = start.elapsed().as_nanos() / ITERS as u128;

    let start = Instant::now();
    for _ in 0..ITERS {
        let value: serde_bencode::value::Value =
            serde_bencode::from_bytes(std::hint::black_box(message)).unwrap();
        std::hint::black_box(value);
    }
    let serde = start.elapsed().as_nanos() / ITERS as u128;

    println!("decode {name:<20} {ours}ns/op (serde_bencode: {serde}ns/op)");
}

fn bench_encode(name: &str, message: &[u8]) {
    let dict = bencode::decode(message).unwrap();
    let value: serde_bencode::value::Value = serde_bencode::from_bytes(message).unwrap();

    let start = Instant::now();
    for _ in 0..ITERS {
        std::hint::black_box(bencode::encode(std::hint::black_box(&dict), MTU).unwrap());
    }
    let ours = start.elapsed().as_nanos() / ITERS as u128;

    let start = Instant::now();
    for _ in 0..ITERS {
        std::hint::black_box(serde_bencode::to_bytes(std::hint::black_box(&value)).unwrap());
    }
    let serde = start.elapsed().as_nanos() / ITERS as u128;

    println!("encode {name:<20} {ours}ns/op (serde_bencode: {serde}ns/op)\n");
}
