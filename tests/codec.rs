//! Codec behaviour on realistic KRPC traffic and hostile input.

use mainline_core::bencode::{self, DecodeErrorKind, Dict, Encode, Encoder, Raw, Value};
use mainline_core::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const MTU: usize = 2048;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct PingArguments {
    #[serde(with = "serde_bytes")]
    id: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct PingRequest {
    #[serde(rename = "t", with = "serde_bytes")]
    transaction_id: Vec<u8>,
    #[serde(rename = "y")]
    message_type: String,
    #[serde(rename = "q")]
    query: String,
    #[serde(rename = "a")]
    arguments: PingArguments,
}

fn ping() -> PingRequest {
    PingRequest {
        transaction_id: vec![0, 7],
        message_type: "q".to_string(),
        query: "ping".to_string(),
        arguments: PingArguments {
            id: (0..20).collect(),
        },
    }
}

fn random_bytes(rng: &mut StdRng, max: usize) -> Vec<u8> {
    let len = rng.gen_range(0..=max);
    (0..len).map(|_| rng.gen()).collect()
}

/// Mostly short ASCII keys, sometimes arbitrary bytes.
fn random_key(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.gen_range(0..6);
    if rng.gen_bool(0.2) {
        return (0..len).map(|_| rng.gen()).collect();
    }
    (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect()
}

fn random_value(rng: &mut StdRng, depth: usize) -> Value {
    let kind = if depth == 0 { rng.gen_range(0..2) } else { rng.gen_range(0..4) };

    match kind {
        0 => Value::Int(rng.gen()),
        1 => Value::Bytes(Bytes::from(random_bytes(rng, 24))),
        2 => Value::List((0..rng.gen_range(0..5)).map(|_| random_value(rng, depth - 1)).collect()),
        _ => Value::Dict(random_dict(rng, depth - 1)),
    }
}

fn random_dict(rng: &mut StdRng, depth: usize) -> Dict {
    (0..rng.gen_range(0..5))
        .map(|_| (random_key(rng), random_value(rng, depth)))
        .collect()
}

#[test]
fn random_trees_survive_a_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x6d61696e);

    for _ in 0..500 {
        let dict = random_dict(&mut rng, 4);
        let encoded = bencode::encode(&dict, 1 << 20).unwrap();

        assert_eq!(bencode::decode(&encoded).unwrap(), dict);
        // Canonical output re-encodes byte for byte.
        let again = bencode::encode(&bencode::decode(&encoded).unwrap(), 1 << 20).unwrap();
        assert_eq!(again, encoded);
    }
}

#[test]
fn binary_keys_interoperate_with_serde_bencode() {
    let mut peers = Dict::new();
    peers.insert(vec![0xc0u8, 0xa8, 0x00, 0x01], Value::from(6881));
    peers.insert("id", Value::from(vec![9u8; 20]));
    let bytes = bencode::encode(&peers, MTU).unwrap();

    let theirs: serde_bencode::value::Value = serde_bencode::from_bytes(&bytes).unwrap();
    assert_eq!(serde_bencode::to_bytes(&theirs).unwrap(), bytes.to_vec());

    let ours = bencode::decode(&bytes).unwrap();
    assert_eq!(ours.get([0xc0u8, 0xa8, 0x00, 0x01]).and_then(Value::as_int), Some(6881));
    assert_eq!(ours, peers);
}

#[test]
fn reads_serde_bencode_output() {
    let bytes = serde_bencode::to_bytes(&ping()).unwrap();
    let message = bencode::decode(&bytes).unwrap();

    assert_eq!(message.get("y").and_then(Value::as_str), Some("q"));
    assert_eq!(message.get("q").and_then(Value::as_str), Some("ping"));
    assert_eq!(message.get("t").and_then(Value::as_bytes), Some(&[0u8, 7][..]));

    let id = message
        .get("a")
        .and_then(|a| a.get("id"))
        .and_then(Value::as_bytes)
        .unwrap();
    assert_eq!(id, (0..20).collect::<Vec<u8>>().as_slice());
}

#[test]
fn serde_bencode_reads_our_output() {
    let id: Vec<u8> = (0..20).collect();
    let tid = vec![0u8, 7];
    let y = "q";
    let q = "ping";
    let a: Dict = [("id".to_string(), Value::from(id))].into_iter().collect();

    let mut encoder = Encoder::new(MTU);
    encoder
        .dict([
            (b"y".as_slice(), &y as &dyn Encode),
            (b"t".as_slice(), &tid as &dyn Encode),
            (b"a".as_slice(), &a as &dyn Encode),
            (b"q".as_slice(), &q as &dyn Encode),
        ])
        .unwrap();
    let bytes = encoder.finish();

    let decoded: PingRequest = serde_bencode::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, ping());
}

#[test]
fn raw_values_are_spliced() {
    let inner = serde_bencode::to_bytes(&ping().arguments).unwrap();
    let raw = Raw(Bytes::from(inner));
    let tid = b"aa".to_vec();

    let mut encoder = Encoder::new(MTU);
    encoder
        .dict([
            (b"r".as_slice(), &raw as &dyn Encode),
            (b"t".as_slice(), &tid as &dyn Encode),
        ])
        .unwrap();
    let bytes = encoder.finish();

    let message = bencode::decode(&bytes).unwrap();
    assert_eq!(
        message.get("r").and_then(|r| r.get("id")).and_then(Value::as_bytes),
        Some((0..20).collect::<Vec<u8>>().as_slice())
    );
}

#[test]
fn every_truncation_is_rejected() {
    let bytes = serde_bencode::to_bytes(&ping()).unwrap();

    for end in 0..bytes.len() {
        assert!(bencode::decode(&bytes[..end]).is_err(), "prefix of {end} bytes");
    }
}

#[test]
fn trailing_bytes_are_left_to_the_caller() {
    let mut bytes = serde_bencode::to_bytes(&ping()).unwrap();
    let len = bytes.len();
    bytes.extend_from_slice(b"garbage");

    let (message, end) = bencode::decode_prefix(&bytes).unwrap();
    assert_eq!(end, len);
    assert_eq!(bencode::decode(&bytes).unwrap(), message);
}

#[test]
fn hostile_lengths_do_not_allocate() {
    let error = bencode::decode(b"d1:a99999999999999999:xe").unwrap_err();

    assert!(matches!(
        error.kind(),
        DecodeErrorKind::LengthOverrun { .. } | DecodeErrorKind::IntegerOverflow
    ));
}

#[test]
fn deep_nesting_is_rejected() {
    let depth = 100_000;
    let mut bytes = b"d1:a".to_vec();
    bytes.extend(std::iter::repeat(b'l').take(depth));
    bytes.extend(std::iter::repeat(b'e').take(depth + 1));

    assert_eq!(
        bencode::decode(&bytes).unwrap_err().kind(),
        &DecodeErrorKind::TooDeep
    );
}

#[test]
fn random_garbage_never_panics() {
    let mut rng = StdRng::seed_from_u64(42);
    let valid = serde_bencode::to_bytes(&ping()).unwrap();

    for _ in 0..5_000 {
        let mut bytes = valid.clone();
        for _ in 0..rng.gen_range(1..4) {
            let i = rng.gen_range(0..bytes.len());
            bytes[i] = rng.gen();
        }
        // Either outcome is fine, only a panic is not.
        let _ = bencode::decode(&bytes);

        let noise = random_bytes(&mut rng, 64);
        let _ = bencode::decode(&noise);
    }
}

#[test]
fn encoding_respects_capacity() {
    let bytes = serde_bencode::to_bytes(&ping()).unwrap();
    let message = bencode::decode(&bytes).unwrap();

    assert_eq!(bencode::encode(&message, bytes.len()).unwrap().len(), bytes.len());
    assert!(bencode::encode(&message, bytes.len() - 1).is_err());
}
