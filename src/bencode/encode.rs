//! Canonical bencode encoding into a bounded buffer.

use std::collections::{BTreeMap, HashMap};

use bytes::{BufMut, Bytes, BytesMut};

use super::value::{Dict, Value};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Encoding failed.
pub enum EncodeError {
    /// The serialized form does not fit the buffer.
    ///
    /// `required` is the length the output would have reached after the
    /// write that failed. Encoding stops there, so the full message may be
    /// longer still.
    #[error("Encoded message exceeds the {capacity} byte capacity, reached at least {required} bytes")]
    CapacityExceeded { required: usize, capacity: usize },
}

/// Bytes allocated when an encoder is created, one datagram worth.
pub const INITIAL_CAPACITY: usize = 2048;

/// An already bencoded sub-document, spliced into the output verbatim.
///
/// The bytes are not validated; callers vouch that they hold exactly one
/// well formed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raw(pub Bytes);

/// Types that can be written as a bencode value.
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError>;
}

/// Encodes `value` into a buffer of at most `max_capacity` bytes.
pub fn encode<T: Encode + ?Sized>(value: &T, max_capacity: usize) -> Result<Bytes, EncodeError> {
    let mut encoder = Encoder::new(max_capacity);
    value.encode(&mut encoder)?;
    Ok(encoder.finish())
}

/// Incremental bencode writer with a hard size limit.
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
    capacity: usize,
}

impl Encoder {
    /// Creates an encoder whose output may never exceed `capacity` bytes.
    ///
    /// At most [INITIAL_CAPACITY] bytes are allocated up front, the buffer
    /// grows as values are written.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.min(INITIAL_CAPACITY)),
            capacity,
        }
    }

    // === Getters ===

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // === Public Methods ===

    pub fn int(&mut self, value: i64) -> Result<(), EncodeError> {
        let mut digits = [0u8; 20];
        let start = decimal(value.unsigned_abs(), &mut digits);
        let negative = value < 0;

        self.reserve(2 + negative as usize + digits.len() - start)?;

        self.buf.put_u8(b'i');
        if negative {
            self.buf.put_u8(b'-');
        }
        self.buf.put_slice(&digits[start..]);
        self.buf.put_u8(b'e');

        Ok(())
    }

    pub fn bytes(&mut self, value: &[u8]) -> Result<(), EncodeError> {
        let mut digits = [0u8; 20];
        let start = decimal(value.len() as u64, &mut digits);

        self.reserve(digits.len() - start + 1 + value.len())?;

        self.buf.put_slice(&digits[start..]);
        self.buf.put_u8(b':');
        self.buf.put_slice(value);

        Ok(())
    }

    /// Writes pre-encoded bytes as they are.
    pub fn raw(&mut self, encoded: &[u8]) -> Result<(), EncodeError> {
        self.reserve(encoded.len())?;
        self.buf.put_slice(encoded);

        Ok(())
    }

    /// Writes a list of items.
    pub fn list<'a, I, T>(&mut self, items: I) -> Result<(), EncodeError>
    where
        I: IntoIterator<Item = &'a T>,
        T: Encode + ?Sized + 'a,
    {
        self.raw(b"l")?;
        for item in items {
            item.encode(self)?;
        }
        self.raw(b"e")
    }

    /// Writes a dictionary, sorting the entries by the raw bytes of their keys.
    ///
    /// Duplicate keys are emitted as given, the caller owns key uniqueness.
    pub fn dict<'a, I>(&mut self, entries: I) -> Result<(), EncodeError>
    where
        I: IntoIterator<Item = (&'a [u8], &'a dyn Encode)>,
    {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        self.raw(b"d")?;
        for (key, value) in entries {
            self.bytes(key)?;
            value.encode(self)?;
        }
        self.raw(b"e")
    }

    /// Returns the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    // === Private Methods ===

    fn reserve(&self, additional: usize) -> Result<(), EncodeError> {
        let required = self.buf.len().saturating_add(additional);

        if required > self.capacity {
            return Err(EncodeError::CapacityExceeded {
                required,
                capacity: self.capacity,
            });
        }

        Ok(())
    }
}

/// Writes `value` right aligned into `out`, returns the index of the first digit.
fn decimal(mut value: u64, out: &mut [u8; 20]) -> usize {
    let mut start = out.len();

    loop {
        start -= 1;
        out[start] = b'0' + (value % 10) as u8;
        value /= 10;

        if value == 0 {
            return start;
        }
    }
}

impl Encode for Value {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        match self {
            Value::Dict(dict) => dict.encode(encoder),
            Value::List(list) => encoder.list(list),
            Value::Bytes(bytes) => encoder.bytes(bytes),
            Value::Int(int) => encoder.int(*int),
        }
    }
}

impl Encode for [Value] {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.list(self)
    }
}

impl Encode for Vec<Value> {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.list(self)
    }
}

impl Encode for [u8] {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.bytes(self)
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.bytes(self)
    }
}

impl Encode for Bytes {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.bytes(self)
    }
}

impl Encode for str {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.bytes(self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.bytes(self.as_bytes())
    }
}

impl Encode for i64 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.int(*self)
    }
}

impl Encode for i32 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.int((*self).into())
    }
}

impl Encode for u32 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.int((*self).into())
    }
}

impl Encode for u16 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.int((*self).into())
    }
}

impl Encode for Raw {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.raw(&self.0)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        (**self).encode(encoder)
    }
}

impl Encode for Dict {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        // Already in key byte order.
        encoder.raw(b"d")?;
        for (key, value) in self {
            encoder.bytes(key)?;
            value.encode(encoder)?;
        }
        encoder.raw(b"e")
    }
}

impl<T: Encode> Encode for BTreeMap<String, T> {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.dict(
            self.iter()
                .map(|(key, value)| (key.as_bytes(), value as &dyn Encode)),
        )
    }
}

impl<T: Encode> Encode for HashMap<String, T> {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), EncodeError> {
        encoder.dict(
            self.iter()
                .map(|(key, value)| (key.as_bytes(), value as &dyn Encode)),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bencode::{decode, Dict};

    #[test]
    fn scalars() {
        assert_eq!(&encode(&0i64, 16).unwrap()[..], b"i0e");
        assert_eq!(&encode(&-17i64, 16).unwrap()[..], b"i-17e");
        assert_eq!(&encode(&i64::MIN, 32).unwrap()[..], b"i-9223372036854775808e");
        assert_eq!(&encode(&u32::MAX, 32).unwrap()[..], b"i4294967295e");
        assert_eq!(&encode("spam", 16).unwrap()[..], b"4:spam");
        assert_eq!(&encode(&b""[..], 16).unwrap()[..], b"0:");
    }

    #[test]
    fn keys_are_sorted_by_bytes() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), Value::from(2));
        map.insert("a".to_string(), Value::from(1));
        map.insert("B".to_string(), Value::from(0));
        map.insert("aa".to_string(), Value::from(3));

        assert_eq!(&encode(&map, 64).unwrap()[..], b"d1:Bi0e1:ai1e2:aai3e1:bi2ee");
    }

    #[test]
    fn raw_passthrough() {
        let mut encoder = Encoder::new(64);
        let inner = Raw(Bytes::from_static(b"d2:id3:abce"));
        let tid = b"aa".to_vec();

        encoder
            .dict([
                (&b"y"[..], &"r" as &dyn Encode),
                (&b"r"[..], &inner as &dyn Encode),
                (&b"t"[..], &tid as &dyn Encode),
            ])
            .unwrap();

        let bytes = encoder.finish();
        assert_eq!(&bytes[..], b"d1:rd2:id3:abce1:t2:aa1:y1:re");

        let dict = decode(&bytes).unwrap();
        assert_eq!(
            dict.get("r").and_then(|r| r.get("id")).and_then(Value::as_bytes),
            Some(&b"abc"[..])
        );
    }

    #[test]
    fn capacity_exceeded() {
        let mut dict = Dict::new();
        dict.insert("v", Value::from(vec![7u8; 100]));

        let error = encode(&dict, 64).unwrap_err();
        assert!(matches!(
            error,
            EncodeError::CapacityExceeded { capacity: 64, required } if required > 64
        ));

        // Exactly fitting is fine: "d1:v100:" + 100 + "e" = 109
        assert_eq!(encode(&dict, 109).unwrap().len(), 109);
        assert!(encode(&dict, 108).is_err());
        assert_eq!(
            encode(&dict, 108).unwrap_err().to_string(),
            "Encoded message exceeds the 108 byte capacity, reached at least 109 bytes"
        );
    }

    #[test]
    fn capacity_is_a_limit_not_an_allocation() {
        let mut dict = Dict::new();
        dict.insert("a", Value::from(1));

        let encoder = Encoder::new(usize::MAX);
        assert_eq!(encoder.capacity(), usize::MAX);
        assert!(encoder.buf.capacity() < 1 << 20);

        assert_eq!(&encode(&dict, usize::MAX).unwrap()[..], b"d1:ai1ee");

        // Messages larger than the initial allocation still grow to fit.
        let mut large = Dict::new();
        large.insert("v", Value::from(vec![1u8; 4 * INITIAL_CAPACITY]));
        assert_eq!(
            encode(&large, usize::MAX).unwrap().len(),
            4 * INITIAL_CAPACITY + 10
        );
    }

    #[test]
    fn nested_values() {
        let mut inner = Dict::new();
        inner.insert("n", Value::List(vec![Value::from(1), Value::from("x")]));

        let mut root = Dict::new();
        root.insert("z", Value::from(-5));
        root.insert("a", Value::Dict(inner));

        let bytes = encode(&root, 128).unwrap();
        assert_eq!(&bytes[..], b"d1:ad1:nli1e1:xee1:zi-5ee");
        assert_eq!(decode(&bytes).unwrap(), root);
    }
}
