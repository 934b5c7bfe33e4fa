//! Bencode wire codec.
//!
//! Decoding is a single forward pass over the input driven by a [Tokenizer]
//! and stops at the root dictionary's closing byte. Encoding always emits
//! dictionary keys in raw byte order so that two peers encoding the same
//! tree produce the same bytes.

mod decode;
mod encode;
mod tokenizer;
mod value;

pub use decode::{decode, decode_prefix, DecodeError, DecodeErrorKind, MAX_DEPTH};
pub use encode::{encode, Encode, EncodeError, Encoder, Raw, INITIAL_CAPACITY};
pub use tokenizer::{Token, Tokenizer};
pub use value::{Dict, Value};
