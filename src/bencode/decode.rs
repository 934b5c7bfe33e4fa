//! Bencode decoding into a [Value] tree.

use bytes::Bytes;

use super::tokenizer::{Token, Tokenizer};
use super::value::{Dict, Value};

/// Maximum container nesting accepted from the wire.
pub const MAX_DEPTH: usize = 256;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid bencode at byte {offset}: {kind}")]
/// Malformed input. The whole buffer should be discarded.
pub struct DecodeError {
    offset: usize,
    kind: DecodeErrorKind,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why a buffer failed to decode.
pub enum DecodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedByte(u8),

    #[error("root value is not a dictionary")]
    NotADictionary,

    #[error("number has a leading zero")]
    LeadingZero,

    #[error("negative zero")]
    NegativeZero,

    #[error("number has no digits")]
    EmptyNumber,

    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,

    #[error("string length {declared} exceeds the {remaining} remaining bytes")]
    LengthOverrun { declared: u64, remaining: usize },

    #[error("duplicate dictionary key {0:?}")]
    DuplicateKey(Bytes),

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("dictionary key has no value")]
    MissingValue,

    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
}

impl DecodeError {
    pub(crate) fn new(offset: usize, kind: DecodeErrorKind) -> Self {
        Self { offset, kind }
    }

    /// Offset of the byte where decoding failed.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }
}

/// Decodes a bencoded dictionary, ignoring any bytes after it.
pub fn decode(input: &[u8]) -> Result<Dict, DecodeError> {
    decode_prefix(input).map(|(dict, _)| dict)
}

/// Decodes a bencoded dictionary from the start of `input`.
///
/// Returns the dictionary and the offset just past its closing byte. Bytes
/// from that offset on are not read; it is up to the caller whether they
/// are acceptable.
pub fn decode_prefix(input: &[u8]) -> Result<(Dict, usize), DecodeError> {
    match input.first() {
        None => return Err(DecodeError::new(0, DecodeErrorKind::UnexpectedEnd)),
        Some(b'd') => {}
        Some(_) => return Err(DecodeError::new(0, DecodeErrorKind::NotADictionary)),
    }

    let mut tokenizer = Tokenizer::new(input);
    let mut stack: Vec<Frame> = Vec::with_capacity(8);

    loop {
        let offset = tokenizer.position();
        let token = tokenizer
            .next_token()?
            .ok_or_else(|| DecodeError::new(offset, DecodeErrorKind::UnexpectedEnd))?;

        let value = match token {
            Token::DictStart | Token::ListStart => {
                if awaiting_key(&stack) {
                    return Err(DecodeError::new(offset, DecodeErrorKind::NonStringKey));
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(DecodeError::new(offset, DecodeErrorKind::TooDeep));
                }

                stack.push(if token == Token::DictStart {
                    Frame::Dict {
                        dict: Dict::new(),
                        key: None,
                    }
                } else {
                    Frame::List(Vec::new())
                });
                continue;
            }
            Token::End => match stack.pop() {
                Some(Frame::Dict { key: Some(_), .. }) => {
                    return Err(DecodeError::new(offset, DecodeErrorKind::MissingValue));
                }
                Some(Frame::Dict { dict, key: None }) => Value::Dict(dict),
                Some(Frame::List(list)) => Value::List(list),
                // The tokenizer rejects unbalanced closes.
                None => return Err(DecodeError::new(offset, DecodeErrorKind::UnexpectedByte(b'e'))),
            },
            Token::Int(int) => {
                if awaiting_key(&stack) {
                    return Err(DecodeError::new(offset, DecodeErrorKind::NonStringKey));
                }
                Value::Int(int)
            }
            Token::Bytes(bytes) => {
                if let Some(Frame::Dict { dict, key }) = stack.last_mut() {
                    if key.is_none() {
                        let text = Bytes::copy_from_slice(bytes);
                        if dict.contains_key(&text) {
                            return Err(DecodeError::new(
                                offset,
                                DecodeErrorKind::DuplicateKey(text),
                            ));
                        }
                        *key = Some(text);
                        continue;
                    }
                }
                Value::Bytes(Bytes::copy_from_slice(bytes))
            }
        };

        match stack.last_mut() {
            None => {
                return match value {
                    Value::Dict(dict) => Ok((dict, tokenizer.position())),
                    _ => Err(DecodeError::new(0, DecodeErrorKind::NotADictionary)),
                };
            }
            Some(Frame::List(list)) => list.push(value),
            Some(Frame::Dict { dict, key }) => {
                if let Some(key) = key.take() {
                    dict.insert(key, value);
                }
            }
        }
    }
}

/// A container still being filled, one per open nesting level.
enum Frame {
    Dict { dict: Dict, key: Option<Bytes> },
    List(Vec<Value>),
}

fn awaiting_key(stack: &[Frame]) -> bool {
    matches!(stack.last(), Some(Frame::Dict { key: None, .. }))
}
