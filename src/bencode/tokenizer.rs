//! Streaming bencode tokenizer.

use super::decode::{DecodeError, DecodeErrorKind};

/// A single lexical token.
///
/// Byte strings borrow from the tokenized input and are only copied by
/// whoever decides to keep them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    DictStart,
    ListStart,
    End,
    Int(i64),
    Bytes(&'a [u8]),
}

/// Forward-only tokenizer over a bencoded buffer.
///
/// The tokenizer tracks container nesting and yields nothing more once the
/// first top level value is complete; bytes after it are never inspected.
#[derive(Debug)]
pub struct Tokenizer<'a> {
    input: &'a [u8],
    position: usize,
    depth: usize,
    finished: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            position: 0,
            depth: 0,
            finished: false,
        }
    }

    // === Getters ===

    /// Offset of the next unread byte.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of currently open containers.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns true once the top level value has been fully read.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    // === Public Methods ===

    /// Reads the next token, or `None` after the top level value is complete.
    pub fn next_token(&mut self) -> Result<Option<Token<'a>>, DecodeError> {
        if self.finished {
            return Ok(None);
        }

        let start = self.position;
        let byte = self.peek()?;

        let token = match byte {
            b'd' => {
                self.position += 1;
                self.depth += 1;
                Token::DictStart
            }
            b'l' => {
                self.position += 1;
                self.depth += 1;
                Token::ListStart
            }
            b'e' => {
                if self.depth == 0 {
                    return Err(DecodeError::new(start, DecodeErrorKind::UnexpectedByte(byte)));
                }
                self.position += 1;
                self.depth -= 1;
                Token::End
            }
            b'i' => {
                self.position += 1;
                Token::Int(self.number(b'e', true)?)
            }
            b'0'..=b'9' => Token::Bytes(self.string()?),
            _ => return Err(DecodeError::new(start, DecodeErrorKind::UnexpectedByte(byte))),
        };

        if self.depth == 0 {
            self.finished = true;
        }

        Ok(Some(token))
    }

    // === Private Methods ===

    fn peek(&self) -> Result<u8, DecodeError> {
        self.input
            .get(self.position)
            .copied()
            .ok_or_else(|| DecodeError::new(self.position, DecodeErrorKind::UnexpectedEnd))
    }

    /// Reads `<length>:<bytes>` and returns a view of the bytes.
    fn string(&mut self) -> Result<&'a [u8], DecodeError> {
        let start = self.position;
        let declared = self.number(b':', false)?;

        let remaining = self.input.len() - self.position;
        // `number` never yields a negative length.
        let declared = declared as u64;
        if declared > remaining as u64 {
            return Err(DecodeError::new(
                start,
                DecodeErrorKind::LengthOverrun {
                    declared,
                    remaining,
                },
            ));
        }

        let end = self.position + declared as usize;
        let bytes = &self.input[self.position..end];
        self.position = end;

        Ok(bytes)
    }

    /// Reads a decimal literal up to and including `terminator`.
    ///
    /// Accumulates towards negative so that `i64::MIN` is representable,
    /// and fails on overflow instead of wrapping or saturating.
    fn number(&mut self, terminator: u8, signed: bool) -> Result<i64, DecodeError> {
        let start = self.position;

        let negative = signed && self.peek()? == b'-';
        if negative {
            self.position += 1;
        }

        let digits_start = self.position;
        let mut accumulator: i64 = 0;

        loop {
            let at = self.position;
            let byte = self.peek()?;

            if byte == terminator {
                break;
            }

            let digit = match byte {
                b'0'..=b'9' => (byte - b'0') as i64,
                _ => return Err(DecodeError::new(at, DecodeErrorKind::UnexpectedByte(byte))),
            };

            if at > digits_start && self.input[digits_start] == b'0' {
                return Err(DecodeError::new(start, DecodeErrorKind::LeadingZero));
            }

            accumulator = accumulator
                .checked_mul(10)
                .and_then(|acc| acc.checked_sub(digit))
                .ok_or_else(|| DecodeError::new(start, DecodeErrorKind::IntegerOverflow))?;

            self.position += 1;
        }

        if self.position == digits_start {
            return Err(DecodeError::new(start, DecodeErrorKind::EmptyNumber));
        }

        // Consume the terminator.
        self.position += 1;

        if negative {
            if accumulator == 0 {
                return Err(DecodeError::new(start, DecodeErrorKind::NegativeZero));
            }
            Ok(accumulator)
        } else {
            accumulator
                .checked_neg()
                .ok_or_else(|| DecodeError::new(start, DecodeErrorKind::IntegerOverflow))
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(error) => {
                // Nothing sensible follows a malformed token.
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}
