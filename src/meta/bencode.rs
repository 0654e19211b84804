//! Bencode serialization.
//!
//! Pure functions over an explicit value tree. `decode` is strict: it
//! rejects trailing bytes and unsorted dictionary keys, so
//! `decode(encode(v)) == v` and `encode(decode(b)) == b` both hold on
//! well-formed input.

use std::collections::BTreeMap;

use crate::error::MetaError;

/// One bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BValue>),
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    /// Convenience constructor for string payloads.
    #[must_use]
    pub fn text(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

/// Serialize a value tree to bencoded bytes.
#[must_use]
pub fn encode(value: &BValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BValue, out: &mut Vec<u8>) {
    match value {
        BValue::Int(number) => {
            out.push(b'i');
            out.extend_from_slice(number.to_string().as_bytes());
            out.push(b'e');
        }
        BValue::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        BValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BValue::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Parse one bencoded value spanning the whole input.
///
/// # Errors
///
/// Returns a [`MetaError`] for syntax errors, unsorted dictionary keys
/// and trailing bytes.
pub fn decode(data: &[u8]) -> Result<BValue, MetaError> {
    let mut cursor = Cursor { data, position: 0 };
    let value = cursor.value()?;
    let remaining = data.len().saturating_sub(cursor.position);
    if remaining > 0 {
        return Err(MetaError::TrailingData { remaining });
    }
    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, MetaError> {
        self.data
            .get(self.position)
            .copied()
            .ok_or(MetaError::UnexpectedEnd)
    }

    fn advance(&mut self) {
        self.position = self.position.saturating_add(1);
    }

    fn take(&mut self, count: usize) -> Result<&[u8], MetaError> {
        let end = self
            .position
            .checked_add(count)
            .ok_or(MetaError::UnexpectedEnd)?;
        let slice = self
            .data
            .get(self.position..end)
            .ok_or(MetaError::UnexpectedEnd)?;
        self.position = end;
        Ok(slice)
    }

    fn take_until(&mut self, stop: u8) -> Result<&[u8], MetaError> {
        let start = self.position;
        loop {
            let byte = self.peek()?;
            self.advance();
            if byte == stop {
                break;
            }
        }
        let end = self.position.saturating_sub(1);
        self.data.get(start..end).ok_or(MetaError::UnexpectedEnd)
    }

    fn value(&mut self) -> Result<BValue, MetaError> {
        match self.peek()? {
            b'i' => {
                self.advance();
                let digits = self.take_until(b'e')?;
                let text = String::from_utf8_lossy(digits).into_owned();
                let number: i64 = text
                    .parse()
                    .map_err(|_: std::num::ParseIntError| MetaError::InvalidInteger {
                        text: text.clone(),
                    })?;
                Ok(BValue::Int(number))
            }
            b'l' => {
                self.advance();
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.advance();
                Ok(BValue::List(items))
            }
            b'd' => {
                self.advance();
                let mut entries = BTreeMap::new();
                let mut previous: Option<Vec<u8>> = None;
                while self.peek()? != b'e' {
                    let key = match self.value()? {
                        BValue::Bytes(bytes) => bytes,
                        BValue::Int(_) | BValue::List(_) | BValue::Dict(_) => {
                            return Err(MetaError::InvalidKey);
                        }
                    };
                    if let Some(ref last) = previous {
                        if *last >= key {
                            return Err(MetaError::UnsortedKeys {
                                previous: String::from_utf8_lossy(last).into_owned(),
                                current: String::from_utf8_lossy(&key).into_owned(),
                            });
                        }
                    }
                    let item = self.value()?;
                    previous = Some(key.clone());
                    entries.insert(key, item);
                }
                self.advance();
                Ok(BValue::Dict(entries))
            }
            byte if byte.is_ascii_digit() => {
                let digits = self.take_until(b':')?;
                let text = String::from_utf8_lossy(digits).into_owned();
                let length: usize = text
                    .parse()
                    .map_err(|_: std::num::ParseIntError| MetaError::InvalidLength {
                        text: text.clone(),
                    })?;
                let bytes = self.take(length)?;
                Ok(BValue::Bytes(bytes.to_vec()))
            }
            byte => Err(MetaError::UnknownPrefix { byte }),
        }
    }
}
