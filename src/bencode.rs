//! Bencode encoding and decoding.
//!
//! Bencode is the serialization used by the tracker protocol and by KRPC
//! messages on the DHT transport. In addition to the four standard types
//! (integers, byte strings, lists, dictionaries) this module understands a
//! nonstandard float token (`f<value>e`) that the tracker emits for peer
//! quality scores in dictionary-form announce responses.

use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidLength,

    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    #[error("nesting too deep")]
    TooDeep,

    #[error("trailing data after value")]
    TrailingData,
}

/// A bencode value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    /// Nonstandard extension carrying peer quality scores.
    Float(f64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary field lookup, `None` when `self` is not a dict.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

/// Builds a dictionary value from `(key, value)` pairs.
pub fn dict<I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (&'static [u8], Value)>,
{
    Value::Dict(
        pairs
            .into_iter()
            .map(|(k, v)| (Bytes::from_static(k), v))
            .collect(),
    )
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Float(f) => {
            out.push(b'f');
            out.extend_from_slice(format!("{:.6}", f).as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, val) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.parse(0)?;
    if parser.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }

        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let digits = self.take_until(b'e')?;
                let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
                let value: i64 = text.parse().map_err(|_| BencodeError::InvalidInteger)?;
                Ok(Value::Integer(value))
            }
            b'f' => {
                self.pos += 1;
                let digits = self.take_until(b'e')?;
                let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
                let value: f64 = text.parse().map_err(|_| BencodeError::InvalidInteger)?;
                Ok(Value::Float(value))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key_offset = self.pos;
                    let key = match self.parse(depth + 1)? {
                        Value::Bytes(b) => b,
                        _ => {
                            return Err(BencodeError::UnexpectedByte(
                                self.data[key_offset],
                                key_offset,
                            ))
                        }
                    };
                    let value = self.parse(depth + 1)?;
                    entries.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => {
                let digits = self.take_until(b':')?;
                let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidLength)?;
                let len: usize = text.parse().map_err(|_| BencodeError::InvalidLength)?;
                if self.pos + len > self.data.len() {
                    return Err(BencodeError::UnexpectedEof);
                }
                let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
                self.pos += len;
                Ok(Value::Bytes(bytes))
            }
            other => Err(BencodeError::UnexpectedByte(other, self.pos)),
        }
    }

    fn take_until(&mut self, terminator: u8) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        loop {
            if self.bump()? == terminator {
                return Ok(&self.data[start..self.pos - 1]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip() {
        for i in [0i64, 1, -1, 42, i64::MAX, i64::MIN] {
            let encoded = encode(&Value::Integer(i));
            assert_eq!(decode(&encoded).unwrap(), Value::Integer(i));
        }
    }

    #[test]
    fn string_round_trip() {
        let value = Value::string("hello world");
        assert_eq!(encode(&value), b"11:hello world");
        assert_eq!(decode(b"11:hello world").unwrap(), value);
    }

    #[test]
    fn binary_strings_survive() {
        let raw: Vec<u8> = (0..=255u8).collect();
        let value = Value::bytes(&raw);
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn dict_keys_sorted() {
        let value = dict([
            (b"zz".as_slice(), Value::Integer(1)),
            (b"aa".as_slice(), Value::Integer(2)),
        ]);
        assert_eq!(encode(&value), b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn nested_round_trip() {
        let value = dict([
            (b"interval".as_slice(), Value::Integer(1800)),
            (
                b"peers".as_slice(),
                Value::List(vec![dict([
                    (b"ip".as_slice(), Value::string("127.0.0.1")),
                    (b"port".as_slice(), Value::Integer(6881)),
                ])]),
            ),
        ]);
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn float_extension() {
        let encoded = encode(&Value::Float(0.5));
        assert_eq!(encoded, b"f0.500000e");
        assert_eq!(decode(&encoded).unwrap().as_float(), Some(0.5));
    }

    #[test]
    fn rejects_truncated() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"5:ab").is_err());
        assert!(decode(b"l").is_err());
        assert!(decode(b"d2:ab").is_err());
    }

    #[test]
    fn rejects_trailing() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut data = Vec::new();
        data.extend(std::iter::repeat(b'l').take(64));
        data.extend(std::iter::repeat(b'e').take(64));
        assert!(matches!(decode(&data), Err(BencodeError::TooDeep)));
    }
}
