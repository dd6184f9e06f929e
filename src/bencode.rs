use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// A decoded bencode value.
///
/// Dictionary keys stay raw bytes: the metainfo format hashes the re-encoded
/// `info` dictionary, so keys and string values must survive a round trip
/// without any text re-interpretation. `BTreeMap` keeps keys in lexicographic
/// byte order, which is exactly the order a canonical encoding needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Decodes a single bencoded value, rejecting trailing bytes.
    pub fn decode(input: &[u8]) -> Result<Value> {
        let (value, rest) = decode_value(input)?;
        if !rest.is_empty() {
            return Err(Error::Bencode(format!(
                "{} trailing bytes after value",
                rest.len()
            )));
        }
        Ok(value)
    }

    /// Canonical encoding: `i<n>e`, `<len>:<bytes>`, `l…e`, `d…e` with
    /// dictionary keys in lexicographic byte order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(self, &mut out);
        out
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Dictionary lookup by raw key.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|entries| entries.get(key))
    }

    /// Renders the value as JSON for the `decode` command. Byte strings are
    /// shown as (lossy) UTF-8 text, matching how torrent dictionaries are
    /// usually inspected by hand.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
            Value::List(items) => items.iter().map(Value::to_json).collect(),
            Value::Dict(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| {
                        (String::from_utf8_lossy(key).into_owned(), value.to_json())
                    })
                    .collect(),
            ),
        }
    }
}

fn decode_value(input: &[u8]) -> Result<(Value, &[u8])> {
    match input.first() {
        Some(b'i') => decode_int(&input[1..]),
        Some(b'l') => {
            let mut rest = &input[1..];
            let mut items = Vec::new();
            while !rest.starts_with(b"e") {
                if rest.is_empty() {
                    return Err(Error::Bencode("unterminated list".into()));
                }
                let (item, remainder) = decode_value(rest)?;
                items.push(item);
                rest = remainder;
            }
            Ok((Value::List(items), &rest[1..]))
        }
        Some(b'd') => {
            let mut rest = &input[1..];
            let mut entries = BTreeMap::new();
            while !rest.starts_with(b"e") {
                if rest.is_empty() {
                    return Err(Error::Bencode("unterminated dictionary".into()));
                }
                let (key, remainder) = decode_value(rest)?;
                let Value::Bytes(key) = key else {
                    return Err(Error::Bencode("dictionary key is not a string".into()));
                };
                let (value, remainder) = decode_value(remainder)?;
                entries.insert(key, value);
                rest = remainder;
            }
            Ok((Value::Dict(entries), &rest[1..]))
        }
        Some(b'0'..=b'9') => decode_bytes(input),
        Some(other) => Err(Error::Bencode(format!(
            "unexpected byte {other:#04x} at start of value"
        ))),
        None => Err(Error::Bencode("empty input".into())),
    }
}

fn decode_int(input: &[u8]) -> Result<(Value, &[u8])> {
    let end = input
        .iter()
        .position(|&b| b == b'e')
        .ok_or_else(|| Error::Bencode("unterminated integer".into()))?;
    let digits = &input[..end];
    let text = std::str::from_utf8(digits)
        .map_err(|_| Error::Bencode("non-ASCII integer".into()))?;
    // i-0e and zero-padded integers have no canonical meaning
    if text == "-0" || (text.len() > 1 && (text.starts_with('0') || text.starts_with("-0"))) {
        return Err(Error::Bencode(format!("non-canonical integer {text:?}")));
    }
    let n = text
        .parse::<i64>()
        .map_err(|_| Error::Bencode(format!("invalid integer {text:?}")))?;
    Ok((Value::Int(n), &input[end + 1..]))
}

fn decode_bytes(input: &[u8]) -> Result<(Value, &[u8])> {
    let colon = input
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::Bencode("string without length separator".into()))?;
    let len = std::str::from_utf8(&input[..colon])
        .ok()
        .and_then(|digits| digits.parse::<usize>().ok())
        .ok_or_else(|| Error::Bencode("invalid string length".into()))?;
    let start = colon + 1;
    if input.len() < start + len {
        return Err(Error::Bencode(format!(
            "string length {len} exceeds remaining input"
        )));
    }
    let bytes = input[start..start + len].to_vec();
    Ok((Value::Bytes(bytes), &input[start + len..]))
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, value) in entries {
                encode_value(&Value::Bytes(key.clone()), out);
                encode_value(value, out);
            }
            out.push(b'e');
        }
    }
}

#[test]
fn decode_renders_json() {
    let value = Value::decode(b"d3:foo3:bar5:helloi52ee").unwrap();
    assert_eq!(value.to_json().to_string(), r#"{"foo":"bar","hello":52}"#);
}

#[test]
fn decode_nested_list() {
    let value = Value::decode(b"l5:helloi-52eli1ei2eee").unwrap();
    assert_eq!(value.to_json().to_string(), r#"["hello",-52,[1,2]]"#);
}

#[test]
fn round_trips_canonical_input() {
    let samples: &[&[u8]] = &[
        b"i52e",
        b"i-3e",
        b"0:",
        b"5:hello",
        b"le",
        b"de",
        b"d3:cow3:moo4:spam4:eggse",
        b"d4:spaml1:a1:bee",
        b"d8:announce9:localhost4:infod6:lengthi92064e12:piece lengthi32768eee",
    ];
    for sample in samples {
        let value = Value::decode(sample).unwrap();
        assert_eq!(&value.encode(), sample);
    }
}

#[test]
fn encode_sorts_dictionary_keys() {
    let mut entries = BTreeMap::new();
    entries.insert(b"zebra".to_vec(), Value::Int(1));
    entries.insert(b"apple".to_vec(), Value::Int(2));
    assert_eq!(Value::Dict(entries).encode(), b"d5:applei2e5:zebrai1ee");
}

#[test]
fn rejects_malformed_input() {
    assert!(Value::decode(b"").is_err());
    assert!(Value::decode(b"i52").is_err());
    assert!(Value::decode(b"i-0e").is_err());
    assert!(Value::decode(b"i03e").is_err());
    assert!(Value::decode(b"5:hi").is_err());
    assert!(Value::decode(b"l5:hello").is_err());
    assert!(Value::decode(b"di1e3:fooe").is_err());
    assert!(Value::decode(b"i1ei2e").is_err());
}

#[test]
fn preserves_non_utf8_bytes() {
    let raw = b"4:\xc0\xa8\x01\x02";
    let value = Value::decode(raw).unwrap();
    assert_eq!(value, Value::Bytes(vec![0xc0, 0xa8, 0x01, 0x02]));
    assert_eq!(&value.encode(), raw);
}
