use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

// Decimal digits allowed in an integer payload. Values past this are junk or
// an attempted resource-exhaustion probe; real DHT traffic never approaches it.
const MAX_INT_DIGITS: usize = 100;

/// Decodes exactly one bencode value from a byte slice.
///
/// The input must contain one complete value with no trailing data. Use
/// [`decode_prefix`] to parse a value off the front of a larger buffer.
///
/// # Errors
///
/// Returns [`BencodeError::Malformed`] with the offending byte offset on any
/// grammar violation, truncation, unterminated container, or nesting deeper
/// than 64 levels.
///
/// # Examples
///
/// ```
/// use dhtscout::bencode::decode;
///
/// let int = decode(b"i42e").unwrap();
/// assert_eq!(int.as_integer(), Some(42));
///
/// let dict = decode(b"d4:name7:example5:valuei42ee").unwrap();
/// assert_eq!(dict.get(b"name").and_then(|v| v.as_str()), Some("example"));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::at(consumed, "trailing data after value"));
    }
    Ok(value)
}

/// Decodes one bencode value from the front of a byte slice.
///
/// Returns the value and the number of bytes consumed; trailing bytes are
/// left for the caller.
///
/// # Examples
///
/// ```
/// use dhtscout::bencode::decode_prefix;
///
/// let (value, consumed) = decode_prefix(b"i7etrailing").unwrap();
/// assert_eq!(value.as_integer(), Some(7));
/// assert_eq!(consumed, 3);
/// ```
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0)?;
    Ok((value, pos))
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::at(*pos, "nesting too deep"));
    }

    match data.get(*pos) {
        None => Err(BencodeError::at(*pos, "unexpected end of input")),
        Some(b'i') => decode_integer(data, pos),
        Some(b'l') => decode_list(data, pos, depth),
        Some(b'd') => decode_dict(data, pos, depth),
        Some(b'0'..=b'9') => decode_bytes(data, pos),
        Some(_) => Err(BencodeError::at(*pos, "unexpected byte")),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let start = *pos;

    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::at(start, "integer missing terminator"));
    }

    let body = &data[start..*pos];
    let digits = if body.first() == Some(&b'-') {
        &body[1..]
    } else {
        body
    };

    if digits.is_empty() {
        return Err(BencodeError::at(start, "empty integer"));
    }
    if digits.len() > MAX_INT_DIGITS {
        return Err(BencodeError::at(start, "integer too long"));
    }
    if digits[0] == b'0' && (digits.len() > 1 || body[0] == b'-') {
        // Catches both leading zeros and "-0"; "i0e" itself is fine.
        return Err(BencodeError::at(start, "invalid leading zero"));
    }

    let text = std::str::from_utf8(body).map_err(|_| BencodeError::at(start, "invalid digit"))?;
    let value: i64 = text
        .parse()
        .map_err(|_| BencodeError::at(start, "integer out of range"))?;

    *pos += 1;
    Ok(Value::Integer(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos;

    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::at(start, "string length missing separator"));
    }

    let len_digits = &data[start..*pos];
    if len_digits[0] == b'0' && len_digits.len() > 1 {
        return Err(BencodeError::at(start, "invalid leading zero in length"));
    }

    let len_text =
        std::str::from_utf8(len_digits).map_err(|_| BencodeError::at(start, "invalid length"))?;
    let len: usize = len_text
        .parse()
        .map_err(|_| BencodeError::at(start, "length out of range"))?;

    *pos += 1;

    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| BencodeError::at(start, "string truncated"))?;

    let bytes = Bytes::copy_from_slice(&data[*pos..end]);
    *pos = end;

    Ok(Value::Bytes(bytes))
}

fn decode_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    let start = *pos;
    *pos += 1;
    let mut list = Vec::new();

    while *pos < data.len() && data[*pos] != b'e' {
        list.push(decode_value(data, pos, depth + 1)?);
    }
    if *pos >= data.len() {
        return Err(BencodeError::at(start, "unterminated list"));
    }

    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    let start = *pos;
    *pos += 1;
    let mut dict = BTreeMap::new();

    while *pos < data.len() && data[*pos] != b'e' {
        let key_pos = *pos;
        let key = match decode_value(data, pos, depth + 1)? {
            Value::Bytes(b) => b,
            _ => return Err(BencodeError::at(key_pos, "dictionary key must be a byte string")),
        };

        let value = decode_value(data, pos, depth + 1)?;
        dict.insert(key, value);
    }
    if *pos >= data.len() {
        return Err(BencodeError::at(start, "unterminated dictionary"));
    }

    *pos += 1;
    Ok(Value::Dict(dict))
}
