use super::value::Value;
use std::io::Write;

/// Encodes a bencode value to its canonical wire form.
///
/// The output is deterministic: equal values produce byte-identical output,
/// and dictionary keys are emitted in ascending lexicographic order (the
/// `BTreeMap` iteration order).
///
/// # Examples
///
/// ```
/// use dhtscout::bencode::{encode, Value};
///
/// assert_eq!(encode(&Value::Integer(42)), b"i42e");
/// assert_eq!(encode(&Value::string("spam")), b"4:spam");
/// ```
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    buf
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    // Writes into a Vec cannot fail.
    match value {
        Value::Integer(i) => {
            let _ = write!(buf, "i{}e", i);
        }
        Value::Bytes(b) => {
            let _ = write!(buf, "{}:", b.len());
            buf.extend_from_slice(b);
        }
        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                encode_value(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            buf.push(b'd');
            for (key, val) in d {
                let _ = write!(buf, "{}:", key.len());
                buf.extend_from_slice(key);
                encode_value(val, buf);
            }
            buf.push(b'e');
        }
    }
}
