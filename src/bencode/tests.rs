use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn decode_integer_rejects_bad_forms() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i01e").is_err());
    assert!(decode(b"i007e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i42").is_err());
    assert!(decode(b"i4x2e").is_err());
}

#[test]
fn decode_integer_rejects_oversized() {
    let mut data = b"i1".to_vec();
    data.extend(std::iter::repeat(b'0').take(120));
    data.push(b'e');
    assert!(decode(&data).is_err());

    // Fits in 100 digits but not in i64.
    assert!(decode(b"i99999999999999999999e").is_err());
}

#[test]
fn decode_byte_strings() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
}

#[test]
fn decode_string_rejects_truncation() {
    assert!(decode(b"5:spam").is_err());
    assert!(decode(b"100:short").is_err());
    assert!(decode(b"4spam").is_err());
    assert!(decode(b"04:spam").is_err());
}

#[test]
fn decode_lists() {
    let result = decode(b"l4:spami42ee").unwrap();
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0], Value::Bytes(Bytes::from_static(b"spam")));
    assert_eq!(list[1], Value::Integer(42));

    assert!(decode(b"l4:spam").is_err());
}

#[test]
fn decode_dicts() {
    let result = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    let dict = result.as_dict().unwrap();
    assert_eq!(dict.len(), 2);
    assert_eq!(
        dict.get(b"cow".as_slice()),
        Some(&Value::Bytes(Bytes::from_static(b"moo")))
    );

    // Keys must be byte strings; containers must be terminated.
    assert!(decode(b"di1e3:mooe").is_err());
    assert!(decode(b"d3:cow3:moo").is_err());
}

#[test]
fn decode_reports_offset() {
    match decode(b"l4:spamxe").unwrap_err() {
        BencodeError::Malformed { offset, .. } => assert_eq!(offset, 7),
    }
}

#[test]
fn decode_depth_limited() {
    let mut data = vec![b'l'; 80];
    data.extend(vec![b'e'; 80]);
    assert!(decode(&data).is_err());
}

#[test]
fn decode_prefix_reports_consumed() {
    let (value, consumed) = decode_prefix(b"i42etrailing").unwrap();
    assert_eq!(value, Value::Integer(42));
    assert_eq!(consumed, 4);

    assert!(decode(b"i42etrailing").is_err());
}

#[test]
fn encode_kinds() {
    assert_eq!(encode(&Value::Integer(42)), b"i42e");
    assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
    assert_eq!(encode(&Value::Bytes(Bytes::from_static(b"spam"))), b"4:spam");

    let list = Value::List(vec![
        Value::Bytes(Bytes::from_static(b"spam")),
        Value::Integer(42),
    ]);
    assert_eq!(encode(&list), b"l4:spami42ee");
}

#[test]
fn encode_sorts_dict_keys() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"value"), Value::Integer(42));
    dict.insert(Bytes::from_static(b"name"), Value::string("example"));
    assert_eq!(encode(&Value::Dict(dict)), b"d4:name7:example5:valuei42ee");
}

#[test]
fn roundtrip_is_canonical() {
    let wire = b"d4:name7:example5:valuei42ee";
    let (decoded, consumed) = decode_prefix(wire).unwrap();
    assert_eq!(consumed, 28);
    assert_eq!(encode(&decoded), wire);
}

#[test]
fn roundtrip_nested() {
    let wire = b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAAe1:q4:ping1:t2:aa1:y1:qe";
    let decoded = decode(wire).unwrap();
    assert_eq!(encode(&decoded), wire);
}

#[test]
fn value_accessors() {
    let value = Value::Integer(42);
    assert_eq!(value.as_integer(), Some(42));
    assert!(value.as_bytes().is_none());

    let value = Value::string("test");
    assert_eq!(value.as_str(), Some("test"));
    assert!(value.as_integer().is_none());

    let value = Value::List(vec![]);
    assert!(value.as_list().is_some());
    assert!(value.as_dict().is_none());
}
