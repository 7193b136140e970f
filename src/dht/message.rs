use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use super::error::DhtError;
use super::info_hash::InfoHash;
use super::node::{Contact, NodeId};
use crate::bencode::{self, Value};

pub type TransactionId = Bytes;

/// KRPC error codes seen on the wire.
pub const ERR_GENERIC: i64 = 201;
pub const ERR_SERVER: i64 = 202;
pub const ERR_PROTOCOL: i64 = 203;
pub const ERR_METHOD_UNKNOWN: i64 = 204;

/// Upper bound on `samples` entries per BEP 51 message, both directions.
pub const MAX_SAMPLES: usize = 20;

const COMPACT_CONTACT_LEN: usize = 26;
const COMPACT_PEER_LEN: usize = 6;

/// A parsed DHT message: query, response, or error.
#[derive(Debug, Clone)]
pub enum Message {
    Query(QueryMessage),
    Response(ResponseMessage),
    Error(ErrorMessage),
}

#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub tid: TransactionId,
    pub sender_id: NodeId,
    /// Method name as sent by the peer, preserved for unknown methods.
    pub method: String,
    pub query: Query,
}

#[derive(Debug, Clone)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: InfoHash },
    SampleInfohashes { target: NodeId },
    /// A method we do not implement; answered with error 204.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub tid: TransactionId,
    pub body: ResponseBody,
}

/// The `r` dictionary of a response, decoded.
///
/// Which fields are meaningful depends on the query the response answers;
/// the engine knows that from its transaction record.
#[derive(Debug, Clone)]
pub struct ResponseBody {
    pub id: NodeId,
    pub nodes: Vec<Contact>,
    pub peers: Vec<SocketAddrV4>,
    pub token: Option<Bytes>,
    pub samples: Vec<InfoHash>,
    pub interval: Option<i64>,
    pub num: Option<i64>,
}

impl ResponseBody {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            peers: Vec::new(),
            token: None,
            samples: Vec::new(),
            interval: None,
            num: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub tid: TransactionId,
    pub code: i64,
    pub message: String,
}

impl Message {
    pub fn ping(tid: TransactionId, our_id: NodeId) -> Self {
        Self::query(tid, our_id, "ping", Query::Ping)
    }

    pub fn find_node(tid: TransactionId, our_id: NodeId, target: NodeId) -> Self {
        Self::query(tid, our_id, "find_node", Query::FindNode { target })
    }

    pub fn get_peers(tid: TransactionId, our_id: NodeId, info_hash: InfoHash) -> Self {
        Self::query(tid, our_id, "get_peers", Query::GetPeers { info_hash })
    }

    pub fn sample_infohashes(tid: TransactionId, our_id: NodeId, target: NodeId) -> Self {
        Self::query(
            tid,
            our_id,
            "sample_infohashes",
            Query::SampleInfohashes { target },
        )
    }

    fn query(tid: TransactionId, our_id: NodeId, method: &str, query: Query) -> Self {
        Message::Query(QueryMessage {
            tid,
            sender_id: our_id,
            method: method.to_string(),
            query,
        })
    }

    pub fn ping_reply(tid: TransactionId, our_id: NodeId) -> Self {
        Message::Response(ResponseMessage {
            tid,
            body: ResponseBody::new(our_id),
        })
    }

    pub fn find_node_reply(tid: TransactionId, our_id: NodeId, nodes: Vec<Contact>) -> Self {
        let mut body = ResponseBody::new(our_id);
        body.nodes = nodes;
        Message::Response(ResponseMessage { tid, body })
    }

    pub fn get_peers_reply(
        tid: TransactionId,
        our_id: NodeId,
        token: Bytes,
        nodes: Vec<Contact>,
    ) -> Self {
        let mut body = ResponseBody::new(our_id);
        body.token = Some(token);
        body.nodes = nodes;
        Message::Response(ResponseMessage { tid, body })
    }

    pub fn sample_reply(
        tid: TransactionId,
        our_id: NodeId,
        nodes: Vec<Contact>,
        mut samples: Vec<InfoHash>,
        interval: i64,
        num: i64,
    ) -> Self {
        samples.truncate(MAX_SAMPLES);
        let mut body = ResponseBody::new(our_id);
        body.nodes = nodes;
        body.samples = samples;
        body.interval = Some(interval);
        body.num = Some(num);
        Message::Response(ResponseMessage { tid, body })
    }

    pub fn error_reply(tid: TransactionId, code: i64, message: &str) -> Self {
        Message::Error(ErrorMessage {
            tid,
            code,
            message: message.to_string(),
        })
    }

    /// Encodes to the canonical bencode wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();

        match self {
            Message::Query(q) => {
                dict.insert(Bytes::from_static(b"t"), Value::Bytes(q.tid.clone()));
                dict.insert(Bytes::from_static(b"y"), Value::string("q"));
                dict.insert(Bytes::from_static(b"q"), Value::string(&q.method));

                let mut args = BTreeMap::new();
                args.insert(
                    Bytes::from_static(b"id"),
                    Value::Bytes(Bytes::copy_from_slice(q.sender_id.as_bytes())),
                );
                match &q.query {
                    Query::Ping | Query::Unknown => {}
                    Query::FindNode { target } | Query::SampleInfohashes { target } => {
                        args.insert(
                            Bytes::from_static(b"target"),
                            Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
                        );
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(
                            Bytes::from_static(b"info_hash"),
                            Value::Bytes(Bytes::copy_from_slice(info_hash.as_bytes())),
                        );
                    }
                }
                dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
            }
            Message::Response(r) => {
                dict.insert(Bytes::from_static(b"t"), Value::Bytes(r.tid.clone()));
                dict.insert(Bytes::from_static(b"y"), Value::string("r"));

                let body = &r.body;
                let mut resp = BTreeMap::new();
                resp.insert(
                    Bytes::from_static(b"id"),
                    Value::Bytes(Bytes::copy_from_slice(body.id.as_bytes())),
                );
                if !body.nodes.is_empty() {
                    resp.insert(
                        Bytes::from_static(b"nodes"),
                        Value::Bytes(Bytes::from(pack_nodes(&body.nodes))),
                    );
                }
                if !body.peers.is_empty() {
                    let values = body
                        .peers
                        .iter()
                        .map(|addr| Value::Bytes(Bytes::copy_from_slice(&pack_peer(addr))))
                        .collect();
                    resp.insert(Bytes::from_static(b"values"), Value::List(values));
                }
                if let Some(token) = &body.token {
                    resp.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                }
                if !body.samples.is_empty() {
                    let packed: Vec<u8> = body
                        .samples
                        .iter()
                        .take(MAX_SAMPLES)
                        .flat_map(|h| h.0)
                        .collect();
                    resp.insert(Bytes::from_static(b"samples"), Value::Bytes(Bytes::from(packed)));
                }
                if let Some(interval) = body.interval {
                    resp.insert(Bytes::from_static(b"interval"), Value::Integer(interval));
                }
                if let Some(num) = body.num {
                    resp.insert(Bytes::from_static(b"num"), Value::Integer(num));
                }
                dict.insert(Bytes::from_static(b"r"), Value::Dict(resp));
            }
            Message::Error(e) => {
                dict.insert(Bytes::from_static(b"t"), Value::Bytes(e.tid.clone()));
                dict.insert(Bytes::from_static(b"y"), Value::string("e"));
                dict.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Integer(e.code), Value::string(&e.message)]),
                );
            }
        }

        bencode::encode(&Value::Dict(dict))
    }

    /// Parses a datagram into a message, validating every referenced field.
    ///
    /// Unknown query methods parse successfully as [`Query::Unknown`]; the
    /// engine answers those with error 204 rather than failing here.
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        let dict = value.as_dict().ok_or(DhtError::TypeMismatch {
            field: "message",
            reason: "expected a dictionary",
        })?;

        let tid = dict
            .get(b"t".as_slice())
            .ok_or(DhtError::MissingField("t"))?
            .as_bytes()
            .ok_or(DhtError::TypeMismatch {
                field: "t",
                reason: "expected a byte string",
            })?
            .clone();
        if tid.is_empty() {
            return Err(DhtError::TypeMismatch {
                field: "t",
                reason: "must be nonempty",
            });
        }

        let kind = dict
            .get(b"y".as_slice())
            .ok_or(DhtError::MissingField("y"))?
            .as_str()
            .ok_or(DhtError::TypeMismatch {
                field: "y",
                reason: "expected a byte string",
            })?;

        match kind {
            "q" => Self::parse_query(tid, dict),
            "r" => Self::parse_response(tid, dict),
            "e" => Self::parse_error(tid, dict),
            _ => Err(DhtError::TypeMismatch {
                field: "y",
                reason: "unknown message kind",
            }),
        }
    }

    fn parse_query(tid: TransactionId, dict: &BTreeMap<Bytes, Value>) -> Result<Self, DhtError> {
        let method = dict
            .get(b"q".as_slice())
            .ok_or(DhtError::MissingField("q"))?
            .as_str()
            .ok_or(DhtError::TypeMismatch {
                field: "q",
                reason: "expected a byte string",
            })?
            .to_string();

        let args = dict
            .get(b"a".as_slice())
            .ok_or(DhtError::MissingField("a"))?
            .as_dict()
            .ok_or(DhtError::TypeMismatch {
                field: "a",
                reason: "expected a dictionary",
            })?;

        let sender_id = id_field(args, "id")?;

        let query = match method.as_str() {
            "ping" => Query::Ping,
            "find_node" => Query::FindNode {
                target: id_field(args, "target")?,
            },
            "get_peers" => Query::GetPeers {
                info_hash: InfoHash(id_field(args, "info_hash")?.0),
            },
            "sample_infohashes" => Query::SampleInfohashes {
                target: id_field(args, "target")?,
            },
            _ => Query::Unknown,
        };

        Ok(Message::Query(QueryMessage {
            tid,
            sender_id,
            method,
            query,
        }))
    }

    fn parse_response(tid: TransactionId, dict: &BTreeMap<Bytes, Value>) -> Result<Self, DhtError> {
        let resp = dict
            .get(b"r".as_slice())
            .ok_or(DhtError::MissingField("r"))?
            .as_dict()
            .ok_or(DhtError::TypeMismatch {
                field: "r",
                reason: "expected a dictionary",
            })?;

        let mut body = ResponseBody::new(id_field(resp, "id")?);

        if let Some(value) = resp.get(b"nodes".as_slice()) {
            let raw = value.as_bytes().ok_or(DhtError::TypeMismatch {
                field: "nodes",
                reason: "expected a byte string",
            })?;
            body.nodes = unpack_nodes(raw)?;
        }

        if let Some(value) = resp.get(b"values".as_slice()) {
            let list = value.as_list().ok_or(DhtError::TypeMismatch {
                field: "values",
                reason: "expected a list",
            })?;
            body.peers = unpack_peers(list)?;
        }

        if let Some(value) = resp.get(b"token".as_slice()) {
            let token = value.as_bytes().ok_or(DhtError::TypeMismatch {
                field: "token",
                reason: "expected a byte string",
            })?;
            body.token = Some(token.clone());
        }

        if let Some(value) = resp.get(b"samples".as_slice()) {
            let raw = value.as_bytes().ok_or(DhtError::TypeMismatch {
                field: "samples",
                reason: "expected a byte string",
            })?;
            body.samples = unpack_samples(raw)?;
        }

        if let Some(value) = resp.get(b"interval".as_slice()) {
            body.interval = Some(value.as_integer().ok_or(DhtError::TypeMismatch {
                field: "interval",
                reason: "expected an integer",
            })?);
        }

        if let Some(value) = resp.get(b"num".as_slice()) {
            body.num = Some(value.as_integer().ok_or(DhtError::TypeMismatch {
                field: "num",
                reason: "expected an integer",
            })?);
        }

        Ok(Message::Response(ResponseMessage { tid, body }))
    }

    fn parse_error(tid: TransactionId, dict: &BTreeMap<Bytes, Value>) -> Result<Self, DhtError> {
        let list = dict
            .get(b"e".as_slice())
            .ok_or(DhtError::MissingField("e"))?
            .as_list()
            .ok_or(DhtError::TypeMismatch {
                field: "e",
                reason: "expected a list",
            })?;

        let code = list
            .first()
            .and_then(|v| v.as_integer())
            .ok_or(DhtError::TypeMismatch {
                field: "e",
                reason: "expected [code, message]",
            })?;
        let message = list.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();

        Ok(Message::Error(ErrorMessage { tid, code, message }))
    }
}

fn id_field(dict: &BTreeMap<Bytes, Value>, key: &'static str) -> Result<NodeId, DhtError> {
    let bytes = dict
        .get(key.as_bytes())
        .ok_or(DhtError::MissingField(key))?
        .as_bytes()
        .ok_or(DhtError::TypeMismatch {
            field: key,
            reason: "expected a byte string",
        })?;
    NodeId::from_bytes(bytes).map_err(|_| DhtError::TypeMismatch {
        field: key,
        reason: "expected 20 bytes",
    })
}

/// Packs contacts into the N x 26-byte compact node format.
pub fn pack_nodes(nodes: &[Contact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_CONTACT_LEN);
    for node in nodes {
        out.extend_from_slice(&node.to_compact());
    }
    out
}

/// Unpacks the compact node format.
///
/// A length that is not a multiple of 26 is a parse error; entries with a
/// zero port are skipped.
pub fn unpack_nodes(data: &[u8]) -> Result<Vec<Contact>, DhtError> {
    if data.len() % COMPACT_CONTACT_LEN != 0 {
        return Err(DhtError::TypeMismatch {
            field: "nodes",
            reason: "length not a multiple of 26",
        });
    }
    Ok(data
        .chunks_exact(COMPACT_CONTACT_LEN)
        .filter_map(Contact::from_compact)
        .collect())
}

/// Unpacks a BEP 51 `samples` field: concatenated 20-byte info hashes,
/// truncated to [`MAX_SAMPLES`] entries.
pub fn unpack_samples(data: &[u8]) -> Result<Vec<InfoHash>, DhtError> {
    if data.len() % 20 != 0 {
        return Err(DhtError::TypeMismatch {
            field: "samples",
            reason: "length not a multiple of 20",
        });
    }
    Ok(data
        .chunks_exact(20)
        .take(MAX_SAMPLES)
        .filter_map(|chunk| InfoHash::from_bytes(chunk).ok())
        .collect())
}

fn pack_peer(addr: &SocketAddrV4) -> [u8; COMPACT_PEER_LEN] {
    let mut out = [0u8; COMPACT_PEER_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..6].copy_from_slice(&addr.port().to_be_bytes());
    out
}

fn unpack_peers(list: &[Value]) -> Result<Vec<SocketAddrV4>, DhtError> {
    let mut peers = Vec::with_capacity(list.len());
    for value in list {
        let raw = value.as_bytes().ok_or(DhtError::TypeMismatch {
            field: "values",
            reason: "expected byte-string entries",
        })?;
        if raw.len() != COMPACT_PEER_LEN {
            return Err(DhtError::TypeMismatch {
                field: "values",
                reason: "expected 6-byte entries",
            });
        }
        let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
        let port = u16::from_be_bytes([raw[4], raw[5]]);
        if port != 0 {
            peers.push(SocketAddrV4::new(ip, port));
        }
    }
    Ok(peers)
}
