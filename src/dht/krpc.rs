use super::error::DhtError;
use super::node::{NodeEntry, NodeId};
use crate::bencode::{decode, encode, Value};
use crate::types::InfoHash;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Transaction id correlating a query with its response (16-bit on the
/// wire, carried as raw bytes).
pub type TransactionId = Bytes;

/// A query we can send or serve.
#[derive(Debug, Clone)]
pub enum KrpcQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl KrpcQuery {
    pub fn method(&self) -> &'static str {
        match self {
            KrpcQuery::Ping => "ping",
            KrpcQuery::FindNode { .. } => "find_node",
            KrpcQuery::GetPeers { .. } => "get_peers",
            KrpcQuery::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// A response, including the error form.
#[derive(Debug, Clone)]
pub enum KrpcResponse {
    Pong {
        id: NodeId,
    },
    Nodes {
        id: NodeId,
        nodes: Vec<NodeEntry>,
    },
    Peers {
        id: NodeId,
        token: Bytes,
        peers: Vec<SocketAddr>,
        nodes: Vec<NodeEntry>,
    },
    Announced {
        id: NodeId,
    },
    Error {
        code: i64,
        message: String,
    },
}

/// One KRPC datagram, either direction.
#[derive(Debug, Clone)]
pub enum KrpcMessage {
    Query {
        transaction_id: TransactionId,
        sender_id: NodeId,
        query: KrpcQuery,
    },
    Response {
        transaction_id: TransactionId,
        response: KrpcResponse,
    },
}

impl KrpcMessage {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            KrpcMessage::Query { transaction_id, .. } => transaction_id,
            KrpcMessage::Response { transaction_id, .. } => transaction_id,
        }
    }

    /// The sender's node id, when the message carries one.
    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            KrpcMessage::Query { sender_id, .. } => Some(*sender_id),
            KrpcMessage::Response { response, .. } => match response {
                KrpcResponse::Pong { id }
                | KrpcResponse::Nodes { id, .. }
                | KrpcResponse::Peers { id, .. }
                | KrpcResponse::Announced { id } => Some(*id),
                KrpcResponse::Error { .. } => None,
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut root: BTreeMap<Bytes, Value> = BTreeMap::new();
        root.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.transaction_id().clone()),
        );

        match self {
            KrpcMessage::Query {
                sender_id, query, ..
            } => {
                root.insert(Bytes::from_static(b"y"), Value::string("q"));
                root.insert(Bytes::from_static(b"q"), Value::string(query.method()));

                let mut args: BTreeMap<Bytes, Value> = BTreeMap::new();
                args.insert(Bytes::from_static(b"id"), Value::bytes(sender_id.as_bytes()));
                match query {
                    KrpcQuery::Ping => {}
                    KrpcQuery::FindNode { target } => {
                        args.insert(Bytes::from_static(b"target"), Value::bytes(target.as_bytes()));
                    }
                    KrpcQuery::GetPeers { info_hash } => {
                        args.insert(
                            Bytes::from_static(b"info_hash"),
                            Value::bytes(info_hash.as_bytes()),
                        );
                    }
                    KrpcQuery::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => {
                        args.insert(
                            Bytes::from_static(b"info_hash"),
                            Value::bytes(info_hash.as_bytes()),
                        );
                        args.insert(Bytes::from_static(b"port"), Value::Integer(i64::from(*port)));
                        args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                        if *implied_port {
                            args.insert(Bytes::from_static(b"implied_port"), Value::Integer(1));
                        }
                    }
                }
                root.insert(Bytes::from_static(b"a"), Value::Dict(args));
            }
            KrpcMessage::Response { response, .. } => match response {
                KrpcResponse::Error { code, message } => {
                    root.insert(Bytes::from_static(b"y"), Value::string("e"));
                    root.insert(
                        Bytes::from_static(b"e"),
                        Value::List(vec![Value::Integer(*code), Value::string(message)]),
                    );
                }
                _ => {
                    root.insert(Bytes::from_static(b"y"), Value::string("r"));
                    let mut body: BTreeMap<Bytes, Value> = BTreeMap::new();
                    match response {
                        KrpcResponse::Pong { id } | KrpcResponse::Announced { id } => {
                            body.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
                        }
                        KrpcResponse::Nodes { id, nodes } => {
                            body.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
                            body.insert(
                                Bytes::from_static(b"nodes"),
                                Value::Bytes(compact_nodes(nodes)),
                            );
                        }
                        KrpcResponse::Peers {
                            id,
                            token,
                            peers,
                            nodes,
                        } => {
                            body.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
                            body.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                            if !peers.is_empty() {
                                let values = peers
                                    .iter()
                                    .filter_map(compact_peer)
                                    .map(|b| Value::Bytes(Bytes::copy_from_slice(&b)))
                                    .collect();
                                body.insert(Bytes::from_static(b"values"), Value::List(values));
                            }
                            if !nodes.is_empty() {
                                body.insert(
                                    Bytes::from_static(b"nodes"),
                                    Value::Bytes(compact_nodes(nodes)),
                                );
                            }
                        }
                        KrpcResponse::Error { .. } => unreachable!(),
                    }
                    root.insert(Bytes::from_static(b"r"), Value::Dict(body));
                }
            },
        }

        encode(&Value::Dict(root))
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let root = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let transaction_id = root
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        match root.get(b"y".as_slice()).and_then(|v| v.as_str()) {
            Some("q") => Self::parse_query(transaction_id, root),
            Some("r") => Self::parse_response(transaction_id, root),
            Some("e") => Self::parse_error(transaction_id, root),
            other => Err(DhtError::InvalidMessage(format!(
                "unknown message type {:?}",
                other
            ))),
        }
    }

    fn parse_query(
        transaction_id: TransactionId,
        root: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let method = root
            .get(b"q".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;
        let args = root
            .get(b"a".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

        let sender_id = required_id(args, b"id")?;

        let query = match method {
            "ping" => KrpcQuery::Ping,
            "find_node" => KrpcQuery::FindNode {
                target: required_id(args, b"target")?,
            },
            "get_peers" => KrpcQuery::GetPeers {
                info_hash: required_hash(args, b"info_hash")?,
            },
            "announce_peer" => KrpcQuery::AnnouncePeer {
                info_hash: required_hash(args, b"info_hash")?,
                port: args
                    .get(b"port".as_slice())
                    .and_then(|v| v.as_integer())
                    .ok_or_else(|| DhtError::InvalidMessage("missing port".into()))?
                    as u16,
                token: args
                    .get(b"token".as_slice())
                    .and_then(|v| v.as_bytes())
                    .cloned()
                    .ok_or_else(|| DhtError::InvalidMessage("missing token".into()))?,
                implied_port: args
                    .get(b"implied_port".as_slice())
                    .and_then(|v| v.as_integer())
                    == Some(1),
            },
            other => {
                return Err(DhtError::InvalidMessage(format!("unknown query {}", other)));
            }
        };

        Ok(KrpcMessage::Query {
            transaction_id,
            sender_id,
            query,
        })
    }

    fn parse_response(
        transaction_id: TransactionId,
        root: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let body = root
            .get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::InvalidMessage("missing response body".into()))?;

        let id = required_id(body, b"id")?;

        let nodes: Vec<NodeEntry> = body
            .get(b"nodes".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|data| data.chunks_exact(26).filter_map(NodeEntry::from_compact).collect())
            .unwrap_or_default();

        let peers: Vec<SocketAddr> = body
            .get(b"values".as_slice())
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(|b| parse_compact_peer(b))
                    .collect()
            })
            .unwrap_or_default();

        let token = body.get(b"token".as_slice()).and_then(|v| v.as_bytes()).cloned();

        // The response shape tells the method apart: a token means get_peers,
        // bare nodes mean find_node, neither means ping/announce.
        let response = if let Some(token) = token {
            KrpcResponse::Peers {
                id,
                token,
                peers,
                nodes,
            }
        } else if !nodes.is_empty() {
            KrpcResponse::Nodes { id, nodes }
        } else {
            KrpcResponse::Pong { id }
        };

        Ok(KrpcMessage::Response {
            transaction_id,
            response,
        })
    }

    fn parse_error(
        transaction_id: TransactionId,
        root: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let list = root
            .get(b"e".as_slice())
            .and_then(|v| v.as_list())
            .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

        let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
        let message = list
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();

        Ok(KrpcMessage::Response {
            transaction_id,
            response: KrpcResponse::Error { code, message },
        })
    }
}

fn required_id(args: &BTreeMap<Bytes, Value>, key: &[u8]) -> Result<NodeId, DhtError> {
    args.get(key)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::InvalidMessage(format!("missing {}", String::from_utf8_lossy(key))))
        .and_then(|b| NodeId::from_bytes(b))
}

fn required_hash(args: &BTreeMap<Bytes, Value>, key: &[u8]) -> Result<InfoHash, DhtError> {
    args.get(key)
        .and_then(|v| v.as_bytes())
        .and_then(|b| InfoHash::from_bytes(b))
        .ok_or_else(|| DhtError::InvalidMessage(format!("missing {}", String::from_utf8_lossy(key))))
}

fn compact_nodes(nodes: &[NodeEntry]) -> Bytes {
    let compact: Vec<u8> = nodes.iter().filter_map(|n| n.to_compact()).flatten().collect();
    Bytes::from(compact)
}

fn compact_peer(addr: &SocketAddr) -> Option<[u8; 6]> {
    let SocketAddr::V4(v4) = addr else {
        return None;
    };
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&v4.ip().octets());
    out[4..].copy_from_slice(&v4.port().to_be_bytes());
    Some(out)
}

fn parse_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
