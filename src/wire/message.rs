use super::error::WireError;
use crate::types::InfoHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The protocol identifier sent in every handshake.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake frame in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Scale factor for the fixed-point reliability field of quality-metrics
/// messages (parts per million).
pub const RELIABILITY_SCALE: f64 = 1_000_000.0;

// Swarm control ids (classical semantics).
pub const MSG_CHOKE: u32 = 0;
pub const MSG_UNCHOKE: u32 = 1;
pub const MSG_INTERESTED: u32 = 2;
pub const MSG_NOT_INTERESTED: u32 = 3;
pub const MSG_HAVE: u32 = 4;
pub const MSG_BITFIELD: u32 = 5;
pub const MSG_REQUEST: u32 = 6;
pub const MSG_PIECE: u32 = 7;
pub const MSG_CANCEL: u32 = 8;
pub const MSG_PORT: u32 = 9;

// Application extension ids.
pub const MSG_PAYMENT_REQUEST: u32 = 100;
pub const MSG_PAYMENT_PROOF: u32 = 101;
pub const MSG_TOKEN_BALANCE: u32 = 102;
pub const MSG_QUALITY_METRICS: u32 = 103;
pub const MSG_GEOGRAPHIC_HINT: u32 = 104;
pub const MSG_PAYMENT_REJECT: u32 = 105;

// Social message range, opaque to the core.
pub const MSG_SOCIAL_FIRST: u32 = 200;
pub const MSG_SOCIAL_LAST: u32 = 208;

/// The 68-byte handshake exchanged before any framed traffic.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(WireError::Handshake("short handshake".into()));
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(WireError::Handshake("bad protocol string".into()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let info_hash = InfoHash::from_bytes(&data[28..48])
            .ok_or_else(|| WireError::Handshake("bad info hash".into()))?;

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A framed wire message.
///
/// Frames carry a 4-byte big-endian length, then a 4-byte message id and the
/// payload. A zero length is a keep-alive. Ids 0-9 follow classical swarming
/// semantics; 100-105 are application extensions with fixed binary payload
/// schemas; 200-208 travel opaquely for the social layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece: u32,
    },
    Bitfield(Bytes),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    PaymentRequest {
        amount_sats: u64,
        piece_index: u32,
        expires_at: u64,
        purpose: String,
        request_id: String,
    },
    PaymentProof {
        tx_id: [u8; 32],
        amount_sats: u64,
        payer_address: String,
    },
    TokenBalance {
        balance: u64,
        quality_score: u32,
    },
    QualityMetrics {
        uptime_secs: u64,
        /// Fixed point, scale [`RELIABILITY_SCALE`].
        reliability: u32,
        upload_mbps: u32,
        bytes_uploaded: u64,
    },
    GeographicHint {
        country_code: String,
        city: String,
    },
    PaymentReject {
        request_id: String,
        reason: String,
    },
    /// Social-range message carried opaquely (ids 200-208).
    Social {
        id: u32,
        payload: Bytes,
    },
    /// Forward-compatible frame with an id above 255; logged and skipped.
    Unknown {
        id: u32,
        payload: Bytes,
    },
}

impl Message {
    /// The wire id of this message, `None` for keep-alives.
    pub fn id(&self) -> Option<u32> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MSG_CHOKE,
            Message::Unchoke => MSG_UNCHOKE,
            Message::Interested => MSG_INTERESTED,
            Message::NotInterested => MSG_NOT_INTERESTED,
            Message::Have { .. } => MSG_HAVE,
            Message::Bitfield(_) => MSG_BITFIELD,
            Message::Request { .. } => MSG_REQUEST,
            Message::Piece { .. } => MSG_PIECE,
            Message::Cancel { .. } => MSG_CANCEL,
            Message::Port(_) => MSG_PORT,
            Message::PaymentRequest { .. } => MSG_PAYMENT_REQUEST,
            Message::PaymentProof { .. } => MSG_PAYMENT_PROOF,
            Message::TokenBalance { .. } => MSG_TOKEN_BALANCE,
            Message::QualityMetrics { .. } => MSG_QUALITY_METRICS,
            Message::GeographicHint { .. } => MSG_GEOGRAPHIC_HINT,
            Message::PaymentReject { .. } => MSG_PAYMENT_REJECT,
            Message::Social { id, .. } => *id,
            Message::Unknown { id, .. } => *id,
        })
    }

    /// Encodes the message including its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let payload = self.encode_payload();
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        match self.id() {
            None => buf.put_u32(0),
            Some(id) => {
                buf.put_u32(4 + payload.len() as u32);
                buf.put_u32(id);
                buf.put_slice(&payload);
            }
        }
        buf.freeze()
    }

    fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece } => buf.put_u32(*piece),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port(port) => buf.put_u16(*port),
            Message::PaymentRequest {
                amount_sats,
                piece_index,
                expires_at,
                purpose,
                request_id,
            } => {
                buf.put_u64(*amount_sats);
                buf.put_u32(*piece_index);
                buf.put_u64(*expires_at);
                put_str(&mut buf, purpose);
                put_str(&mut buf, request_id);
            }
            Message::PaymentProof {
                tx_id,
                amount_sats,
                payer_address,
            } => {
                buf.put_slice(tx_id);
                buf.put_u64(*amount_sats);
                put_str(&mut buf, payer_address);
            }
            Message::TokenBalance {
                balance,
                quality_score,
            } => {
                buf.put_u64(*balance);
                buf.put_u32(*quality_score);
            }
            Message::QualityMetrics {
                uptime_secs,
                reliability,
                upload_mbps,
                bytes_uploaded,
            } => {
                buf.put_u64(*uptime_secs);
                buf.put_u32(*reliability);
                buf.put_u32(*upload_mbps);
                buf.put_u64(*bytes_uploaded);
            }
            Message::GeographicHint { country_code, city } => {
                put_str(&mut buf, country_code);
                put_str(&mut buf, city);
            }
            Message::PaymentReject { request_id, reason } => {
                put_str(&mut buf, request_id);
                put_str(&mut buf, reason);
            }
            Message::Social { payload, .. } | Message::Unknown { payload, .. } => {
                buf.put_slice(payload)
            }
        }
        buf
    }

    /// Decodes a complete frame (length prefix included).
    ///
    /// Reserved ids (<= 255) that we do not understand are fatal; ids above
    /// 255 come back as [`Message::Unknown`] for the caller to skip.
    pub fn decode(mut data: Bytes) -> Result<Self, WireError> {
        if data.len() < 4 {
            return Err(WireError::Framing("frame shorter than length prefix".into()));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length < 4 {
            return Err(WireError::Framing("frame too short for message id".into()));
        }
        if data.remaining() != length {
            return Err(WireError::Framing(format!(
                "length prefix {} but {} payload bytes",
                length,
                data.remaining()
            )));
        }

        let id = data.get_u32();
        let mut payload = data;

        let message = match id {
            MSG_CHOKE => Message::Choke,
            MSG_UNCHOKE => Message::Unchoke,
            MSG_INTERESTED => Message::Interested,
            MSG_NOT_INTERESTED => Message::NotInterested,
            MSG_HAVE => Message::Have {
                piece: get_u32(&mut payload, "have")?,
            },
            MSG_BITFIELD => Message::Bitfield(payload.copy_to_bytes(payload.remaining())),
            MSG_REQUEST => Message::Request {
                index: get_u32(&mut payload, "request")?,
                begin: get_u32(&mut payload, "request")?,
                length: get_u32(&mut payload, "request")?,
            },
            MSG_PIECE => {
                let index = get_u32(&mut payload, "piece")?;
                let begin = get_u32(&mut payload, "piece")?;
                let data = payload.copy_to_bytes(payload.remaining());
                Message::Piece { index, begin, data }
            }
            MSG_CANCEL => Message::Cancel {
                index: get_u32(&mut payload, "cancel")?,
                begin: get_u32(&mut payload, "cancel")?,
                length: get_u32(&mut payload, "cancel")?,
            },
            MSG_PORT => {
                if payload.remaining() < 2 {
                    return Err(WireError::Framing("port too short".into()));
                }
                Message::Port(payload.get_u16())
            }
            MSG_PAYMENT_REQUEST => Message::PaymentRequest {
                amount_sats: get_u64(&mut payload, "payment request")?,
                piece_index: get_u32(&mut payload, "payment request")?,
                expires_at: get_u64(&mut payload, "payment request")?,
                purpose: get_str(&mut payload, "payment request")?,
                request_id: get_str(&mut payload, "payment request")?,
            },
            MSG_PAYMENT_PROOF => {
                if payload.remaining() < 32 {
                    return Err(WireError::Framing("payment proof too short".into()));
                }
                let mut tx_id = [0u8; 32];
                payload.copy_to_slice(&mut tx_id);
                Message::PaymentProof {
                    tx_id,
                    amount_sats: get_u64(&mut payload, "payment proof")?,
                    payer_address: get_str(&mut payload, "payment proof")?,
                }
            }
            MSG_TOKEN_BALANCE => Message::TokenBalance {
                balance: get_u64(&mut payload, "token balance")?,
                quality_score: get_u32(&mut payload, "token balance")?,
            },
            MSG_QUALITY_METRICS => Message::QualityMetrics {
                uptime_secs: get_u64(&mut payload, "quality metrics")?,
                reliability: get_u32(&mut payload, "quality metrics")?,
                upload_mbps: get_u32(&mut payload, "quality metrics")?,
                bytes_uploaded: get_u64(&mut payload, "quality metrics")?,
            },
            MSG_GEOGRAPHIC_HINT => Message::GeographicHint {
                country_code: get_str(&mut payload, "geographic hint")?,
                city: get_str(&mut payload, "geographic hint")?,
            },
            MSG_PAYMENT_REJECT => Message::PaymentReject {
                request_id: get_str(&mut payload, "payment reject")?,
                reason: get_str(&mut payload, "payment reject")?,
            },
            MSG_SOCIAL_FIRST..=MSG_SOCIAL_LAST => Message::Social {
                id,
                payload: payload.copy_to_bytes(payload.remaining()),
            },
            id if id <= 255 => return Err(WireError::UnknownMessage(id)),
            id => Message::Unknown {
                id,
                payload: payload.copy_to_bytes(payload.remaining()),
            },
        };

        Ok(message)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn get_u32(payload: &mut Bytes, what: &str) -> Result<u32, WireError> {
    if payload.remaining() < 4 {
        return Err(WireError::Framing(format!("{} too short", what)));
    }
    Ok(payload.get_u32())
}

fn get_u64(payload: &mut Bytes, what: &str) -> Result<u64, WireError> {
    if payload.remaining() < 8 {
        return Err(WireError::Framing(format!("{} too short", what)));
    }
    Ok(payload.get_u64())
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String, WireError> {
    if payload.remaining() < 2 {
        return Err(WireError::Framing(format!("{} too short", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(WireError::Framing(format!("{} string truncated", what)));
    }
    let bytes = payload.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WireError::Framing(format!("{} string not utf-8", what)))
}
