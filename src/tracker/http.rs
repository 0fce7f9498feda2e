use super::error::TrackerError;
use super::swarm::{AnnounceEvent, AnnounceReply, AnnounceRequest, SwarmRegistry};
use crate::bencode::{self, Value};
use crate::dht::QualityMetrics;
use crate::types::InfoHash;
use crate::wire::PeerId;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Serves the HTTP announce surface until cancelled.
pub async fn serve(registry: Arc<SwarmRegistry>, port: u16) -> Result<(), TrackerError> {
    let app = router(registry);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(TrackerError::ListenerBind)?;
    info!(port, "tracker http listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(TrackerError::Io)
}

fn router(registry: Arc<SwarmRegistry>) -> Router {
    Router::new()
        .route("/announce", get(handle_announce))
        .route("/scrape", get(handle_scrape))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .route("/nerd/quality", post(handle_quality))
        .route("/nerd/payments", post(handle_payments))
        .with_state(registry)
}

async fn handle_announce(
    State(registry): State<Arc<SwarmRegistry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_query(query.as_deref().unwrap_or(""));

    let request = match build_announce(&registry, &params, remote, &headers) {
        Ok(request) => request,
        Err(reason) => return failure_response(&reason),
    };
    let compact = param_str(&params, b"compact").as_deref() == Some("1");

    let reply = registry.announce(&request);
    bencoded_ok(encode_announce(&reply, compact, registry.nerd_enabled()))
}

async fn handle_scrape(
    State(registry): State<Arc<SwarmRegistry>>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_query(query.as_deref().unwrap_or(""));
    let Some(info_hash) = param(&params, b"info_hash").and_then(|raw| InfoHash::from_bytes(raw))
    else {
        return failure_response("invalid info_hash");
    };

    match registry.scrape(&info_hash) {
        Some(counts) => {
            let file = bencode::dict([
                (b"complete".as_slice(), Value::Integer(i64::from(counts.complete))),
                (b"downloaded".as_slice(), Value::Integer(counts.downloaded as i64)),
                (b"incomplete".as_slice(), Value::Integer(i64::from(counts.incomplete))),
            ]);
            let mut files = std::collections::BTreeMap::new();
            files.insert(
                bytes::Bytes::copy_from_slice(info_hash.as_bytes()),
                file,
            );
            let body = bencode::dict([(b"files".as_slice(), Value::Dict(files))]);
            bencoded_ok(bencode::encode(&body))
        }
        None => failure_response("torrent not found"),
    }
}

async fn handle_stats(State(registry): State<Arc<SwarmRegistry>>) -> Response {
    Json(registry.stats()).into_response()
}

async fn handle_health() -> Response {
    Json(serde_json::json!({ "status": "healthy" })).into_response()
}

#[derive(Debug, Deserialize)]
struct QualityUpdate {
    peer_id: String,
    uptime_seconds: u64,
    reliability: f64,
    upload_speed_mbps: u32,
}

async fn handle_quality(
    State(registry): State<Arc<SwarmRegistry>>,
    Json(update): Json<QualityUpdate>,
) -> Response {
    let Some(peer_id) = decode_peer_id(&update.peer_id) else {
        return (StatusCode::BAD_REQUEST, "invalid peer_id").into_response();
    };

    let metrics = QualityMetrics::from_wire(
        update.uptime_seconds,
        update.reliability,
        update.upload_speed_mbps,
    );
    let score = metrics.score();
    registry.update_peer_quality(&peer_id, score);
    debug!(peer = %peer_id, score, "quality metrics updated");
    (StatusCode::OK, "quality metrics updated").into_response()
}

#[derive(Debug, Deserialize)]
struct BalanceUpdate {
    peer_id: String,
    nerd_balance: u64,
}

async fn handle_payments(
    State(registry): State<Arc<SwarmRegistry>>,
    Json(update): Json<BalanceUpdate>,
) -> Response {
    let Some(peer_id) = decode_peer_id(&update.peer_id) else {
        return (StatusCode::BAD_REQUEST, "invalid peer_id").into_response();
    };

    registry.update_peer_balance(&peer_id, update.nerd_balance);
    debug!(peer = %peer_id, balance = update.nerd_balance, "payment information updated");
    (StatusCode::OK, "payment information updated").into_response()
}

fn decode_peer_id(hex_id: &str) -> Option<PeerId> {
    let raw = hex::decode(hex_id).ok()?;
    PeerId::from_bytes(&raw)
}

fn build_announce(
    registry: &SwarmRegistry,
    params: &[(Vec<u8>, Vec<u8>)],
    remote: SocketAddr,
    headers: &HeaderMap,
) -> Result<AnnounceRequest, String> {
    let info_hash = param(params, b"info_hash")
        .and_then(InfoHash::from_bytes)
        .ok_or("invalid info_hash")?;
    let peer_id = param(params, b"peer_id")
        .and_then(PeerId::from_bytes)
        .ok_or("invalid peer_id")?;
    let port: u16 = param_str(params, b"port")
        .and_then(|s| s.parse().ok())
        .filter(|p| *p >= 1)
        .ok_or("invalid port")?;

    let uploaded = param_u64(params, b"uploaded");
    let downloaded = param_u64(params, b"downloaded");
    let left = param_u64(params, b"left");

    let event = param_str(params, b"event")
        .map(|s| AnnounceEvent::parse(&s))
        .unwrap_or(AnnounceEvent::None);

    let numwant = param_str(params, b"numwant").and_then(|s| s.parse::<usize>().ok());
    let numwant = registry.clamp_numwant(numwant);

    // The socket address is authoritative, except behind a proxy where the
    // first X-Forwarded-For hop wins.
    let mut ip = remote.ip();
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        ip = forwarded;
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    Ok(AnnounceRequest {
        info_hash,
        peer_id,
        ip,
        port,
        uploaded,
        downloaded,
        left,
        event,
        numwant,
        user_agent,
    })
}

/// Bencodes an announce reply: compact form packs 6 bytes per IPv4 peer,
/// dictionary form carries `quality score` and `nerd balance` when NERD is
/// enabled.
pub(crate) fn encode_announce(reply: &AnnounceReply, compact: bool, nerd: bool) -> Vec<u8> {
    let peers_value = if compact {
        let mut packed = Vec::with_capacity(reply.peers.len() * 6);
        for peer in &reply.peers {
            if let Some(bytes) = peer.to_compact() {
                packed.extend_from_slice(&bytes);
            }
        }
        Value::bytes(&packed)
    } else {
        Value::List(
            reply
                .peers
                .iter()
                .map(|peer| {
                    let mut entries = std::collections::BTreeMap::new();
                    entries.insert(
                        bytes::Bytes::from_static(b"ip"),
                        Value::string(&peer.ip.to_string()),
                    );
                    entries.insert(
                        bytes::Bytes::from_static(b"peer id"),
                        Value::bytes(peer.peer_id.as_bytes()),
                    );
                    entries.insert(
                        bytes::Bytes::from_static(b"port"),
                        Value::Integer(i64::from(peer.port)),
                    );
                    if nerd {
                        entries.insert(
                            bytes::Bytes::from_static(b"quality score"),
                            Value::Float(peer.quality_score),
                        );
                        entries.insert(
                            bytes::Bytes::from_static(b"nerd balance"),
                            Value::Integer(peer.token_balance as i64),
                        );
                    }
                    Value::Dict(entries)
                })
                .collect(),
        )
    };

    let body = bencode::dict([
        (b"complete".as_slice(), Value::Integer(i64::from(reply.complete))),
        (b"incomplete".as_slice(), Value::Integer(i64::from(reply.incomplete))),
        (b"interval".as_slice(), Value::Integer(i64::from(reply.interval))),
        (b"min interval".as_slice(), Value::Integer(i64::from(reply.min_interval))),
        (b"peers".as_slice(), peers_value),
    ]);
    bencode::encode(&body)
}

pub(crate) fn encode_failure(reason: &str) -> Vec<u8> {
    bencode::encode(&bencode::dict([(
        b"failure reason".as_slice(),
        Value::string(reason),
    )]))
}

fn failure_response(reason: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain")],
        encode_failure(reason),
    )
        .into_response()
}

fn bencoded_ok(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}

/// Splits a raw query string into percent-decoded byte pairs. Binary values
/// such as `info_hash` never pass through UTF-8.
pub(crate) fn parse_query(raw: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn param<'a>(params: &'a [(Vec<u8>, Vec<u8>)], key: &[u8]) -> Option<&'a [u8]> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_slice())
}

fn param_str(params: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> Option<String> {
    param(params, key).and_then(|v| String::from_utf8(v.to_vec()).ok())
}

fn param_u64(params: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> u64 {
    param_str(params, key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
