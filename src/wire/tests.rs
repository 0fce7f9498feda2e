use super::*;
use crate::types::InfoHash;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

#[test]
fn handshake_round_trip() {
    for _ in 0..50 {
        let info_hash = InfoHash::generate();
        let peer_id = *PeerId::generate().as_bytes();

        let encoded = Handshake::new(info_hash, peer_id).encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);

        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded.info_hash, info_hash);
        assert_eq!(decoded.peer_id, peer_id);
    }
}

#[test]
fn handshake_rejects_bad_protocol() {
    let mut encoded = Handshake::new(InfoHash::generate(), [1u8; 20])
        .encode()
        .to_vec();
    encoded[1] = b'X';
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(WireError::Handshake(_))
    ));

    encoded[1] = b'B';
    encoded[0] = 18;
    assert!(Handshake::decode(&encoded).is_err());
}

#[test]
fn handshake_rejects_short_input() {
    assert!(Handshake::decode(&[19u8; 67]).is_err());
}

#[test]
fn keep_alive_is_four_zero_bytes() {
    assert_eq!(Message::KeepAlive.encode().as_ref(), &[0u8, 0, 0, 0]);
}

#[test]
fn frame_round_trip_every_id() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xAA, 0x55])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"block data"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Port(6881),
        Message::PaymentRequest {
            amount_sats: 30_000,
            piece_index: 7,
            expires_at: 1_700_000_000,
            purpose: "piece_payment".to_string(),
            request_id: "pay_0011223344556677".to_string(),
        },
        Message::PaymentProof {
            tx_id: [0xAB; 32],
            amount_sats: 30_000,
            payer_address: "mzFJpMT3bdZYYgLvCfDSSw2rri9qsfKF5v".to_string(),
        },
        Message::TokenBalance {
            balance: 9000,
            quality_score: 87,
        },
        Message::QualityMetrics {
            uptime_secs: 86_400,
            reliability: 950_000,
            upload_mbps: 40,
            bytes_uploaded: 1 << 30,
        },
        Message::GeographicHint {
            country_code: "DE".to_string(),
            city: "Berlin".to_string(),
        },
        Message::PaymentReject {
            request_id: "pay_0011223344556677".to_string(),
            reason: "amount out of range".to_string(),
        },
        Message::Social {
            id: 204,
            payload: Bytes::from_static(b"opaque social payload"),
        },
    ];

    for message in messages {
        let encoded = message.encode();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn unknown_reserved_id_is_fatal() {
    let mut frame = Vec::new();
    frame.extend_from_slice(&4u32.to_be_bytes());
    frame.extend_from_slice(&42u32.to_be_bytes());
    assert!(matches!(
        Message::decode(Bytes::from(frame)),
        Err(WireError::UnknownMessage(42))
    ));

    let mut frame = Vec::new();
    frame.extend_from_slice(&4u32.to_be_bytes());
    frame.extend_from_slice(&199u32.to_be_bytes());
    assert!(matches!(
        Message::decode(Bytes::from(frame)),
        Err(WireError::UnknownMessage(199))
    ));
}

#[test]
fn unknown_high_id_is_skippable() {
    let mut frame = Vec::new();
    frame.extend_from_slice(&7u32.to_be_bytes());
    frame.extend_from_slice(&4242u32.to_be_bytes());
    frame.extend_from_slice(b"abc");

    match Message::decode(Bytes::from(frame)).unwrap() {
        Message::Unknown { id, payload } => {
            assert_eq!(id, 4242);
            assert_eq!(payload.as_ref(), b"abc");
        }
        other => panic!("expected Unknown, got {:?}", other),
    }
}

#[test]
fn length_mismatch_rejected() {
    // Length prefix claims 8 bytes, only 4 follow.
    let mut frame = Vec::new();
    frame.extend_from_slice(&8u32.to_be_bytes());
    frame.extend_from_slice(&2u32.to_be_bytes());
    assert!(matches!(
        Message::decode(Bytes::from(frame)),
        Err(WireError::Framing(_))
    ));
}

#[test]
fn truncated_payload_rejected() {
    // A have message with only two payload bytes.
    let mut frame = Vec::new();
    frame.extend_from_slice(&6u32.to_be_bytes());
    frame.extend_from_slice(&4u32.to_be_bytes());
    frame.extend_from_slice(&[0, 1]);
    assert!(Message::decode(Bytes::from(frame)).is_err());
}

#[tokio::test]
async fn accepted_session_answers_interested_with_unchoke() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events_tx, mut events_rx) = mpsc::channel(16);

    let local_peer_id = PeerId::generate();
    let info_hash = InfoHash([0x10; 20]);
    // The join handle keeps the session handle alive for the whole test.
    let _server_session = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        session::accept(stream, info_hash, local_peer_id, events_tx)
            .await
            .unwrap()
    });

    // Raw dialing side so the bytes on the wire are observable.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let ours = Handshake::new(InfoHash([0x10; 20]), [0x01; 20]);
    stream.write_all(&ours.encode()).await.unwrap();

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.unwrap();
    let theirs = Handshake::decode(&buf).unwrap();
    assert_eq!(theirs.peer_id, *local_peer_id.as_bytes());

    stream
        .write_all(&Message::Interested.encode())
        .await
        .unwrap();

    // The unchoke reply arrives within a second.
    let mut reply = [0u8; 8];
    tokio::time::timeout(
        std::time::Duration::from_secs(1),
        stream.read_exact(&mut reply),
    )
    .await
    .expect("no reply within 1s")
    .unwrap();

    let decoded = Message::decode(Bytes::copy_from_slice(&reply)).unwrap();
    assert_eq!(decoded, Message::Unchoke);

    // Both sides stay up without framing errors while idle.
    let established = events_rx.recv().await.unwrap();
    assert!(matches!(established, SessionEvent::Established { .. }));
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(matches!(
        events_rx.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    ));
}
