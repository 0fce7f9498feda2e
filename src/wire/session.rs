use super::error::WireError;
use super::message::{Handshake, Message, RELIABILITY_SCALE};
use super::peer_id::PeerId;
use super::transport::{FrameReader, FrameWriter, WireTransport};
use crate::types::InfoHash;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Bound on the per-session outbound queue, in frames.
const OUTBOUND_QUEUE: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Lifecycle of a wire session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Handshaken,
    Active,
    Closing,
    Closed,
}

/// Sender half of a session's bounded outbound queue.
///
/// Sends block when the queue is full; the input loop never holds a lock
/// across one.
pub type SessionSender = mpsc::Sender<Message>;

/// Events a session surfaces to the supervisor.
///
/// Components never hold references back into the session; replies travel
/// through the cloned outbound sender carried by the event.
#[derive(Debug)]
pub enum SessionEvent {
    Established {
        addr: SocketAddr,
        peer_id: PeerId,
        info_hash: InfoHash,
    },
    PaymentRequest {
        addr: SocketAddr,
        amount_sats: u64,
        piece_index: u32,
        expires_at: u64,
        purpose: String,
        request_id: String,
        outbound: SessionSender,
    },
    PaymentProof {
        addr: SocketAddr,
        tx_id: [u8; 32],
        amount_sats: u64,
        payer_address: String,
    },
    TokenBalance {
        addr: SocketAddr,
        balance: u64,
        quality_score: u32,
    },
    QualityMetrics {
        addr: SocketAddr,
        uptime_secs: u64,
        reliability: f64,
        upload_mbps: u32,
        bytes_uploaded: u64,
    },
    GeographicHint {
        addr: SocketAddr,
        country_code: String,
        city: String,
    },
    Closed {
        addr: SocketAddr,
        reason: Option<String>,
    },
}

/// What a handler decided about one inbound message.
enum Dispatch {
    Reply(Message),
    Handled,
    Ignored,
    Fatal(WireError),
}

/// A live handle to a running session.
pub struct SessionHandle {
    pub addr: SocketAddr,
    pub remote_peer_id: PeerId,
    pub remote_info_hash: InfoHash,
    outbound: SessionSender,
    close_tx: mpsc::Sender<()>,
}

impl SessionHandle {
    /// Queues a message for this session, waiting when the queue is full.
    pub async fn send(&self, message: Message) -> Result<(), WireError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| WireError::SessionClosed)
    }

    pub fn sender(&self) -> SessionSender {
        self.outbound.clone()
    }

    /// Asks the session to close; in-flight handler work is cancelled.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }
}

/// Dials a remote endpoint, performs the handshake as initiator and starts
/// the session tasks. The first message sent after the handshake is
/// `interested`, signalling participation.
pub async fn connect(
    addr: SocketAddr,
    info_hash: InfoHash,
    local_peer_id: PeerId,
    events: mpsc::Sender<SessionEvent>,
) -> Result<SessionHandle, WireError> {
    let stream = TcpStream::connect(addr).await?;
    let mut transport = WireTransport::new(stream);

    transport
        .send_handshake(&Handshake::new(info_hash, *local_peer_id.as_bytes()))
        .await?;
    let theirs = transport.receive_handshake().await?;

    spawn_session(transport, theirs, addr, events, true).await
}

/// Accepts an inbound connection: reads the remote handshake first, then
/// answers with ours.
pub async fn accept(
    stream: TcpStream,
    info_hash: InfoHash,
    local_peer_id: PeerId,
    events: mpsc::Sender<SessionEvent>,
) -> Result<SessionHandle, WireError> {
    let addr = stream.peer_addr()?;
    let mut transport = WireTransport::new(stream);

    let theirs = transport.receive_handshake().await?;
    transport
        .send_handshake(&Handshake::new(theirs.info_hash, *local_peer_id.as_bytes()))
        .await?;

    spawn_session(transport, theirs, addr, events, false).await
}

async fn spawn_session(
    transport: WireTransport,
    theirs: Handshake,
    addr: SocketAddr,
    events: mpsc::Sender<SessionEvent>,
    initiated: bool,
) -> Result<SessionHandle, WireError> {
    let remote_peer_id = PeerId::from_bytes(&theirs.peer_id)
        .ok_or_else(|| WireError::Handshake("bad peer id".into()))?;
    let remote_info_hash = theirs.info_hash;

    debug!(%addr, peer_id = %remote_peer_id, "handshake complete");

    let (reader, writer) = transport.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (close_tx, close_rx) = mpsc::channel(1);

    if initiated {
        // Entering Handshaken as initiator: interested goes out first.
        outbound_tx
            .send(Message::Interested)
            .await
            .map_err(|_| WireError::SessionClosed)?;
    }

    let _ = events
        .send(SessionEvent::Established {
            addr,
            peer_id: remote_peer_id,
            info_hash: remote_info_hash,
        })
        .await;

    let session = SessionTask {
        addr,
        events,
        outbound: outbound_tx.clone(),
        state: SessionState::Handshaken,
    };
    tokio::spawn(session.run(reader, writer, outbound_rx, close_rx));

    Ok(SessionHandle {
        addr,
        remote_peer_id,
        remote_info_hash,
        outbound: outbound_tx,
        close_tx,
    })
}

struct SessionTask {
    addr: SocketAddr,
    events: mpsc::Sender<SessionEvent>,
    outbound: SessionSender,
    state: SessionState,
}

impl SessionTask {
    async fn run(
        mut self,
        mut reader: FrameReader,
        writer: FrameWriter,
        outbound_rx: mpsc::Receiver<Message>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, self.addr));

        self.state = SessionState::Active;
        let mut close_reason = None;

        loop {
            tokio::select! {
                _ = close_rx.recv() => {
                    self.state = SessionState::Closing;
                    break;
                }
                result = timeout(READ_IDLE_TIMEOUT, reader.read_message()) => {
                    match result {
                        Err(_) => {
                            close_reason = Some("read idle timeout".to_string());
                            self.state = SessionState::Closing;
                            break;
                        }
                        Ok(Err(WireError::SessionClosed)) => {
                            self.state = SessionState::Closing;
                            break;
                        }
                        Ok(Err(err)) => {
                            warn!(addr = %self.addr, error = %err, "session error");
                            close_reason = Some(err.to_string());
                            self.state = SessionState::Closing;
                            break;
                        }
                        Ok(Ok(message)) => match self.dispatch(message).await {
                            Dispatch::Reply(reply) => {
                                if self.outbound.send(reply).await.is_err() {
                                    self.state = SessionState::Closing;
                                    break;
                                }
                            }
                            Dispatch::Handled | Dispatch::Ignored => {}
                            Dispatch::Fatal(err) => {
                                warn!(addr = %self.addr, error = %err, "fatal protocol error");
                                close_reason = Some(err.to_string());
                                self.state = SessionState::Closing;
                                break;
                            }
                        },
                    }
                }
            }
        }

        // Closing: cancel the writer so a full queue cannot wedge shutdown.
        debug!(addr = %self.addr, state = ?self.state, "tearing down session");
        writer_task.abort();
        self.state = SessionState::Closed;
        info!(addr = %self.addr, state = ?self.state, reason = ?close_reason, "session closed");
        let _ = self
            .events
            .send(SessionEvent::Closed {
                addr: self.addr,
                reason: close_reason,
            })
            .await;
    }

    async fn dispatch(&self, message: Message) -> Dispatch {
        match message {
            Message::KeepAlive => Dispatch::Handled,
            Message::Interested => {
                debug!(addr = %self.addr, "peer interested");
                Dispatch::Reply(Message::Unchoke)
            }
            Message::Choke
            | Message::Unchoke
            | Message::NotInterested
            | Message::Have { .. }
            | Message::Bitfield(_)
            | Message::Request { .. }
            | Message::Piece { .. }
            | Message::Cancel { .. }
            | Message::Port(_) => {
                debug!(addr = %self.addr, id = ?message.id(), "swarm control message");
                Dispatch::Handled
            }
            Message::PaymentRequest {
                amount_sats,
                piece_index,
                expires_at,
                purpose,
                request_id,
            } => {
                let event = SessionEvent::PaymentRequest {
                    addr: self.addr,
                    amount_sats,
                    piece_index,
                    expires_at,
                    purpose,
                    request_id,
                    outbound: self.outbound.clone(),
                };
                if self.events.send(event).await.is_err() {
                    return Dispatch::Fatal(WireError::SessionClosed);
                }
                Dispatch::Handled
            }
            Message::PaymentProof {
                tx_id,
                amount_sats,
                payer_address,
            } => {
                let _ = self
                    .events
                    .send(SessionEvent::PaymentProof {
                        addr: self.addr,
                        tx_id,
                        amount_sats,
                        payer_address,
                    })
                    .await;
                Dispatch::Handled
            }
            Message::TokenBalance {
                balance,
                quality_score,
            } => {
                let _ = self
                    .events
                    .send(SessionEvent::TokenBalance {
                        addr: self.addr,
                        balance,
                        quality_score,
                    })
                    .await;
                Dispatch::Handled
            }
            Message::QualityMetrics {
                uptime_secs,
                reliability,
                upload_mbps,
                bytes_uploaded,
            } => {
                let _ = self
                    .events
                    .send(SessionEvent::QualityMetrics {
                        addr: self.addr,
                        uptime_secs,
                        reliability: f64::from(reliability) / RELIABILITY_SCALE,
                        upload_mbps,
                        bytes_uploaded,
                    })
                    .await;
                Dispatch::Handled
            }
            Message::GeographicHint { country_code, city } => {
                let _ = self
                    .events
                    .send(SessionEvent::GeographicHint {
                        addr: self.addr,
                        country_code,
                        city,
                    })
                    .await;
                Dispatch::Handled
            }
            Message::PaymentReject { request_id, reason } => {
                info!(addr = %self.addr, request_id, reason, "payment request rejected by peer");
                Dispatch::Handled
            }
            // Social messages carry unverified signatures; rejected, never
            // silently accepted.
            Message::Social { id, .. } => {
                debug!(addr = %self.addr, id, "rejecting social message");
                Dispatch::Ignored
            }
            Message::Unknown { id, .. } => {
                debug!(addr = %self.addr, id, "skipping unknown forward-compatible message");
                Dispatch::Ignored
            }
        }
    }
}

async fn write_loop(
    mut writer: FrameWriter,
    mut outbound_rx: mpsc::Receiver<Message>,
    addr: SocketAddr,
) {
    let keep_alive = sleep(KEEP_ALIVE_INTERVAL);
    tokio::pin!(keep_alive);

    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                let Some(message) = message else { break };
                if let Err(err) = writer.send(&message).await {
                    debug!(%addr, error = %err, "outbound write failed");
                    break;
                }
                keep_alive
                    .as_mut()
                    .reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
            }
            _ = keep_alive.as_mut() => {
                if writer.send(&Message::KeepAlive).await.is_err() {
                    break;
                }
                keep_alive
                    .as_mut()
                    .reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
            }
        }
    }
}
