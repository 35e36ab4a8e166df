/**
 * nat_traversal/signalling.rs
 *
 * WebSocket signalling client (TLS optional, self-signed certs allowed for development)
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::resolver::{
    Answer, InviteHandle, Offer, PeerAddress, SignalingChannel, SignalingError, SignalingSink,
};

/// Signalling message types
///
/// Offer and answer payloads travel hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignallingMessage {
    Register {
        fingerprint: String,
    },
    RegisterAck {
        success: bool,
        message: String,
    },
    Invite {
        txn: u64,
        target_fingerprint: String,
        from_fingerprint: String,
        offer: String,
    },
    InviteOk {
        txn: u64,
        answer: String,
    },
    InviteFailed {
        txn: u64,
        reason: String,
    },
    Cancel {
        txn: u64,
    },
    Keepalive,
    Error {
        message: String,
    },
}

type PendingInvites = Arc<Mutex<HashMap<u64, SignalingSink>>>;

/// Registered connection to a signalling server
///
/// Invites are multiplexed by transaction id; a reader task routes each
/// response to the sink of its transaction.
pub struct SignallingClient {
    local_fingerprint: String,
    outbound: mpsc::UnboundedSender<SignallingMessage>,
    pending: PendingInvites,
    connected: Arc<AtomicBool>,
    next_txn: AtomicU64,
}

impl SignallingClient {
    /// Connect to `url` (ws:// or wss://) and register as `fingerprint`
    ///
    /// Must run inside a tokio runtime; the reader and writer tasks are
    /// spawned on it.
    pub async fn connect(url: &str, fingerprint: &str, accept_invalid_certs: bool) -> Result<Self> {
        let req = url
            .into_client_request()
            .context("Invalid signalling URL")?;

        let secure = match req.uri().scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            other => return Err(anyhow!("Unsupported signalling scheme: {other:?}")),
        };
        let host = req
            .uri()
            .host()
            .ok_or_else(|| anyhow!("Missing hostname"))?
            .to_string();
        let port = req.uri().port_u16().unwrap_or(if secure { 443 } else { 80 });

        // Step 1: raw TCP connect
        let tcp = TokioTcpStream::connect((host.as_str(), port))
            .await
            .context("TCP connection to signalling server failed")?;

        if !secure {
            let (ws_stream, _resp) = tokio_tungstenite::client_async(req, tcp)
                .await
                .context("WebSocket upgrade failed")?;
            return Self::start(ws_stream, fingerprint).await;
        }

        // Step 2: TLS handshake over TCP
        let mut tls_builder = TlsConnector::builder();
        tls_builder.danger_accept_invalid_certs(accept_invalid_certs);
        let tls = tls_builder
            .build()
            .context("Failed to build TLS connector")?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let tls_stream = tls
            .connect(&host, tcp)
            .await
            .context("TLS handshake failed")?;

        // Step 3: WebSocket upgrade over TLS
        let (ws_stream, _resp) = tokio_tungstenite::client_async(req, tls_stream)
            .await
            .context("WebSocket upgrade failed")?;
        Self::start(ws_stream, fingerprint).await
    }

    /// Register, then hand the stream to the reader and writer tasks
    async fn start<S>(mut ws_stream: WebSocketStream<S>, fingerprint: &str) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        register(&mut ws_stream, fingerprint).await?;
        info!(%fingerprint, "registered with signalling server");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<SignallingMessage>();
        let pending: PendingInvites = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "message serialization failed");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                        Ok(msg) => dispatch(&reader_pending, msg),
                        Err(e) => warn!(error = %e, "failed to decode signalling message"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "signalling connection error");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            fail_all(&reader_pending, "signalling connection closed");
        });

        Ok(Self {
            local_fingerprint: fingerprint.to_string(),
            outbound,
            pending,
            connected,
            next_txn: AtomicU64::new(1),
        })
    }

    pub fn local_fingerprint(&self) -> &str {
        &self.local_fingerprint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Invites still waiting for a response
    pub fn pending_invites(&self) -> usize {
        self.pending.lock().len()
    }
}

impl SignalingChannel for SignallingClient {
    fn invite(
        &self,
        target: &PeerAddress,
        offer: Offer,
        sink: SignalingSink,
    ) -> Result<InviteHandle, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }

        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let msg = SignallingMessage::Invite {
            txn,
            target_fingerprint: target.to_string(),
            from_fingerprint: self.local_fingerprint.clone(),
            offer: hex::encode(offer.as_bytes()),
        };

        self.pending.lock().insert(txn, sink);
        if let Err(e) = self.outbound.send(msg) {
            let unsent = self.pending.lock().remove(&txn);
            drop(unsent);
            return Err(SignalingError::SendFailed(e.to_string()));
        }
        debug!(txn, peer = %target, "invite sent");

        let pending = Arc::clone(&self.pending);
        let outbound = self.outbound.clone();
        Ok(InviteHandle::with_cancel(move || {
            let abandoned = pending.lock().remove(&txn);
            if abandoned.is_some() {
                debug!(txn, "cancelling invite");
                let _ = outbound.send(SignallingMessage::Cancel { txn });
            }
        }))
    }
}

/// Route a server message to the transaction it answers
fn dispatch(pending: &PendingInvites, msg: SignallingMessage) {
    match msg {
        SignallingMessage::InviteOk { txn, answer } => {
            let Some(sink) = pending.lock().remove(&txn) else {
                debug!(txn, "response for unknown or cancelled invite");
                return;
            };
            match hex::decode(&answer) {
                Ok(bytes) => sink.succeeded(Answer::from(bytes)),
                Err(e) => sink.failed(format!("undecodable answer: {e}")),
            }
        }
        SignallingMessage::InviteFailed { txn, reason } => {
            let Some(sink) = pending.lock().remove(&txn) else {
                debug!(txn, "failure for unknown or cancelled invite");
                return;
            };
            sink.failed(reason);
        }
        SignallingMessage::Keepalive => {}
        SignallingMessage::Error { message } => warn!(%message, "signalling server error"),
        other => debug!(?other, "ignoring unexpected signalling message"),
    }
}

fn fail_all(pending: &PendingInvites, reason: &str) {
    let sinks: Vec<SignalingSink> = pending.lock().drain().map(|(_, sink)| sink).collect();
    if !sinks.is_empty() {
        warn!(count = sinks.len(), %reason, "failing pending invites");
    }
    for sink in sinks {
        sink.failed(reason);
    }
}

async fn register<S>(ws_stream: &mut WebSocketStream<S>, fingerprint: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = SignallingMessage::Register {
        fingerprint: fingerprint.to_string(),
    };
    send_message(ws_stream, &msg).await?;

    match receive_message(ws_stream).await? {
        SignallingMessage::RegisterAck { success: true, .. } => Ok(()),
        SignallingMessage::RegisterAck { message, .. } => {
            Err(anyhow!("Registration failed: {}", message))
        }
        SignallingMessage::Error { message } => Err(anyhow!("Signalling error: {}", message)),
        _ => Err(anyhow!("Unexpected registration response")),
    }
}

async fn send_message<S>(ws_stream: &mut WebSocketStream<S>, msg: &SignallingMessage) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = serde_json::to_string(msg).context("Message serialization failed")?;
    ws_stream
        .send(Message::Text(json))
        .await
        .context("WebSocket send failed")?;
    Ok(())
}

async fn receive_message<S>(ws_stream: &mut WebSocketStream<S>) -> Result<SignallingMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = ws_stream
            .next()
            .await
            .ok_or_else(|| anyhow!("Connection closed"))??;

        match msg {
            Message::Text(text) => {
                let parsed =
                    serde_json::from_str(&text).context("Failed to decode signalling message")?;
                return Ok(parsed);
            }
            Message::Ping(data) => {
                ws_stream.send(Message::Pong(data)).await?;
            }
            Message::Close(_) => {
                return Err(anyhow!("Server closed WebSocket"));
            }
            _ => {}
        }
    }
}
