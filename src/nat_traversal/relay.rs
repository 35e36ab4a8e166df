/**
 * nat_traversal/relay.rs
 *
 * Relay session join: one JSON line out, one JSON line back, then raw bytes
 */

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::tcp_connect::connect_with_timeout;

/// Longest control line accepted from the relay
const MAX_LINE: usize = 4096;

/// Relay control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Join { session_id: u64, fingerprint: String },
    Ready,
    Rejected { reason: String },
}

/// Join relay session `session_id` and wait until the relay pairs us
///
/// The relay answers `ready` once the other side has joined the same
/// session. Everything after that line belongs to the peer.
pub async fn join_relay(
    relay_addr: SocketAddr,
    session_id: u64,
    fingerprint: &str,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = connect_with_timeout(relay_addr, connect_timeout)
        .await
        .with_context(|| format!("Failed to reach relay {relay_addr}"))?;

    let join = RelayMessage::Join {
        session_id,
        fingerprint: fingerprint.to_string(),
    };
    let mut line = serde_json::to_vec(&join).context("Join serialization failed")?;
    line.push(b'\n');
    stream.write_all(&line).await.context("Relay send failed")?;
    debug!(%relay_addr, session_id, "joined relay session, waiting for peer");

    match read_line(&mut stream).await? {
        RelayMessage::Ready => {
            info!(%relay_addr, session_id, "relay session ready");
            Ok(stream)
        }
        RelayMessage::Rejected { reason } => bail!("Relay rejected session: {reason}"),
        other => bail!("Unexpected relay response: {other:?}"),
    }
}

/// Read one control line byte by byte so no peer data is consumed
async fn read_line(stream: &mut TcpStream) -> Result<RelayMessage> {
    let mut line = Vec::new();
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| anyhow!("Relay closed before responding: {e}"))?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            bail!("Relay response exceeds {MAX_LINE} bytes");
        }
        line.push(byte);
    }
    serde_json::from_slice(&line).context("Failed to decode relay response")
}
