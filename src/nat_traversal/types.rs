/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resolver::{NegotiationError, Offer};

/// Connectivity description exchanged as offer and as answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOffer {
    /// Random per negotiator. The offerer's id is the relay rendezvous key;
    /// the id carried in an answer is never used to join.
    pub session_id: u64,
    pub fingerprint: String,
    /// Addresses the sender accepts direct TCP connections on
    pub addrs: Vec<SocketAddr>,
    /// Whether the sender can join a relay session
    pub relay: bool,
}

impl TransportOffer {
    pub fn encode(&self) -> Result<Offer, NegotiationError> {
        serde_json::to_vec(self)
            .map(Offer::from)
            .map_err(|e| NegotiationError::Offer(format!("offer serialization failed: {e}")))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// NAT traversal configuration
#[derive(Debug, Clone)]
pub struct NatTraversalConfig {
    /// Signalling server URL (ws://host:port or wss://host:port)
    pub signalling_url: String,

    /// Local identity fingerprint
    pub local_fingerprint: String,

    /// Local TCP port to bind (0 for random)
    pub tcp_port: u16,

    /// Addresses to advertise in offers; a port of 0 means the bound port.
    /// Empty advertises the loopback address only.
    pub advertised_addrs: Vec<SocketAddr>,

    /// Relay server (host:port), if one is available
    pub relay_server_addr: Option<SocketAddr>,

    /// Bound on each outbound connection attempt
    pub connect_timeout: Duration,

    /// Accept self-signed signalling certificates (development only)
    pub accept_invalid_certs: bool,
}

impl NatTraversalConfig {
    pub fn new(signalling_url: impl Into<String>, local_fingerprint: impl Into<String>) -> Self {
        Self {
            signalling_url: signalling_url.into(),
            local_fingerprint: local_fingerprint.into(),
            tcp_port: 0,
            advertised_addrs: Vec::new(),
            relay_server_addr: None,
            connect_timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
        }
    }
}
