/**
 * nat_traversal/mod.rs
 *
 * Reference collaborators for the resolver:
 * - WebSocket signalling client (ws:// or TLS wss://)
 * - TCP negotiator racing inbound accept against simultaneous open
 * - Relay fallback over a line-delimited JSON join
 */

mod negotiator;
mod relay;
mod signalling;
mod tcp_connect;
mod types;

pub use negotiator::{TcpNegotiator, TcpNegotiatorFactory};
pub use relay::{join_relay, RelayMessage};
pub use signalling::{SignallingClient, SignallingMessage};
pub use tcp_connect::{
    bind_reusable_listener, connect_with_timeout, into_blocking, tcp_simultaneous_open,
    TcpConnectError,
};
pub use types::{NatTraversalConfig, TransportOffer};
