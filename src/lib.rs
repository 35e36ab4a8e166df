#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod factory;
pub mod nat_traversal;
pub mod resolver;

pub use config::{ConfigError, ResolverConfig};
pub use factory::{ChannelTracker, NegotiatorFactory, SocketFactory};
pub use nat_traversal::{NatTraversalConfig, SignallingClient, TcpNegotiatorFactory};
pub use resolver::{
    Candidate, CandidateKind, CandidateRace, PeerAddress, ResolveError, ResolverState,
    SocketResolver,
};
