/**
 * resolver/error.rs
 *
 * Error types surfaced by resolution and by its collaborators
 */

use std::time::Duration;

use thiserror::Error;

use super::types::{AddressError, PeerAddress};

/// Terminal failure of one resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid peer address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("refusing to connect to the local peer {0}")]
    SelfConnectionRejected(PeerAddress),

    #[error("could not generate an offer: {0}")]
    OfferGenerationFailed(#[source] NegotiationError),

    #[error("no signalling channel available: {0}")]
    SignalingUnavailable(String),

    #[error("signalling to {target} rejected: {reason}")]
    SignalingRejected { target: PeerAddress, reason: String },

    #[error("no signalling response from {target} within {timeout:?}")]
    SignalingTimedOut {
        target: PeerAddress,
        timeout: Duration,
    },

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("could not connect to {target}: relay produced no connection after {elapsed:?}")]
    RelayExhausted {
        target: PeerAddress,
        elapsed: Duration,
    },
}

/// Failure inside a negotiator
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("offer generation failed: {0}")]
    Offer(String),

    #[error("negotiator unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to hand an offer to a signalling channel
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signalling connection closed")]
    Closed,

    #[error("signalling send failed: {0}")]
    SendFailed(String),
}
