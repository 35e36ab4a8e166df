/**
 * resolver/types.rs
 *
 * Core types for socket resolution
 */

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use crate::config::ResolverConfig;

/// Logical address of a remote peer
///
/// Peers are named by identity (a fingerprint, a user id), never by
/// network address. Comparison ignores ASCII case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(String);

/// Rejected peer address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("peer address is empty")]
    Empty,
    #[error("peer address {0:?} contains whitespace")]
    Whitespace(String),
}

impl PeerAddress {
    /// Validate and normalize a peer address
    pub fn new(raw: impl AsRef<str>) -> Result<Self, AddressError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(AddressError::Whitespace(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Opaque offer payload produced by a negotiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer(Vec<u8>);

/// Opaque answer payload returned through signalling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer(Vec<u8>);

macro_rules! opaque_payload {
    ($name:ident) => {
        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_bytes(self) -> Vec<u8> {
                self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl From<&[u8]> for $name {
            fn from(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }
        }
    };
}

opaque_payload!(Offer);
opaque_payload!(Answer);

/// A connected, usable bidirectional socket
pub trait PeerSocket: Read + Write + Send + fmt::Debug {
    /// Close both directions. Errors are reported, never retried.
    fn close(&mut self) -> io::Result<()>;
}

impl PeerSocket for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Owned socket handed back to callers
pub type Socket = Box<dyn PeerSocket>;

/// Transport path a candidate was established over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    DirectStream,
    DirectDatagram,
    Relay,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateKind::DirectStream => write!(f, "direct stream"),
            CandidateKind::DirectDatagram => write!(f, "direct reliable datagram"),
            CandidateKind::Relay => write!(f, "relay"),
        }
    }
}

/// One completed transport attempt, carrying its connected socket
#[derive(Debug)]
pub enum Candidate {
    DirectStream(Socket),
    DirectDatagram(Socket),
    Relay(Socket),
}

impl Candidate {
    pub fn new(kind: CandidateKind, socket: Socket) -> Self {
        match kind {
            CandidateKind::DirectStream => Candidate::DirectStream(socket),
            CandidateKind::DirectDatagram => Candidate::DirectDatagram(socket),
            CandidateKind::Relay => Candidate::Relay(socket),
        }
    }

    pub fn kind(&self) -> CandidateKind {
        match self {
            Candidate::DirectStream(_) => CandidateKind::DirectStream,
            Candidate::DirectDatagram(_) => CandidateKind::DirectDatagram,
            Candidate::Relay(_) => CandidateKind::Relay,
        }
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        match self {
            Candidate::DirectStream(socket)
            | Candidate::DirectDatagram(socket)
            | Candidate::Relay(socket) => socket,
        }
    }

    pub fn into_socket(self) -> Socket {
        match self {
            Candidate::DirectStream(socket)
            | Candidate::DirectDatagram(socket)
            | Candidate::Relay(socket) => socket,
        }
    }
}

/// Resolution state machine
///
/// Ordered: a resolution only ever moves forward through these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResolverState {
    Created,
    OfferSent,
    AwaitingSignalResponse,
    AwaitingCandidates,
    RelayRequested,
    Resolved,
    Failed,
}

impl ResolverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResolverState::Resolved | ResolverState::Failed)
    }
}

/// Immutable parameters of a single `resolve` call
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub target: PeerAddress,
    pub signaling_timeout: Duration,
    pub primary_timeout: Duration,
    pub relay_timeout: Duration,
    pub started: Instant,
}

impl ResolutionRequest {
    pub fn new(target: PeerAddress, config: &ResolverConfig) -> Self {
        Self {
            target,
            signaling_timeout: config.signaling_timeout,
            primary_timeout: config.primary_timeout,
            relay_timeout: config.relay_timeout,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
