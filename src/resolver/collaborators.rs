/**
 * resolver/collaborators.rs
 *
 * Interfaces the resolver drives: negotiation and signalling
 */

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::error::{NegotiationError, SignalingError};
use super::outcome::{OutcomeCell, SignalOutcome};
use super::race::CandidateSink;
use super::types::{Answer, CandidateKind, Offer, PeerAddress};

/// Something that can generate an offer, accept an answer and
/// asynchronously emit candidates
///
/// One negotiator serves exactly one resolution. Its methods are called
/// from the resolving thread only; candidates and failures flow back
/// through the `CandidateSink` from whatever thread or task finishes them.
pub trait Negotiator: Send {
    /// Produce the local offer. Must not block on the network.
    fn generate_offer(&mut self) -> Result<Offer, NegotiationError>;

    /// Start candidate attempts against the remote answer
    fn accept_answer(&mut self, answer: Answer, sink: CandidateSink);

    /// Add a relay attempt to the running negotiation
    fn enable_relay(&mut self);

    /// Post-win callback: abandon every attempt that did not win
    fn cancel_losers(&mut self, winner: CandidateKind);

    /// Abort every outstanding attempt and release resources. Idempotent.
    fn cancel_all(&mut self);
}

/// Carries offers to remote peers
///
/// Shared by any number of concurrent resolutions.
pub trait SignalingChannel: Send + Sync {
    /// Send `offer` to `target`. The channel must eventually call exactly
    /// one of `SignalingSink::succeeded` / `SignalingSink::failed`, or drop
    /// the sink, which counts as a failure.
    fn invite(
        &self,
        target: &PeerAddress,
        offer: Offer,
        sink: SignalingSink,
    ) -> Result<InviteHandle, SignalingError>;
}

/// Receives the single response to an invite
pub struct SignalingSink {
    cell: Option<Arc<OutcomeCell>>,
    target: PeerAddress,
}

impl SignalingSink {
    pub(crate) fn new(cell: Arc<OutcomeCell>, target: PeerAddress) -> Self {
        Self {
            cell: Some(cell),
            target,
        }
    }

    pub fn target(&self) -> &PeerAddress {
        &self.target
    }

    pub fn succeeded(mut self, answer: Answer) {
        self.settle(SignalOutcome::Answered(answer));
    }

    pub fn failed(mut self, reason: impl Into<String>) {
        self.settle(SignalOutcome::Rejected(reason.into()));
    }

    fn settle(&mut self, outcome: SignalOutcome) {
        let Some(cell) = self.cell.take() else {
            return;
        };
        let recorded = cell.publish(|progress| {
            if progress.state.is_terminal() || progress.signal.is_some() {
                return false;
            }
            progress.signal = Some(outcome);
            true
        });
        if !recorded {
            debug!(peer = %self.target, "late signalling response ignored");
        }
    }
}

impl Drop for SignalingSink {
    fn drop(&mut self) {
        if self.cell.is_some() {
            debug!(peer = %self.target, "signalling sink dropped without a response");
            self.settle(SignalOutcome::Rejected(
                "signalling transaction dropped without a response".to_string(),
            ));
        }
    }
}

impl fmt::Debug for SignalingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingSink")
            .field("target", &self.target)
            .field("answered", &self.cell.is_none())
            .finish()
    }
}

/// Handle on an outstanding signalling transaction
///
/// Dropping it leaves the transaction alone; `cancel` releases it.
pub struct InviteHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl InviteHandle {
    /// Handle for a channel with nothing to release
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn with_cancel(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for InviteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
