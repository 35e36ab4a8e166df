/**
 * resolver/mod.rs
 *
 * Socket resolution orchestrator:
 * - offer generation and signalling
 * - bounded wait for the signalling response
 * - candidate race with relay escalation
 * - release of every losing resource
 */

mod collaborators;
mod error;
mod outcome;
mod race;
mod types;

pub use collaborators::{InviteHandle, Negotiator, SignalingChannel, SignalingSink};
pub use error::{NegotiationError, ResolveError, SignalingError};
pub use outcome::ResolverStateHandle;
pub use race::{CandidateRace, CandidateSink};
pub use types::{
    AddressError, Answer, Candidate, CandidateKind, Offer, PeerAddress, PeerSocket,
    ResolutionRequest, ResolverState, Socket,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use outcome::{OutcomeCell, SignalOutcome};

/// Resolves one peer address into one connected socket
///
/// A resolver owns the winner slot and timers of a single request, so it
/// is built fresh for every call and consumed by [`SocketResolver::resolve`].
/// Concurrent resolutions never share one.
pub struct SocketResolver {
    negotiator: Box<dyn Negotiator>,
    channel: Arc<dyn SignalingChannel>,
    config: ResolverConfig,
    local_identities: Vec<PeerAddress>,
    cell: Arc<OutcomeCell>,
}

impl SocketResolver {
    pub fn new(
        negotiator: Box<dyn Negotiator>,
        channel: Arc<dyn SignalingChannel>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            negotiator,
            channel,
            config,
            local_identities: Vec::new(),
            cell: OutcomeCell::new(),
        }
    }

    /// Refuse to resolve `identity`, which names this peer
    pub fn with_local_identity(mut self, identity: PeerAddress) -> Self {
        self.local_identities.push(identity);
        self
    }

    pub fn with_local_identities(mut self, identities: impl IntoIterator<Item = PeerAddress>) -> Self {
        self.local_identities.extend(identities);
        self
    }

    /// Whether `target` names this peer
    pub fn is_local(&self, target: &PeerAddress) -> bool {
        self.local_identities.iter().any(|id| id == target)
    }

    /// Observe this resolution's state from another thread
    pub fn state_handle(&self) -> ResolverStateHandle {
        ResolverStateHandle::new(Arc::clone(&self.cell))
    }

    /// Negotiate a connection to `target` and return the winning candidate
    ///
    /// Blocks for at most the signalling timeout plus the primary and relay
    /// timeouts.
    pub fn resolve(mut self, target: &PeerAddress) -> Result<Candidate, ResolveError> {
        if self.is_local(target) {
            warn!(peer = %target, "refusing to resolve a socket to ourselves");
            let result = Err(ResolveError::SelfConnectionRejected(target.clone()));
            self.conclude(target, &result, None);
            return result;
        }

        let request = ResolutionRequest::new(target.clone(), &self.config);
        debug!(peer = %target, "resolving socket");

        let mut invite = None;
        let result = self.run(&request, &mut invite);
        self.conclude(target, &result, invite);

        match &result {
            Ok(winner) => info!(
                peer = %target,
                kind = %winner.kind(),
                elapsed_ms = request.elapsed().as_millis() as u64,
                "resolved socket"
            ),
            Err(e) => warn!(
                peer = %target,
                elapsed_ms = request.elapsed().as_millis() as u64,
                error = %e,
                "could not resolve socket"
            ),
        }
        result
    }

    fn run(
        &mut self,
        request: &ResolutionRequest,
        invite: &mut Option<InviteHandle>,
    ) -> Result<Candidate, ResolveError> {
        // Step 1: Local offer, nothing has left the process yet
        let offer = self
            .negotiator
            .generate_offer()
            .map_err(ResolveError::OfferGenerationFailed)?;

        // Step 2: Hand the offer to signalling
        let sink = SignalingSink::new(Arc::clone(&self.cell), request.target.clone());
        let handle = self
            .channel
            .invite(&request.target, offer, sink)
            .map_err(|e| ResolveError::SignalingUnavailable(e.to_string()))?;
        *invite = Some(handle);
        self.advance(ResolverState::OfferSent);

        // Step 3: Signalling response
        let answer = self.await_answer(request, invite)?;

        // Step 4: Direct candidates
        self.advance(ResolverState::AwaitingCandidates);
        let race = CandidateRace::with_cell(Arc::clone(&self.cell));
        self.negotiator.accept_answer(answer, race.sink());

        if let Some(winner) =
            self.await_candidate(request.primary_timeout, ResolverState::RelayRequested)?
        {
            return Ok(winner);
        }

        // Step 5: Relay fallback
        info!(
            peer = %request.target,
            waited_ms = request.primary_timeout.as_millis() as u64,
            "could not create direct connection, using relay"
        );
        self.negotiator.enable_relay();

        if let Some(winner) = self.await_candidate(request.relay_timeout, ResolverState::Failed)? {
            return Ok(winner);
        }

        Err(ResolveError::RelayExhausted {
            target: request.target.clone(),
            elapsed: request.elapsed(),
        })
    }

    fn await_answer(
        &self,
        request: &ResolutionRequest,
        invite: &mut Option<InviteHandle>,
    ) -> Result<Answer, ResolveError> {
        self.advance(ResolverState::AwaitingSignalResponse);
        let mut progress = self.cell.wait_until(request.signaling_timeout, |p| {
            p.signal.is_some() || p.failure.is_some()
        });

        let elapsed_ms = request.elapsed().as_millis() as u64;
        match progress.signal.take() {
            Some(SignalOutcome::Answered(answer)) => {
                invite.take();
                debug!(peer = %request.target, elapsed_ms, "signalling succeeded");
                Ok(answer)
            }
            Some(SignalOutcome::Rejected(reason)) => {
                invite.take();
                progress.advance(ResolverState::Failed);
                warn!(peer = %request.target, elapsed_ms, %reason, "signalling failed");
                Err(ResolveError::SignalingRejected {
                    target: request.target.clone(),
                    reason,
                })
            }
            None => {
                progress.advance(ResolverState::Failed);
                match progress.failure.clone() {
                    Some(reason) => Err(ResolveError::NegotiationFailed(reason)),
                    None => Err(ResolveError::SignalingTimedOut {
                        target: request.target.clone(),
                        timeout: request.signaling_timeout,
                    }),
                }
            }
        }
    }

    /// Wait for a winner; on timeout move to `on_timeout` under the same lock
    fn await_candidate(
        &self,
        timeout: Duration,
        on_timeout: ResolverState,
    ) -> Result<Option<Candidate>, ResolveError> {
        let mut progress = self
            .cell
            .wait_until(timeout, |p| p.winner.is_some() || p.failure.is_some());

        if let Some(winner) = progress.winner.take() {
            progress.advance(ResolverState::Resolved);
            return Ok(Some(winner));
        }
        if let Some(reason) = progress.failure.clone() {
            progress.advance(ResolverState::Failed);
            return Err(ResolveError::NegotiationFailed(reason));
        }
        progress.advance(on_timeout);
        Ok(None)
    }

    fn advance(&self, next: ResolverState) {
        self.cell.publish(|progress| progress.advance(next));
    }

    /// Release everything that is not the winning socket
    fn conclude(
        &mut self,
        target: &PeerAddress,
        result: &Result<Candidate, ResolveError>,
        invite: Option<InviteHandle>,
    ) {
        match result {
            Ok(winner) => self.negotiator.cancel_losers(winner.kind()),
            Err(_) => {
                self.advance(ResolverState::Failed);
                self.negotiator.cancel_all();
            }
        }

        if let Some(invite) = invite {
            debug!(peer = %target, "releasing unanswered signalling transaction");
            invite.cancel();
        }
    }
}
