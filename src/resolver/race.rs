/**
 * resolver/race.rs
 *
 * Winner arbitration between concurrently completing candidates
 */

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::outcome::OutcomeCell;
use super::types::{Candidate, ResolverState};

/// Thread-safe arbiter: the first registered candidate wins
///
/// Clones share the same winner slot.
#[derive(Debug, Clone)]
pub struct CandidateRace {
    cell: Arc<OutcomeCell>,
}

impl CandidateRace {
    /// Create a standalone race with its own private slot
    pub fn new() -> Self {
        Self {
            cell: OutcomeCell::new(),
        }
    }

    pub(crate) fn with_cell(cell: Arc<OutcomeCell>) -> Self {
        Self { cell }
    }

    /// Offer a candidate for the winner slot
    ///
    /// `Ok` means the candidate was installed. `Err` hands a rejected
    /// candidate back: the slot is taken or the resolution has finished,
    /// and the caller now owns closing its socket.
    pub fn register(&self, candidate: Candidate) -> Result<(), Candidate> {
        let kind = candidate.kind();
        let mut rejected = None;
        self.cell.publish(|progress| {
            if progress.accepts_candidates() {
                progress.winner = Some(candidate);
                progress.won = true;
            } else {
                rejected = Some(candidate);
            }
        });

        match rejected {
            None => {
                info!(%kind, "candidate won the race");
                Ok(())
            }
            Some(candidate) => {
                debug!(%kind, "candidate lost the race");
                Err(candidate)
            }
        }
    }

    /// Sink handed to negotiators for delivering candidates into this race
    pub fn sink(&self) -> CandidateSink {
        CandidateSink { race: self.clone() }
    }

    pub fn has_winner(&self) -> bool {
        self.cell.lock().won
    }

    /// Wait for a winner and claim it
    ///
    /// Returns early with `None` if a negotiator reports a hard failure.
    /// A claimed race is closed: later registrations are rejected.
    pub fn wait_for_winner(&self, timeout: Duration) -> Option<Candidate> {
        let mut progress = self
            .cell
            .wait_until(timeout, |p| p.winner.is_some() || p.failure.is_some());
        let winner = progress.winner.take();
        if winner.is_some() {
            progress.advance(ResolverState::Resolved);
        }
        winner
    }

    /// Failure reported by a negotiator, if any
    pub fn failure(&self) -> Option<String> {
        self.cell.lock().failure.clone()
    }
}

impl Default for CandidateRace {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a negotiator sends finished candidates and hard failures
#[derive(Debug, Clone)]
pub struct CandidateSink {
    race: CandidateRace,
}

impl CandidateSink {
    /// Register a candidate; a losing candidate's socket is closed here
    ///
    /// Returns whether the candidate won.
    pub fn deliver(&self, candidate: Candidate) -> bool {
        match self.race.register(candidate) {
            Ok(()) => true,
            Err(mut loser) => {
                let kind = loser.kind();
                if let Err(e) = loser.socket_mut().close() {
                    debug!(%kind, error = %e, "closing losing socket failed");
                }
                false
            }
        }
    }

    /// Report that no candidate can be produced at all
    ///
    /// Only the first failure is kept; once the resolution finished this
    /// is a no-op.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let recorded = self.race.cell.publish(|progress| {
            if progress.state.is_terminal() || progress.failure.is_some() {
                return false;
            }
            progress.failure = Some(reason.clone());
            true
        });
        if recorded {
            warn!(%reason, "negotiator reported a hard failure");
        } else {
            debug!(%reason, "ignoring negotiator failure after completion");
        }
    }

    /// Whether delivering more candidates can still matter
    pub fn is_open(&self) -> bool {
        self.race.cell.lock().accepts_candidates()
    }
}
