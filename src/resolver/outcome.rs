/**
 * resolver/outcome.rs
 *
 * Shared outcome cell: the one lock every callback source goes through
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use super::types::{Answer, Candidate, ResolverState};

/// Longest single wait; larger timeouts are clamped to it
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Deadline `timeout` from `now`, never further out than `MAX_WAIT`
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    let timeout = timeout.min(MAX_WAIT);
    now.checked_add(timeout).unwrap_or(now)
}

/// What the signalling channel reported
#[derive(Debug)]
pub(crate) enum SignalOutcome {
    Answered(Answer),
    Rejected(String),
}

/// Everything a resolution learns, guarded by a single mutex
#[derive(Debug)]
pub(crate) struct Progress {
    pub state: ResolverState,
    pub signal: Option<SignalOutcome>,
    pub winner: Option<Candidate>,
    /// Set once a candidate was accepted, stays set after the winner is claimed
    pub won: bool,
    pub failure: Option<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: ResolverState::Created,
            signal: None,
            winner: None,
            won: false,
            failure: None,
        }
    }

    /// Move forward to `next`. Terminal states and backward moves are refused.
    pub fn advance(&mut self, next: ResolverState) -> bool {
        if self.state.is_terminal() || next <= self.state {
            return false;
        }
        debug!(from = ?self.state, to = ?next, "resolver state change");
        self.state = next;
        true
    }

    pub fn accepts_candidates(&self) -> bool {
        !self.won && !self.state.is_terminal()
    }
}

/// Mutex + condition pair carrying a resolution's progress
#[derive(Debug)]
pub(crate) struct OutcomeCell {
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl OutcomeCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            progress: Mutex::new(Progress::new()),
            changed: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock()
    }

    /// Apply `update` under the lock and wake every waiter
    pub fn publish<R>(&self, update: impl FnOnce(&mut Progress) -> R) -> R {
        let mut progress = self.progress.lock();
        let result = update(&mut progress);
        self.changed.notify_all();
        result
    }

    /// Block until `ready` holds or `timeout` elapses
    ///
    /// The predicate is evaluated before the first wait and after every
    /// wake-up, so an update published before this call is never missed.
    /// The guard is returned either way; callers re-inspect it.
    /// Timeouts above `MAX_WAIT` are clamped, so every wait is bounded.
    pub fn wait_until<F>(&self, timeout: Duration, mut ready: F) -> MutexGuard<'_, Progress>
    where
        F: FnMut(&Progress) -> bool,
    {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut progress = self.progress.lock();
        while !ready(&progress) {
            if self.changed.wait_until(&mut progress, deadline).timed_out() {
                break;
            }
        }
        progress
    }
}

/// Read-only view of a resolution's state, usable from other threads
#[derive(Debug, Clone)]
pub struct ResolverStateHandle {
    cell: Arc<OutcomeCell>,
}

impl ResolverStateHandle {
    pub(crate) fn new(cell: Arc<OutcomeCell>) -> Self {
        Self { cell }
    }

    pub fn current(&self) -> ResolverState {
        self.cell.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_update_before_wait_is_not_lost() {
        let cell = OutcomeCell::new();
        cell.publish(|p| p.failure = Some("early".to_string()));

        let start = Instant::now();
        let progress = cell.wait_until(Duration::from_secs(5), |p| p.failure.is_some());
        assert_eq!(progress.failure.as_deref(), Some("early"));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_publish_wakes_waiter_early() {
        let cell = OutcomeCell::new();
        let publisher = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            publisher.publish(|p| p.failure = Some("late".to_string()));
        });

        let start = Instant::now();
        let progress = cell.wait_until(Duration::from_secs(5), |p| p.failure.is_some());
        assert!(progress.failure.is_some());
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(progress);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_without_update() {
        let cell = OutcomeCell::new();
        let start = Instant::now();
        let progress = cell.wait_until(Duration::from_millis(100), |p| p.failure.is_some());
        assert!(progress.failure.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_huge_timeout_is_clamped() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), now + MAX_WAIT);
        assert_eq!(
            deadline_after(now, Duration::from_millis(5)),
            now + Duration::from_millis(5)
        );
    }

    #[test]
    fn test_huge_timeout_still_wakes_on_publish() {
        let cell = OutcomeCell::new();
        let publisher = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            publisher.publish(|p| p.failure = Some("late".to_string()));
        });

        let progress = cell.wait_until(Duration::MAX, |p| p.failure.is_some());
        assert_eq!(progress.failure.as_deref(), Some("late"));
        drop(progress);
        handle.join().unwrap();
    }

    #[test]
    fn test_advance_is_monotonic() {
        let cell = OutcomeCell::new();
        let mut progress = cell.lock();
        assert!(progress.advance(ResolverState::OfferSent));
        assert!(!progress.advance(ResolverState::Created));
        assert!(progress.advance(ResolverState::Failed));
        assert!(!progress.advance(ResolverState::Resolved));
        assert_eq!(progress.state, ResolverState::Failed);
    }
}
