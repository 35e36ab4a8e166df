#![allow(dead_code, unused_doc_comments)]
/**
 * tests/common/mod.rs
 *
 * Fake sockets, scripted negotiators and scripted signalling channels
 */

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use peerdial::resolver::{
    Answer, Candidate, CandidateKind, CandidateSink, InviteHandle, NegotiationError, Negotiator,
    Offer, PeerAddress, PeerSocket, SignalingChannel, SignalingError, SignalingSink,
};
use peerdial::ResolverConfig;

pub const OFFER: &[u8] = b"offer";
pub const ANSWER: &[u8] = b"answer";

/// Scaled-down timeouts: signalling 500ms, direct 300ms, relay 300ms
pub fn fast_config() -> ResolverConfig {
    ResolverConfig::default()
        .with_signaling_timeout(Duration::from_millis(500))
        .with_primary_timeout(Duration::from_millis(300))
        .with_relay_timeout(Duration::from_millis(300))
}

pub fn peer(name: &str) -> PeerAddress {
    PeerAddress::new(name).unwrap()
}

/// Socket that only records whether it was closed
#[derive(Debug)]
pub struct FakeSocket {
    closed: Arc<AtomicBool>,
}

impl FakeSocket {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                closed: Arc::clone(&closed),
            },
            closed,
        )
    }
}

impl Read for FakeSocket {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for FakeSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PeerSocket for FakeSocket {
    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What a scripted attempt does once its delay elapses
#[derive(Debug, Clone)]
pub enum Step {
    Deliver { kind: CandidateKind, after: Duration },
    /// Delivers even after the negotiator was cancelled
    DeliverLate { kind: CandidateKind, after: Duration },
    Fail { reason: &'static str, after: Duration },
}

impl Step {
    pub fn direct(after_ms: u64) -> Self {
        Step::Deliver {
            kind: CandidateKind::DirectStream,
            after: Duration::from_millis(after_ms),
        }
    }

    pub fn datagram(after_ms: u64) -> Self {
        Step::Deliver {
            kind: CandidateKind::DirectDatagram,
            after: Duration::from_millis(after_ms),
        }
    }

    pub fn relay(after_ms: u64) -> Self {
        Step::Deliver {
            kind: CandidateKind::Relay,
            after: Duration::from_millis(after_ms),
        }
    }

    pub fn late(kind: CandidateKind, after_ms: u64) -> Self {
        Step::DeliverLate {
            kind,
            after: Duration::from_millis(after_ms),
        }
    }

    pub fn fail(reason: &'static str, after_ms: u64) -> Self {
        Step::Fail {
            reason,
            after: Duration::from_millis(after_ms),
        }
    }
}

/// Everything a scripted negotiator was asked to do
#[derive(Default)]
struct LogInner {
    answers: Vec<Vec<u8>>,
    relay_calls: usize,
    cancel_losers: Vec<CandidateKind>,
    cancel_all_calls: usize,
    sockets: Vec<(CandidateKind, Arc<AtomicBool>)>,
    threads: Vec<JoinHandle<()>>,
}

#[derive(Clone, Default)]
pub struct NegotiatorLog {
    inner: Arc<Mutex<LogInner>>,
}

impl NegotiatorLog {
    pub fn answers(&self) -> Vec<Vec<u8>> {
        self.inner.lock().answers.clone()
    }

    pub fn relay_calls(&self) -> usize {
        self.inner.lock().relay_calls
    }

    pub fn cancel_losers(&self) -> Vec<CandidateKind> {
        self.inner.lock().cancel_losers.clone()
    }

    pub fn cancel_all_calls(&self) -> usize {
        self.inner.lock().cancel_all_calls
    }

    pub fn sockets_created(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    /// Close state of every socket of `kind`, in creation order
    pub fn closed_of(&self, kind: CandidateKind) -> Vec<bool> {
        self.inner
            .lock()
            .sockets
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, closed)| closed.load(Ordering::SeqCst))
            .collect()
    }

    /// Sockets created but never closed
    pub fn open_sockets(&self) -> usize {
        self.inner
            .lock()
            .sockets
            .iter()
            .filter(|(_, closed)| !closed.load(Ordering::SeqCst))
            .count()
    }

    /// Wait for every scripted attempt thread to finish
    pub fn join_all(&self) {
        let threads = std::mem::take(&mut self.inner.lock().threads);
        for thread in threads {
            thread.join().unwrap();
        }
    }
}

/// Negotiator whose attempts are timed threads
pub struct ScriptedNegotiator {
    direct: Vec<Step>,
    relay: Vec<Step>,
    offer_error: bool,
    log: NegotiatorLog,
    sink: Option<CandidateSink>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedNegotiator {
    pub fn new(direct: Vec<Step>, relay: Vec<Step>) -> (Self, NegotiatorLog) {
        let log = NegotiatorLog::default();
        (
            Self {
                direct,
                relay,
                offer_error: false,
                log: log.clone(),
                sink: None,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
            log,
        )
    }

    pub fn failing_offer() -> (Self, NegotiatorLog) {
        let (mut negotiator, log) = Self::new(Vec::new(), Vec::new());
        negotiator.offer_error = true;
        (negotiator, log)
    }

    fn spawn(&self, steps: Vec<Step>) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        for step in steps {
            let sink = sink.clone();
            let cancelled = Arc::clone(&self.cancelled);
            let log = self.log.clone();
            let thread = thread::spawn(move || match step {
                Step::Deliver { kind, after } => {
                    thread::sleep(after);
                    if cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    let (socket, closed) = FakeSocket::new();
                    log.inner.lock().sockets.push((kind, closed));
                    sink.deliver(Candidate::new(kind, Box::new(socket)));
                }
                Step::DeliverLate { kind, after } => {
                    thread::sleep(after);
                    let (socket, closed) = FakeSocket::new();
                    log.inner.lock().sockets.push((kind, closed));
                    sink.deliver(Candidate::new(kind, Box::new(socket)));
                }
                Step::Fail { reason, after } => {
                    thread::sleep(after);
                    if !cancelled.load(Ordering::SeqCst) {
                        sink.fail(reason);
                    }
                }
            });
            self.log.inner.lock().threads.push(thread);
        }
    }
}

impl Negotiator for ScriptedNegotiator {
    fn generate_offer(&mut self) -> Result<Offer, NegotiationError> {
        if self.offer_error {
            return Err(NegotiationError::Offer("no local interfaces".to_string()));
        }
        Ok(Offer::from(OFFER))
    }

    fn accept_answer(&mut self, answer: Answer, sink: CandidateSink) {
        self.log.inner.lock().answers.push(answer.into_bytes());
        self.sink = Some(sink);
        self.spawn(self.direct.clone());
    }

    fn enable_relay(&mut self) {
        self.log.inner.lock().relay_calls += 1;
        self.spawn(self.relay.clone());
    }

    fn cancel_losers(&mut self, winner: CandidateKind) {
        self.log.inner.lock().cancel_losers.push(winner);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn cancel_all(&mut self) {
        self.log.inner.lock().cancel_all_calls += 1;
        self.cancelled.store(true, Ordering::SeqCst);
        self.sink = None;
    }
}

/// How a scripted channel responds to an invite
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer from inside `invite`, before it even returns
    AnswerNow,
    Answer { after: Duration },
    Reject { reason: &'static str, after: Duration },
    /// Drop the sink without responding
    Drop { after: Duration },
    /// Hold the sink and never respond
    Never,
}

pub struct ScriptedChannel {
    reply: Reply,
    refuse: bool,
    invites: AtomicUsize,
    cancels: Arc<AtomicUsize>,
    held: Mutex<Vec<SignalingSink>>,
}

impl ScriptedChannel {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            refuse: false,
            invites: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn answering_after(ms: u64) -> Arc<Self> {
        Self::new(Reply::Answer {
            after: Duration::from_millis(ms),
        })
    }

    /// Channel whose `invite` itself fails
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            reply: Reply::Never,
            refuse: true,
            invites: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn invites(&self) -> usize {
        self.invites.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl SignalingChannel for ScriptedChannel {
    fn invite(
        &self,
        _target: &PeerAddress,
        offer: Offer,
        sink: SignalingSink,
    ) -> Result<InviteHandle, SignalingError> {
        if self.refuse {
            return Err(SignalingError::SendFailed("proxy unreachable".to_string()));
        }
        assert_eq!(offer.as_bytes(), OFFER);
        self.invites.fetch_add(1, Ordering::SeqCst);

        match self.reply.clone() {
            Reply::AnswerNow => sink.succeeded(Answer::from(ANSWER)),
            Reply::Answer { after } => {
                thread::spawn(move || {
                    thread::sleep(after);
                    sink.succeeded(Answer::from(ANSWER));
                });
            }
            Reply::Reject { reason, after } => {
                thread::spawn(move || {
                    thread::sleep(after);
                    sink.failed(reason);
                });
            }
            Reply::Drop { after } => {
                thread::spawn(move || {
                    thread::sleep(after);
                    drop(sink);
                });
            }
            Reply::Never => self.held.lock().push(sink),
        }

        let cancels = Arc::clone(&self.cancels);
        Ok(InviteHandle::with_cancel(move || {
            cancels.fetch_add(1, Ordering::SeqCst);
        }))
    }
}
