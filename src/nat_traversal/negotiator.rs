/**
 * nat_traversal/negotiator.rs
 *
 * TCP negotiator: inbound accept and outbound simultaneous open race
 * against each other, relay joins on request
 */

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::relay::join_relay;
use super::tcp_connect::{bind_reusable_listener, into_blocking, tcp_simultaneous_open};
use super::types::{NatTraversalConfig, TransportOffer};
use crate::factory::NegotiatorFactory;
use crate::resolver::{
    Answer, Candidate, CandidateKind, CandidateSink, NegotiationError, Negotiator, Offer,
};

/// One in-flight connection attempt
struct Attempt {
    kind: CandidateKind,
    label: String,
    task: JoinHandle<()>,
}

/// Negotiator for a single resolution, driving its attempts on a tokio runtime
pub struct TcpNegotiator {
    runtime: Handle,
    config: Arc<NatTraversalConfig>,
    session_id: u64,
    listener: Option<StdTcpListener>,
    local_port: u16,
    peer: Option<TransportOffer>,
    sink: Option<CandidateSink>,
    attempts: Vec<Attempt>,
    relay_requested: bool,
}

impl TcpNegotiator {
    pub fn new(runtime: Handle, config: Arc<NatTraversalConfig>) -> Self {
        Self {
            runtime,
            config,
            session_id: rand::random(),
            listener: None,
            local_port: 0,
            peer: None,
            sink: None,
            attempts: Vec::new(),
            relay_requested: false,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn advertised_addrs(&self) -> Vec<SocketAddr> {
        if self.config.advertised_addrs.is_empty() {
            return vec![SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))];
        }
        self.config
            .advertised_addrs
            .iter()
            .map(|addr| match addr.port() {
                0 => SocketAddr::new(addr.ip(), self.local_port),
                _ => *addr,
            })
            .collect()
    }

    /// Run `attempt` on the runtime, delivering its stream as a `kind` candidate
    fn spawn_attempt<F>(&mut self, kind: CandidateKind, label: String, attempt: F)
    where
        F: Future<Output = Result<TcpStream>> + Send + 'static,
    {
        let Some(sink) = self.sink.clone() else {
            return;
        };

        let task_label = label.clone();
        let task = self.runtime.spawn(async move {
            let stream = match attempt.await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(attempt = %task_label, error = %e, "connection attempt failed");
                    return;
                }
            };
            match into_blocking(stream) {
                Ok(stream) => {
                    if sink.deliver(Candidate::new(kind, Box::new(stream))) {
                        debug!(attempt = %task_label, "connection attempt won");
                    }
                }
                Err(e) => debug!(attempt = %task_label, error = %e, "could not hand over stream"),
            }
        });

        debug!(%kind, attempt = %label, "connection attempt started");
        self.attempts.push(Attempt { kind, label, task });
    }

    fn abort_attempts(&mut self) {
        for attempt in self.attempts.drain(..) {
            attempt.task.abort();
        }
    }
}

impl Negotiator for TcpNegotiator {
    fn generate_offer(&mut self) -> Result<Offer, NegotiationError> {
        let listener = bind_reusable_listener(self.config.tcp_port)
            .map_err(|e| NegotiationError::Offer(e.to_string()))?;
        self.local_port = listener.local_addr()?.port();
        self.listener = Some(listener);

        let offer = TransportOffer {
            session_id: self.session_id,
            fingerprint: self.config.local_fingerprint.clone(),
            addrs: self.advertised_addrs(),
            relay: self.config.relay_server_addr.is_some(),
        };
        debug!(session_id = self.session_id, addrs = ?offer.addrs, "generated transport offer");
        offer.encode()
    }

    fn accept_answer(&mut self, answer: Answer, sink: CandidateSink) {
        self.sink = Some(sink.clone());

        let peer = match TransportOffer::decode(answer.as_bytes()) {
            Ok(peer) => peer,
            Err(e) => {
                sink.fail(format!("malformed answer: {e}"));
                return;
            }
        };

        let relay_possible = peer.relay && self.config.relay_server_addr.is_some();
        if peer.addrs.is_empty() && !relay_possible {
            sink.fail("answer offers no direct addresses and no relay");
            return;
        }

        if let Some(listener) = self.listener.take() {
            self.spawn_attempt(CandidateKind::DirectStream, "accept".to_string(), async move {
                let listener = TcpListener::from_std(listener)?;
                let (stream, from) = listener.accept().await?;
                debug!(%from, "accepted inbound peer connection");
                Ok::<_, anyhow::Error>(stream)
            });
        }

        for addr in &peer.addrs {
            let (addr, local_port, timeout) = (*addr, self.local_port, self.config.connect_timeout);
            self.spawn_attempt(CandidateKind::DirectStream, format!("connect {addr}"), async move {
                let stream = tcp_simultaneous_open(local_port, addr, timeout).await?;
                Ok::<_, anyhow::Error>(stream)
            });
        }

        self.peer = Some(peer);
    }

    fn enable_relay(&mut self) {
        if self.relay_requested {
            return;
        }
        self.relay_requested = true;

        let Some(sink) = self.sink.clone() else {
            return;
        };
        let Some(relay_addr) = self.config.relay_server_addr else {
            sink.fail("no relay server configured");
            return;
        };
        if self.peer.as_ref().is_some_and(|peer| !peer.relay) {
            sink.fail("peer cannot use the relay");
            return;
        }

        info!(%relay_addr, session_id = self.session_id, "requesting relay");
        // the callee joins with the id from our offer, not from its answer
        let session_id = self.session_id;
        let fingerprint = self.config.local_fingerprint.clone();
        let timeout = self.config.connect_timeout;
        self.spawn_attempt(CandidateKind::Relay, format!("relay {relay_addr}"), async move {
            join_relay(relay_addr, session_id, &fingerprint, timeout).await
        });
    }

    fn cancel_losers(&mut self, winner: CandidateKind) {
        for attempt in &self.attempts {
            if !attempt.task.is_finished() {
                debug!(kind = %attempt.kind, attempt = %attempt.label, %winner, "cancelling losing attempt");
            }
        }
        self.abort_attempts();
        self.listener = None;
    }

    fn cancel_all(&mut self) {
        self.abort_attempts();
        self.listener = None;
        self.sink = None;
    }
}

impl Drop for TcpNegotiator {
    fn drop(&mut self) {
        self.abort_attempts();
    }
}

/// Builds a `TcpNegotiator` per resolution
#[derive(Clone)]
pub struct TcpNegotiatorFactory {
    runtime: Handle,
    config: Arc<NatTraversalConfig>,
}

impl TcpNegotiatorFactory {
    pub fn new(runtime: Handle, config: Arc<NatTraversalConfig>) -> Self {
        Self { runtime, config }
    }
}

impl NegotiatorFactory for TcpNegotiatorFactory {
    fn create(&self) -> Result<Box<dyn Negotiator>, NegotiationError> {
        Ok(Box::new(TcpNegotiator::new(
            self.runtime.clone(),
            Arc::clone(&self.config),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::relay::RelayMessage;
    use crate::resolver::CandidateRace;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn config() -> NatTraversalConfig {
        let mut config = NatTraversalConfig::new("ws://127.0.0.1:1", "alice");
        config.connect_timeout = Duration::from_secs(2);
        config
    }

    fn answer(addrs: Vec<SocketAddr>, relay: bool) -> Answer {
        let offer = TransportOffer {
            session_id: 99,
            fingerprint: "bob".to_string(),
            addrs,
            relay,
        };
        Answer::from(offer.encode().unwrap().into_bytes())
    }

    #[test]
    fn test_offer_advertises_bound_port() {
        let rt = runtime();
        let mut config = config();
        config.advertised_addrs = vec!["203.0.113.5:0".parse().unwrap()];
        let mut negotiator = TcpNegotiator::new(rt.handle().clone(), Arc::new(config));

        let offer = negotiator.generate_offer().unwrap();
        let decoded = TransportOffer::decode(offer.as_bytes()).unwrap();
        assert_eq!(decoded.session_id, negotiator.session_id());
        assert_eq!(decoded.fingerprint, "alice");
        assert!(!decoded.relay);
        assert_eq!(decoded.addrs.len(), 1);
        assert_eq!(decoded.addrs[0].ip().to_string(), "203.0.113.5");
        assert_ne!(decoded.addrs[0].port(), 0);
    }

    #[test]
    fn test_direct_connect_wins() {
        let rt = runtime();
        let peer = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let mut negotiator = TcpNegotiator::new(rt.handle().clone(), Arc::new(config()));
        negotiator.generate_offer().unwrap();

        let race = CandidateRace::new();
        negotiator.accept_answer(answer(vec![peer.local_addr().unwrap()], false), race.sink());

        let winner = race.wait_for_winner(Duration::from_secs(5)).expect("no winner");
        assert_eq!(winner.kind(), CandidateKind::DirectStream);
        negotiator.cancel_losers(winner.kind());
    }

    #[test]
    fn test_malformed_answer_fails_fast() {
        let rt = runtime();
        let mut negotiator = TcpNegotiator::new(rt.handle().clone(), Arc::new(config()));
        negotiator.generate_offer().unwrap();

        let race = CandidateRace::new();
        negotiator.accept_answer(Answer::from(b"garbage".to_vec()), race.sink());

        assert!(race.wait_for_winner(Duration::from_secs(1)).is_none());
        assert!(race.failure().unwrap().contains("malformed answer"));
    }

    #[test]
    fn test_answer_without_routes_fails() {
        let rt = runtime();
        let mut negotiator = TcpNegotiator::new(rt.handle().clone(), Arc::new(config()));
        negotiator.generate_offer().unwrap();

        let race = CandidateRace::new();
        negotiator.accept_answer(answer(Vec::new(), true), race.sink());
        assert!(race.failure().is_some());
    }

    #[test]
    fn test_relay_without_server_fails() {
        let rt = runtime();
        let mut negotiator = TcpNegotiator::new(rt.handle().clone(), Arc::new(config()));
        negotiator.generate_offer().unwrap();

        let race = CandidateRace::new();
        let unreachable = "127.0.0.1:9".parse().unwrap();
        negotiator.accept_answer(answer(vec![unreachable], false), race.sink());
        negotiator.enable_relay();

        assert!(race.wait_for_winner(Duration::from_secs(1)).is_none());
        assert_eq!(race.failure().as_deref(), Some("no relay server configured"));
        negotiator.cancel_all();
    }

    #[test]
    fn test_relay_delivers_relay_candidate() {
        let rt = runtime();
        let relay = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let (joined_tx, joined_rx) = std::sync::mpsc::channel();
        rt.spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut join = String::new();
            reader.read_line(&mut join).await.unwrap();
            let _ = joined_tx.send(join);
            let mut stream = reader.into_inner();
            stream.write_all(b"{\"type\":\"ready\"}\n").await.unwrap();
            // hold the session open until the test ends
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = config();
        config.relay_server_addr = Some(relay_addr);
        let mut negotiator = TcpNegotiator::new(rt.handle().clone(), Arc::new(config));
        negotiator.generate_offer().unwrap();

        let race = CandidateRace::new();
        negotiator.accept_answer(answer(Vec::new(), true), race.sink());
        negotiator.enable_relay();
        negotiator.enable_relay();

        let winner = race.wait_for_winner(Duration::from_secs(5)).expect("no relay winner");
        assert_eq!(winner.kind(), CandidateKind::Relay);
        assert_eq!(negotiator.attempts.iter().filter(|a| a.kind == CandidateKind::Relay).count(), 1);

        let join = joined_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let join: RelayMessage = serde_json::from_str(join.trim()).unwrap();
        assert_eq!(
            join,
            RelayMessage::Join {
                session_id: negotiator.session_id(),
                fingerprint: "alice".to_string(),
            }
        );
        assert_ne!(negotiator.session_id(), 99);
        negotiator.cancel_losers(CandidateKind::Relay);
    }
}
