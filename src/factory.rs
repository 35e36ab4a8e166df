/**
 * factory.rs
 *
 * Blocking socket factory: one fresh resolver per connection request
 */

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::resolver::{
    Negotiator, NegotiationError, PeerAddress, ResolveError, SignalingChannel, Socket,
    SocketResolver,
};

/// Source of currently usable signalling channels
pub trait ChannelTracker: Send + Sync {
    fn channel(&self) -> Option<Arc<dyn SignalingChannel>>;
}

impl<F> ChannelTracker for F
where
    F: Fn() -> Option<Arc<dyn SignalingChannel>> + Send + Sync,
{
    fn channel(&self) -> Option<Arc<dyn SignalingChannel>> {
        self()
    }
}

/// Builds one negotiator per resolution
pub trait NegotiatorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Negotiator>, NegotiationError>;
}

impl<F> NegotiatorFactory for F
where
    F: Fn() -> Result<Box<dyn Negotiator>, NegotiationError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Negotiator>, NegotiationError> {
        self()
    }
}

/// Creates sockets to peers, negotiated over signalling
///
/// Cheap to share between threads. Every call builds its own
/// `SocketResolver`; nothing per-call is stored here.
pub struct SocketFactory {
    channels: Arc<dyn ChannelTracker>,
    negotiators: Arc<dyn NegotiatorFactory>,
    config: ResolverConfig,
    local_identities: Vec<PeerAddress>,
}

impl SocketFactory {
    pub fn new(
        channels: Arc<dyn ChannelTracker>,
        negotiators: Arc<dyn NegotiatorFactory>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            channels,
            negotiators,
            config,
            local_identities: Vec::new(),
        }
    }

    /// Identity of this peer; connecting to it fails fast
    pub fn with_local_identity(mut self, identity: PeerAddress) -> Self {
        self.local_identities.push(identity);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Connect to `target`, returning the winning socket
    pub fn connect(&self, target: &PeerAddress) -> Result<Socket, ResolveError> {
        if self.local_identities.contains(target) {
            warn!(peer = %target, "ignoring request to connect to ourselves");
            return Err(ResolveError::SelfConnectionRejected(target.clone()));
        }

        let Some(channel) = self.channels.channel() else {
            warn!(peer = %target, "no available signalling channels");
            return Err(ResolveError::SignalingUnavailable(
                "no available connections to signalling servers".to_string(),
            ));
        };

        let negotiator = self
            .negotiators
            .create()
            .map_err(ResolveError::OfferGenerationFailed)?;

        debug!(peer = %target, "creating socket");
        let resolver = SocketResolver::new(negotiator, channel, self.config.clone())
            .with_local_identities(self.local_identities.iter().cloned());
        resolver.resolve(target).map(|winner| winner.into_socket())
    }

    /// Connect to a peer named by a bare host string, as HTTP clients supply
    pub fn connect_host(&self, host: &str) -> Result<Socket, ResolveError> {
        let target = PeerAddress::new(host)?;
        self.connect(&target)
    }
}
