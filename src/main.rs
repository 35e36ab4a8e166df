use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use peerdial::nat_traversal::{NatTraversalConfig, SignallingClient, TcpNegotiatorFactory};
use peerdial::resolver::{PeerAddress, SignalingChannel, SocketResolver};
use peerdial::{NegotiatorFactory, ResolverConfig};
use std::{
    io::Write,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// peerdial - connect to a peer by identity through signalling, NAT traversal and relay
#[derive(Parser)]
#[command(name = "peerdial", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a socket to a peer and report which transport won
    Resolve(ResolveArgs),
}

#[derive(Args)]
struct ResolveArgs {
    /// Peer fingerprint (an identifier, not an address)
    peer: String,

    /// WebSocket signalling server, e.g. wss://your-server.com:8443
    #[arg(long, env = "SIGNALLING_URL")]
    signalling_url: String,

    /// Our identity; defaults to a random ID
    #[arg(long, env = "LOCAL_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Relay server used when no direct connection forms
    #[arg(long, env = "RELAY_SERVER")]
    relay: Option<SocketAddr>,

    /// Local TCP port for direct connections (0 for random)
    #[arg(long, env = "TCP_PORT", default_value_t = 0)]
    tcp_port: u16,

    /// Addresses to advertise to the peer, comma separated
    #[arg(long = "advertise", env = "ADVERTISED_ADDRS", value_delimiter = ',')]
    advertised_addrs: Vec<SocketAddr>,

    /// Bound on each outbound connection attempt
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Accept self-signed signalling certificates (development only)
    #[arg(long, env = "ACCEPT_INVALID_CERTS")]
    accept_invalid_certs: bool,

    /// JSON file with resolver timeouts; PEERDIAL_*_TIMEOUT_MS still override it
    #[arg(long, env = "PEERDIAL_CONFIG")]
    config: Option<PathBuf>,

    /// Line to send once connected
    #[arg(long)]
    message: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Resolve(args) => run_resolve(args),
    }
}

fn run_resolve(args: ResolveArgs) -> Result<()> {
    let local_fingerprint = args.fingerprint.unwrap_or_else(|| {
        let random_id = format!("peer_{}", rand::random::<u32>());
        warn!(%random_id, "LOCAL_FINGERPRINT not set, using random ID");
        random_id
    });
    let local = PeerAddress::new(&local_fingerprint).context("Invalid local fingerprint")?;
    let target = PeerAddress::new(&args.peer).context("Invalid peer fingerprint")?;

    let resolver_config = match &args.config {
        Some(path) => ResolverConfig::from_file(path)?,
        None => ResolverConfig::default(),
    }
    .apply_overrides(|key| std::env::var(key).ok())?;

    let mut nat_config = NatTraversalConfig::new(args.signalling_url, local.as_str());
    nat_config.tcp_port = args.tcp_port;
    nat_config.advertised_addrs = args.advertised_addrs;
    nat_config.relay_server_addr = args.relay;
    nat_config.connect_timeout = Duration::from_millis(args.connect_timeout_ms);
    nat_config.accept_invalid_certs = args.accept_invalid_certs;

    println!("Configuration:");
    println!("  Signalling Server : {}", nat_config.signalling_url);
    println!(
        "  Relay Server      : {}",
        nat_config
            .relay_server_addr
            .map_or_else(|| "none".to_string(), |addr| addr.to_string())
    );
    println!("  My Fingerprint    : {}", local);
    println!("  Target Peer       : {}", target);
    println!(
        "  Timeouts          : signalling {:?}, direct {:?}, relay {:?}",
        resolver_config.signaling_timeout,
        resolver_config.primary_timeout,
        resolver_config.relay_timeout
    );
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    let client = runtime
        .block_on(SignallingClient::connect(
            &nat_config.signalling_url,
            local.as_str(),
            nat_config.accept_invalid_certs,
        ))
        .context("Failed to connect to signalling server")?;
    let channel: Arc<dyn SignalingChannel> = Arc::new(client);

    let negotiators = TcpNegotiatorFactory::new(runtime.handle().clone(), Arc::new(nat_config));
    let negotiator = negotiators.create()?;

    let started = Instant::now();
    let resolver = SocketResolver::new(negotiator, channel, resolver_config).with_local_identity(local);
    let mut winner = resolver.resolve(&target)?;

    println!("Connected to {} via {} in {:?}", target, winner.kind(), started.elapsed());
    println!("  Socket            : {:?}", winner.socket_mut());

    if let Some(message) = args.message {
        let socket = winner.socket_mut();
        socket.write_all(message.as_bytes())?;
        socket.write_all(b"\n")?;
        socket.flush()?;
    }
    winner.socket_mut().close()?;

    Ok(())
}
