/**
 * nat_traversal/tcp_connect.rs
 *
 * TCP simultaneous open, reusable listeners and bounded connects
 */

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// First-try budget for a plain connect before simultaneous open
const DIRECT_ATTEMPT: Duration = Duration::from_millis(500);

/// TCP connection error
#[derive(Debug, Error)]
pub enum TcpConnectError {
    #[error("connection timeout")]
    Timeout,

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// Socket with SO_REUSEADDR (and SO_REUSEPORT on unix) bound to `local_addr`
fn reusable_socket(local_addr: SocketAddr) -> Result<Socket, TcpConnectError> {
    let bind_err = |e: io::Error| TcpConnectError::BindFailed(format!("{local_addr}: {e}"));

    let socket = Socket::new(
        Domain::for_address(local_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_err)?;

    socket.bind(&local_addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    Ok(socket)
}

/// Bind a non-blocking listener on `port` that outbound attempts can share
pub fn bind_reusable_listener(port: u16) -> Result<StdTcpListener, TcpConnectError> {
    let local_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = reusable_socket(local_addr)?;
    socket
        .listen(128)
        .map_err(|e| TcpConnectError::BindFailed(format!("{local_addr}: {e}")))?;
    Ok(socket.into())
}

/// Connect to `addr`, giving up after `timeout`
pub async fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, TcpConnectError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TcpConnectError::ConnectFailed(format!("{addr}: {e}"))),
        Err(_) => Err(TcpConnectError::Timeout),
    }
}

/// Perform TCP simultaneous open
///
/// A plain connect is tried first, in case the peer is directly reachable
/// or already listening. Otherwise the connect is made from `local_port`
/// so that outbound SYNs leave through the same mapping the peer was told
/// about, letting both NATs pass the crossing handshakes.
pub async fn tcp_simultaneous_open(
    local_port: u16,
    peer_addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, TcpConnectError> {
    let start = Instant::now();
    debug!(local_port, %peer_addr, "starting TCP simultaneous open");

    // Strategy 1: direct connection
    match connect_with_timeout(peer_addr, DIRECT_ATTEMPT.min(timeout)).await {
        Ok(stream) => {
            debug!(%peer_addr, "direct TCP connection succeeded");
            return Ok(stream);
        }
        Err(e) => debug!(%peer_addr, error = %e, "direct connection failed, trying simultaneous open"),
    }

    // Strategy 2: connect from the advertised port
    let remaining = timeout.saturating_sub(start.elapsed());
    if remaining.is_zero() {
        return Err(TcpConnectError::Timeout);
    }

    let local_addr = match peer_addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], local_port)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], local_port)),
    };
    let std_stream: std::net::TcpStream = reusable_socket(local_addr)?.into();
    let socket = TcpSocket::from_std_stream(std_stream);

    match tokio::time::timeout(remaining, socket.connect(peer_addr)).await {
        Ok(Ok(stream)) => {
            debug!(%peer_addr, "TCP simultaneous open succeeded");
            Ok(stream)
        }
        Ok(Err(e)) => Err(TcpConnectError::ConnectFailed(format!("{peer_addr}: {e}"))),
        Err(_) => Err(TcpConnectError::Timeout),
    }
}

/// Hand a tokio stream over to blocking callers
pub fn into_blocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}
