//! The tunnel runtime: wires the route table into live listeners and
//! proxy sessions.
//!
//! One [`Conn`] is built per distinct remote peer; routes sharing a
//! peer share it. For routes originating here, a local TCP or UDP
//! listener opens a remote stream per connection. For routes
//! terminating here, a dispatcher listener accepts remote streams and
//! dials the advertised local service. Ports not present in the route
//! table never get a listener, so the dispatcher refuses them.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::channels::ChannelRegistry;
use crate::config::{Config, Route, RouteKind, DEFAULT_SIGNAL_CHANNEL};
use crate::crypt::Key;
use crate::error::Result;
use crate::peer::{Conn, DcStream, Dispatcher, Listener};
use crate::signal::Signaler;

const UDP_BUFFER: usize = 64 * 1024;

/// A running tunnel: the peer connections behind the active routes.
pub struct Tunnel {
    conns: HashMap<Key, (Arc<Conn>, Dispatcher)>,
}

impl Tunnel {
    /// Bring up connections and listeners for every route in `cfg`.
    ///
    /// Fails fast on unusable routes, unreachable peers, and local
    /// ports that cannot be bound.
    pub async fn start(
        cfg: Config,
        registry: &ChannelRegistry,
        bind_address: IpAddr,
    ) -> Result<Tunnel> {
        let url = cfg
            .signal_channel
            .clone()
            .unwrap_or_else(|| DEFAULT_SIGNAL_CHANNEL.to_string());
        let channel = registry.get(&url)?;
        let signaler = Signaler::new(cfg.keypair, channel);
        let me = cfg.keypair.public;

        let mut conns: HashMap<Key, (Arc<Conn>, Dispatcher)> = HashMap::new();

        for route in &cfg.routes {
            let peer = if route.local_peer == me {
                route.remote_peer
            } else if route.remote_peer == me {
                route.local_peer
            } else {
                tracing::warn!(
                    local_peer = %route.local_peer,
                    remote_peer = %route.remote_peer,
                    "route does not involve this peer, skipping"
                );
                continue;
            };

            if !conns.contains_key(&peer) {
                let conn = Arc::new(Conn::connect(&signaler, peer).await?);
                let dispatcher = Dispatcher::spawn(Arc::clone(&conn));
                conns.insert(peer, (conn, dispatcher));
            }
            let (conn, dispatcher) = &conns[&peer];

            if route.remote_peer == me {
                let listener = dispatcher.listen(route.remote_port)?;
                tokio::spawn(serve_inbound(listener, *route, bind_address));
            }

            if route.local_peer == me {
                tracing::info!(
                    port = route.local_port,
                    kind = %route.kind,
                    "starting local listener"
                );
                match route.kind {
                    RouteKind::Tcp => {
                        let listener =
                            TcpListener::bind((bind_address, route.local_port)).await?;
                        tokio::spawn(serve_local_tcp(listener, Arc::clone(conn), *route));
                    }
                    RouteKind::Udp => {
                        let socket = UdpSocket::bind((bind_address, route.local_port)).await?;
                        tokio::spawn(serve_local_udp(socket, Arc::clone(conn), *route));
                    }
                }
            }
        }

        Ok(Tunnel { conns })
    }

    /// Close every peer connection; all listeners and proxies wind
    /// down as their streams die.
    pub fn close(&self) {
        for (conn, _) in self.conns.values() {
            conn.close();
        }
    }
}

/// Run the tunnel until ctrl-c.
pub async fn run(cfg: Config, registry: &ChannelRegistry, bind_address: IpAddr) -> Result<()> {
    let tunnel = Tunnel::start(cfg, registry, bind_address).await?;
    tracing::info!("tunnel running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    tunnel.close();
    Ok(())
}

// ---------------------------------------------------------------------------
// Outbound: local listeners opening remote streams
// ---------------------------------------------------------------------------

async fn serve_local_tcp(listener: TcpListener, conn: Arc<Conn>, route: Route) {
    loop {
        let (local, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "error accepting connection");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            match conn.open(route.remote_port).await {
                Ok(remote) => proxy_tcp(local, remote).await,
                Err(e) => tracing::warn!(error = %e, "failed to open remote stream"),
            }
        });
    }
}

/// UDP routes use one socket and one remote stream for the lifetime of
/// the route. Datagram boundaries are not preserved across the tunnel.
async fn serve_local_udp(socket: UdpSocket, conn: Arc<Conn>, route: Route) {
    let stream = match conn.open(route.remote_port).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to open remote stream for udp route");
            return;
        }
    };

    let (stream_rd, stream_wr) = tokio::io::split(stream);
    let socket = Arc::new(socket);
    // Replies go to whoever sent us a datagram most recently.
    let last_peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    let result = tokio::select! {
        r = datagrams_to_stream(Arc::clone(&socket), Arc::clone(&last_peer), stream_wr) => r,
        r = stream_to_datagrams(stream_rd, socket, last_peer) => r,
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "udp route ended");
    }
}

async fn datagrams_to_stream(
    socket: Arc<UdpSocket>,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
    mut stream_wr: WriteHalf<DcStream>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        *last_peer.lock().unwrap() = Some(from);
        stream_wr.write_all(&buf[..n]).await?;
    }
}

async fn stream_to_datagrams(
    mut stream_rd: ReadHalf<DcStream>,
    socket: Arc<UdpSocket>,
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let n = stream_rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let target = *last_peer.lock().unwrap();
        if let Some(target) = target {
            socket.send_to(&buf[..n], target).await?;
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound: dispatcher listeners dialing local services
// ---------------------------------------------------------------------------

async fn serve_inbound(mut listener: Listener, route: Route, bind_address: IpAddr) {
    loop {
        let remote = match listener.accept().await {
            Ok(stream) => stream,
            Err(_) => break,
        };
        let target = SocketAddr::new(bind_address, route.remote_port);
        tokio::spawn(async move {
            match route.kind {
                RouteKind::Tcp => match TcpStream::connect(target).await {
                    Ok(local) => proxy_tcp(local, remote).await,
                    Err(e) => {
                        tracing::warn!(%target, error = %e, "failed to dial local service")
                    }
                },
                RouteKind::Udp => match dial_udp(target).await {
                    Ok(socket) => proxy_udp(socket, remote).await,
                    Err(e) => {
                        tracing::warn!(%target, error = %e, "failed to dial local service")
                    }
                },
            }
        });
    }
}

async fn dial_udp(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    Ok(socket)
}

// ---------------------------------------------------------------------------
// Proxy loops
// ---------------------------------------------------------------------------

/// Copy both directions until either side closes; the first error or a
/// clean EOF tears the pair down.
async fn proxy_tcp(mut local: TcpStream, mut remote: DcStream) {
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "error copying data between connections"),
    }
}

/// Bridge a remote stream to a connected UDP socket.
async fn proxy_udp(socket: UdpSocket, stream: DcStream) {
    let (stream_rd, stream_wr) = tokio::io::split(stream);
    let socket = Arc::new(socket);

    let result = tokio::select! {
        r = stream_to_socket(stream_rd, Arc::clone(&socket)) => r,
        r = socket_to_stream(socket, stream_wr) => r,
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "udp proxy ended");
    }
}

async fn stream_to_socket(
    mut stream_rd: ReadHalf<DcStream>,
    socket: Arc<UdpSocket>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let n = stream_rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        socket.send(&buf[..n]).await?;
    }
}

async fn socket_to_stream(
    socket: Arc<UdpSocket>,
    mut stream_wr: WriteHalf<DcStream>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let n = socket.recv(&mut buf).await?;
        stream_wr.write_all(&buf[..n]).await?;
    }
}
