//! Listener lifecycle and the per-connection pipeline.
//!
//! `start` binds and spawns one accept-loop task. Every accepted connection
//! gets its own task that resolves the original destination, dials it with
//! the configured mark and relays until both directions end. Connection tasks
//! share nothing but the read-only [`ConnectionContext`].

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::config::{ServerConfig, ShutdownMode};
use crate::error::ProxyError;
use crate::relay::relay;
use crate::sockopt::{KernelSocketOptions, SocketOptions};

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Transparent proxy server.
pub struct Server {
    config: ServerConfig,
    socket_options: Arc<dyn SocketOptions>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    cancel_connections: CancellationToken,
    accept_task: JoinHandle<()>,
    /// Connection tasks still alive when the accept loop exits. Dropping the
    /// receiver (server dropped without `stop`) leaves them detached.
    remaining: oneshot::Receiver<JoinSet<()>>,
}

/// Everything a connection task needs; never mutated after `start`.
struct ConnectionContext {
    socket_options: Arc<dyn SocketOptions>,
    mark: u32,
    connect_timeout: Option<Duration>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_socket_options(config, Arc::new(KernelSocketOptions))
    }

    pub fn with_socket_options(
        config: ServerConfig,
        socket_options: Arc<dyn SocketOptions>,
    ) -> Self {
        Self {
            config,
            socket_options,
            running: None,
        }
    }

    /// Address the listener is bound to while the server is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Binds the listener and starts accepting in the background.
    ///
    /// Returns as soon as the socket is listening.
    pub async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        if self.running.is_some() {
            return Err(ProxyError::Bind {
                addr: self.config.listen_addr.clone(),
                source: io::Error::new(io::ErrorKind::AddrInUse, "server already started"),
            });
        }

        let listener = bind_listener(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        })?;

        let ctx = Arc::new(ConnectionContext {
            socket_options: Arc::clone(&self.socket_options),
            mark: self.config.mark,
            connect_timeout: self.config.connect_timeout,
        });
        let stop_accepting = CancellationToken::new();
        let cancel_connections = CancellationToken::new();
        let (remaining_tx, remaining) = oneshot::channel();

        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            ctx,
            stop_accepting.clone(),
            cancel_connections.clone(),
            remaining_tx,
        ));

        info!(
            listen = %local_addr,
            mark = self.config.mark,
            shutdown = ?self.config.shutdown,
            "tcp-proxy listening"
        );

        self.running = Some(Running {
            local_addr,
            stop_accepting,
            cancel_connections,
            accept_task,
            remaining,
        });
        Ok(local_addr)
    }

    /// Closes the listener, then handles active relays per [`ShutdownMode`].
    ///
    /// The listening socket is closed by the time this returns. Calling it on
    /// a stopped server does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.stop_accepting.cancel();
        if let Err(err) = running.accept_task.await {
            error!(error = %err, "accept loop ended abnormally");
            return;
        }
        let Ok(mut connections) = running.remaining.await else {
            return;
        };

        match self.config.shutdown {
            ShutdownMode::Detach => {
                if !connections.is_empty() {
                    info!(
                        active = connections.len(),
                        "leaving active connections to finish on their own"
                    );
                }
                // Dropping the set would abort them.
                connections.detach_all();
            }
            ShutdownMode::Graceful { grace } => {
                drain_connections(connections, &running.cancel_connections, grace).await;
            }
        }

        info!(listen = %running.local_addr, "stopped");
    }
}

/// Dropping a running server closes the listener and detaches active relays,
/// whatever the configured [`ShutdownMode`].
impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.stop_accepting.cancel();
        }
    }
}

async fn bind_listener(listen_addr: &str) -> Result<TcpListener, ProxyError> {
    let bind_error = |source| ProxyError::Bind {
        addr: listen_addr.to_string(),
        source,
    };

    // ":port" means every interface, IPv4 and IPv6.
    if let Some(port) = listen_addr.strip_prefix(':') {
        let port = port.parse::<u16>().map_err(|_| {
            bind_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid port in listen address {listen_addr}"),
            ))
        })?;

        let dual_stack = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
        return match bind_socket(dual_stack, true) {
            Ok(listener) => Ok(listener),
            Err(err) => {
                debug!(error = %err, "dual-stack bind failed, falling back to IPv4");
                bind_socket(SocketAddr::from(([0, 0, 0, 0], port)), false).map_err(bind_error)
            }
        };
    }

    let addr = tokio::net::lookup_host(listen_addr)
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "listen address resolved to nothing",
            ))
        })?;

    bind_socket(addr, false).map_err(bind_error)
}

fn bind_socket(addr: SocketAddr, dual_stack: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Accepts until `stop` fires, then drops the listener and hands the
/// connection tasks that are still running to `remaining`.
async fn run_accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    stop: CancellationToken,
    cancel_connections: CancellationToken,
    remaining: oneshot::Sender<JoinSet<()>>,
) {
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection_task(joined);
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client_addr)) => {
                        let span =
                            info_span!("conn", client = %client_addr, dst = field::Empty);
                        connections.spawn(
                            handle_connection(
                                stream,
                                Arc::clone(&ctx),
                                cancel_connections.child_token(),
                            )
                            .instrument(span),
                        );
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed, continuing to listen");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    drop(listener);
    debug!("finished accepting new connections");

    if let Err(mut connections) = remaining.send(connections) {
        connections.detach_all();
    }
}

async fn drain_connections(
    mut connections: JoinSet<()>,
    cancel_connections: &CancellationToken,
    grace: Duration,
) {
    let grace_timer = tokio::time::sleep(grace);
    tokio::pin!(grace_timer);

    while !connections.is_empty() {
        tokio::select! {
            _ = &mut grace_timer => {
                warn!(
                    active = connections.len(),
                    grace = ?grace,
                    "shutdown grace period elapsed, closing remaining connections"
                );
                cancel_connections.cancel();
                break;
            }
            Some(joined) = connections.join_next() => log_connection_task(joined),
        }
    }

    while let Some(joined) = connections.join_next().await {
        log_connection_task(joined);
    }
}

fn log_connection_task(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "connection task panicked");
        } else {
            debug!(error = %err, "connection task cancelled");
        }
    }
}

/// Runs inside a `conn` span carrying `client`; `dst` is recorded once known.
async fn handle_connection(
    inbound: TcpStream,
    ctx: Arc<ConnectionContext>,
    cancel: CancellationToken,
) {
    info!("connection accepted");

    let dst = match resolve_destination(&inbound, ctx.socket_options.as_ref()) {
        Ok(dst) => dst,
        Err(err) => {
            warn!(error = %err, "dropping connection");
            return;
        }
    };
    Span::current().record("dst", field::display(dst));

    debug!("dialing");

    let outbound = tokio::select! {
        dialed = dial_outbound(dst, &ctx) => match dialed {
            Ok(outbound) => outbound,
            Err(err) => {
                warn!(error = %err, "dial failed");
                return;
            }
        },
        _ = cancel.cancelled() => {
            debug!("dial cancelled by shutdown");
            return;
        }
    };

    if let Err(err) = inbound.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY on inbound");
    }

    debug!("serving");

    match relay(inbound, outbound, &cancel).await {
        Some(stats) => info!(
            upstream_bytes = ?stats.client_to_server,
            downstream_bytes = ?stats.server_to_client,
            "connection closed"
        ),
        None => info!("connection closed by shutdown"),
    }
}

/// Original destination of `inbound`, rejecting one that points back at the
/// proxy itself.
fn resolve_destination(
    inbound: &TcpStream,
    socket_options: &dyn SocketOptions,
) -> Result<SocketAddrV4, ProxyError> {
    let dst = socket_options.original_destination(inbound)?;
    let local = inbound.local_addr().map_err(ProxyError::Resolution)?;

    // Accepted on a dual-stack socket, IPv4 peers show up as ::ffff:a.b.c.d.
    let local = SocketAddr::new(local.ip().to_canonical(), local.port());
    if SocketAddr::V4(dst) == local {
        return Err(ProxyError::Loopback {
            dst: SocketAddr::V4(dst),
            local,
        });
    }

    Ok(dst)
}

async fn dial_outbound(
    dst: SocketAddrV4,
    ctx: &ConnectionContext,
) -> Result<TcpStream, ProxyError> {
    let dst_addr = SocketAddr::V4(dst);
    let dial_error = |source| ProxyError::Dial {
        dst: dst_addr,
        source,
    };

    let socket = TcpSocket::new_v4().map_err(dial_error)?;

    // The mark goes on before connect so the SYN is already classified.
    if ctx.mark != 0 {
        if let Err(err) = ctx.socket_options.set_mark(&socket, ctx.mark) {
            warn!(error = %err, "dialing without socket mark");
        }
    }

    let outbound = match ctx.connect_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, socket.connect(dst_addr)).await {
            Ok(connected) => connected,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        },
        None => socket.connect(dst_addr).await,
    }
    .map_err(dial_error)?;

    if let Err(err) = outbound.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY on outbound");
    }

    Ok(outbound)
}
