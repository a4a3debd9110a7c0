use crate::forward::{forward_tcp, forward_udp, read_framed, send_framed};
use crate::state::ProxyState;
use sitefence_domain::wire::{extract_answer_ips, extract_query_domain, make_servfail};
use sitefence_domain::{ProxyConfig, ProxyError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on every blocking wait in the listener loops; a raised stop token
/// is observed within one tick.
const POLL_TICK: Duration = Duration::from_secs(1);

const MAX_DNS_MESSAGE_SIZE: usize = 65535;

/// Placeholder domain for queries whose question section cannot be decoded.
const UNKNOWN_DOMAIN: &str = "unknown";

/// The DNS forwarding proxy: one UDP receive loop, one TCP accept loop,
/// one task per accepted TCP connection, all sharing [`ProxyState`].
pub struct DnsProxy {
    udp: UdpSocket,
    tcp: TcpListener,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    upstream: SocketAddr,
    exchange_timeout: Duration,
    duration: Option<Duration>,
    state: Arc<ProxyState>,
    stop: CancellationToken,
}

impl DnsProxy {
    /// Binds both transports. Either bind failure is fatal for the whole
    /// proxy: resolvers retry truncated UDP answers over TCP, so a proxy
    /// reachable on only one transport would skew the measurement.
    pub async fn bind(
        config: &ProxyConfig,
        state: Arc<ProxyState>,
        stop: CancellationToken,
    ) -> Result<Self, ProxyError> {
        let listen: SocketAddr = config.listen_addr.parse().map_err(|e| ProxyError::Bind {
            transport: "UDP",
            addr: config.listen_addr.clone(),
            reason: format!("invalid listen address: {e}"),
        })?;
        let upstream: SocketAddr =
            config.upstream_addr.parse().map_err(|e| ProxyError::Bind {
                transport: "UDP",
                addr: config.upstream_addr.clone(),
                reason: format!("invalid upstream address: {e}"),
            })?;

        let udp = UdpSocket::bind(listen).await.map_err(|e| ProxyError::Bind {
            transport: "UDP",
            addr: listen.to_string(),
            reason: e.to_string(),
        })?;
        let udp_addr = udp.local_addr().map_err(|e| ProxyError::Bind {
            transport: "UDP",
            addr: listen.to_string(),
            reason: e.to_string(),
        })?;

        let tcp = TcpListener::bind(listen).await.map_err(|e| ProxyError::Bind {
            transport: "TCP",
            addr: listen.to_string(),
            reason: e.to_string(),
        })?;
        let tcp_addr = tcp.local_addr().map_err(|e| ProxyError::Bind {
            transport: "TCP",
            addr: listen.to_string(),
            reason: e.to_string(),
        })?;

        let duration = match config.duration_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            udp,
            tcp,
            udp_addr,
            tcp_addr,
            upstream,
            exchange_timeout: Duration::from_millis(config.timeout_ms),
            duration,
            state,
            stop,
        })
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Serves until the stop token is raised or the configured duration
    /// elapses, then flushes the aggregates and closes the session.
    pub async fn run(self) -> Result<(), ProxyError> {
        info!(
            udp = %self.udp_addr,
            tcp = %self.tcp_addr,
            upstream = %self.upstream,
            "DNS proxy started"
        );

        let udp_task = tokio::spawn(udp_loop(
            self.udp,
            self.upstream,
            self.exchange_timeout,
            self.state.clone(),
            self.stop.clone(),
        ));
        let tcp_task = tokio::spawn(tcp_loop(
            self.tcp,
            self.upstream,
            self.exchange_timeout,
            self.state.clone(),
            self.stop.clone(),
        ));

        match self.duration {
            Some(duration) => {
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        info!(duration_secs = duration.as_secs(), "Session duration elapsed");
                        self.stop.cancel();
                    }
                }
            }
            None => self.stop.cancelled().await,
        }

        let _ = udp_task.await;
        let _ = tcp_task.await;

        let total = self.state.query_count().await;
        info!(total_events = total, "DNS proxy stopped");
        self.state.finalize().await
    }
}

/// Serves one UDP exchange: forward, SERVFAIL fallback, relay, record.
async fn serve_udp_exchange(
    socket: &UdpSocket,
    client: SocketAddr,
    query: &[u8],
    upstream: SocketAddr,
    exchange_timeout: Duration,
    state: &ProxyState,
) {
    let domain =
        extract_query_domain(query).unwrap_or_else(|| UNKNOWN_DOMAIN.to_string());

    let response = match forward_udp(upstream, query, exchange_timeout).await {
        Some(response) => response,
        None => match make_servfail(query) {
            Some(servfail) => {
                debug!(domain, "Upstream UDP exchange failed, answering SERVFAIL");
                servfail
            }
            // Too short to even echo a header back; drop the datagram.
            None => return,
        },
    };

    if let Err(e) = socket.send_to(&response, client).await {
        debug!(error = %e, client = %client, "Failed to send UDP response");
        return;
    }

    let ips = extract_answer_ips(&response);
    state.record_event(&domain, &ips).await;
}

async fn udp_loop(
    socket: UdpSocket,
    upstream: SocketAddr,
    exchange_timeout: Duration,
    state: Arc<ProxyState>,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];

    while !stop.is_cancelled() {
        let (len, client) = match timeout(POLL_TICK, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                debug!(error = %e, "UDP receive failed");
                continue;
            }
            // Poll tick elapsed; re-check the stop token.
            Err(_) => continue,
        };

        serve_udp_exchange(&socket, client, &buf[..len], upstream, exchange_timeout, &state)
            .await;
    }

    debug!("UDP listener loop exited");
}

async fn tcp_loop(
    listener: TcpListener,
    upstream: SocketAddr,
    exchange_timeout: Duration,
    state: Arc<ProxyState>,
    stop: CancellationToken,
) {
    while !stop.is_cancelled() {
        let (stream, peer) = match timeout(POLL_TICK, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(error = %e, "TCP accept failed");
                continue;
            }
            Err(_) => continue,
        };

        debug!(peer = %peer, "TCP client connected");
        tokio::spawn(handle_tcp_client(
            stream,
            upstream,
            exchange_timeout,
            state.clone(),
            stop.clone(),
        ));
    }

    debug!("TCP listener loop exited");
}

/// Reads length-prefixed queries off one client connection until idle
/// timeout, disconnect, or shutdown.
async fn handle_tcp_client(
    mut stream: TcpStream,
    upstream: SocketAddr,
    exchange_timeout: Duration,
    state: Arc<ProxyState>,
    stop: CancellationToken,
) {
    loop {
        if stop.is_cancelled() {
            return;
        }

        let query = match timeout(POLL_TICK, read_framed(&mut stream)).await {
            Ok(Ok(query)) => query,
            // Disconnect or framing error.
            Ok(Err(_)) => return,
            // Idle; close the connection, the client will reconnect.
            Err(_) => return,
        };

        let domain =
            extract_query_domain(&query).unwrap_or_else(|| UNKNOWN_DOMAIN.to_string());

        let response = match forward_tcp(upstream, &query, exchange_timeout).await {
            Some(response) => response,
            None => match make_servfail(&query) {
                Some(servfail) => {
                    debug!(domain, "Upstream TCP exchange failed, answering SERVFAIL");
                    servfail
                }
                None => continue,
            },
        };

        if let Err(e) = send_framed(&mut stream, &response).await {
            warn!(error = %e, "Failed to send TCP response");
            return;
        }

        let ips = extract_answer_ips(&response);
        state.record_event(&domain, &ips).await;
    }
}
