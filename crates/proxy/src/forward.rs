//! One-shot upstream exchanges.
//!
//! Every query gets a fresh ephemeral socket or connection: the proxy relays
//! each exchange independently so the upstream's behavior per query is
//! reflected back verbatim, with no pooling or retry layered in between.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

const MAX_DNS_MESSAGE_SIZE: usize = 65535;

/// Forwards `query` over a fresh UDP socket. `None` on any send/receive
/// failure or timeout; the caller answers the client with a SERVFAIL.
pub async fn forward_udp(
    upstream: SocketAddr,
    query: &[u8],
    exchange_timeout: Duration,
) -> Option<Vec<u8>> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().ok()?
    } else {
        "[::]:0".parse().ok()?
    };

    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "Failed to bind ephemeral upstream socket");
            return None;
        }
    };

    match timeout(exchange_timeout, socket.send_to(query, upstream)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!(error = %e, upstream = %upstream, "UDP forward send failed");
            return None;
        }
        Err(_) => {
            debug!(upstream = %upstream, "UDP forward send timed out");
            return None;
        }
    }

    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];
    match timeout(exchange_timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => {
            buf.truncate(len);
            Some(buf)
        }
        Ok(Err(e)) => {
            debug!(error = %e, upstream = %upstream, "UDP forward receive failed");
            None
        }
        Err(_) => {
            debug!(upstream = %upstream, "UDP forward timed out");
            None
        }
    }
}

/// Forwards `query` over a fresh length-prefixed TCP connection (RFC 1035
/// §4.2.2 framing). `None` on any failure or timeout.
pub async fn forward_tcp(
    upstream: SocketAddr,
    query: &[u8],
    exchange_timeout: Duration,
) -> Option<Vec<u8>> {
    let mut stream = match timeout(exchange_timeout, TcpStream::connect(upstream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(error = %e, upstream = %upstream, "TCP forward connect failed");
            return None;
        }
        Err(_) => {
            debug!(upstream = %upstream, "TCP forward connect timed out");
            return None;
        }
    };

    let exchange = async {
        send_framed(&mut stream, query).await?;
        read_framed(&mut stream).await
    };
    match timeout(exchange_timeout, exchange).await {
        Ok(Ok(response)) => Some(response),
        Ok(Err(e)) => {
            debug!(error = %e, upstream = %upstream, "TCP forward exchange failed");
            None
        }
        Err(_) => {
            debug!(upstream = %upstream, "TCP forward timed out");
            None
        }
    }
}

/// Writes a DNS message with its 2-byte big-endian length prefix.
pub async fn send_framed<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let length = message.len() as u16;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

/// Reads one length-prefixed DNS message. An empty read surfaces as
/// `UnexpectedEof`, which callers treat as client disconnect.
pub async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let message_len = u16::from_be_bytes(len_buf) as usize;

    let mut message = vec![0u8; message_len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}
