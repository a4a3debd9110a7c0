use sitefence_domain::event::parse_line;
use sitefence_domain::wire::extract_answer_ips;
use sitefence_domain::ProxyConfig;
use sitefence_proxy::{DnsProxy, ProxyState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

fn encode_name(labels: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for label in labels {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

fn build_query(id: u16, labels: &[&str]) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&[0x01, 0x00]);
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    msg.extend_from_slice(&encode_name(labels));
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg
}

fn build_a_response(query: &[u8], addrs: &[[u8; 4]]) -> Vec<u8> {
    let mut msg = query.to_vec();
    msg[2] = 0x81;
    msg[3] = 0x80;
    msg[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
    for addr in addrs {
        msg.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&60u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(addr);
    }
    msg
}

async fn spawn_udp_upstream(addrs: Vec<[u8; 4]>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let response = build_a_response(&buf[..len], &addrs);
            let _ = socket.send_to(&response, peer).await;
        }
    });
    addr
}

async fn spawn_tcp_upstream(addrs: Vec<[u8; 4]>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let addrs = addrs.clone();
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                if stream.read_exact(&mut query).await.is_err() {
                    return;
                }
                let response = build_a_response(&query, &addrs);
                let _ = stream
                    .write_all(&(response.len() as u16).to_be_bytes())
                    .await;
                let _ = stream.write_all(&response).await;
            });
        }
    });
    addr
}

async fn wait_for_event_line(path: &Path) -> String {
    for _ in 0..50 {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if let Some(line) = contents.lines().next() {
                if contents.contains('\n') {
                    return line.to_string();
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no event line appeared in {}", path.display());
}

fn test_config(upstream: SocketAddr, timeout_ms: u64) -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        upstream_addr: upstream.to_string(),
        timeout_ms,
        duration_secs: 0,
    }
}

#[tokio::test]
async fn test_udp_end_to_end_records_event() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ProxyState::create(dir.path(), "udp-e2e").await.unwrap());
    let upstream = spawn_udp_upstream(vec![[142, 250, 1, 1]]).await;

    let stop = CancellationToken::new();
    let proxy = DnsProxy::bind(&test_config(upstream, 2000), state.clone(), stop.clone())
        .await
        .unwrap();
    let proxy_addr = proxy.udp_addr();
    let events_path = state.events_path().to_path_buf();
    let server = tokio::spawn(proxy.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = build_query(0x4242, &["youtube", "com"]);
    client.send_to(&query, proxy_addr).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("proxy must answer")
        .unwrap();
    let response = &buf[..len];
    assert_eq!(&response[0..2], &0x4242u16.to_be_bytes());
    assert_eq!(extract_answer_ips(response), vec!["142.250.1.1"]);

    let line = wait_for_event_line(&events_path).await;
    let record = parse_line(&line).unwrap();
    assert_eq!(record.domain, "youtube.com");
    assert_eq!(record.ips, vec!["142.250.1.1"]);

    stop.cancel();
    server.await.unwrap().unwrap();
    assert!(state.history_path().exists());
}

#[tokio::test]
async fn test_udp_upstream_timeout_yields_servfail_and_empty_event() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ProxyState::create(dir.path(), "udp-sf").await.unwrap());

    // Bound but silent upstream; keep the socket alive for the test.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream = silent.local_addr().unwrap();

    let stop = CancellationToken::new();
    let proxy = DnsProxy::bind(&test_config(upstream, 200), state.clone(), stop.clone())
        .await
        .unwrap();
    let proxy_addr = proxy.udp_addr();
    let events_path = state.events_path().to_path_buf();
    let server = tokio::spawn(proxy.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = build_query(0x1234, &["example", "com"]);
    client.send_to(&query, proxy_addr).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("proxy must answer even when upstream is dead")
        .unwrap();
    let response = &buf[..len];
    assert_eq!(&response[0..2], &0x1234u16.to_be_bytes());
    assert_eq!(response[3] & 0x0F, 2, "RCODE must be SERVFAIL");
    assert_eq!(&response[12..], &query[12..], "question preserved");

    let line = wait_for_event_line(&events_path).await;
    let record = parse_line(&line).unwrap();
    assert_eq!(record.domain, "example.com");
    assert!(record.ips.is_empty());

    stop.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcp_end_to_end_records_event() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ProxyState::create(dir.path(), "tcp-e2e").await.unwrap());
    let upstream = spawn_tcp_upstream(vec![[93, 184, 216, 34]]).await;

    let stop = CancellationToken::new();
    let proxy = DnsProxy::bind(&test_config(upstream, 2000), state.clone(), stop.clone())
        .await
        .unwrap();
    let proxy_addr = proxy.tcp_addr();
    let events_path = state.events_path().to_path_buf();
    let server = tokio::spawn(proxy.run());

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let query = build_query(0x7777, &["example", "org"]);
    client
        .write_all(&(query.len() as u16).to_be_bytes())
        .await
        .unwrap();
    client.write_all(&query).await.unwrap();

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut len_buf))
        .await
        .expect("proxy must answer over TCP")
        .unwrap();
    let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    client.read_exact(&mut response).await.unwrap();

    assert_eq!(&response[0..2], &0x7777u16.to_be_bytes());
    assert_eq!(extract_answer_ips(&response), vec!["93.184.216.34"]);

    let line = wait_for_event_line(&events_path).await;
    let record = parse_line(&line).unwrap();
    assert_eq!(record.domain, "example.org");
    assert_eq!(record.ips, vec!["93.184.216.34"]);

    stop.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_conflict_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ProxyState::create(dir.path(), "bind").await.unwrap());

    // Occupy a TCP port, then ask the proxy to bind the same address.
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let config = ProxyConfig {
        listen_addr: addr.to_string(),
        upstream_addr: "1.1.1.1:53".to_string(),
        timeout_ms: 1000,
        duration_secs: 0,
    };
    let result = DnsProxy::bind(&config, state, CancellationToken::new()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_duration_elapsed_stops_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(ProxyState::create(dir.path(), "dur").await.unwrap());
    let upstream = spawn_udp_upstream(vec![[1, 1, 1, 1]]).await;

    let mut config = test_config(upstream, 500);
    config.duration_secs = 1;

    let stop = CancellationToken::new();
    let proxy = DnsProxy::bind(&config, state.clone(), stop.clone())
        .await
        .unwrap();
    let server = tokio::spawn(proxy.run());

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("proxy must stop once the duration elapses")
        .unwrap()
        .unwrap();
    assert!(stop.is_cancelled());
    assert!(state.history_path().exists());
}
