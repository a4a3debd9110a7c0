//! Whole-pipeline test: a resolver client queries the proxy, the proxy
//! relays to a scripted upstream and logs the event, and the blocker tails
//! that log and converges a scripted firewall onto the answered IPs.

use async_trait::async_trait;
use sitefence_blocker::pf::{FirewallError, FirewallPort};
use sitefence_blocker::BlockSynchronizer;
use sitefence_domain::ProxyConfig;
use sitefence_proxy::{DnsProxy, ProxyState};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const RUN_STAMP: &str = "20260826-12:00:00";

fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

fn build_query(id: u16, name: &str) -> Vec<u8> {
    let mut msg = vec![
        (id >> 8) as u8,
        id as u8,
        0x01,
        0x00,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    msg.extend_from_slice(&encode_name(name));
    msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    msg
}

fn build_a_response(query: &[u8], addrs: &[[u8; 4]]) -> Vec<u8> {
    let mut msg = query.to_vec();
    msg[2] = 0x81;
    msg[3] = 0x80;
    msg[6] = (addrs.len() >> 8) as u8;
    msg[7] = addrs.len() as u8;
    for addr in addrs {
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        msg.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]);
        msg.extend_from_slice(&[0x00, 0x04]);
        msg.extend_from_slice(addr);
    }
    msg
}

/// One-shot scripted upstream answering every query with the given A records.
async fn spawn_udp_upstream(addrs: Vec<[u8; 4]>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => return,
            };
            let response = build_a_response(&buf[..len], &addrs);
            let _ = socket.send_to(&response, peer).await;
        }
    });
    addr
}

#[derive(Debug, Default)]
struct RecordingFirewall {
    loaded: Mutex<Vec<String>>,
}

#[async_trait]
impl FirewallPort for RecordingFirewall {
    async fn is_enabled(&self) -> Result<bool, FirewallError> {
        Ok(true)
    }

    async fn enable(&self) -> Result<String, FirewallError> {
        Ok("pf enabled".to_string())
    }

    async fn load_anchor(&self, rules: &str) -> Result<(), FirewallError> {
        self.loaded.lock().unwrap().push(rules.to_string());
        Ok(())
    }

    async fn flush_anchor(&self) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn rule_stats(&self) -> Result<String, FirewallError> {
        Ok(String::new())
    }

    async fn label_stats(&self) -> Result<String, FirewallError> {
        Ok(String::new())
    }
}

#[tokio::test]
async fn test_query_flows_from_client_to_firewall_rules() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = spawn_udp_upstream(vec![[142, 250, 1, 1], [142, 250, 1, 2]]).await;

    let config = ProxyConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        upstream_addr: upstream.to_string(),
        timeout_ms: 1000,
        duration_secs: 0,
    };
    let state = Arc::new(ProxyState::create(dir.path(), RUN_STAMP).await.unwrap());
    let events_log = state.events_path().to_path_buf();
    let stop = CancellationToken::new();
    let proxy = DnsProxy::bind(&config, state, stop.clone()).await.unwrap();
    let proxy_addr = proxy.udp_addr();
    let proxy_task = tokio::spawn(proxy.run());

    // Resolver client side of the pipeline.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = build_query(0x4242, "youtube.com");
    client.send_to(&query, proxy_addr).await.unwrap();
    let mut buf = vec![0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..2], &[0x42, 0x42]);
    assert!(len > query.len());

    // Blocker side: tail the same log and converge the firewall.
    let firewall = Arc::new(RecordingFirewall::default());
    let mut sync = BlockSynchronizer::new(
        "youtube.com",
        events_log.clone(),
        dir.path(),
        RUN_STAMP,
        "sitefence/block",
        "sitefence_block",
        Duration::from_millis(10),
        None,
        Arc::clone(&firewall) as Arc<dyn FirewallPort>,
        CancellationToken::new(),
    );
    sync.startup().await.unwrap();

    // The proxy appends the event after answering; poll until it lands.
    let mut converged = false;
    for _ in 0..50 {
        sync.poll_cycle().await;
        if !sync.state().enforced_ips.is_empty() {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(converged, "blocker never observed the proxied event");

    assert!(sync.state().enforced_ips.contains("142.250.1.1"));
    assert!(sync.state().enforced_ips.contains("142.250.1.2"));
    let rules = firewall.loaded.lock().unwrap().clone();
    assert_eq!(rules.len(), 1);
    assert!(rules[0].contains("142.250.1.1, 142.250.1.2"));
    assert!(rules[0].contains("block drop out quick"));

    sync.shutdown().await;
    assert!(dir
        .path()
        .join(format!("block_summary_{RUN_STAMP}.json"))
        .exists());

    stop.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(3), proxy_task).await;

    // Proxy finalization writes the per-domain history artifact.
    assert!(dir
        .path()
        .join(format!("domain_history_{RUN_STAMP}.json"))
        .exists());
}
