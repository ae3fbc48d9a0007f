//! Integration tests for port exposure and tunnel announcements.
//!
//! These tests run the tracker against real sockets:
//! 1. Exposed ports accept loopback connections until unexposed
//! 2. Announcements reach a live tunnel endpoint as newline-framed JSON
//! 3. Removal announces a retraction for the same ports

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dockside_guest_agent::forwarder::{PortForwarder, VtunnelForwarder};
use dockside_guest_agent::PortTracker;
use dockside_portmap::{ConnectAddr, PortBinding, PortMap, PortMapping};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_DEADLINE: Duration = Duration::from_secs(5);

/// Forwarder for tests that never announce anything.
struct NullForwarder;

#[async_trait]
impl PortForwarder for NullForwarder {
    async fn send(&self, _mapping: PortMapping) -> Result<()> {
        Ok(())
    }
}

fn sample_ports() -> PortMap {
    let mut ports = PortMap::new();
    ports.insert(
        "80/tcp".to_string(),
        vec![PortBinding {
            host_ip: "0.0.0.0".to_string(),
            host_port: "8080".to_string(),
        }],
    );
    ports
}

#[tokio::test]
async fn test_exposed_port_accepts_connections_until_unexposed() {
    let tracker = PortTracker::new(Arc::new(NullForwarder));

    tracker.expose(42203).await.unwrap();
    TcpStream::connect("127.0.0.1:42203")
        .await
        .expect("exposed port must accept connections");

    tracker.unexpose(42203).await;
    assert!(
        TcpStream::connect("127.0.0.1:42203").await.is_err(),
        "unexposed port must refuse connections"
    );
}

#[tokio::test]
async fn test_expose_is_idempotent() {
    let tracker = PortTracker::new(Arc::new(NullForwarder));

    tracker.expose(42204).await.unwrap();
    tracker.expose(42204).await.unwrap();
    assert_eq!(tracker.exposed_ports().await, vec![42204]);

    tracker.unexpose(42204).await;
    tracker.unexpose(42204).await;
    assert!(tracker.exposed_ports().await.is_empty());
}

#[tokio::test]
async fn test_announcement_reaches_the_tunnel_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap().to_string();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        lines.next_line().await.unwrap().unwrap()
    });

    let tracker = PortTracker::new(Arc::new(VtunnelForwarder::new(peer_addr)));
    tracker
        .set_connect_addrs(vec![ConnectAddr {
            network: "ip+net".to_string(),
            addr: "192.168.64.5/24".to_string(),
        }])
        .await;
    tracker.add("c0ffee", sample_ports()).await.unwrap();

    let line = timeout(TEST_DEADLINE, accept).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();

    assert_eq!(value["Remove"], serde_json::json!(false));
    assert_eq!(value["Ports"]["80/tcp"][0]["HostIp"], serde_json::json!("0.0.0.0"));
    assert_eq!(value["Ports"]["80/tcp"][0]["HostPort"], serde_json::json!("8080"));
    assert_eq!(value["ConnectAddrs"][0]["Network"], serde_json::json!("ip+net"));
    assert_eq!(
        value["ConnectAddrs"][0]["Addr"],
        serde_json::json!("192.168.64.5/24")
    );
}

#[tokio::test]
async fn test_removal_announces_a_retraction() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap().to_string();

    let accept = tokio::spawn(async move {
        let mut messages = Vec::new();
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            messages.push(lines.next_line().await.unwrap().unwrap());
        }
        messages
    });

    let tracker = PortTracker::new(Arc::new(VtunnelForwarder::new(peer_addr)));
    tracker.add("c0ffee", sample_ports()).await.unwrap();
    tracker.remove("c0ffee").await.unwrap();
    assert!(tracker.tracked_owners().await.is_empty());

    let messages = timeout(TEST_DEADLINE, accept).await.unwrap().unwrap();
    let publish: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
    let retract: serde_json::Value = serde_json::from_str(&messages[1]).unwrap();

    assert_eq!(publish["Remove"], serde_json::json!(false));
    assert_eq!(retract["Remove"], serde_json::json!(true));
    assert_eq!(retract["Ports"], publish["Ports"]);
}
