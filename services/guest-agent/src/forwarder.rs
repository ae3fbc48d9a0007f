//! Delivery of forwarding updates to the host tunnel peer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use dockside_portmap::PortMapping;

/// Sink for port forwarding updates.
///
/// The tracker talks to the host through this seam; tests substitute a
/// recording implementation.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Deliver one update to the peer.
    async fn send(&self, mapping: PortMapping) -> Result<()>;
}

/// Forwarder that dials the host tunnel peer over TCP.
///
/// Each update is a single JSON document on a fresh connection, terminated
/// by a newline. The peer treats the connection close as end of message.
pub struct VtunnelForwarder {
    peer_addr: String,
}

impl VtunnelForwarder {
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
        }
    }
}

#[async_trait]
impl PortForwarder for VtunnelForwarder {
    async fn send(&self, mapping: PortMapping) -> Result<()> {
        let mut stream = TcpStream::connect(&self.peer_addr)
            .await
            .with_context(|| format!("connecting to vtunnel peer {}", self.peer_addr))?;

        let mut payload = serde_json::to_vec(&mapping).context("encoding port mapping")?;
        payload.push(b'\n');

        stream
            .write_all(&payload)
            .await
            .context("writing port mapping")?;
        stream.shutdown().await.context("closing peer connection")?;

        debug!(
            peer = %self.peer_addr,
            remove = mapping.remove,
            ports = mapping.ports.len(),
            "sent port mapping"
        );
        Ok(())
    }
}
