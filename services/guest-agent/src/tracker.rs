//! Shared registry of forwarding intents.
//!
//! One tracker is created at startup and shared by every monitoring task.
//! It records which ports each source wants forwarded and acts on them in
//! two ways:
//! - container port maps are announced to the host tunnel peer
//! - iptables and Kubernetes ports are held open as loopback listeners so
//!   the host's automatic port detection picks them up

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dockside_portmap::{ConnectAddr, PortMap, PortMapping};

use crate::forwarder::PortForwarder;

/// Tracks forwarding intents from all sources.
///
/// All mutation is serialized internally; callers share the tracker
/// behind an `Arc`.
pub struct PortTracker {
    forwarder: Arc<dyn PortForwarder>,
    connect_addrs: RwLock<Vec<ConnectAddr>>,
    intents: Mutex<HashMap<String, PortMap>>,
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl PortTracker {
    pub fn new(forwarder: Arc<dyn PortForwarder>) -> Self {
        Self {
            forwarder,
            connect_addrs: RwLock::new(Vec::new()),
            intents: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Anchor subsequent announcements to the given guest addresses.
    ///
    /// Set once by the container monitor after interface resolution.
    pub async fn set_connect_addrs(&self, addrs: Vec<ConnectAddr>) {
        *self.connect_addrs.write().await = addrs;
    }

    /// Record an owner's published ports and announce them to the peer.
    ///
    /// Re-adding identical ports is a no-op. Changed ports retract the old
    /// set before announcing the new one.
    pub async fn add(&self, owner: &str, ports: PortMap) -> Result<()> {
        let previous = {
            let mut intents = self.intents.lock().await;
            if intents.get(owner) == Some(&ports) {
                debug!(owner, "ports unchanged");
                return Ok(());
            }
            intents.insert(owner.to_string(), ports.clone())
        };

        let connect_addrs = self.connect_addrs.read().await.clone();

        if let Some(old) = previous {
            self.forwarder
                .send(PortMapping::retract(old, connect_addrs.clone()))
                .await
                .with_context(|| format!("retracting stale ports of {owner}"))?;
        }

        info!(owner, ports = ports.len(), "announcing ports");
        self.forwarder
            .send(PortMapping::publish(ports, connect_addrs))
            .await
            .with_context(|| format!("announcing ports of {owner}"))
    }

    /// Drop an owner's ports and retract them from the peer.
    ///
    /// Unknown owners are ignored.
    pub async fn remove(&self, owner: &str) -> Result<()> {
        let Some(ports) = self.intents.lock().await.remove(owner) else {
            return Ok(());
        };

        let connect_addrs = self.connect_addrs.read().await.clone();

        info!(owner, ports = ports.len(), "retracting ports");
        self.forwarder
            .send(PortMapping::retract(ports, connect_addrs))
            .await
            .with_context(|| format!("retracting ports of {owner}"))
    }

    /// Retract every tracked intent.
    ///
    /// Used on monitor teardown; delivery failures are logged, not raised,
    /// so a clean shutdown stays clean.
    pub async fn remove_all(&self) {
        let drained: Vec<(String, PortMap)> = self.intents.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        let connect_addrs = self.connect_addrs.read().await.clone();

        info!(owners = drained.len(), "retracting all tracked ports");
        for (owner, ports) in drained {
            if let Err(e) = self
                .forwarder
                .send(PortMapping::retract(ports, connect_addrs.clone()))
                .await
            {
                warn!(owner = %owner, error = %e, "failed to retract ports");
            }
        }
    }

    /// Hold a loopback listener open for a port.
    ///
    /// Accepted connections are dropped immediately; the listener only
    /// exists so the host notices the port. Already-exposed ports are
    /// ignored.
    pub async fn expose(&self, port: u16) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&port) {
            return Ok(());
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding listener on {addr}"))?;

        info!(port, "exposing port");
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => drop(stream),
                    Err(e) => {
                        warn!(port, error = %e, "listener accept failed");
                        break;
                    }
                }
            }
        });
        listeners.insert(port, handle);
        Ok(())
    }

    /// Release the listener for a port, if any.
    pub async fn unexpose(&self, port: u16) {
        let Some(handle) = self.listeners.lock().await.remove(&port) else {
            return;
        };

        handle.abort();
        let _ = handle.await;
        info!(port, "released port");
    }

    /// Currently exposed listener ports, sorted.
    pub async fn exposed_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Owners with tracked port announcements, sorted.
    pub async fn tracked_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.intents.lock().await.keys().cloned().collect();
        owners.sort_unstable();
        owners
    }
}
