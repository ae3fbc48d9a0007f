//! Container engine monitoring.
//!
//! Watches the engine's event stream and keeps the tracker in sync with
//! published container ports: a start event announces them, a die event
//! retracts them. Containers already running when the agent attaches are
//! picked up by an initial scan.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use dockside_portmap::{PortBinding, PortMap};

use crate::supervisor::CancelSignal;
use crate::tracker::PortTracker;

/// Per-request engine API timeout, in seconds.
const API_TIMEOUT_SECS: u64 = 120;

/// Monitors one engine socket for container port changes.
pub struct EventMonitor {
    docker: Docker,
    tracker: Arc<PortTracker>,
}

/// A container event the tracker cares about.
#[derive(Debug, PartialEq, Eq)]
enum PortEvent {
    Started(String),
    Died(String),
}

/// Connect to the engine socket and confirm it answers its API.
///
/// Used as the readiness verification callback. The client is built fresh
/// on every attempt: `connect_with_unix` refuses a socket path that does
/// not exist, so a client made before the engine boots would be an
/// immediate fatal error rather than something the probe can retry. The
/// client that passed verification is handed back for the monitor to keep.
pub async fn connect_and_verify(socket_path: &str, mut cancel: CancelSignal) -> Result<Docker> {
    let docker =
        Docker::connect_with_unix(socket_path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .with_context(|| format!("connecting to engine socket {socket_path}"))?;

    tokio::select! {
        result = docker.info() => {
            let info = result.context("querying engine info")?;
            debug!(
                server_version = info.server_version.as_deref().unwrap_or("unknown"),
                "engine answered"
            );
            Ok(docker)
        }
        _ = cancel.cancelled() => Err(anyhow!("cancelled during engine verification")),
    }
}

impl EventMonitor {
    /// Wrap a verified engine client.
    pub fn new(docker: Docker, tracker: Arc<PortTracker>) -> Self {
        Self { docker, tracker }
    }

    /// Mirror container port changes into the tracker until cancelled.
    ///
    /// The event stream ending or failing is fatal; the supervisor treats
    /// it as an agent failure. Cancellation retracts everything tracked
    /// and returns cleanly.
    pub async fn monitor_ports(&self, mut cancel: CancelSignal) -> Result<()> {
        self.scan_running_containers().await?;

        let mut events = self.docker.events(None::<EventsOptions>);
        info!("watching container events");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(message)) => self.handle_event(message).await?,
                    Some(Err(e)) => {
                        return Err(anyhow::Error::new(e).context("engine event stream failed"));
                    }
                    None => return Err(anyhow!("engine event stream ended")),
                },
                _ = cancel.cancelled() => {
                    info!("stopping container monitoring");
                    self.tracker.remove_all().await;
                    return Ok(());
                }
            }
        }
    }

    /// Pick up containers that started before the agent attached.
    async fn scan_running_containers(&self) -> Result<()> {
        let containers = self
            .docker
            .list_containers(None::<ListContainersOptions>)
            .await
            .context("listing running containers")?;

        debug!(count = containers.len(), "scanning running containers");
        for summary in containers {
            let Some(id) = summary.id else { continue };
            match self.published_ports(&id).await {
                Ok(ports) if !ports.is_empty() => self.tracker.add(&id, ports).await?,
                Ok(_) => {}
                Err(e) => {
                    warn!(container = short_id(&id), error = %e, "inspect failed during scan")
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&self, message: EventMessage) -> Result<()> {
        match classify_event(&message) {
            Some(PortEvent::Started(id)) => {
                let ports = match self.published_ports(&id).await {
                    Ok(ports) => ports,
                    Err(e) => {
                        // The container can die between the event and our
                        // inspect call.
                        warn!(container = short_id(&id), error = %e, "inspect failed after start");
                        return Ok(());
                    }
                };
                if ports.is_empty() {
                    debug!(container = short_id(&id), "no published ports");
                    return Ok(());
                }
                self.tracker.add(&id, ports).await
            }
            Some(PortEvent::Died(id)) => self.tracker.remove(&id).await,
            None => Ok(()),
        }
    }

    /// Published host ports of a container, in wire shape.
    async fn published_ports(&self, id: &str) -> Result<PortMap> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspecting container {}", short_id(id)))?;

        Ok(collect_published(
            inspect.network_settings.and_then(|n| n.ports),
        ))
    }
}

/// Reduce an engine port map to the bindings that are actually published.
fn collect_published(ports: Option<bollard::models::PortMap>) -> PortMap {
    let mut published = PortMap::new();
    let Some(ports) = ports else {
        return published;
    };

    for (spec, bindings) in ports {
        let Some(bindings) = bindings else { continue };
        if bindings.is_empty() {
            continue;
        }
        let mapped = bindings
            .into_iter()
            .map(|binding| PortBinding {
                host_ip: binding.host_ip.unwrap_or_default(),
                host_port: binding.host_port.unwrap_or_default(),
            })
            .collect();
        published.insert(spec, mapped);
    }
    published
}

fn classify_event(message: &EventMessage) -> Option<PortEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let id = message.actor.as_ref()?.id.as_ref()?;

    match message.action.as_deref() {
        Some("start") => Some(PortEvent::Started(id.clone())),
        Some("die") => Some(PortEvent::Died(id.clone())),
        _ => None,
    }
}

/// Engine ids are long hashes; logs use the familiar short form.
fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    use bollard::models::EventActor;

    use crate::forwarder::PortForwarder;

    struct NoopForwarder;

    #[async_trait::async_trait]
    impl PortForwarder for NoopForwarder {
        async fn send(&self, _mapping: dockside_portmap::PortMapping) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_connect_before_socket_exists_is_retryable() {
        // The agent can start before the engine has created its socket.
        // The attempt must come back as an error the readiness loop
        // retries on the next tick, not tear the task down.
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("docker.sock");

        let group = crate::supervisor::TaskGroup::new();
        let result =
            connect_and_verify(socket_path.to_str().unwrap(), group.cancel_signal()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_monitor_wraps_an_existing_client() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("docker.sock");
        std::fs::File::create(&socket_path).unwrap();

        let docker = Docker::connect_with_unix(
            socket_path.to_str().unwrap(),
            API_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .unwrap();
        let tracker = Arc::new(PortTracker::new(Arc::new(NoopForwarder)));
        let _monitor = EventMonitor::new(docker, tracker);
    }

    fn container_event(action: &str, id: &str) -> EventMessage {
        EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some(id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_start_and_die() {
        assert_eq!(
            classify_event(&container_event("start", "abc")),
            Some(PortEvent::Started("abc".to_string()))
        );
        assert_eq!(
            classify_event(&container_event("die", "abc")),
            Some(PortEvent::Died("abc".to_string()))
        );
    }

    #[test]
    fn test_classify_ignores_other_events() {
        assert_eq!(classify_event(&container_event("pause", "abc")), None);

        let mut network = container_event("start", "abc");
        network.typ = Some(EventMessageTypeEnum::NETWORK);
        assert_eq!(classify_event(&network), None);

        let mut anonymous = container_event("start", "abc");
        anonymous.actor = None;
        assert_eq!(classify_event(&anonymous), None);
    }

    #[test]
    fn test_collect_published_skips_unbound_ports() {
        let mut engine_ports = bollard::models::PortMap::new();
        engine_ports.insert(
            "80/tcp".to_string(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("8080".to_string()),
            }]),
        );
        engine_ports.insert("443/tcp".to_string(), None);
        engine_ports.insert("9000/tcp".to_string(), Some(Vec::new()));

        let published = collect_published(Some(engine_ports));
        assert_eq!(published.len(), 1);
        assert_eq!(published["80/tcp"][0].host_port, "8080");

        assert!(collect_published(None).is_empty());
    }

    #[test]
    fn test_short_id_truncates_long_hashes() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
