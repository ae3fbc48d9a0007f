//! Kubernetes NodePort service watching.
//!
//! k3s writes its kubeconfig only once the server is up, usually well
//! after this agent starts. The watcher waits for the file, builds an
//! authenticated API client from it, and then polls the service list,
//! exposing every NodePort through the tracker's listener set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::supervisor::CancelSignal;
use crate::tracker::PortTracker;

/// Cadence of kubeconfig existence checks.
const KUBECONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of service list polls.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-request API timeout.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Watch the cluster for NodePort services until cancelled.
///
/// The kubeconfig wait is unbounded: the cluster may legitimately come up
/// minutes after the agent, and only cancellation ends the wait. API
/// errors before the server has answered once are retried; errors after
/// first contact are fatal.
pub async fn watch_nodeport_services(
    mut cancel: CancelSignal,
    tracker: Arc<PortTracker>,
    kubeconfig_path: PathBuf,
) -> Result<()> {
    if !wait_for_file(&mut cancel, &kubeconfig_path).await {
        return Ok(());
    }

    let kubeconfig = Kubeconfig::load(&kubeconfig_path).await?;
    let client = ApiClient::new(&kubeconfig)?;
    info!(server = %client.server, "watching for NodePort services");

    let mut ticker = interval(SERVICE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut previous: BTreeSet<u16> = BTreeSet::new();
    let mut reached_api = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ports = match client.node_ports().await {
                    Ok(ports) => ports,
                    Err(e) if !reached_api => {
                        // The API server is still booting behind its socket.
                        debug!(error = %e, "api server not answering yet");
                        continue;
                    }
                    Err(e) => return Err(e.context("listing services")),
                };
                reached_api = true;

                for port in ports.difference(&previous) {
                    tracker.expose(*port).await?;
                }
                for port in previous.difference(&ports) {
                    tracker.unexpose(*port).await;
                }
                previous = ports;
            }
            _ = cancel.cancelled() => {
                debug!("stopping service watcher");
                return Ok(());
            }
        }
    }
}

/// Poll until the file exists. Returns false when cancelled first.
async fn wait_for_file(cancel: &mut CancelSignal, path: &Path) -> bool {
    if path.exists() {
        return true;
    }

    info!(path = %path.display(), "waiting for kubeconfig");
    let mut ticker = interval(KUBECONFIG_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if path.exists() {
                    return true;
                }
            }
            _ = cancel.cancelled() => return false,
        }
    }
}

// ============================================================================
// Kubeconfig
// ============================================================================

/// The subset of a kubeconfig this agent understands.
///
/// Field names follow the kubeconfig wire format; unknown fields are
/// ignored so k3s extensions do not break parsing.
#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default, rename = "current-context")]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    server: String,
    #[serde(default, rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Debug, Deserialize)]
struct ContextRef {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct User {
    #[serde(default, rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(default, rename = "client-key-data")]
    client_key_data: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

impl Kubeconfig {
    async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_slice(&raw).context("parsing kubeconfig")
    }

    /// Resolve the current context to its cluster and user entries.
    fn resolve(&self) -> Result<(&Cluster, &User)> {
        let context_name = self
            .current_context
            .as_deref()
            .or_else(|| self.contexts.first().map(|c| c.name.as_str()))
            .ok_or_else(|| anyhow!("kubeconfig has no contexts"))?;

        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| anyhow!("context {context_name} not found in kubeconfig"))?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| anyhow!("cluster {} not found in kubeconfig", context.cluster))?;

        let user = self
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| &u.user)
            .ok_or_else(|| anyhow!("user {} not found in kubeconfig", context.user))?;

        Ok((cluster, user))
    }
}

// ============================================================================
// API client
// ============================================================================

/// Minimal authenticated client for the services endpoint.
struct ApiClient {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl ApiClient {
    fn new(kubeconfig: &Kubeconfig) -> Result<Self> {
        let (cluster, user) = kubeconfig.resolve()?;

        let mut builder = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .use_rustls_tls();

        if let Some(ca) = &cluster.certificate_authority_data {
            let pem = BASE64
                .decode(ca)
                .context("decoding certificate-authority-data")?;
            let cert =
                reqwest::Certificate::from_pem(&pem).context("parsing cluster CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&user.client_certificate_data, &user.client_key_data) {
            let mut pem = BASE64
                .decode(cert)
                .context("decoding client-certificate-data")?;
            pem.extend(BASE64.decode(key).context("decoding client-key-data")?);
            let identity =
                reqwest::Identity::from_pem(&pem).context("parsing client identity")?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            http: builder.build().context("building API client")?,
            server: cluster.server.trim_end_matches('/').to_string(),
            token: user.token.clone(),
        })
    }

    /// All NodePorts currently allocated to NodePort services.
    async fn node_ports(&self) -> Result<BTreeSet<u16>> {
        let url = format!("{}/api/v1/services", self.server);
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("requesting service list")?;
        if !response.status().is_success() {
            anyhow::bail!("service list request failed: {}", response.status());
        }

        let list: ServiceList = response.json().await.context("decoding service list")?;
        Ok(collect_node_ports(&list))
    }
}

#[derive(Debug, Deserialize)]
struct ServiceList {
    #[serde(default)]
    items: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(default, rename = "type")]
    service_type: Option<String>,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct ServicePort {
    #[serde(default, rename = "nodePort")]
    node_port: Option<u16>,
}

fn collect_node_ports(list: &ServiceList) -> BTreeSet<u16> {
    list.items
        .iter()
        .filter(|service| service.spec.service_type.as_deref() == Some("NodePort"))
        .flat_map(|service| service.spec.ports.iter())
        .filter_map(|port| port.node_port)
        .collect()
}
