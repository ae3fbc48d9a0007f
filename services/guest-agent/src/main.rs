//! Dockside guest agent.
//!
//! Runs as root inside the guest VM and keeps the host informed of every
//! port that should be forwarded:
//! - Published container ports, straight from the engine's event stream
//! - iptables DNAT targets, by scanning the NAT table
//! - Kubernetes NodePort services, by polling the API server
//!
//! Container ports are announced to the host tunnel endpoint; DNAT and
//! NodePort targets are made reachable by binding loopback listeners the
//! host-side watcher picks up.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockside_guest_agent::config::{self, Args};
use dockside_guest_agent::docker::{self, EventMonitor};
use dockside_guest_agent::forwarder::VtunnelForwarder;
use dockside_guest_agent::readiness::{self, EngineProbe};
use dockside_guest_agent::supervisor::CancelHandle;
use dockside_guest_agent::{
    iptables, kube, netif, AgentError, CancelSignal, PortTracker, TaskGroup,
};

/// Interface whose addresses anchor announced container ports.
const FORWARD_INTERFACE: &str = "eth0";

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match run(args).await {
        Ok(()) => {
            info!("guest agent exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "guest agent failed");
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    config::require_root()?;
    let config = args.into_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        iptables = config.enable_iptables,
        kubernetes = config.enable_kubernetes,
        docker = config.enable_docker,
        "guest agent starting"
    );

    let forwarder = Arc::new(VtunnelForwarder::new(config.vtunnel_addr.clone()));
    let tracker = Arc::new(PortTracker::new(forwarder));

    let mut group = TaskGroup::new();
    spawn_signal_handler(group.cancel_handle());

    if config.enable_docker {
        let tracker = Arc::clone(&tracker);
        group.register("docker", move |cancel| monitor_docker(cancel, tracker));
    }

    if config.enable_iptables {
        let tracker = Arc::clone(&tracker);
        group.register("iptables", move |cancel| {
            iptables::forward_ports(cancel, tracker, iptables::UPDATE_INTERVAL)
        });
    }

    if config.enable_kubernetes {
        let tracker = Arc::clone(&tracker);
        let kubeconfig_path = config.kubeconfig_path.clone();
        group.register("kubernetes", move |cancel| {
            kube::watch_nodeport_services(cancel, tracker, kubeconfig_path)
        });
    }

    group.run().await
}

/// Resolve the anchor addresses, wait for the engine, then follow its
/// events until cancelled.
async fn monitor_docker(cancel: CancelSignal, tracker: Arc<PortTracker>) -> Result<()> {
    let addrs = netif::interface_addrs(FORWARD_INTERFACE)?;
    info!(
        interface = FORWARD_INTERFACE,
        count = addrs.len(),
        "resolved forwarding addresses"
    );
    tracker.set_connect_addrs(addrs).await;

    // The engine client is built inside each verification attempt; a
    // socket that is not there yet stays a retryable condition.
    let probe = EngineProbe::default();
    let wait = readiness::wait_for_engine(cancel.clone(), &probe, |c| {
        docker::connect_and_verify(readiness::DOCKER_SOCKET_PATH, c)
    });
    match wait.await {
        Ok(client) => EventMonitor::new(client, tracker).monitor_ports(cancel).await,
        // Shutdown begun before the engine came up; nothing to retract.
        Err(AgentError::EngineWaitCancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Translate SIGINT and SIGTERM into cooperative cancellation so every
/// loop unwinds and retracts its state before the process exits.
fn spawn_signal_handler(handle: CancelHandle) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        handle.cancel();
    });
}
