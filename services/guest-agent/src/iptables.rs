//! iptables DNAT monitoring.
//!
//! Kubernetes and container networking publish ports by installing DNAT
//! rules in the nat table. The guest kernel accepts those connections
//! without any process listening, so the host's automatic port detection
//! never sees them. This loop scans the nat table on a fixed cadence and
//! keeps a loopback listener open for every DNAT'd TCP port.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::supervisor::CancelSignal;
use crate::tracker::PortTracker;

/// Cadence of nat table scans.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(3);

/// One DNAT rule extracted from `iptables -t nat -S`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DnatRule {
    chain: String,
    protocol: String,
    dport: u16,
    destination: String,
}

/// Scan the nat table until cancelled, mirroring DNAT'd TCP ports into
/// the tracker's listener set.
pub async fn forward_ports(
    mut cancel: CancelSignal,
    tracker: Arc<PortTracker>,
    update_interval: Duration,
) -> Result<()> {
    let mut ticker = interval(update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_secs = update_interval.as_secs(),
        "watching nat table for forwarded ports"
    );

    let mut previous: BTreeSet<u16> = BTreeSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let rules = scan_nat_table().await?;
                let ports: BTreeSet<u16> = rules
                    .iter()
                    .filter(|rule| rule.protocol == "tcp")
                    .map(|rule| rule.dport)
                    .collect();

                for port in ports.difference(&previous) {
                    tracker.expose(*port).await?;
                }
                for port in previous.difference(&ports) {
                    tracker.unexpose(*port).await;
                }
                previous = ports;
            }
            _ = cancel.cancelled() => {
                debug!("stopping nat table watcher");
                return Ok(());
            }
        }
    }
}

/// Run `iptables -t nat -S` and parse its DNAT rules.
async fn scan_nat_table() -> Result<Vec<DnatRule>> {
    let output = Command::new("iptables")
        .args(["-t", "nat", "-S"])
        .output()
        .await
        .context("failed to execute iptables")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("iptables -t nat -S failed: {}", stderr.trim());
    }

    Ok(parse_dnat_rules(&String::from_utf8_lossy(&output.stdout)))
}

/// Extract DNAT rules from `iptables -S` output.
///
/// Rules that do not carry a parseable single-port `--dport` are skipped;
/// port-range DNAT cannot be mirrored by one listener.
fn parse_dnat_rules(output: &str) -> Vec<DnatRule> {
    let mut rules = Vec::new();

    for line in output.lines() {
        let mut chain = None;
        let mut protocol = None;
        let mut dport = None;
        let mut destination = None;
        let mut is_dnat = false;

        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            match token {
                "-A" => chain = tokens.next().map(str::to_string),
                "-p" => protocol = tokens.next().map(str::to_string),
                "--dport" => dport = tokens.next().and_then(|p| p.parse::<u16>().ok()),
                "-j" => is_dnat = tokens.next() == Some("DNAT"),
                "--to-destination" => destination = tokens.next().map(str::to_string),
                _ => {}
            }
        }

        if !is_dnat {
            continue;
        }
        let (Some(chain), Some(protocol), Some(dport), Some(destination)) =
            (chain, protocol, dport, destination)
        else {
            continue;
        };

        rules.push(DnatRule {
            chain,
            protocol,
            dport,
            destination,
        });
    }

    rules
}
