//! Command line parsing and startup validation.

use std::path::PathBuf;

use clap::Parser;
use nix::unistd::geteuid;

use crate::error::AgentError;

/// Default kubeconfig location written by k3s.
pub const DEFAULT_KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Default host tunnel endpoint for port announcements.
pub const DEFAULT_VTUNNEL_PEER_ADDR: &str = "127.0.0.1:3040";

#[derive(Debug, Parser)]
#[command(name = "guest-agent", version, about = "Forwards guest ports to the host")]
pub struct Args {
    /// Enable debug logging
    #[arg(long, env = "DOCKSIDE_DEBUG")]
    pub debug: bool,

    /// Path to the kubeconfig used for service watching
    #[arg(long, env = "DOCKSIDE_KUBECONFIG", default_value = DEFAULT_KUBECONFIG_PATH)]
    pub kubeconfig: PathBuf,

    /// Disable iptables DNAT scanning
    #[arg(long, env = "DOCKSIDE_NO_IPTABLES")]
    pub no_iptables: bool,

    /// Watch Kubernetes NodePort services
    #[arg(long, env = "DOCKSIDE_KUBERNETES")]
    pub kubernetes: bool,

    /// Track published container ports from the Docker engine
    #[arg(long, env = "DOCKSIDE_DOCKER")]
    pub docker: bool,

    /// Host tunnel address receiving port announcements
    #[arg(long, env = "DOCKSIDE_VTUNNEL_ADDR", default_value = DEFAULT_VTUNNEL_PEER_ADDR)]
    pub vtunnel_addr: String,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub debug: bool,
    pub kubeconfig_path: PathBuf,
    pub enable_iptables: bool,
    pub enable_kubernetes: bool,
    pub enable_docker: bool,
    pub vtunnel_addr: String,
}

impl Args {
    /// Validate the parsed arguments into a runnable configuration.
    pub fn into_config(self) -> Result<AgentConfig, AgentError> {
        let vtunnel_addr = self.vtunnel_addr.trim().to_string();
        if self.docker && vtunnel_addr.is_empty() {
            return Err(AgentError::VtunnelAddrRequired);
        }

        Ok(AgentConfig {
            debug: self.debug,
            kubeconfig_path: self.kubeconfig,
            enable_iptables: !self.no_iptables,
            enable_kubernetes: self.kubernetes,
            enable_docker: self.docker,
            vtunnel_addr,
        })
    }
}

/// The agent drives iptables and binds privileged ports, so anything
/// other than root fails fast.
pub fn require_root() -> Result<(), AgentError> {
    if geteuid().is_root() {
        Ok(())
    } else {
        Err(AgentError::NotRoot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["guest-agent"]).unwrap();
        let config = args.into_config().unwrap();

        assert!(!config.debug);
        assert!(config.enable_iptables);
        assert!(!config.enable_kubernetes);
        assert!(!config.enable_docker);
        assert_eq!(config.kubeconfig_path, PathBuf::from(DEFAULT_KUBECONFIG_PATH));
        assert_eq!(config.vtunnel_addr, DEFAULT_VTUNNEL_PEER_ADDR);
    }

    #[test]
    fn test_no_iptables_flag_disables_scanning() {
        let args = Args::try_parse_from(["guest-agent", "--no-iptables"]).unwrap();
        let config = args.into_config().unwrap();

        assert!(!config.enable_iptables);
    }

    #[test]
    fn test_docker_requires_a_tunnel_address() {
        let args =
            Args::try_parse_from(["guest-agent", "--docker", "--vtunnel-addr", "  "]).unwrap();

        assert!(matches!(
            args.into_config(),
            Err(AgentError::VtunnelAddrRequired)
        ));
    }

    #[test]
    fn test_docker_with_default_tunnel_address_is_valid() {
        let args = Args::try_parse_from(["guest-agent", "--docker"]).unwrap();
        let config = args.into_config().unwrap();

        assert!(config.enable_docker);
        assert_eq!(config.vtunnel_addr, DEFAULT_VTUNNEL_PEER_ADDR);
    }
}
