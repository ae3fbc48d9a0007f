//! Guest-side port forwarding agent.
//!
//! Watches the container engine, the NAT table, and the Kubernetes API
//! for ports that should be reachable from the host, and keeps the host
//! tunnel endpoint informed of every change.

pub mod config;
pub mod docker;
pub mod error;
pub mod forwarder;
pub mod iptables;
pub mod kube;
pub mod netif;
pub mod readiness;
pub mod supervisor;
pub mod tracker;

pub use error::AgentError;
pub use supervisor::{CancelHandle, CancelSignal, TaskGroup};
pub use tracker::PortTracker;
