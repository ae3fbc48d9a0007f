//! Error types for the guest agent.

use thiserror::Error;

/// Agent errors raised during bootstrap and by supervised tasks.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent binds privileged ports and reads the nat table.
    #[error("must run as the root user")]
    NotRoot,

    /// Docker monitoring cannot announce ports without a tunnel peer.
    #[error("vtunnel peer address is required when docker monitoring is enabled")]
    VtunnelAddrRequired,

    /// The forwarding interface does not exist on this guest.
    #[error("network interface {name} not found")]
    InterfaceNotFound { name: String },

    /// Interface enumeration failed below us.
    #[error("enumerating addresses of {name}: {source}")]
    AddressEnumeration { name: String, source: nix::Error },

    /// The engine socket never became ready inside the wait budget.
    #[error("engine socket {socket} not ready within {budget_secs}s")]
    EngineWaitTimeout { socket: String, budget_secs: u64 },

    /// The surrounding scope was cancelled while waiting for the engine.
    #[error("cancelled while waiting for the engine socket")]
    EngineWaitCancelled,
}
