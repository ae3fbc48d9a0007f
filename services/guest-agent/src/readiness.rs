//! Engine readiness probing.
//!
//! The container engine boots in parallel with the agent. Before the event
//! monitor attaches, the agent waits for the engine's control socket to
//! appear and for the engine to answer an API call, polling on a fixed
//! cadence under one overall deadline.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::supervisor::CancelSignal;

/// Engine control socket on the guest.
pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Where a probe currently stands. Logged on transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    WaitingForSignal,
    Verifying,
}

/// Probe parameters for one engine wait.
#[derive(Debug, Clone)]
pub struct EngineProbe {
    /// Socket whose existence signals the engine may be up.
    pub socket_path: PathBuf,

    /// Cadence of existence checks and verification retries.
    pub poll_interval: Duration,

    /// Overall wait budget.
    pub deadline: Duration,
}

impl Default for EngineProbe {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DOCKER_SOCKET_PATH),
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(120),
        }
    }
}

impl EngineProbe {
    fn timeout_error(&self) -> AgentError {
        AgentError::EngineWaitTimeout {
            socket: self.socket_path.display().to_string(),
            budget_secs: self.deadline.as_secs(),
        }
    }
}

/// Wait until the engine answers, the deadline passes, or the scope is
/// cancelled.
///
/// Each tick checks that the socket exists, then runs `verify` against the
/// live engine. A failed verification is logged and retried on the next
/// tick; only the deadline or cancellation end the wait unsuccessfully.
///
/// On success the verification's value is handed back, so a callback that
/// builds its engine client per attempt lets the caller keep the one that
/// passed.
pub async fn wait_for_engine<T, F, Fut>(
    mut cancel: CancelSignal,
    probe: &EngineProbe,
    mut verify: F,
) -> Result<T, AgentError>
where
    F: FnMut(CancelSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let deadline = sleep(probe.deadline);
    tokio::pin!(deadline);

    let mut ticker = interval(probe.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut state = ProbeState::WaitingForSignal;
    info!(
        socket = %probe.socket_path.display(),
        budget_secs = probe.deadline.as_secs(),
        "waiting for engine"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !probe.socket_path.exists() {
                    state = ProbeState::WaitingForSignal;
                    debug!(socket = %probe.socket_path.display(), "engine socket not present");
                    continue;
                }

                if state != ProbeState::Verifying {
                    debug!(socket = %probe.socket_path.display(), "engine socket appeared");
                    state = ProbeState::Verifying;
                }

                let attempt = verify(cancel.clone());
                tokio::pin!(attempt);
                tokio::select! {
                    result = &mut attempt => match result {
                        Ok(verified) => {
                            info!("engine is ready");
                            return Ok(verified);
                        }
                        Err(e) => {
                            warn!(error = %e, "engine verification failed");
                        }
                    },
                    _ = &mut deadline => {
                        warn!("engine wait deadline passed during verification");
                        return Err(probe.timeout_error());
                    }
                    _ = cancel.cancelled() => {
                        return Err(AgentError::EngineWaitCancelled);
                    }
                }
            }
            _ = &mut deadline => {
                warn!(
                    socket = %probe.socket_path.display(),
                    "engine did not become ready in time"
                );
                return Err(probe.timeout_error());
            }
            _ = cancel.cancelled() => {
                debug!("engine wait cancelled");
                return Err(AgentError::EngineWaitCancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_defaults_match_engine_boot_profile() {
        let probe = EngineProbe::default();
        assert_eq!(probe.socket_path, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(probe.poll_interval, Duration::from_secs(5));
        assert_eq!(probe.deadline, Duration::from_secs(120));
    }

    #[test]
    fn test_timeout_error_names_socket_and_budget() {
        let probe = EngineProbe::default();
        let message = probe.timeout_error().to_string();
        assert!(message.contains("/var/run/docker.sock"));
        assert!(message.contains("120"));
    }
}
