use serde::{Deserialize, Serialize};

/// Lifecycle of one `AgentRuntime::run`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Connecting,
    Announced,
    Running,
    Stopping,
    Terminated,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Starting => write!(f, "starting"),
            AgentState::Connecting => write!(f, "connecting"),
            AgentState::Announced => write!(f, "announced"),
            AgentState::Running => write!(f, "running"),
            AgentState::Stopping => write!(f, "stopping"),
            AgentState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `shutdown` event or broadcast, or a termination signal.
    Shutdown,
    /// `restart` event or broadcast. The caller is expected to run again.
    Restart,
    /// A subscription closed under the agent.
    BusLost,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Restart => write!(f, "restart"),
            ExitReason::BusLost => write!(f, "bus_lost"),
        }
    }
}
