pub mod builtin;
pub mod handler;
pub mod heartbeat;
pub mod runtime;
pub mod state;
pub mod stats;

pub use handler::{CapabilityHandler, CapabilityRegistry, HandlerRegistry, TaskContext, TaskHandler};
pub use heartbeat::HeartbeatService;
pub use runtime::{AgentRuntime, AgentSettings};
pub use state::{AgentState, ExitReason};
pub use stats::{AgentStatusReport, StatsHandle, TaskStats};
