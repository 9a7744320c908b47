pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod topics;
pub mod types;

pub use capability::{CapabilityRequest, CapabilityResponse, CapabilityStatus};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{AgentEvent, BroadcastMessage, MessageEnvelope, MessageKind};
pub use paths::Paths;
pub use topics::TopicPattern;
pub use types::{
    Agent, AgentStatus, Announce, DirectoryFilter, Heartbeat, HeartbeatStatus, Task,
    TaskPriority, TaskResult, TaskResultStatus,
};
