pub mod broker;
pub mod registry;
pub mod roster;
pub mod service;
pub mod supervise;

pub use broker::CapabilityBroker;
pub use registry::{spawn_registry, RegistryHandle, RegistrySettings};
pub use roster::{Roster, SweepReport, UpsertOutcome};
pub use service::DirectoryService;
pub use supervise::supervise;
