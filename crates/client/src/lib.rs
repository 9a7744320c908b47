//! Caller-side helpers over the bus: directory queries, capability requests,
//! task fan-out with result correlation, and direct messaging.

pub mod capability;
pub mod directory;
pub mod fanout;
pub mod messenger;

pub use capability::CapabilityClient;
pub use directory::DirectoryClient;
pub use fanout::{ResultWatcher, TaskPublisher};
pub use messenger::Messenger;
