pub mod backoff;
pub mod bus;
pub mod frame;
pub mod hub;
pub mod memory;
pub mod remote;

pub use backoff::{retry_with_backoff, ReconnectPolicy};
pub use bus::{Bus, BusConnector, BusMessage, Subscription};
pub use memory::MemoryBus;
pub use remote::{RemoteBus, RemoteConnector};
