//! cairn-services: the peer-to-peer protocols and the collaborator seams
//! they run on (transport, container runtime, key-value store).

pub mod discovery;
pub mod error;
pub mod memory;
pub mod node;
pub mod observer;
pub mod runtime;
pub mod store;
pub mod swarm;
pub mod task;
pub mod transfer;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use discovery::{Discovery, DiscoverySession};
pub use error::ProtocolError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::Node;
pub use observer::{Observer, ObserverId, ObserverRegistry};
pub use runtime::{ClusterRole, ContainerRuntime, DockerCli, ImageSummary, ServiceSpec};
pub use store::{SqliteStore, Store};
pub use swarm::Swarm;
pub use task::{RunningJobs, TaskProtocol};
pub use transfer::Transfer;
pub use transport::{BoxStream, StreamHandler, Transport, TransportError};
