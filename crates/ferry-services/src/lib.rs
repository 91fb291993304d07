//! ferry-services — stores, registries and the transfer engine.
//! The daemon and the HTTP API compose these; nothing here owns a socket
//! except the outbound runner's per-file connections.

pub mod chunk_store;
pub mod error;
pub mod peer;
pub mod qos;
pub mod scheduler;
pub mod session;
pub mod session_store;
pub mod transfer;

pub use chunk_store::{ChunkStore, StoreError, StoreStats};
pub use error::{ErrorKind, TransferError};
pub use peer::{new_registry, DiscoveredPeer, DiscoverySource, PeerRegistry};
pub use qos::SpeedLimit;
pub use scheduler::{
    ExecutionConstraints, NoConstraints, SchedulerSettings, SystemConstraints, TaskScheduler,
    TransferRunner, WorkItem,
};
pub use session::{SessionError, SessionManager};
pub use session_store::SessionStore;
pub use transfer::{Accepted, InboundHandler, OutboundRunner, SendOptions};
