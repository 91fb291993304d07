//! ferry-core — shared data model, chunk planner, wire format and config.
//! All other Ferry crates depend on this one.

pub mod config;
pub mod model;
pub mod plan;
pub mod record;
pub mod wire;

pub use config::FerryConfig;
pub use model::{
    Chunk, ChunkSetMetadata, ChunkStatus, ContentRef, Direction, FileDescriptor, PeerRef,
    SessionStatus, TransferSession,
};
pub use plan::{plan_chunks, PlanError};
pub use record::RecordError;
pub use wire::{Control, FileHeader, WireError};
