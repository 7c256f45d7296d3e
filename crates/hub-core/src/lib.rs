//! hub-core
//!
//! Pure types shared by every tier of the engine hub:
//! - user and shard identifiers
//! - the shard router (user -> shard)
//! - backend descriptors and roster records
//! - the structured error type surfaced to callers

pub mod backend;
pub mod error;
pub mod process;
pub mod shard;
pub mod user;

pub use backend::BackendDescriptor;
pub use error::HubError;
pub use process::ProcessId;
pub use shard::{ShardId, ShardRouter};
pub use user::{UserId, UserRecord};
