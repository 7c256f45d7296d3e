//! hub-control
//!
//! Control plane for the engine hub: one control channel per shard worker,
//! reconnected on loss, and an HTTP API forwarding control operations to
//! the worker owning a user.

pub mod config;
pub mod control_plane;
pub mod roster;
pub mod server;
pub mod types;

pub use control_plane::ControlPlane;
pub use roster::{StaticRoster, UserDirectory};
