//! hub-frontend
//!
//! Front-end tier of the engine hub:
//! - [`manager`]: control channels to every shard and the cache of direct
//!   engine connections
//! - [`relay`]: client WebSocket <-> engine connection bridge
//! - [`ws`]: the HTTP / WebSocket routes
//! - [`config`]: TOML file plus command-line flags

pub mod config;
pub mod events;
pub mod manager;
pub mod relay;
pub mod single_flight;
pub mod ws;

pub use config::{Cli, ConfigError, FrontendConfig};
pub use events::{ClosedEvent, ClosedSubscription};
pub use manager::{ControlStatus, EngineManagerClient, WebhookResponse};
pub use relay::{relay, LocalFrame, RelayEnd, RemoteEndpoint};
