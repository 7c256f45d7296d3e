//! Statically declared service interfaces.
//!
//! Each interface comes as a trait, a skeleton that exports an
//! implementation of the trait as an [`RpcObject`](crate::RpcObject), and
//! a proxy that implements (or mirrors) the trait by calling the peer.
//!
//! | interface                 | exported by | called by |
//! |---------------------------|-------------|-----------|
//! | `ControlService`          | worker      | front end, control plane |
//! | `ConnectionFactoryService`| worker      | front end (relays) |
//! | `ConnectionEndpoint`      | worker      | front end (relays) |
//! | `DelegateService`         | front end   | worker |
//! | `WebhookService`          | worker      | front end |

pub mod connection;
pub mod control;
pub mod engine;
pub mod webhook;

pub use connection::{
    ConnectionEndpoint, ConnectionFactory, ConnectionFactoryService, ConnectionProxy,
    ConnectionSkeleton, DelegateProxy, DelegateService, DelegateSkeleton, FactorySkeleton,
};
pub use control::{ControlProxy, ControlService, ControlSkeleton};
pub use engine::{EngineHandle, READY_PARAMS};
pub use webhook::{WebhookProxy, WebhookRequest, WebhookResult, WebhookService, WebhookSkeleton};
