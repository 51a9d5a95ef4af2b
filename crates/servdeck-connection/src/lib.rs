//! # servdeck-connection
//!
//! One [`ConnectionManager`] per managed server, created on demand through the
//! [`ConnectionRegistry`]. A manager owns the RPC session, reconnects with
//! backoff, keeps the active map and player roster, mirrors both into the
//! shared cache and fans normalized events out to listeners.

pub mod config;
pub mod listeners;
pub mod manager;
pub mod mirror;
pub mod normalize;
pub mod registry;
pub mod roster;
pub mod sink;
pub mod supervisor;

pub use config::ManagerConfig;
pub use listeners::{handler, Handler, ListenerGroup, ListenerRegistry, Principal, Subscription};
pub use manager::{ConnectionManager, ManagerStatus};
pub use mirror::{CachedState, CachedStateReader, StateMirror};
pub use registry::ConnectionRegistry;
pub use roster::Roster;
pub use sink::NotificationSink;
pub use supervisor::BackoffPolicy;
