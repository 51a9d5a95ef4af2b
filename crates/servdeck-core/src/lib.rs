//! Shared vocabulary for servdeck: ids, domain types, the normalized event
//! set, the error taxonomy, and the traits for the external collaborators
//! (RPC session, key-value cache, notification persistence).

pub mod cache;
pub mod errors;
pub mod events;
pub mod ids;
pub mod map;
pub mod notifications;
pub mod player;
pub mod session;
pub mod state;

pub use errors::{CacheError, ConnectionError, PersistenceError};
pub use events::{EventKind, ServerEvent, WireEvent};
pub use ids::{ListenerId, NotificationId, ServerId, UserId};
pub use map::MapInfo;
pub use player::PlayerInfo;
pub use state::ConnectionState;
