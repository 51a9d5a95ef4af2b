pub mod client;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod server;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
