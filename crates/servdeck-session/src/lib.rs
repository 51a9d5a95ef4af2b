//! Session adapters implementing `servdeck_core::session`.
//!
//! - [`jsonrpc`]: newline-delimited JSON-RPC 2.0 over TCP.
//! - [`mock`]: scripted in-process double for tests.

pub mod jsonrpc;
pub mod mock;

pub use jsonrpc::JsonRpcConnector;
pub use mock::{MockConnector, MockSession};
