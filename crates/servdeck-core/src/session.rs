//! Contract for the lower-level RPC session a manager owns.
//!
//! The wire encoding is the adapter's business. A connector opens one
//! transport and hands back the session together with an ordered signal
//! stream carrying push callbacks and transport lifecycle changes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::ConnectionError;

/// Where a managed server listens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Login used for the authentication step.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A push callback exactly as the session delivered it.
#[derive(Clone, Debug, PartialEq)]
pub struct RawCallback {
    pub method: String,
    pub params: Vec<Value>,
}

impl RawCallback {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Everything the transport pushes, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionSignal {
    Callback(RawCallback),
    Closed,
    Error(String),
}

/// An opened transport: the session plus its ordered signal stream.
pub struct SessionHandle {
    pub session: Arc<dyn RpcSession>,
    pub signals: mpsc::UnboundedReceiver<SessionSignal>,
}

/// Opens transports. One call is one connection attempt.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Transport handshake. Fails with `ConnectionError::Transport`.
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<SessionHandle, ConnectionError>;
}

#[async_trait]
pub trait RpcSession: Send + Sync {
    /// Fails with `ConnectionError::Authentication` when credentials are rejected.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectionError>;

    /// Version negotiation and callback subscription.
    async fn subscribe_callbacks(&self, api_version: &str) -> Result<(), ConnectionError>;

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ConnectionError>;

    /// Invoke a game-mode script method with a single argument.
    async fn call_script(&self, method: &str, arg: Value) -> Result<Value, ConnectionError>;

    /// Close the transport. Must not emit further signals afterwards.
    async fn close(&self);
}
