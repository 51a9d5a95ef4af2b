//! Scripted session double.
//!
//! `MockConnector` counts `connect()` calls and hands out `MockSession`s whose
//! call responses, authentication outcome, and push stream are driven by the
//! test. Responses configured on the connector are copied into every session
//! it opens; responses set on a session only affect that session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use servdeck_core::session::{
    Credentials, RawCallback, RpcSession, ServerEndpoint, SessionConnector, SessionHandle,
    SessionSignal,
};
use servdeck_core::ConnectionError;

type Scripted = VecDeque<Result<Value, ConnectionError>>;

#[derive(Default)]
pub struct MockConnector {
    connects: AtomicUsize,
    connect_failures: Mutex<VecDeque<ConnectionError>>,
    auth_failures: Mutex<VecDeque<ConnectionError>>,
    subscribe_failures: Mutex<VecDeque<ConnectionError>>,
    responses: Mutex<HashMap<String, Scripted>>,
    connect_delay: Mutex<Option<Duration>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transport handshakes attempted so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The next `connect()` fails with `err`. Queued; one per call.
    pub fn fail_next_connect(&self, err: ConnectionError) {
        self.connect_failures.lock().push_back(err);
    }

    /// The next session's `authenticate()` rejects the credentials.
    pub fn reject_next_auth(&self, reason: &str) {
        self.auth_failures
            .lock()
            .push_back(ConnectionError::Authentication(reason.into()));
    }

    pub fn fail_next_subscribe(&self, err: ConnectionError) {
        self.subscribe_failures.lock().push_back(err);
    }

    /// Default response for `method` on every session opened from now on.
    pub fn respond(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .insert(method.into(), VecDeque::from([Ok(value)]));
    }

    /// Hold each handshake for `delay` before completing.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, _endpoint: &ServerEndpoint) -> Result<SessionHandle, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.connect_failures.lock().pop_front() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession {
            responses: Mutex::new(self.responses.lock().clone()),
            auth_outcome: Mutex::new(self.auth_failures.lock().pop_front()),
            subscribe_outcome: Mutex::new(self.subscribe_failures.lock().pop_front()),
            hanging: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            credentials: Mutex::new(None),
            api_version: Mutex::new(None),
            signals: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().push(session.clone());

        Ok(SessionHandle {
            session,
            signals: rx,
        })
    }
}

pub struct MockSession {
    responses: Mutex<HashMap<String, Scripted>>,
    auth_outcome: Mutex<Option<ConnectionError>>,
    subscribe_outcome: Mutex<Option<ConnectionError>>,
    hanging: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    credentials: Mutex<Option<Credentials>>,
    api_version: Mutex<Option<String>>,
    signals: Mutex<Option<mpsc::UnboundedSender<SessionSignal>>>,
    closed: AtomicBool,
}

impl MockSession {
    /// Replace the response for `method` on this session.
    pub fn respond(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .insert(method.into(), VecDeque::from([Ok(value)]));
    }

    /// Answer successive calls to `method` in order; the last answer repeats.
    pub fn respond_seq(&self, method: &str, values: Vec<Value>) {
        self.responses
            .lock()
            .insert(method.into(), values.into_iter().map(Ok).collect());
    }

    pub fn fail(&self, method: &str, err: ConnectionError) {
        self.responses
            .lock()
            .insert(method.into(), VecDeque::from([Err(err)]));
    }

    /// Calls to `method` never complete.
    pub fn hang(&self, method: &str) {
        self.hanging.lock().insert(method.into());
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }

    pub fn authenticated_as(&self) -> Option<String> {
        self.credentials.lock().as_ref().map(|c| c.login.clone())
    }

    pub fn api_version(&self) -> Option<String> {
        self.api_version.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver a push callback. Ignored once the session is closed.
    pub fn push_callback(&self, method: &str, params: Vec<Value>) {
        self.signal(SessionSignal::Callback(RawCallback::new(method, params)));
    }

    /// Simulate the remote end dropping the transport.
    pub fn close_transport(&self) {
        self.signal(SessionSignal::Closed);
    }

    pub fn fail_transport(&self, reason: &str) {
        self.signal(SessionSignal::Error(reason.into()));
    }

    fn signal(&self, signal: SessionSignal) {
        if let Some(tx) = self.signals.lock().as_ref() {
            let _ = tx.send(signal);
        }
    }

    fn next_response(&self, method: &str) -> Result<Value, ConnectionError> {
        let mut responses = self.responses.lock();
        match responses.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(ConnectionError::rpc(-32601, method))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ConnectionError::rpc(-32601, method))),
            None => Err(ConnectionError::rpc(
                -32601,
                format!("no scripted response for {method}"),
            )),
        }
    }
}

#[async_trait]
impl RpcSession for MockSession {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectionError> {
        *self.credentials.lock() = Some(credentials.clone());
        match self.auth_outcome.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn subscribe_callbacks(&self, api_version: &str) -> Result<(), ConnectionError> {
        *self.api_version.lock() = Some(api_version.into());
        match self.subscribe_outcome.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ConnectionError> {
        self.calls.lock().push((method.into(), params));
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("session closed".into()));
        }
        let hang = self.hanging.lock().contains(method);
        if hang {
            std::future::pending::<()>().await;
        }
        self.next_response(method)
    }

    async fn call_script(&self, method: &str, arg: Value) -> Result<Value, ConnectionError> {
        self.call(method, vec![arg]).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.signals.lock().take();
    }
}
