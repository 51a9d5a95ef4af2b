//! JSON-RPC 2.0 session over a plain TCP stream, one frame per line.
//!
//! Requests carry an `id` and resolve the matching pending call. Frames with a
//! `method` and no `id` are push callbacks and go out on the signal stream in
//! arrival order. A single task owns the socket and the pending table.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use servdeck_core::session::{
    Credentials, RawCallback, RpcSession, ServerEndpoint, SessionConnector, SessionHandle,
    SessionSignal,
};
use servdeck_core::ConnectionError;

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

type PendingTx = oneshot::Sender<Result<Value, ConnectionError>>;

struct Command {
    method: String,
    params: Vec<Value>,
    response_tx: PendingTx,
}

/// Opens [`JsonRpcSession`]s over TCP.
#[derive(Clone, Debug, Default)]
pub struct JsonRpcConnector;

impl JsonRpcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionConnector for JsonRpcConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<SessionHandle, ConnectionError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ConnectionError::Transport(format!("connect {endpoint}: {e}")))?;
        let _ = stream.set_nodelay(true);
        debug!(%endpoint, "transport open");

        let (session, signals) = JsonRpcSession::start(stream);
        Ok(SessionHandle {
            session: std::sync::Arc::new(session),
            signals,
        })
    }
}

pub struct JsonRpcSession {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    _handler: JoinHandle<()>,
}

impl JsonRpcSession {
    fn start(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handler = tokio::spawn(session_loop(framed, cmd_rx, signal_tx, cancel.clone()));
        (
            Self {
                cmd_tx,
                cancel,
                _handler: handler,
            },
            signal_rx,
        )
    }

    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command {
                method: method.into(),
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| ConnectionError::Transport("session closed".into()))?;

        rx.await
            .map_err(|_| ConnectionError::Transport("connection closed".into()))?
    }
}

#[async_trait]
impl RpcSession for JsonRpcSession {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectionError> {
        let result = self
            .request(
                "Authenticate",
                vec![json!(credentials.login), json!(credentials.password)],
            )
            .await;
        match result {
            Ok(Value::Bool(true)) => Ok(()),
            Ok(other) => Err(ConnectionError::Authentication(format!(
                "unexpected Authenticate result: {other}"
            ))),
            Err(ConnectionError::Rpc { message, .. }) => {
                Err(ConnectionError::Authentication(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe_callbacks(&self, api_version: &str) -> Result<(), ConnectionError> {
        self.request("SetApiVersion", vec![json!(api_version)]).await?;
        self.request("EnableCallbacks", vec![json!(true)]).await?;
        // Script callbacks only exist on scripted modes.
        if let Err(e) = self.call_script("XmlRpc.EnableCallbacks", json!("true")).await {
            debug!(error = %e, "script callbacks not enabled");
        }
        Ok(())
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ConnectionError> {
        self.request(method, params).await
    }

    async fn call_script(&self, method: &str, arg: Value) -> Result<Value, ConnectionError> {
        let arg = match arg {
            Value::String(s) => s,
            other => other.to_string(),
        };
        self.request(
            "TriggerModeScriptEventArray",
            vec![json!(method), json!([arg])],
        )
        .await
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Deserialize)]
struct Incoming {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    error: Option<Fault>,
}

#[derive(Deserialize)]
struct Fault {
    code: i64,
    message: String,
}

async fn session_loop(
    mut framed: Framed<TcpStream, LinesCodec>,
    mut cmd_rx: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if cmd.response_tx.is_closed() {
                    continue;
                }
                let id = next_id;
                next_id += 1;
                let frame = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                if let Err(e) = framed.send(frame.to_string()).await {
                    let _ = cmd.response_tx.send(Err(ConnectionError::Transport(e.to_string())));
                    let _ = signals.send(SessionSignal::Error(e.to_string()));
                    break;
                }
                track(&mut pending, id, cmd.response_tx);
            }
            line = framed.next() => {
                match line {
                    None => {
                        let _ = signals.send(SessionSignal::Closed);
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = signals.send(SessionSignal::Error(e.to_string()));
                        break;
                    }
                    Some(Ok(line)) => handle_frame(&line, &mut pending, &signals),
                }
            }
        }
    }
}

/// Callers that timed out dropped their receiver; their entries would
/// otherwise stay until the server answered, which it may never do.
fn track(pending: &mut HashMap<u64, PendingTx>, id: u64, tx: PendingTx) {
    pending.retain(|_, waiting| !waiting.is_closed());
    pending.insert(id, tx);
}

fn handle_frame(
    line: &str,
    pending: &mut HashMap<u64, PendingTx>,
    signals: &mpsc::UnboundedSender<SessionSignal>,
) {
    let frame: Incoming = match serde_json::from_str(line) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "dropping malformed frame");
            return;
        }
    };

    match (frame.id, frame.method) {
        (Some(id), _) => {
            let Some(tx) = pending.remove(&id) else {
                trace!(id, "response for unknown request");
                return;
            };
            let outcome = match frame.error {
                Some(fault) => Err(ConnectionError::rpc(fault.code, fault.message)),
                None => Ok(frame.result),
            };
            let _ = tx.send(outcome);
        }
        (None, Some(method)) => {
            let params = match frame.params {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            let _ = signals.send(SessionSignal::Callback(RawCallback::new(method, params)));
        }
        (None, None) => trace!("frame without id or method"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers with `respond` for each request.
    async fn fake_server<F>(respond: F) -> (ServerEndpoint, JoinHandle<Framed<TcpStream, LinesCodec>>)
    where
        F: Fn(&str, &Value) -> Value + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            while let Some(Ok(line)) = framed.next().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let method = req["method"].as_str().unwrap_or_default().to_string();
                let mut reply = respond(&method, &req["params"]);
                reply["jsonrpc"] = json!("2.0");
                reply["id"] = req["id"].clone();
                framed.send(reply.to_string()).await.unwrap();
                if method == "TriggerModeScriptEventArray" {
                    break;
                }
            }
            framed
        });
        (
            ServerEndpoint {
                host: "127.0.0.1".into(),
                port,
            },
            handle,
        )
    }

    fn credentials() -> Credentials {
        Credentials {
            login: "SuperAdmin".into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn handshake_then_callback_then_close() {
        let (endpoint, server) = fake_server(|method, params| match method {
            "Authenticate" => {
                assert_eq!(params[0], "SuperAdmin");
                json!({ "result": true })
            }
            _ => json!({ "result": true }),
        })
        .await;

        let mut handle = JsonRpcConnector::new().connect(&endpoint).await.unwrap();
        handle.session.authenticate(&credentials()).await.unwrap();
        handle.session.subscribe_callbacks("2023-04-24").await.unwrap();

        let mut framed = server.await.unwrap();
        framed
            .send(
                json!({
                    "jsonrpc": "2.0",
                    "method": "ManiaPlanet.PlayerConnect",
                    "params": ["abc", false]
                })
                .to_string(),
            )
            .await
            .unwrap();
        drop(framed);

        assert_eq!(
            handle.signals.recv().await,
            Some(SessionSignal::Callback(RawCallback::new(
                "ManiaPlanet.PlayerConnect",
                vec![json!("abc"), json!(false)]
            )))
        );
        assert_eq!(handle.signals.recv().await, Some(SessionSignal::Closed));
    }

    #[tokio::test]
    async fn rejected_credentials_map_to_authentication() {
        let (endpoint, _server) = fake_server(|_, _| {
            json!({ "error": { "code": -1000, "message": "Password incorrect." } })
        })
        .await;

        let handle = JsonRpcConnector::new().connect(&endpoint).await.unwrap();
        let err = handle.session.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Authentication(ref m) if m == "Password incorrect."));
    }

    #[tokio::test]
    async fn faults_surface_as_rpc_errors() {
        let (endpoint, _server) = fake_server(|method, _| match method {
            "GetPlayerInfo" => json!({ "error": { "code": -1000, "message": "Login unknown." } }),
            _ => json!({ "result": null }),
        })
        .await;

        let handle = JsonRpcConnector::new().connect(&endpoint).await.unwrap();
        let err = handle
            .session
            .call("GetPlayerInfo", vec![json!("ghost"), json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Rpc { code: -1000, .. }));
    }

    #[tokio::test]
    async fn connect_refused_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = JsonRpcConnector::new()
            .connect(&ServerEndpoint {
                host: "127.0.0.1".into(),
                port,
            })
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn abandoned_requests_are_pruned() {
        let mut pending = HashMap::new();
        let (gone, gone_rx) = oneshot::channel();
        let (live, mut live_rx) = oneshot::channel();
        track(&mut pending, 1, gone);
        drop(gone_rx);
        track(&mut pending, 2, live);
        assert_eq!(pending.keys().copied().collect::<Vec<_>>(), vec![2]);

        let (tx, _rx) = mpsc::unbounded_channel();
        handle_frame(r#"{"jsonrpc":"2.0","id":1,"result":true}"#, &mut pending, &tx);
        handle_frame(r#"{"jsonrpc":"2.0","id":2,"result":"ok"}"#, &mut pending, &tx);
        assert!(pending.is_empty());
        assert_eq!(live_rx.try_recv().unwrap().unwrap(), json!("ok"));
    }

    #[test]
    fn callback_params_normalize_to_list() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = HashMap::new();
        handle_frame(r#"{"method":"ManiaPlanet.EndMap"}"#, &mut pending, &tx);
        handle_frame(r#"{"method":"ManiaPlanet.BeginMap","params":{"UId":"m"}}"#, &mut pending, &tx);
        handle_frame("not json", &mut pending, &tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionSignal::Callback(RawCallback::new("ManiaPlanet.EndMap", vec![]))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionSignal::Callback(RawCallback::new(
                "ManiaPlanet.BeginMap",
                vec![json!({"UId": "m"})]
            ))
        );
        assert!(rx.try_recv().is_err());
    }
}
