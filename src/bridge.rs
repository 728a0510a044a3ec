use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use grow_wire::{BridgeFault, Call, CallResult, Envelope, InitParams, Message, SendAck, SendMsg};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GrowError, Result};
use crate::field::{ValidField, bind_addr};

pub const BRIDGE_PATH: &str = "/grow/msg";
pub const SECRET_HEADER: &str = "communication-secret";

/// Whatever sits behind a bridge endpoint.
///
/// `Ok(None)` answers with an empty JSON object.
#[async_trait]
pub trait BridgeHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Message>>;
}

#[derive(Clone)]
struct BridgeState {
    secret: Arc<str>,
    handler: Arc<dyn BridgeHandler>,
}

/// The axum app serving [`BRIDGE_PATH`].
pub fn app(secret: &str, handler: Arc<dyn BridgeHandler>) -> Router {
    Router::new()
        .route(BRIDGE_PATH, post(handle_msg))
        .layer(Extension(BridgeState {
            secret: Arc::from(secret),
            handler,
        }))
}

async fn handle_msg(Extension(state): Extension<BridgeState>, headers: HeaderMap, body: Bytes) -> Response {
    let authorized = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == &*state.secret);
    if !authorized {
        warn!("bridge request with a bad communication secret");
        return fault(&GrowError::Forbidden);
    }

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("unparsable bridge body: {e}");
            return fault(&GrowError::BadRequest(e.to_string()));
        }
    };

    match state.handler.handle(envelope).await {
        Ok(Some(message)) => (StatusCode::OK, Json(message)).into_response(),
        Ok(None) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(err) => fault(&err),
    }
}

fn fault(err: &GrowError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = BridgeFault {
        error: err.kind(),
        message: err.to_string(),
    };
    (status, Json(body)).into_response()
}

/// A bound bridge listener. Dropping it stops the listener.
pub struct BridgeServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl BridgeServer {
    pub async fn bind(url: &str, secret: &str, handler: Arc<dyn BridgeHandler>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr(url)?).await?;
        let addr = listener.local_addr()?;
        let app = app(secret, handler);
        let (shutdown, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stopped.await;
            });
            if let Err(e) = server.await {
                error!("bridge server failed: {e}");
            }
        });
        info!("🌉 bridge listening on http://{addr}{BRIDGE_PATH}");
        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            self.task.abort();
            debug!(addr = %self.addr, "bridge closed");
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening side of the bridge. Fields without external procs never need
/// one, so no port is bound for them.
pub enum Bridge {
    Http(BridgeServer),
    Noop,
}

impl Bridge {
    pub async fn start(field: &ValidField, url: &str, handler: Arc<dyn BridgeHandler>) -> Result<Self> {
        if !field.has_external_procs() {
            debug!("no external procs, bridge disabled");
            return Ok(Bridge::Noop);
        }
        let server = BridgeServer::bind(url, &field.communication_secret, handler).await?;
        Ok(Bridge::Http(server))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Bridge::Http(server) => Some(server.local_addr()),
            Bridge::Noop => None,
        }
    }

    pub fn close(&mut self) {
        if let Bridge::Http(server) = self {
            server.close();
        }
    }
}

/// Sending side of the bridge.
#[derive(Clone)]
pub struct BridgeClient {
    http: reqwest::Client,
    secret: Arc<str>,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient").finish_non_exhaustive()
    }
}

impl BridgeClient {
    pub fn new(secret: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            secret: Arc::from(secret),
        }
    }

    /// Posts one envelope to the proc listening on `url`.
    ///
    /// Transport failures mean the proc is gone and surface as
    /// [`GrowError::Crash`]; anything the remote side rejects keeps its kind.
    pub async fn post(&self, proc: &str, url: &str, envelope: &Envelope) -> Result<Option<Message>> {
        let endpoint = format!("{}{BRIDGE_PATH}", url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .header(SECRET_HEADER, &*self.secret)
            .json(envelope)
            .send()
            .await
            .map_err(|e| transport_error(proc, e))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| transport_error(proc, e))?;

        if !status.is_success() {
            let fault: BridgeFault = serde_json::from_value(body)
                .map_err(|e| GrowError::CallFailed(format!("{status} from {endpoint}: {e}")))?;
            return Err(match fault.error {
                grow_wire::ErrorKind::Forbidden => GrowError::Forbidden,
                grow_wire::ErrorKind::BadRequest => GrowError::BadRequest(fault.message),
                kind => GrowError::Remote(grow_wire::RemoteError::new(kind, fault.message)),
            });
        }

        if body.as_object().is_some_and(|map| map.is_empty()) {
            return Ok(None);
        }
        serde_json::from_value(body)
            .map(Some)
            .map_err(|e| GrowError::CallFailed(format!("unparsable reply from {endpoint}: {e}")))
    }

    pub async fn call(&self, proc: &str, url: &str, call: Call) -> Result<CallResult> {
        match self.post(proc, url, &Envelope::new(Message::Call(call))).await? {
            Some(Message::CallResult(result)) => Ok(result),
            other => Err(unexpected("callResult", other)),
        }
    }

    pub async fn send(&self, proc: &str, url: &str, send: SendMsg) -> Result<Option<SendAck>> {
        match self.post(proc, url, &Envelope::new(Message::Send(send))).await? {
            Some(Message::SendAck(ack)) => Ok(Some(ack)),
            None => Ok(None),
            other => Err(unexpected("sendAck", other)),
        }
    }

    /// Runs the init handshake with an external proc.
    pub async fn init(&self, proc: &str, url: &str, params: InitParams) -> Result<()> {
        match self.post(proc, url, &Envelope::new(Message::Init(params))).await? {
            Some(Message::InitComplete {}) => Ok(()),
            Some(Message::InitFailure(err)) => Err(GrowError::Remote(err)),
            other => Err(unexpected("initComplete", other)),
        }
    }

    /// Control message from a proc to the orchestrator.
    pub async fn control(&self, url: &str, proc_name: &str, message: Message) -> Result<()> {
        self.post(proc_name, url, &Envelope::from_proc(proc_name, message))
            .await
            .map(|_| ())
    }
}

fn transport_error(proc: &str, err: reqwest::Error) -> GrowError {
    if err.is_connect() || err.is_request() || err.is_body() {
        debug!(%proc, "bridge transport failed: {err}");
        GrowError::Crash(proc.to_string())
    } else {
        GrowError::CallFailed(err.to_string())
    }
}

fn unexpected(expected: &str, got: Option<Message>) -> GrowError {
    let got = got.as_ref().map(Message::kind).unwrap_or("nothing");
    GrowError::CallFailed(format!("expected {expected}, got {got}"))
}
