use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use grow_wire::{Call, CallResult, ErrorKind, Message, ORCHESTRATOR, RemoteError, SendAck, SendMsg};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, trace, warn};
use uuid::Uuid;

use crate::bridge::BridgeClient;
use crate::descriptor::ServiceDescriptor;
use crate::error::{GrowError, Result};
use crate::field::ValidField;
use crate::logger;
use crate::plant::{CallContext, Plant};
use crate::port::{Packet, Port};
use crate::queue::Queues;
use crate::supervisor::ProcState;

/// Who is calling whom, on behalf of which session and request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub caller: String,
    pub receiver: String,
    pub session_id: String,
    pub request_id: String,
}

impl Route {
    pub fn new(caller: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            receiver: receiver.into(),
            session_id: String::new(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    fn from_call(call: &Call) -> Self {
        Self {
            caller: call.caller.clone(),
            receiver: call.receiver.clone(),
            session_id: call.session_id.clone(),
            request_id: call.request_id.clone(),
        }
    }
}

/// Port traffic the router does not handle itself.
#[derive(Debug)]
pub enum PortEvent {
    /// Lifecycle messages (`ready`, `init`, `restartMe`, ...).
    Control { proc: String, packet: Packet },
    /// The port to `proc` is gone.
    Closed { proc: String, port_id: u64 },
}

#[derive(Clone)]
pub(crate) struct HostedPlant {
    pub plant: Arc<dyn Plant>,
    pub descriptor: ServiceDescriptor,
}

/// Whether the plants of a proc are in place yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hosting {
    Loading,
    Hosted,
    Failed,
}

struct Pending {
    reply: oneshot::Sender<CallResult>,
    port_id: u64,
}

struct RouterInner {
    me: String,
    field: RwLock<Arc<ValidField>>,
    plants: DashMap<String, HostedPlant>,
    ports: DashMap<String, Port>,
    pending: DashMap<String, Pending>,
    gates: DashMap<String, watch::Receiver<ProcState>>,
    hosting: watch::Sender<Hosting>,
    queues: Queues,
    bridge: RwLock<BridgeClient>,
    events: Mutex<Option<UnboundedSender<PortEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Per-proc routing context.
///
/// Owns the hosted plants, the ports to other procs, the pending-call map
/// and the outgoing send queue of exactly one proc. Every handler of that
/// proc gets a clone; nothing here is shared with other procs.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("me", &self.inner.me)
            .field("plants", &self.inner.plants.len())
            .field("ports", &self.inner.ports.len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Router {
    /// Must be called inside a tokio runtime: the queue sweeper and the
    /// send delivery loop are spawned right away.
    pub fn new(me: &str, field: ValidField) -> Self {
        let (queues, deliveries) = Queues::new(me);
        let inner = Arc::new(RouterInner {
            me: me.to_string(),
            bridge: RwLock::new(BridgeClient::new(&field.communication_secret)),
            field: RwLock::new(Arc::new(field)),
            plants: DashMap::new(),
            ports: DashMap::new(),
            pending: DashMap::new(),
            gates: DashMap::new(),
            hosting: watch::Sender::new(Hosting::Loading),
            queues,
            events: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        let sweeper = inner.queues.spawn_sweeper();
        let delivery = tokio::spawn(delivery_loop(Arc::downgrade(&inner), deliveries));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(sweeper);
            tasks.push(delivery);
        }
        Self { inner }
    }

    pub fn me(&self) -> &str {
        &self.inner.me
    }

    pub fn field(&self) -> Arc<ValidField> {
        match self.inner.field.read() {
            Ok(field) => field.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the field this proc routes by. The bridge client follows
    /// the field's secret.
    pub fn set_field(&self, field: ValidField) {
        if self.field().communication_secret != field.communication_secret {
            let mut bridge = match self.inner.bridge.write() {
                Ok(bridge) => bridge,
                Err(poisoned) => poisoned.into_inner(),
            };
            *bridge = BridgeClient::new(&field.communication_secret);
        }
        let mut slot = match self.inner.field.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Arc::new(field);
    }

    pub fn bridge(&self) -> BridgeClient {
        match self.inner.bridge.read() {
            Ok(bridge) => bridge.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn queues(&self) -> &Queues {
        &self.inner.queues
    }

    /// Lifecycle messages and port closures are forwarded here.
    pub fn set_events(&self, events: UnboundedSender<PortEvent>) {
        if let Ok(mut slot) = self.inner.events.lock() {
            *slot = Some(events);
        }
    }

    /// Calls to plants of `proc` wait until the gate reports `Serving`.
    pub fn set_gate(&self, proc: &str, gate: watch::Receiver<ProcState>) {
        self.inner.gates.insert(proc.to_string(), gate);
    }

    /// Calls for plants this proc does not host yet wait while `Loading`.
    pub fn set_hosting(&self, hosting: Hosting) {
        self.inner.hosting.send_replace(hosting);
    }

    pub fn hosting(&self) -> Hosting {
        *self.inner.hosting.borrow()
    }

    pub(crate) fn host(&self, name: &str, plant: HostedPlant) {
        self.inner.plants.insert(name.to_string(), plant);
    }

    pub fn hosts(&self, plant: &str) -> bool {
        self.inner.plants.contains_key(plant)
    }

    fn hosted(&self, plant: &str) -> Option<HostedPlant> {
        self.inner.plants.get(plant).map(|entry| entry.value().clone())
    }

    pub fn port(&self, proc: &str) -> Option<Port> {
        self.inner.ports.get(proc).map(|entry| entry.value().clone())
    }

    /// Takes ownership of `port` as the link to `proc` and starts handling
    /// what arrives on it. A previous port to the same proc is closed.
    pub fn attach(&self, proc: &str, port: Port) -> Result<()> {
        let router = self.clone();
        let link = port.clone();
        let listener = port.on_message(move |packet| router.dispatch(&link, packet))?;

        let port_id = port.id();
        if let Some(old) = self.inner.ports.insert(proc.to_string(), port) {
            old.close();
        }

        let router = Arc::downgrade(&self.inner);
        let peer = proc.to_string();
        let watcher = tokio::spawn(async move {
            let _ = listener.await;
            if let Some(inner) = router.upgrade() {
                Router { inner }.port_closed(&peer, port_id);
            }
        });
        self.track(watcher);
        Ok(())
    }

    /// Closes and forgets the port to `proc`.
    pub fn detach(&self, proc: &str) {
        if let Some((_, port)) = self.inner.ports.remove(proc) {
            port.close();
        }
    }

    fn port_closed(&self, proc: &str, port_id: u64) {
        self.inner
            .ports
            .remove_if(proc, |_, port| port.id() == port_id);
        let failed = self.fail_pending_on(port_id, proc);
        if failed > 0 {
            warn!(me = %self.inner.me, %proc, failed, "port closed with calls in flight");
        }
        self.emit(PortEvent::Closed {
            proc: proc.to_string(),
            port_id,
        });
    }

    fn emit(&self, event: PortEvent) {
        let events = self.inner.events.lock().ok().and_then(|slot| slot.clone());
        match events {
            Some(events) => {
                let _ = events.send(event);
            }
            None => trace!(me = %self.inner.me, "no event listener, dropping {event:?}"),
        }
    }

    fn dispatch(&self, port: &Port, packet: Packet) {
        let Packet { message, ports } = packet;
        match message {
            Message::Call(call) => {
                let router = self.clone();
                let port = port.clone();
                tokio::spawn(async move {
                    let result = router.handle_call(call).await;
                    if let Err(e) = port.post_message(Message::CallResult(result)) {
                        debug!("could not deliver call result: {e}");
                    }
                });
            }
            Message::CallResult(result) => self.resolve(result),
            Message::Send(send) => {
                if let Some(ack) = self.handle_send(send) {
                    if let Err(e) = port.post_message(Message::SendAck(ack)) {
                        debug!("could not deliver send ack: {e}");
                    }
                }
            }
            Message::SendAck(ack) => self.inner.queues.on_ack(&ack),
            message => self.emit(PortEvent::Control {
                proc: port.peer().to_string(),
                packet: Packet { message, ports },
            }),
        }
    }

    /// Resolves the pending call a result belongs to. Results for calls
    /// that are no longer pending are dropped.
    pub fn resolve(&self, result: CallResult) {
        match self.inner.pending.remove(result.call_id()) {
            Some((_, pending)) => {
                let _ = pending.reply.send(result);
            }
            None => trace!(call_id = %result.call_id(), "dropping result for unknown call"),
        }
    }

    /// Fails every call still waiting on the given port with `crash`.
    pub fn fail_pending_on(&self, port_id: u64, proc: &str) -> usize {
        let doomed: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|entry| entry.value().port_id == port_id)
            .map(|entry| entry.key().clone())
            .collect();
        let count = doomed.len();
        for call_id in doomed {
            if let Some((_, pending)) = self.inner.pending.remove(&call_id) {
                let _ = pending.reply.send(CallResult::Error {
                    name: ErrorKind::Crash.to_string(),
                    message: format!("proc `{proc}` crashed"),
                    receiver: self.inner.me.clone(),
                    call_id,
                });
            }
        }
        count
    }

    /// Fails whatever is still waiting on the current port to `proc`.
    pub fn fail_pending_for(&self, proc: &str) -> usize {
        match self.port(proc) {
            Some(port) => self.fail_pending_on(port.id(), proc),
            None => 0,
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    async fn wait_ready(&self, proc: &str) -> Result<()> {
        let Some(mut gate) = self.inner.gates.get(proc).map(|g| g.value().clone()) else {
            return Ok(());
        };
        let state = gate
            .wait_for(|state| matches!(state, ProcState::Serving | ProcState::Terminated))
            .await
            .map_err(|_| GrowError::Crash(proc.to_string()))?;
        match *state {
            ProcState::Serving => Ok(()),
            _ => Err(GrowError::Crash(proc.to_string())),
        }
    }

    /// Url to reach `proc` over the bridge, if it is reached that way.
    /// External procs reach every non-external proc through `main`.
    fn bridge_url(&self, field: &ValidField, proc: &str) -> Option<String> {
        if field.is_external(proc) {
            return field.url_of(proc).map(str::to_string);
        }
        if field.is_external(&self.inner.me) {
            return field.main_url().map(str::to_string);
        }
        None
    }

    /// Invokes `method` on `route.receiver`, wherever it lives.
    ///
    /// Local plants are called directly; plants behind a port get a `call`
    /// message and a pending entry; everything else goes over the bridge.
    pub async fn call(&self, route: Route, method: &str, args: Vec<Value>) -> Result<Value> {
        let field = self.field();
        field.check_contract(&route.receiver, method)?;

        if let Some(hosted) = self.hosted(&route.receiver) {
            return self
                .invoke(hosted.plant, route, method, args)
                .await
                .map_err(GrowError::Remote);
        }

        let proc = field
            .proc_of(&route.receiver)
            .ok_or_else(|| GrowError::ProcNotFound(route.receiver.clone()))?
            .to_string();
        self.wait_ready(&proc).await?;

        let call = Call {
            caller: route.caller,
            receiver: route.receiver,
            method: method.to_string(),
            args,
            session_id: route.session_id,
            request_id: route.request_id,
            call_id: Uuid::new_v4().to_string(),
        };

        if let Some(port) = self.port(&proc) {
            let (reply, result) = oneshot::channel();
            let call_id = call.call_id.clone();
            self.inner.pending.insert(
                call_id.clone(),
                Pending {
                    reply,
                    port_id: port.id(),
                },
            );
            if let Err(e) = port.post_message(Message::Call(call)) {
                self.inner.pending.remove(&call_id);
                return Err(e);
            }
            return match result.await {
                Ok(result) => result.into_result().map_err(GrowError::Remote),
                Err(_) => Err(GrowError::Crash(proc)),
            };
        }

        let url = self
            .bridge_url(&field, &proc)
            .ok_or_else(|| GrowError::Crash(proc.clone()))?;
        let result = self.bridge().call(&proc, &url, call).await?;
        result.into_result().map_err(GrowError::Remote)
    }

    /// Answers a call addressed to a plant of this proc.
    ///
    /// A call that arrives before the plants are in place waits for them.
    /// If loading fails it is answered with `crash`.
    pub async fn handle_call(&self, call: Call) -> CallResult {
        let Some(hosted) = self.hosted_once_loaded(&call.receiver).await else {
            let err = match self.hosting() {
                Hosting::Hosted => GrowError::PlantNotFound(call.receiver.clone()),
                _ => GrowError::Crash(self.inner.me.clone()),
            };
            return CallResult::failure(&call, err.to_remote());
        };
        let route = Route::from_call(&call);
        let answer = self.invoke(hosted.plant, route, &call.method, call.args.clone()).await;
        match answer {
            Ok(value) => CallResult::success(&call, value),
            Err(err) => CallResult::failure(&call, err),
        }
    }

    async fn hosted_once_loaded(&self, plant: &str) -> Option<HostedPlant> {
        if let Some(hosted) = self.hosted(plant) {
            return Some(hosted);
        }
        let mut hosting = self.inner.hosting.subscribe();
        if hosting.wait_for(|state| *state != Hosting::Loading).await.is_err() {
            return None;
        }
        self.hosted(plant)
    }

    /// Answers a call on behalf of whichever proc hosts the receiver.
    pub async fn forward(&self, call: Call) -> CallResult {
        if self.hosts(&call.receiver) {
            return self.handle_call(call).await;
        }
        let route = Route::from_call(&call);
        match self.call(route, &call.method, call.args.clone()).await {
            Ok(value) => CallResult::success(&call, value),
            Err(err) => CallResult::failure(&call, err.to_remote()),
        }
    }

    async fn invoke(
        &self,
        plant: Arc<dyn Plant>,
        route: Route,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, RemoteError> {
        let span = info_span!(
            "call",
            plant = %route.receiver,
            method = %method,
            caller = %route.caller,
            session_id = %route.session_id,
            request_id = %route.request_id,
        );
        let receiver = route.receiver.clone();
        let ctx = CallContext {
            route,
            method: method.to_string(),
            span: span.clone(),
            router: self.clone(),
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(plant.call(ctx, method, args))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let outcome = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(GrowError::from_plant(&err)),
            Err(_) => {
                span.in_scope(|| error!("💥 {receiver}.{method}() panicked"));
                self.on_plant_panic(&receiver);
                Err(RemoteError::new(
                    ErrorKind::Crash,
                    format!("{receiver}.{method}() panicked"),
                ))
            }
        };
        logger::request_event(&receiver, method, latency_ms, outcome.is_ok());
        span.in_scope(|| match &outcome {
            Ok(_) => debug!(latency_ms, "call succeeded"),
            Err(err) => debug!(latency_ms, error = %err, "call failed"),
        });
        outcome
    }

    fn on_plant_panic(&self, plant: &str) {
        let field = self.field();
        let restart = field
            .proc_of(plant)
            .and_then(|proc| field.procs.get(proc))
            .is_some_and(|def| def.restart_on_error);
        if restart {
            self.request_restart();
        }
    }

    /// `$send`: local receivers run their listeners right away, everything
    /// else goes through the reliable queue.
    pub fn send(&self, route: Route, args: Vec<Value>) -> Result<()> {
        let field = self.field();
        let receiver_proc = field
            .proc_of(&route.receiver)
            .map(str::to_string)
            .or_else(|| self.hosts(&route.receiver).then(|| self.inner.me.clone()))
            .ok_or_else(|| GrowError::ProcNotFound(route.receiver.clone()))?;
        let send = SendMsg {
            caller: route.caller,
            receiver: route.receiver,
            receiver_proc,
            args,
            session_id: route.session_id,
            request_id: route.request_id,
            send_id: Uuid::new_v4().to_string(),
        };
        if self.hosts(&send.receiver) {
            self.run_listeners(&send);
        } else {
            self.inner.queues.enqueue(send);
        }
        Ok(())
    }

    /// Hands a delivered send to its listeners and produces the ack.
    /// Sends for plants this proc does not host are not acknowledged.
    pub fn handle_send(&self, send: SendMsg) -> Option<SendAck> {
        if !self.hosts(&send.receiver) {
            error!(me = %self.inner.me, receiver = %send.receiver, "send for a plant this proc does not host");
            return None;
        }
        self.run_listeners(&send);
        Some(send.ack())
    }

    /// Takes over a send from another proc: delivers locally or queues it
    /// towards the receiver's proc, and acknowledges it either way.
    pub fn relay_send(&self, send: SendMsg) -> SendAck {
        let ack = send.ack();
        if self.hosts(&send.receiver) {
            self.run_listeners(&send);
        } else {
            self.inner.queues.enqueue(send);
        }
        ack
    }

    fn run_listeners(&self, send: &SendMsg) {
        let Some(hosted) = self.hosted(&send.receiver) else {
            return;
        };
        let methods: Vec<String> = hosted
            .descriptor
            .listeners_for(&send.args)
            .map(str::to_string)
            .collect();
        if methods.is_empty() {
            debug!(receiver = %send.receiver, "no listener matches send");
        }
        for method in methods {
            let router = self.clone();
            let plant = hosted.plant.clone();
            let route = Route {
                caller: send.caller.clone(),
                receiver: send.receiver.clone(),
                session_id: send.session_id.clone(),
                request_id: send.request_id.clone(),
            };
            let args = send.args.clone();
            tokio::spawn(async move {
                if let Err(err) = router.invoke(plant, route.clone(), &method, args).await {
                    warn!(receiver = %route.receiver, %method, "listener failed: {err}");
                }
            });
        }
    }

    fn deliver(&self, send: SendMsg) {
        if let Some(port) = self.port(&send.receiver_proc) {
            if let Err(e) = port.post_message(Message::Send(send)) {
                debug!("send not delivered, waiting for retry: {e}");
            }
            return;
        }
        let field = self.field();
        let Some(url) = self.bridge_url(&field, &send.receiver_proc) else {
            debug!(proc = %send.receiver_proc, "no route for send, waiting for retry");
            return;
        };
        let router = self.clone();
        tokio::spawn(async move {
            let proc = send.receiver_proc.clone();
            match router.bridge().send(&proc, &url, send).await {
                Ok(Some(ack)) => router.inner.queues.on_ack(&ack),
                Ok(None) => debug!(%proc, "send was not acknowledged"),
                Err(e) => debug!(%proc, "send over bridge failed: {e}"),
            }
        });
    }

    /// Asks whoever supervises this proc for a restart.
    pub fn request_restart(&self) {
        warn!(me = %self.inner.me, "requesting restart");
        if let Some(link) = self.port(ORCHESTRATOR) {
            if let Err(e) = link.post_message(Message::RestartMe {}) {
                warn!("could not request restart: {e}");
            }
            return;
        }
        let field = self.field();
        if let Some(url) = field.main_url().map(str::to_string) {
            let bridge = self.bridge();
            let me = self.inner.me.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.control(&url, &me, Message::RestartMe {}).await {
                    warn!("could not request restart: {e}");
                }
            });
        }
    }

    pub fn proxy(&self, owner: &str, target: &str) -> PlantProxy {
        PlantProxy {
            owner: owner.to_string(),
            target: target.to_string(),
            router: self.clone(),
        }
    }

    pub fn queue_proxy(&self, owner: &str, target: &str) -> QueueProxy {
        QueueProxy {
            owner: owner.to_string(),
            target: target.to_string(),
            router: self.clone(),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }
    }

    /// Stops every task of this router, closes all ports and fails whatever
    /// is still pending.
    pub fn shutdown(&self) {
        let ports: Vec<(String, Port)> = self
            .inner
            .ports
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.inner.ports.clear();
        for (proc, port) in ports {
            port.close();
            self.fail_pending_on(port.id(), &proc);
        }
        self.inner.queues.clear();
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut events) = self.inner.events.lock() {
            events.take();
        }
    }
}

async fn delivery_loop(router: Weak<RouterInner>, mut deliveries: UnboundedReceiver<SendMsg>) {
    while let Some(send) = deliveries.recv().await {
        let Some(inner) = router.upgrade() else {
            break;
        };
        Router { inner }.deliver(send);
    }
}

/// Call-capable handle to another plant, held by the plant it was
/// injected into.
#[derive(Clone)]
pub struct PlantProxy {
    owner: String,
    target: String,
    router: Router,
}

impl std::fmt::Debug for PlantProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlantProxy")
            .field("owner", &self.owner)
            .field("target", &self.target)
            .finish()
    }
}

impl PlantProxy {
    pub fn target(&self) -> &str {
        &self.target
    }

    fn route(&self, ctx: &CallContext) -> Route {
        Route {
            caller: self.owner.clone(),
            receiver: self.target.clone(),
            session_id: ctx.session_id().to_string(),
            request_id: ctx.request_id().to_string(),
        }
    }

    /// Calls `method` within the session and request of `ctx`.
    pub async fn call(&self, ctx: &CallContext, method: &str, args: Vec<Value>) -> Result<Value> {
        self.router.call(self.route(ctx), method, args).await
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T> {
        let value = self.call(ctx, method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn send(&self, ctx: &CallContext, args: Vec<Value>) -> Result<()> {
        self.router.send(self.route(ctx), args)
    }
}

/// Send-only handle whose messages always go through the reliable queue.
#[derive(Clone)]
pub struct QueueProxy {
    owner: String,
    target: String,
    router: Router,
}

impl std::fmt::Debug for QueueProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProxy")
            .field("owner", &self.owner)
            .field("target", &self.target)
            .finish()
    }
}

impl QueueProxy {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn send(&self, ctx: &CallContext, args: Vec<Value>) -> Result<()> {
        let route = Route {
            caller: self.owner.clone(),
            receiver: self.target.clone(),
            session_id: ctx.session_id().to_string(),
            request_id: ctx.request_id().to_string(),
        };
        self.router.send(route, args)
    }
}

/// Orchestrator-side handle to one plant, bound to a session.
#[derive(Clone)]
pub struct PlantHandle {
    target: String,
    session_id: String,
    router: Router,
}

impl std::fmt::Debug for PlantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlantHandle")
            .field("target", &self.target)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl PlantHandle {
    pub(crate) fn new(router: Router, target: &str, session_id: &str) -> Self {
        Self {
            target: target.to_string(),
            session_id: session_id.to_string(),
            router,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn route(&self) -> Route {
        Route::new(ORCHESTRATOR, self.target.clone()).with_session(self.session_id.clone())
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.router.call(self.route(), method, args).await
    }

    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `$send` through the orchestrator's queue.
    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        self.router.send(self.route(), args)
    }
}

/// [`PlantHandle`] reduced to `$send`.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    plant: PlantHandle,
}

impl QueueHandle {
    pub(crate) fn new(plant: PlantHandle) -> Self {
        Self { plant }
    }

    pub fn target(&self) -> &str {
        self.plant.target()
    }

    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        self.plant.send(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::field::{Field, PlantDef};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Plant for Echo {
        async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
            match method {
                "echo" => Ok(Value::Array(args)),
                "session" => Ok(json!(ctx.session_id())),
                "fail" => Err(anyhow::anyhow!("nope")),
                "panic" => panic!("boom"),
                _ => Err(ctx.unknown_method()),
            }
        }
    }

    fn field() -> ValidField {
        Field::new()
            .plant("Echo", PlantDef::in_proc("worker"))
            .validate(&RuntimeConfig::default())
            .unwrap()
    }

    fn hosting(router: &Router) {
        router.host(
            "Echo",
            HostedPlant {
                plant: Arc::new(Echo),
                descriptor: ServiceDescriptor::new(),
            },
        );
        router.set_hosting(Hosting::Hosted);
    }

    #[tokio::test]
    async fn local_calls_skip_the_wire() {
        let router = Router::new("worker", field());
        hosting(&router);
        let value = router
            .call(Route::new("@test", "Echo").with_session("S1"), "session", vec![])
            .await
            .unwrap();
        assert_eq!(value, json!("S1"));
        assert_eq!(router.pending_calls(), 0);
    }

    #[tokio::test]
    async fn plant_errors_keep_names() {
        let router = Router::new("worker", field());
        hosting(&router);

        let err = router.call(Route::new("@test", "Echo"), "fail", vec![]).await.unwrap_err();
        assert_eq!(err.name(), "error");
        let err = router.call(Route::new("@test", "Echo"), "nope", vec![]).await.unwrap_err();
        assert_eq!(err.name(), "notFound");
        let err = router.call(Route::new("@test", "Echo"), "panic", vec![]).await.unwrap_err();
        assert_eq!(err.name(), "crash");
    }

    #[tokio::test]
    async fn unknown_plants_have_no_proc() {
        let router = Router::new("worker", field());
        let err = router.call(Route::new("@test", "Ghost"), "x", vec![]).await.unwrap_err();
        assert!(matches!(err, GrowError::ProcNotFound(_)));
    }

    #[tokio::test]
    async fn calls_cross_ports_and_results_match_by_id() {
        let (near, far) = Port::pair("caller", "worker");
        let caller = Router::new("caller", field());
        let callee = Router::new("worker", field());
        hosting(&callee);
        caller.attach("worker", near).unwrap();
        callee.attach("caller", far).unwrap();

        let (a, b) = tokio::join!(
            caller.call(Route::new("@test", "Echo"), "echo", vec![json!(1)]),
            caller.call(Route::new("@test", "Echo"), "echo", vec![json!(2)]),
        );
        assert_eq!(a.unwrap(), json!([1]));
        assert_eq!(b.unwrap(), json!([2]));
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn results_for_unknown_calls_are_dropped() {
        let router = Router::new("caller", field());
        router.resolve(CallResult::Success {
            result: json!(1),
            receiver: "caller".into(),
            call_id: "never-issued".into(),
        });
        assert_eq!(router.pending_calls(), 0);
    }

    #[tokio::test]
    async fn closing_the_port_fails_calls_in_flight() {
        let (near, far) = Port::pair("caller", "worker");
        let caller = Router::new("caller", field());
        caller.attach("worker", near).unwrap();

        let pending = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call(Route::new("@test", "Echo"), "echo", vec![]).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(caller.pending_calls(), 1);

        far.close();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.name(), "crash");
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn calls_wait_for_plants_still_loading() {
        let (near, far) = Port::pair("caller", "worker");
        let caller = Router::new("caller", field());
        let callee = Router::new("worker", field());
        caller.attach("worker", near).unwrap();
        callee.attach("caller", far).unwrap();

        let early = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call(Route::new("@test", "Echo"), "echo", vec![json!("early")]).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(caller.pending_calls(), 1);

        hosting(&callee);
        assert_eq!(early.await.unwrap().unwrap(), json!(["early"]));
    }

    #[tokio::test]
    async fn calls_to_a_proc_that_failed_to_load_crash() {
        let (near, far) = Port::pair("caller", "worker");
        let caller = Router::new("caller", field());
        let callee = Router::new("worker", field());
        caller.attach("worker", near).unwrap();
        callee.attach("caller", far).unwrap();

        let early = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call(Route::new("@test", "Echo"), "echo", vec![]).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        callee.set_hosting(Hosting::Failed);

        let err = early.await.unwrap().unwrap_err();
        assert_eq!(err.name(), "crash");
    }

    #[tokio::test]
    async fn loaded_procs_answer_not_found_for_strangers() {
        let router = Router::new("worker", field());
        hosting(&router);
        let result = router.handle_call(Call::new("@test", "Ghost", "x", vec![])).await;
        assert_eq!(result.into_result().unwrap_err().name, "notFound");
    }

    #[tokio::test]
    async fn duplicate_results_resolve_a_call_once() {
        let (near, far) = Port::pair("caller", "worker");
        let caller = Router::new("caller", field());
        caller.attach("worker", near).unwrap();
        let (seen, mut calls) = tokio::sync::mpsc::unbounded_channel();
        let _listener = far
            .on_message(move |packet| {
                if let Message::Call(call) = packet.message {
                    let _ = seen.send(call);
                }
            })
            .unwrap();

        let first = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call(Route::new("@test", "Echo"), "echo", vec![]).await }
        });
        let call = calls.recv().await.unwrap();
        far.post_message(Message::CallResult(CallResult::success(&call, json!("first"))))
            .unwrap();
        far.post_message(Message::CallResult(CallResult::success(&call, json!("again"))))
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), json!("first"));

        let second = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call(Route::new("@test", "Echo"), "echo", vec![]).await }
        });
        let next = calls.recv().await.unwrap();
        assert_ne!(next.call_id, call.call_id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(caller.pending_calls(), 1);

        far.post_message(Message::CallResult(CallResult::success(&next, json!("second"))))
            .unwrap();
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(caller.pending_calls(), 0);
    }
}
