use std::collections::{BTreeMap, HashMap};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use grow_wire::{Envelope, InitParams, Message, ORCHESTRATOR};
use strum_macros::Display;
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bridge::{Bridge, BridgeHandler};
use crate::config::{ENV_FIELD, ENV_PROC_NAME, RuntimeConfig};
use crate::error::{GrowError, Result};
use crate::field::{ProcKind, ValidField};
use crate::plant::Catalog;
use crate::port::Port;
use crate::proc::{run_proc, spawn_worker};
use crate::router::{Hosting, PortEvent, Router};

const KILL_NOTICE_TIMEOUT: Duration = Duration::from_millis(300);

/// Lifecycle of one proc as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum ProcState {
    Spawning,
    Running,
    Ready,
    Serving,
    Crashed,
    Restarting,
    Terminated,
}

enum Instance {
    Task(JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
    Process(oneshot::Sender<()>),
}

struct ProcSlot {
    kind: ProcKind,
    restart_on_error: bool,
    generation: u64,
    state: watch::Sender<ProcState>,
    instance: Option<Instance>,
    link_id: Option<u64>,
    /// Peer ports handed over with the next `init`.
    ports: Vec<(String, Port)>,
    startup: Option<oneshot::Sender<Result<()>>>,
}

impl ProcSlot {
    fn state(&self) -> ProcState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ProcState) {
        self.state.send_replace(state);
    }

    fn finish_startup(&mut self, outcome: Result<()>) -> bool {
        match self.startup.take() {
            Some(startup) => {
                let _ = startup.send(outcome);
                true
            }
            None => false,
        }
    }
}

enum SupervisorEvent {
    Port(PortEvent),
    Ready { proc: String },
    RestartRequested { proc: String },
    Initialized { proc: String, generation: u64, outcome: Result<()> },
    Exited { proc: String, generation: u64, status: Option<ExitStatus> },
}

struct SupervisorInner {
    field: Arc<ValidField>,
    catalog: Catalog,
    config: RuntimeConfig,
    router: Router,
    procs: Mutex<BTreeMap<String, ProcSlot>>,
    events: UnboundedSender<SupervisorEvent>,
    bridge: Mutex<Bridge>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    killed: AtomicBool,
}

/// Spawns every proc of a field, runs the init handshake with each of them
/// and restarts the ones that crash.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Starts the whole field and returns once every proc is serving.
    ///
    /// A proc that fails to start fails the whole field: everything already
    /// spawned is killed again before the error is returned.
    pub async fn start(field: ValidField, catalog: Catalog, config: RuntimeConfig) -> Result<Self> {
        let router = Router::new(ORCHESTRATOR, field.clone());
        // the orchestrator hosts no plants of its own
        router.set_hosting(Hosting::Hosted);
        let (port_events, port_inbox) = mpsc::unbounded_channel();
        router.set_events(port_events);
        let (events, inbox) = mpsc::unbounded_channel();

        let mut procs = BTreeMap::new();
        let mut waiters = Vec::new();
        for proc in field.active_procs() {
            let Some(kind) = field.kind_of(proc) else {
                continue;
            };
            let (state, gate) = watch::channel(ProcState::Spawning);
            router.set_gate(proc, gate);
            let (startup, started) = oneshot::channel();
            waiters.push((proc.to_string(), started));
            procs.insert(
                proc.to_string(),
                ProcSlot {
                    kind,
                    restart_on_error: field.procs.get(proc).is_some_and(|def| def.restart_on_error),
                    generation: 0,
                    state,
                    instance: None,
                    link_id: None,
                    ports: Vec::new(),
                    startup: Some(startup),
                },
            );
        }

        let supervisor = Supervisor {
            inner: Arc::new(SupervisorInner {
                field: Arc::new(field),
                catalog,
                config,
                router,
                procs: Mutex::new(procs),
                events,
                bridge: Mutex::new(Bridge::Noop),
                tasks: Mutex::new(Vec::new()),
                killed: AtomicBool::new(false),
            }),
        };

        let event_loop = tokio::spawn(event_loop(
            Arc::downgrade(&supervisor.inner),
            port_inbox,
            inbox,
        ));
        supervisor.track(event_loop);

        if let Err(e) = supervisor.launch().await {
            supervisor.kill().await;
            return Err(e);
        }

        for (proc, started) in waiters {
            let outcome = match started.await {
                Ok(outcome) => outcome,
                Err(_) => Err(GrowError::Crash(proc.clone())),
            };
            if let Err(e) = outcome {
                error!(%proc, "proc failed to start: {e}");
                supervisor.kill().await;
                return Err(e);
            }
        }

        if supervisor.inner.config.handle_signals {
            let weak = Arc::downgrade(&supervisor.inner);
            let signals = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if let Some(inner) = weak.upgrade() {
                        info!("ctrl-c received");
                        Supervisor { inner }.kill().await;
                    }
                }
            });
            supervisor.track(signals);
        }

        info!("🌳 field is serving");
        Ok(supervisor)
    }

    async fn launch(&self) -> Result<()> {
        let field = &self.inner.field;
        if let Some(url) = field.main_url() {
            let handler = Arc::new(OrchestratorBridge {
                router: self.inner.router.clone(),
                events: self.inner.events.clone(),
            });
            let bridge = Bridge::start(field, url, handler).await?;
            *lock(&self.inner.bridge) = bridge;
        }

        let channel_procs = field.channel_procs();
        let mut mesh = open_mesh(&channel_procs);
        for proc in &channel_procs {
            let ports = mesh.remove(proc).unwrap_or_default();
            self.spawn_channel_proc(proc, ports)?;
        }
        for proc in field.active_procs() {
            if field.is_external(proc) {
                self.spawn_external(proc)?;
            }
        }
        Ok(())
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn field(&self) -> &ValidField {
        &self.inner.field
    }

    pub fn proc_state(&self, proc: &str) -> Option<ProcState> {
        self.procs().get(proc).map(ProcSlot::state)
    }

    /// Resolves once `proc` is serving again, or fails if it terminated.
    pub async fn wait_serving(&self, proc: &str) -> Result<()> {
        let mut state = self
            .procs()
            .get(proc)
            .map(|slot| slot.state.subscribe())
            .ok_or_else(|| GrowError::ProcNotFound(proc.to_string()))?;
        let reached = state
            .wait_for(|s| matches!(s, ProcState::Serving | ProcState::Terminated))
            .await
            .map_err(|_| GrowError::Crash(proc.to_string()))?;
        match *reached {
            ProcState::Serving => Ok(()),
            _ => Err(GrowError::Crash(proc.to_string())),
        }
    }

    fn procs(&self) -> MutexGuard<'_, BTreeMap<String, ProcSlot>> {
        lock(&self.inner.procs)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    fn init_params(&self, proc: &str, port_names: Vec<String>) -> Result<InitParams> {
        let field = &self.inner.field;
        Ok(InitParams {
            field: serde_json::to_value(field.transferable())?,
            proc: proc.to_string(),
            port_names,
            config: field.config_for(proc),
        })
    }

    // ---- spawning ----------------------------------------------------------

    fn spawn_channel_proc(&self, proc: &str, ports: Vec<(String, Port)>) -> Result<()> {
        let (ours, theirs) = Port::pair(ORCHESTRATOR, proc);
        let link_id = ours.id();
        self.inner.router.attach(proc, ours)?;

        let mut procs = self.procs();
        let slot = procs
            .get_mut(proc)
            .ok_or_else(|| GrowError::ProcNotFound(proc.to_string()))?;
        let name = proc.to_string();
        let catalog = self.inner.catalog.clone();
        let instance = match slot.kind {
            ProcKind::Main => Instance::Task(tokio::spawn(async move {
                if let Err(e) = run_proc(name.clone(), catalog, theirs).await {
                    error!(proc = %name, "main proc stopped: {e}");
                }
            })),
            _ => Instance::Thread(spawn_worker(name, catalog, theirs)?),
        };
        slot.generation += 1;
        slot.link_id = Some(link_id);
        slot.ports = ports;
        slot.instance = Some(instance);
        slot.set_state(ProcState::Running);
        debug!(%proc, generation = slot.generation, "🌱 proc spawned");
        Ok(())
    }

    fn spawn_external(&self, proc: &str) -> Result<()> {
        let field = &self.inner.field;
        let def = field
            .procs
            .get(proc)
            .ok_or_else(|| GrowError::ProcNotFound(proc.to_string()))?;
        let Some((program, args)) = def.cmd.as_deref().and_then(|cmd| cmd.split_first()) else {
            return Err(GrowError::Validation(format!("proc `{proc}` has no command")));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&def.cwd)
            .env(ENV_FIELD, serde_json::to_string(&field.transferable())?)
            .env(ENV_PROC_NAME, proc)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let pid = child.id();

        let mut procs = self.procs();
        let slot = procs
            .get_mut(proc)
            .ok_or_else(|| GrowError::ProcNotFound(proc.to_string()))?;
        slot.generation += 1;
        let generation = slot.generation;

        let (kill, killed) = oneshot::channel::<()>();
        let events = self.inner.events.clone();
        let name = proc.to_string();
        tokio::spawn(
            async move {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = killed => None,
                };
                let status = match exited {
                    Some(status) => status,
                    None => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let status = match status {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!("could not wait for proc: {e}");
                        None
                    }
                };
                let _ = events.send(SupervisorEvent::Exited {
                    proc: name,
                    generation,
                    status,
                });
            }
            .instrument(info_span!("external", proc = %proc, ?pid)),
        );

        slot.instance = Some(Instance::Process(kill));
        slot.set_state(ProcState::Running);
        debug!(%proc, ?pid, generation, "🌱 external proc spawned");
        Ok(())
    }

    // ---- lifecycle events --------------------------------------------------

    fn on_event(&self, event: SupervisorEvent) {
        if self.is_killed() {
            return;
        }
        match event {
            SupervisorEvent::Port(PortEvent::Control { proc, packet }) => match packet.message {
                Message::Ready {} => self.on_ready(&proc),
                Message::InitComplete {} => self.on_initialized(&proc, Ok(())),
                Message::InitFailure(err) => self.on_initialized(&proc, Err(GrowError::Remote(err))),
                Message::RestartMe {} => self.on_crash(&proc, "restart requested"),
                other => debug!(%proc, "ignoring {} from proc", other.kind()),
            },
            SupervisorEvent::Port(PortEvent::Closed { proc, port_id }) => {
                let current = self.procs().get(&proc).and_then(|slot| slot.link_id);
                if current == Some(port_id) {
                    self.on_crash(&proc, "link closed");
                }
            }
            SupervisorEvent::Ready { proc } => self.on_ready(&proc),
            SupervisorEvent::RestartRequested { proc } => self.on_crash(&proc, "restart requested"),
            SupervisorEvent::Initialized {
                proc,
                generation,
                outcome,
            } => {
                if self.is_current(&proc, generation) {
                    self.on_initialized(&proc, outcome);
                }
            }
            SupervisorEvent::Exited {
                proc,
                generation,
                status,
            } => {
                if self.is_current(&proc, generation) {
                    self.on_exit(&proc, status);
                }
            }
        }
    }

    fn is_current(&self, proc: &str, generation: u64) -> bool {
        self.procs()
            .get(proc)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn on_ready(&self, proc: &str) {
        let (kind, generation, ports) = {
            let mut procs = self.procs();
            let Some(slot) = procs.get_mut(proc) else {
                warn!(%proc, "ready from a proc outside the field");
                return;
            };
            slot.set_state(ProcState::Ready);
            (slot.kind, slot.generation, std::mem::take(&mut slot.ports))
        };
        debug!(%proc, "proc ready, sending init");

        let port_names = ports.iter().map(|(name, _)| name.clone()).collect();
        let params = match self.init_params(proc, port_names) {
            Ok(params) => params,
            Err(e) => {
                self.on_initialized(proc, Err(e));
                return;
            }
        };

        if kind != ProcKind::External {
            let posted = match self.inner.router.port(proc) {
                Some(link) => link.post_with_ports(Message::Init(params), ports),
                None => Err(GrowError::PortClosed(proc.to_string())),
            };
            if let Err(e) = posted {
                self.on_initialized(proc, Err(e));
            }
            return;
        }

        let Some(url) = self.inner.field.url_of(proc).map(str::to_string) else {
            return;
        };
        let bridge = self.inner.router.bridge();
        let events = self.inner.events.clone();
        let name = proc.to_string();
        tokio::spawn(async move {
            let outcome = bridge.init(&name, &url, params).await;
            let _ = events.send(SupervisorEvent::Initialized {
                proc: name,
                generation,
                outcome,
            });
        });
    }

    fn on_initialized(&self, proc: &str, outcome: Result<()>) {
        let mut procs = self.procs();
        let Some(slot) = procs.get_mut(proc) else {
            return;
        };
        match outcome {
            Ok(()) => {
                slot.set_state(ProcState::Serving);
                if slot.finish_startup(Ok(())) {
                    info!(%proc, "🌿 proc serving");
                } else {
                    info!(%proc, generation = slot.generation, "♻️ proc restarted");
                }
            }
            Err(e) => {
                error!(%proc, "init failed: {e}");
                if !slot.finish_startup(Err(e)) {
                    slot.set_state(ProcState::Terminated);
                }
            }
        }
    }

    fn on_exit(&self, proc: &str, status: Option<ExitStatus>) {
        let clean = status.is_some_and(is_clean_exit);
        {
            let mut procs = self.procs();
            let Some(slot) = procs.get_mut(proc) else {
                return;
            };
            if slot.finish_startup(Err(GrowError::Crash(proc.to_string()))) {
                error!(%proc, ?status, "proc exited during startup");
                return;
            }
            if clean || !slot.restart_on_error {
                info!(%proc, ?status, "proc exited");
                slot.set_state(ProcState::Terminated);
                return;
            }
        }
        self.on_crash(proc, "exited with an error");
    }

    /// Marks `proc` crashed, fails what waits on it and schedules a restart
    /// after the backoff.
    fn on_crash(&self, proc: &str, reason: &str) {
        {
            let mut procs = self.procs();
            let Some(slot) = procs.get_mut(proc) else {
                return;
            };
            if slot.finish_startup(Err(GrowError::Crash(proc.to_string()))) {
                error!(%proc, reason, "proc crashed during startup");
                return;
            }
            if matches!(
                slot.state(),
                ProcState::Crashed | ProcState::Restarting | ProcState::Terminated
            ) {
                return;
            }
            slot.set_state(ProcState::Crashed);
        }
        warn!(%proc, reason, "💥 proc crashed");
        let failed = self.inner.router.fail_pending_for(proc);
        if failed > 0 {
            debug!(%proc, failed, "failed calls in flight");
        }

        let weak = Arc::downgrade(&self.inner);
        let backoff = self.inner.config.restart_backoff;
        let name = proc.to_string();
        let restart = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(inner) = weak.upgrade() {
                let supervisor = Supervisor { inner };
                if let Err(e) = supervisor.restart(&name) {
                    error!(proc = %name, "restart failed: {e}");
                    if let Some(slot) = supervisor.procs().get(&name) {
                        slot.set_state(ProcState::Terminated);
                    }
                }
            }
        });
        self.track(restart);
    }

    /// Replaces `proc` with a fresh instance and hands every other port-linked
    /// proc a new port to it.
    fn restart(&self, proc: &str) -> Result<()> {
        if self.is_killed() {
            return Ok(());
        }
        let (kind, old) = {
            let mut procs = self.procs();
            let slot = procs
                .get_mut(proc)
                .ok_or_else(|| GrowError::ProcNotFound(proc.to_string()))?;
            slot.set_state(ProcState::Restarting);
            slot.link_id = None;
            (slot.kind, slot.instance.take())
        };
        info!(%proc, "♻️ restarting proc");

        if let Some(link) = self.inner.router.port(proc) {
            let _ = link.post_message(Message::Kill {});
        }
        self.inner.router.detach(proc);
        stop_instance(old);

        let others: Vec<String> = {
            let procs = self.procs();
            self.inner
                .field
                .channel_procs()
                .into_iter()
                .filter(|other| other != proc)
                .filter(|other| {
                    procs
                        .get(other)
                        .is_some_and(|slot| slot.state() != ProcState::Terminated)
                })
                .collect()
        };

        let mut handed_over = Vec::new();
        if kind == ProcKind::External {
            self.spawn_external(proc)?;
            handed_over.extend(others.into_iter().map(|other| (other, None)));
        } else {
            let mut ports = Vec::new();
            for other in others {
                let (mine, theirs) = Port::pair(proc, &other);
                ports.push((other.clone(), mine));
                handed_over.push((other, Some(theirs)));
            }
            self.spawn_channel_proc(proc, ports)?;
        }

        for (other, port) in handed_over {
            let Some(link) = self.inner.router.port(&other) else {
                continue;
            };
            let ports: Vec<(String, Port)> = port.map(|p| (proc.to_string(), p)).into_iter().collect();
            let params = self.init_params(&other, ports.iter().map(|(n, _)| n.clone()).collect())?;
            if let Err(e) = link.post_with_ports(Message::Reinit(params), ports) {
                warn!(proc = %other, "could not reinit: {e}");
            }
        }
        Ok(())
    }

    // ---- shutdown ----------------------------------------------------------

    /// Stops every proc and the orchestrator's own bridge. Calling it again
    /// does nothing.
    pub async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 killing field");

        let externals: Vec<(String, String)> = {
            let procs = self.procs();
            procs
                .iter()
                .filter(|(_, slot)| slot.kind == ProcKind::External && slot.instance.is_some())
                .filter_map(|(name, _)| {
                    self.inner
                        .field
                        .url_of(name)
                        .map(|url| (name.clone(), url.to_string()))
                })
                .collect()
        };
        let bridge = self.inner.router.bridge();
        let kill = Envelope::new(Message::Kill {});
        for (proc, url) in externals {
            let notice = bridge.post(&proc, &url, &kill);
            match tokio::time::timeout(KILL_NOTICE_TIMEOUT, notice).await {
                Ok(Ok(_)) => debug!(%proc, "kill delivered"),
                Ok(Err(e)) => debug!(%proc, "kill not delivered: {e}"),
                Err(_) => debug!(%proc, "kill notice timed out"),
            }
        }

        self.inner.stop();
    }
}

impl SupervisorInner {
    fn stop(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let instances: Vec<(String, Option<Instance>)> = {
            let mut procs = lock(&self.procs);
            procs
                .iter_mut()
                .map(|(name, slot)| {
                    slot.set_state(ProcState::Terminated);
                    slot.finish_startup(Err(GrowError::Crash(name.clone())));
                    (name.clone(), slot.instance.take())
                })
                .collect()
        };
        for (proc, instance) in instances {
            if let Some(link) = self.router.port(&proc) {
                let _ = link.post_message(Message::Kill {});
            }
            stop_instance(instance);
        }
        self.router.shutdown();
        lock(&self.bridge).close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

/// Tasks and threads wind down on their own once their link is closed.
fn stop_instance(instance: Option<Instance>) {
    match instance {
        Some(Instance::Process(kill)) => {
            let _ = kill.send(());
        }
        Some(Instance::Thread(thread)) => drop(thread),
        Some(Instance::Task(task)) => drop(task),
        None => {}
    }
}

#[cfg(unix)]
fn is_clean_exit(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.success() || status.signal() == Some(15)
}

#[cfg(not(unix))]
fn is_clean_exit(status: ExitStatus) -> bool {
    status.success()
}

/// One port pair between every two port-linked procs.
fn open_mesh(procs: &[String]) -> HashMap<String, Vec<(String, Port)>> {
    let mut mesh: HashMap<String, Vec<(String, Port)>> = HashMap::new();
    for (i, a) in procs.iter().enumerate() {
        for b in &procs[i + 1..] {
            let (to_b, to_a) = Port::pair(a, b);
            mesh.entry(a.clone()).or_default().push((b.clone(), to_b));
            mesh.entry(b.clone()).or_default().push((a.clone(), to_a));
        }
    }
    mesh
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn event_loop(
    supervisor: Weak<SupervisorInner>,
    mut ports: UnboundedReceiver<PortEvent>,
    mut events: UnboundedReceiver<SupervisorEvent>,
) {
    loop {
        let event = tokio::select! {
            Some(event) = ports.recv() => SupervisorEvent::Port(event),
            Some(event) = events.recv() => event,
            else => break,
        };
        let Some(inner) = supervisor.upgrade() else {
            break;
        };
        Supervisor { inner }.on_event(event);
    }
}

/// What the orchestrator answers on its bridge: lifecycle messages from
/// external procs, and calls or sends they route through `main`.
struct OrchestratorBridge {
    router: Router,
    events: UnboundedSender<SupervisorEvent>,
}

#[async_trait]
impl BridgeHandler for OrchestratorBridge {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Message>> {
        let field = self.router.field();
        let from_field = |proc: Option<String>| {
            proc.filter(|p| field.is_external(p))
                .ok_or_else(|| GrowError::BadRequest("lifecycle message without a known procName".into()))
        };
        match envelope.message {
            Message::Ready {} => {
                let proc = from_field(envelope.proc_name)?;
                let _ = self.events.send(SupervisorEvent::Ready { proc });
                Ok(None)
            }
            Message::RestartMe {} => {
                let proc = from_field(envelope.proc_name)?;
                let _ = self.events.send(SupervisorEvent::RestartRequested { proc });
                Ok(None)
            }
            Message::Call(call) => Ok(Some(Message::CallResult(self.router.forward(call).await))),
            Message::Send(send) => Ok(Some(Message::SendAck(self.router.relay_send(send)))),
            Message::SendAck(ack) => {
                self.router.queues().on_ack(&ack);
                Ok(None)
            }
            other => Err(GrowError::BadRequest(format!(
                "`{}` is not accepted by the orchestrator",
                other.kind()
            ))),
        }
    }
}
