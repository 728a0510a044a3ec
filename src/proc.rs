use std::thread;

use grow_wire::{InitParams, Message, ORCHESTRATOR};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{GrowError, Result};
use crate::field::ValidField;
use crate::host::PlantHost;
use crate::plant::Catalog;
use crate::port::Port;
use crate::router::{PortEvent, Router};

/// Runs one port-linked proc until it is killed or its link to the
/// orchestrator goes away.
///
/// Announces `ready` on the link, loads its plants on `init`, and swaps in
/// fresh peer ports on `reinit`. Calls, sends and their answers are handled
/// by the router as they arrive, independently of this loop.
pub async fn run_proc(name: String, catalog: Catalog, link: Port) -> Result<()> {
    let span = info_span!("proc", name = %name);
    async move {
        let router = Router::new(&name, ValidField::default());
        let (events, mut inbox) = mpsc::unbounded_channel();
        router.set_events(events);
        router.attach(ORCHESTRATOR, link.clone())?;
        link.post_message(Message::Ready {})?;
        debug!("ready");

        let host = PlantHost::new(&name, catalog);
        while let Some(event) = inbox.recv().await {
            match event {
                PortEvent::Control { packet, .. } => match packet.message {
                    Message::Init(params) => {
                        let reply = match init(&router, &host, params, packet.ports).await {
                            Ok(()) => Message::InitComplete {},
                            Err(e) => {
                                error!("init failed: {e}");
                                Message::InitFailure(e.to_remote())
                            }
                        };
                        link.post_message(reply)?;
                    }
                    Message::Reinit(params) => {
                        if let Err(e) = reinit(&router, params, packet.ports) {
                            warn!("reinit failed: {e}");
                        }
                    }
                    Message::Kill {} => {
                        info!("killed");
                        break;
                    }
                    other => debug!("ignoring {} on the link", other.kind()),
                },
                PortEvent::Closed { proc, .. } if proc == ORCHESTRATOR => {
                    debug!("orchestrator link closed");
                    break;
                }
                PortEvent::Closed { proc, .. } => debug!(peer = %proc, "peer port closed"),
            }
        }

        router.shutdown();
        Ok(())
    }
    .instrument(span)
    .await
}

async fn init(
    router: &Router,
    host: &PlantHost,
    params: InitParams,
    ports: Vec<(String, Port)>,
) -> Result<()> {
    let field: ValidField = serde_json::from_value(params.field)?;
    router.set_field(field.clone());
    for (peer, port) in ports {
        router.attach(&peer, port)?;
    }
    host.load(router, &field, &params.config).await?;
    Ok(())
}

fn reinit(router: &Router, params: InitParams, ports: Vec<(String, Port)>) -> Result<()> {
    let field: ValidField = serde_json::from_value(params.field)?;
    router.set_field(field);
    for (peer, port) in ports {
        debug!(%peer, "replacing port");
        router.attach(&peer, port)?;
    }
    Ok(())
}

/// Starts a worker proc on its own thread with a single-threaded runtime.
pub fn spawn_worker(name: String, catalog: Catalog, link: Port) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("grow-{name}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(proc = %name, "could not start worker runtime: {e}");
                    return;
                }
            };
            if let Err(e) = runtime.block_on(run_proc(name.clone(), catalog, link)) {
                error!(proc = %name, "worker stopped: {e}");
            }
        })
        .map_err(GrowError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::field::{Field, PlantDef};
    use crate::router::Route;
    use crate::plant::{CallContext, Plant};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Ping;

    #[async_trait]
    impl Plant for Ping {
        async fn call(&self, _ctx: CallContext, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(json!("pong"))
        }
    }

    #[tokio::test]
    async fn handshake_then_calls_over_the_link() {
        let field = Field::new()
            .plant("Ping", PlantDef::in_proc("w"))
            .validate(&RuntimeConfig::default())
            .unwrap();
        let catalog = Catalog::new().register_plant::<Ping>("Ping");

        let (ours, theirs) = Port::pair(ORCHESTRATOR, "w");
        let orchestrator = Router::new(ORCHESTRATOR, field.clone());
        let (events, mut inbox) = mpsc::unbounded_channel();
        orchestrator.set_events(events);
        orchestrator.attach("w", ours.clone()).unwrap();

        let worker = spawn_worker("w".into(), catalog, theirs).unwrap();

        let Some(PortEvent::Control { packet, .. }) = inbox.recv().await else {
            panic!("expected ready");
        };
        assert_eq!(packet.message, Message::Ready {});

        ours.post_message(Message::Init(InitParams {
            field: serde_json::to_value(field.transferable()).unwrap(),
            proc: "w".into(),
            port_names: vec![],
            config: field.config_for("w"),
        }))
        .unwrap();
        let Some(PortEvent::Control { packet, .. }) = inbox.recv().await else {
            panic!("expected initComplete");
        };
        assert_eq!(packet.message, Message::InitComplete {});

        let value = orchestrator.call(Route::new(ORCHESTRATOR, "Ping"), "ping", vec![]).await.unwrap();
        assert_eq!(value, json!("pong"));

        ours.post_message(Message::Kill {}).unwrap();
        tokio::task::spawn_blocking(move || worker.join()).await.unwrap().unwrap();
    }
}
