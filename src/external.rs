use std::sync::Arc;

use async_trait::async_trait;
use grow_wire::{Envelope, Message};
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, info_span};

use crate::bridge::{BridgeHandler, BridgeServer};
use crate::config::BootstrapEnv;
use crate::error::{GrowError, Result};
use crate::field::ValidField;
use crate::host::PlantHost;
use crate::plant::Catalog;
use crate::router::Router;

/// Entry point of an external proc binary: reads `FIELD` and `PROC_NAME`
/// from the environment and serves until killed.
pub async fn serve_external(catalog: Catalog) -> Result<()> {
    let env = BootstrapEnv::from_env()?;
    serve(env, catalog).await
}

/// Serves the plants of `env.proc_name` on the proc's own bridge url.
///
/// Everything the orchestrator wants from this proc (init, calls, sends,
/// kill) arrives over the bridge. Plants living elsewhere are reached
/// through the orchestrator on the `main` url.
pub async fn serve(env: BootstrapEnv, catalog: Catalog) -> Result<()> {
    let BootstrapEnv { field, proc_name } = env;
    let span = info_span!("proc", name = %proc_name);
    async move {
        let url = field
            .url_of(&proc_name)
            .ok_or_else(|| GrowError::Config(format!("proc `{proc_name}` has no url")))?
            .to_string();
        let main_url = field
            .main_url()
            .ok_or_else(|| GrowError::Config("field has no main proc".into()))?
            .to_string();

        let router = Router::new(&proc_name, field.clone());
        let handler = Arc::new(ExternalProc {
            router: router.clone(),
            host: PlantHost::new(&proc_name, catalog),
            killed: Notify::new(),
        });
        let mut server = BridgeServer::bind(&url, &field.communication_secret, handler.clone()).await?;

        router
            .bridge()
            .control(&main_url, &proc_name, Message::Ready {})
            .await?;
        debug!("ready sent to the orchestrator");

        tokio::select! {
            _ = handler.killed.notified() => info!("killed"),
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }

        router.shutdown();
        server.close();
        Ok(())
    }
    .instrument(span)
    .await
}

struct ExternalProc {
    router: Router,
    host: PlantHost,
    killed: Notify,
}

#[async_trait]
impl BridgeHandler for ExternalProc {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Message>> {
        match envelope.message {
            Message::Init(params) => {
                let field: ValidField = serde_json::from_value(params.field)?;
                self.router.set_field(field.clone());
                let reply = match self.host.load(&self.router, &field, &params.config).await {
                    Ok(_) => Message::InitComplete {},
                    Err(e) => {
                        error!(proc = %self.host.proc(), "init failed: {e}");
                        Message::InitFailure(e.to_remote())
                    }
                };
                Ok(Some(reply))
            }
            Message::Reinit(params) => {
                let field: ValidField = serde_json::from_value(params.field)?;
                self.router.set_field(field);
                Ok(None)
            }
            Message::Call(call) => Ok(Some(Message::CallResult(self.router.handle_call(call).await))),
            Message::Send(send) => Ok(self.router.handle_send(send).map(Message::SendAck)),
            Message::SendAck(ack) => {
                self.router.queues().on_ack(&ack);
                Ok(None)
            }
            Message::Kill {} => {
                self.killed.notify_one();
                Ok(None)
            }
            other => Err(GrowError::BadRequest(format!(
                "`{}` is not accepted by an external proc",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeClient;
    use crate::config::RuntimeConfig;
    use crate::field::{Field, PlantDef, ProcDef};
    use crate::plant::{CallContext, Plant};
    use grow_wire::{Call, InitParams};
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Greeter;

    #[async_trait]
    impl Plant for Greeter {
        async fn call(&self, ctx: CallContext, _method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(json!(format!("hello {} from {}", args[0].as_str().unwrap_or("?"), ctx.caller())))
        }
    }

    async fn greeter_proc() -> (ValidField, String, Arc<ExternalProc>, BridgeServer) {
        let field = Field::new()
            .plant("Greeter", PlantDef::in_proc("ext"))
            .proc("ext", ProcDef::external(["unused"]))
            .validate(&RuntimeConfig::default())
            .unwrap();
        let url = field.url_of("ext").unwrap().to_string();
        let handler = Arc::new(ExternalProc {
            router: Router::new("ext", field.clone()),
            host: PlantHost::new("ext", Catalog::new().register_plant::<Greeter>("Greeter")),
            killed: Notify::new(),
        });
        let server = BridgeServer::bind(&url, &field.communication_secret, handler.clone())
            .await
            .unwrap();
        (field, url, handler, server)
    }

    fn init_params(field: &ValidField) -> InitParams {
        InitParams {
            field: serde_json::to_value(field.transferable()).unwrap(),
            proc: "ext".into(),
            port_names: vec![],
            config: field.config_for("ext"),
        }
    }

    #[tokio::test]
    async fn init_then_calls_over_http() {
        let (field, url, handler, _server) = greeter_proc().await;
        let client = BridgeClient::new(&field.communication_secret);
        client.init("ext", &url, init_params(&field)).await.unwrap();

        let result = client
            .call("ext", &url, Call::new("Tester", "Greeter", "greet", vec![json!("bob")]))
            .await
            .unwrap();
        assert_eq!(result.into_result().unwrap(), json!("hello bob from Tester"));

        client
            .post("ext", &url, &Envelope::new(Message::Kill {}))
            .await
            .unwrap();
        handler.killed.notified().await;
    }

    #[tokio::test]
    async fn calls_before_init_wait_for_the_plants() {
        let (field, url, _handler, _server) = greeter_proc().await;
        let client = BridgeClient::new(&field.communication_secret);

        let early = tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            async move {
                client
                    .call("ext", &url, Call::new("Tester", "Greeter", "greet", vec![json!("eve")]))
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!early.is_finished());

        client.init("ext", &url, init_params(&field)).await.unwrap();
        let result = early.await.unwrap().unwrap();
        assert_eq!(result.into_result().unwrap(), json!("hello eve from Tester"));
    }
}
