use async_trait::async_trait;
use clap::Parser;
use grow::config::RuntimeConfig;
use grow::external::serve_external;
use grow::logger::init_tracing;
use grow::{CallContext, Catalog, Plant, PlantProxy, QueueProxy, ServiceDescriptor, Wiring};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// External proc hosting the demo plants. Started by the orchestrator with
/// `FIELD` and `PROC_NAME` set.
#[derive(Parser, Debug)]
#[command(name = "grow-demo-proc", version = "0.1.0")]
struct Cli {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Default)]
struct ExternalOne {
    external_two: Option<PlantProxy>,
    hello: Option<PlantProxy>,
    name: Option<QueueProxy>,
}

#[async_trait]
impl Plant for ExternalOne {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new()
            .inject("externalTwo")
            .inject("hello")
            .queue("name")
    }

    fn wire(&mut self, wiring: &Wiring<'_>) -> anyhow::Result<()> {
        self.external_two = Some(wiring.proxy("externalTwo")?);
        self.hello = Some(wiring.proxy("hello")?);
        self.name = Some(wiring.queue("name")?);
        Ok(())
    }

    async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "returnOk" => Ok(json!("ok")),
            "callTwo" => {
                let two = self.external_two.as_ref().ok_or_else(|| ctx.unknown_method())?;
                Ok(two.call(&ctx, "returnOk", vec![]).await?)
            }
            "greetLocal" => {
                let hello = self.hello.as_ref().ok_or_else(|| ctx.unknown_method())?;
                Ok(hello.call(&ctx, "sayHello", args).await?)
            }
            "rename" => {
                let name = self.name.as_ref().ok_or_else(|| ctx.unknown_method())?;
                let mut message = vec![json!("changeName")];
                message.extend(args);
                name.send(&ctx, message)?;
                Ok(Value::Null)
            }
            _ => Err(ctx.unknown_method()),
        }
    }
}

#[derive(Default)]
struct ExternalTwo {
    remembered: Mutex<Value>,
}

#[async_trait]
impl Plant for ExternalTwo {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new().on(["remember"], "remember")
    }

    async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "remember" => {
                *self.remembered.lock().await = args.get(1).cloned().unwrap_or_default();
                Ok(Value::Null)
            }
            "recall" => Ok(self.remembered.lock().await.clone()),
            "returnOk" => Ok(json!("ok")),
            "whoami" => Ok(json!(ctx.receiver())),
            "pid" => Ok(json!(std::process::id())),
            "crash" => {
                warn!("crashing on request");
                std::process::exit(3);
            }
            _ => Err(ctx.unknown_method()),
        }
    }
}

fn catalog() -> Catalog {
    Catalog::new()
        .register_plant::<ExternalOne>("ExternalOne")
        .register_plant::<ExternalTwo>("ExternalTwo")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RuntimeConfig::from_env();
    if let Some(level) = cli.log_level {
        config.log.log_level = level;
    }
    init_tracing(&config.log)?;

    if let Err(e) = serve_external(catalog()).await {
        error!("external proc failed: {e}");
        return Err(e.into());
    }
    Ok(())
}
