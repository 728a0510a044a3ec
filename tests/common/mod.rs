#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use grow::config::RuntimeConfig;
use grow::{CallContext, Catalog, Plant, PlantProxy, QueueProxy, ServiceDescriptor, Wiring};
use serde_json::{Value, json};

pub fn config() -> RuntimeConfig {
    RuntimeConfig::default()
        .without_signals()
        .with_restart_backoff(Duration::from_millis(50))
}

/// Polls `check` until it holds or roughly two seconds have passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[derive(Default)]
pub struct Manager {
    access: Option<PlantProxy>,
}

#[async_trait]
impl Plant for Manager {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new().inject("access")
    }

    fn wire(&mut self, wiring: &Wiring<'_>) -> anyhow::Result<()> {
        self.access = Some(wiring.proxy("access")?);
        Ok(())
    }

    async fn call(&self, ctx: CallContext, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        let access = self.access.as_ref().ok_or_else(|| ctx.unknown_method())?;
        match method {
            "listItems" => Ok(access.call(&ctx, "getItems", vec![]).await?),
            "getSession" => Ok(access.call(&ctx, "session", vec![]).await?),
            "throwErr" => Err(anyhow::anyhow!("something went wrong")),
            _ => Err(ctx.unknown_method()),
        }
    }
}

#[derive(Default)]
pub struct Access;

#[async_trait]
impl Plant for Access {
    async fn call(&self, ctx: CallContext, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "getItems" => Ok(json!([{ "id": 1 }, { "id": 2 }])),
            "session" => Ok(json!(ctx.session_id())),
            "secret" => Ok(json!("hidden")),
            _ => Err(ctx.unknown_method()),
        }
    }
}

#[derive(Default)]
pub struct Publisher;

#[async_trait]
impl Plant for Publisher {
    async fn call(&self, ctx: CallContext, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "subscribe" => Ok(ctx.caller_proxy().call(&ctx, "whoami", vec![]).await?),
            _ => Err(ctx.unknown_method()),
        }
    }
}

#[derive(Default)]
pub struct Subscriber {
    publisher: Option<PlantProxy>,
}

#[async_trait]
impl Plant for Subscriber {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new().inject("publisher")
    }

    fn wire(&mut self, wiring: &Wiring<'_>) -> anyhow::Result<()> {
        self.publisher = Some(wiring.proxy("publisher")?);
        Ok(())
    }

    async fn call(&self, ctx: CallContext, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "goAndSubscribe" => {
                let publisher = self.publisher.as_ref().ok_or_else(|| ctx.unknown_method())?;
                Ok(publisher.call(&ctx, "subscribe", vec![]).await?)
            }
            "whoami" => Ok(json!("subscriber")),
            _ => Err(ctx.unknown_method()),
        }
    }
}

/// Remembers the last value sent after `foo`.
#[derive(Default)]
pub struct FooListener {
    foo: Mutex<Option<Value>>,
}

#[async_trait]
impl Plant for FooListener {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new().on(["foo"], "onFoo")
    }

    async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "onFoo" => {
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                *self.foo.lock().unwrap() = Some(value);
                Ok(Value::Null)
            }
            "whatIsFoo" => Ok(self.foo.lock().unwrap().clone().unwrap_or(Value::Null)),
            _ => Err(ctx.unknown_method()),
        }
    }
}

#[derive(Default)]
pub struct Hello {
    name: Option<QueueProxy>,
}

#[async_trait]
impl Plant for Hello {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new().queue("name")
    }

    fn wire(&mut self, wiring: &Wiring<'_>) -> anyhow::Result<()> {
        self.name = Some(wiring.queue("name")?);
        Ok(())
    }

    async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "sayHello" => {
                let who = args.first().and_then(Value::as_str).unwrap_or("nobody");
                Ok(json!(format!("hello {who}")))
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

pub struct Name {
    name: Mutex<String>,
}

impl Default for Name {
    fn default() -> Self {
        Self {
            name: Mutex::new("initial".to_string()),
        }
    }
}

#[async_trait]
impl Plant for Name {
    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new().on(["changeName"], "setName")
    }

    async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "setName" => {
                let name = args.get(1).and_then(Value::as_str).unwrap_or_default();
                *self.name.lock().unwrap() = name.to_string();
                Ok(Value::Null)
            }
            "whoami" => Ok(json!(self.name.lock().unwrap().clone())),
            _ => Err(ctx.unknown_method()),
        }
    }
}

#[derive(Default)]
pub struct Counter {
    count: AtomicU64,
}

#[async_trait]
impl Plant for Counter {
    async fn call(&self, ctx: CallContext, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "inc" => Ok(json!(self.count.fetch_add(1, Ordering::SeqCst) + 1)),
            "restart" => {
                ctx.request_restart();
                Ok(Value::Null)
            }
            "explode" => panic!("counter exploded"),
            _ => Err(ctx.unknown_method()),
        }
    }
}

pub fn catalog() -> Catalog {
    Catalog::new()
        .register_plant::<Manager>("Manager")
        .register_plant::<Access>("Access")
        .register_plant::<Publisher>("Publisher")
        .register_plant::<Subscriber>("Subscriber")
        .register_plant::<FooListener>("FooListener")
        .register_plant::<Hello>("Hello")
        .register_plant::<Name>("Name")
        .register_plant::<Counter>("Counter")
}
