use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Span;

use crate::config::lookup_path;
use crate::descriptor::ServiceDescriptor;
use crate::error::{GrowError, Result};
use crate::router::{PlantProxy, QueueProxy, Route, Router};

/// A service hosted by the runtime.
///
/// Plants are instantiated by a [`Catalog`] factory, receive their proxies
/// and config through [`Plant::wire`], get an optional [`Plant::init`] once
/// every dependency is initialized, and then serve calls.
#[async_trait]
pub trait Plant: Send + Sync + 'static {
    /// Wiring used when the plant is registered with
    /// [`Catalog::register_plant`].
    fn descriptor() -> ServiceDescriptor
    where
        Self: Sized,
    {
        ServiceDescriptor::default()
    }

    fn wire(&mut self, _wiring: &Wiring<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn init(&self, _ctx: CallContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn call(&self, ctx: CallContext, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

pub type PlantFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Plant>> + Send + Sync>;

#[derive(Clone)]
pub struct CatalogEntry {
    pub descriptor: ServiceDescriptor,
    factory: PlantFactory,
}

/// Maps plant names to their descriptor and a factory.
///
/// Every proc gets the same catalog; only the plants the field assigns to a
/// proc are instantiated there.
#[derive(Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("Catalog").field("plants", &names).finish()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: &str, descriptor: ServiceDescriptor, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Plant>> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            CatalogEntry {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn register_plant<P>(self, name: &str) -> Self
    where
        P: Plant + Default,
    {
        self.register(name, P::descriptor(), || Ok(Box::new(P::default())))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.entries.get(name).map(|entry| &entry.descriptor)
    }

    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Plant>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| GrowError::ImportFailed(name.to_string()))?;
        (entry.factory)().map_err(|e| GrowError::InstantiationFailed {
            plant: name.to_string(),
            reason: format!("{e:#}"),
        })
    }
}

/// Handed to [`Plant::wire`]: resolves the plant's declared injection
/// points and config bindings.
pub struct Wiring<'a> {
    pub(crate) plant: &'a str,
    pub(crate) descriptor: &'a ServiceDescriptor,
    pub(crate) config: &'a Value,
    pub(crate) router: &'a Router,
    pub(crate) span: Span,
}

impl Wiring<'_> {
    pub fn plant(&self) -> &str {
        self.plant
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn proxy(&self, field: &str) -> Result<PlantProxy> {
        let point = self.descriptor.injection(field).ok_or_else(|| self.undeclared(field))?;
        Ok(self.router.proxy(self.plant, &point.target))
    }

    pub fn queue(&self, field: &str) -> Result<QueueProxy> {
        let point = self.descriptor.queue_point(field).ok_or_else(|| self.undeclared(field))?;
        Ok(self.router.queue_proxy(self.plant, &point.target))
    }

    pub fn config_value(&self, field: &str) -> Result<Value> {
        let binding = self
            .descriptor
            .config_binding(field)
            .ok_or_else(|| self.undeclared(field))?;
        lookup_path(self.config, &binding.path)
            .cloned()
            .ok_or_else(|| GrowError::InitFailure {
                plant: self.plant.to_string(),
                reason: format!("Config not found for {}", binding.path),
            })
    }

    pub fn config<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        let value = self.config_value(field)?;
        serde_json::from_value(value).map_err(|e| GrowError::InitFailure {
            plant: self.plant.to_string(),
            reason: format!("config `{field}` has the wrong shape: {e}"),
        })
    }

    fn undeclared(&self, field: &str) -> GrowError {
        GrowError::InitFailure {
            plant: self.plant.to_string(),
            reason: format!("`{field}` is not declared in the descriptor"),
        }
    }
}

/// Per-call context: who is calling, on behalf of which session and request,
/// plus the span the call's logs belong to.
#[derive(Clone)]
pub struct CallContext {
    pub(crate) route: Route,
    pub(crate) method: String,
    pub(crate) span: Span,
    pub(crate) router: Router,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("caller", &self.route.caller)
            .field("receiver", &self.route.receiver)
            .field("method", &self.method)
            .field("session_id", &self.route.session_id)
            .field("request_id", &self.route.request_id)
            .finish()
    }
}

impl CallContext {
    pub fn caller(&self) -> &str {
        &self.route.caller
    }

    pub fn receiver(&self) -> &str {
        &self.route.receiver
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn session_id(&self) -> &str {
        &self.route.session_id
    }

    pub fn request_id(&self) -> &str {
        &self.route.request_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Proxy back to whoever made this call.
    pub fn caller_proxy(&self) -> PlantProxy {
        self.router.proxy(&self.route.receiver, &self.route.caller)
    }

    /// Asks the supervisor to restart the proc hosting this plant.
    pub fn request_restart(&self) {
        self.router.request_restart();
    }

    /// Error to return for methods the plant does not implement.
    pub fn unknown_method(&self) -> anyhow::Error {
        GrowError::MethodNotFound {
            plant: self.route.receiver.clone(),
            method: self.method.clone(),
        }
        .into()
    }
}
