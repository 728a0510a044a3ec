use std::collections::HashMap;
use std::sync::Arc;

use grow_wire::ORCHESTRATOR;
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span};

use crate::config::lookup_path;
use crate::error::{GrowError, Result};
use crate::field::ValidField;
use crate::plant::{CallContext, Catalog, Wiring};
use crate::resolver::DependencyResolver;
use crate::router::{HostedPlant, Hosting, Route, Router};

/// Loads the plants of one proc into its router.
pub struct PlantHost {
    proc: String,
    catalog: Catalog,
}

impl PlantHost {
    pub fn new(proc: &str, catalog: Catalog) -> Self {
        Self {
            proc: proc.to_string(),
            catalog,
        }
    }

    pub fn proc(&self) -> &str {
        &self.proc
    }

    /// Instantiates and wires every plant the field assigns to this proc,
    /// then runs init hooks in dependency order. Returns the load order.
    ///
    /// The graph spans the whole field so that ordering stays consistent
    /// across procs, and a cycle anywhere is fatal here too.
    pub async fn load(
        &self,
        router: &Router,
        field: &ValidField,
        config: &HashMap<String, Value>,
    ) -> Result<Vec<String>> {
        let loaded = self.load_plants(router, field, config).await;
        router.set_hosting(if loaded.is_ok() {
            Hosting::Hosted
        } else {
            Hosting::Failed
        });
        loaded
    }

    async fn load_plants(
        &self,
        router: &Router,
        field: &ValidField,
        config: &HashMap<String, Value>,
    ) -> Result<Vec<String>> {
        let order = DependencyResolver::for_field(field, &self.catalog).sort()?;
        let local: Vec<String> = order
            .into_iter()
            .filter(|plant| field.proc_of(plant) == Some(self.proc.as_str()))
            .collect();

        // 1) instantiate and wire
        let null = Value::Null;
        let mut loaded = Vec::with_capacity(local.len());
        for name in &local {
            let mut plant = self.catalog.instantiate(name)?;
            let descriptor = self
                .catalog
                .descriptor(name)
                .cloned()
                .unwrap_or_default();
            let plant_config = config.get(name).unwrap_or(&null);

            for binding in &descriptor.configs {
                if lookup_path(plant_config, &binding.path).is_none() {
                    return Err(GrowError::InitFailure {
                        plant: name.clone(),
                        reason: format!("Config not found for {}", binding.path),
                    });
                }
            }

            let span = info_span!("plant", name = %name, proc = %self.proc);
            let wiring = Wiring {
                plant: name,
                descriptor: &descriptor,
                config: plant_config,
                router,
                span: span.clone(),
            };
            plant.wire(&wiring).map_err(|e| GrowError::InitFailure {
                plant: name.clone(),
                reason: format!("{e:#}"),
            })?;
            span.in_scope(|| debug!("wired"));

            let plant: Arc<dyn crate::plant::Plant> = Arc::from(plant);
            router.host(
                name,
                HostedPlant {
                    plant: plant.clone(),
                    descriptor: descriptor.clone(),
                },
            );
            loaded.push((name.clone(), plant, descriptor.init, span));
        }

        // calls from other procs may reach these plants from here on
        router.set_hosting(Hosting::Hosted);

        // 2) init hooks, dependencies first
        for (name, plant, has_init, span) in loaded {
            if !has_init {
                continue;
            }
            let ctx = CallContext {
                route: Route::new(ORCHESTRATOR, name.clone()),
                method: "init".to_string(),
                span: span.clone(),
                router: router.clone(),
            };
            plant
                .init(ctx)
                .instrument(span.clone())
                .await
                .map_err(|e| GrowError::InitFailure {
                    plant: name.clone(),
                    reason: format!("{e:#}"),
                })?;
            span.in_scope(|| debug!("initialized"));
        }

        info!(proc = %self.proc, plants = ?local, "🌱 plants loaded");
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::descriptor::ServiceDescriptor;
    use crate::field::{Field, PlantDef};
    use crate::plant::Plant;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        journal: Journal,
        prefix: String,
    }

    #[async_trait]
    impl Plant for Recorder {
        fn wire(&mut self, wiring: &Wiring<'_>) -> anyhow::Result<()> {
            if wiring.plant() == "Manager" {
                wiring.proxy("access")?;
                self.prefix = wiring.config("prefix")?;
            }
            Ok(())
        }

        async fn init(&self, _ctx: CallContext) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(self.name.to_string());
            Ok(())
        }

        async fn call(&self, _ctx: CallContext, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(json!(self.prefix))
        }
    }

    fn catalog(journal: &Journal) -> Catalog {
        let j1 = journal.clone();
        let j2 = journal.clone();
        Catalog::new()
            .register(
                "Manager",
                ServiceDescriptor::new().inject("access").config("prefix").with_init(),
                move || {
                    Ok(Box::new(Recorder {
                        name: "Manager",
                        journal: j1.clone(),
                        prefix: String::new(),
                    }))
                },
            )
            .register("Access", ServiceDescriptor::new().with_init(), move || {
                Ok(Box::new(Recorder {
                    name: "Access",
                    journal: j2.clone(),
                    prefix: String::new(),
                }))
            })
    }

    fn field(manager_config: Value) -> ValidField {
        Field::new()
            .plant("Manager", PlantDef::in_proc("main").with_config(manager_config))
            .plant("Access", PlantDef::in_proc("main"))
            .validate(&RuntimeConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn init_runs_dependencies_first() {
        let journal = Journal::default();
        let field = field(json!({ "prefix": "pre" }));
        let router = Router::new("main", field.clone());
        let host = PlantHost::new("main", catalog(&journal));

        let order = host.load(&router, &field, &field.config_for("main")).await.unwrap();
        assert_eq!(order, vec!["Access", "Manager"]);
        assert_eq!(*journal.lock().unwrap(), vec!["Access", "Manager"]);
        assert!(router.hosts("Manager"));
        assert_eq!(router.hosting(), Hosting::Hosted);
    }

    #[tokio::test]
    async fn missing_config_path_fails_init() {
        let journal = Journal::default();
        let field = field(json!({}));
        let router = Router::new("main", field.clone());
        let host = PlantHost::new("main", catalog(&journal));

        let err = host.load(&router, &field, &field.config_for("main")).await.unwrap_err();
        assert_eq!(err.to_string(), "Manager: Config not found for prefix");
        assert_eq!(err.name(), "initFailure");
        assert_eq!(router.hosting(), Hosting::Failed);
    }

    #[tokio::test]
    async fn unregistered_plant_fails_import() {
        let field = field(json!({ "prefix": "p" }));
        let router = Router::new("main", field.clone());
        let host = PlantHost::new("main", Catalog::new());

        let err = host.load(&router, &field, &field.config_for("main")).await.unwrap_err();
        assert_eq!(err.name(), "importFailed");
    }

    #[tokio::test]
    async fn failing_factory_fails_instantiation() {
        let field = field(json!({ "prefix": "p" }));
        let router = Router::new("main", field.clone());
        let catalog = Catalog::new()
            .register("Access", ServiceDescriptor::new(), || Err(anyhow::anyhow!("no db")))
            .register("Manager", ServiceDescriptor::new(), || Err(anyhow::anyhow!("unused")));
        let host = PlantHost::new("main", catalog);

        let err = host.load(&router, &field, &field.config_for("main")).await.unwrap_err();
        assert_eq!(err.name(), "instantiationFailed");
        assert!(err.to_string().contains("no db"));
    }
}
