use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::field::{Field, ValidField};
use crate::plant::Catalog;
use crate::resolver::DependencyResolver;
use crate::router::{PlantHandle, QueueHandle};
use crate::supervisor::{ProcState, Supervisor};

/// Validates `field`, spawns every proc and returns once all plants are
/// initialized. Settings come from the environment.
pub async fn grow(field: Field, catalog: Catalog) -> Result<Grown> {
    grow_with(field, catalog, RuntimeConfig::from_env()).await
}

pub async fn grow_with(field: Field, catalog: Catalog, config: RuntimeConfig) -> Result<Grown> {
    let field = field.validate(&config)?;
    // a cycle anywhere fails before a single proc is spawned
    DependencyResolver::for_field(&field, &catalog).sort()?;
    info!(
        plants = field.plants.len(),
        procs = field.active_procs().len(),
        "🌱 growing field"
    );
    let supervisor = Supervisor::start(field, catalog, config).await?;
    Ok(Grown { supervisor })
}

/// A running field, as seen from the program that grew it.
///
/// Dropping it kills the field; [`Grown::kill`] additionally tells external
/// procs to stop before their processes are killed.
pub struct Grown {
    supervisor: Supervisor,
}

impl Grown {
    /// Handle to a plant, outside any session.
    pub fn plant(&self, name: &str) -> PlantHandle {
        self.plant_with_session(name, "")
    }

    pub fn plant_with_session(&self, name: &str, session_id: &str) -> PlantHandle {
        PlantHandle::new(self.supervisor.router().clone(), name, session_id)
    }

    /// Send-only handle: everything goes through the orchestrator's queue.
    pub fn queue(&self, name: &str, session_id: &str) -> QueueHandle {
        QueueHandle::new(self.plant_with_session(name, session_id))
    }

    pub fn field(&self) -> &ValidField {
        self.supervisor.field()
    }

    pub fn proc_state(&self, proc: &str) -> Option<ProcState> {
        self.supervisor.proc_state(proc)
    }

    /// Resolves once `proc` serves calls again, e.g. after a restart.
    pub async fn wait_serving(&self, proc: &str) -> Result<()> {
        self.supervisor.wait_serving(proc).await
    }

    pub async fn kill(&self) {
        self.supervisor.kill().await;
    }
}
